//! Tracing setup for processes embedding the controller.

use crate::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Prefix of rotated log files
const LOG_FILE_PREFIX: &str = "fabric.log";

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `config.filter`. When a log directory is configured the
/// returned guard must be held for as long as file output is wanted.
pub fn init_tracing(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter.as_str()));

    match &config.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .try_init();

            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init();

            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_with_directory_returns_guard() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            filter: "debug".to_string(),
            directory: Some(dir.path().to_path_buf()),
        };

        let guard = init_tracing(&config);
        assert!(guard.is_some());

        // A second install is a no-op rather than a panic
        assert!(init_tracing(&LoggingConfig::default()).is_none());
    }
}
