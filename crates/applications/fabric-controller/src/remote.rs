//! Remote execution over SSH
//!
//! Runs commands and recursive copies against a single host with key-based
//! authentication. Freshly allocated VMs are often not reachable yet (still
//! booting, security group not applied), so the executor classifies the error
//! stream of every attempt and retries the transient cases:
//!
//! - `connection closed`
//! - `timed out`
//! - `permission denied`
//!
//! Matching is case-insensitive anywhere in the error text. Any other error
//! text ends the loop and is handed back to the caller in the output.
//!
//! The default policy retries forever. Set [`RetryPolicy::max_attempts`] or
//! cancel the executor's token to bound it. Cancelling aborts the operations
//! in flight at that moment; operations started afterwards run under a fresh
//! token.

use crate::config::RemoteConfig;
use async_trait::async_trait;
use fabric_core::{FabricError, Result};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Wait between attempts when a transient failure is seen
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Options shared by every ssh/scp invocation
const HOST_KEY_OPTS: [&str; 4] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
];

/// Captured result of one remote invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status of the local ssh/scp process (`None` if killed by a signal)
    pub status: Option<i32>,
}

impl CommandOutput {
    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Connectivity failures expected to resolve on their own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientFailure {
    ConnectionClosed,
    TimedOut,
    PermissionDenied,
}

impl TransientFailure {
    const ALL: [TransientFailure; 3] = [
        TransientFailure::ConnectionClosed,
        TransientFailure::TimedOut,
        TransientFailure::PermissionDenied,
    ];

    /// Lowercase text looked for in the error stream
    pub fn pattern(&self) -> &'static str {
        match self {
            TransientFailure::ConnectionClosed => "connection closed",
            TransientFailure::TimedOut => "timed out",
            TransientFailure::PermissionDenied => "permission denied",
        }
    }
}

impl std::fmt::Display for TransientFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.pattern())
    }
}

/// Retry behaviour for transient failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between attempts
    pub interval: Duration,

    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,

    /// Treat "permission denied" as transient.
    ///
    /// On by default to match existing deployments, where keys are installed
    /// by cloud-init after sshd is already accepting connections. A real
    /// authorization problem never clears, so bounded policies should usually
    /// turn this off.
    pub retry_permission_denied: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            max_attempts: None,
            retry_permission_denied: true,
        }
    }
}

impl RetryPolicy {
    /// Stop after `max_attempts` attempts
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Default::default()
        }
    }

    /// Set the pause between attempts
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Enable or disable retrying on "permission denied"
    pub fn with_permission_denied_retry(mut self, retry: bool) -> Self {
        self.retry_permission_denied = retry;
        self
    }

    /// Classify an error stream; `None` means the result is final.
    pub fn classify(&self, stderr: &str) -> Option<TransientFailure> {
        let text = stderr.to_lowercase();
        TransientFailure::ALL.into_iter().find(|failure| {
            if *failure == TransientFailure::PermissionDenied && !self.retry_permission_denied {
                return false;
            }
            text.contains(failure.pattern())
        })
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Who to connect to, and with which identity
#[derive(Debug, Clone, Copy)]
pub struct SshTarget<'a> {
    pub key: &'a Path,
    pub host: &'a str,
    pub user: &'a str,
}

impl<'a> SshTarget<'a> {
    pub fn new(key: &'a Path, host: &'a str, user: &'a str) -> Self {
        Self { key, host, user }
    }

    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// One attempt of a remote operation, without retries
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run `command` in a remote session
    async fn exec(&self, target: &SshTarget<'_>, command: &str) -> Result<CommandOutput>;

    /// Recursively copy a local path to `to` on the remote host
    async fn copy(&self, target: &SshTarget<'_>, from: &Path, to: &str) -> Result<CommandOutput>;
}

/// Transport backed by the system `ssh` and `scp` binaries
#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh_program: String,
    scp_program: String,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new("ssh", "scp")
    }
}

impl SshTransport {
    pub fn new(ssh_program: impl Into<String>, scp_program: impl Into<String>) -> Self {
        Self {
            ssh_program: ssh_program.into(),
            scp_program: scp_program.into(),
        }
    }

    /// `ssh <opts> -i <key> -t -t user@host <command>`
    pub fn ssh_args(target: &SshTarget<'_>, command: &str) -> Vec<String> {
        let mut args: Vec<String> = HOST_KEY_OPTS.iter().map(|s| s.to_string()).collect();
        args.push("-i".to_string());
        args.push(target.key.display().to_string());
        args.push("-t".to_string());
        args.push("-t".to_string());
        args.push(target.user_at_host());
        args.push(command.to_string());
        args
    }

    /// `scp <opts> -i <key> -r <from> user@host:<to>`
    pub fn scp_args(target: &SshTarget<'_>, from: &Path, to: &str) -> Vec<String> {
        let mut args: Vec<String> = HOST_KEY_OPTS.iter().map(|s| s.to_string()).collect();
        args.push("-i".to_string());
        args.push(target.key.display().to_string());
        args.push("-r".to_string());
        args.push(from.display().to_string());
        args.push(format!("{}:{}", target.user_at_host(), to));
        args
    }

    async fn run_program(program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!(program = %program, args = ?args, "Spawning remote session");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            status: output.status.code(),
        })
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, target: &SshTarget<'_>, command: &str) -> Result<CommandOutput> {
        Self::run_program(&self.ssh_program, &Self::ssh_args(target, command)).await
    }

    async fn copy(&self, target: &SshTarget<'_>, from: &Path, to: &str) -> Result<CommandOutput> {
        Self::run_program(&self.scp_program, &Self::scp_args(target, from, to)).await
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation<'a> {
    Exec { command: &'a str },
    Copy { from: &'a Path, to: &'a str },
}

impl Operation<'_> {
    fn label(&self) -> &'static str {
        match self {
            Operation::Exec { .. } => "ssh",
            Operation::Copy { .. } => "copy",
        }
    }
}

/// Remote executor with transient-failure retries
#[derive(Clone)]
pub struct RemoteExecutor {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    /// Token shared by clones; replaced once cancelled
    cancel: Arc<Mutex<CancellationToken>>,
}

impl RemoteExecutor {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// SSH-backed executor configured from the `remote` section
    pub fn from_config(config: &RemoteConfig) -> Self {
        let transport = SshTransport::new(&config.ssh_program, &config.scp_program);
        Self::new(Arc::new(transport), config.retry_policy())
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Arc::new(Mutex::new(token));
        self
    }

    /// Token covering the operations running now.
    ///
    /// After it is cancelled the next operation arms a fresh token, so fetch
    /// it again to cancel later work.
    pub fn cancellation_token(&self) -> CancellationToken {
        let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_cancelled() {
            *slot = CancellationToken::new();
        }
        slot.clone()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `command` on `host` as `user`, authenticating with `key`.
    pub async fn run(&self, key: &Path, host: &str, command: &str, user: &str) -> Result<CommandOutput> {
        let target = SshTarget::new(key, host, user);
        self.with_retry(&target, Operation::Exec { command }).await
    }

    /// Recursively copy `from` to `to` on `host`.
    pub async fn copy(
        &self,
        key: &Path,
        host: &str,
        from: &Path,
        to: &str,
        user: &str,
    ) -> Result<CommandOutput> {
        let target = SshTarget::new(key, host, user);
        self.with_retry(&target, Operation::Copy { from, to }).await
    }

    async fn with_retry(&self, target: &SshTarget<'_>, op: Operation<'_>) -> Result<CommandOutput> {
        let cancel = self.cancellation_token();
        let mut attempts = 0u32;

        loop {
            attempts = attempts.saturating_add(1);

            let output = match op {
                Operation::Exec { command } => self.transport.exec(target, command).await?,
                Operation::Copy { from, to } => self.transport.copy(target, from, to).await?,
            };

            let Some(failure) = self.policy.classify(&output.stderr) else {
                return Ok(output);
            };

            if self.policy.exhausted(attempts) {
                return Err(FabricError::RetriesExhausted {
                    host: target.host.to_string(),
                    attempts,
                    reason: failure.to_string(),
                });
            }

            warn!(
                host = %target.host,
                op = op.label(),
                attempt = attempts,
                reason = %failure,
                "Remote error, trying again"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(FabricError::Cancelled(target.host.to_string()));
                }
                _ = tokio::time::sleep(self.policy.interval) => {}
            }
        }
    }
}
