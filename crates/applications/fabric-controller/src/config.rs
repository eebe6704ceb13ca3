//! Controller configuration
//!
//! Read once at construction from a YAML document:
//!
//! ```yaml
//! system:
//!   mode: fabric.launchers.aws/Ec2Launcher
//!   network: eth0
//!   proxy: false
//! remote:
//!   retry_interval_secs: 3
//! aws:
//!   region: us-east-1
//!   ami_id: ami-0123456789
//!   key_name: fabric-admin
//! ```

use crate::launchers::ec2::Ec2LauncherConfig;
use crate::launchers::static_hosts::StaticHostsConfig;
use crate::remote::RetryPolicy;
use fabric_core::{AddressingMode, FabricError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default directory holding administrative keys on the controller host
pub const DEFAULT_KEY_ROOT: &str = "/ferry/keys";

/// Default log filter directive
pub const DEFAULT_LOG_FILTER: &str = "fabric_controller=info,info";

/// Top-level configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    pub system: SystemConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Settings for `Ec2Launcher`
    #[serde(default)]
    pub aws: Option<Ec2LauncherConfig>,

    /// Settings for `StaticLauncher`
    #[serde(default)]
    pub static_hosts: Option<StaticHostsConfig>,
}

/// `system` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Launcher identifier, `<namespace>/<type-name>`
    pub mode: String,

    /// Data-plane network interface on the hosts
    #[serde(default = "default_network")]
    pub network: String,

    /// Controller shares the private network with the cluster
    #[serde(default)]
    pub proxy: bool,
}

fn default_network() -> String {
    "eth0".to_string()
}

/// `remote` section: SSH transport and retry behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_key_root")]
    pub key_root: PathBuf,

    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Unset means retry transient failures forever
    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default = "default_true")]
    pub retry_permission_denied: bool,

    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,

    #[serde(default = "default_scp_program")]
    pub scp_program: String,
}

fn default_key_root() -> PathBuf {
    PathBuf::from(DEFAULT_KEY_ROOT)
}

fn default_retry_interval_secs() -> u64 {
    3
}

fn default_true() -> bool {
    true
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_scp_program() -> String {
    "scp".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            key_root: default_key_root(),
            retry_interval_secs: default_retry_interval_secs(),
            max_attempts: None,
            retry_permission_denied: true,
            ssh_program: default_ssh_program(),
            scp_program: default_scp_program(),
        }
    }
}

impl RemoteConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_secs(self.retry_interval_secs),
            max_attempts: self.max_attempts,
            retry_permission_denied: self.retry_permission_denied,
        }
    }
}

/// `logging` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Also write daily-rotated log files here
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            directory: None,
        }
    }
}

impl FabricConfig {
    /// Minimal configuration for a launcher identifier
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            system: SystemConfig {
                mode: mode.into(),
                network: default_network(),
                proxy: false,
            },
            remote: RemoteConfig::default(),
            logging: LoggingConfig::default(),
            aws: None,
            static_hosts: None,
        }
    }

    /// Switch proxy addressing on or off
    pub fn with_proxy(mut self, proxy: bool) -> Self {
        self.system.proxy = proxy;
        self
    }

    /// Attach `Ec2Launcher` settings
    pub fn with_aws(mut self, aws: Ec2LauncherConfig) -> Self {
        self.aws = Some(aws);
        self
    }

    /// Attach `StaticLauncher` settings
    pub fn with_static_hosts(mut self, hosts: StaticHostsConfig) -> Self {
        self.static_hosts = Some(hosts);
        self
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: FabricConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FabricError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML configuration file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            FabricError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.system.mode.trim().is_empty() {
            return Err(FabricError::config("system.mode must name a launcher"));
        }
        if self.system.network.trim().is_empty() {
            return Err(FabricError::config("system.network must not be empty"));
        }
        Ok(())
    }

    pub fn addressing_mode(&self) -> AddressingMode {
        AddressingMode::from_proxy_flag(self.system.proxy)
    }

    /// Path of the administrative key named `ssh_key`
    pub fn admin_key_path(&self, ssh_key: &str) -> PathBuf {
        self.remote.key_root.join(format!("{}.pem", ssh_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_minimal_document_fills_defaults() {
        let config = FabricConfig::from_yaml_str(
            "system:\n  mode: fabric.launchers.static/StaticLauncher\n",
        )
        .unwrap();

        assert_eq!(config.system.network, "eth0");
        assert!(!config.system.proxy);
        assert_eq!(config.remote.retry_interval_secs, 3);
        assert_eq!(config.remote.max_attempts, None);
        assert!(config.remote.retry_permission_denied);
        assert_eq!(config.logging.filter, DEFAULT_LOG_FILTER);
        assert_eq!(config.addressing_mode(), AddressingMode::Direct);
    }

    #[test]
    fn test_full_system_section() {
        let yaml = r#"
system:
  mode: fabric.launchers.aws/Ec2Launcher
  network: eth1
  proxy: true
remote:
  key_root: /etc/fabric/keys
  retry_interval_secs: 1
  max_attempts: 20
  retry_permission_denied: false
"#;
        let config = FabricConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.system.network, "eth1");
        assert_eq!(config.addressing_mode(), AddressingMode::Proxy);

        let policy = config.remote.retry_policy();
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert_eq!(policy.max_attempts, Some(20));
        assert!(!policy.retry_permission_denied);
    }

    #[test]
    fn test_admin_key_path_convention() {
        let config = FabricConfig::new("fabric.launchers.aws/Ec2Launcher");
        assert_eq!(
            config.admin_key_path("hpcloud-admin"),
            PathBuf::from("/ferry/keys/hpcloud-admin.pem")
        );
    }

    #[test]
    fn test_empty_mode_is_rejected() {
        let err = FabricConfig::from_yaml_str("system:\n  mode: \"\"\n").unwrap_err();
        assert!(matches!(err, FabricError::Config(_)));
    }

    #[test]
    fn test_missing_system_section_is_rejected() {
        assert!(FabricConfig::from_yaml_str("remote: {}\n").is_err());
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "system:\n  mode: a/B\n  proxy: true").unwrap();

        let config = FabricConfig::from_path(file.path()).unwrap();
        assert_eq!(config.system.mode, "a/B");
        assert!(config.system.proxy);

        assert!(FabricConfig::from_path("/nonexistent/fabric.yaml").is_err());
    }
}
