//! Core types shared across fabric components

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Address every exposed port is bound to on the host side
pub const ANY_ADDRESS: &str = "0.0.0.0";

/// Unique identifier for a cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub String);

impl ClusterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random (v4) cluster identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a service within a cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(pub String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random (v4) service identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the controller reaches the hosts it manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressingMode {
    /// Controller sits on the private network; private addresses only
    Proxy,
    /// Controller is outside; hosts are reached on their public address
    Direct,
}

impl AddressingMode {
    pub fn from_proxy_flag(proxy: bool) -> Self {
        if proxy { Self::Proxy } else { Self::Direct }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self, Self::Proxy)
    }

    /// Resolve `(internal, external)` addresses for a host.
    pub fn resolve(&self, private_ip: &str, public_ip: &str) -> (String, String) {
        match self {
            Self::Proxy => (private_ip.to_string(), private_ip.to_string()),
            Self::Direct => (private_ip.to_string(), public_ip.to_string()),
        }
    }
}

impl std::fmt::Display for AddressingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressingMode::Proxy => write!(f, "proxy"),
            AddressingMode::Direct => write!(f, "direct"),
        }
    }
}

/// Host side of a port mapping, in docker inspect layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    #[serde(rename = "HostIp")]
    pub host_ip: String,
    #[serde(rename = "HostPort")]
    pub host_port: u16,
}

impl PortBinding {
    /// Bind `port` on all interfaces
    pub fn any(port: u16) -> Self {
        Self {
            host_ip: ANY_ADDRESS.to_string(),
            host_port: port,
        }
    }
}

/// Everything needed to (re)launch a container on a host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchParams {
    pub image: String,
    pub service_type: String,
    /// Container directory → host directory mapping for key material
    pub keydir: BTreeMap<String, String>,
    pub keyname: String,
    pub privatekey: PathBuf,
    /// Host path → container path
    pub volumes: BTreeMap<String, String>,
    pub hostname: String,
    pub open_ports: Vec<u16>,
    pub args: Vec<String>,
}

/// One deployed unit: a VM plus the container running inside it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Runtime container id. Unknown until inspected or recovered from the host.
    pub container: Option<String>,
    pub image: String,
    pub service_type: String,
    pub host_name: String,
    pub ports: BTreeMap<u16, PortBinding>,
    pub volumes: BTreeMap<String, String>,
    pub args: Vec<String>,
    pub keydir: BTreeMap<String, String>,
    pub keyname: String,
    pub privatekey: PathBuf,
    pub internal_ip: Option<String>,
    pub external_ip: Option<String>,
    pub default_user: String,
    pub name: Option<String>,
}

impl Container {
    /// Apply the addressing rule for `mode`.
    pub fn set_addresses(&mut self, mode: AddressingMode, private_ip: &str, public_ip: &str) {
        let (internal, external) = mode.resolve(private_ip, public_ip);
        self.internal_ip = Some(internal);
        self.external_ip = Some(external);
    }

    pub fn is_addressed(&self) -> bool {
        self.internal_ip.is_some() && self.external_ip.is_some()
    }

    /// Launch parameters this container was started with
    pub fn launch_params(&self) -> LaunchParams {
        let mut open_ports: Vec<u16> = self.ports.keys().copied().collect();
        open_ports.sort_unstable();

        LaunchParams {
            image: self.image.clone(),
            service_type: self.service_type.clone(),
            keydir: self.keydir.clone(),
            keyname: self.keyname.clone(),
            privatekey: self.privatekey.clone(),
            volumes: self.volumes.clone(),
            hostname: self.host_name.clone(),
            open_ports,
            args: self.args.clone(),
        }
    }
}

/// Caller-supplied description of a container to launch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    #[serde(rename = "type")]
    pub service_type: String,
    pub image: String,
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,
    #[serde(default)]
    pub keydir: BTreeMap<String, String>,
    pub keyname: String,
    pub privatekey: PathBuf,
    #[serde(default)]
    pub exposed: Vec<u16>,
    pub hostname: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Entry command; the fabric default when unset
    #[serde(default)]
    pub default_cmd: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub volume_user: Option<String>,
}

impl ContainerSpec {
    pub fn new(
        service_type: impl Into<String>,
        image: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            service_type: service_type.into(),
            image: image.into(),
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    /// Set key material
    pub fn with_keys(
        mut self,
        keyname: impl Into<String>,
        privatekey: impl Into<PathBuf>,
    ) -> Self {
        self.keyname = keyname.into();
        self.privatekey = privatekey.into();
        self
    }

    /// Map a key directory into the container
    pub fn with_keydir(mut self, container_dir: impl Into<String>, host_dir: impl Into<String>) -> Self {
        self.keydir.insert(container_dir.into(), host_dir.into());
        self
    }

    /// Add a volume mapping
    pub fn with_volume(mut self, host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        self.volumes.insert(host_path.into(), container_path.into());
        self
    }

    /// Expose a port
    pub fn with_port(mut self, port: u16) -> Self {
        self.exposed.push(port);
        self
    }

    /// Append a container argument
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Override the container entry command
    pub fn with_default_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.default_cmd = Some(cmd.into());
        self
    }

    /// Set display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the user owning the volume mounts
    pub fn with_volume_user(mut self, user: impl Into<String>) -> Self {
        self.volume_user = Some(user.into());
        self
    }

    /// Local path of the container's key, i.e. `<first keydir host dir>/<keyname>`
    pub fn key_source(&self) -> Option<PathBuf> {
        self.keydir
            .values()
            .next()
            .map(|dir| PathBuf::from(dir).join(&self.keyname))
    }

    pub fn launch_params(&self) -> LaunchParams {
        LaunchParams {
            image: self.image.clone(),
            service_type: self.service_type.clone(),
            keydir: self.keydir.clone(),
            keyname: self.keyname.clone(),
            privatekey: self.privatekey.clone(),
            volumes: self.volumes.clone(),
            hostname: self.hostname.clone(),
            open_ports: self.exposed.clone(),
            args: self.args.clone(),
        }
    }
}

/// Volume ownership metadata for a started container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub user: String,
    pub volumes: Vec<(String, String)>,
}

/// A VM provisioned by a launcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedHost {
    /// Backend instance id
    pub instance_id: String,
    pub hostname: String,
    pub private_ip: String,
    pub public_ip: Option<String>,
    pub launched_at: Option<DateTime<Utc>>,
}

impl AllocatedHost {
    /// Address the controller should use to reach this host
    pub fn reachable_address(&self, mode: AddressingMode) -> Option<&str> {
        match mode {
            AddressingMode::Proxy => Some(self.private_ip.as_str()),
            AddressingMode::Direct => self.public_ip.as_deref(),
        }
    }
}

/// VM-level resources backing one cluster/service pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackAllocation {
    pub cluster: ClusterId,
    pub service: ServiceId,
    pub hosts: Vec<AllocatedHost>,
}
