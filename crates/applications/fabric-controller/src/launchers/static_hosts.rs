//! Fixed pool of pre-provisioned hosts
//!
//! For on-premise machines or VMs managed outside the fabric. Allocation hands
//! out hosts from the pool, deletion returns them. The machines themselves are
//! never powered off, so stopping a stack is a no-op.

use crate::config::FabricConfig;
use async_trait::async_trait;
use fabric_core::{
    AddressingMode, AllocatedHost, ClusterId, ContainerSpec, FabricError, Launcher, Result,
    ServiceId, StackAllocation,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub const NAMESPACE: &str = "fabric.launchers.static";
pub const TYPE_NAME: &str = "StaticLauncher";

/// One machine in the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticHost {
    pub private_ip: String,
    #[serde(default)]
    pub public_ip: Option<String>,
}

impl StaticHost {
    pub fn new(private_ip: impl Into<String>, public_ip: Option<&str>) -> Self {
        Self {
            private_ip: private_ip.into(),
            public_ip: public_ip.map(str::to_string),
        }
    }
}

/// `static_hosts` configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticHostsConfig {
    pub ssh_key: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    pub hosts: Vec<StaticHost>,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

#[derive(Default)]
struct Pool {
    free: VecDeque<StaticHost>,
    stacks: HashMap<(ClusterId, ServiceId), Vec<(StaticHost, AllocatedHost)>>,
}

/// Launcher over a fixed host pool
pub struct StaticLauncher {
    ssh_key: String,
    ssh_user: String,
    mode: AddressingMode,
    pool: Mutex<Pool>,
}

impl StaticLauncher {
    pub fn new(config: StaticHostsConfig, mode: AddressingMode) -> Self {
        Self {
            ssh_key: config.ssh_key,
            ssh_user: config.ssh_user,
            mode,
            pool: Mutex::new(Pool {
                free: config.hosts.into(),
                stacks: HashMap::new(),
            }),
        }
    }

    /// Registry factory; declines without a `static_hosts` section
    pub fn factory(config: &FabricConfig) -> Option<Arc<dyn Launcher>> {
        let Some(section) = config.static_hosts.clone() else {
            warn!("static_hosts section missing from configuration");
            return None;
        };
        Some(Arc::new(Self::new(section, config.addressing_mode())))
    }

    /// Hosts not assigned to any stack
    pub fn free_hosts(&self) -> usize {
        self.lock().map(|pool| pool.free.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Pool>> {
        self.pool
            .lock()
            .map_err(|_| FabricError::provider("static host pool lock poisoned"))
    }

    /// Direct addressing needs a public address
    fn usable(host: &StaticHost, mode: AddressingMode) -> bool {
        mode.is_proxy() || host.public_ip.is_some()
    }
}

#[async_trait]
impl Launcher for StaticLauncher {
    fn ssh_key(&self) -> &str {
        &self.ssh_key
    }

    fn ssh_user(&self) -> &str {
        &self.ssh_user
    }

    async fn alloc(
        &self,
        cluster: &ClusterId,
        service: &ServiceId,
        specs: &[ContainerSpec],
        ctype: &str,
        mode: AddressingMode,
    ) -> Result<StackAllocation> {
        let mut pool = self.lock()?;

        let available = pool.free.iter().filter(|h| Self::usable(h, mode)).count();
        if available < specs.len() {
            return Err(FabricError::provider(format!(
                "static pool has {} usable hosts, {} requested",
                available,
                specs.len()
            )));
        }

        let mut hosts = Vec::with_capacity(specs.len());
        for spec in specs {
            let index = pool
                .free
                .iter()
                .position(|h| Self::usable(h, mode))
                .ok_or_else(|| FabricError::provider("static pool exhausted"))?;
            let Some(host) = pool.free.remove(index) else {
                continue;
            };

            let allocated = AllocatedHost {
                instance_id: format!("static-{}", host.private_ip),
                hostname: spec.hostname.clone(),
                private_ip: host.private_ip.clone(),
                public_ip: host.public_ip.clone(),
                launched_at: None,
            };
            hosts.push((host, allocated));
        }

        info!(
            cluster = %cluster,
            service = %service,
            ctype = %ctype,
            mode = %mode,
            count = hosts.len(),
            "Assigned static hosts"
        );

        let allocation = StackAllocation {
            cluster: cluster.clone(),
            service: service.clone(),
            hosts: hosts.iter().map(|(_, a)| a.clone()).collect(),
        };

        pool.stacks
            .entry((cluster.clone(), service.clone()))
            .or_default()
            .extend(hosts);

        Ok(allocation)
    }

    async fn restart_stack(&self, cluster: &ClusterId, service: &ServiceId) -> Result<Vec<String>> {
        let pool = self.lock()?;
        let stack = pool
            .stacks
            .get(&(cluster.clone(), service.clone()))
            .ok_or_else(|| FabricError::InstanceNotFound(format!("{}/{}", cluster, service)))?;

        Ok(stack
            .iter()
            .filter_map(|(_, a)| a.reachable_address(self.mode).map(str::to_string))
            .collect())
    }

    async fn stop_stack(&self, cluster: &ClusterId, service: &ServiceId) -> Result<()> {
        let pool = self.lock()?;
        if !pool.stacks.contains_key(&(cluster.clone(), service.clone())) {
            return Err(FabricError::InstanceNotFound(format!("{}/{}", cluster, service)));
        }
        debug!(cluster = %cluster, service = %service, "Static hosts stay powered on");
        Ok(())
    }

    async fn delete_stack(&self, cluster: &ClusterId, service: &ServiceId) -> Result<()> {
        let mut pool = self.lock()?;
        match pool.stacks.remove(&(cluster.clone(), service.clone())) {
            Some(hosts) => {
                info!(cluster = %cluster, service = %service, count = hosts.len(), "Released static hosts");
                pool.free.extend(hosts.into_iter().map(|(host, _)| host));
            }
            None => debug!(cluster = %cluster, service = %service, "No static hosts to release"),
        }
        Ok(())
    }
}
