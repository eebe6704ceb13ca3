//! Fabric controller
//!
//! Drives a cluster of VM/container pairs through its lifecycle. VM-level work
//! goes to the [`Launcher`], per-host work to the [`RemoteExecutor`] and
//! container starts to the [`ContainerRuntime`]. All per-host work is issued
//! one container at a time, in caller order.

use crate::config::{DEFAULT_KEY_ROOT, FabricConfig, RemoteConfig};
use crate::inspector::Inspector;
use crate::registry::LauncherRegistry;
use crate::remote::{CommandOutput, RemoteExecutor};
use crate::runtime::{ContainerRuntime, DockerCli, RunRequest, StartRequest};
use fabric_core::{
    AddressingMode, ClusterId, Container, ContainerSpec, FabricError, Launcher, Result, ServiceId,
    StackAllocation, VolumeMount,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Entry command of every fabric container image
pub const DEFAULT_CONTAINER_CMD: &str = "/service/sbin/startnode init";

/// Stops the service stack inside a container
pub const HALT_CONTAINER_CMD: &str = "/service/sbin/startnode halt";

/// Starts the host agent
pub const AGENT_START_CMD: &str = "ferry server";

/// Stops the host agent
pub const AGENT_QUIT_CMD: &str = "ferry quit";

/// Prints the id of the container a host runs
pub const CONTAINER_PID_CMD: &str = "cat /service/sconf/container.pid";

/// Where per-container keys are mounted inside the container
pub const CONTAINER_KEY_DIR: &str = "/service/keys";

/// Where per-container keys live on the host
pub const HOST_KEY_DIR: &str = "/ferry/keys";

const FABRIC_VERSION: &str = "0.1";
const FABRIC_FS_TYPE: &str = "xfs";

/// Outcome of a per-host operation
#[derive(Debug)]
pub struct HostResult<T> {
    pub host: String,
    pub result: Result<T>,
}

impl<T> HostResult<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Cluster lifecycle controller
pub struct FabricController {
    launcher: Arc<dyn Launcher>,
    runtime: Arc<dyn ContainerRuntime>,
    executor: RemoteExecutor,
    inspector: Inspector,
    mode: AddressingMode,
    data_network: String,
    admin_key: PathBuf,
}

/// Assembles a [`FabricController`] around an existing launcher
pub struct FabricControllerBuilder {
    launcher: Arc<dyn Launcher>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    executor: Option<RemoteExecutor>,
    mode: AddressingMode,
    data_network: String,
    key_root: PathBuf,
}

impl FabricControllerBuilder {
    /// Set the addressing mode (default direct)
    pub fn mode(mut self, mode: AddressingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Name of the data network device
    pub fn data_network(mut self, network: impl Into<String>) -> Self {
        self.data_network = network.into();
        self
    }

    /// Directory holding administrative keys
    pub fn key_root(mut self, key_root: impl Into<PathBuf>) -> Self {
        self.key_root = key_root.into();
        self
    }

    pub fn executor(mut self, executor: RemoteExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> FabricController {
        let admin_key = self.key_root.join(format!("{}.pem", self.launcher.ssh_key()));
        let executor = self
            .executor
            .unwrap_or_else(|| RemoteExecutor::from_config(&RemoteConfig::default()));
        let runtime = self
            .runtime
            .unwrap_or_else(|| Arc::new(DockerCli::new(executor.clone(), admin_key.clone())));

        info!(
            mode = %self.mode,
            network = %self.data_network,
            admin_key = %admin_key.display(),
            "Fabric controller ready"
        );

        FabricController {
            launcher: self.launcher,
            runtime,
            executor,
            inspector: Inspector::new(),
            mode: self.mode,
            data_network: self.data_network,
            admin_key,
        }
    }
}

impl FabricController {
    pub fn builder(launcher: Arc<dyn Launcher>) -> FabricControllerBuilder {
        FabricControllerBuilder {
            launcher,
            runtime: None,
            executor: None,
            mode: AddressingMode::Direct,
            data_network: "eth0".to_string(),
            key_root: PathBuf::from(DEFAULT_KEY_ROOT),
        }
    }

    /// Build a controller from configuration.
    ///
    /// The launcher named by `system.mode` must resolve, otherwise the
    /// controller cannot work at all.
    pub fn from_config(config: &FabricConfig, registry: &LauncherRegistry) -> Result<Self> {
        config.validate()?;

        let launcher = registry
            .resolve(&config.system.mode, config)
            .ok_or_else(|| FabricError::UnknownLauncher(config.system.mode.clone()))?;

        Ok(Self::builder(launcher)
            .mode(config.addressing_mode())
            .data_network(&config.system.network)
            .key_root(&config.remote.key_root)
            .executor(RemoteExecutor::from_config(&config.remote))
            .build())
    }

    pub fn version(&self) -> &'static str {
        FABRIC_VERSION
    }

    /// Filesystem type backing container storage
    pub fn fs_type(&self) -> &'static str {
        FABRIC_FS_TYPE
    }

    pub fn mode(&self) -> AddressingMode {
        self.mode
    }

    pub fn data_network(&self) -> &str {
        &self.data_network
    }

    /// Administrative key file
    pub fn admin_key(&self) -> &Path {
        &self.admin_key
    }

    pub fn launcher(&self) -> &Arc<dyn Launcher> {
        &self.launcher
    }

    /// Cancelling this token aborts the remote retries in flight. Calls made
    /// afterwards run under a fresh token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.executor.cancellation_token()
    }

    /// Provision VMs for a new cluster
    pub async fn alloc(
        &self,
        cluster: &ClusterId,
        service: &ServiceId,
        specs: &[ContainerSpec],
        ctype: &str,
    ) -> Result<StackAllocation> {
        info!(cluster = %cluster, service = %service, ctype = %ctype, count = specs.len(), "Allocating stack");
        self.launcher
            .alloc(cluster, service, specs, ctype, self.mode)
            .await
    }

    /// Start the container described by `spec` on the VM at `public_ip`.
    ///
    /// The entry command is `spec.default_cmd`, or [`DEFAULT_CONTAINER_CMD`]
    /// when unset. Returns `None` when the runtime could not start it.
    pub async fn execute_docker_containers(
        &self,
        spec: &ContainerSpec,
        lxc_opts: &[String],
        private_ip: &str,
        public_ip: &str,
    ) -> Result<Option<(Container, Option<VolumeMount>)>> {
        let mut params = spec.launch_params();
        params.keydir = BTreeMap::from([(CONTAINER_KEY_DIR.to_string(), HOST_KEY_DIR.to_string())]);

        let request = RunRequest {
            params,
            default_cmd: spec
                .default_cmd
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTAINER_CMD.to_string()),
            lxc_opts: lxc_opts.to_vec(),
            server: public_ip.to_string(),
            user: self.launcher.ssh_user().to_string(),
        };

        let Some(mut container) = self.runtime.run(&request, &self.inspector).await? else {
            warn!(host = %public_ip, hostname = %spec.hostname, "Container did not start");
            return Ok(None);
        };

        container.set_addresses(self.mode, private_ip, public_ip);
        container.default_user = self.runtime.docker_user().to_string();
        container.name = spec.name.clone();

        let mounts = spec.volume_user.as_ref().map(|user| VolumeMount {
            user: user.clone(),
            volumes: spec
                .volumes
                .iter()
                .map(|(host, ctr)| (host.clone(), ctr.clone()))
                .collect(),
        });

        Ok(Some((container, mounts)))
    }

    /// Stop a cluster. VMs are released, same as [`remove`](Self::remove).
    pub async fn stop(
        &self,
        cluster: &ClusterId,
        service: &ServiceId,
        containers: &[Container],
    ) -> Result<()> {
        self.remove(cluster, service, containers).await
    }

    /// Release the VMs of a cluster
    pub async fn remove(
        &self,
        cluster: &ClusterId,
        service: &ServiceId,
        containers: &[Container],
    ) -> Result<()> {
        info!(cluster = %cluster, service = %service, count = containers.len(), "Removing stack");
        self.launcher.delete_stack(cluster, service).await
    }

    /// Stop every container and its host agent, then stop the VMs so the
    /// cluster can be restarted later.
    pub async fn halt(
        &self,
        cluster: &ClusterId,
        service: &ServiceId,
        containers: &[Container],
    ) -> Result<()> {
        info!(cluster = %cluster, service = %service, count = containers.len(), "Halting containers");

        for c in containers {
            let Some(ip) = c.external_ip.as_deref() else {
                warn!(hostname = %c.host_name, "Container has no address, skipping halt");
                continue;
            };

            if let Err(e) = self
                .executor
                .run(&c.privatekey, ip, HALT_CONTAINER_CMD, &c.default_user)
                .await
            {
                warn!(host = %ip, error = %e, "Failed to halt container");
            }

            if let Err(e) = self
                .executor
                .run(&self.admin_key, ip, AGENT_QUIT_CMD, self.launcher.ssh_user())
                .await
            {
                warn!(host = %ip, error = %e, "Failed to stop host agent");
            }
        }

        self.launcher.stop_stack(cluster, service).await
    }

    /// Bring a halted cluster back: start the VMs and host agents, then
    /// re-attach each container using the id recorded on its host.
    pub async fn restart(
        &self,
        cluster: &ClusterId,
        service: &ServiceId,
        containers: &mut [Container],
    ) -> Result<()> {
        info!(cluster = %cluster, service = %service, "Restarting VMs");
        let addrs = self.launcher.restart_stack(cluster, service).await?;

        info!(hosts = addrs.len(), "Restarting host agents");
        for ip in &addrs {
            match self
                .executor
                .run(&self.admin_key, ip, AGENT_START_CMD, self.launcher.ssh_user())
                .await
                .and_then(|output| checked(ip, output))
            {
                Ok(output) => debug!(
                    host = %ip,
                    stdout = %output.stdout.trim(),
                    stderr = %output.stderr.trim(),
                    "Host agent started"
                ),
                Err(e) => warn!(host = %ip, error = %e, "Failed to start host agent"),
            }
        }

        info!(count = containers.len(), "Restarting containers");
        for c in containers.iter_mut() {
            let ip = external_address(c)?.to_string();

            let output = self
                .executor
                .run(&self.admin_key, &ip, CONTAINER_PID_CMD, self.launcher.ssh_user())
                .await?;
            let id = output.stdout.trim();
            if !output.is_success() || id.is_empty() {
                return Err(FabricError::RemoteCommand {
                    host: ip,
                    status: output.status,
                    stderr: output.stderr.trim().to_string(),
                });
            }
            c.container = Some(id.to_string());

            info!(host = %ip, container = %id, "Restarting container");
            let request = StartRequest {
                params: c.launch_params(),
                container: id.to_string(),
                server: ip.clone(),
                user: self.launcher.ssh_user().to_string(),
            };
            self.runtime.start(&request).await?;
        }

        Ok(())
    }

    /// Copy `from` into every container, returning the hostnames that
    /// received it. Failures are logged.
    pub async fn copy(&self, containers: &[Container], from: &Path, to: &str) -> Vec<String> {
        self.copy_each(containers, from, to)
            .await
            .into_iter()
            .filter_map(|r| match r.result {
                Ok(()) => Some(r.host),
                Err(e) => {
                    warn!(hostname = %r.host, error = %e, "Copy failed");
                    None
                }
            })
            .collect()
    }

    /// Copy `from` into every container, one result per container
    pub async fn copy_each(
        &self,
        containers: &[Container],
        from: &Path,
        to: &str,
    ) -> Vec<HostResult<()>> {
        let mut results = Vec::with_capacity(containers.len());
        for c in containers {
            let result = match external_address(c) {
                Ok(ip) => self
                    .copy_raw(&c.privatekey, ip, from, to, &c.default_user)
                    .await
                    .and_then(|output| checked(ip, output).map(|_| ())),
                Err(e) => Err(e),
            };
            results.push(HostResult {
                host: c.host_name.clone(),
                result,
            });
        }
        results
    }

    /// Run `command` in every container and collect trimmed output by
    /// hostname. Hosts that fail are logged and left out.
    pub async fn cmd(&self, containers: &[Container], command: &str) -> BTreeMap<String, String> {
        self.cmd_each(containers, command)
            .await
            .into_iter()
            .filter_map(|r| match r.result {
                Ok(stdout) => Some((r.host, stdout)),
                Err(e) => {
                    warn!(hostname = %r.host, error = %e, "Command failed");
                    None
                }
            })
            .collect()
    }

    /// Run `command` in every container, one result per container
    pub async fn cmd_each(&self, containers: &[Container], command: &str) -> Vec<HostResult<String>> {
        let mut results = Vec::with_capacity(containers.len());
        for c in containers {
            let result = match external_address(c) {
                Ok(ip) => self
                    .cmd_raw(&c.privatekey, ip, command, &c.default_user)
                    .await
                    .and_then(|output| checked(ip, output))
                    .map(|output| output.stdout.trim().to_string()),
                Err(e) => Err(e),
            };
            results.push(HostResult {
                host: c.host_name.clone(),
                result,
            });
        }
        results
    }

    /// Run a command on one host
    pub async fn cmd_raw(
        &self,
        key: &Path,
        host: &str,
        command: &str,
        user: &str,
    ) -> Result<CommandOutput> {
        self.executor.run(key, host, command, user).await
    }

    /// Recursively copy to one host
    pub async fn copy_raw(
        &self,
        key: &Path,
        host: &str,
        from: &Path,
        to: &str,
        user: &str,
    ) -> Result<CommandOutput> {
        self.executor.copy(key, host, from, to, user).await
    }

    /// Put the container key for `spec` on `server` before its container starts
    pub async fn copy_public_keys(&self, spec: &ContainerSpec, server: &str) -> Result<()> {
        let source = spec.key_source().ok_or_else(|| {
            FabricError::config(format!("container {} has no key directory", spec.hostname))
        })?;

        let output = self
            .copy_raw(
                &self.admin_key,
                server,
                &source,
                &format!("{}/", HOST_KEY_DIR),
                self.launcher.ssh_user(),
            )
            .await?;
        checked(server, output).map(|_| ())
    }
}

fn external_address(container: &Container) -> Result<&str> {
    container.external_ip.as_deref().ok_or_else(|| {
        FabricError::runtime(format!("container {} has no address", container.host_name))
    })
}

/// Treat a non-zero exit as a failure
fn checked(host: &str, output: CommandOutput) -> Result<CommandOutput> {
    if output.is_success() {
        Ok(output)
    } else {
        Err(FabricError::RemoteCommand {
            host: host.to_string(),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launchers::static_hosts::{StaticHost, StaticHostsConfig, StaticLauncher};
    use crate::remote::{RetryPolicy, SshTarget, Transport};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Call {
        key: PathBuf,
        host: String,
        user: String,
        command: String,
    }

    /// Fake hosts: answers docker and pid-file commands, fails on `broken` hosts
    #[derive(Default)]
    struct FakeHosts {
        broken: HashSet<String>,
        /// (host, command prefix) pairs that exit non-zero
        failing: Vec<(String, String)>,
        /// Hosts whose pid file is empty
        empty_pid: HashSet<String>,
        calls: Mutex<Vec<Call>>,
    }

    impl FakeHosts {
        fn with_broken(hosts: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                broken: hosts.iter().map(|h| h.to_string()).collect(),
                ..Default::default()
            })
        }

        fn with_failing(commands: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                failing: commands
                    .iter()
                    .map(|(h, c)| (h.to_string(), c.to_string()))
                    .collect(),
                ..Default::default()
            })
        }

        fn with_empty_pid(hosts: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                empty_pid: hosts.iter().map(|h| h.to_string()).collect(),
                ..Default::default()
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn answer(&self, target: &SshTarget<'_>, command: String) -> CommandOutput {
            self.calls.lock().unwrap().push(Call {
                key: target.key.to_path_buf(),
                host: target.host.to_string(),
                user: target.user.to_string(),
                command: command.clone(),
            });

            let fails = self
                .failing
                .iter()
                .any(|(h, prefix)| h == target.host && command.starts_with(prefix.as_str()));
            if self.broken.contains(target.host) || fails {
                return CommandOutput {
                    stdout: String::new(),
                    stderr: "bash: service unavailable".to_string(),
                    status: Some(1),
                };
            }

            let stdout = if command.starts_with("docker run") {
                "c0ffee\r\n".to_string()
            } else if command == CONTAINER_PID_CMD && self.empty_pid.contains(target.host) {
                "\r\n".to_string()
            } else if command == CONTAINER_PID_CMD {
                format!("pid-{}\r\n", target.host)
            } else {
                format!("{} says hi\r\n", target.host)
            };
            CommandOutput {
                stdout,
                stderr: String::new(),
                status: Some(0),
            }
        }
    }

    #[async_trait]
    impl Transport for FakeHosts {
        async fn exec(&self, target: &SshTarget<'_>, command: &str) -> Result<CommandOutput> {
            Ok(self.answer(target, command.to_string()))
        }

        async fn copy(&self, target: &SshTarget<'_>, from: &Path, to: &str) -> Result<CommandOutput> {
            Ok(self.answer(target, format!("scp {} {}", from.display(), to)))
        }
    }

    /// Launcher that records stack operations
    struct RecordingLauncher {
        addrs: Vec<String>,
        ops: Mutex<Vec<String>>,
    }

    impl RecordingLauncher {
        fn new(addrs: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                addrs: addrs.iter().map(|a| a.to_string()).collect(),
                ops: Mutex::new(Vec::new()),
            })
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Launcher for RecordingLauncher {
        fn ssh_key(&self) -> &str {
            "admin"
        }

        fn ssh_user(&self) -> &str {
            "ubuntu"
        }

        async fn alloc(
            &self,
            cluster: &ClusterId,
            service: &ServiceId,
            _specs: &[ContainerSpec],
            ctype: &str,
            mode: AddressingMode,
        ) -> Result<StackAllocation> {
            self.ops.lock().unwrap().push(format!("alloc {} {}", ctype, mode));
            Ok(StackAllocation {
                cluster: cluster.clone(),
                service: service.clone(),
                hosts: vec![],
            })
        }

        async fn restart_stack(&self, _: &ClusterId, _: &ServiceId) -> Result<Vec<String>> {
            self.ops.lock().unwrap().push("restart".to_string());
            Ok(self.addrs.clone())
        }

        async fn stop_stack(&self, _: &ClusterId, _: &ServiceId) -> Result<()> {
            self.ops.lock().unwrap().push("stop".to_string());
            Ok(())
        }

        async fn delete_stack(&self, _: &ClusterId, _: &ServiceId) -> Result<()> {
            self.ops.lock().unwrap().push("delete".to_string());
            Ok(())
        }
    }

    fn controller(
        launcher: Arc<RecordingLauncher>,
        hosts: Arc<FakeHosts>,
        mode: AddressingMode,
    ) -> FabricController {
        let executor = RemoteExecutor::new(hosts, RetryPolicy::default().with_interval(Duration::ZERO));
        FabricController::builder(launcher)
            .mode(mode)
            .executor(executor)
            .build()
    }

    fn spec(hostname: &str) -> ContainerSpec {
        ContainerSpec::new("hadoop", "ferry/hadoop", hostname)
            .with_keys("cluster-key", "/keys/cluster-key")
            .with_keydir("/service/keys", "/var/lib/keys/abc")
            .with_port(50070)
    }

    fn running(hostname: &str, ip: &str) -> Container {
        Container {
            container: Some("c0ffee".to_string()),
            image: "ferry/hadoop".to_string(),
            host_name: hostname.to_string(),
            privatekey: PathBuf::from("/keys/cluster-key"),
            default_user: "root".to_string(),
            internal_ip: Some(ip.to_string()),
            external_ip: Some(ip.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_proxy_mode_uses_private_address() {
        let hosts = FakeHosts::with_broken(&[]);
        let fabric = controller(RecordingLauncher::new(&[]), hosts.clone(), AddressingMode::Proxy);

        let (container, mounts) = fabric
            .execute_docker_containers(&spec("node0"), &[], "10.0.0.5", "10.0.0.5")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(container.internal_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(container.external_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(container.container.as_deref(), Some("c0ffee"));
        assert_eq!(container.default_user, "root");
        assert!(container.ports.contains_key(&50070));
        assert!(mounts.is_none());

        let calls = hosts.calls();
        assert_eq!(calls[0].host, "10.0.0.5");
        assert_eq!(calls[0].user, "ubuntu");
        assert_eq!(calls[0].key, PathBuf::from("/ferry/keys/admin.pem"));
        assert!(calls[0].command.contains("-v /ferry/keys:/service/keys"));
        assert!(calls[0].command.contains(DEFAULT_CONTAINER_CMD));
    }

    #[tokio::test]
    async fn test_direct_mode_uses_public_address() {
        let hosts = FakeHosts::with_broken(&[]);
        let fabric = controller(RecordingLauncher::new(&[]), hosts.clone(), AddressingMode::Direct);
        let spec = spec("node0")
            .with_name("namenode")
            .with_volume("/data/node0", "/service/data")
            .with_volume_user("hdfs");

        let (container, mounts) = fabric
            .execute_docker_containers(&spec, &[], "10.0.0.5", "203.0.113.9")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(container.internal_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(container.external_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(container.name.as_deref(), Some("namenode"));
        assert_eq!(
            mounts,
            Some(VolumeMount {
                user: "hdfs".to_string(),
                volumes: vec![("/data/node0".to_string(), "/service/data".to_string())],
            })
        );
        assert_eq!(hosts.calls()[0].host, "203.0.113.9");
    }

    #[tokio::test]
    async fn test_spec_entry_command_overrides_default() {
        let hosts = FakeHosts::with_broken(&[]);
        let fabric = controller(RecordingLauncher::new(&[]), hosts.clone(), AddressingMode::Proxy);
        let spec = spec("node0").with_default_cmd("/service/sbin/startnode web");

        fabric
            .execute_docker_containers(&spec, &[], "10.0.0.5", "10.0.0.5")
            .await
            .unwrap()
            .unwrap();

        let command = &hosts.calls()[0].command;
        assert!(command.contains("/service/sbin/startnode web"));
        assert!(!command.contains(DEFAULT_CONTAINER_CMD));
    }

    async fn start_on_allocated_host(mode: AddressingMode) -> Container {
        let pool = StaticHostsConfig {
            ssh_key: "pool-admin".to_string(),
            ssh_user: "ubuntu".to_string(),
            hosts: vec![StaticHost::new("10.0.0.5", Some("203.0.113.9"))],
        };
        let hosts = FakeHosts::with_broken(&[]);
        let executor = RemoteExecutor::new(hosts, RetryPolicy::default().with_interval(Duration::ZERO));
        let fabric = FabricController::builder(Arc::new(StaticLauncher::new(pool, mode)))
            .mode(mode)
            .executor(executor)
            .build();

        let stack = fabric
            .alloc(&ClusterId::new("c1"), &ServiceId::new("s1"), &[spec("node0")], "hadoop")
            .await
            .unwrap();
        let host = &stack.hosts[0];
        let server = host.reachable_address(mode).unwrap();

        let (container, _) = fabric
            .execute_docker_containers(&spec("node0"), &[], &host.private_ip, server)
            .await
            .unwrap()
            .unwrap();
        container
    }

    #[tokio::test]
    async fn test_alloc_then_start_in_proxy_mode() {
        let container = start_on_allocated_host(AddressingMode::Proxy).await;

        assert_eq!(container.internal_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(container.external_ip.as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn test_alloc_then_start_in_direct_mode() {
        let container = start_on_allocated_host(AddressingMode::Direct).await;

        assert_eq!(container.internal_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(container.external_ip.as_deref(), Some("203.0.113.9"));
    }

    #[tokio::test]
    async fn test_failed_start_is_none() {
        let hosts = FakeHosts::with_broken(&["203.0.113.9"]);
        let fabric = controller(RecordingLauncher::new(&[]), hosts, AddressingMode::Direct);

        let started = fabric
            .execute_docker_containers(&spec("node0"), &[], "10.0.0.5", "203.0.113.9")
            .await
            .unwrap();
        assert!(started.is_none());
    }

    #[tokio::test]
    async fn test_halt_then_restart_recovers_container_ids() {
        let hosts = FakeHosts::with_broken(&[]);
        let launcher = RecordingLauncher::new(&["10.0.0.5", "10.0.0.6"]);
        let fabric = controller(launcher.clone(), hosts.clone(), AddressingMode::Proxy);
        let (cluster, service) = (ClusterId::new("c1"), ServiceId::new("s1"));
        let mut containers = vec![running("node0", "10.0.0.5"), running("node1", "10.0.0.6")];

        fabric.halt(&cluster, &service, &containers).await.unwrap();
        for c in containers.iter_mut() {
            c.container = None;
        }
        fabric.restart(&cluster, &service, &mut containers).await.unwrap();

        assert_eq!(containers[0].container.as_deref(), Some("pid-10.0.0.5"));
        assert_eq!(containers[1].container.as_deref(), Some("pid-10.0.0.6"));
        assert_eq!(launcher.ops(), vec!["stop", "restart"]);

        let commands: Vec<(String, String)> = hosts
            .calls()
            .into_iter()
            .filter(|c| c.host == "10.0.0.5")
            .map(|c| (c.user, c.command))
            .collect();
        assert_eq!(
            commands,
            vec![
                ("root".to_string(), HALT_CONTAINER_CMD.to_string()),
                ("ubuntu".to_string(), AGENT_QUIT_CMD.to_string()),
                ("ubuntu".to_string(), AGENT_START_CMD.to_string()),
                ("ubuntu".to_string(), CONTAINER_PID_CMD.to_string()),
                ("ubuntu".to_string(), "docker start pid-10.0.0.5".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_restart_continues_past_agent_failure() {
        let hosts = FakeHosts::with_failing(&[("10.0.0.6", AGENT_START_CMD)]);
        let fabric = controller(
            RecordingLauncher::new(&["10.0.0.5", "10.0.0.6"]),
            hosts.clone(),
            AddressingMode::Proxy,
        );
        let mut containers = vec![running("node0", "10.0.0.5"), running("node1", "10.0.0.6")];

        fabric
            .restart(&ClusterId::new("c1"), &ServiceId::new("s1"), &mut containers)
            .await
            .unwrap();

        assert_eq!(containers[1].container.as_deref(), Some("pid-10.0.0.6"));
        assert!(hosts
            .calls()
            .iter()
            .any(|c| c.host == "10.0.0.6" && c.command == AGENT_START_CMD));
    }

    #[tokio::test]
    async fn test_restart_fails_on_unreadable_pid_file() {
        let hosts = FakeHosts::with_failing(&[("10.0.0.6", CONTAINER_PID_CMD)]);
        let fabric = controller(
            RecordingLauncher::new(&["10.0.0.5", "10.0.0.6"]),
            hosts,
            AddressingMode::Proxy,
        );
        let mut containers = vec![running("node0", "10.0.0.5"), running("node1", "10.0.0.6")];

        let err = fabric
            .restart(&ClusterId::new("c1"), &ServiceId::new("s1"), &mut containers)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FabricError::RemoteCommand { ref host, status: Some(1), .. } if host == "10.0.0.6"
        ));
        assert_eq!(containers[0].container.as_deref(), Some("pid-10.0.0.5"));
        assert_eq!(containers[1].container.as_deref(), Some("c0ffee"));
    }

    #[tokio::test]
    async fn test_restart_fails_on_empty_pid_file() {
        let hosts = FakeHosts::with_empty_pid(&["10.0.0.5"]);
        let fabric = controller(RecordingLauncher::new(&["10.0.0.5"]), hosts.clone(), AddressingMode::Proxy);
        let mut containers = vec![running("node0", "10.0.0.5")];

        let err = fabric
            .restart(&ClusterId::new("c1"), &ServiceId::new("s1"), &mut containers)
            .await
            .unwrap_err();

        assert!(matches!(err, FabricError::RemoteCommand { status: Some(0), .. }));
        assert!(!hosts.calls().iter().any(|c| c.command.starts_with("docker start")));
    }

    #[tokio::test]
    async fn test_restart_propagates_start_failure() {
        let hosts = FakeHosts::with_failing(&[("10.0.0.5", "docker start")]);
        let fabric = controller(RecordingLauncher::new(&["10.0.0.5"]), hosts, AddressingMode::Proxy);
        let mut containers = vec![running("node0", "10.0.0.5")];

        let err = fabric
            .restart(&ClusterId::new("c1"), &ServiceId::new("s1"), &mut containers)
            .await
            .unwrap_err();

        assert!(matches!(err, FabricError::Runtime(_)));
        assert_eq!(containers[0].container.as_deref(), Some("pid-10.0.0.5"));
    }

    #[tokio::test]
    async fn test_halt_continues_past_broken_host() {
        let hosts = FakeHosts::with_broken(&["10.0.0.5"]);
        let launcher = RecordingLauncher::new(&[]);
        let fabric = controller(launcher.clone(), hosts.clone(), AddressingMode::Proxy);
        let containers = vec![running("node0", "10.0.0.5"), running("node1", "10.0.0.6")];

        fabric
            .halt(&ClusterId::new("c1"), &ServiceId::new("s1"), &containers)
            .await
            .unwrap();

        assert_eq!(hosts.calls().len(), 4);
        assert_eq!(launcher.ops(), vec!["stop"]);
    }

    #[tokio::test]
    async fn test_cmd_omits_failed_hosts() {
        let hosts = FakeHosts::with_broken(&["10.0.0.6"]);
        let fabric = controller(RecordingLauncher::new(&[]), hosts, AddressingMode::Proxy);
        let containers = vec![
            running("node0", "10.0.0.5"),
            running("node1", "10.0.0.6"),
            running("node2", "10.0.0.7"),
        ];

        let output = fabric.cmd(&containers, "hostname").await;

        assert_eq!(output.len(), 2);
        assert_eq!(output["node0"], "10.0.0.5 says hi");
        assert_eq!(output["node2"], "10.0.0.7 says hi");
        assert!(!output.contains_key("node1"));

        let each = fabric.cmd_each(&containers, "hostname").await;
        assert_eq!(each.len(), 3);
        assert!(matches!(
            each[1].result,
            Err(FabricError::RemoteCommand { status: Some(1), .. })
        ));
    }

    #[tokio::test]
    async fn test_copy_omits_failed_hosts() {
        let hosts = FakeHosts::with_broken(&["10.0.0.6"]);
        let fabric = controller(RecordingLauncher::new(&[]), hosts.clone(), AddressingMode::Proxy);
        let containers = vec![
            running("node0", "10.0.0.5"),
            running("node1", "10.0.0.6"),
            running("node2", "10.0.0.7"),
        ];

        let copied = fabric
            .copy(&containers, Path::new("/tmp/conf"), "/service/conf")
            .await;

        assert_eq!(copied, vec!["node0", "node2"]);
        assert_eq!(hosts.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_copy_uses_container_identity() {
        let hosts = FakeHosts::with_broken(&[]);
        let fabric = controller(RecordingLauncher::new(&[]), hosts.clone(), AddressingMode::Proxy);
        let mut unaddressed = running("node1", "10.0.0.6");
        unaddressed.external_ip = None;

        let results = fabric
            .copy_each(
                &[running("node0", "10.0.0.5"), unaddressed],
                Path::new("/tmp/conf"),
                "/service/conf",
            )
            .await;

        assert!(results[0].is_ok());
        assert!(!results[1].is_ok());

        let calls = hosts.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].key, PathBuf::from("/keys/cluster-key"));
        assert_eq!(calls[0].user, "root");
        assert_eq!(calls[0].command, "scp /tmp/conf /service/conf");
    }

    #[tokio::test]
    async fn test_copy_public_keys_uses_admin_identity() {
        let hosts = FakeHosts::with_broken(&[]);
        let fabric = controller(RecordingLauncher::new(&[]), hosts.clone(), AddressingMode::Direct);

        fabric.copy_public_keys(&spec("node0"), "203.0.113.9").await.unwrap();

        let calls = hosts.calls();
        assert_eq!(calls[0].key, PathBuf::from("/ferry/keys/admin.pem"));
        assert_eq!(calls[0].user, "ubuntu");
        assert_eq!(calls[0].command, "scp /var/lib/keys/abc/cluster-key /ferry/keys/");

        let no_keys = ContainerSpec::new("hadoop", "ferry/hadoop", "node1");
        assert!(fabric.copy_public_keys(&no_keys, "203.0.113.9").await.is_err());
    }

    #[tokio::test]
    async fn test_stop_and_remove_delete_stack() {
        let launcher = RecordingLauncher::new(&[]);
        let fabric = controller(launcher.clone(), FakeHosts::with_broken(&[]), AddressingMode::Proxy);
        let (cluster, service) = (ClusterId::new("c1"), ServiceId::new("s1"));

        fabric.alloc(&cluster, &service, &[spec("node0")], "hadoop").await.unwrap();
        fabric.stop(&cluster, &service, &[]).await.unwrap();
        fabric.remove(&cluster, &service, &[]).await.unwrap();

        assert_eq!(launcher.ops(), vec!["alloc hadoop proxy", "delete", "delete"]);
    }

    #[test]
    fn test_from_config_resolves_launcher() {
        let config = FabricConfig::new("fabric.launchers.static/StaticLauncher")
            .with_proxy(true)
            .with_static_hosts(StaticHostsConfig {
                ssh_key: "pool-admin".to_string(),
                ssh_user: "ubuntu".to_string(),
                hosts: vec![StaticHost::new("10.0.0.5", None)],
            });

        let fabric = FabricController::from_config(&config, &LauncherRegistry::builtin()).unwrap();

        assert_eq!(fabric.mode(), AddressingMode::Proxy);
        assert_eq!(fabric.admin_key(), Path::new("/ferry/keys/pool-admin.pem"));
        assert_eq!(fabric.version(), "0.1");
        assert_eq!(fabric.fs_type(), "xfs");
    }

    #[test]
    fn test_unknown_launcher_is_fatal() {
        let config = FabricConfig::new("fabric.launchers.nowhere/NoLauncher");

        let err = FabricController::from_config(&config, &LauncherRegistry::builtin())
            .err()
            .unwrap();
        assert!(matches!(err, FabricError::UnknownLauncher(id) if id == "fabric.launchers.nowhere/NoLauncher"));
    }
}
