//! Container runtime driven over SSH
//!
//! The controller does not talk to a container engine directly. A
//! [`ContainerRuntime`] starts containers on a VM given connection parameters;
//! [`DockerCli`] does it by running the docker CLI on the host through the
//! [`RemoteExecutor`].

use crate::inspector::Inspector;
use crate::remote::RemoteExecutor;
use async_trait::async_trait;
use fabric_core::{Container, FabricError, LaunchParams, Result};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Login user inside containers started by the docker runtime
pub const DEFAULT_DOCKER_USER: &str = "root";

/// Start a new container on a host
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub params: LaunchParams,
    /// Entry command run inside the container
    pub default_cmd: String,
    /// Extra engine options, passed through to `docker run`
    pub lxc_opts: Vec<String>,
    pub server: String,
    pub user: String,
}

/// Re-attach to a container that already exists on a host
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub params: LaunchParams,
    pub container: String,
    pub server: String,
    pub user: String,
}

/// Starts and restarts individual containers
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Login user inside started containers
    fn docker_user(&self) -> &str;

    /// Start a container. `Ok(None)` means the runtime could not start it.
    async fn run(&self, request: &RunRequest, inspector: &Inspector) -> Result<Option<Container>>;

    /// Start an existing, stopped container
    async fn start(&self, request: &StartRequest) -> Result<()>;
}

/// Docker CLI executed on the target host over SSH
#[derive(Clone)]
pub struct DockerCli {
    executor: RemoteExecutor,
    /// Administrative key used to reach the host
    key: PathBuf,
    docker_user: String,
}

impl DockerCli {
    pub fn new(executor: RemoteExecutor, key: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            key: key.into(),
            docker_user: DEFAULT_DOCKER_USER.to_string(),
        }
    }

    /// Set the in-container login user
    pub fn with_docker_user(mut self, user: impl Into<String>) -> Self {
        self.docker_user = user.into();
        self
    }

    /// Build the `docker run` command line
    pub fn run_command(request: &RunRequest) -> String {
        let params = &request.params;
        let mut args: Vec<String> = vec![
            "docker".to_string(),
            "run".to_string(),
            "-d".to_string(),
            "--net=host".to_string(),
            "-h".to_string(),
            shell_quote(&params.hostname),
        ];

        for (host, container) in &params.volumes {
            args.push("-v".to_string());
            args.push(shell_quote(&format!("{}:{}", host, container)));
        }

        for (container, host) in &params.keydir {
            args.push("-v".to_string());
            args.push(shell_quote(&format!("{}:{}", host, container)));
        }

        for port in &params.open_ports {
            args.push("--expose".to_string());
            args.push(port.to_string());
        }

        args.extend(request.lxc_opts.iter().cloned());
        args.push(shell_quote(&params.image));
        args.push(request.default_cmd.clone());
        args.extend(params.args.iter().map(|a| shell_quote(a)));

        args.join(" ")
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn docker_user(&self) -> &str {
        &self.docker_user
    }

    async fn run(&self, request: &RunRequest, inspector: &Inspector) -> Result<Option<Container>> {
        let command = Self::run_command(request);
        debug!(server = %request.server, command = %command, "Docker run");

        let output = self
            .executor
            .run(&self.key, &request.server, &command, &request.user)
            .await?;

        // A tty session may prepend noise; the id is the last line docker prints
        let container_id = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last();

        match container_id {
            Some(id) if output.is_success() => {
                info!(server = %request.server, container = %id, image = %request.params.image, "Container started");
                Ok(Some(inspector.inspect(
                    &request.params.image,
                    Some(id),
                    &request.params,
                    &request.server,
                )))
            }
            _ => {
                warn!(
                    server = %request.server,
                    status = ?output.status,
                    stderr = %output.stderr.trim(),
                    "Could not start container"
                );
                Ok(None)
            }
        }
    }

    async fn start(&self, request: &StartRequest) -> Result<()> {
        let command = format!("docker start {}", shell_quote(&request.container));
        let output = self
            .executor
            .run(&self.key, &request.server, &command, &request.user)
            .await?;

        if !output.is_success() {
            return Err(FabricError::runtime(format!(
                "docker start {} on {} failed: {}",
                request.container,
                request.server,
                output.stderr.trim()
            )));
        }

        info!(server = %request.server, container = %request.container, "Container restarted");
        Ok(())
    }
}

/// Quote a word for a POSIX shell unless it is plainly safe
fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{CommandOutput, RetryPolicy, SshTarget, Transport};
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct FixedTransport {
        output: CommandOutput,
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for FixedTransport {
        async fn exec(&self, _target: &SshTarget<'_>, command: &str) -> Result<CommandOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(self.output.clone())
        }

        async fn copy(&self, _target: &SshTarget<'_>, _from: &Path, _to: &str) -> Result<CommandOutput> {
            Ok(self.output.clone())
        }
    }

    fn docker_with(output: CommandOutput) -> (DockerCli, Arc<FixedTransport>) {
        let transport = Arc::new(FixedTransport {
            output,
            commands: Mutex::new(Vec::new()),
        });
        let executor = RemoteExecutor::new(
            transport.clone(),
            RetryPolicy::default().with_interval(Duration::ZERO),
        );
        (DockerCli::new(executor, "/ferry/keys/admin.pem"), transport)
    }

    fn request() -> RunRequest {
        let mut params = LaunchParams {
            image: "ferry/hadoop".to_string(),
            hostname: "hadoop0".to_string(),
            open_ports: vec![50070],
            args: vec!["role=master".to_string()],
            ..Default::default()
        };
        params.keydir.insert("/service/keys".to_string(), "/ferry/keys".to_string());
        params.volumes.insert("/data/hadoop0".to_string(), "/service/data".to_string());

        RunRequest {
            params,
            default_cmd: "/service/sbin/startnode init".to_string(),
            lxc_opts: vec![],
            server: "203.0.113.9".to_string(),
            user: "ubuntu".to_string(),
        }
    }

    #[test]
    fn test_run_command_line() {
        let command = DockerCli::run_command(&request());

        assert_eq!(
            command,
            "docker run -d --net=host -h hadoop0 -v /data/hadoop0:/service/data \
             -v /ferry/keys:/service/keys --expose 50070 ferry/hadoop \
             /service/sbin/startnode init role=master"
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-word_1.0"), "plain-word_1.0");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[tokio::test]
    async fn test_run_inspects_started_container() {
        let (docker, transport) = docker_with(CommandOutput {
            stdout: "Unable to find image locally\r\n9d3c1f0e7a\r\n".to_string(),
            stderr: String::new(),
            status: Some(0),
        });

        let container = docker.run(&request(), &Inspector::new()).await.unwrap().unwrap();

        assert_eq!(container.container.as_deref(), Some("9d3c1f0e7a"));
        assert_eq!(container.host_name, "hadoop0");
        assert!(container.ports.contains_key(&50070));
        assert!(transport.commands.lock().unwrap()[0].starts_with("docker run -d"));
    }

    #[tokio::test]
    async fn test_run_failure_is_empty_result() {
        let (docker, _) = docker_with(CommandOutput {
            stdout: String::new(),
            stderr: "docker: Error response from daemon: pull access denied".to_string(),
            status: Some(125),
        });

        assert!(docker.run(&request(), &Inspector::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_reports_failure() {
        let (docker, transport) = docker_with(CommandOutput {
            stdout: String::new(),
            stderr: "Error: No such container: abc".to_string(),
            status: Some(1),
        });
        let request = StartRequest {
            params: LaunchParams::default(),
            container: "abc".to_string(),
            server: "10.0.0.5".to_string(),
            user: "ubuntu".to_string(),
        };

        let err = docker.start(&request).await.unwrap_err();
        assert!(matches!(err, FabricError::Runtime(_)));
        assert_eq!(transport.commands.lock().unwrap()[0], "docker start abc");
    }
}
