//! EC2 launcher
//!
//! One instance per container spec. Every instance is tagged with the cluster
//! and service it belongs to, so a stack is found again by tag lookup and no
//! local state is needed to stop, restart or terminate it.

use crate::config::FabricConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::{
    Client,
    types::{
        BlockDeviceMapping, EbsBlockDevice, Filter, IamInstanceProfileSpecification, Instance,
        InstanceMarketOptionsRequest, InstanceStateName, InstanceType, MarketType, ResourceType,
        SpotMarketOptions, Tag, TagSpecification, VolumeType,
    },
};
use aws_types::region::Region;
use base64::Engine;
use chrono::{DateTime, Utc};
use fabric_core::{
    AddressingMode, AllocatedHost, ClusterId, ContainerSpec, FabricError, Launcher, Result,
    ServiceId, StackAllocation,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

pub const NAMESPACE: &str = "fabric.launchers.aws";
pub const TYPE_NAME: &str = "Ec2Launcher";

/// Default AWS region
pub const DEFAULT_REGION: &str = "us-east-1";

/// Tag key holding the cluster id
pub const CLUSTER_TAG_KEY: &str = "FabricCluster";

/// Tag key holding the service id
pub const SERVICE_TAG_KEY: &str = "FabricService";

/// Tag key holding the container type
pub const TYPE_TAG_KEY: &str = "FabricType";

/// Polling interval while waiting for state changes
const STATE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Create EC2 client for a region
pub async fn create_ec2_client(region: &str) -> Client {
    debug!("Creating EC2 client for region: {}", region);

    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await;

    Client::new(&config)
}

/// `aws` configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ec2LauncherConfig {
    #[serde(default = "default_region")]
    pub region: String,

    /// AMI with docker and the host agent installed
    pub ami_id: String,

    #[serde(default = "default_instance_type")]
    pub instance_type: String,

    /// EC2 key pair; doubles as the administrative key name
    pub key_name: String,

    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    #[serde(default)]
    pub security_group_ids: Vec<String>,

    #[serde(default)]
    pub subnet_id: Option<String>,

    /// Plain-text cloud-init script; encoded before submission
    #[serde(default)]
    pub user_data: Option<String>,

    #[serde(default)]
    pub iam_instance_profile: Option<String>,

    #[serde(default = "default_root_volume_size")]
    pub root_volume_size_gb: i32,

    /// Launch as spot with this maximum price (USD per hour)
    #[serde(default)]
    pub spot_max_price: Option<String>,

    /// How long to wait for instance state changes
    #[serde(default = "default_boot_timeout_secs")]
    pub boot_timeout_secs: u64,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

fn default_instance_type() -> String {
    "t3.large".to_string()
}

fn default_ssh_user() -> String {
    "ec2-user".to_string()
}

fn default_root_volume_size() -> i32 {
    50
}

fn default_boot_timeout_secs() -> u64 {
    600
}

impl Ec2LauncherConfig {
    pub fn new(ami_id: impl Into<String>, key_name: impl Into<String>) -> Self {
        Self {
            region: default_region(),
            ami_id: ami_id.into(),
            instance_type: default_instance_type(),
            key_name: key_name.into(),
            ssh_user: default_ssh_user(),
            security_group_ids: vec![],
            subnet_id: None,
            user_data: None,
            iam_instance_profile: None,
            root_volume_size_gb: default_root_volume_size(),
            spot_max_price: None,
            boot_timeout_secs: default_boot_timeout_secs(),
        }
    }

    /// Set region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Set instance type
    pub fn with_instance_type(mut self, instance_type: impl Into<String>) -> Self {
        self.instance_type = instance_type.into();
        self
    }

    /// Set administrative login user
    pub fn with_ssh_user(mut self, user: impl Into<String>) -> Self {
        self.ssh_user = user.into();
        self
    }

    /// Add security group
    pub fn with_security_group(mut self, sg_id: impl Into<String>) -> Self {
        self.security_group_ids.push(sg_id.into());
        self
    }

    /// Set subnet
    pub fn with_subnet(mut self, subnet_id: impl Into<String>) -> Self {
        self.subnet_id = Some(subnet_id.into());
        self
    }

    /// Set user data
    pub fn with_user_data(mut self, user_data: impl Into<String>) -> Self {
        self.user_data = Some(user_data.into());
        self
    }

    /// Set IAM instance profile
    pub fn with_iam_profile(mut self, profile: impl Into<String>) -> Self {
        self.iam_instance_profile = Some(profile.into());
        self
    }

    /// Set root volume size in GB
    pub fn with_root_volume_size(mut self, size_gb: i32) -> Self {
        self.root_volume_size_gb = size_gb;
        self
    }

    /// Launch as spot instances
    pub fn with_spot_price(mut self, price: impl Into<String>) -> Self {
        self.spot_max_price = Some(price.into());
        self
    }

    /// User data as the API expects it
    fn encoded_user_data(&self) -> Option<String> {
        self.user_data
            .as_ref()
            .map(|script| base64::engine::general_purpose::STANDARD.encode(script))
    }
}

/// Instance state tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl InstanceState {
    fn from_aws(name: &InstanceStateName) -> Self {
        match name {
            InstanceStateName::Pending => Self::Pending,
            InstanceStateName::Running => Self::Running,
            InstanceStateName::Stopping => Self::Stopping,
            InstanceStateName::Stopped => Self::Stopped,
            InstanceStateName::ShuttingDown => Self::ShuttingDown,
            InstanceStateName::Terminated => Self::Terminated,
            _ => Self::Pending,
        }
    }

    /// Gone for good
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }

    /// API filter value
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
        }
    }

    fn wait_toward(&self, target: InstanceState) -> StateWait {
        if *self == target {
            StateWait::Reached
        } else if self.is_gone() {
            StateWait::Gone
        } else {
            StateWait::Pending
        }
    }
}

/// Progress of an instance toward a wanted state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateWait {
    Reached,
    Pending,
    Gone,
}

/// Instance belonging to a stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackInstance {
    pub id: String,
    pub hostname: String,
    pub state: InstanceState,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub launch_time: Option<DateTime<Utc>>,
}

impl StackInstance {
    /// Create from AWS instance
    pub fn from_aws_instance(instance: &Instance) -> Result<Self> {
        let id = instance
            .instance_id()
            .ok_or_else(|| FabricError::provider("instance without id"))?;

        let state = instance
            .state()
            .and_then(|s| s.name())
            .map(InstanceState::from_aws)
            .ok_or_else(|| FabricError::provider(format!("instance {} has no state", id)))?;

        let hostname = instance
            .tags()
            .iter()
            .find(|t| t.key() == Some("Name"))
            .and_then(|t| t.value())
            .unwrap_or(id)
            .to_string();

        let launch_time = instance
            .launch_time()
            .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()));

        Ok(Self {
            id: id.to_string(),
            hostname,
            state,
            private_ip: instance.private_ip_address().map(str::to_string),
            public_ip: instance.public_ip_address().map(str::to_string),
            launch_time,
        })
    }

    /// Convert a running instance into an allocation record
    pub fn to_allocated(&self, mode: AddressingMode) -> Result<AllocatedHost> {
        let private_ip = self
            .private_ip
            .clone()
            .ok_or_else(|| FabricError::provider(format!("instance {} has no private address", self.id)))?;

        if !mode.is_proxy() && self.public_ip.is_none() {
            return Err(FabricError::provider(format!(
                "instance {} has no public address (direct addressing)",
                self.id
            )));
        }

        Ok(AllocatedHost {
            instance_id: self.id.clone(),
            hostname: self.hostname.clone(),
            private_ip,
            public_ip: self.public_ip.clone(),
            launched_at: self.launch_time,
        })
    }
}

/// Tags applied to every instance of a stack
pub fn stack_tags(
    cluster: &ClusterId,
    service: &ServiceId,
    ctype: &str,
    hostname: &str,
) -> Vec<(String, String)> {
    vec![
        (CLUSTER_TAG_KEY.to_string(), cluster.to_string()),
        (SERVICE_TAG_KEY.to_string(), service.to_string()),
        (TYPE_TAG_KEY.to_string(), ctype.to_string()),
        ("Name".to_string(), hostname.to_string()),
    ]
}

/// Launcher provisioning one EC2 instance per container
pub struct Ec2Launcher {
    config: Ec2LauncherConfig,
    mode: AddressingMode,
    client: OnceCell<Client>,
}

impl Ec2Launcher {
    /// The client is created on first use
    pub fn new(config: Ec2LauncherConfig, mode: AddressingMode) -> Self {
        Self {
            config,
            mode,
            client: OnceCell::new(),
        }
    }

    /// Use an existing client
    pub fn with_client(config: Ec2LauncherConfig, mode: AddressingMode, client: Client) -> Self {
        Self {
            config,
            mode,
            client: OnceCell::new_with(Some(client)),
        }
    }

    /// Registry factory; declines without a usable `aws` section
    pub fn factory(config: &FabricConfig) -> Option<Arc<dyn Launcher>> {
        let Some(section) = config.aws.clone() else {
            warn!("aws section missing from configuration");
            return None;
        };
        if section.ami_id.trim().is_empty() || section.key_name.trim().is_empty() {
            warn!("aws.ami_id and aws.key_name are required");
            return None;
        }
        Some(Arc::new(Self::new(section, config.addressing_mode())))
    }

    pub fn config(&self) -> &Ec2LauncherConfig {
        &self.config
    }

    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| create_ec2_client(&self.config.region))
            .await
    }

    fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.config.boot_timeout_secs)
    }

    /// Launch one instance
    async fn launch(&self, tags: Vec<(String, String)>) -> Result<String> {
        let client = self.client().await;
        let config = &self.config;

        info!(
            "Launching instance: type={}, ami={}, root_volume={}GB",
            config.instance_type, config.ami_id, config.root_volume_size_gb
        );

        let root_device = BlockDeviceMapping::builder()
            .device_name("/dev/xvda")
            .ebs(
                EbsBlockDevice::builder()
                    .volume_size(config.root_volume_size_gb)
                    .volume_type(VolumeType::Gp3)
                    .delete_on_termination(true)
                    .build(),
            )
            .build();

        let tag_spec = TagSpecification::builder()
            .resource_type(ResourceType::Instance)
            .set_tags(Some(
                tags.iter()
                    .map(|(k, v)| Tag::builder().key(k).value(v).build())
                    .collect(),
            ))
            .build();

        let mut run_req = client
            .run_instances()
            .image_id(&config.ami_id)
            .instance_type(InstanceType::from(config.instance_type.as_str()))
            .set_security_group_ids(if config.security_group_ids.is_empty() {
                None
            } else {
                Some(config.security_group_ids.clone())
            })
            .key_name(&config.key_name)
            .set_subnet_id(config.subnet_id.clone())
            .set_user_data(config.encoded_user_data())
            .block_device_mappings(root_device)
            .tag_specifications(tag_spec)
            .min_count(1)
            .max_count(1);

        if let Some(profile) = &config.iam_instance_profile {
            debug!("Using IAM instance profile: {}", profile);
            run_req = run_req.iam_instance_profile(
                IamInstanceProfileSpecification::builder().name(profile).build(),
            );
        }

        if let Some(price) = &config.spot_max_price {
            debug!("Launching as spot instance, max price {}", price);
            run_req = run_req.instance_market_options(
                InstanceMarketOptionsRequest::builder()
                    .market_type(MarketType::Spot)
                    .spot_options(SpotMarketOptions::builder().max_price(price).build())
                    .build(),
            );
        }

        let response = run_req.send().await.map_err(FabricError::from_aws)?;
        let instance_id = response
            .instances()
            .first()
            .and_then(|i| i.instance_id())
            .ok_or_else(|| FabricError::provider("no instance in run response"))?;

        info!("Instance launched: {}", instance_id);
        Ok(instance_id.to_string())
    }

    /// Instances of a stack in any of `states`
    async fn stack_instances(
        &self,
        cluster: &ClusterId,
        service: &ServiceId,
        states: &[InstanceState],
    ) -> Result<Vec<StackInstance>> {
        let client = self.client().await;

        let response = client
            .describe_instances()
            .filters(
                Filter::builder()
                    .name(format!("tag:{}", CLUSTER_TAG_KEY))
                    .values(cluster.as_str())
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name(format!("tag:{}", SERVICE_TAG_KEY))
                    .values(service.as_str())
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name("instance-state-name")
                    .set_values(Some(states.iter().map(|s| s.as_filter().to_string()).collect()))
                    .build(),
            )
            .send()
            .await
            .map_err(FabricError::from_aws)?;

        let mut instances = Vec::new();
        for reservation in response.reservations() {
            for inst in reservation.instances() {
                match StackInstance::from_aws_instance(inst) {
                    Ok(instance) => instances.push(instance),
                    Err(e) => warn!("Failed to parse instance: {}", e),
                }
            }
        }

        Ok(instances)
    }

    async fn describe(&self, instance_id: &str) -> Result<StackInstance> {
        let response = self
            .client()
            .await
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(FabricError::from_aws)?;

        let instance = response
            .reservations()
            .first()
            .and_then(|r| r.instances().first())
            .ok_or_else(|| FabricError::InstanceNotFound(instance_id.to_string()))?;

        StackInstance::from_aws_instance(instance)
    }

    /// Wait until the instance is running
    async fn wait_until_running(&self, instance_id: &str) -> Result<StackInstance> {
        self.wait_for_state(instance_id, InstanceState::Running).await
    }

    /// Wait until the instance has finished stopping
    async fn wait_until_stopped(&self, instance_id: &str) -> Result<StackInstance> {
        self.wait_for_state(instance_id, InstanceState::Stopped).await
    }

    async fn wait_for_state(&self, instance_id: &str, target: InstanceState) -> Result<StackInstance> {
        let timeout = self.boot_timeout();
        info!(
            "Waiting for instance {} to be {} (timeout: {:?})",
            instance_id,
            target.as_filter(),
            timeout
        );

        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            let instance = self.describe(instance_id).await?;

            match instance.state.wait_toward(target) {
                StateWait::Reached => {
                    info!("Instance {} is now {}", instance_id, target.as_filter());
                    return Ok(instance);
                }
                StateWait::Gone => {
                    return Err(FabricError::provider(format!(
                        "Instance {} terminated while waiting for {} state",
                        instance_id,
                        target.as_filter()
                    )));
                }
                StateWait::Pending => tokio::time::sleep(STATE_POLL_INTERVAL).await,
            }
        }

        Err(FabricError::Timeout(timeout))
    }
}

/// Instances that must finish stopping before they can be started again
fn still_stopping(instances: &[StackInstance]) -> Vec<&str> {
    instances
        .iter()
        .filter(|i| i.state == InstanceState::Stopping)
        .map(|i| i.id.as_str())
        .collect()
}

#[async_trait]
impl Launcher for Ec2Launcher {
    fn ssh_key(&self) -> &str {
        &self.config.key_name
    }

    fn ssh_user(&self) -> &str {
        &self.config.ssh_user
    }

    async fn alloc(
        &self,
        cluster: &ClusterId,
        service: &ServiceId,
        specs: &[ContainerSpec],
        ctype: &str,
        mode: AddressingMode,
    ) -> Result<StackAllocation> {
        info!(cluster = %cluster, service = %service, ctype = %ctype, count = specs.len(), "Allocating EC2 stack");

        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            ids.push(self.launch(stack_tags(cluster, service, ctype, &spec.hostname)).await?);
        }

        let mut hosts = Vec::with_capacity(ids.len());
        for id in &ids {
            let instance = self.wait_until_running(id).await?;
            hosts.push(instance.to_allocated(mode)?);
        }

        Ok(StackAllocation {
            cluster: cluster.clone(),
            service: service.clone(),
            hosts,
        })
    }

    async fn restart_stack(&self, cluster: &ClusterId, service: &ServiceId) -> Result<Vec<String>> {
        let stopped = self
            .stack_instances(
                cluster,
                service,
                &[InstanceState::Stopped, InstanceState::Stopping],
            )
            .await?;

        if stopped.is_empty() {
            return Err(FabricError::InstanceNotFound(format!(
                "no stopped instances for {}/{}",
                cluster, service
            )));
        }

        // EC2 refuses to start an instance that is still stopping
        for id in still_stopping(&stopped) {
            self.wait_until_stopped(id).await?;
        }

        let ids: Vec<String> = stopped.iter().map(|i| i.id.clone()).collect();
        info!(cluster = %cluster, service = %service, instances = ?ids, "Starting stopped instances");

        self.client()
            .await
            .start_instances()
            .set_instance_ids(Some(ids.clone()))
            .send()
            .await
            .map_err(FabricError::from_aws)?;

        let mut addrs = Vec::with_capacity(ids.len());
        for id in &ids {
            let instance = self.wait_until_running(id).await?;
            let host = instance.to_allocated(self.mode)?;
            if let Some(addr) = host.reachable_address(self.mode) {
                addrs.push(addr.to_string());
            }
        }
        Ok(addrs)
    }

    async fn stop_stack(&self, cluster: &ClusterId, service: &ServiceId) -> Result<()> {
        let running = self
            .stack_instances(cluster, service, &[InstanceState::Pending, InstanceState::Running])
            .await?;

        if running.is_empty() {
            info!(cluster = %cluster, service = %service, "No running instances to stop");
            return Ok(());
        }

        let ids: Vec<String> = running.into_iter().map(|i| i.id).collect();
        info!(cluster = %cluster, service = %service, instances = ?ids, "Stopping instances");

        self.client()
            .await
            .stop_instances()
            .set_instance_ids(Some(ids))
            .send()
            .await
            .map_err(FabricError::from_aws)?;
        Ok(())
    }

    async fn delete_stack(&self, cluster: &ClusterId, service: &ServiceId) -> Result<()> {
        let live = self
            .stack_instances(
                cluster,
                service,
                &[
                    InstanceState::Pending,
                    InstanceState::Running,
                    InstanceState::Stopping,
                    InstanceState::Stopped,
                ],
            )
            .await?;

        if live.is_empty() {
            info!(cluster = %cluster, service = %service, "No instances to terminate");
            return Ok(());
        }

        let ids: Vec<String> = live.into_iter().map(|i| i.id).collect();
        info!(cluster = %cluster, service = %service, instances = ?ids, "Terminating instances");

        self.client()
            .await
            .terminate_instances()
            .set_instance_ids(Some(ids))
            .send()
            .await
            .map_err(FabricError::from_aws)?;
        Ok(())
    }
}
