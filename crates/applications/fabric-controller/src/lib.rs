//! # Fabric Controller
//!
//! Lifecycle orchestration for clusters of VM/container pairs on a pluggable
//! cloud backend.
//!
//! ## Architecture
//!
//! ```text
//! caller ──► FabricController ──► Launcher (VM level: alloc/stop/delete/restart)
//!                  │
//!                  ├──► RemoteExecutor (ssh/scp with transient-error retry)
//!                  ├──► ContainerRuntime (docker over ssh)
//!                  └──► Inspector (container handles)
//! ```
//!
//! The launcher is picked once at startup from the `system.mode` identifier
//! through the [`LauncherRegistry`]. The controller never provisions VMs except
//! through the launcher, and never reaches a host except through the executor.
//!
//! ## Addressing
//!
//! In proxy mode the controller sits on the private network and every
//! container is reached on its private address. Otherwise containers are
//! reached on their public address. See [`fabric_core::AddressingMode`].

#![warn(clippy::all)]

pub mod config;
pub mod controller;
pub mod inspector;
pub mod launchers;
pub mod logging;
pub mod registry;
pub mod remote;
pub mod runtime;

// ============================================================================
// Public exports
// ============================================================================

pub use config::{FabricConfig, LoggingConfig, RemoteConfig, SystemConfig};
pub use controller::{FabricController, FabricControllerBuilder, HostResult};
pub use inspector::Inspector;
pub use launchers::{Ec2Launcher, Ec2LauncherConfig, StaticHost, StaticHostsConfig, StaticLauncher};
pub use logging::init_tracing;
pub use registry::{LauncherFactory, LauncherRegistry};
pub use remote::{CommandOutput, RemoteExecutor, RetryPolicy, SshTransport, TransientFailure, Transport};
pub use runtime::{ContainerRuntime, DockerCli, RunRequest, StartRequest};
