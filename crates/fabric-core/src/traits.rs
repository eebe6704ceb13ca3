//! Core traits for the fabric
//!
//! The Launcher trait defines the interface every VM backend must implement.
//! The controller provisions and tears down VMs through this interface ONLY.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::*;

/// All VM backends must implement this trait.
///
/// A launcher owns the administrative SSH identity used for host-level access,
/// which is distinct from the per-container keys handed to end users.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Logical name of the administrative key; the key file lives at
    /// `<key_root>/<ssh_key>.pem`.
    fn ssh_key(&self) -> &str;

    /// Login user for administrative access to the VMs
    fn ssh_user(&self) -> &str;

    /// Provision VM-level resources for `specs` under the given addressing mode.
    async fn alloc(
        &self,
        cluster: &ClusterId,
        service: &ServiceId,
        specs: &[ContainerSpec],
        ctype: &str,
        mode: AddressingMode,
    ) -> Result<StackAllocation>;

    /// Start previously stopped VMs and return the addresses now reachable.
    async fn restart_stack(&self, cluster: &ClusterId, service: &ServiceId) -> Result<Vec<String>>;

    /// Stop the VMs without releasing them.
    async fn stop_stack(&self, cluster: &ClusterId, service: &ServiceId) -> Result<()>;

    /// Irreversibly release the VMs.
    async fn delete_stack(&self, cluster: &ClusterId, service: &ServiceId) -> Result<()>;
}
