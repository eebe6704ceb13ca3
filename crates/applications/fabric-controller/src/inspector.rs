//! Container handle construction
//!
//! VMs run containers with physical (host) networking, so every exposed port
//! maps 1:1 onto the same port on all host interfaces. Bridged networking
//! would need real port remapping; that is not supported here.

use fabric_core::{Container, LaunchParams, PortBinding};
use std::collections::BTreeMap;

/// Builds normalized [`Container`] handles from launch parameters
#[derive(Debug, Clone, Copy, Default)]
pub struct Inspector;

impl Inspector {
    pub fn new() -> Self {
        Self
    }

    /// Describe a freshly started container.
    ///
    /// Addresses are left unset; the controller applies its addressing mode.
    pub fn inspect(
        &self,
        image: &str,
        container_id: Option<&str>,
        params: &LaunchParams,
        server: &str,
    ) -> Container {
        tracing::debug!(
            server = %server,
            hostname = %params.hostname,
            ports = ?params.open_ports,
            "Inspecting container"
        );

        let ports: BTreeMap<u16, PortBinding> = params
            .open_ports
            .iter()
            .map(|&port| (port, PortBinding::any(port)))
            .collect();

        Container {
            container: container_id.map(str::to_string),
            image: image.to_string(),
            service_type: params.service_type.clone(),
            host_name: params.hostname.clone(),
            ports,
            volumes: params.volumes.clone(),
            args: params.args.clone(),
            keydir: params.keydir.clone(),
            keyname: params.keyname.clone(),
            privatekey: params.privatekey.clone(),
            ..Default::default()
        }
    }
}
