//! Launcher registry
//!
//! Maps a backend identifier of the form `<namespace>/<type-name>` to a
//! factory that builds the launcher from the active configuration. The table
//! is populated explicitly at startup; pointing a controller at another cloud
//! is a configuration change.

use crate::config::FabricConfig;
use crate::launchers::{ec2, static_hosts};
use fabric_core::Launcher;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Builds a launcher, or declines when its configuration is unusable
pub type LauncherFactory = Box<dyn Fn(&FabricConfig) -> Option<Arc<dyn Launcher>> + Send + Sync>;

/// Registered launcher factories, grouped by namespace
#[derive(Default)]
pub struct LauncherRegistry {
    namespaces: HashMap<String, HashMap<String, LauncherFactory>>,
}

impl LauncherRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the launchers shipped in this crate
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ec2::NAMESPACE, ec2::TYPE_NAME, ec2::Ec2Launcher::factory);
        registry.register(
            static_hosts::NAMESPACE,
            static_hosts::TYPE_NAME,
            static_hosts::StaticLauncher::factory,
        );
        registry
    }

    /// Register `factory` as `<namespace>/<type_name>`, replacing any previous entry.
    pub fn register<F>(&mut self, namespace: &str, type_name: &str, factory: F)
    where
        F: Fn(&FabricConfig) -> Option<Arc<dyn Launcher>> + Send + Sync + 'static,
    {
        debug!(namespace = %namespace, type_name = %type_name, "Registering launcher");
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(type_name.to_string(), Box::new(factory));
    }

    /// Whether `identifier` names a registered launcher
    pub fn contains(&self, identifier: &str) -> bool {
        split_identifier(identifier)
            .and_then(|(ns, ty)| self.namespaces.get(ns).map(|types| types.contains_key(ty)))
            .unwrap_or(false)
    }

    /// All registered identifiers, sorted
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .namespaces
            .iter()
            .flat_map(|(ns, types)| types.keys().map(move |ty| format!("{}/{}", ns, ty)))
            .collect();
        ids.sort();
        ids
    }

    /// Construct the launcher registered under `identifier`.
    ///
    /// Returns `None` for malformed or unknown identifiers and when the factory
    /// declines. Never panics; callers treat `None` as fatal.
    pub fn resolve(&self, identifier: &str, config: &FabricConfig) -> Option<Arc<dyn Launcher>> {
        let Some((namespace, type_name)) = split_identifier(identifier) else {
            warn!(identifier = %identifier, "Launcher identifier must be <namespace>/<type-name>");
            return None;
        };

        let Some(factory) = self
            .namespaces
            .get(namespace)
            .and_then(|types| types.get(type_name))
        else {
            warn!(namespace = %namespace, type_name = %type_name, "No such launcher");
            return None;
        };

        let launcher = factory(config);
        if launcher.is_none() {
            warn!(identifier = %identifier, "Launcher factory declined the configuration");
        }
        launcher
    }
}

fn split_identifier(identifier: &str) -> Option<(&str, &str)> {
    let (namespace, type_name) = identifier.trim().split_once('/')?;
    if namespace.is_empty() || type_name.is_empty() || type_name.contains('/') {
        return None;
    }
    Some((namespace, type_name))
}
