//! Fabric Core - Shared types and traits
//!
//! This crate defines the core abstractions used across:
//! - fabric-controller (lifecycle orchestration)
//! - launcher backends (EC2, static host pools, out-of-tree providers)
//!
//! Key types:
//! - Launcher trait (interface for VM-level backends)
//! - Container, ContainerSpec and stack allocation types
//! - Error types

pub mod types;
pub mod traits;
pub mod error;

pub use types::*;
pub use traits::*;
pub use error::*;
