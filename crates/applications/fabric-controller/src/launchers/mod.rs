//! Launcher backends shipped with the controller
//!
//! Each backend exports `NAMESPACE` and `TYPE_NAME`; together they form the
//! identifier used in `system.mode`.

pub mod ec2;
pub mod static_hosts;

pub use ec2::{Ec2Launcher, Ec2LauncherConfig};
pub use static_hosts::{StaticHost, StaticHostsConfig, StaticLauncher};
