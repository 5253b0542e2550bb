//! Dockyard - Lifecycle orchestration for containerized development services
//!
//! Declares a catalog of background services (databases, caches, mail catchers) and
//! drives each through install, start, stop, restart and uninstall against a container
//! runtime, while keeping a read-side cache consistent with what the runtime reports.

pub mod core;
pub mod persistence;
pub mod runtime;

pub use crate::core::{
    Catalog, InstallOptions, LifecycleError, OperationResult, ServiceId, ServiceManager, Settings,
};
pub use crate::persistence::Database;
pub use crate::runtime::{DockerCli, InMemoryRuntime, RuntimeAdapter};

/// Application name constant
pub const APP_NAME: &str = "Dockyard";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
