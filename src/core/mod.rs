//! Core module - Service lifecycle, state reconciliation and daemon monitoring

mod cache;
mod catalog;
mod error;
mod health;
mod lifecycle;
mod observer;
mod poller;
mod progress;
mod reconcile;
pub mod resource;
mod service;
pub mod settings;
mod store;

pub use cache::{CacheKey, ReconciliationCache, ServiceDetail, ServiceSummary, Versioned};
pub use catalog::Catalog;
pub use error::{ErrorKind, LifecycleError, OperationResult, Verb, UNKNOWN_ERROR};
pub use health::{DaemonHealthMonitor, DaemonSnapshot};
pub use lifecycle::{transition_for, InstallOptions, ServiceManager, ServiceManagerBuilder};
pub use observer::{LifecycleObserver, TracingObserver};
pub use poller::{CachePoller, PollerHandle};
pub use progress::{InstallProgressEvent, ProgressMultiplexer, Subscription};
pub use reconcile::{reconcile, Badge, ReconcileReport};
pub use resource::{format_bytes, DaemonInfo, DaemonStatus, ResourceKind, ResourceRecord};
pub use service::{
    ContainerStatus, HealthStatus, PortMapping, ServiceConfig, ServiceDefinition, ServiceId,
    ServicePhase, ServiceState, VolumeMount,
};
pub use settings::Settings;
pub use store::{ConfigStore, MemoryConfigStore};
