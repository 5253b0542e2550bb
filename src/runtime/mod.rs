//! Runtime boundary - Traits for the container engine and privileged host collaborators
//!
//! The lifecycle core only talks to the container runtime through [`RuntimeAdapter`].
//! Two implementations ship with the crate: [`DockerCli`], which drives the `docker`
//! binary, and [`InMemoryRuntime`], a deterministic stand-in used by tests and dry runs.

mod docker;
mod memory;

pub use docker::DockerCli;
pub use memory::{FailPoint, InMemoryRuntime, RuntimeCall};

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{
    ContainerStatus, DaemonInfo, DaemonStatus, PortMapping, ResourceRecord, ServiceConfig,
    ServiceDefinition, ServiceId, VolumeMount,
};

/// Failure reported by a runtime adapter
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    /// The daemon could not be reached at all
    #[error("{0}")]
    Transport(String),
    /// The daemon answered and refused the request (e.g. image not found)
    #[error("{0}")]
    Failed(String),
}

impl AdapterError {
    pub fn message(&self) -> &str {
        match self {
            Self::Transport(msg) | Self::Failed(msg) => msg,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// One line of image pull progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullProgress {
    pub status: String,
    pub progress: Option<String>,
}

impl PullProgress {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: impl Into<String>) -> Self {
        self.progress = Some(progress.into());
        self
    }
}

/// Callback receiving pull progress, in order
pub type ProgressSink<'a> = &'a (dyn Fn(PullProgress) + Send + Sync);

/// Everything needed to create a service container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub service_id: ServiceId,
    /// Container name, stable per service
    pub name: String,
    pub image: String,
    pub ports: Vec<PortMapping>,
    pub env: Vec<(String, String)>,
    pub volumes: Vec<VolumeMount>,
    /// Labels applied to the container and its volumes
    pub labels: Vec<(String, String)>,
}

impl ContainerSpec {
    pub fn for_service(
        definition: &ServiceDefinition,
        config: &ServiceConfig,
        container_name: String,
        label_key: &str,
    ) -> Self {
        Self {
            service_id: definition.id.clone(),
            name: container_name,
            image: definition.image_ref(config),
            ports: config.ports.clone(),
            env: config.env.clone(),
            volumes: config.volumes.clone(),
            labels: vec![(label_key.to_string(), definition.id.to_string())],
        }
    }
}

/// Lifecycle verbs and queries against the container runtime.
///
/// Implementations must be safe for concurrent use across distinct containers.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Pull `image`, reporting progress through `progress`
    async fn pull_image(&self, image: &str, progress: ProgressSink<'_>) -> AdapterResult<()>;

    /// Create the container (and its volumes) and optionally start it; returns the container id
    async fn create_and_start_container(
        &self,
        spec: &ContainerSpec,
        start: bool,
    ) -> AdapterResult<String>;

    async fn start_container(&self, name: &str) -> AdapterResult<()>;

    async fn stop_container(&self, name: &str) -> AdapterResult<()>;

    async fn restart_container(&self, name: &str) -> AdapterResult<()> {
        self.stop_container(name).await?;
        self.start_container(name).await
    }

    /// Remove the container; `remove_volumes` also removes its named volumes
    async fn remove_container(&self, name: &str, remove_volumes: bool) -> AdapterResult<()>;

    /// `None` when no such container exists
    async fn get_container_status(&self, name: &str) -> AdapterResult<Option<ContainerStatus>>;

    async fn get_daemon_status(&self) -> AdapterResult<DaemonStatus>;

    async fn get_daemon_info(&self) -> AdapterResult<DaemonInfo>;

    /// Containers, volumes and networks carrying the service label
    async fn list_resources(&self) -> AdapterResult<Vec<ResourceRecord>>;
}

/// Why a host routing step did not complete
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    /// The user declined the privilege prompt
    #[error("{0}")]
    Denied(String),
    #[error("{0}")]
    Failed(String),
}

/// Privileged host networking (hosts-file entries, port forwarding, certificates)
#[async_trait]
pub trait HostRouter: Send + Sync {
    async fn ensure_route(
        &self,
        definition: &ServiceDefinition,
        config: &ServiceConfig,
    ) -> Result<(), RoutingError>;

    async fn remove_route(&self, service_id: &ServiceId) -> Result<(), RoutingError>;
}
