//! In-process container runtime with failure injection and call recording

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{AdapterError, AdapterResult, ContainerSpec, ProgressSink, PullProgress, RuntimeAdapter};
use crate::core::{
    ContainerStatus, DaemonInfo, DaemonStatus, HealthStatus, ResourceKind, ResourceRecord,
    ServiceId,
};

/// A call made against the runtime, in the order it was made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Pull(String),
    Create { name: String, start: bool },
    Start(String),
    Stop(String),
    Restart(String),
    Remove { name: String, remove_volumes: bool },
    Status(String),
    DaemonStatus,
    DaemonInfo,
    ListResources,
}

impl RuntimeCall {
    /// Whether the call mutates runtime state
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::Pull(_)
                | Self::Create { .. }
                | Self::Start(_)
                | Self::Stop(_)
                | Self::Restart(_)
                | Self::Remove { .. }
        )
    }
}

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Pull,
    Create,
    Start,
    Stop,
    Restart,
    Remove,
    Status,
    ListResources,
}

#[derive(Debug, Clone)]
struct MemContainer {
    service_id: Option<ServiceId>,
    image: String,
    status: ContainerStatus,
    volumes: Vec<String>,
}

struct MemoryState {
    daemon: DaemonStatus,
    info: DaemonInfo,
    containers: BTreeMap<String, MemContainer>,
    volumes: BTreeMap<String, Option<ServiceId>>,
    networks: BTreeMap<String, Option<ServiceId>>,
    missing_images: HashSet<String>,
    failures: HashMap<FailPoint, String>,
    pull_steps: Vec<PullProgress>,
    calls: Vec<RuntimeCall>,
    latency: Option<Duration>,
    next_id: u64,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            daemon: DaemonStatus::running(),
            info: DaemonInfo {
                cpus: 4,
                cpu_usage_percent: 3.5,
                mem_used: 2 * 1024 * 1024 * 1024,
                mem_total: 8 * 1024 * 1024 * 1024,
            },
            containers: BTreeMap::new(),
            volumes: BTreeMap::new(),
            networks: BTreeMap::new(),
            missing_images: HashSet::new(),
            failures: HashMap::new(),
            pull_steps: vec![
                PullProgress::new("Pulling"),
                PullProgress::new("Pulling").with_progress("50%"),
                PullProgress::new("Pulling").with_progress("100%"),
            ],
            calls: Vec::new(),
            latency: None,
            next_id: 1,
        }
    }
}

/// Deterministic runtime adapter that keeps all state in memory
#[derive(Clone, Default)]
pub struct InMemoryRuntime {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set what the daemon status query reports
    pub fn set_daemon_status(&self, status: DaemonStatus) {
        self.lock().daemon = status;
    }

    pub fn set_daemon_info(&self, info: DaemonInfo) {
        self.lock().info = info;
    }

    /// Make `point` fail with `message` until cleared
    pub fn fail(&self, point: FailPoint, message: impl Into<String>) {
        self.lock().failures.insert(point, message.into());
    }

    pub fn clear_failure(&self, point: FailPoint) {
        self.lock().failures.remove(&point);
    }

    /// Images that the registry does not know
    pub fn mark_image_missing(&self, image: impl Into<String>) {
        self.lock().missing_images.insert(image.into());
    }

    pub fn set_pull_steps(&self, steps: Vec<PullProgress>) {
        self.lock().pull_steps = steps;
    }

    /// Delay applied before every mutating call completes
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Register a runtime object directly, bypassing the lifecycle
    pub fn add_resource(&self, record: ResourceRecord) {
        let mut state = self.lock();
        match record.kind {
            ResourceKind::Container => {
                let name = record.id.clone();
                let id = format!("mem{:06}", state.next_id);
                state.next_id += 1;
                state.containers.insert(
                    name,
                    MemContainer {
                        service_id: record.bound_service_id.clone(),
                        image: record.image.clone().unwrap_or_default(),
                        status: ContainerStatus {
                            running: false,
                            health: HealthStatus::None,
                            container_id: id,
                            ports: Vec::new(),
                        },
                        volumes: Vec::new(),
                    },
                );
            }
            ResourceKind::Volume => {
                state.volumes.insert(record.id, record.bound_service_id);
            }
            ResourceKind::Network => {
                state.networks.insert(record.id, record.bound_service_id);
            }
        }
    }

    /// Flip a container's running flag as if it changed outside the lifecycle
    pub fn set_container_running(&self, name: &str, running: bool) {
        if let Some(container) = self.lock().containers.get_mut(name) {
            container.status.running = running;
        }
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.lock().containers.contains_key(name)
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.lock().volumes.contains_key(name)
    }

    /// Record the call and return the configured failure and latency for it
    fn enter(&self, call: RuntimeCall, point: Option<FailPoint>) -> (Option<String>, Option<Duration>) {
        let mut state = self.lock();
        debug!(?call, "in-memory runtime call");
        state.calls.push(call);
        let failure = point.and_then(|p| state.failures.get(&p).cloned());
        (failure, state.latency)
    }

    async fn settle(&self, latency: Option<Duration>) {
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn require_daemon(&self) -> AdapterResult<()> {
        let state = self.lock();
        if state.daemon.is_running {
            Ok(())
        } else {
            Err(AdapterError::Transport(
                state
                    .daemon
                    .error
                    .clone()
                    .unwrap_or_else(|| "daemon is not running".to_string()),
            ))
        }
    }
}

#[async_trait]
impl RuntimeAdapter for InMemoryRuntime {
    async fn pull_image(&self, image: &str, progress: ProgressSink<'_>) -> AdapterResult<()> {
        let (failure, latency) = self.enter(RuntimeCall::Pull(image.to_string()), Some(FailPoint::Pull));
        self.require_daemon()?;
        let (steps, missing) = {
            let state = self.lock();
            (state.pull_steps.clone(), state.missing_images.contains(image))
        };
        if missing {
            return Err(AdapterError::Failed(format!(
                "manifest for {} not found: manifest unknown",
                image
            )));
        }
        for step in steps {
            progress(step);
            self.settle(latency).await;
        }
        match failure {
            Some(msg) => Err(AdapterError::Failed(msg)),
            None => Ok(()),
        }
    }

    async fn create_and_start_container(
        &self,
        spec: &ContainerSpec,
        start: bool,
    ) -> AdapterResult<String> {
        let (failure, latency) = self.enter(
            RuntimeCall::Create {
                name: spec.name.clone(),
                start,
            },
            Some(FailPoint::Create),
        );
        self.require_daemon()?;
        self.settle(latency).await;
        if let Some(msg) = failure {
            return Err(AdapterError::Failed(msg));
        }

        let mut state = self.lock();
        if state.containers.contains_key(&spec.name) {
            return Err(AdapterError::Failed(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }
        let id = format!("mem{:06}", state.next_id);
        state.next_id += 1;
        for volume in &spec.volumes {
            state
                .volumes
                .insert(volume.name.clone(), Some(spec.service_id.clone()));
        }
        state.containers.insert(
            spec.name.clone(),
            MemContainer {
                service_id: Some(spec.service_id.clone()),
                image: spec.image.clone(),
                status: ContainerStatus {
                    running: start,
                    health: HealthStatus::None,
                    container_id: id.clone(),
                    ports: spec.ports.clone(),
                },
                volumes: spec.volumes.iter().map(|v| v.name.clone()).collect(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, name: &str) -> AdapterResult<()> {
        let (failure, latency) = self.enter(RuntimeCall::Start(name.to_string()), Some(FailPoint::Start));
        self.require_daemon()?;
        self.settle(latency).await;
        if let Some(msg) = failure {
            return Err(AdapterError::Failed(msg));
        }
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| AdapterError::Failed(format!("No such container: {}", name)))?;
        container.status.running = true;
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> AdapterResult<()> {
        let (failure, latency) = self.enter(RuntimeCall::Stop(name.to_string()), Some(FailPoint::Stop));
        self.require_daemon()?;
        self.settle(latency).await;
        if let Some(msg) = failure {
            return Err(AdapterError::Failed(msg));
        }
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| AdapterError::Failed(format!("No such container: {}", name)))?;
        container.status.running = false;
        Ok(())
    }

    async fn restart_container(&self, name: &str) -> AdapterResult<()> {
        let (failure, latency) =
            self.enter(RuntimeCall::Restart(name.to_string()), Some(FailPoint::Restart));
        self.require_daemon()?;
        self.settle(latency).await;
        if let Some(msg) = failure {
            return Err(AdapterError::Failed(msg));
        }
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| AdapterError::Failed(format!("No such container: {}", name)))?;
        container.status.running = true;
        Ok(())
    }

    async fn remove_container(&self, name: &str, remove_volumes: bool) -> AdapterResult<()> {
        let (failure, latency) = self.enter(
            RuntimeCall::Remove {
                name: name.to_string(),
                remove_volumes,
            },
            Some(FailPoint::Remove),
        );
        self.require_daemon()?;
        self.settle(latency).await;
        if let Some(msg) = failure {
            return Err(AdapterError::Failed(msg));
        }
        let mut state = self.lock();
        if let Some(container) = state.containers.remove(name) {
            if remove_volumes {
                for volume in container.volumes {
                    state.volumes.remove(&volume);
                }
            }
        }
        Ok(())
    }

    async fn get_container_status(&self, name: &str) -> AdapterResult<Option<ContainerStatus>> {
        let (failure, _) = self.enter(RuntimeCall::Status(name.to_string()), Some(FailPoint::Status));
        self.require_daemon()?;
        if let Some(msg) = failure {
            return Err(AdapterError::Failed(msg));
        }
        Ok(self.lock().containers.get(name).map(|c| c.status.clone()))
    }

    async fn get_daemon_status(&self) -> AdapterResult<DaemonStatus> {
        self.enter(RuntimeCall::DaemonStatus, None);
        Ok(self.lock().daemon.clone())
    }

    async fn get_daemon_info(&self) -> AdapterResult<DaemonInfo> {
        self.enter(RuntimeCall::DaemonInfo, None);
        self.require_daemon()?;
        Ok(self.lock().info.clone())
    }

    async fn list_resources(&self) -> AdapterResult<Vec<ResourceRecord>> {
        let (failure, _) = self.enter(RuntimeCall::ListResources, Some(FailPoint::ListResources));
        self.require_daemon()?;
        if let Some(msg) = failure {
            return Err(AdapterError::Failed(msg));
        }
        let state = self.lock();
        let containers = state.containers.iter().map(|(name, c)| {
            ResourceRecord::new(ResourceKind::Container, name.clone(), c.service_id.clone())
                .with_image(c.image.clone())
        });
        let volumes = state
            .volumes
            .iter()
            .map(|(name, bound)| ResourceRecord::new(ResourceKind::Volume, name.clone(), bound.clone()));
        let networks = state
            .networks
            .iter()
            .map(|(name, bound)| ResourceRecord::new(ResourceKind::Network, name.clone(), bound.clone()));
        Ok(containers.chain(volumes).chain(networks).collect())
    }
}
