//! Service model - Declared services and their lifecycle state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a declared service (e.g. `redis`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ServiceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A published port, host side first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub external: u16,
    pub internal: u16,
}

impl PortMapping {
    pub fn new(external: u16, internal: u16) -> Self {
        Self { external, internal }
    }
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.external, self.internal)
    }
}

/// A named volume mounted into the service container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub container_path: String,
}

/// User-adjustable configuration of a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image tag override (defaults to the catalog version)
    #[serde(default)]
    pub version: Option<String>,
    /// Published ports
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Environment variables
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Named volumes
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
}

impl ServiceConfig {
    pub fn with_port(mut self, external: u16, internal: u16) -> Self {
        self.ports.push(PortMapping::new(external, internal));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_volume(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.volumes.push(VolumeMount {
            name: name.into(),
            container_path: path.into(),
        });
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Immutable catalog entry describing an installable service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub id: ServiceId,
    pub display_name: String,
    /// Image repository, without tag
    pub image: String,
    /// Latest version offered by the catalog
    pub version: String,
    pub default_config: ServiceConfig,
    /// Shown to the user after a successful install
    pub post_install_message: Option<String>,
}

impl ServiceDefinition {
    /// Version that an install with `config` will pull
    pub fn version_for<'a>(&'a self, config: &'a ServiceConfig) -> &'a str {
        config.version.as_deref().unwrap_or(&self.version)
    }

    /// Full image reference (`repo:tag`) for `config`
    pub fn image_ref(&self, config: &ServiceConfig) -> String {
        format!("{}:{}", self.image, self.version_for(config))
    }
}

/// Container health as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
    /// No health check configured
    #[default]
    None,
}

impl HealthStatus {
    /// Parse the runtime's health string; unknown values map to `None`
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "starting" => Self::Starting,
            "healthy" => Self::Healthy,
            "unhealthy" => Self::Unhealthy,
            _ => Self::None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::None => "none",
        }
    }
}

/// Runtime view of an installed service's container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub running: bool,
    pub health: HealthStatus,
    pub container_id: String,
    pub ports: Vec<PortMapping>,
}

/// Lifecycle phase of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServicePhase {
    NotInstalled,
    /// Image pull and container creation in progress
    Installing,
    /// Installed with the container stopped
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
    Uninstalling,
}

impl ServicePhase {
    /// Whether an operation is outstanding for the service
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Installing | Self::Starting | Self::Stopping | Self::Restarting | Self::Uninstalling
        )
    }

    pub fn is_settled(&self) -> bool {
        !self.is_transient()
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::NotInstalled => "Not installed",
            Self::Installing => "Installing",
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Restarting => "Restarting",
            Self::Uninstalling => "Uninstalling",
        }
    }
}

impl std::fmt::Display for ServicePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Mutable lifecycle state of a single service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    pub service_id: ServiceId,
    pub phase: ServicePhase,
    pub installed: bool,
    /// Present only while `installed` is true
    pub container_status: Option<ContainerStatus>,
    /// Image tag the container was created from
    pub installed_version: Option<String>,
    /// Error from the most recent failed operation
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Bumped each time an operation begins; reads taken under an older value are stale
    #[serde(default)]
    pub generation: u64,
}

impl ServiceState {
    pub fn new(service_id: ServiceId) -> Self {
        Self {
            service_id,
            phase: ServicePhase::NotInstalled,
            installed: false,
            container_status: None,
            installed_version: None,
            last_error: None,
            updated_at: Utc::now(),
            generation: 0,
        }
    }

    /// Enter a transient phase for an outstanding operation
    pub fn mark_transient(&mut self, phase: ServicePhase) {
        debug_assert!(phase.is_transient());
        self.phase = phase;
        self.generation += 1;
        self.updated_at = Utc::now();
    }

    /// Record a completed install or a discovered container
    pub fn mark_installed(
        &mut self,
        running: bool,
        status: Option<ContainerStatus>,
        version: Option<String>,
    ) {
        self.phase = if running {
            ServicePhase::Running
        } else {
            ServicePhase::Stopped
        };
        self.installed = true;
        self.container_status = status;
        self.installed_version = version;
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    /// Record a container that is now running
    pub fn mark_running(&mut self, status: Option<ContainerStatus>) {
        self.phase = ServicePhase::Running;
        self.apply_container_status(status);
        self.last_error = None;
    }

    /// Record a container that is now stopped
    pub fn mark_stopped(&mut self, status: Option<ContainerStatus>) {
        self.phase = ServicePhase::Stopped;
        self.apply_container_status(status);
        self.last_error = None;
    }

    /// Reset to the pristine not-installed state
    pub fn mark_not_installed(&mut self) {
        self.phase = ServicePhase::NotInstalled;
        self.installed = false;
        self.container_status = None;
        self.installed_version = None;
        self.updated_at = Utc::now();
    }

    /// Return to `settled` after a failed operation
    pub fn revert(&mut self, settled: ServicePhase, error: impl Into<String>) {
        debug_assert!(settled.is_settled());
        self.phase = settled;
        if settled == ServicePhase::NotInstalled {
            self.installed = false;
            self.container_status = None;
            self.installed_version = None;
        }
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// Replace the container status, keeping the invariant that it only exists when installed
    pub fn apply_container_status(&mut self, status: Option<ContainerStatus>) {
        if self.installed {
            self.container_status = status;
        }
        self.updated_at = Utc::now();
    }

    pub fn is_running(&self) -> bool {
        self.phase == ServicePhase::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis() -> ServiceDefinition {
        ServiceDefinition {
            id: ServiceId::from("redis"),
            display_name: "Redis".into(),
            image: "redis".into(),
            version: "7.4".into(),
            default_config: ServiceConfig::default().with_port(6379, 6379),
            post_install_message: None,
        }
    }

    fn status(running: bool) -> ContainerStatus {
        ContainerStatus {
            running,
            health: HealthStatus::None,
            container_id: "abc".into(),
            ports: vec![PortMapping::new(6379, 6379)],
        }
    }

    #[test]
    fn test_image_ref_honors_version_override() {
        let def = redis();
        assert_eq!(def.image_ref(&def.default_config), "redis:7.4");
        let pinned = def.default_config.clone().with_version("6.2");
        assert_eq!(def.image_ref(&pinned), "redis:6.2");
    }

    #[test]
    fn test_transient_phases() {
        assert!(ServicePhase::Installing.is_transient());
        assert!(ServicePhase::Starting.is_transient());
        assert!(ServicePhase::Uninstalling.is_transient());
        assert!(ServicePhase::Running.is_settled());
        assert!(ServicePhase::Stopped.is_settled());
        assert!(ServicePhase::NotInstalled.is_settled());
    }

    #[test]
    fn test_container_status_requires_installed() {
        let mut state = ServiceState::new("redis".into());
        state.apply_container_status(Some(status(true)));
        assert!(state.container_status.is_none());

        state.mark_installed(true, Some(status(true)), Some("7.4".into()));
        assert_eq!(state.phase, ServicePhase::Running);
        assert!(state.container_status.is_some());

        state.mark_not_installed();
        assert!(!state.installed);
        assert!(state.container_status.is_none());
        assert!(state.installed_version.is_none());
    }

    #[test]
    fn test_revert_to_not_installed_drops_partial_state() {
        let mut state = ServiceState::new("redis".into());
        state.mark_transient(ServicePhase::Installing);
        state.revert(ServicePhase::NotInstalled, "pull failed");
        assert_eq!(state.phase, ServicePhase::NotInstalled);
        assert!(!state.installed);
        assert_eq!(state.last_error.as_deref(), Some("pull failed"));
    }

    #[test]
    fn test_health_status_parse() {
        assert_eq!(HealthStatus::parse("healthy"), HealthStatus::Healthy);
        assert_eq!(HealthStatus::parse(" Starting "), HealthStatus::Starting);
        assert_eq!(HealthStatus::parse(""), HealthStatus::None);
    }

    #[test]
    fn test_generation_advances_per_operation() {
        let mut state = ServiceState::new("redis".into());
        assert_eq!(state.generation, 0);
        state.mark_transient(ServicePhase::Installing);
        state.mark_installed(true, Some(status(true)), Some("7.4".into()));
        assert_eq!(state.generation, 1);
        state.mark_transient(ServicePhase::Stopping);
        state.mark_stopped(Some(status(false)));
        assert_eq!(state.generation, 2);
    }
}
