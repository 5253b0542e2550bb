//! Application settings management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Runtime
    /// Docker client binary
    pub docker_binary: String,
    /// Label put on every container, volume and network we create
    pub label_key: String,
    /// Container name prefix, followed by the service id
    pub container_prefix: String,

    // Polling
    /// Daemon health poll interval in seconds
    pub health_poll_secs: u32,
    /// Container status refresh interval in seconds
    pub status_poll_secs: u32,
    /// Daemon info and resource refresh interval in seconds
    pub info_poll_secs: u32,

    // Lifecycle defaults
    /// Start containers right after install
    pub default_start_immediately: bool,
    /// Run the host routing step after install
    pub configure_routing: bool,

    // Advanced
    /// Custom data directory
    pub data_directory: Option<PathBuf>,
    /// Enable debug logging
    pub debug_logging: bool,
    /// Keep lifecycle history for N days (0 = forever)
    pub history_retention_days: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            // Runtime
            docker_binary: "docker".to_string(),
            label_key: "dockyard.service".to_string(),
            container_prefix: "dockyard-".to_string(),

            // Polling
            health_poll_secs: 5,
            status_poll_secs: 5,
            info_poll_secs: 30,

            // Lifecycle defaults
            default_start_immediately: true,
            configure_routing: false,

            // Advanced
            data_directory: None,
            debug_logging: false,
            history_retention_days: 30,
        }
    }
}

impl Settings {
    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("Dockyard")
        })
    }

    /// Get the database file path
    pub fn get_database_path(&self) -> PathBuf {
        self.get_data_directory().join("dockyard.db")
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_secs(self.health_poll_secs as u64)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_secs as u64)
    }

    pub fn info_poll_interval(&self) -> Duration {
        Duration::from_secs(self.info_poll_secs as u64)
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.health_poll_secs = self.health_poll_secs.clamp(1, 300);
        self.status_poll_secs = self.status_poll_secs.clamp(1, 300);
        // Aggregate info is the expensive poll; keep it at least as slow as status
        self.info_poll_secs = self.info_poll_secs.clamp(self.status_poll_secs, 3600);
        if self.docker_binary.trim().is_empty() {
            self.docker_binary = "docker".to_string();
        }
        if self.label_key.trim().is_empty() {
            self.label_key = "dockyard.service".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_clamps_intervals() {
        let mut settings = Settings {
            health_poll_secs: 0,
            status_poll_secs: 10,
            info_poll_secs: 2,
            docker_binary: " ".into(),
            ..Default::default()
        };
        settings.validate();
        assert_eq!(settings.health_poll_secs, 1);
        assert_eq!(settings.info_poll_secs, 10);
        assert_eq!(settings.docker_binary, "docker");
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"status_poll_secs": 7}"#).unwrap();
        assert_eq!(settings.status_poll_secs, 7);
        assert_eq!(settings.info_poll_secs, 30);
        assert_eq!(settings.container_prefix, "dockyard-");
    }

    #[test]
    fn test_data_directory_override() {
        let settings = Settings {
            data_directory: Some(PathBuf::from("/tmp/dockyard")),
            ..Default::default()
        };
        assert_eq!(
            settings.get_database_path(),
            PathBuf::from("/tmp/dockyard/dockyard.db")
        );
    }
}
