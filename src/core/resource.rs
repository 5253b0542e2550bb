//! Runtime resources and daemon metrics

use serde::{Deserialize, Serialize};

use super::service::ServiceId;

/// Kind of runtime-visible object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Container,
    Volume,
    Network,
}

impl ResourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Volume => "volume",
            Self::Network => "network",
        }
    }
}

/// An object the container runtime reports, optionally bound to a service by label
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    pub id: String,
    pub bound_service_id: Option<ServiceId>,
    /// Image reference (`repo:tag`), containers only
    #[serde(default)]
    pub image: Option<String>,
}

impl ResourceRecord {
    pub fn new(kind: ResourceKind, id: impl Into<String>, bound: Option<ServiceId>) -> Self {
        Self {
            kind,
            id: id.into(),
            bound_service_id: bound,
            image: None,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Tag part of the image reference, if any
    pub fn image_version(&self) -> Option<&str> {
        let image = self.image.as_deref()?;
        // A registry port (`host:5000/repo`) is not a tag
        let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
        image[name_start..]
            .rfind(':')
            .map(|i| &image[name_start + i + 1..])
    }
}

impl std::fmt::Display for ResourceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.label(), self.id)
    }
}

/// Availability of the container daemon
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub is_running: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl DaemonStatus {
    pub fn running() -> Self {
        Self {
            is_running: true,
            error: None,
        }
    }

    pub fn down(error: impl Into<String>) -> Self {
        Self {
            is_running: false,
            error: Some(error.into()),
        }
    }

    /// Lifecycle operations are only permitted while this holds
    pub fn is_actionable(&self) -> bool {
        self.is_running && self.error.is_none()
    }
}

/// Basic daemon host metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub cpus: usize,
    /// Host CPU usage percentage (0.0-100.0)
    pub cpu_usage_percent: f32,
    /// Used memory in bytes
    pub mem_used: u64,
    /// Total memory in bytes
    pub mem_total: u64,
}

impl DaemonInfo {
    /// Memory usage percentage
    pub fn memory_percent(&self) -> f32 {
        if self.mem_total > 0 {
            (self.mem_used as f32 / self.mem_total as f32) * 100.0
        } else {
            0.0
        }
    }

    pub fn cpu_string(&self) -> String {
        format!("{:.1}%", self.cpu_usage_percent)
    }

    pub fn memory_string(&self) -> String {
        format!(
            "{} / {}",
            format_bytes(self.mem_used),
            format_bytes(self.mem_total)
        )
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
