//! Lifecycle errors and the result object handed to the presentation layer

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::service::{ServiceId, ServicePhase};
use crate::runtime::AdapterError;

/// Text shown when a failure carries no message of its own
pub const UNKNOWN_ERROR: &str = "unknown error";

/// Why a lifecycle operation did not succeed
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LifecycleError {
    /// Daemon not running or unreachable at the last poll
    #[error("container daemon is unavailable{}", detail_suffix(.0))]
    DaemonUnavailable(Option<String>),

    /// Another operation is outstanding for the same service
    #[error("an operation is already in progress for {service} ({phase})")]
    OperationInProgress {
        service: ServiceId,
        phase: ServicePhase,
    },

    /// The verb is not legal from the current phase
    #[error("cannot {verb} {service} while {phase}")]
    InvalidTransition {
        service: ServiceId,
        phase: ServicePhase,
        verb: Verb,
    },

    /// The runtime adapter reported a failure; message passed through verbatim
    #[error("{0}")]
    RuntimeOperationFailed(String),

    /// A privileged collaborator step was declined
    #[error("privileged operation denied: {0}")]
    PrivilegedOperationDenied(String),

    #[error("unknown service: {0}")]
    UnknownService(ServiceId),

    /// The configuration store rejected a write
    #[error("configuration error: {0}")]
    Config(String),
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail
        .as_deref()
        .map(|d| format!(": {}", d))
        .unwrap_or_default()
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DaemonUnavailable(_) => ErrorKind::DaemonUnavailable,
            Self::OperationInProgress { .. } => ErrorKind::OperationInProgress,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::RuntimeOperationFailed(_) => ErrorKind::RuntimeOperationFailed,
            Self::PrivilegedOperationDenied(_) => ErrorKind::PrivilegedOperationDenied,
            Self::UnknownService(_) => ErrorKind::UnknownService,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Text for display: adapter messages verbatim, otherwise the kind name
    pub fn display_text(&self) -> String {
        match self {
            Self::RuntimeOperationFailed(msg)
            | Self::PrivilegedOperationDenied(msg)
            | Self::Config(msg) => {
                if msg.trim().is_empty() {
                    UNKNOWN_ERROR.to_string()
                } else {
                    msg.clone()
                }
            }
            other => other.kind().as_str().to_string(),
        }
    }
}

impl From<AdapterError> for LifecycleError {
    fn from(err: AdapterError) -> Self {
        Self::RuntimeOperationFailed(err.message().to_string())
    }
}

/// Stable error category exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    DaemonUnavailable,
    OperationInProgress,
    InvalidTransition,
    RuntimeOperationFailed,
    PrivilegedOperationDenied,
    UnknownService,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DaemonUnavailable => "DaemonUnavailable",
            Self::OperationInProgress => "OperationInProgress",
            Self::InvalidTransition => "InvalidTransition",
            Self::RuntimeOperationFailed => "RuntimeOperationFailed",
            Self::PrivilegedOperationDenied => "PrivilegedOperationDenied",
            Self::UnknownService => "UnknownService",
            Self::Config => "Config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle verbs, used in transition errors and history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    Install,
    Start,
    Stop,
    Restart,
    Uninstall,
    UpdateConfig,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Uninstall => "uninstall",
            Self::UpdateConfig => "update config",
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a mutating call, shaped for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    /// Service-supplied message shown after success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OperationResult {
    pub fn ok(message: Option<String>) -> Self {
        Self {
            success: true,
            error: None,
            kind: None,
            message,
        }
    }

    pub fn failure(error: &LifecycleError) -> Self {
        Self {
            success: false,
            error: Some(error.display_text()),
            kind: Some(error.kind()),
            message: None,
        }
    }
}

impl From<Result<Option<String>, LifecycleError>> for OperationResult {
    fn from(result: Result<Option<String>, LifecycleError>) -> Self {
        match result {
            Ok(message) => Self::ok(message),
            Err(e) => Self::failure(&e),
        }
    }
}
