//! Lifecycle observers - Hooks fired on transitions and daemon status changes

use tracing::{info, warn};

use super::error::{OperationResult, Verb};
use super::resource::DaemonStatus;
use super::service::{ServiceId, ServicePhase};

/// Receives lifecycle notifications. All methods default to no-ops.
///
/// Called synchronously from the lifecycle path, so implementations must not block.
pub trait LifecycleObserver: Send + Sync {
    fn on_transition(&self, _service_id: &ServiceId, _from: ServicePhase, _to: ServicePhase) {}

    fn on_operation_complete(
        &self,
        _service_id: &ServiceId,
        _verb: Verb,
        _result: &OperationResult,
    ) {
    }

    fn on_daemon_status(&self, _status: &DaemonStatus) {}
}

/// Default observer that writes to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl LifecycleObserver for TracingObserver {
    fn on_transition(&self, service_id: &ServiceId, from: ServicePhase, to: ServicePhase) {
        info!("{}: {} -> {}", service_id, from, to);
    }

    fn on_operation_complete(&self, service_id: &ServiceId, verb: Verb, result: &OperationResult) {
        if result.success {
            info!("{} {} succeeded", verb, service_id);
        } else {
            warn!(
                "{} {} failed: {}",
                verb,
                service_id,
                result.error.as_deref().unwrap_or_default()
            );
        }
    }

    fn on_daemon_status(&self, status: &DaemonStatus) {
        if status.is_actionable() {
            info!("Container daemon is available");
        } else {
            warn!(
                "Container daemon is unavailable: {}",
                status.error.as_deref().unwrap_or("not running")
            );
        }
    }
}
