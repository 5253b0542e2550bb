//! Cache poller - Background refresh of container status and aggregate runtime info

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use super::lifecycle::ServiceManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollKind {
    /// Per-service container status
    Status,
    /// Daemon metrics and resource listing
    Info,
}

/// Configures and spawns the two independent refresh loops
pub struct CachePoller {
    manager: Arc<ServiceManager>,
    status_interval: Duration,
    info_interval: Duration,
}

impl CachePoller {
    pub fn new(manager: Arc<ServiceManager>) -> Self {
        let settings = manager.settings();
        let status_interval = settings.status_poll_interval();
        let info_interval = settings.info_poll_interval();
        Self {
            manager,
            status_interval,
            info_interval,
        }
    }

    pub fn with_intervals(mut self, status: Duration, info: Duration) -> Self {
        self.status_interval = status;
        self.info_interval = info;
        self
    }

    /// Spawn both loops, initially visible
    pub fn spawn(self) -> PollerHandle {
        let (visible, rx) = watch::channel(true);
        let tasks = vec![
            tokio::spawn(run_loop(
                Arc::clone(&self.manager),
                PollKind::Status,
                self.status_interval,
                rx.clone(),
            )),
            tokio::spawn(run_loop(
                self.manager,
                PollKind::Info,
                self.info_interval,
                rx,
            )),
        ];
        PollerHandle { visible, tasks }
    }
}

/// Controls running poll loops; dropping it stops them
pub struct PollerHandle {
    visible: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PollerHandle {
    /// Suspend polling while the consuming surface is hidden; resuming refreshes at once
    pub fn set_visible(&self, visible: bool) {
        self.visible.send_replace(visible);
    }

    pub fn is_visible(&self) -> bool {
        *self.visible.borrow()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn run_loop(
    manager: Arc<ServiceManager>,
    kind: PollKind,
    period: Duration,
    mut visible: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(?kind, ?period, "poll loop started");

    loop {
        if *visible.borrow_and_update() {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = visible.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }
        } else {
            trace!(?kind, "poll loop suspended");
            loop {
                if visible.changed().await.is_err() {
                    return;
                }
                if *visible.borrow_and_update() {
                    break;
                }
            }
            ticker.reset();
        }

        if !manager.health().is_actionable() {
            trace!(?kind, "daemon not actionable, skipping poll");
            continue;
        }
        poll_once(&manager, kind).await;
    }
}

async fn poll_once(manager: &ServiceManager, kind: PollKind) {
    match kind {
        PollKind::Status => match manager.refresh_container_states().await {
            Ok(changed) if changed > 0 => debug!("{} container states changed", changed),
            Ok(_) => {}
            Err(e) => warn!("Container status refresh failed: {}", e),
        },
        PollKind::Info => {
            manager.health().poll_info().await;
            if let Err(e) = manager.refresh_resources().await {
                warn!("Resource refresh failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{InstallOptions, ServiceId, ServicePhase};
    use crate::runtime::{InMemoryRuntime, RuntimeCall};

    const HOUR: Duration = Duration::from_secs(3600);

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_visibility_return_refreshes_immediately() {
        let runtime = InMemoryRuntime::new();
        let manager = Arc::new(ServiceManager::builder(Arc::new(runtime.clone())).build());
        manager.health().poll().await;
        let redis = ServiceId::from("redis");
        assert!(manager.install(&redis, InstallOptions::default()).await.success);

        let handle = CachePoller::new(Arc::clone(&manager))
            .with_intervals(HOUR, HOUR)
            .spawn();
        settle().await;

        handle.set_visible(false);
        settle().await;
        runtime.set_container_running("dockyard-redis", false);
        runtime.clear_calls();
        settle().await;
        assert!(runtime.calls().is_empty());
        assert_eq!(manager.state(&redis).unwrap().phase, ServicePhase::Running);

        handle.set_visible(true);
        settle().await;
        assert_eq!(manager.state(&redis).unwrap().phase, ServicePhase::Stopped);
        assert!(runtime.calls().contains(&RuntimeCall::ListResources));
    }

    #[tokio::test]
    async fn test_skips_while_daemon_down() {
        let runtime = InMemoryRuntime::new();
        runtime.set_daemon_status(crate::core::DaemonStatus::down("stopped"));
        let manager = Arc::new(ServiceManager::builder(Arc::new(runtime.clone())).build());
        manager.health().poll().await;
        runtime.clear_calls();

        let _handle = CachePoller::new(manager)
            .with_intervals(Duration::from_millis(5), Duration::from_millis(5))
            .spawn();
        settle().await;
        assert!(runtime.calls().is_empty());
    }
}
