//! Daemon health monitor - Polls container daemon availability and host metrics

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::error::LifecycleError;
use super::observer::LifecycleObserver;
use super::resource::{DaemonInfo, DaemonStatus};
use crate::runtime::RuntimeAdapter;

/// Last polled daemon status, with staleness annotation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaemonSnapshot {
    pub status: DaemonStatus,
    pub checked_at: DateTime<Utc>,
    /// Older than twice the poll interval
    pub stale: bool,
}

impl DaemonSnapshot {
    pub fn is_actionable(&self) -> bool {
        self.status.is_actionable()
    }
}

struct Observation {
    status: DaemonStatus,
    checked_at: DateTime<Utc>,
    observed: Instant,
}

struct Inner {
    adapter: Arc<dyn RuntimeAdapter>,
    interval: Duration,
    last: RwLock<Option<Observation>>,
    info: RwLock<Option<DaemonInfo>>,
    observers: Vec<Arc<dyn LifecycleObserver>>,
    started: AtomicBool,
}

/// Tracks whether lifecycle actions may run against the daemon
#[derive(Clone)]
pub struct DaemonHealthMonitor {
    inner: Arc<Inner>,
}

impl DaemonHealthMonitor {
    pub fn new(adapter: Arc<dyn RuntimeAdapter>, interval: Duration) -> Self {
        Self::with_observers(adapter, interval, Vec::new())
    }

    pub fn with_observers(
        adapter: Arc<dyn RuntimeAdapter>,
        interval: Duration,
        observers: Vec<Arc<dyn LifecycleObserver>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                adapter,
                interval,
                last: RwLock::new(None),
                info: RwLock::new(None),
                observers,
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Query the daemon once. Adapter failures count as "not running"; no retry.
    pub async fn poll(&self) -> DaemonStatus {
        let status = match self.inner.adapter.get_daemon_status().await {
            Ok(status) => status,
            Err(e) => DaemonStatus::down(e.message()),
        };
        trace!(running = status.is_running, "daemon polled");

        let previous = {
            let mut last = self.inner.last.write().unwrap_or_else(PoisonError::into_inner);
            let previous = last.as_ref().map(|o| o.status.clone());
            *last = Some(Observation {
                status: status.clone(),
                checked_at: Utc::now(),
                observed: Instant::now(),
            });
            previous
        };

        let changed = previous
            .map(|p| p.is_actionable() != status.is_actionable())
            .unwrap_or(true);
        if changed {
            for observer in &self.inner.observers {
                observer.on_daemon_status(&status);
            }
        }
        status
    }

    /// Refresh host metrics; skipped while the daemon is not actionable
    pub async fn poll_info(&self) -> Option<DaemonInfo> {
        if !self.is_actionable() {
            return None;
        }
        match self.inner.adapter.get_daemon_info().await {
            Ok(info) => {
                *self.inner.info.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(info.clone());
                Some(info)
            }
            Err(e) => {
                warn!("Failed to read daemon info: {}", e);
                None
            }
        }
    }

    /// `None` until the first poll completes
    pub fn snapshot(&self) -> Option<DaemonSnapshot> {
        let last = self.inner.last.read().unwrap_or_else(PoisonError::into_inner);
        last.as_ref().map(|o| DaemonSnapshot {
            status: o.status.clone(),
            checked_at: o.checked_at,
            stale: o.observed.elapsed() > self.inner.interval * 2,
        })
    }

    /// Last known status permits lifecycle actions; false before the first poll
    pub fn is_actionable(&self) -> bool {
        self.inner
            .last
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|o| o.status.is_actionable())
            .unwrap_or(false)
    }

    pub fn require_actionable(&self) -> Result<(), LifecycleError> {
        match self.snapshot() {
            Some(snapshot) if snapshot.is_actionable() => Ok(()),
            Some(snapshot) => Err(LifecycleError::DaemonUnavailable(snapshot.status.error)),
            None => Err(LifecycleError::DaemonUnavailable(None)),
        }
    }

    pub fn info(&self) -> Option<DaemonInfo> {
        self.inner
            .info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start the fixed-interval poll loop. Returns `None` if it is already running.
    pub fn spawn(&self) -> Option<JoinHandle<()>> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("Daemon health loop already running");
            return None;
        }
        let monitor = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.inner.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.poll().await;
            }
        }))
    }
}
