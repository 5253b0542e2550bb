//! Progress multiplexer - Per-service install progress fan-out
//!
//! Every service id owns an independent topic holding the most recent event and the
//! queues of its current subscribers. Publishing overwrites the slot and appends to each
//! queue under one lock, so subscribers of a topic observe events in publish order.
//! Clearing a topic drops the slot only: events already queued stay deliverable to the
//! subscribers they were published to, and a subscriber arriving later sees nothing.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::service::ServiceId;

/// One step of a long-running install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallProgressEvent {
    pub service_id: ServiceId,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
}

impl InstallProgressEvent {
    pub fn new(service_id: ServiceId, status: impl Into<String>) -> Self {
        Self {
            service_id,
            status: status.into(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: impl Into<String>) -> Self {
        self.progress = Some(progress.into());
        self
    }
}

#[derive(Default)]
struct SubscriberQueue {
    events: Mutex<VecDeque<InstallProgressEvent>>,
    ready: Notify,
}

impl SubscriberQueue {
    fn events(&self) -> MutexGuard<'_, VecDeque<InstallProgressEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: InstallProgressEvent) {
        self.events().push_back(event);
        self.ready.notify_one();
    }
}

#[derive(Default)]
struct Topic {
    latest: Option<InstallProgressEvent>,
    subscribers: HashMap<u64, Arc<SubscriberQueue>>,
}

impl Topic {
    fn is_idle(&self) -> bool {
        self.latest.is_none() && self.subscribers.is_empty()
    }
}

#[derive(Default)]
struct Inner {
    topics: Mutex<HashMap<ServiceId, Topic>>,
    next_id: AtomicU64,
}

impl Inner {
    fn topics(&self) -> MutexGuard<'_, HashMap<ServiceId, Topic>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_subscriber(&self, service_id: &ServiceId, subscriber: u64) {
        let mut topics = self.topics();
        if let Some(topic) = topics.get_mut(service_id) {
            topic.subscribers.remove(&subscriber);
            if topic.is_idle() {
                topics.remove(service_id);
            }
        }
    }
}

/// Routes install progress to subscribers, keyed by service id
#[derive(Clone, Default)]
pub struct ProgressMultiplexer {
    inner: Arc<Inner>,
}

impl ProgressMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a service's progress; the current slot event (if any) is delivered first
    pub fn subscribe(&self, service_id: &ServiceId) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::default());

        let mut topics = self.inner.topics();
        let topic = topics.entry(service_id.clone()).or_default();
        if let Some(latest) = &topic.latest {
            queue.push(latest.clone());
        }
        topic.subscribers.insert(id, Arc::clone(&queue));
        debug!(service = %service_id, subscriber = id, "progress subscriber added");

        Subscription {
            inner: Arc::clone(&self.inner),
            service_id: service_id.clone(),
            id,
            queue,
        }
    }

    /// Record `event` as the latest for its service and deliver it to every subscriber
    pub fn publish(&self, event: InstallProgressEvent) {
        trace!(service = %event.service_id, status = %event.status, "progress");
        let mut topics = self.inner.topics();
        let topic = topics.entry(event.service_id.clone()).or_default();
        for queue in topic.subscribers.values() {
            queue.push(event.clone());
        }
        topic.latest = Some(event);
    }

    /// Drop the latest event for `service_id`; queued events are still delivered
    pub fn clear(&self, service_id: &ServiceId) {
        let mut topics = self.inner.topics();
        let Some(topic) = topics.get_mut(service_id) else {
            return;
        };
        topic.latest = None;
        if topic.is_idle() {
            topics.remove(service_id);
        }
        debug!(service = %service_id, "progress cleared");
    }

    /// Most recent event for `service_id`, if an install is reporting
    pub fn latest(&self, service_id: &ServiceId) -> Option<InstallProgressEvent> {
        self.inner
            .topics()
            .get(service_id)
            .and_then(|t| t.latest.clone())
    }

    pub fn subscriber_count(&self, service_id: &ServiceId) -> usize {
        self.inner
            .topics()
            .get(service_id)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }

    /// Number of live topics
    pub fn topic_count(&self) -> usize {
        self.inner.topics().len()
    }
}

/// Handle for one subscriber; dropping it unsubscribes
pub struct Subscription {
    inner: Arc<Inner>,
    service_id: ServiceId,
    id: u64,
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    /// Wait for the next event
    pub async fn recv(&mut self) -> InstallProgressEvent {
        loop {
            let next = self.queue.events().pop_front();
            if let Some(event) = next {
                return event;
            }
            self.queue.ready.notified().await;
        }
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<InstallProgressEvent> {
        self.queue.events().pop_front()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.remove_subscriber(&self.service_id, self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("service_id", &self.service_id)
            .field("id", &self.id)
            .finish()
    }
}
