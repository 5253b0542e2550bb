//! Reconciliation cache - Versioned read-side views of service and runtime state
//!
//! Entries are filled lazily on read and dropped by `invalidate`. Every key carries a
//! generation counter bumped on invalidation; a load that started before an
//! invalidation of its key is discarded instead of stored, so a read that raced a
//! mutation can never reinstate pre-mutation data.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::catalog::Catalog;
use super::error::LifecycleError;
use super::reconcile::{reconcile, Badge, ReconcileReport};
use super::resource::ResourceRecord;
use super::service::{
    ContainerStatus, PortMapping, ServiceConfig, ServiceDefinition, ServiceId, ServicePhase,
    ServiceState,
};
use super::store::ConfigStore;
use crate::runtime::RuntimeAdapter;

pub(crate) type SharedStates = Arc<RwLock<BTreeMap<ServiceId, ServiceState>>>;

/// Identifies one cached view
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    List,
    Detail(ServiceId),
    ContainerState(ServiceId),
    Resources,
}

/// A cached value with its version and fetch time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Versioned<T> {
    pub value: T,
    /// Monotonic across the whole cache
    pub version: u64,
    pub fetched_at: DateTime<Utc>,
}

/// One row of the service list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSummary {
    pub id: ServiceId,
    pub display_name: String,
    pub phase: ServicePhase,
    pub installed: bool,
    pub running: bool,
    pub installed_version: Option<String>,
    pub latest_version: String,
    pub ports: Vec<PortMapping>,
}

/// Everything shown for a single service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDetail {
    pub definition: ServiceDefinition,
    pub state: ServiceState,
    pub config: ServiceConfig,
}

impl PartialEq for ServiceDetail {
    fn eq(&self, other: &Self) -> bool {
        self.definition.id == other.definition.id
            && self.state == other.state
            && self.config == other.config
    }
}

#[derive(Default)]
struct Entries {
    list: Option<Versioned<Vec<ServiceSummary>>>,
    details: HashMap<ServiceId, Versioned<ServiceDetail>>,
    containers: HashMap<ServiceId, Versioned<Option<ContainerStatus>>>,
    resources: Option<Versioned<Vec<ResourceRecord>>>,
    generations: HashMap<CacheKey, u64>,
}

impl Entries {
    fn generation(&self, key: &CacheKey) -> u64 {
        self.generations.get(key).copied().unwrap_or(0)
    }

    fn remove(&mut self, key: &CacheKey) {
        match key {
            CacheKey::List => self.list = None,
            CacheKey::Detail(id) => {
                self.details.remove(id);
            }
            CacheKey::ContainerState(id) => {
                self.containers.remove(id);
            }
            CacheKey::Resources => self.resources = None,
        }
        *self.generations.entry(key.clone()).or_insert(0) += 1;
    }
}

/// Read-optimized view of "what the user sees"
pub struct ReconciliationCache {
    catalog: Arc<Catalog>,
    states: SharedStates,
    adapter: Arc<dyn RuntimeAdapter>,
    configs: Arc<dyn ConfigStore>,
    container_prefix: String,
    entries: RwLock<Entries>,
    version: AtomicU64,
    /// Report memoized against the resources version it was computed from
    report: Mutex<Option<(u64, ReconcileReport)>>,
}

impl ReconciliationCache {
    pub(crate) fn new(
        catalog: Arc<Catalog>,
        states: SharedStates,
        adapter: Arc<dyn RuntimeAdapter>,
        configs: Arc<dyn ConfigStore>,
        container_prefix: String,
    ) -> Self {
        Self {
            catalog,
            states,
            adapter,
            configs,
            container_prefix,
            entries: RwLock::new(Entries::default()),
            version: AtomicU64::new(0),
            report: Mutex::new(None),
        }
    }

    /// Runtime container name for a service
    pub fn container_name(&self, service_id: &ServiceId) -> String {
        format!("{}{}", self.container_prefix, service_id)
    }

    fn versioned<T>(&self, value: T) -> Versioned<T> {
        Versioned {
            value,
            version: self.version.fetch_add(1, Ordering::SeqCst) + 1,
            fetched_at: Utc::now(),
        }
    }

    fn generation(&self, key: &CacheKey) -> u64 {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation(key)
    }

    /// Store `value` unless `key` was invalidated since `generation` was read
    fn store(&self, key: &CacheKey, generation: u64, store: impl FnOnce(&mut Entries)) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.generation(key) == generation {
            store(&mut entries);
        } else {
            debug!(?key, "discarding load raced by invalidation");
        }
    }

    fn state_of(&self, service_id: &ServiceId) -> Option<ServiceState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service_id)
            .cloned()
    }

    /// Stored configuration, or the catalog default when none was saved
    pub fn effective_config(
        &self,
        definition: &ServiceDefinition,
    ) -> Result<ServiceConfig, LifecycleError> {
        self.configs
            .load_config(&definition.id)
            .map(|c| c.unwrap_or_else(|| definition.default_config.clone()))
            .map_err(|e| LifecycleError::Config(format!("{:#}", e)))
    }

    /// Every declared service with its current phase
    pub fn list(&self) -> Versioned<Vec<ServiceSummary>> {
        let generation = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(list) = &entries.list {
                return list.clone();
            }
            entries.generation(&CacheKey::List)
        };

        let summaries: Vec<ServiceSummary> = {
            let states = self.states.read().unwrap_or_else(PoisonError::into_inner);
            self.catalog
                .iter()
                .filter_map(|def| {
                    let state = states.get(&def.id)?;
                    Some(ServiceSummary {
                        id: def.id.clone(),
                        display_name: def.display_name.clone(),
                        phase: state.phase,
                        installed: state.installed,
                        running: state.is_running(),
                        installed_version: state.installed_version.clone(),
                        latest_version: def.version.clone(),
                        ports: state
                            .container_status
                            .as_ref()
                            .map(|s| s.ports.clone())
                            .unwrap_or_default(),
                    })
                })
                .collect()
        };

        let list = self.versioned(summaries);
        self.store(&CacheKey::List, generation, |e| e.list = Some(list.clone()));
        list
    }

    /// Definition, state and configuration of one service
    pub fn detail(
        &self,
        service_id: &ServiceId,
    ) -> Result<Versioned<ServiceDetail>, LifecycleError> {
        let key = CacheKey::Detail(service_id.clone());
        let generation = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(detail) = entries.details.get(service_id) {
                return Ok(detail.clone());
            }
            entries.generation(&key)
        };

        let definition = self
            .catalog
            .get(service_id)
            .ok_or_else(|| LifecycleError::UnknownService(service_id.clone()))?;
        let state = self
            .state_of(service_id)
            .ok_or_else(|| LifecycleError::UnknownService(service_id.clone()))?;
        let config = self.effective_config(definition)?;

        let detail = self.versioned(ServiceDetail {
            definition: definition.clone(),
            state,
            config,
        });
        self.store(&key, generation, |e| {
            e.details.insert(service_id.clone(), detail.clone());
        });
        Ok(detail)
    }

    /// Runtime container status, falling back to the recorded one if the runtime errors
    pub async fn container_state(
        &self,
        service_id: &ServiceId,
    ) -> Result<Versioned<Option<ContainerStatus>>, LifecycleError> {
        let key = CacheKey::ContainerState(service_id.clone());
        let generation = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(status) = entries.containers.get(service_id) {
                return Ok(status.clone());
            }
            entries.generation(&key)
        };

        let recorded = self
            .state_of(service_id)
            .ok_or_else(|| LifecycleError::UnknownService(service_id.clone()))?;
        let name = self.container_name(service_id);
        let status = match self.adapter.get_container_status(&name).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Container status for {} unavailable: {}", service_id, e);
                recorded.container_status
            }
        };

        let status = self.versioned(status);
        self.store(&key, generation, |e| {
            e.containers.insert(service_id.clone(), status.clone());
        });
        Ok(status)
    }

    /// Labeled runtime resources, fetched on first use
    pub async fn resources(&self) -> Result<Versioned<Vec<ResourceRecord>>, LifecycleError> {
        let cached = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resources
            .clone();
        match cached {
            Some(resources) => Ok(resources),
            None => self.refresh_resources().await,
        }
    }

    /// Re-list runtime resources regardless of what is cached
    pub async fn refresh_resources(
        &self,
    ) -> Result<Versioned<Vec<ResourceRecord>>, LifecycleError> {
        let generation = self.generation(&CacheKey::Resources);
        let records = self.adapter.list_resources().await?;
        let resources = self.versioned(records);
        self.store(&CacheKey::Resources, generation, |e| {
            e.resources = Some(resources.clone())
        });
        Ok(resources)
    }

    /// Orphans and updates, recomputed only when the resource data changed
    pub async fn report(&self) -> Result<ReconcileReport, LifecycleError> {
        let resources = self.resources().await?;
        let mut memo = self.report.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((version, report)) = memo.as_ref() {
            if *version == resources.version {
                return Ok(report.clone());
            }
        }
        let report = reconcile(&self.catalog, &resources.value);
        debug!(
            orphans = report.orphans.len(),
            updatable = report.updatable.len(),
            "reconciled resources"
        );
        *memo = Some((resources.version, report.clone()));
        Ok(report)
    }

    pub async fn badge(&self) -> Result<Option<Badge>, LifecycleError> {
        Ok(Badge::from_report(&self.report().await?))
    }

    /// Drop the given entries, in order
    pub fn invalidate(&self, keys: &[CacheKey]) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            entries.remove(key);
        }
        debug!(?keys, "cache invalidated");
    }

    /// Version of the cached entry for `key`, if one is held
    pub fn entry_version(&self, key: &CacheKey) -> Option<u64> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match key {
            CacheKey::List => entries.list.as_ref().map(|v| v.version),
            CacheKey::Detail(id) => entries.details.get(id).map(|v| v.version),
            CacheKey::ContainerState(id) => entries.containers.get(id).map(|v| v.version),
            CacheKey::Resources => entries.resources.as_ref().map(|v| v.version),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MemoryConfigStore, ResourceKind};
    use crate::runtime::{FailPoint, InMemoryRuntime, RuntimeCall};

    fn cache(runtime: &InMemoryRuntime) -> ReconciliationCache {
        let catalog = Arc::new(Catalog::builtin());
        let states: BTreeMap<_, _> = catalog
            .ids()
            .map(|id| (id.clone(), ServiceState::new(id.clone())))
            .collect();
        ReconciliationCache::new(
            catalog,
            Arc::new(RwLock::new(states)),
            Arc::new(runtime.clone()),
            Arc::new(MemoryConfigStore::new()),
            "dockyard-".into(),
        )
    }

    #[test]
    fn test_detail_is_stable_until_invalidated() {
        let runtime = InMemoryRuntime::new();
        let cache = cache(&runtime);
        let redis = ServiceId::from("redis");

        let first = cache.detail(&redis).unwrap();
        let second = cache.detail(&redis).unwrap();
        assert_eq!(first, second);

        cache.invalidate(&[CacheKey::Detail(redis.clone())]);
        let third = cache.detail(&redis).unwrap();
        assert!(third.version > first.version);
        assert_eq!(third.value, first.value);
    }

    #[test]
    fn test_list_reflects_state_after_invalidation() {
        let runtime = InMemoryRuntime::new();
        let cache = cache(&runtime);
        let redis = ServiceId::from("redis");
        assert!(cache.list().value.iter().all(|s| !s.running));

        cache
            .states
            .write()
            .unwrap()
            .get_mut(&redis)
            .unwrap()
            .mark_installed(true, None, Some("7.4".into()));

        // Still the cached snapshot
        assert!(cache.list().value.iter().all(|s| !s.running));
        cache.invalidate(&[CacheKey::List]);
        let list = cache.list().value;
        assert!(list.iter().any(|s| s.id == redis && s.running));
    }

    #[test]
    fn test_unknown_service_detail() {
        let runtime = InMemoryRuntime::new();
        let cache = cache(&runtime);
        assert_eq!(
            cache.detail(&ServiceId::from("mongo")).unwrap_err(),
            LifecycleError::UnknownService(ServiceId::from("mongo"))
        );
    }

    #[tokio::test]
    async fn test_container_state_falls_back_to_recorded() {
        let runtime = InMemoryRuntime::new();
        let cache = cache(&runtime);
        let redis = ServiceId::from("redis");
        runtime.fail(FailPoint::Status, "inspect failed");

        let status = cache.container_state(&redis).await.unwrap();
        assert_eq!(status.value, None);
        assert!(cache
            .entry_version(&CacheKey::ContainerState(redis.clone()))
            .is_some());
    }

    #[tokio::test]
    async fn test_report_memoized_per_resources_version() {
        let runtime = InMemoryRuntime::new();
        runtime.add_resource(ResourceRecord::new(ResourceKind::Volume, "orphan-1", None));
        let cache = cache(&runtime);

        let report = cache.report().await.unwrap();
        assert_eq!(report.orphans.len(), 1);
        cache.report().await.unwrap();
        let lists = runtime
            .calls()
            .into_iter()
            .filter(|c| *c == RuntimeCall::ListResources)
            .count();
        assert_eq!(lists, 1);

        runtime.add_resource(ResourceRecord::new(ResourceKind::Network, "stray", None));
        cache.refresh_resources().await.unwrap();
        assert_eq!(cache.report().await.unwrap().orphans.len(), 2);
        assert_eq!(
            cache.badge().await.unwrap(),
            Some(Badge {
                orphans: 2,
                updates: 0
            })
        );
    }

    #[tokio::test]
    async fn test_load_raced_by_invalidation_is_discarded() {
        let runtime = InMemoryRuntime::new();
        let cache = cache(&runtime);
        let generation = cache.generation(&CacheKey::Resources);
        cache.invalidate(&[CacheKey::Resources]);

        let stale = cache.versioned(Vec::new());
        cache.store(&CacheKey::Resources, generation, |e| {
            e.resources = Some(stale)
        });
        assert!(cache.entry_version(&CacheKey::Resources).is_none());
    }
}
