//! Service manager - Drives services through their lifecycle against the runtime
//!
//! Every verb follows the same shape: validate and enter a transient phase under the
//! state lock, call the runtime adapter with no lock held, apply the postcondition from
//! what the adapter reported, invalidate the cache, then return. A transient phase
//! doubles as the per-service operation lock, so a second verb for the same service is
//! rejected while different services proceed in parallel.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use super::cache::{CacheKey, ReconciliationCache, SharedStates};
use super::catalog::Catalog;
use super::error::{LifecycleError, OperationResult, Verb};
use super::health::DaemonHealthMonitor;
use super::observer::{LifecycleObserver, TracingObserver};
use super::poller::{CachePoller, PollerHandle};
use super::progress::{InstallProgressEvent, ProgressMultiplexer, Subscription};
use super::reconcile::ReconcileReport;
use super::resource::ResourceKind;
use super::service::{
    ContainerStatus, ServiceConfig, ServiceDefinition, ServiceId, ServicePhase, ServiceState,
};
use super::settings::Settings;
use super::store::{ConfigStore, MemoryConfigStore};
use crate::runtime::{AdapterResult, ContainerSpec, HostRouter, PullProgress, RoutingError, RuntimeAdapter};

/// Options for `install`
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Start the container once created
    pub start_immediately: bool,
    /// Configuration to install with; saved before provisioning. Defaults to the stored one.
    pub config: Option<ServiceConfig>,
    /// Run the host routing step afterwards
    pub configure_routing: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            start_immediately: true,
            config: None,
            configure_routing: false,
        }
    }
}

/// Transient phase entered when `verb` is applied from `phase`, if legal
pub fn transition_for(verb: Verb, phase: ServicePhase) -> Option<ServicePhase> {
    use ServicePhase::*;
    match (verb, phase) {
        (Verb::Install, NotInstalled) => Some(Installing),
        (Verb::Start, Stopped) => Some(Starting),
        (Verb::Stop, Running) => Some(Stopping),
        (Verb::Restart, Running | Stopped) => Some(Restarting),
        (Verb::Uninstall, Running | Stopped) => Some(Uninstalling),
        _ => None,
    }
}

/// Builder for [`ServiceManager`]
pub struct ServiceManagerBuilder {
    adapter: Arc<dyn RuntimeAdapter>,
    catalog: Catalog,
    configs: Arc<dyn ConfigStore>,
    router: Option<Arc<dyn HostRouter>>,
    observers: Vec<Arc<dyn LifecycleObserver>>,
    settings: Settings,
}

impl ServiceManagerBuilder {
    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn config_store(mut self, configs: Arc<dyn ConfigStore>) -> Self {
        self.configs = configs;
        self
    }

    pub fn router(mut self, router: Arc<dyn HostRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> ServiceManager {
        let catalog = Arc::new(self.catalog);
        let states: BTreeMap<ServiceId, ServiceState> = catalog
            .ids()
            .map(|id| (id.clone(), ServiceState::new(id.clone())))
            .collect();
        let states: SharedStates = Arc::new(RwLock::new(states));

        let cache = Arc::new(ReconciliationCache::new(
            Arc::clone(&catalog),
            Arc::clone(&states),
            Arc::clone(&self.adapter),
            Arc::clone(&self.configs),
            self.settings.container_prefix.clone(),
        ));
        let health = DaemonHealthMonitor::with_observers(
            Arc::clone(&self.adapter),
            self.settings.health_poll_interval(),
            self.observers.clone(),
        );

        ServiceManager {
            catalog,
            states,
            adapter: self.adapter,
            progress: ProgressMultiplexer::new(),
            cache,
            health,
            configs: self.configs,
            router: self.router,
            observers: self.observers,
            settings: self.settings,
            background_started: AtomicBool::new(false),
        }
    }
}

/// Authoritative lifecycle state of every declared service
pub struct ServiceManager {
    catalog: Arc<Catalog>,
    states: SharedStates,
    adapter: Arc<dyn RuntimeAdapter>,
    progress: ProgressMultiplexer,
    cache: Arc<ReconciliationCache>,
    health: DaemonHealthMonitor,
    configs: Arc<dyn ConfigStore>,
    router: Option<Arc<dyn HostRouter>>,
    observers: Vec<Arc<dyn LifecycleObserver>>,
    settings: Settings,
    background_started: AtomicBool,
}

impl ServiceManager {
    pub fn builder(adapter: Arc<dyn RuntimeAdapter>) -> ServiceManagerBuilder {
        ServiceManagerBuilder {
            adapter,
            catalog: Catalog::builtin(),
            configs: Arc::new(MemoryConfigStore::new()),
            router: None,
            observers: vec![Arc::new(TracingObserver)],
            settings: Settings::default(),
        }
    }

    // === Accessors ===

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn cache(&self) -> &ReconciliationCache {
        &self.cache
    }

    pub fn health(&self) -> &DaemonHealthMonitor {
        &self.health
    }

    pub fn progress(&self) -> &ProgressMultiplexer {
        &self.progress
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn subscribe_progress(&self, service_id: &ServiceId) -> Subscription {
        self.progress.subscribe(service_id)
    }

    pub fn state(&self, service_id: &ServiceId) -> Option<ServiceState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service_id)
            .cloned()
    }

    pub fn states(&self) -> Vec<ServiceState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    // === Transition plumbing ===

    /// Validate `verb` for `service_id` and enter its transient phase.
    ///
    /// Returns the definition and the settled phase to revert to on failure.
    fn begin(
        &self,
        service_id: &ServiceId,
        verb: Verb,
    ) -> Result<(ServiceDefinition, ServicePhase), LifecycleError> {
        let definition = self
            .catalog
            .get(service_id)
            .cloned()
            .ok_or_else(|| LifecycleError::UnknownService(service_id.clone()))?;

        let (from, to) = {
            let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
            let state = states
                .get_mut(service_id)
                .ok_or_else(|| LifecycleError::UnknownService(service_id.clone()))?;

            if state.phase.is_transient() {
                return Err(LifecycleError::OperationInProgress {
                    service: service_id.clone(),
                    phase: state.phase,
                });
            }
            self.health.require_actionable()?;
            let to = transition_for(verb, state.phase).ok_or_else(|| {
                LifecycleError::InvalidTransition {
                    service: service_id.clone(),
                    phase: state.phase,
                    verb,
                }
            })?;

            let from = state.phase;
            state.mark_transient(to);
            (from, to)
        };

        self.notify_transition(service_id, from, to);
        Ok((definition, from))
    }

    /// Mutate a service's state, reporting any phase change
    fn apply(&self, service_id: &ServiceId, f: impl FnOnce(&mut ServiceState)) {
        let change = {
            let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
            states.get_mut(service_id).map(|state| {
                let from = state.phase;
                f(state);
                (from, state.phase)
            })
        };
        if let Some((from, to)) = change {
            if from != to {
                self.notify_transition(service_id, from, to);
            }
        }
    }

    fn notify_transition(&self, service_id: &ServiceId, from: ServicePhase, to: ServicePhase) {
        for observer in &self.observers {
            observer.on_transition(service_id, from, to);
        }
    }

    /// Invalidate the views a lifecycle operation on `service_id` may have changed
    fn invalidate_after(&self, service_id: &ServiceId, resources_changed: bool) {
        let mut keys = vec![
            CacheKey::Detail(service_id.clone()),
            CacheKey::List,
            CacheKey::ContainerState(service_id.clone()),
        ];
        if resources_changed {
            keys.push(CacheKey::Resources);
        }
        self.cache.invalidate(&keys);
    }

    fn conclude(
        &self,
        service_id: &ServiceId,
        verb: Verb,
        result: Result<Option<String>, LifecycleError>,
    ) -> OperationResult {
        let result = OperationResult::from(result);
        for observer in &self.observers {
            observer.on_operation_complete(service_id, verb, &result);
        }
        result
    }

    /// Current container status; query failures read as unknown
    async fn query_status(&self, name: &str) -> Option<ContainerStatus> {
        match self.adapter.get_container_status(name).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Failed to read status of {}: {}", name, e);
                None
            }
        }
    }

    /// Operation generation of every service, taken before a runtime read
    fn generations(&self) -> HashMap<ServiceId, u64> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, s)| (id.clone(), s.generation))
            .collect()
    }

    // === Lifecycle verbs ===

    /// Pull, create and optionally start a service's container
    pub async fn install(&self, service_id: &ServiceId, options: InstallOptions) -> OperationResult {
        let result = match self.begin(service_id, Verb::Install) {
            Ok((definition, _)) => {
                let result = self.run_install(service_id, &definition, options).await;
                self.invalidate_after(service_id, true);
                result
            }
            Err(e) => Err(e),
        };
        self.conclude(service_id, Verb::Install, result)
    }

    async fn run_install(
        &self,
        service_id: &ServiceId,
        definition: &ServiceDefinition,
        options: InstallOptions,
    ) -> Result<Option<String>, LifecycleError> {
        let config = match options.config {
            Some(config) => self
                .configs
                .save_config(service_id, &config)
                .map(|_| config)
                .map_err(|e| LifecycleError::Config(format!("{:#}", e))),
            None => self.cache.effective_config(definition),
        };
        let config = match config {
            Ok(config) => config,
            Err(e) => {
                self.apply(service_id, |s| {
                    s.revert(ServicePhase::NotInstalled, e.display_text())
                });
                return Err(e);
            }
        };

        let name = self.cache.container_name(service_id);
        let start = options.start_immediately;
        info!("Installing {} ({})", service_id, definition.image_ref(&config));

        match self.provision(definition, &config, &name, start).await {
            Ok(status) => {
                self.progress.clear(service_id);
                let running = status.as_ref().map(|s| s.running).unwrap_or(start);
                let version = definition.version_for(&config).to_string();
                self.apply(service_id, |s| s.mark_installed(running, status, Some(version)));
            }
            Err(e) => {
                self.progress.publish(InstallProgressEvent::new(
                    service_id.clone(),
                    format!("Install failed: {}", e.message()),
                ));
                if self.query_status(&name).await.is_some() {
                    if let Err(cleanup) = self.adapter.remove_container(&name, false).await {
                        warn!("Failed to remove partial container {}: {}", name, cleanup);
                    }
                }
                self.progress.clear(service_id);
                self.apply(service_id, |s| s.revert(ServicePhase::NotInstalled, e.message()));
                return Err(e.into());
            }
        }

        if options.configure_routing {
            if let Some(router) = &self.router {
                match router.ensure_route(definition, &config).await {
                    Ok(()) => debug!("Host routing configured for {}", service_id),
                    Err(RoutingError::Denied(msg)) => {
                        return Err(LifecycleError::PrivilegedOperationDenied(msg))
                    }
                    Err(RoutingError::Failed(msg)) => {
                        return Err(LifecycleError::RuntimeOperationFailed(msg))
                    }
                }
            }
        }

        Ok(definition.post_install_message.clone())
    }

    /// Adapter sequence of an install: pull with progress, create, read back status
    async fn provision(
        &self,
        definition: &ServiceDefinition,
        config: &ServiceConfig,
        name: &str,
        start: bool,
    ) -> AdapterResult<Option<ContainerStatus>> {
        let service_id = definition.id.clone();
        let progress = self.progress.clone();
        let sink = move |p: PullProgress| {
            progress.publish(InstallProgressEvent {
                service_id: service_id.clone(),
                status: p.status,
                progress: p.progress,
            })
        };
        self.adapter
            .pull_image(&definition.image_ref(config), &sink)
            .await?;

        let step = if start { "Starting" } else { "Creating" };
        self.progress
            .publish(InstallProgressEvent::new(definition.id.clone(), step));

        let spec = ContainerSpec::for_service(
            definition,
            config,
            name.to_string(),
            &self.settings.label_key,
        );
        self.adapter.create_and_start_container(&spec, start).await?;
        Ok(self.query_status(name).await)
    }

    pub async fn start(&self, service_id: &ServiceId) -> OperationResult {
        self.toggle(service_id, Verb::Start).await
    }

    pub async fn stop(&self, service_id: &ServiceId) -> OperationResult {
        self.toggle(service_id, Verb::Stop).await
    }

    pub async fn restart(&self, service_id: &ServiceId) -> OperationResult {
        self.toggle(service_id, Verb::Restart).await
    }

    /// start, stop and restart: same shape, different adapter call and target phase
    async fn toggle(&self, service_id: &ServiceId, verb: Verb) -> OperationResult {
        let result = match self.begin(service_id, verb) {
            Ok((_, settled)) => {
                let name = self.cache.container_name(service_id);
                let (outcome, running) = match verb {
                    Verb::Stop => (self.adapter.stop_container(&name).await, false),
                    Verb::Restart => (self.adapter.restart_container(&name).await, true),
                    _ => (self.adapter.start_container(&name).await, true),
                };

                let result = match outcome {
                    Ok(()) => {
                        let status = self.query_status(&name).await;
                        self.apply(service_id, |s| {
                            let status = status.or_else(|| {
                                s.container_status.clone().map(|mut c| {
                                    c.running = running;
                                    c
                                })
                            });
                            if running {
                                s.mark_running(status)
                            } else {
                                s.mark_stopped(status)
                            }
                        });
                        Ok(None)
                    }
                    Err(e) => {
                        self.apply(service_id, |s| s.revert(settled, e.message()));
                        Err(e.into())
                    }
                };
                self.invalidate_after(service_id, false);
                result
            }
            Err(e) => Err(e),
        };
        self.conclude(service_id, verb, result)
    }

    /// Remove a service's container; `remove_volumes` is passed to the runtime unchanged
    pub async fn uninstall(&self, service_id: &ServiceId, remove_volumes: bool) -> OperationResult {
        let result = match self.begin(service_id, Verb::Uninstall) {
            Ok((_, settled)) => {
                let name = self.cache.container_name(service_id);
                let result = match self.adapter.remove_container(&name, remove_volumes).await {
                    Ok(()) => {
                        self.apply(service_id, ServiceState::mark_not_installed);
                        if let Some(router) = &self.router {
                            if let Err(e) = router.remove_route(service_id).await {
                                warn!("Failed to remove host routing for {}: {}", service_id, e);
                            }
                        }
                        Ok(None)
                    }
                    Err(e) => {
                        self.apply(service_id, |s| s.revert(settled, e.message()));
                        Err(e.into())
                    }
                };
                self.invalidate_after(service_id, true);
                result
            }
            Err(e) => Err(e),
        };
        self.conclude(service_id, Verb::Uninstall, result)
    }

    /// Replace a service's configuration. Takes effect on the next install.
    pub fn update_config(&self, service_id: &ServiceId, config: ServiceConfig) -> OperationResult {
        let result = if self.catalog.contains(service_id) {
            self.configs
                .save_config(service_id, &config)
                .map(|_| None)
                .map_err(|e| LifecycleError::Config(format!("{:#}", e)))
        } else {
            Err(LifecycleError::UnknownService(service_id.clone()))
        };
        if result.is_ok() {
            self.cache.invalidate(&[CacheKey::Detail(service_id.clone()), CacheKey::List]);
        }
        self.conclude(service_id, Verb::UpdateConfig, result)
    }

    // === Reconciliation with the runtime ===

    /// Record containers that already exist in the runtime. Returns the installed count.
    pub async fn discover(&self) -> Result<usize, LifecycleError> {
        self.health.require_actionable()?;
        let generations = self.generations();

        let versions: HashMap<ServiceId, String> = match self.cache.refresh_resources().await {
            Ok(resources) => resources
                .value
                .iter()
                .filter(|r| r.kind == ResourceKind::Container)
                .filter_map(|r| Some((r.bound_service_id.clone()?, r.image_version()?.to_string())))
                .collect(),
            Err(e) => {
                warn!("Resource listing failed during discovery: {}", e);
                HashMap::new()
            }
        };

        let mut installed = 0;
        for definition in self.catalog.iter() {
            let id = &definition.id;
            let name = self.cache.container_name(id);
            let status = self.adapter.get_container_status(&name).await?;
            let version = versions.get(id).cloned();

            let seen = generations.get(id).copied();
            self.apply(id, |s| {
                // An operation started since the read owns the state now
                if s.phase.is_transient() || Some(s.generation) != seen {
                    return;
                }
                match status {
                    Some(status) => {
                        let version = version.or_else(|| s.installed_version.clone());
                        s.mark_installed(status.running, Some(status), version);
                    }
                    None if s.installed => s.mark_not_installed(),
                    None => {}
                }
            });
            if self.state(id).map(|s| s.installed).unwrap_or(false) {
                installed += 1;
            }
            self.invalidate_after(id, false);
        }

        info!("Discovered {} installed services", installed);
        Ok(installed)
    }

    /// Re-read container status of installed, settled services. Returns how many changed.
    pub async fn refresh_container_states(&self) -> Result<usize, LifecycleError> {
        self.health.require_actionable()?;

        let installed: Vec<(ServiceId, u64)> = self
            .states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.installed && s.phase.is_settled())
            .map(|s| (s.service_id.clone(), s.generation))
            .collect();

        let mut changed = 0;
        for (id, generation) in installed {
            let name = self.cache.container_name(&id);
            let status = match self.adapter.get_container_status(&name).await {
                Ok(status) => status,
                Err(e) => {
                    debug!("Skipping status refresh of {}: {}", id, e);
                    continue;
                }
            };

            let mut differs = false;
            self.apply(&id, |s| {
                if s.generation != generation || s.phase.is_transient() || !s.installed {
                    return;
                }
                if s.container_status == status {
                    return;
                }
                differs = true;
                match status {
                    Some(status) if status.running => s.mark_running(Some(status)),
                    Some(status) => s.mark_stopped(Some(status)),
                    // Removed behind our back
                    None => s.mark_not_installed(),
                }
            });

            if differs {
                changed += 1;
                self.invalidate_after(&id, false);
            } else {
                self.cache.invalidate(&[CacheKey::ContainerState(id)]);
            }
        }
        Ok(changed)
    }

    /// Re-list runtime resources and recompute the derived report
    pub async fn refresh_resources(&self) -> Result<ReconcileReport, LifecycleError> {
        self.cache.refresh_resources().await?;
        self.cache.report().await
    }

    /// Start the health loop and cache poller once. Later calls return `None`.
    pub fn start_background(self: &Arc<Self>) -> Option<PollerHandle> {
        if self.background_started.swap(true, Ordering::SeqCst) {
            debug!("Background tasks already running");
            return None;
        }
        self.health.spawn();
        Some(CachePoller::new(Arc::clone(self)).spawn())
    }
}
