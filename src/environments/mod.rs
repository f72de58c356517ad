use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::FurnaceConfig;
use crate::core::{
    EnvironmentInstance, EnvironmentState, FurnaceError, FurnaceResult, Recipe, Stage,
};
use crate::storage::{RecipeStore, SqliteBackend};
use crate::supervisor::{
    CachedProbe, HealthProbe, HttpProbe, OsLauncher, ProbeResult, ProcessHandles,
    ProcessLauncher, ProcessRole, ProcessSupervisor, SupervisorEvent,
};
use crate::templates::ConfigRenderer;

pub mod allocator;
pub mod home_lock;

pub use allocator::PortAllocator;
pub use home_lock::HomeLock;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

struct Inner {
    config: FurnaceConfig,
    store: Arc<RecipeStore>,
    allocator: PortAllocator,
    renderer: ConfigRenderer,
    supervisor: Arc<ProcessSupervisor>,
    instances: RwLock<BTreeMap<String, EnvironmentInstance>>,
    handles: Mutex<HashMap<String, ProcessHandles>>,
    recipe_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    inflight: StdMutex<HashMap<String, Vec<(Uuid, CancellationToken)>>>,
    shutdown: CancellationToken,
    _home_lock: Option<HomeLock>,
}

/// Registration of one start in `inflight`, removed on drop.
struct InflightStart<'a> {
    inflight: &'a StdMutex<HashMap<String, Vec<(Uuid, CancellationToken)>>>,
    name: String,
    id: Uuid,
}

impl<'a> InflightStart<'a> {
    fn register(inner: &'a Inner, name: &str, token: CancellationToken) -> Self {
        let id = Uuid::new_v4();
        lock(&inner.inflight)
            .entry(name.to_string())
            .or_default()
            .push((id, token));
        Self {
            inflight: &inner.inflight,
            name: name.to_string(),
            id,
        }
    }
}

impl Drop for InflightStart<'_> {
    fn drop(&mut self) {
        let mut inflight = lock(self.inflight);
        if let Some(starts) = inflight.get_mut(&self.name) {
            starts.retain(|(id, _)| *id != self.id);
            if starts.is_empty() {
                inflight.remove(&self.name);
            }
        }
    }
}

/// What a start has acquired so far, for rollback.
#[derive(Default)]
struct StartProgress {
    allocated: bool,
    rendered: bool,
    handles: Option<ProcessHandles>,
}

/// Drives recipes through their lifecycle.
///
/// Operations on one recipe are serialised by a per-recipe lock; different
/// recipes proceed in parallel. Instances live in memory only: after a
/// restart of the orchestrator every recipe is `Stopped`.
#[derive(Clone)]
pub struct EnvironmentOrchestrator {
    inner: Arc<Inner>,
}

impl EnvironmentOrchestrator {
    /// Takes ownership of the configured home, opens its SQLite store and
    /// supervises real processes. Fails with `HomeLocked` while another
    /// orchestrator owns the home.
    ///
    /// Rendered configs of recipes no longer stored are pruned, and active
    /// states recorded by a previous owner are reset to `Stopped`.
    pub async fn open(config: FurnaceConfig) -> FurnaceResult<Self> {
        let home_lock = HomeLock::acquire(&config.home)?;
        let backend = Arc::new(SqliteBackend::open(&config.store_path()).await?);
        let store = Arc::new(RecipeStore::open(backend).await?);
        let launcher = Arc::new(OsLauncher::new(config.supervisor.output_lines));
        let probe = Arc::new(HttpProbe::new(config.supervisor.probe_timeout()));

        let orchestrator = Self::build(config, store, launcher, probe, Some(home_lock));
        orchestrator.prune_rendered().await;
        orchestrator.reset_stale_states().await;
        Ok(orchestrator)
    }

    /// Must be called inside a Tokio runtime: starts background supervision.
    /// Does not lock the home; callers own the store exclusively.
    pub fn new(
        config: FurnaceConfig,
        store: Arc<RecipeStore>,
        launcher: Arc<dyn ProcessLauncher>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self::build(config, store, launcher, probe, None)
    }

    fn build(
        config: FurnaceConfig,
        store: Arc<RecipeStore>,
        launcher: Arc<dyn ProcessLauncher>,
        probe: Arc<dyn HealthProbe>,
        home_lock: Option<HomeLock>,
    ) -> Self {
        let (supervisor, events) = ProcessSupervisor::new(&config, launcher, probe);
        let supervisor = Arc::new(supervisor);
        let shutdown = CancellationToken::new();
        supervisor.spawn_monitor(shutdown.child_token());

        let inner = Arc::new(Inner {
            allocator: PortAllocator::from_config(&config),
            renderer: ConfigRenderer::new(&config),
            config,
            store,
            supervisor,
            instances: RwLock::new(BTreeMap::new()),
            handles: Mutex::new(HashMap::new()),
            recipe_locks: StdMutex::new(HashMap::new()),
            inflight: StdMutex::new(HashMap::new()),
            shutdown,
            _home_lock: home_lock,
        });
        spawn_event_listener(Arc::downgrade(&inner), events);

        Self { inner }
    }

    pub fn config(&self) -> &FurnaceConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &RecipeStore {
        &self.inner.store
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.inner.allocator
    }

    pub fn renderer(&self) -> &ConfigRenderer {
        &self.inner.renderer
    }

    pub async fn instance(&self, name: &str) -> Option<EnvironmentInstance> {
        self.inner.instances.read().await.get(name).cloned()
    }

    pub async fn instances(&self) -> BTreeMap<String, EnvironmentInstance> {
        self.inner.instances.read().await.clone()
    }

    pub async fn cached_probe(&self, name: &str) -> Option<CachedProbe> {
        self.inner.supervisor.cached_probe(name).await
    }

    /// Starts a recipe and waits until it answers its health probe.
    ///
    /// The sequence runs on its own task so rollback completes even if this
    /// future is dropped; dropping it cancels the start.
    pub async fn start(&self, name: &str) -> FurnaceResult<EnvironmentInstance> {
        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();

        let this = self.clone();
        let recipe_name = name.to_string();
        let task = tokio::spawn(async move { this.run_start(&recipe_name, token).await });

        let result = task
            .await
            .map_err(|e| FurnaceError::Internal(format!("start task for '{}' failed: {}", name, e)))?;
        guard.disarm();
        result
    }

    /// Cancels in-flight starts of a recipe, including ones still waiting
    /// for the recipe lock. Returns whether any was in flight.
    pub fn cancel(&self, name: &str) -> bool {
        match lock(&self.inner.inflight).get(name) {
            Some(starts) if !starts.is_empty() => {
                info!("Cancelling start of '{}'", name);
                for (_, token) in starts {
                    token.cancel();
                }
                true
            }
            _ => false,
        }
    }

    /// Stops a recipe's environment. Stopping a stored recipe that is not
    /// running succeeds without effect; a failed instance is cleared.
    pub async fn stop(&self, name: &str) -> FurnaceResult<()> {
        let recipe_lock = self.recipe_lock(name);
        let _held = recipe_lock.lock().await;
        self.stop_locked(name).await
    }

    pub async fn restart(&self, name: &str) -> FurnaceResult<EnvironmentInstance> {
        self.stop(name).await?;
        self.start(name).await
    }

    pub async fn create_recipe(&self, recipe: Recipe) -> FurnaceResult<Recipe> {
        let recipe = recipe.normalized();
        recipe.validate(&self.inner.config.sites.allowed_tlds)?;
        self.inner.store.put(recipe.clone()).await?;
        Ok(recipe)
    }

    /// Replaces a stored recipe. Refused while its environment is active.
    pub async fn update_recipe(&self, recipe: Recipe) -> FurnaceResult<Recipe> {
        let recipe = recipe.normalized();
        recipe.validate(&self.inner.config.sites.allowed_tlds)?;

        let recipe_lock = self.recipe_lock(&recipe.name);
        let _held = recipe_lock.lock().await;
        self.ensure_inactive(&recipe.name, "update").await?;
        self.inner.store.update(recipe.clone()).await?;
        self.inner.store.get(&recipe.name).await
    }

    /// Deletes a recipe. Refused while its environment is active.
    pub async fn delete_recipe(&self, name: &str) -> FurnaceResult<()> {
        let recipe_lock = self.recipe_lock(name);
        let _held = recipe_lock.lock().await;
        self.ensure_inactive(name, "delete").await?;

        self.clear_failed(name).await?;
        self.inner.store.delete(name).await
    }

    /// Cancels in-flight starts, stops every environment and ends
    /// background supervision.
    pub async fn shutdown(&self) {
        let tokens: Vec<CancellationToken> = lock(&self.inner.inflight)
            .values()
            .flatten()
            .map(|(_, token)| token.clone())
            .collect();
        for token in tokens {
            token.cancel();
        }

        let names: Vec<String> = self.inner.instances.read().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                error!("Failed to stop '{}' during shutdown: {}", name, e);
            }
        }

        self.inner.shutdown.cancel();
        info!("Orchestrator shut down");
    }

    async fn run_start(
        &self,
        name: &str,
        token: CancellationToken,
    ) -> FurnaceResult<EnvironmentInstance> {
        let _inflight = InflightStart::register(&self.inner, name, token.clone());
        let recipe_lock = self.recipe_lock(name);
        let _held = tokio::select! {
            held = recipe_lock.lock_owned() => held,
            _ = token.cancelled() => return Err(FurnaceError::Cancelled(name.to_string())),
        };

        let recipe = self.inner.store.get(name).await?;
        self.inner.store.ensure_writable().await?;

        let leftover = self
            .instance(name)
            .await
            .map(|i| !i.state.is_active())
            .unwrap_or(false);
        if leftover {
            self.clear_failed(name).await?;
        }

        {
            let mut instances = self.inner.instances.write().await;
            if let Some(existing) = instances.get(name) {
                if existing.state.is_active() {
                    return Err(FurnaceError::conflict(
                        name,
                        format!("environment is already {}", existing.state),
                    ));
                }
            }
            let mut instance = EnvironmentInstance::new(name);
            instance.transition(EnvironmentState::Starting)?;
            instances.insert(name.to_string(), instance);
        }
        self.inner
            .store
            .annotate_state(name, EnvironmentState::Starting)
            .await;
        info!("Starting '{}' ({})", name, recipe.site_hostname);

        let mut progress = StartProgress::default();
        let outcome = self.advance(&recipe, &token, &mut progress).await;

        match outcome {
            Ok(instance) => {
                info!(
                    "'{}' is running on http://{}:{}",
                    name,
                    recipe.site_hostname,
                    instance.allocation.as_ref().map(|a| a.port).unwrap_or_default()
                );
                Ok(instance)
            }
            Err((stage, cause)) => {
                warn!("Start of '{}' failed during {}: {}", name, stage, cause);
                self.rollback(name, progress).await;
                self.mark_failed(name, cause.to_string(), true).await;
                Err(FurnaceError::StartFailed {
                    recipe: name.to_string(),
                    stage,
                    cause: Box::new(cause),
                })
            }
        }
    }

    async fn advance(
        &self,
        recipe: &Recipe,
        token: &CancellationToken,
        progress: &mut StartProgress,
    ) -> Result<EnvironmentInstance, (Stage, FurnaceError)> {
        let name = recipe.name.as_str();
        let checkpoint = |stage: Stage| {
            if token.is_cancelled() {
                Err((stage, FurnaceError::Cancelled(name.to_string())))
            } else {
                Ok(())
            }
        };

        checkpoint(Stage::Allocate)?;
        let allocation = self
            .inner
            .allocator
            .allocate(recipe)
            .await
            .map_err(|e| (Stage::Allocate, e))?;
        progress.allocated = true;
        self.update_instance(name, |i| i.allocation = Some(allocation.clone()))
            .await;

        checkpoint(Stage::Render)?;
        let rendered = self
            .inner
            .renderer
            .render(recipe, &allocation)
            .await
            .map_err(|e| (Stage::Render, e))?;
        progress.rendered = true;

        checkpoint(Stage::Launch)?;
        let handles = self
            .inner
            .supervisor
            .launch(recipe, &allocation, &rendered)
            .await
            .map_err(|e| (Stage::Launch, e))?;
        progress.handles = Some(handles.clone());
        self.update_instance(name, |i| {
            i.runtime_process_id = handles.runtime_pid;
            i.serving_process_id = handles.serving_pid;
        })
        .await;
        self.set_state(name, EnvironmentState::HealthChecking)
            .await
            .map_err(|e| (Stage::HealthCheck, e))?;

        self.await_healthy(recipe, &handles, token)
            .await
            .map_err(|e| (Stage::HealthCheck, e))?;
        self.inner
            .supervisor
            .watch(&handles)
            .await
            .map_err(|e| (Stage::Supervise, e))?;

        self.inner
            .handles
            .lock()
            .await
            .insert(name.to_string(), handles);
        self.set_state(name, EnvironmentState::Running)
            .await
            .map_err(|e| (Stage::Supervise, e))?;

        self.update_instance(name, |i| {
            i.started_at = Some(Utc::now());
            i.last_error = None;
            i.clone()
        })
        .await
        .ok_or_else(|| {
            (
                Stage::Supervise,
                FurnaceError::Internal(format!("instance of '{}' vanished", name)),
            )
        })
    }

    /// Polls the supervisor's probe until healthy, the deadline passes, a
    /// process exits or the start is cancelled.
    async fn await_healthy(
        &self,
        recipe: &Recipe,
        handles: &ProcessHandles,
        token: &CancellationToken,
    ) -> FurnaceResult<()> {
        let settings = &self.inner.config.supervisor;
        let deadline = Instant::now() + settings.health_timeout();
        let mut last_reason = None;

        loop {
            let result = self.inner.supervisor.probe(handles).await;
            self.update_instance(&recipe.name, |i| i.last_health_check_at = Some(Utc::now()))
                .await;

            match result {
                ProbeResult::Healthy => return Ok(()),
                ProbeResult::Exited { role, code } => {
                    return Err(self.inner.supervisor.crash_error(handles, role, code).await)
                }
                ProbeResult::Unhealthy { reason } => {
                    debug!("'{}' not healthy yet: {}", recipe.name, reason);
                    last_reason = Some(reason);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(FurnaceError::HealthCheckTimeout {
                    recipe: recipe.name.clone(),
                    timeout: settings.health_timeout(),
                    detail: last_reason,
                });
            }

            let pause = settings.health_poll().min(deadline - now);
            tokio::select! {
                _ = token.cancelled() => return Err(FurnaceError::Cancelled(recipe.name.clone())),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn rollback(&self, name: &str, progress: StartProgress) {
        if let Some(handles) = progress.handles {
            if let Err(e) = self.inner.supervisor.stop(&handles).await {
                warn!("Rollback of '{}' could not stop its processes: {}", name, e);
            }
        }
        self.inner.handles.lock().await.remove(name);
        if progress.rendered {
            if let Err(e) = self.inner.renderer.remove(name).await {
                warn!("Rollback of '{}' could not remove its config: {}", name, e);
            }
        }
        if progress.allocated {
            self.inner.allocator.release(name).await;
        }
    }

    async fn stop_locked(&self, name: &str) -> FurnaceResult<()> {
        let Some(instance) = self.instance(name).await else {
            return if self.inner.store.contains(name).await {
                Ok(())
            } else {
                Err(FurnaceError::NotFound(name.to_string()))
            };
        };

        match instance.state {
            EnvironmentState::Running => {}
            EnvironmentState::Stopped | EnvironmentState::Failed => {
                return self.clear_failed(name).await;
            }
            other => {
                return Err(FurnaceError::conflict(
                    name,
                    format!("environment is {}", other),
                ))
            }
        }

        self.set_state(name, EnvironmentState::Stopping).await?;
        let handles = self.inner.handles.lock().await.get(name).cloned();
        if let Some(handles) = handles {
            if let Err(e) = self.inner.supervisor.stop(&handles).await {
                error!("Failed to stop '{}': {}", name, e);
                // The processes may still hold the port: keep the handles and
                // the allocation so a later stop can retry.
                self.mark_failed(name, e.to_string(), false).await;
                return Err(e);
            }
            self.inner.handles.lock().await.remove(name);
        }

        if let Err(e) = self.inner.renderer.remove(name).await {
            warn!("Failed to remove rendered config of '{}': {}", name, e);
        }
        self.inner.allocator.release(name).await;
        self.set_state(name, EnvironmentState::Stopped).await?;
        self.inner.instances.write().await.remove(name);
        info!("Stopped '{}'", name);
        Ok(())
    }

    /// Drops a stopped or failed instance together with anything it may
    /// still hold. Processes that survive another stop keep the instance,
    /// its handles and its allocation in place.
    async fn clear_failed(&self, name: &str) -> FurnaceResult<()> {
        let handles = self.inner.handles.lock().await.get(name).cloned();
        if let Some(handles) = handles {
            if let Err(e) = self.inner.supervisor.stop(&handles).await {
                warn!("Failed to stop leftover processes of '{}': {}", name, e);
                return Err(e);
            }
            self.inner.handles.lock().await.remove(name);
        }
        if let Err(e) = self.inner.renderer.remove(name).await {
            warn!("Failed to remove rendered config of '{}': {}", name, e);
        }
        self.inner.allocator.release(name).await;
        self.inner.instances.write().await.remove(name);
        self.inner
            .store
            .annotate_state(name, EnvironmentState::Stopped)
            .await;
        debug!("Cleared instance of '{}'", name);
        Ok(())
    }

    async fn ensure_inactive(&self, name: &str, action: &str) -> FurnaceResult<()> {
        match self.instance(name).await {
            Some(instance) if instance.state.is_active() => Err(FurnaceError::conflict(
                name,
                format!("cannot {} while the environment is {}", action, instance.state),
            )),
            _ => Ok(()),
        }
    }

    async fn handle_event(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Failed {
                recipe_name,
                launch_id,
                error,
            } => {
                let recipe_lock = self.recipe_lock(&recipe_name);
                let _held = recipe_lock.lock().await;
                if !self.is_current_launch(&recipe_name, launch_id).await {
                    return;
                }

                error!("'{}' failed: {}", recipe_name, error);
                self.inner.handles.lock().await.remove(&recipe_name);
                if let Err(e) = self.inner.renderer.remove(&recipe_name).await {
                    warn!("Failed to remove rendered config of '{}': {}", recipe_name, e);
                }
                self.inner.allocator.release(&recipe_name).await;
                self.mark_failed(&recipe_name, error.to_string(), true).await;
            }
            SupervisorEvent::Restarted {
                recipe_name,
                launch_id,
                role,
                pid,
            } => {
                let recipe_lock = self.recipe_lock(&recipe_name);
                let _held = recipe_lock.lock().await;
                if !self.is_current_launch(&recipe_name, launch_id).await {
                    return;
                }

                if let Some(handles) = self.inner.handles.lock().await.get_mut(&recipe_name) {
                    match role {
                        ProcessRole::Runtime => handles.runtime_pid = pid,
                        ProcessRole::Serving => handles.serving_pid = pid,
                    }
                }
                self.update_instance(&recipe_name, |i| {
                    match role {
                        ProcessRole::Runtime => i.runtime_process_id = pid,
                        ProcessRole::Serving => i.serving_process_id = pid,
                    }
                    i.restarts += 1;
                })
                .await;
                info!("'{}' recovered after its {} crashed", recipe_name, role);
            }
        }
    }

    async fn is_current_launch(&self, name: &str, launch_id: Uuid) -> bool {
        self.inner
            .handles
            .lock()
            .await
            .get(name)
            .map(|h| h.launch_id == launch_id)
            .unwrap_or(false)
    }

    /// Moves an instance to `Failed`. Its allocation and process ids are
    /// cleared only when they were released.
    async fn mark_failed(&self, name: &str, reason: String, released: bool) {
        let moved = self
            .update_instance(name, |i| {
                let moved = i.transition(EnvironmentState::Failed);
                i.last_error = Some(reason);
                i.started_at = None;
                if released {
                    i.allocation = None;
                    i.runtime_process_id = None;
                    i.serving_process_id = None;
                }
                moved
            })
            .await;

        match moved {
            Some(Ok(())) => {
                self.inner
                    .store
                    .annotate_state(name, EnvironmentState::Failed)
                    .await
            }
            Some(Err(e)) => warn!("Could not mark '{}' failed: {}", name, e),
            None => {}
        }
    }

    async fn set_state(&self, name: &str, next: EnvironmentState) -> FurnaceResult<()> {
        self.update_instance(name, |i| i.transition(next))
            .await
            .unwrap_or_else(|| {
                Err(FurnaceError::Internal(format!("no instance for '{}'", name)))
            })?;
        self.inner.store.annotate_state(name, next).await;
        debug!("'{}' is now {}", name, next);
        Ok(())
    }

    async fn update_instance<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut EnvironmentInstance) -> T,
    ) -> Option<T> {
        self.inner.instances.write().await.get_mut(name).map(f)
    }

    fn recipe_lock(&self, name: &str) -> Arc<Mutex<()>> {
        lock(&self.inner.recipe_locks)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Active states in the store were written by an owner that has since
    /// exited; nothing of theirs is supervised here.
    async fn reset_stale_states(&self) {
        for recipe in self.inner.store.list().await {
            if recipe.last_known_state.map(|s| s.is_active()).unwrap_or(false) {
                info!("Resetting stale state of '{}'", recipe.name);
                self.inner
                    .store
                    .annotate_state(&recipe.name, EnvironmentState::Stopped)
                    .await;
            }
        }
    }

    async fn prune_rendered(&self) {
        let rendered = match self.inner.renderer.rendered_recipes().await {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!("Cannot list rendered configs: {}", e);
                return;
            }
        };
        for name in rendered {
            if !self.inner.store.contains(&name).await {
                info!("Pruning rendered config of deleted recipe '{}'", name);
                if let Err(e) = self.inner.renderer.remove(&name).await {
                    warn!("Failed to prune '{}': {}", name, e);
                }
            }
        }
    }
}

fn spawn_event_listener(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<SupervisorEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else { break };
            // Each event waits on its own recipe's lock only.
            tokio::spawn(async move {
                EnvironmentOrchestrator { inner }.handle_event(event).await;
            });
        }
        debug!("Supervisor event listener stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServingEngine;
    use crate::supervisor::mock::{MockLauncher, StaticProbe};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        orchestrator: EnvironmentOrchestrator,
        launcher: Arc<MockLauncher>,
        probe: Arc<StaticProbe>,
        _home: TempDir,
    }

    async fn harness() -> Harness {
        let home = tempfile::tempdir().unwrap();
        let mut config = FurnaceConfig::for_home(home.path());
        config.ports.start = 9300;
        config.ports.end = 9310;
        config.ports.skip_busy = false;
        config.supervisor.health_timeout_ms = 200;
        config.supervisor.health_poll_ms = 10;
        config.supervisor.grace_period_ms = 50;
        config.supervisor.probe_interval_ms = 60_000;

        let launcher = Arc::new(MockLauncher::new());
        let probe = Arc::new(StaticProbe::healthy());
        let store = Arc::new(RecipeStore::in_memory().await.unwrap());
        let orchestrator =
            EnvironmentOrchestrator::new(config, store, launcher.clone(), probe.clone());
        orchestrator
            .create_recipe(Recipe::new(
                "alpha",
                "/srv/alpha",
                "8.2",
                ServingEngine::Nginx,
                "alpha.test",
            ))
            .await
            .unwrap();

        Harness {
            orchestrator,
            launcher,
            probe,
            _home: home,
        }
    }

    #[tokio::test]
    async fn start_reaches_running_with_allocation() {
        let h = harness().await;
        let instance = h.orchestrator.start("alpha").await.unwrap();

        assert_eq!(instance.state, EnvironmentState::Running);
        assert_eq!(instance.allocation.as_ref().unwrap().port, 9300);
        assert!(instance.started_at.is_some());
        assert!(h
            .orchestrator
            .renderer()
            .site_dir("alpha")
            .join("nginx.conf")
            .is_file());
        assert_eq!(
            h.orchestrator.store().get("alpha").await.unwrap().last_known_state,
            Some(EnvironmentState::Running)
        );
    }

    #[tokio::test]
    async fn health_timeout_rolls_back() {
        let h = harness().await;
        h.probe.set(Err("connection refused".into()));

        let err = h.orchestrator.start("alpha").await.unwrap_err();
        assert_eq!(err.stage(), Some(Stage::HealthCheck));
        assert!(matches!(
            err.root_cause(),
            FurnaceError::HealthCheckTimeout { .. }
        ));

        let instance = h.orchestrator.instance("alpha").await.unwrap();
        assert_eq!(instance.state, EnvironmentState::Failed);
        assert!(instance.last_error.unwrap().contains("connection refused"));
        assert!(instance.allocation.is_none());
        assert!(h.orchestrator.allocator().is_empty().await);
        assert_eq!(h.launcher.live_processes(), 0);
        assert!(!h.orchestrator.renderer().site_dir("alpha").exists());
    }

    #[tokio::test]
    async fn launch_failure_is_reported_with_stage() {
        let h = harness().await;
        h.launcher
            .fail_spawns(ProcessRole::Runtime, Some("php-fpm8.2: not found"));

        let err = h.orchestrator.start("alpha").await.unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Launch));
        assert!(matches!(err.root_cause(), FurnaceError::LaunchError { .. }));
        assert!(h.orchestrator.allocator().is_empty().await);
    }

    #[tokio::test]
    async fn failed_instance_can_be_started_again() {
        let h = harness().await;
        h.probe.set(Err("refused".into()));
        assert!(h.orchestrator.start("alpha").await.is_err());

        h.probe.set(Ok(()));
        let instance = h.orchestrator.start("alpha").await.unwrap();
        assert_eq!(instance.state, EnvironmentState::Running);
        assert!(instance.last_error.is_none());
    }

    #[tokio::test]
    async fn stop_of_unknown_recipe_is_not_found() {
        let h = harness().await;
        assert!(matches!(
            h.orchestrator.stop("ghost").await,
            Err(FurnaceError::NotFound(_))
        ));
        h.orchestrator.stop("alpha").await.unwrap();
    }

    #[tokio::test]
    async fn update_is_refused_while_running() {
        let h = harness().await;
        h.orchestrator.start("alpha").await.unwrap();

        let mut edited = h.orchestrator.store().get("alpha").await.unwrap();
        edited.runtime_version = "8.3".into();
        let err = h.orchestrator.update_recipe(edited.clone()).await.unwrap_err();
        assert!(matches!(err, FurnaceError::Conflict { .. }));

        h.orchestrator.stop("alpha").await.unwrap();
        let updated = h.orchestrator.update_recipe(edited).await.unwrap();
        assert_eq!(updated.runtime_version, "8.3");
    }

    #[tokio::test]
    async fn restart_gives_fresh_processes() {
        let h = harness().await;
        let first = h.orchestrator.start("alpha").await.unwrap();
        let second = h.orchestrator.restart("alpha").await.unwrap();
        assert_ne!(first.serving_process_id, second.serving_process_id);
        assert_eq!(h.launcher.live_processes(), 2);
    }

    #[tokio::test]
    async fn dropped_start_is_cancelled_and_rolled_back() {
        let h = harness().await;
        h.probe.set(Err("warming up".into()));

        let start = h.orchestrator.start("alpha");
        let _ = tokio::time::timeout(Duration::from_millis(30), start).await;

        for _ in 0..100 {
            if h.orchestrator.instance("alpha").await.map(|i| i.state)
                == Some(EnvironmentState::Failed)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let instance = h.orchestrator.instance("alpha").await.unwrap();
        assert_eq!(instance.state, EnvironmentState::Failed);
        assert!(instance.last_error.unwrap().contains("cancelled"));
        assert!(h.orchestrator.allocator().is_empty().await);
        assert_eq!(h.launcher.live_processes(), 0);
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn restarts_of(orchestrator: &EnvironmentOrchestrator, name: &str) -> u32 {
        orchestrator.instance(name).await.map(|i| i.restarts).unwrap_or(0)
    }

    #[tokio::test]
    async fn second_orchestrator_on_same_home_is_refused() {
        let home = tempfile::tempdir().unwrap();
        let config = FurnaceConfig::for_home(home.path());

        let owner = EnvironmentOrchestrator::open(config.clone()).await.unwrap();
        owner
            .create_recipe(Recipe::new(
                "alpha",
                "/srv/alpha",
                "8.2",
                ServingEngine::Nginx,
                "alpha.test",
            ))
            .await
            .unwrap();

        match EnvironmentOrchestrator::open(config.clone()).await {
            Err(FurnaceError::HomeLocked { pid, .. }) => {
                assert_eq!(pid, Some(std::process::id()))
            }
            Err(other) => panic!("expected HomeLocked, got {:?}", other),
            Ok(_) => panic!("two orchestrators own the same home"),
        }

        owner.shutdown().await;
        drop(owner);

        let next = EnvironmentOrchestrator::open(config).await.unwrap();
        assert!(next.store().contains("alpha").await);
        next.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_reaches_start_waiting_for_the_recipe_lock() {
        let h = harness().await;
        let held = h.orchestrator.recipe_lock("alpha").lock_owned().await;

        let orchestrator = h.orchestrator.clone();
        let start = tokio::spawn(async move { orchestrator.start("alpha").await });
        wait_for(|| lock(&h.orchestrator.inner.inflight).contains_key("alpha")).await;

        assert!(h.orchestrator.cancel("alpha"));
        let err = start.await.unwrap().unwrap_err();
        assert!(matches!(err.root_cause(), FurnaceError::Cancelled(_)));
        drop(held);

        assert!(h.orchestrator.instance("alpha").await.is_none());
        assert!(h.orchestrator.allocator().is_empty().await);
        assert!(h.launcher.spawned().is_empty());
        assert!(!h.orchestrator.cancel("alpha"));
    }

    #[tokio::test]
    async fn failed_stop_can_be_retried() {
        let h = harness().await;
        h.launcher.ignore_stop_signals(true);
        h.orchestrator.start("alpha").await.unwrap();

        h.launcher.fail_kills(true);
        assert!(h.orchestrator.stop("alpha").await.is_err());

        let instance = h.orchestrator.instance("alpha").await.unwrap();
        assert_eq!(instance.state, EnvironmentState::Failed);
        assert_eq!(instance.allocation.as_ref().unwrap().port, 9300);
        assert_eq!(h.orchestrator.allocator().len().await, 1);
        assert_eq!(h.launcher.live_processes(), 2);

        h.launcher.fail_kills(false);
        h.orchestrator.stop("alpha").await.unwrap();
        assert_eq!(h.launcher.live_processes(), 0);
        assert!(h.orchestrator.allocator().is_empty().await);
        assert!(h.orchestrator.instance("alpha").await.is_none());
    }

    #[tokio::test]
    async fn busy_recipe_does_not_delay_events_of_others() {
        let h = harness().await;
        h.orchestrator
            .create_recipe(Recipe::new(
                "beta",
                "/srv/beta",
                "8.2",
                ServingEngine::Nginx,
                "beta.test",
            ))
            .await
            .unwrap();
        h.orchestrator.start("alpha").await.unwrap();
        h.orchestrator.start("beta").await.unwrap();

        let held = h.orchestrator.recipe_lock("alpha").lock_owned().await;
        assert!(h.launcher.crash("alpha", ProcessRole::Runtime));
        h.orchestrator.inner.supervisor.tick().await;
        assert!(h.launcher.crash("beta", ProcessRole::Runtime));
        h.orchestrator.inner.supervisor.tick().await;

        for _ in 0..200 {
            if restarts_of(&h.orchestrator, "beta").await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(restarts_of(&h.orchestrator, "beta").await, 1);
        assert_eq!(restarts_of(&h.orchestrator, "alpha").await, 0);

        drop(held);
        for _ in 0..200 {
            if restarts_of(&h.orchestrator, "alpha").await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(restarts_of(&h.orchestrator, "alpha").await, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let h = harness().await;
        h.orchestrator.start("alpha").await.unwrap();
        h.orchestrator.shutdown().await;

        assert!(h.orchestrator.instances().await.is_empty());
        assert_eq!(h.launcher.live_processes(), 0);
        assert!(h.orchestrator.allocator().is_empty().await);
    }
}
