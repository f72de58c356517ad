use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, FurnaceConfig, SupervisorConfig};
use crate::core::{Allocation, FurnaceError, FurnaceResult, Recipe};
use crate::templates::RenderedConfig;

pub mod mock;
pub mod probe;
pub mod process;

pub use probe::{HealthProbe, HttpProbe, ProbeResult};
pub use process::{
    ChildProcess, OsLauncher, ProcessLauncher, ProcessRole, ProcessSpec, StopSignal,
};

/// Identifies one launch of a recipe's processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandles {
    pub recipe_name: String,
    pub launch_id: Uuid,
    pub runtime_pid: Option<u32>,
    pub serving_pid: Option<u32>,
}

/// Lifecycle of a single supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

/// Notifications for the orchestrator.
#[derive(Debug)]
pub enum SupervisorEvent {
    Restarted {
        recipe_name: String,
        launch_id: Uuid,
        role: ProcessRole,
        pid: Option<u32>,
    },
    Failed {
        recipe_name: String,
        launch_id: Uuid,
        error: FurnaceError,
    },
}

/// Last background probe of an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedProbe {
    pub result: ProbeResult,
    pub checked_at: DateTime<Utc>,
}

struct Supervised {
    spec: ProcessSpec,
    child: Box<dyn ChildProcess>,
    state: ProcessState,
}

impl Supervised {
    fn new(spec: ProcessSpec, child: Box<dyn ChildProcess>) -> Self {
        Self {
            spec,
            child,
            state: ProcessState::Starting,
        }
    }

    /// Exit code if the process is gone. A failing `try_wait` counts as gone.
    fn exit_status(&mut self) -> Option<Option<i32>> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    "Lost track of {} for '{}': {}",
                    self.spec.role, self.spec.recipe_name, e
                );
                Some(None)
            }
        }
    }
}

struct SupervisedEnvironment {
    allocation: Allocation,
    runtime: Supervised,
    serving: Supervised,
    watched: bool,
    last_restart: Option<Instant>,
    restarts: u32,
}

impl SupervisedEnvironment {
    fn process_mut(&mut self, role: ProcessRole) -> &mut Supervised {
        match role {
            ProcessRole::Runtime => &mut self.runtime,
            ProcessRole::Serving => &mut self.serving,
        }
    }

    /// First process found dead, with its exit code.
    fn exited(&mut self) -> Option<(ProcessRole, Option<i32>)> {
        for role in [ProcessRole::Runtime, ProcessRole::Serving] {
            let process = self.process_mut(role);
            if process.state == ProcessState::Stopped {
                continue;
            }
            if let Some(code) = process.exit_status() {
                process.state = ProcessState::Crashed;
                return Some((role, code));
            }
        }
        None
    }
}

#[derive(Clone)]
struct Entry {
    launch_id: Uuid,
    env: Arc<Mutex<SupervisedEnvironment>>,
}

/// Spawns, watches, restarts and stops the processes of running recipes.
///
/// Lock order: the environment map is never taken while an environment's
/// own lock is held.
pub struct ProcessSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn HealthProbe>,
    settings: SupervisorConfig,
    engines: EngineConfig,
    runtimes_dir: PathBuf,
    environments: RwLock<HashMap<String, Entry>>,
    probes: RwLock<HashMap<String, CachedProbe>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ProcessSupervisor {
    pub fn new(
        config: &FurnaceConfig,
        launcher: Arc<dyn ProcessLauncher>,
        probe: Arc<dyn HealthProbe>,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let supervisor = Self {
            launcher,
            probe,
            settings: config.supervisor.clone(),
            engines: config.engines.clone(),
            runtimes_dir: config.runtimes_dir(),
            environments: RwLock::new(HashMap::new()),
            probes: RwLock::new(HashMap::new()),
            events,
        };
        (supervisor, receiver)
    }

    /// Spawns the PHP-FPM runtime, then the serving engine. If the engine
    /// fails to spawn the runtime is stopped again.
    pub async fn launch(
        &self,
        recipe: &Recipe,
        allocation: &Allocation,
        rendered: &RenderedConfig,
    ) -> FurnaceResult<ProcessHandles> {
        if self.environments.read().await.contains_key(&recipe.name) {
            return Err(FurnaceError::conflict(
                &recipe.name,
                "processes are already supervised",
            ));
        }

        let runtime_spec = ProcessSpec::runtime(recipe, rendered, &self.runtimes_dir);
        let serving_spec = ProcessSpec::serving(recipe, rendered, &self.engines);

        let mut runtime = Supervised::new(runtime_spec.clone(), self.spawn(&runtime_spec).await?);
        let serving = match self.spawn(&serving_spec).await {
            Ok(child) => Supervised::new(serving_spec, child),
            Err(e) => {
                if let Err(stop_err) = self.stop_process(&mut runtime).await {
                    warn!(
                        "Failed to stop runtime of '{}' after launch error: {}",
                        recipe.name, stop_err
                    );
                }
                return Err(e);
            }
        };

        let launch_id = Uuid::new_v4();
        let handles = ProcessHandles {
            recipe_name: recipe.name.clone(),
            launch_id,
            runtime_pid: runtime.child.id(),
            serving_pid: serving.child.id(),
        };

        let env = SupervisedEnvironment {
            allocation: allocation.clone(),
            runtime,
            serving,
            watched: false,
            last_restart: None,
            restarts: 0,
        };
        self.environments.write().await.insert(
            recipe.name.clone(),
            Entry {
                launch_id,
                env: Arc::new(Mutex::new(env)),
            },
        );

        info!(
            "Launched '{}' (runtime pid {:?}, serving pid {:?})",
            recipe.name, handles.runtime_pid, handles.serving_pid
        );
        Ok(handles)
    }

    /// Gracefully stops both processes, serving engine first, killing any
    /// that outlive the grace period. Stopping an unknown launch is a no-op.
    ///
    /// If a process survives, the launch stays registered (unwatched) so
    /// the stop can be retried with the same handles.
    pub async fn stop(&self, handles: &ProcessHandles) -> FurnaceResult<()> {
        let Some(entry) = self.entry(&handles.recipe_name, handles.launch_id).await else {
            return Ok(());
        };

        {
            let mut env = entry.env.lock().await;
            env.watched = false;
            let serving = self.stop_process(&mut env.serving).await;
            let runtime = self.stop_process(&mut env.runtime).await;
            serving.and(runtime)?;
        }

        {
            let mut environments = self.environments.write().await;
            if environments
                .get(&handles.recipe_name)
                .map(|current| current.launch_id == handles.launch_id)
                .unwrap_or(false)
            {
                environments.remove(&handles.recipe_name);
            }
        }
        self.probes.write().await.remove(&handles.recipe_name);
        info!("Stopped processes of '{}'", handles.recipe_name);
        Ok(())
    }

    /// Liveness of both processes, then the site's health probe.
    pub async fn probe(&self, handles: &ProcessHandles) -> ProbeResult {
        let Some(entry) = self.entry(&handles.recipe_name, handles.launch_id).await else {
            return ProbeResult::Exited {
                role: ProcessRole::Serving,
                code: None,
            };
        };

        let allocation = {
            let mut env = entry.env.lock().await;
            if let Some((role, code)) = env.exited() {
                return ProbeResult::Exited { role, code };
            }
            env.allocation.clone()
        };

        let result = match self.probe.check(&allocation).await {
            Ok(()) => ProbeResult::Healthy,
            Err(reason) => ProbeResult::Unhealthy { reason },
        };
        debug!("Probe of '{}': {:?}", handles.recipe_name, result);
        self.cache(&handles.recipe_name, result.clone()).await;
        result
    }

    /// Builds the `Crashed` error for a process that exited, with its
    /// recent output.
    pub async fn crash_error(
        &self,
        handles: &ProcessHandles,
        role: ProcessRole,
        code: Option<i32>,
    ) -> FurnaceError {
        let output = match self.entry(&handles.recipe_name, handles.launch_id).await {
            Some(entry) => entry.env.lock().await.process_mut(role).child.recent_output(),
            None => Vec::new(),
        };
        crashed(&handles.recipe_name, role, code, &output)
    }

    /// Hands a healthy launch to background supervision.
    pub async fn watch(&self, handles: &ProcessHandles) -> FurnaceResult<()> {
        let entry = self
            .entry(&handles.recipe_name, handles.launch_id)
            .await
            .ok_or_else(|| FurnaceError::Internal(format!(
                "no supervised processes for '{}'",
                handles.recipe_name
            )))?;

        let mut env = entry.env.lock().await;
        env.watched = true;
        env.runtime.state = ProcessState::Running;
        env.serving.state = ProcessState::Running;
        debug!("Watching '{}'", handles.recipe_name);
        Ok(())
    }

    pub async fn cached_probe(&self, recipe_name: &str) -> Option<CachedProbe> {
        self.probes.read().await.get(recipe_name).cloned()
    }

    pub async fn process_states(&self, recipe_name: &str) -> Option<(ProcessState, ProcessState)> {
        let entry = self.environments.read().await.get(recipe_name).cloned()?;
        let env = entry.env.lock().await;
        Some((env.runtime.state, env.serving.state))
    }

    pub async fn is_supervised(&self, recipe_name: &str) -> bool {
        self.environments.read().await.contains_key(recipe_name)
    }

    /// One supervision pass over every watched environment.
    pub async fn tick(&self) {
        let entries: Vec<(String, Entry)> = self
            .environments
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();

        for (name, entry) in entries {
            self.supervise_once(&name, entry).await;
        }
    }

    /// Runs [`tick`](Self::tick) every probe interval until `token` is
    /// cancelled or the supervisor is dropped.
    pub fn spawn_monitor(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let supervisor = Arc::downgrade(self);
        let period = self.settings.probe_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(supervisor) = supervisor.upgrade() else { break };
                        supervisor.tick().await;
                    }
                }
            }
            debug!("Supervisor monitor stopped");
        })
    }

    async fn supervise_once(&self, name: &str, entry: Entry) {
        let mut env = entry.env.lock().await;
        if !env.watched {
            return;
        }

        let Some((role, code)) = env.exited() else {
            let allocation = env.allocation.clone();
            drop(env);
            let result = match self.probe.check(&allocation).await {
                Ok(()) => ProbeResult::Healthy,
                Err(reason) => ProbeResult::Unhealthy { reason },
            };
            if let ProbeResult::Unhealthy { reason } = &result {
                debug!("'{}' is unhealthy: {}", name, reason);
            }
            self.cache(name, result).await;
            return;
        };

        let output = env.process_mut(role).child.recent_output();
        let crash = crashed(name, role, code, &output);
        warn!("{}", crash);

        let cooldown = self.settings.restart_cooldown();
        let recently_restarted = env
            .last_restart
            .map(|at| at.elapsed() < cooldown)
            .unwrap_or(false);

        let failure = if recently_restarted {
            crash
        } else {
            match self.respawn(&mut env, role).await {
                Ok(pid) => {
                    env.restarts += 1;
                    env.last_restart = Some(Instant::now());
                    info!("Restarted {} of '{}' (pid {:?})", role, name, pid);
                    let _ = self.events.send(SupervisorEvent::Restarted {
                        recipe_name: name.to_string(),
                        launch_id: entry.launch_id,
                        role,
                        pid,
                    });
                    return;
                }
                Err(e) => e,
            }
        };

        error!("Giving up on '{}': {}", name, failure);
        env.watched = false;
        for role in [ProcessRole::Serving, ProcessRole::Runtime] {
            if let Err(e) = self.stop_process(env.process_mut(role)).await {
                warn!("Failed to stop {} of '{}': {}", role, name, e);
            }
        }
        drop(env);

        {
            let mut environments = self.environments.write().await;
            if environments
                .get(name)
                .map(|current| current.launch_id == entry.launch_id)
                .unwrap_or(false)
            {
                environments.remove(name);
            }
        }
        self.probes.write().await.remove(name);

        let _ = self.events.send(SupervisorEvent::Failed {
            recipe_name: name.to_string(),
            launch_id: entry.launch_id,
            error: failure,
        });
    }

    async fn respawn(
        &self,
        env: &mut SupervisedEnvironment,
        role: ProcessRole,
    ) -> FurnaceResult<Option<u32>> {
        let process = env.process_mut(role);
        let child = self.spawn(&process.spec).await?;
        process.child = child;
        process.state = ProcessState::Running;
        Ok(process.child.id())
    }

    async fn spawn(&self, spec: &ProcessSpec) -> FurnaceResult<Box<dyn ChildProcess>> {
        self.launcher
            .spawn(spec)
            .await
            .map_err(|e| FurnaceError::LaunchError {
                recipe: spec.recipe_name.clone(),
                role: spec.role.to_string(),
                reason: format!("{}: {}", spec.program.display(), e),
            })
    }

    async fn stop_process(&self, process: &mut Supervised) -> FurnaceResult<()> {
        if process.exit_status().is_some() {
            process.state = ProcessState::Stopped;
            return Ok(());
        }

        process.state = ProcessState::Stopping;
        let role = process.spec.role;
        let recipe = process.spec.recipe_name.clone();
        let grace = self.settings.grace_period();

        if let Err(e) = process.child.signal(process.spec.stop_signal) {
            warn!("Failed to signal {} of '{}': {}", role, recipe, e);
        }

        match timeout(grace, process.child.wait()).await {
            Ok(Ok(code)) => debug!("{} of '{}' exited with {:?}", role, recipe, code),
            Ok(Err(e)) => warn!("Failed to wait for {} of '{}': {}", role, recipe, e),
            Err(_) => {
                warn!(
                    "{} of '{}' still running after {}ms, killing it",
                    role,
                    recipe,
                    grace.as_millis()
                );
                let stop_failed = |reason: String| {
                    FurnaceError::Internal(format!(
                        "could not stop {} of '{}': {}",
                        role, recipe, reason
                    ))
                };
                process
                    .child
                    .kill()
                    .await
                    .map_err(|e| stop_failed(e.to_string()))?;
                timeout(grace, process.child.wait())
                    .await
                    .map_err(|_| stop_failed("still alive after kill".to_string()))?
                    .map_err(|e| stop_failed(e.to_string()))?;
            }
        }

        process.state = ProcessState::Stopped;
        Ok(())
    }

    async fn entry(&self, recipe_name: &str, launch_id: Uuid) -> Option<Entry> {
        self.environments
            .read()
            .await
            .get(recipe_name)
            .filter(|entry| entry.launch_id == launch_id)
            .cloned()
    }

    async fn cache(&self, recipe_name: &str, result: ProbeResult) {
        self.probes.write().await.insert(
            recipe_name.to_string(),
            CachedProbe {
                result,
                checked_at: Utc::now(),
            },
        );
    }
}

fn crashed(recipe: &str, role: ProcessRole, code: Option<i32>, output: &[String]) -> FurnaceError {
    let status = match code {
        Some(code) => format!("exited with code {}", code),
        None => "killed by a signal".to_string(),
    };
    let detail = if output.is_empty() {
        status
    } else {
        let tail = &output[output.len().saturating_sub(5)..];
        format!("{}; last output: {}", status, tail.join(" | "))
    };
    FurnaceError::Crashed {
        recipe: recipe.to_string(),
        role: role.to_string(),
        detail,
    }
}
