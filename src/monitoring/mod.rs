use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{EnvironmentInstance, EnvironmentState, FurnaceResult, Recipe};
use crate::environments::EnvironmentOrchestrator;
use crate::supervisor::{CachedProbe, ProbeResult};

pub mod telemetry;

pub use telemetry::{init_tracing, PerformanceTracker};

/// Logs the duration of the rest of the enclosing scope at debug level.
#[macro_export]
macro_rules! track_performance {
    ($name:expr) => {
        let _tracker = $crate::monitoring::PerformanceTracker::new($name);
    };
}

/// Point-in-time view of one recipe's environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub name: String,
    pub state: EnvironmentState,
    pub uptime_secs: Option<u64>,
    pub port: Option<u16>,
    pub site: String,
    pub last_error: Option<String>,
    pub health: Option<ProbeResult>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub restarts: u32,
    pub last_known_state: Option<EnvironmentState>,
    pub runtime_pid: Option<u32>,
    pub serving_pid: Option<u32>,
}

impl StatusSnapshot {
    /// Status as last recorded in the store, for callers that do not own the
    /// running environments.
    pub fn from_record(recipe: &Recipe) -> Self {
        let mut snapshot = Self::build(recipe, None, None, Utc::now());
        snapshot.state = recipe
            .last_known_state
            .unwrap_or(EnvironmentState::Stopped);
        snapshot
    }

    fn build(
        recipe: &Recipe,
        instance: Option<&EnvironmentInstance>,
        probe: Option<CachedProbe>,
        now: DateTime<Utc>,
    ) -> Self {
        let uptime_secs = instance
            .filter(|i| i.state == EnvironmentState::Running)
            .and_then(|i| i.started_at)
            .map(|started| (now - started).num_seconds().max(0) as u64);

        let last_health_check_at = [
            instance.and_then(|i| i.last_health_check_at),
            probe.as_ref().map(|p| p.checked_at),
        ]
        .into_iter()
        .flatten()
        .max();

        Self {
            name: recipe.name.clone(),
            state: instance
                .map(|i| i.state)
                .unwrap_or(EnvironmentState::Stopped),
            uptime_secs,
            port: instance.and_then(|i| i.allocation.as_ref().map(|a| a.port)),
            site: recipe.site_hostname.clone(),
            last_error: instance.and_then(|i| i.last_error.clone()),
            health: probe.map(|p| p.result),
            last_health_check_at,
            restarts: instance.map(|i| i.restarts).unwrap_or(0),
            last_known_state: recipe.last_known_state,
            runtime_pid: instance.and_then(|i| i.runtime_process_id),
            serving_pid: instance.and_then(|i| i.serving_process_id),
        }
    }
}

/// Read-only status view. Never probes processes itself: health comes from
/// the supervisor's last background check.
#[derive(Clone)]
pub struct StatusReporter {
    orchestrator: EnvironmentOrchestrator,
}

impl StatusReporter {
    pub fn new(orchestrator: EnvironmentOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub async fn status(&self, name: &str) -> FurnaceResult<StatusSnapshot> {
        let recipe = self.orchestrator.store().get(name).await?;
        let instance = self.orchestrator.instance(name).await;
        let probe = self.orchestrator.cached_probe(name).await;
        Ok(StatusSnapshot::build(
            &recipe,
            instance.as_ref(),
            probe,
            Utc::now(),
        ))
    }

    /// Every stored recipe, ordered by name.
    pub async fn status_all(&self) -> Vec<StatusSnapshot> {
        let instances = self.orchestrator.instances().await;
        let now = Utc::now();
        let mut snapshots = Vec::new();
        for recipe in self.orchestrator.store().list().await {
            let probe = self.orchestrator.cached_probe(&recipe.name).await;
            snapshots.push(StatusSnapshot::build(
                &recipe,
                instances.get(&recipe.name),
                probe,
                now,
            ));
        }
        snapshots
    }
}
