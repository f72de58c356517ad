//! Fault-injecting launcher and probe for driving the supervisor without
//! real processes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

use super::probe::HealthProbe;
use super::process::{ChildProcess, ProcessLauncher, ProcessRole, ProcessSpec, StopSignal};
use crate::core::Allocation;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

struct MockProcess {
    recipe_name: String,
    role: ProcessRole,
    pid: u32,
    exit: Mutex<Option<Option<i32>>>,
    exited: Notify,
    signals: Mutex<Vec<StopSignal>>,
    ignore_signals: bool,
    unkillable: AtomicBool,
}

impl MockProcess {
    fn exit(&self, code: Option<i32>) {
        let mut exit = lock(&self.exit);
        if exit.is_none() {
            *exit = Some(code);
            drop(exit);
            self.exited.notify_waiters();
        }
    }

    fn is_alive(&self) -> bool {
        lock(&self.exit).is_none()
    }
}

struct MockChild(Arc<MockProcess>);

#[async_trait]
impl ChildProcess for MockChild {
    fn id(&self) -> Option<u32> {
        Some(self.0.pid)
    }

    fn try_wait(&mut self) -> io::Result<Option<Option<i32>>> {
        Ok(*lock(&self.0.exit))
    }

    fn signal(&mut self, signal: StopSignal) -> io::Result<()> {
        lock(&self.0.signals).push(signal);
        if !self.0.ignore_signals {
            self.0.exit(Some(0));
        }
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        if self.0.unkillable.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "operation not permitted",
            ));
        }
        self.0.exit(None);
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        loop {
            let notified = self.0.exited.notified();
            if let Some(code) = *lock(&self.0.exit) {
                return Ok(code);
            }
            notified.await;
        }
    }

    fn recent_output(&self) -> Vec<String> {
        vec![format!("{} for '{}' (mock)", self.0.role, self.0.recipe_name)]
    }
}

#[derive(Default)]
struct MockState {
    next_pid: u32,
    spawned: Vec<ProcessSpec>,
    processes: Vec<Arc<MockProcess>>,
    spawn_failures: HashMap<ProcessRole, String>,
    ignore_signals: bool,
    fail_kills: bool,
}

/// Launcher whose children live only in memory.
#[derive(Default)]
pub struct MockLauncher {
    state: Mutex<MockState>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every spawn of `role` fail with `reason`, or succeed again
    /// with `None`.
    pub fn fail_spawns(&self, role: ProcessRole, reason: Option<&str>) {
        let mut state = lock(&self.state);
        match reason {
            Some(reason) => state.spawn_failures.insert(role, reason.to_string()),
            None => state.spawn_failures.remove(&role),
        };
    }

    /// Children spawned from now on ignore graceful stop signals.
    pub fn ignore_stop_signals(&self, ignore: bool) {
        lock(&self.state).ignore_signals = ignore;
    }

    /// Makes forced kills fail, for live children and ones spawned later.
    pub fn fail_kills(&self, fail: bool) {
        let mut state = lock(&self.state);
        state.fail_kills = fail;
        for process in &state.processes {
            process.unkillable.store(fail, Ordering::SeqCst);
        }
    }

    /// Kills the live `role` process of `recipe_name` with exit code 1.
    /// Returns false when there was none.
    pub fn crash(&self, recipe_name: &str, role: ProcessRole) -> bool {
        let state = lock(&self.state);
        match state
            .processes
            .iter()
            .rev()
            .find(|p| p.recipe_name == recipe_name && p.role == role && p.is_alive())
        {
            Some(process) => {
                process.exit(Some(1));
                true
            }
            None => false,
        }
    }

    pub fn spawned(&self) -> Vec<ProcessSpec> {
        lock(&self.state).spawned.clone()
    }

    pub fn spawn_count(&self, recipe_name: &str, role: ProcessRole) -> usize {
        lock(&self.state)
            .spawned
            .iter()
            .filter(|s| s.recipe_name == recipe_name && s.role == role)
            .count()
    }

    pub fn live_processes(&self) -> usize {
        lock(&self.state)
            .processes
            .iter()
            .filter(|p| p.is_alive())
            .count()
    }

    pub fn live_processes_of(&self, recipe_name: &str) -> usize {
        lock(&self.state)
            .processes
            .iter()
            .filter(|p| p.recipe_name == recipe_name && p.is_alive())
            .count()
    }

    /// Stop signals received by `recipe_name`'s `role` processes, oldest first.
    pub fn signals_sent(&self, recipe_name: &str, role: ProcessRole) -> Vec<StopSignal> {
        lock(&self.state)
            .processes
            .iter()
            .filter(|p| p.recipe_name == recipe_name && p.role == role)
            .flat_map(|p| lock(&p.signals).clone())
            .collect()
    }
}

#[async_trait]
impl ProcessLauncher for MockLauncher {
    async fn spawn(&self, spec: &ProcessSpec) -> io::Result<Box<dyn ChildProcess>> {
        let mut state = lock(&self.state);
        state.spawned.push(spec.clone());

        if let Some(reason) = state.spawn_failures.get(&spec.role) {
            return Err(io::Error::new(io::ErrorKind::NotFound, reason.clone()));
        }

        state.next_pid += 1;
        let process = Arc::new(MockProcess {
            recipe_name: spec.recipe_name.clone(),
            role: spec.role,
            pid: 10_000 + state.next_pid,
            exit: Mutex::new(None),
            exited: Notify::new(),
            signals: Mutex::new(Vec::new()),
            ignore_signals: state.ignore_signals,
            unkillable: AtomicBool::new(state.fail_kills),
        });
        state.processes.push(process.clone());
        Ok(Box::new(MockChild(process)))
    }
}

/// Probe returning a configurable verdict.
pub struct StaticProbe {
    result: Mutex<Result<(), String>>,
    calls: AtomicUsize,
}

impl StaticProbe {
    pub fn healthy() -> Self {
        Self {
            result: Mutex::new(Ok(())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unhealthy(reason: &str) -> Self {
        Self {
            result: Mutex::new(Err(reason.to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, result: Result<(), String>) {
        *lock(&self.result) = result;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn check(&self, _allocation: &Allocation) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.result).clone()
    }
}
