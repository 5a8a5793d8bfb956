//! Deterministic collaborators for tests and simulations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::{KernelError, PluginError};
use crate::identity::{AgentRef, RealmRef, TaskHandle};
use crate::orchestrator::{FiredTask, GenerationTask, TaskOrchestrator};
use crate::plugin::RealmPlugin;

/// A task recorded by [ManualOrchestrator].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledTask {
    pub handle: TaskHandle,
    pub task: GenerationTask,
    pub eta: Option<DateTime<Utc>>,
}

impl ScheduledTask {
    pub fn fired(&self) -> FiredTask {
        FiredTask {
            handle: self.handle.clone(),
            task: self.task.clone(),
        }
    }
}

#[derive(Default)]
struct ManualState {
    issued: u64,
    history: Vec<ScheduledTask>,
    pending: Vec<ScheduledTask>,
    cancelled: Vec<TaskHandle>,
    fail_schedule: bool,
}

/// Orchestrator that only records; tasks fire when the caller takes them.
#[derive(Default)]
pub struct ManualOrchestrator {
    state: Mutex<ManualState>,
}

impl ManualOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make subsequent `schedule` calls fail.
    pub fn fail_schedules(&self, fail: bool) {
        self.state().fail_schedule = fail;
    }

    /// Tasks scheduled and neither cancelled nor taken.
    pub fn pending(&self) -> Vec<ScheduledTask> {
        self.state().pending.clone()
    }

    /// Every task ever scheduled, in order.
    pub fn history(&self) -> Vec<ScheduledTask> {
        self.state().history.clone()
    }

    pub fn cancelled(&self) -> Vec<TaskHandle> {
        self.state().cancelled.clone()
    }

    /// Remove and return pending tasks due at `now`.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<FiredTask> {
        let mut state = self.state();
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|t| t.eta.map_or(true, |eta| eta <= now));
        state.pending = later;
        due.iter().map(ScheduledTask::fired).collect()
    }

    /// Remove and return every pending task regardless of eta.
    pub fn take_all(&self) -> Vec<FiredTask> {
        let mut state = self.state();
        std::mem::take(&mut state.pending)
            .iter()
            .map(ScheduledTask::fired)
            .collect()
    }
}

impl TaskOrchestrator for ManualOrchestrator {
    fn schedule(
        &self,
        task: GenerationTask,
        eta: Option<DateTime<Utc>>,
    ) -> Result<TaskHandle, KernelError> {
        let mut state = self.state();
        if state.fail_schedule {
            return Err(KernelError::Scheduling("task queue unavailable".into()));
        }
        state.issued += 1;
        let scheduled = ScheduledTask {
            handle: TaskHandle::new(format!("task-{}", state.issued)),
            task,
            eta,
        };
        state.history.push(scheduled.clone());
        state.pending.push(scheduled.clone());
        Ok(scheduled.handle)
    }

    fn cancel(&self, handle: &TaskHandle) -> Result<(), KernelError> {
        let mut state = self.state();
        state.pending.retain(|t| &t.handle != handle);
        state.cancelled.push(handle.clone());
        Ok(())
    }
}

/// Plugin with a configurable roster that records every generation call.
#[derive(Default)]
pub struct FakeRealmPlugin {
    agents: Mutex<Vec<AgentRef>>,
    failure: Mutex<Option<PluginError>>,
    panics: AtomicBool,
    auto_calls: Mutex<Vec<RealmRef>>,
    force_calls: Mutex<Vec<RealmRef>>,
}

impl FakeRealmPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agents(agents: Vec<AgentRef>) -> Self {
        let plugin = Self::default();
        plugin.set_agents(agents);
        plugin
    }

    pub fn set_agents(&self, agents: Vec<AgentRef>) {
        *self.agents.lock().unwrap_or_else(|e| e.into_inner()) = agents;
    }

    /// Make generation callbacks report `failure` (or succeed again with `None`).
    pub fn fail_with(&self, failure: Option<PluginError>) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = failure;
    }

    pub fn panic_on_generate(&self, panics: bool) {
        self.panics.store(panics, Ordering::SeqCst);
    }

    pub fn auto_generated(&self) -> Vec<RealmRef> {
        self.auto_calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn force_generated(&self) -> Vec<RealmRef> {
        self.force_calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn generation_count(&self) -> usize {
        self.auto_generated().len() + self.force_generated().len()
    }

    fn generate(&self, calls: &Mutex<Vec<RealmRef>>, realm: &RealmRef) -> Result<(), PluginError> {
        if self.panics.load(Ordering::SeqCst) {
            panic!("generation exploded for {realm}");
        }
        calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(realm.clone());
        match self.failure.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

impl RealmPlugin for FakeRealmPlugin {
    fn related_agents(&self, _realm: &RealmRef) -> Result<Vec<AgentRef>, PluginError> {
        Ok(self.agents.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn auto_generate(&self, realm: &RealmRef) -> Result<(), PluginError> {
        self.generate(&self.auto_calls, realm)
    }

    fn force_generate(&self, realm: &RealmRef) -> Result<(), PluginError> {
        self.generate(&self.force_calls, realm)
    }
}
