//! Generator state machine: reacts to configuration, rule, pause and ready
//! changes by scheduling or cancelling attempts, and runs fired attempts.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::Serialize;

use crate::attempt::{guarded, next_time, AttemptOutcome, GenerationAttempt};
use crate::clock::Clock;
use crate::error::KernelError;
use crate::identity::{AgentRef, GeneratorId, RealmRef, RuleId, TaskHandle};
use crate::models::{
    GenerationTime, Generator, GeneratorConfig, Pause, Ready, ScheduleUpdate, StoredRule,
};
use crate::orchestrator::{FiredTask, GenerationTask, TaskOrchestrator};
use crate::plugin::PluginRegistry;
use crate::quorum;
use crate::recurrence::RecurrenceRule;
use crate::repository::GeneratorRepository;

/// What a state transition did to the generator's schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScheduleAction {
    Unchanged,
    /// An immediate ready-quorum attempt was enqueued.
    ReadyEnqueued(TaskHandle),
    /// A timed attempt was scheduled and recorded.
    Scheduled {
        handle: TaskHandle,
        eta: DateTime<Utc>,
    },
    /// The recorded timed attempt was cancelled and cleared.
    Cancelled(TaskHandle),
}

/// Point-in-time view of a generator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GeneratorStatus {
    pub generator: Generator,
    pub ready: bool,
    pub waiting_on: Vec<AgentRef>,
    pub pauses: Vec<Pause>,
    pub readies: Vec<Ready>,
    pub last_generation: Option<DateTime<Utc>>,
    pub next_time: Option<DateTime<Utc>>,
}

/// Entry point for every mutation of a generator.
#[derive(Clone)]
pub struct TurnScheduler {
    repository: Arc<dyn GeneratorRepository>,
    orchestrator: Arc<dyn TaskOrchestrator>,
    plugins: Arc<PluginRegistry>,
    clock: Arc<dyn Clock>,
}

impl TurnScheduler {
    pub fn new(
        repository: Arc<dyn GeneratorRepository>,
        orchestrator: Arc<dyn TaskOrchestrator>,
        plugins: Arc<PluginRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            orchestrator,
            plugins,
            clock,
        }
    }

    pub fn repository(&self) -> &Arc<dyn GeneratorRepository> {
        &self.repository
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn generator(&self, id: GeneratorId) -> Result<Generator, KernelError> {
        self.repository
            .get_generator(id)?
            .ok_or(KernelError::GeneratorNotFound(id))
    }

    pub fn get_generator(&self, id: GeneratorId) -> Result<Option<Generator>, KernelError> {
        self.repository.get_generator(id)
    }

    pub fn find_generator(&self, realm: &RealmRef) -> Result<Option<Generator>, KernelError> {
        self.repository.find_generator(realm)
    }

    /// Opt a realm into turn generation.
    pub fn create_generator(
        &self,
        realm: &RealmRef,
        config: GeneratorConfig,
    ) -> Result<(Generator, ScheduleAction), KernelError> {
        self.plugins.plugin_for(realm)?;
        let generator = self.repository.create_generator(realm, &config)?;
        info!("created generator {} for {}", generator.id, realm);
        let action = self.config_saved(generator.id)?;
        Ok((self.generator(generator.id)?, action))
    }

    pub fn update_config(
        &self,
        id: GeneratorId,
        config: GeneratorConfig,
    ) -> Result<ScheduleAction, KernelError> {
        self.repository.update_config(id, &config)?;
        self.config_saved(id)
    }

    /// Cancel any outstanding task and remove the generator with its children.
    pub fn delete_generator(&self, id: GeneratorId) -> Result<bool, KernelError> {
        let Some(generator) = self.repository.get_generator(id)? else {
            return Ok(false);
        };
        if let Some(handle) = &generator.task_handle {
            if let Err(err) = self.orchestrator.cancel(handle) {
                warn!("could not cancel task {handle} of deleted {}: {err}", generator.realm);
            }
        }
        let deleted = self.repository.delete_generator(id)?;
        info!("deleted generator {id} for {}", generator.realm);
        Ok(deleted)
    }

    pub fn add_rule(
        &self,
        id: GeneratorId,
        rule: RecurrenceRule,
    ) -> Result<(StoredRule, ScheduleAction), KernelError> {
        rule.validate()?;
        let stored = self.repository.add_rule(id, &rule)?;
        let action = self.config_saved(id)?;
        Ok((stored, action))
    }

    pub fn remove_rule(
        &self,
        id: GeneratorId,
        rule_id: RuleId,
    ) -> Result<(bool, ScheduleAction), KernelError> {
        let removed = self.repository.remove_rule(id, rule_id)?;
        let action = self.config_saved(id)?;
        Ok((removed, action))
    }

    pub fn rules(&self, id: GeneratorId) -> Result<Vec<StoredRule>, KernelError> {
        self.repository.list_rules(id)
    }

    /// Record that `agent` is ready; enqueue an attempt once everyone is.
    pub fn mark_ready(
        &self,
        id: GeneratorId,
        agent: &AgentRef,
        user: Option<String>,
    ) -> Result<ScheduleAction, KernelError> {
        let generator = self.generator(id)?;
        let roster = self.roster(&generator.realm)?;
        ensure_member(&generator.realm, &roster, agent)?;

        self.repository.add_ready(&Ready {
            generator_id: id,
            agent: agent.clone(),
            user,
            timestamp: self.clock.now(),
        })?;
        debug!("{agent} is ready on {}", generator.realm);

        let readies = self.repository.list_readies(id)?;
        if generator.config.autogenerate && quorum::is_ready(&roster, &readies) {
            return self.enqueue_ready(&generator);
        }
        Ok(ScheduleAction::Unchanged)
    }

    pub fn unmark_ready(&self, id: GeneratorId, agent: &AgentRef) -> Result<bool, KernelError> {
        self.generator(id)?;
        self.repository.remove_ready(id, agent)
    }

    pub fn pause(
        &self,
        id: GeneratorId,
        agent: &AgentRef,
        user: Option<String>,
        reason: impl Into<String>,
    ) -> Result<(), KernelError> {
        let generator = self.generator(id)?;
        if !generator.config.allow_pauses {
            return Err(KernelError::PausesNotAllowed(id));
        }
        let roster = self.roster(&generator.realm)?;
        ensure_member(&generator.realm, &roster, agent)?;

        self.repository.add_pause(&Pause {
            generator_id: id,
            agent: agent.clone(),
            user,
            reason: reason.into(),
            timestamp: self.clock.now(),
        })?;
        info!("{agent} paused {}", generator.realm);
        Ok(())
    }

    /// Lift a pause; reschedule once the last pause is gone.
    pub fn unpause(&self, id: GeneratorId, agent: &AgentRef) -> Result<ScheduleAction, KernelError> {
        if !self.repository.remove_pause(id, agent)? {
            return Ok(ScheduleAction::Unchanged);
        }
        let generator = self.generator(id)?;
        info!("{agent} unpaused {}", generator.realm);
        if generator.config.force_generate
            && !generator.has_scheduled_task()
            && self.repository.list_pauses(id)?.is_empty()
        {
            return self.schedule_next(&generator);
        }
        Ok(ScheduleAction::Unchanged)
    }

    /// Run a fired task through the attempt protocol.
    pub fn handle_task(&self, fired: &FiredTask) -> Result<AttemptOutcome, KernelError> {
        GenerationAttempt::new(
            self.repository.as_ref(),
            self.orchestrator.as_ref(),
            &self.plugins,
            self.clock.as_ref(),
        )
        .run(fired)
    }

    pub fn is_ready(&self, id: GeneratorId) -> Result<bool, KernelError> {
        let generator = self.generator(id)?;
        let roster = self.roster(&generator.realm)?;
        Ok(quorum::is_ready(&roster, &self.repository.list_readies(id)?))
    }

    /// Next trigger time strictly after `cutoff` (default: now).
    pub fn next_time(
        &self,
        id: GeneratorId,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, KernelError> {
        let now = self.clock.now();
        next_time(self.repository.as_ref(), id, cutoff.unwrap_or(now), now)
    }

    pub fn generation_times(&self, id: GeneratorId) -> Result<Vec<GenerationTime>, KernelError> {
        self.repository.list_generation_times(id)
    }

    pub fn last_generation(&self, id: GeneratorId) -> Result<Option<DateTime<Utc>>, KernelError> {
        Ok(self.repository.last_generation(id)?.map(|t| t.timestamp))
    }

    pub fn status(&self, id: GeneratorId) -> Result<GeneratorStatus, KernelError> {
        let generator = self.generator(id)?;
        let roster = self.roster(&generator.realm)?;
        let readies = self.repository.list_readies(id)?;
        Ok(GeneratorStatus {
            ready: quorum::is_ready(&roster, &readies),
            waiting_on: quorum::waiting_on(&roster, &readies)
                .into_iter()
                .cloned()
                .collect(),
            pauses: self.repository.list_pauses(id)?,
            last_generation: self.last_generation(id)?,
            next_time: self.next_time(id, None)?,
            readies,
            generator,
        })
    }

    /// Reschedule a generator whose timed task is missing or overdue by more
    /// than `grace`. Generators that are locked, paused or not force-generating
    /// are left alone.
    pub fn recover_schedule(
        &self,
        id: GeneratorId,
        grace: Duration,
    ) -> Result<ScheduleAction, KernelError> {
        let generator = self.generator(id)?;
        if !generator.config.force_generate || generator.generating {
            return Ok(ScheduleAction::Unchanged);
        }
        if generator.config.allow_pauses && !self.repository.list_pauses(id)?.is_empty() {
            return Ok(ScheduleAction::Unchanged);
        }
        let now = self.clock.now();
        let overdue = match (&generator.task_handle, generator.generation_time) {
            (Some(_), Some(eta)) => eta + grace < now,
            _ => true,
        };
        if !overdue {
            return Ok(ScheduleAction::Unchanged);
        }

        let expected = generator.task_handle.as_ref();
        let Some(eta) = next_time(self.repository.as_ref(), id, now, now)? else {
            if let Some(stale) = expected {
                if self
                    .repository
                    .replace_schedule(id, Some(stale), &ScheduleUpdate::Clear)?
                {
                    self.orchestrator.cancel(stale)?;
                    return Ok(ScheduleAction::Cancelled(stale.clone()));
                }
            }
            return Ok(ScheduleAction::Unchanged);
        };

        let handle = self
            .orchestrator
            .schedule(GenerationTask::timed(id), Some(eta))?;
        let update = ScheduleUpdate::Set {
            handle: handle.clone(),
            eta,
        };
        if !self.repository.replace_schedule(id, expected, &update)? {
            self.orchestrator.cancel(&handle)?;
            return Ok(ScheduleAction::Unchanged);
        }
        if let Some(stale) = expected {
            warn!("task {stale} on {} is overdue, replaced by {handle}", generator.realm);
            self.orchestrator.cancel(stale)?;
        } else {
            warn!("{} had no scheduled task, scheduled {handle}", generator.realm);
        }
        Ok(ScheduleAction::Scheduled { handle, eta })
    }

    fn roster(&self, realm: &RealmRef) -> Result<Vec<AgentRef>, KernelError> {
        let plugin = self.plugins.plugin_for(realm)?;
        Ok(guarded(|| plugin.related_agents(realm))?)
    }

    /// Reaction to a saved configuration or rule change.
    fn config_saved(&self, id: GeneratorId) -> Result<ScheduleAction, KernelError> {
        let generator = self.generator(id)?;
        let config = &generator.config;

        if config.autogenerate {
            let roster = self.roster(&generator.realm)?;
            if quorum::is_ready(&roster, &self.repository.list_readies(id)?) {
                return self.enqueue_ready(&generator);
            }
        }
        if config.force_generate && !generator.has_scheduled_task() {
            return self.schedule_next(&generator);
        }
        if !config.force_generate {
            if let Some(handle) = &generator.task_handle {
                if self
                    .repository
                    .replace_schedule(id, Some(handle), &ScheduleUpdate::Clear)?
                {
                    self.orchestrator.cancel(handle)?;
                    info!("cancelled timed generation {handle} on {}", generator.realm);
                    return Ok(ScheduleAction::Cancelled(handle.clone()));
                }
            }
        }
        Ok(ScheduleAction::Unchanged)
    }

    fn enqueue_ready(&self, generator: &Generator) -> Result<ScheduleAction, KernelError> {
        let handle = self
            .orchestrator
            .schedule(GenerationTask::ready(generator.id), None)?;
        info!("every agent of {} is ready, enqueued {handle}", generator.realm);
        Ok(ScheduleAction::ReadyEnqueued(handle))
    }

    /// Schedule the next timed attempt if none is recorded.
    fn schedule_next(&self, generator: &Generator) -> Result<ScheduleAction, KernelError> {
        let now = self.clock.now();
        let Some(eta) = next_time(self.repository.as_ref(), generator.id, now, now)? else {
            debug!("no upcoming occurrences for {}", generator.realm);
            return Ok(ScheduleAction::Unchanged);
        };
        let handle = self
            .orchestrator
            .schedule(GenerationTask::timed(generator.id), Some(eta))?;
        let update = ScheduleUpdate::Set {
            handle: handle.clone(),
            eta,
        };
        if !self.repository.replace_schedule(generator.id, None, &update)? {
            debug!("{} was scheduled concurrently, dropping {handle}", generator.realm);
            self.orchestrator.cancel(&handle)?;
            return Ok(ScheduleAction::Unchanged);
        }
        info!("scheduled timed generation on {} at {eta} ({handle})", generator.realm);
        Ok(ScheduleAction::Scheduled { handle, eta })
    }
}

fn ensure_member(realm: &RealmRef, roster: &[AgentRef], agent: &AgentRef) -> Result<(), KernelError> {
    if roster.contains(agent) {
        Ok(())
    } else {
        Err(KernelError::UnknownAgent {
            realm: realm.clone(),
            agent: agent.clone(),
        })
    }
}
