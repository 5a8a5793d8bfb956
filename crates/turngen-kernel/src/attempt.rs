//! Generation attempt protocol: lock, re-read, check, invoke, reschedule,
//! release.

use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{KernelError, PluginError};
use crate::identity::{GeneratorId, TaskHandle};
use crate::models::{Generator, ScheduleUpdate};
use crate::orchestrator::{FiredTask, GenerationTask, TaskOrchestrator, Trigger};
use crate::plugin::{PluginRegistry, RealmPlugin};
use crate::quorum;
use crate::recurrence::RecurrenceSet;
use crate::repository::GeneratorRepository;

/// Why an attempt stopped before invoking the plugin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    ForceGenerateDisabled,
    Paused,
    AutogenerateDisabled,
    QuorumNotReached,
    RosterUnavailable,
}

/// Result of one attempt. Everything here is a normal outcome; only storage
/// and scheduling failures are reported as `Err`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Another attempt holds the lock.
    Contended,
    /// The generator no longer exists.
    Vanished,
    /// A timed firing whose handle was replaced by a newer schedule.
    Superseded,
    Blocked(BlockReason),
    /// Too soon since the last generation; the callback was skipped.
    Throttled { next_run: Option<DateTime<Utc>> },
    Generated { next_run: Option<DateTime<Utc>> },
    /// The plugin reported failure or panicked.
    Failed {
        error: PluginError,
        next_run: Option<DateTime<Utc>>,
    },
}

impl AttemptOutcome {
    pub fn generated(&self) -> bool {
        matches!(self, Self::Generated { .. })
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Throttled { next_run }
            | Self::Generated { next_run }
            | Self::Failed { next_run, .. } => *next_run,
            _ => None,
        }
    }
}

/// Earliest trigger instant strictly after `cutoff` over the generator's rules.
pub fn next_time(
    repository: &dyn GeneratorRepository,
    id: GeneratorId,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, KernelError> {
    let rules: RecurrenceSet = repository
        .list_rules(id)?
        .into_iter()
        .map(|stored| stored.rule)
        .collect();
    Ok(rules.next_after(cutoff, now))
}

/// Run a plugin callback, turning a panic into a [PluginError].
pub(crate) fn guarded<T>(f: impl FnOnce() -> Result<T, PluginError>) -> Result<T, PluginError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(PluginError::Panicked(message))
        }
    }
}

enum Invocation {
    Skipped,
    Succeeded,
    Failed(PluginError),
}

/// Lock release to apply, with the result to hand back once released.
struct Settlement {
    outcome: Result<AttemptOutcome, KernelError>,
    release: ScheduleUpdate,
}

impl Settlement {
    fn new(outcome: AttemptOutcome, release: ScheduleUpdate) -> Self {
        Self {
            outcome: Ok(outcome),
            release,
        }
    }

    fn failed(err: KernelError, release: ScheduleUpdate) -> Self {
        Self {
            outcome: Err(err),
            release,
        }
    }
}

/// One execution of the protocol against borrowed collaborators.
pub struct GenerationAttempt<'a> {
    repository: &'a dyn GeneratorRepository,
    orchestrator: &'a dyn TaskOrchestrator,
    plugins: &'a PluginRegistry,
    clock: &'a dyn Clock,
}

impl<'a> GenerationAttempt<'a> {
    pub fn new(
        repository: &'a dyn GeneratorRepository,
        orchestrator: &'a dyn TaskOrchestrator,
        plugins: &'a PluginRegistry,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            repository,
            orchestrator,
            plugins,
            clock,
        }
    }

    pub fn run(&self, fired: &FiredTask) -> Result<AttemptOutcome, KernelError> {
        let id = fired.task.generator_id;
        if !self.repository.try_acquire_lock(id)? {
            return match self.repository.get_generator(id)? {
                Some(generator) => {
                    warn!(
                        "generation already in progress on {}, aborting",
                        generator.realm
                    );
                    Ok(AttemptOutcome::Contended)
                }
                None => {
                    warn!("generator {id} no longer exists, dropping {} task", fired.task.trigger.as_str());
                    Ok(AttemptOutcome::Vanished)
                }
            };
        }

        let (settlement, observed) = match self.run_locked(id, fired) {
            Ok(settled) => settled,
            Err(err) => (Settlement::failed(err, ScheduleUpdate::Keep), None),
        };

        let applied = match self
            .repository
            .release_lock(id, observed.as_ref(), &settlement.release)
        {
            Ok(applied) => applied,
            Err(KernelError::GeneratorNotFound(_)) => return settlement.outcome,
            Err(err) => return Err(err),
        };
        if applied {
            // The recorded handle, unless it is the task now running.
            let stale = observed.filter(|handle| handle != &fired.handle);
            if let Some(stale) = stale.filter(|_| settlement.release != ScheduleUpdate::Keep) {
                self.cancel(&stale)?;
            }
        } else {
            info!("schedule of generator {id} changed during the attempt, keeping it");
            if let ScheduleUpdate::Set { handle, .. } = &settlement.release {
                self.cancel(handle)?;
            }
        }
        settlement.outcome
    }

    /// Settle the attempt; also returns the handle recorded when it began.
    fn run_locked(
        &self,
        id: GeneratorId,
        fired: &FiredTask,
    ) -> Result<(Settlement, Option<TaskHandle>), KernelError> {
        let Some(generator) = self.repository.get_generator(id)? else {
            return Ok((
                Settlement::new(AttemptOutcome::Vanished, ScheduleUpdate::Keep),
                None,
            ));
        };
        let settlement = match fired.task.trigger {
            Trigger::Timed => self.timed(&generator, fired)?,
            Trigger::Ready => self.ready(&generator, fired)?,
        };
        Ok((settlement, generator.task_handle))
    }

    fn timed(&self, generator: &Generator, fired: &FiredTask) -> Result<Settlement, KernelError> {
        info!("beginning timed generation on {}", generator.realm);

        if let Some(current) = &generator.task_handle {
            if current != &fired.handle {
                info!(
                    "task {} on {} was superseded by {}, aborting",
                    fired.handle, generator.realm, current
                );
                return Ok(Settlement::new(AttemptOutcome::Superseded, ScheduleUpdate::Keep));
            }
        }

        let config = &generator.config;
        if !config.force_generate {
            info!("timed generation disabled on {}, aborting", generator.realm);
            return Ok(Settlement::new(
                AttemptOutcome::Blocked(BlockReason::ForceGenerateDisabled),
                ScheduleUpdate::Clear,
            ));
        }
        if config.allow_pauses && !self.repository.list_pauses(generator.id)?.is_empty() {
            info!("pauses in effect on {}, aborting", generator.realm);
            return Ok(Settlement::new(
                AttemptOutcome::Blocked(BlockReason::Paused),
                ScheduleUpdate::Clear,
            ));
        }

        let throttled = match config.minimum_between_generations {
            Some(minimum) => self
                .repository
                .last_generation(generator.id)?
                .is_some_and(|last| self.clock.now() - last.timestamp < minimum),
            None => false,
        };
        let invocation = if throttled {
            info!(
                "insufficient time since last generation on {}, skipping",
                generator.realm
            );
            Invocation::Skipped
        } else {
            let plugin = self.plugins.plugin_for(&generator.realm)?;
            self.invoke(generator, plugin.as_ref(), Trigger::Timed)?
        };

        let settlement = self.reschedule(generator, fired, invocation)?;
        info!("ending timed generation on {}", generator.realm);
        Ok(settlement)
    }

    fn ready(&self, generator: &Generator, fired: &FiredTask) -> Result<Settlement, KernelError> {
        info!("beginning auto-generation on {}", generator.realm);

        if !generator.config.autogenerate {
            info!("auto-generation disabled on {}, aborting", generator.realm);
            return Ok(Settlement::new(
                AttemptOutcome::Blocked(BlockReason::AutogenerateDisabled),
                ScheduleUpdate::Keep,
            ));
        }

        let plugin = self.plugins.plugin_for(&generator.realm)?;
        let roster = match guarded(|| plugin.related_agents(&generator.realm)) {
            Ok(roster) => roster,
            Err(err) => {
                error!("could not list agents of {}: {err}", generator.realm);
                return Ok(Settlement::new(
                    AttemptOutcome::Blocked(BlockReason::RosterUnavailable),
                    ScheduleUpdate::Keep,
                ));
            }
        };
        let readies = self.repository.list_readies(generator.id)?;
        if !quorum::is_ready(&roster, &readies) {
            info!("not every agent of {} is ready, aborting", generator.realm);
            return Ok(Settlement::new(
                AttemptOutcome::Blocked(BlockReason::QuorumNotReached),
                ScheduleUpdate::Keep,
            ));
        }

        let invocation = self.invoke(generator, plugin.as_ref(), Trigger::Ready)?;
        let settlement = self.reschedule(generator, fired, invocation)?;
        info!("ending auto-generation on {}", generator.realm);
        Ok(settlement)
    }

    fn invoke(
        &self,
        generator: &Generator,
        plugin: &dyn RealmPlugin,
        trigger: Trigger,
    ) -> Result<Invocation, KernelError> {
        let realm = &generator.realm;
        let result = guarded(|| match trigger {
            Trigger::Timed => plugin.force_generate(realm),
            Trigger::Ready => plugin.auto_generate(realm),
        });
        match result {
            Ok(()) => {
                self.repository
                    .append_generation_time(generator.id, self.clock.now())?;
                let cleared = self.repository.clear_readies(generator.id)?;
                debug!("generated on {realm}, cleared {cleared} ready marks");
                Ok(Invocation::Succeeded)
            }
            Err(err) => {
                error!("generation failed on {realm}: {err}");
                Ok(Invocation::Failed(err))
            }
        }
    }

    fn reschedule(
        &self,
        generator: &Generator,
        fired: &FiredTask,
        invocation: Invocation,
    ) -> Result<Settlement, KernelError> {
        let (next_run, release) = if generator.config.force_generate {
            let now = self.clock.now();
            match next_time(self.repository, generator.id, now, now)? {
                Some(eta) => {
                    let handle = match self
                        .orchestrator
                        .schedule(GenerationTask::timed(generator.id), Some(eta))
                    {
                        Ok(handle) => handle,
                        Err(err) => {
                            error!("could not schedule next generation on {}: {err}", generator.realm);
                            let fallback = match fired.task.trigger {
                                Trigger::Timed => ScheduleUpdate::Clear,
                                Trigger::Ready => ScheduleUpdate::Keep,
                            };
                            return Ok(Settlement::failed(err, fallback));
                        }
                    };
                    debug!("next generation on {} at {eta} ({handle})", generator.realm);
                    (Some(eta), ScheduleUpdate::Set { handle, eta })
                }
                None => {
                    debug!("no further occurrences for {}", generator.realm);
                    (None, ScheduleUpdate::Clear)
                }
            }
        } else {
            (None, ScheduleUpdate::Keep)
        };

        let outcome = match invocation {
            Invocation::Skipped => AttemptOutcome::Throttled { next_run },
            Invocation::Succeeded => AttemptOutcome::Generated { next_run },
            Invocation::Failed(error) => AttemptOutcome::Failed { error, next_run },
        };
        Ok(Settlement::new(outcome, release))
    }

    fn cancel(&self, handle: &TaskHandle) -> Result<(), KernelError> {
        self.orchestrator.cancel(handle).map_err(|err| {
            error!("could not cancel task {handle}: {err}");
            err
        })
    }
}
