//! Compensating sweep for timed tasks lost by the orchestrator.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use log::{debug, info, warn};
use tokio::sync::watch;
use turngen_kernel::{KernelError, ScheduleAction, TurnScheduler};

/// Sweep tuning knobs.
#[derive(Clone, Debug)]
pub struct ReconcileConfig {
    pub interval: StdDuration,
    pub overdue_grace: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: StdDuration::from_secs(60),
            overdue_grace: Duration::seconds(60),
        }
    }
}

/// Result of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileTickResult {
    pub examined: u64,
    pub rescheduled: u64,
    pub cleared: u64,
    pub failed: u64,
}

pub struct Reconciler {
    scheduler: TurnScheduler,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(scheduler: TurnScheduler, config: ReconcileConfig) -> Self {
        Self { scheduler, config }
    }

    /// Examine every generator once, at the scheduler's current time.
    pub fn tick(&self) -> Result<ReconcileTickResult, KernelError> {
        let mut result = ReconcileTickResult::default();
        for generator in self.scheduler.repository().list_generators()? {
            result.examined += 1;
            match self
                .scheduler
                .recover_schedule(generator.id, self.config.overdue_grace)
            {
                Ok(ScheduleAction::Scheduled { .. }) => result.rescheduled += 1,
                Ok(ScheduleAction::Cancelled(_)) => result.cleared += 1,
                Ok(_) | Err(KernelError::GeneratorNotFound(_)) => {}
                Err(err) => {
                    warn!("could not reconcile {}: {err}", generator.realm);
                    result.failed += 1;
                }
            }
        }
        if result.rescheduled + result.cleared > 0 {
            info!(
                "reconciled {} generators: {} rescheduled, {} cleared",
                result.examined, result.rescheduled, result.cleared
            );
        } else {
            debug!("reconciled {} generators, nothing to do", result.examined);
        }
        Ok(result)
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let reconciler = Arc::new(self);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let r = reconciler.clone();
                    match tokio::task::spawn_blocking(move || r.tick()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => warn!("reconcile sweep failed: {err}"),
                        Err(err) => warn!("reconcile sweep aborted: {err}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("reconciler stopped");
    }
}
