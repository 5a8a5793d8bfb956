//! Worker loop: receives fired tasks and runs each attempt on the blocking pool.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use turngen_kernel::{AttemptOutcome, FiredTask, TurnScheduler};

/// Attempt result published to observers.
#[derive(Clone, Debug)]
pub struct AttemptReport {
    pub fired: FiredTask,
    /// Outcome, or the rendered error for storage and scheduling failures.
    pub outcome: Result<AttemptOutcome, String>,
}

pub struct GenerationWorker {
    scheduler: TurnScheduler,
    receiver: mpsc::UnboundedReceiver<FiredTask>,
    permits: Arc<Semaphore>,
    reports: Option<mpsc::UnboundedSender<AttemptReport>>,
}

impl GenerationWorker {
    pub fn new(
        scheduler: TurnScheduler,
        receiver: mpsc::UnboundedReceiver<FiredTask>,
        max_concurrent_attempts: usize,
    ) -> Self {
        Self {
            scheduler,
            receiver,
            permits: Arc::new(Semaphore::new(max_concurrent_attempts.max(1))),
            reports: None,
        }
    }

    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<AttemptReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Process fired tasks until the channel closes or `shutdown` flips to true,
    /// then wait for attempts still running so every lock is released.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut attempts = JoinSet::new();
        loop {
            let fired = tokio::select! {
                fired = self.receiver.recv() => match fired {
                    Some(fired) => fired,
                    None => break,
                },
                Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                    log_join(joined);
                    continue;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let scheduler = self.scheduler.clone();
            let reports = self.reports.clone();
            attempts.spawn_blocking(move || {
                let _permit = permit;
                let outcome = scheduler.handle_task(&fired);
                log_outcome(&fired, &outcome);
                if let Some(reports) = reports {
                    let _ = reports.send(AttemptReport {
                        fired,
                        outcome: outcome.map_err(|e| e.to_string()),
                    });
                }
            });
        }
        if !attempts.is_empty() {
            debug!("waiting for {} running attempts", attempts.len());
        }
        while let Some(joined) = attempts.join_next().await {
            log_join(joined);
        }
        debug!("generation worker stopped");
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        error!("generation attempt did not complete: {err}");
    }
}

fn log_outcome(fired: &FiredTask, outcome: &Result<AttemptOutcome, turngen_kernel::KernelError>) {
    let id = fired.task.generator_id;
    let trigger = fired.task.trigger.as_str();
    match outcome {
        Ok(AttemptOutcome::Generated { next_run }) => {
            info!("{trigger} attempt on generator {id} generated, next run {next_run:?}")
        }
        Ok(AttemptOutcome::Failed { error, next_run }) => {
            warn!("{trigger} attempt on generator {id} failed ({error}), next run {next_run:?}")
        }
        Ok(other) => debug!("{trigger} attempt on generator {id}: {other:?}"),
        Err(err) => error!("{trigger} attempt on generator {id} errored: {err}"),
    }
}
