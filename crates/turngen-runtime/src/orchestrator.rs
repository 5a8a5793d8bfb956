//! Task orchestrator backed by Tokio timers.
//!
//! Each scheduled task is a sleeping Tokio task; on expiry it delivers a
//! [FiredTask] on the worker channel. Cancelling aborts the timer if it has
//! not fired yet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use turngen_kernel::{Clock, FiredTask, GenerationTask, KernelError, TaskHandle, TaskOrchestrator};

type Timers = Arc<Mutex<HashMap<TaskHandle, JoinHandle<()>>>>;

pub struct TokioTaskOrchestrator {
    runtime: Handle,
    sender: mpsc::UnboundedSender<FiredTask>,
    timers: Timers,
    clock: Arc<dyn Clock>,
}

impl TokioTaskOrchestrator {
    /// Orchestrator spawning on `runtime`, plus the receiving end for workers.
    pub fn new(
        runtime: Handle,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<FiredTask>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let orchestrator = Self {
            runtime,
            sender,
            timers: Arc::new(Mutex::new(HashMap::new())),
            clock,
        };
        (orchestrator, receiver)
    }

    /// Timers that have not fired or been cancelled.
    pub fn pending(&self) -> usize {
        self.timers.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Abort every pending timer.
    pub fn cancel_all(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, timer) in timers.drain() {
            timer.abort();
        }
    }
}

impl TaskOrchestrator for TokioTaskOrchestrator {
    fn schedule(
        &self,
        task: GenerationTask,
        eta: Option<DateTime<Utc>>,
    ) -> Result<TaskHandle, KernelError> {
        if self.sender.is_closed() {
            return Err(KernelError::Scheduling("worker channel closed".into()));
        }
        let handle = TaskHandle::generate();
        let delay = eta
            .and_then(|eta| (eta - self.clock.now()).to_std().ok())
            .unwrap_or_default();

        let fired = FiredTask {
            handle: handle.clone(),
            task,
        };
        let sender = self.sender.clone();
        let timers = self.timers.clone();

        // Held across spawn so the timer's own removal cannot precede insertion.
        let mut guard = self
            .timers
            .lock()
            .map_err(|e| KernelError::Scheduling(format!("timer table poisoned: {e}")))?;
        let timer = self.runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            timers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&fired.handle);
            let handle = fired.handle.clone();
            if sender.send(fired).is_err() {
                warn!("worker gone, dropping fired task {handle}");
            }
        });
        guard.insert(handle.clone(), timer);
        debug!("scheduled task {handle} in {delay:?}");
        Ok(handle)
    }

    fn cancel(&self, handle: &TaskHandle) -> Result<(), KernelError> {
        let timer = self
            .timers
            .lock()
            .map_err(|e| KernelError::Scheduling(format!("timer table poisoned: {e}")))?
            .remove(handle);
        if let Some(timer) = timer {
            timer.abort();
            debug!("cancelled task {handle}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use chrono::Duration;
    use turngen_kernel::SystemClock;

    use super::*;

    fn orchestrator() -> (TokioTaskOrchestrator, mpsc::UnboundedReceiver<FiredTask>) {
        TokioTaskOrchestrator::new(Handle::current(), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn immediate_task_fires() {
        let (orchestrator, mut rx) = orchestrator();
        let handle = orchestrator
            .schedule(GenerationTask::ready(7), None)
            .unwrap();
        let fired = tokio::time::timeout(StdDuration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired.handle, handle);
        assert_eq!(fired.task, GenerationTask::ready(7));
        assert_eq!(orchestrator.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_task_fires_at_eta() {
        let (orchestrator, mut rx) = orchestrator();
        let eta = Utc::now() + Duration::seconds(30);
        orchestrator
            .schedule(GenerationTask::timed(1), Some(eta))
            .unwrap();
        assert_eq!(orchestrator.pending(), 1);

        tokio::time::sleep(StdDuration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());

        let fired = tokio::time::timeout(StdDuration::from_secs(60), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired.task, GenerationTask::timed(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_never_fires() {
        let (orchestrator, mut rx) = orchestrator();
        let handle = orchestrator
            .schedule(
                GenerationTask::timed(1),
                Some(Utc::now() + Duration::seconds(5)),
            )
            .unwrap();
        orchestrator.cancel(&handle).unwrap();
        assert_eq!(orchestrator.pending(), 0);

        tokio::time::sleep(StdDuration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
        // Unknown handles are fine.
        orchestrator.cancel(&TaskHandle::new("nope")).unwrap();
    }

    #[tokio::test]
    async fn closed_channel_is_a_scheduling_failure() {
        let (orchestrator, rx) = orchestrator();
        drop(rx);
        let err = orchestrator
            .schedule(GenerationTask::ready(1), None)
            .unwrap_err();
        assert!(matches!(err, KernelError::Scheduling(_)));
    }
}
