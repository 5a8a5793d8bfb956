//! Delayed-execution contract used to run generation attempts.
//!
//! Firings are at-least-once: a task may fire after it was cancelled, or more
//! than once. The attempt protocol absorbs both through the generator lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::identity::{GeneratorId, TaskHandle};

/// Why an attempt runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// The recurrence schedule fired.
    Timed,
    /// Every agent marked ready.
    Ready,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timed => "timed",
            Self::Ready => "ready",
        }
    }
}

/// Payload of a scheduled attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationTask {
    pub generator_id: GeneratorId,
    pub trigger: Trigger,
}

impl GenerationTask {
    pub fn timed(generator_id: GeneratorId) -> Self {
        Self {
            generator_id,
            trigger: Trigger::Timed,
        }
    }

    pub fn ready(generator_id: GeneratorId) -> Self {
        Self {
            generator_id,
            trigger: Trigger::Ready,
        }
    }
}

/// A task delivered by the orchestrator, with the handle it was scheduled under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiredTask {
    pub handle: TaskHandle,
    pub task: GenerationTask,
}

pub trait TaskOrchestrator: Send + Sync {
    /// Schedule `task` to fire at or after `eta`; `None` fires as soon as possible.
    fn schedule(
        &self,
        task: GenerationTask,
        eta: Option<DateTime<Utc>>,
    ) -> Result<TaskHandle, KernelError>;

    /// Best-effort cancellation. Unknown or already-fired handles are not an error.
    fn cancel(&self, handle: &TaskHandle) -> Result<(), KernelError>;
}
