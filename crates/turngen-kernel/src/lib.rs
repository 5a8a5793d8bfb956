//! Turn-generation kernel.
//!
//! Recurrence rules decide when a realm's next turn is due; a per-realm
//! generator record carries the schedule and an atomic lock; ready marks and
//! pauses let agents bring a turn forward or hold it back. Storage, task
//! execution, realm integration and time are collaborator traits.

pub mod attempt;
pub mod clock;
pub mod error;
pub mod identity;
pub mod models;
pub mod orchestrator;
pub mod plugin;
pub mod quorum;
pub mod recurrence;
pub mod repository;
pub mod scheduler;
pub mod store;
pub mod stubs;

pub use attempt::{next_time, AttemptOutcome, BlockReason, GenerationAttempt};
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{KernelError, PluginError};
pub use identity::{AgentRef, GeneratorId, RealmRef, RuleId, TaskHandle};
pub use models::{
    GenerationTime, Generator, GeneratorConfig, Pause, Ready, ScheduleUpdate, StoredRule,
};
pub use orchestrator::{FiredTask, GenerationTask, TaskOrchestrator, Trigger};
pub use plugin::{AliasOverrides, PluginEntry, PluginRegistry, PluginRegistryBuilder, RealmPlugin};
pub use quorum::is_ready;
pub use recurrence::{Frequency, RecurrenceRule, RecurrenceSet};
pub use repository::GeneratorRepository;
pub use scheduler::{GeneratorStatus, ScheduleAction, TurnScheduler};
pub use store::InMemoryGeneratorRepository;
pub use stubs::{FakeRealmPlugin, ManualOrchestrator, ScheduledTask};
