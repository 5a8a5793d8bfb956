//! Storage façade for generators and their children.

use chrono::{DateTime, Utc};

use crate::error::KernelError;
use crate::identity::{AgentRef, GeneratorId, RealmRef, RuleId, TaskHandle};
use crate::models::{
    GenerationTime, Generator, GeneratorConfig, Pause, Ready, ScheduleUpdate, StoredRule,
};
use crate::recurrence::RecurrenceRule;

/// Repository contract used by the scheduler and the attempt protocol.
///
/// Implementations enforce uniqueness of the realm per generator and of the
/// agent per generator (independently for pauses and ready marks), cascade
/// deletes to children, and apply every multi-field write atomically. The
/// `generating` flag is only ever changed by [`try_acquire_lock`] and
/// [`release_lock`].
///
/// [`try_acquire_lock`]: GeneratorRepository::try_acquire_lock
/// [`release_lock`]: GeneratorRepository::release_lock
pub trait GeneratorRepository: Send + Sync {
    /// Insert a generator for `realm`; fails with `GeneratorExists` on a duplicate.
    fn create_generator(
        &self,
        realm: &RealmRef,
        config: &GeneratorConfig,
    ) -> Result<Generator, KernelError>;

    fn get_generator(&self, id: GeneratorId) -> Result<Option<Generator>, KernelError>;

    fn find_generator(&self, realm: &RealmRef) -> Result<Option<Generator>, KernelError>;

    fn list_generators(&self) -> Result<Vec<Generator>, KernelError>;

    /// Overwrite the scheduling flags; lock and schedule fields are untouched.
    fn update_config(&self, id: GeneratorId, config: &GeneratorConfig)
        -> Result<(), KernelError>;

    /// Delete a generator with its rules, marks and log. Returns whether it existed.
    fn delete_generator(&self, id: GeneratorId) -> Result<bool, KernelError>;

    fn add_rule(&self, id: GeneratorId, rule: &RecurrenceRule) -> Result<StoredRule, KernelError>;

    fn remove_rule(&self, id: GeneratorId, rule_id: RuleId) -> Result<bool, KernelError>;

    /// Rules in insertion order.
    fn list_rules(&self, id: GeneratorId) -> Result<Vec<StoredRule>, KernelError>;

    /// Insert a pause; fails with `AlreadyPaused` when the agent already holds one.
    fn add_pause(&self, pause: &Pause) -> Result<(), KernelError>;

    fn remove_pause(&self, id: GeneratorId, agent: &AgentRef) -> Result<bool, KernelError>;

    fn list_pauses(&self, id: GeneratorId) -> Result<Vec<Pause>, KernelError>;

    /// Insert a ready mark; fails with `AlreadyReady` when the agent already holds one.
    fn add_ready(&self, ready: &Ready) -> Result<(), KernelError>;

    fn remove_ready(&self, id: GeneratorId, agent: &AgentRef) -> Result<bool, KernelError>;

    fn list_readies(&self, id: GeneratorId) -> Result<Vec<Ready>, KernelError>;

    /// Remove every ready mark; returns how many were removed.
    fn clear_readies(&self, id: GeneratorId) -> Result<u64, KernelError>;

    fn append_generation_time(
        &self,
        id: GeneratorId,
        timestamp: DateTime<Utc>,
    ) -> Result<GenerationTime, KernelError>;

    /// Generation log, newest first.
    fn list_generation_times(&self, id: GeneratorId) -> Result<Vec<GenerationTime>, KernelError>;

    fn last_generation(&self, id: GeneratorId) -> Result<Option<GenerationTime>, KernelError> {
        Ok(self.list_generation_times(id)?.into_iter().next())
    }

    /// Compare-and-set `generating` from false to true. `Ok(false)` means another
    /// attempt holds the lock (or the generator no longer exists).
    fn try_acquire_lock(&self, id: GeneratorId) -> Result<bool, KernelError>;

    /// Clear `generating` and, if the recorded handle still equals `expected`,
    /// apply `schedule` in the same atomic write. Returns whether `schedule`
    /// was applied; `Keep` always is. A `false` means the schedule was
    /// rewritten while the lock was held and the newer record stands.
    fn release_lock(
        &self,
        id: GeneratorId,
        expected: Option<&TaskHandle>,
        schedule: &ScheduleUpdate,
    ) -> Result<bool, KernelError>;

    /// Apply `schedule` only if the recorded handle still equals `expected`.
    /// Returns whether the write happened.
    fn replace_schedule(
        &self,
        id: GeneratorId,
        expected: Option<&TaskHandle>,
        schedule: &ScheduleUpdate,
    ) -> Result<bool, KernelError>;
}
