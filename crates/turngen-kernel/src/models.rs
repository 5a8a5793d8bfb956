//! Persisted records: the generator, its rules, pause/ready marks and the
//! generation log.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{AgentRef, GeneratorId, RealmRef, RuleId, TaskHandle};
use crate::recurrence::RecurrenceRule;

/// Scheduling flags of a generator, editable by the realm's host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Generate on the recurrence schedule.
    pub force_generate: bool,
    /// Generate early once every agent is ready.
    pub autogenerate: bool,
    /// Let agents suppress scheduled generation with a pause.
    pub allow_pauses: bool,
    /// Throttle for scheduled generation.
    #[serde(with = "opt_duration_secs")]
    pub minimum_between_generations: Option<Duration>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            force_generate: true,
            autogenerate: true,
            allow_pauses: true,
            minimum_between_generations: None,
        }
    }
}

/// Per-realm scheduling record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generator {
    pub id: GeneratorId,
    pub realm: RealmRef,
    /// Lock flag; only changed through conditional updates.
    pub generating: bool,
    /// Eta of the outstanding scheduled attempt.
    pub generation_time: Option<DateTime<Utc>>,
    /// Handle of the outstanding scheduled attempt.
    pub task_handle: Option<TaskHandle>,
    pub config: GeneratorConfig,
}

impl Generator {
    pub fn has_scheduled_task(&self) -> bool {
        self.task_handle.is_some()
    }
}

/// A recurrence rule owned by a generator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRule {
    pub id: RuleId,
    pub generator_id: GeneratorId,
    pub rule: RecurrenceRule,
}

/// Agent-held gate suppressing scheduled generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pause {
    pub generator_id: GeneratorId,
    pub agent: AgentRef,
    /// User acting for the agent, when known.
    pub user: Option<String>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Agent-held readiness vote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ready {
    pub generator_id: GeneratorId,
    pub agent: AgentRef,
    pub user: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Completed generation; the log is append-only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationTime {
    pub generator_id: GeneratorId,
    pub timestamp: DateTime<Utc>,
}

/// How a lock release or schedule write treats the (handle, eta) pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScheduleUpdate {
    /// Leave both fields untouched.
    Keep,
    /// Clear both fields.
    Clear,
    /// Record a newly scheduled task.
    Set {
        handle: TaskHandle,
        eta: DateTime<Utc>,
    },
}

impl ScheduleUpdate {
    /// Resulting (handle, eta) given the current pair.
    pub fn apply(
        &self,
        handle: Option<TaskHandle>,
        eta: Option<DateTime<Utc>>,
    ) -> (Option<TaskHandle>, Option<DateTime<Utc>>) {
        match self {
            Self::Keep => (handle, eta),
            Self::Clear => (None, None),
            Self::Set { handle, eta } => (Some(handle.clone()), Some(*eta)),
        }
    }
}

mod opt_duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.num_seconds()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<i64>::deserialize(d)?;
        Ok(secs.map(Duration::seconds))
    }
}
