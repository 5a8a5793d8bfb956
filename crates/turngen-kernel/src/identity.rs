//! Identity types: realms, agents, generators and task handles.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Generator primary key.
pub type GeneratorId = u64;

/// Recurrence rule primary key (unique within the whole store).
pub type RuleId = u64;

/// Polymorphic reference to a realm: a type key resolved through the plugin
/// registry plus the realm's id within that type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RealmRef {
    pub kind: String,
    pub id: u64,
}

impl RealmRef {
    pub fn new(kind: impl Into<String>, id: u64) -> Self {
        Self {
            kind: kind.into(),
            id,
        }
    }
}

impl fmt::Display for RealmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(id={})", self.kind, self.id)
    }
}

/// Polymorphic reference to an agent (a realm participant).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentRef {
    pub kind: String,
    pub id: u64,
}

impl AgentRef {
    pub fn new(kind: impl Into<String>, id: u64) -> Self {
        Self {
            kind: kind.into(),
            id,
        }
    }
}

impl fmt::Display for AgentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(id={})", self.kind, self.id)
    }
}

/// Opaque identifier of a task handed out by a task orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh random handle.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refs_display_type_and_id() {
        assert_eq!(RealmRef::new("testrealm", 3).to_string(), "testrealm(id=3)");
        assert_eq!(AgentRef::new("testagent", 5).to_string(), "testagent(id=5)");
    }

    #[test]
    fn generated_handles_are_distinct() {
        let a = TaskHandle::generate();
        let b = TaskHandle::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }
}
