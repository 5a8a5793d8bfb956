//! Kernel error types.

use thiserror::Error;

use crate::identity::{AgentRef, GeneratorId, RealmRef};

/// Errors surfaced by kernel operations and collaborator contracts.
///
/// Lock contention, policy blocks and plugin failures are not errors; they are
/// reported through [`crate::AttemptOutcome`].
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("generator not found: {0}")]
    GeneratorNotFound(GeneratorId),
    #[error("generator already exists for realm {0}")]
    GeneratorExists(RealmRef),
    #[error("no plugin registered for realm type: {0}")]
    UnknownRealmType(String),
    #[error("agent {agent} is not part of realm {realm}")]
    UnknownAgent { realm: RealmRef, agent: AgentRef },
    #[error("pauses are not enabled on generator {0}")]
    PausesNotAllowed(GeneratorId),
    #[error("agent {0} has already paused")]
    AlreadyPaused(AgentRef),
    #[error("agent {0} is already marked as ready")]
    AlreadyReady(AgentRef),
    #[error("invalid recurrence rule: {0}")]
    InvalidRule(String),
    #[error("plugin: {0}")]
    Plugin(#[from] PluginError),
    #[error("scheduling failed: {0}")]
    Scheduling(String),
    #[error("driver: {0}")]
    Driver(String),
}

/// Failure reported by a realm plugin callback.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PluginError {
    #[error("realm not found: {0}")]
    RealmNotFound(RealmRef),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("callback panicked: {0}")]
    Panicked(String),
}
