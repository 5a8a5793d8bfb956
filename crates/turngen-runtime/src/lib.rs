//! Execution side of turngen: Tokio timers deliver fired tasks to a worker
//! that runs generation attempts, an optional sweep repairs lost schedules,
//! and generators persist in memory or SQLite.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod reconcile;
pub mod runtime;
pub mod sqlite_repository;
pub mod worker;

pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use orchestrator::TokioTaskOrchestrator;
pub use reconcile::{ReconcileConfig, ReconcileTickResult, Reconciler};
pub use runtime::{open_repository, TurnRuntime, TurnRuntimeBuilder};
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_repository::SqliteGeneratorRepository;
pub use worker::{AttemptReport, GenerationWorker};
