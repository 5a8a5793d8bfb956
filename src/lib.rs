//! # turngen
//!
//! Turn-generation scheduling for turn-based realms.
//!
//! - [`kernel`]: recurrence rules, the generator state machine
//!   ([`kernel::TurnScheduler`]), ready quorum and the generation attempt
//!   protocol, behind repository, orchestrator, plugin and clock traits.
//! - [`runtime`]: Tokio task orchestrator, generation worker, reconciliation
//!   sweep, configuration and (feature `sqlite-persistence`) SQLite storage.
//!
//! ```no_run
//! use std::sync::Arc;
//! use turngen::kernel::{FakeRealmPlugin, PluginEntry, PluginRegistry};
//! use turngen::runtime::{RuntimeConfig, TurnRuntime};
//!
//! # async fn demo() -> Result<(), turngen::runtime::RuntimeError> {
//! let plugins = PluginRegistry::builder().register(
//!     PluginEntry::new("sample_app", Arc::new(FakeRealmPlugin::new()))
//!         .realm_type("testrealm", "sample_app.testrealm"),
//! );
//! let runtime = TurnRuntime::builder(RuntimeConfig::from_env()?, plugins).start()?;
//! let realm = runtime.scheduler().plugins().realm("testrealm", 1)?;
//! runtime.scheduler().create_generator(&realm, Default::default())?;
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub use turngen_kernel as kernel;
pub use turngen_runtime as runtime;

pub use turngen_kernel::{
    AttemptOutcome, Frequency, Generator, GeneratorConfig, KernelError, RealmPlugin,
    RecurrenceRule, TurnScheduler,
};
pub use turngen_runtime::{RuntimeConfig, RuntimeError, TurnRuntime};
