//! Wiring: repository, Tokio orchestrator, scheduler, worker and sweep.

use std::sync::Arc;

use log::info;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use turngen_kernel::{
    Clock, GeneratorRepository, InMemoryGeneratorRepository, PluginRegistryBuilder, SystemClock,
    TurnScheduler,
};

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::orchestrator::TokioTaskOrchestrator;
use crate::reconcile::Reconciler;
use crate::worker::{AttemptReport, GenerationWorker};

/// Repository selected by `config`: SQLite when a path is set, memory otherwise.
pub fn open_repository(config: &RuntimeConfig) -> Result<Arc<dyn GeneratorRepository>, RuntimeError> {
    match &config.sqlite_db {
        None => Ok(Arc::new(InMemoryGeneratorRepository::new())),
        #[cfg(feature = "sqlite-persistence")]
        Some(path) => Ok(Arc::new(
            crate::sqlite_repository::SqliteGeneratorRepository::new(path)?,
        )),
        #[cfg(not(feature = "sqlite-persistence"))]
        Some(path) => Err(RuntimeError::Config(format!(
            "sqlite_db={path:?} requires the sqlite-persistence feature"
        ))),
    }
}

pub struct TurnRuntimeBuilder {
    config: RuntimeConfig,
    plugins: PluginRegistryBuilder,
    repository: Option<Arc<dyn GeneratorRepository>>,
    clock: Arc<dyn Clock>,
    reports: Option<mpsc::UnboundedSender<AttemptReport>>,
}

impl TurnRuntimeBuilder {
    pub fn repository(mut self, repository: Arc<dyn GeneratorRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish every attempt outcome on `reports`.
    pub fn reports(mut self, reports: mpsc::UnboundedSender<AttemptReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Spawn the worker (and sweep, if configured) on the current Tokio runtime.
    pub fn start(self) -> Result<TurnRuntime, RuntimeError> {
        self.config.validate()?;
        let handle = Handle::try_current().map_err(|e| RuntimeError::NoRuntime(e.to_string()))?;
        let repository = match self.repository {
            Some(repository) => repository,
            None => open_repository(&self.config)?,
        };
        let plugins = self.config.apply_overrides(self.plugins).build();

        let (orchestrator, fired) = TokioTaskOrchestrator::new(handle.clone(), self.clock.clone());
        let orchestrator = Arc::new(orchestrator);
        let scheduler = TurnScheduler::new(
            repository,
            orchestrator.clone(),
            Arc::new(plugins),
            self.clock,
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut worker = GenerationWorker::new(
            scheduler.clone(),
            fired,
            self.config.max_concurrent_attempts,
        );
        if let Some(reports) = self.reports {
            worker = worker.with_reports(reports);
        }
        let worker = handle.spawn(worker.run(shutdown_rx.clone()));

        let reconciler = self.config.reconcile().map(|sweep| {
            info!("reconciliation sweep every {:?}", sweep.interval);
            handle.spawn(Reconciler::new(scheduler.clone(), sweep).run(shutdown_rx))
        });

        info!(
            "turn runtime started (max {} concurrent attempts)",
            self.config.max_concurrent_attempts
        );
        Ok(TurnRuntime {
            scheduler,
            orchestrator,
            shutdown,
            worker,
            reconciler,
        })
    }
}

/// Running scheduler with its background tasks.
pub struct TurnRuntime {
    scheduler: TurnScheduler,
    orchestrator: Arc<TokioTaskOrchestrator>,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
    reconciler: Option<JoinHandle<()>>,
}

impl TurnRuntime {
    pub fn builder(config: RuntimeConfig, plugins: PluginRegistryBuilder) -> TurnRuntimeBuilder {
        TurnRuntimeBuilder {
            config,
            plugins,
            repository: None,
            clock: Arc::new(SystemClock),
            reports: None,
        }
    }

    pub fn scheduler(&self) -> &TurnScheduler {
        &self.scheduler
    }

    /// Timers still waiting to fire.
    pub fn pending_tasks(&self) -> usize {
        self.orchestrator.pending()
    }

    /// Stop the worker and sweep and drop pending timers. Returns once every
    /// running attempt has released its lock. Recorded schedules stay in the
    /// repository; the sweep picks them up after a restart.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.orchestrator.cancel_all();
        let _ = self.worker.await;
        if let Some(reconciler) = self.reconciler {
            let _ = reconciler.await;
        }
        info!("turn runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use turngen_kernel::{
        AgentRef, AttemptOutcome, FakeRealmPlugin, GeneratorConfig, PluginEntry, PluginRegistry,
        Trigger,
    };

    use super::*;

    fn plugins(plugin: Arc<FakeRealmPlugin>) -> PluginRegistryBuilder {
        PluginRegistry::builder().register(
            PluginEntry::new("sample_app", plugin)
                .realm_type("testrealm", "sample_app.testrealm")
                .agent_type("testagent", "sample_app.testagent"),
        )
    }

    fn agent(id: u64) -> AgentRef {
        AgentRef::new("sample_app.testagent", id)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ready_quorum_runs_one_attempt_end_to_end() {
        let _ = env_logger::builder().is_test(true).try_init();
        let plugin = Arc::new(FakeRealmPlugin::with_agents(vec![agent(1), agent(2)]));
        let (reports, mut outcomes) = mpsc::unbounded_channel();
        let runtime = TurnRuntime::builder(RuntimeConfig::default(), plugins(plugin.clone()))
            .reports(reports)
            .start()
            .unwrap();

        let scheduler = runtime.scheduler().clone();
        let realm = scheduler.plugins().realm("testrealm", 1).unwrap();
        let generator = tokio::task::spawn_blocking(move || {
            let (g, _) = scheduler
                .create_generator(&realm, GeneratorConfig::default())
                .unwrap();
            scheduler.mark_ready(g.id, &agent(1), None).unwrap();
            scheduler.mark_ready(g.id, &agent(2), None).unwrap();
            g
        })
        .await
        .unwrap();

        let report = tokio::time::timeout(StdDuration::from_secs(5), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.fired.task.generator_id, generator.id);
        assert_eq!(report.fired.task.trigger, Trigger::Ready);
        assert_eq!(
            report.outcome.unwrap(),
            AttemptOutcome::Generated { next_run: None }
        );
        assert_eq!(plugin.auto_generated().len(), 1);
        assert_eq!(
            runtime
                .scheduler()
                .generation_times(generator.id)
                .unwrap()
                .len(),
            1
        );

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_background_tasks() {
        let config = RuntimeConfig {
            reconcile_interval_secs: Some(1),
            ..RuntimeConfig::default()
        };
        let runtime = TurnRuntime::builder(config, plugins(Arc::new(FakeRealmPlugin::new())))
            .start()
            .unwrap();
        tokio::time::timeout(StdDuration::from_secs(5), runtime.shutdown())
            .await
            .unwrap();
    }

    #[test]
    fn start_outside_tokio_fails() {
        let err = TurnRuntime::builder(RuntimeConfig::default(), PluginRegistry::builder())
            .start()
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::NoRuntime(_)));
    }

    #[cfg(not(feature = "sqlite-persistence"))]
    #[test]
    fn sqlite_path_requires_feature() {
        let config = RuntimeConfig {
            sqlite_db: Some("turns.db".into()),
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            open_repository(&config),
            Err(RuntimeError::Config(_))
        ));
    }
}
