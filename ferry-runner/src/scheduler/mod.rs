//! Job scheduler
//!
//! The scheduler owns every piece of shared state (admission counters,
//! runner health, metrics) and wires the feeder, the worker pool and the job
//! processor together. Its main loop keeps the pool at the configured size
//! and reloads the configuration, until the interrupt token stops it.

pub mod admission;
pub mod feeder;
pub mod health;
pub mod offers;
pub mod pool;
pub mod processor;
pub mod shutdown;

pub use admission::AdmissionController;
pub use health::HealthMonitor;
pub use shutdown::{ControlEvent, ControlHandles, ExitReason, ShutdownController, StopSignal};

use anyhow::{Context, Result};
use ferry_client::Network;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ConfigStore, RELOAD_CONFIG_INTERVAL};
use crate::executor::ExecutorRegistry;
use crate::metrics::SchedulerMetrics;
use crate::session::SessionServer;
use feeder::RunnerFeeder;
use offers::OfferQueue;
use pool::WorkerPool;
use processor::JobProcessor;

pub struct Scheduler {
    config: Arc<ConfigStore>,
    network: Arc<dyn Network>,
    executors: Arc<ExecutorRegistry>,
    admission: Arc<AdmissionController>,
    health: Arc<HealthMonitor>,
    metrics: Arc<SchedulerMetrics>,
    sessions: Option<Arc<SessionServer>>,
    /// Stops feeding, resizing and reloading; pending job requests are abandoned
    interrupt: CancellationToken,
    abort_builds: CancellationToken,
    reload: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        config: Arc<ConfigStore>,
        network: Arc<dyn Network>,
        executors: Arc<ExecutorRegistry>,
        metrics: Arc<SchedulerMetrics>,
    ) -> Self {
        Self {
            config,
            network,
            executors,
            admission: Arc::new(AdmissionController::new()),
            health: Arc::new(HealthMonitor::new()),
            metrics,
            sessions: None,
            interrupt: CancellationToken::new(),
            abort_builds: CancellationToken::new(),
            reload: Arc::new(Notify::new()),
        }
    }

    pub fn with_sessions(mut self, sessions: Option<Arc<SessionServer>>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Handles the shutdown controller drives this scheduler through
    pub fn control_handles(&self) -> ControlHandles {
        ControlHandles {
            interrupt: self.interrupt.clone(),
            abort_builds: self.abort_builds.clone(),
            reload: Arc::clone(&self.reload),
            sessions: self.sessions.clone(),
        }
    }

    /// Runs until interrupted, then waits for every worker to stop
    pub async fn run(&self) -> Result<()> {
        self.executors
            .init_all()
            .await
            .context("Failed to initialize executor providers")?;

        let offers = Arc::new(OfferQueue::new());

        let processor = JobProcessor::new(
            Arc::clone(&self.network),
            Arc::clone(&self.executors),
            Arc::clone(&self.admission),
            Arc::clone(&self.health),
            Arc::clone(&self.metrics),
            Arc::clone(&offers),
            self.interrupt.clone(),
            self.abort_builds.clone(),
        )
        .with_sessions(self.sessions.clone());
        let pool = WorkerPool::new(
            Arc::clone(&offers),
            Arc::new(processor),
            Arc::clone(&self.metrics),
        );

        let feeder = RunnerFeeder::new(
            Arc::clone(&self.config),
            Arc::clone(&self.health),
            Arc::clone(&self.metrics),
            offers,
        );
        let feeder = tokio::spawn(feeder.run(self.interrupt.clone()));

        info!("Scheduler started");
        while !self.interrupt.is_cancelled() {
            let concurrent = self.config.snapshot().concurrent;
            pool.update_workers(concurrent, &self.interrupt).await;
            self.update_config().await;
        }

        info!("Stopping scheduler");
        if let Err(e) = feeder.await {
            warn!("Feeder task panicked: {}", e);
        }
        pool.stop_workers().await;

        let timeout = self.config.snapshot().shutdown_timeout();
        self.executors.shutdown_all(timeout).await;

        info!("Scheduler stopped");
        Ok(())
    }

    /// Waits one reload interval, then reloads if the file changed
    ///
    /// A reload request skips the wait and reloads unconditionally.
    async fn update_config(&self) {
        let reloaded = tokio::select! {
            biased;
            _ = self.interrupt.cancelled() => return,
            _ = self.reload.notified() => self.config.reload().map(Some),
            _ = time::sleep(RELOAD_CONFIG_INTERVAL) => self.config.reload_if_modified(),
        };

        match reloaded {
            Ok(Some(config)) => {
                info!(
                    concurrent = config.concurrent,
                    runners = config.runners.len(),
                    "Configuration loaded"
                );
                config.check_concurrency();
            }
            Ok(None) => {}
            Err(e) => error!("Failed to reload configuration, keeping the previous one: {}", e),
        }
    }
}
