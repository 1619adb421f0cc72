//! Runner feeder
//!
//! Walks the configured runners round-robin and offers each healthy one to
//! the worker pool, spacing offers so that one full pass takes one check
//! interval. An offer waits until a worker is idle to take it, which
//! throttles the feeder to the pace of the workers.

use std::sync::Arc;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ConfigStore, RunnerConfig};
use crate::metrics::SchedulerMetrics;
use crate::scheduler::HealthMonitor;
use crate::scheduler::offers::OfferQueue;

pub struct RunnerFeeder {
    config: Arc<ConfigStore>,
    health: Arc<HealthMonitor>,
    metrics: Arc<SchedulerMetrics>,
    offers: Arc<OfferQueue>,
}

impl RunnerFeeder {
    pub fn new(
        config: Arc<ConfigStore>,
        health: Arc<HealthMonitor>,
        metrics: Arc<SchedulerMetrics>,
        offers: Arc<OfferQueue>,
    ) -> Self {
        Self {
            config,
            health,
            metrics,
            offers,
        }
    }

    /// Feeds runners until `stop` fires
    pub async fn run(self, stop: CancellationToken) {
        info!("Starting runner feeder");

        loop {
            // Every pass starts from the latest snapshot
            let config = self.config.snapshot();

            if config.runners.is_empty() {
                if !sleep_or_stop(config.check_interval(), &stop).await {
                    break;
                }
                continue;
            }

            let interval = config.check_interval() / config.runners.len() as u32;
            let mut running = true;

            for runner in &config.runners {
                if !self.feed(runner, &stop).await || !sleep_or_stop(interval, &stop).await {
                    running = false;
                    break;
                }
            }

            if !running {
                break;
            }
        }

        info!("Runner feeder stopped");
    }

    /// Offers one runner; false when feeding should stop
    async fn feed(&self, runner: &Arc<RunnerConfig>, stop: &CancellationToken) -> bool {
        if !self.health.is_healthy(runner) {
            debug!(
                runner = %runner.short_description(),
                state = %self.health.state(runner),
                failures = self.health.failures(runner),
                "Skipping unhealthy runner"
            );
            self.metrics.worker_feed_failure(runner);
            return true;
        }

        debug!(runner = %runner.short_description(), "Feeding runner to the workers");

        tokio::select! {
            biased;
            _ = stop.cancelled() => false,
            delivered = self.offers.offer(Arc::clone(runner)) => {
                if !delivered {
                    debug!("Worker queue closed, stopping feeder");
                    return false;
                }
                self.metrics.worker_feed(runner);
                true
            }
        }
    }
}

/// Sleeps for `duration`; false when `stop` fired first
async fn sleep_or_stop(duration: Duration, stop: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = stop.cancelled() => false,
        _ = time::sleep(duration) => true,
    }
}
