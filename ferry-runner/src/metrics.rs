//! Scheduler metrics
//!
//! Counters are updated as events happen; gauges describing the current
//! configuration and live builds are refreshed right before each scrape.
//!
//! ## Metrics
//! - `ferry_runner_concurrent` - Gauge
//! - `ferry_runner_limit{runner, runner_name}` - Gauge
//! - `ferry_runner_jobs{runner, runner_name, state, stage}` - Gauge
//! - `ferry_runner_request_concurrency{runner, runner_name}` - Gauge
//! - `ferry_runner_request_concurrency_adaptive_limit{runner, runner_name}` - Gauge
//! - `ferry_runner_request_concurrency_exceeded_total{runner, runner_name}` - Counter
//! - `ferry_runner_worker_slots` - Gauge
//! - `ferry_runner_worker_slot_operations_total{operation}` - Counter
//! - `ferry_runner_worker_feeds_total{runner, runner_name}` - Counter
//! - `ferry_runner_worker_feed_failures_total{runner, runner_name}` - Counter
//! - `ferry_runner_worker_processing_failures_total{failure_type, runner, runner_name}` - Counter
//! - `ferry_runner_jobs_total{runner, runner_name}` - Counter
//! - `ferry_runner_job_duration_seconds{runner, runner_name}` - Histogram

use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;

use crate::config::{Config, RunnerConfig};
use crate::scheduler::AdmissionController;

const RUNNER_LABELS: &[&str] = &["runner", "runner_name"];

/// Prometheus collectors owned by one scheduler instance
#[derive(Clone)]
pub struct SchedulerMetrics {
    registry: Registry,
    concurrent: IntGauge,
    limit: IntGaugeVec,
    jobs: IntGaugeVec,
    request_concurrency: IntGaugeVec,
    request_concurrency_adaptive_limit: GaugeVec,
    request_concurrency_exceeded: IntCounterVec,
    worker_slots: IntGauge,
    worker_slot_operations: IntCounterVec,
    worker_feeds: IntCounterVec,
    worker_feed_failures: IntCounterVec,
    worker_processing_failures: IntCounterVec,
    jobs_total: IntCounterVec,
    job_duration: HistogramVec,
}

impl SchedulerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let concurrent = IntGauge::new(
            "ferry_runner_concurrent",
            "The current value of concurrent setting",
        )?;
        let limit = IntGaugeVec::new(
            Opts::new("ferry_runner_limit", "The current value of limit setting"),
            RUNNER_LABELS,
        )?;
        let jobs = IntGaugeVec::new(
            Opts::new("ferry_runner_jobs", "The current number of running builds"),
            &["runner", "runner_name", "state", "stage"],
        )?;
        let request_concurrency = IntGaugeVec::new(
            Opts::new(
                "ferry_runner_request_concurrency",
                "The current number of concurrent requests for a new job",
            ),
            RUNNER_LABELS,
        )?;
        let request_concurrency_adaptive_limit = GaugeVec::new(
            Opts::new(
                "ferry_runner_request_concurrency_adaptive_limit",
                "The current adaptive limit of concurrent requests for a new job",
            ),
            RUNNER_LABELS,
        )?;
        let request_concurrency_exceeded = IntCounterVec::new(
            Opts::new(
                "ferry_runner_request_concurrency_exceeded_total",
                "Count of excess requests above the configured request_concurrency limit",
            ),
            RUNNER_LABELS,
        )?;
        let worker_slots = IntGauge::new(
            "ferry_runner_worker_slots",
            "The current number of worker slots",
        )?;
        let worker_slot_operations = IntCounterVec::new(
            Opts::new(
                "ferry_runner_worker_slot_operations_total",
                "Worker slot operations",
            ),
            &["operation"],
        )?;
        let worker_feeds = IntCounterVec::new(
            Opts::new(
                "ferry_runner_worker_feeds_total",
                "Total number of times a runner was fed to the workers",
            ),
            RUNNER_LABELS,
        )?;
        let worker_feed_failures = IntCounterVec::new(
            Opts::new(
                "ferry_runner_worker_feed_failures_total",
                "Total number of times a runner was skipped as unhealthy",
            ),
            RUNNER_LABELS,
        )?;
        let worker_processing_failures = IntCounterVec::new(
            Opts::new(
                "ferry_runner_worker_processing_failures_total",
                "Total number of failures while processing a runner",
            ),
            &["failure_type", "runner", "runner_name"],
        )?;
        let jobs_total = IntCounterVec::new(
            Opts::new("ferry_runner_jobs_total", "Total number of handled jobs"),
            RUNNER_LABELS,
        )?;
        let job_duration = HistogramVec::new(
            HistogramOpts::new(
                "ferry_runner_job_duration_seconds",
                "Histogram of job durations",
            )
            .buckets(vec![
                30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0, 10800.0, 18000.0, 36000.0,
            ]),
            RUNNER_LABELS,
        )?;

        registry.register(Box::new(concurrent.clone()))?;
        registry.register(Box::new(limit.clone()))?;
        registry.register(Box::new(jobs.clone()))?;
        registry.register(Box::new(request_concurrency.clone()))?;
        registry.register(Box::new(request_concurrency_adaptive_limit.clone()))?;
        registry.register(Box::new(request_concurrency_exceeded.clone()))?;
        registry.register(Box::new(worker_slots.clone()))?;
        registry.register(Box::new(worker_slot_operations.clone()))?;
        registry.register(Box::new(worker_feeds.clone()))?;
        registry.register(Box::new(worker_feed_failures.clone()))?;
        registry.register(Box::new(worker_processing_failures.clone()))?;
        registry.register(Box::new(jobs_total.clone()))?;
        registry.register(Box::new(job_duration.clone()))?;

        Ok(Self {
            registry,
            concurrent,
            limit,
            jobs,
            request_concurrency,
            request_concurrency_adaptive_limit,
            request_concurrency_exceeded,
            worker_slots,
            worker_slot_operations,
            worker_feeds,
            worker_feed_failures,
            worker_processing_failures,
            jobs_total,
            job_duration,
        })
    }

    pub fn worker_feed(&self, runner: &RunnerConfig) {
        self.worker_feeds
            .with_label_values(&[runner.short_description().as_str(), runner.name.as_str()])
            .inc();
    }

    pub fn worker_feed_failure(&self, runner: &RunnerConfig) {
        self.worker_feed_failures
            .with_label_values(&[runner.short_description().as_str(), runner.name.as_str()])
            .inc();
    }

    pub fn set_worker_slots(&self, slots: usize) {
        self.worker_slots.set(slots as i64);
    }

    pub fn worker_slot_operation(&self, operation: &str) {
        self.worker_slot_operations
            .with_label_values(&[operation])
            .inc();
    }

    pub fn processing_failure(&self, failure_type: &str, runner: &RunnerConfig) {
        self.worker_processing_failures
            .with_label_values(&[
                failure_type,
                runner.short_description().as_str(),
                runner.name.as_str(),
            ])
            .inc();
    }

    pub fn request_concurrency_exceeded(&self, runner: &RunnerConfig) {
        self.request_concurrency_exceeded
            .with_label_values(&[runner.short_description().as_str(), runner.name.as_str()])
            .inc();
    }

    pub fn job_finished(&self, runner: &RunnerConfig, duration: Duration) {
        let labels = [runner.short_description(), runner.name.clone()];
        let labels = [labels[0].as_str(), labels[1].as_str()];
        self.jobs_total.with_label_values(&labels).inc();
        self.job_duration
            .with_label_values(&labels)
            .observe(duration.as_secs_f64());
    }

    /// Updates gauges from the active configuration and live builds
    pub fn refresh(&self, config: &Config, admission: &AdmissionController) {
        self.concurrent.set(config.concurrent as i64);

        self.limit.reset();
        for runner in &config.runners {
            self.limit
                .with_label_values(&[runner.short_description().as_str(), runner.name.as_str()])
                .set(runner.limit as i64);
        }

        self.jobs.reset();
        for (key, count) in admission.state_stage_histogram() {
            self.jobs
                .with_label_values(&[
                    key.runner.as_str(),
                    key.runner_name.as_str(),
                    key.state.as_str(),
                    key.stage.as_str(),
                ])
                .set(count as i64);
        }

        self.request_concurrency.reset();
        self.request_concurrency_adaptive_limit.reset();
        for counters in admission.runner_counters() {
            let runner = ferry_core::domain::runner::shorten_token(&counters.token);
            let labels = [runner.as_str(), counters.name.as_str()];
            self.request_concurrency
                .with_label_values(&labels)
                .set(counters.requests as i64);
            self.request_concurrency_adaptive_limit
                .with_label_values(&labels)
                .set(counters.adaptive_limit);
        }
    }

    /// Text exposition of every registered metric
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::runner;
    use std::sync::Arc;

    #[test]
    fn test_refresh_exports_configuration() {
        let metrics = SchedulerMetrics::new().unwrap();
        let admission = AdmissionController::new();

        let runner = Arc::new(runner("abcdefghijkl", 4));
        let mut config = Config::default();
        config.concurrent = 3;
        config.runners.push(Arc::clone(&runner));

        assert!(admission.acquire_build(&runner));
        metrics.refresh(&config, &admission);

        let text = metrics.encode().unwrap();
        assert!(text.contains("ferry_runner_concurrent 3"));
        assert!(text.contains(
            "ferry_runner_limit{runner=\"abcdefgh\",runner_name=\"runner-abcdefghijkl\"} 4"
        ));
        assert!(text.contains("state=\"idle\""));
    }

    #[test]
    fn test_counters() {
        let metrics = SchedulerMetrics::new().unwrap();
        let runner = runner("abcdefghijkl", 0);

        metrics.worker_feed(&runner);
        metrics.worker_feed(&runner);
        metrics.worker_feed_failure(&runner);
        metrics.processing_failure("other", &runner);
        metrics.job_finished(&runner, Duration::from_secs(42));
        metrics.set_worker_slots(2);

        let text = metrics.encode().unwrap();
        assert!(text.contains(
            "ferry_runner_worker_feeds_total{runner=\"abcdefgh\",runner_name=\"runner-abcdefghijkl\"} 2"
        ));
        assert!(text.contains("ferry_runner_worker_feed_failures_total"));
        assert!(text.contains("failure_type=\"other\""));
        assert!(text.contains("ferry_runner_jobs_total"));
        assert!(text.contains("ferry_runner_worker_slots 2"));
    }
}
