//! Per-runner circuit breaker
//!
//! Consecutive failed job requests open the breaker for a runner and the
//! feeder stops offering it. Once the runner's unhealthy interval has passed
//! since the last check, one request is let through: the failure count is
//! reset when that probe is granted, before its outcome is known.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::RunnerConfig;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally
    Closed,

    /// Failure limit reached, the runner is skipped
    Open,

    /// Unhealthy interval elapsed, the next check grants one probe
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HealthRecord {
    failures: u32,
    last_check: Instant,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            failures: 0,
            last_check: Instant::now(),
        }
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.last_check = Instant::now();
    }
}

/// Health records for every runner seen so far
#[derive(Default)]
pub struct HealthMonitor {
    records: Mutex<HashMap<String, HealthRecord>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the runner should be offered to the workers
    ///
    /// Grants the half-open probe when the breaker has been open for longer
    /// than the runner's unhealthy interval.
    pub fn is_healthy(&self, runner: &RunnerConfig) -> bool {
        let mut records = self.records.lock();
        let record = records
            .entry(runner.token().to_string())
            .or_insert_with(HealthRecord::new);

        if record.failures < runner.unhealthy_requests_limit() {
            return true;
        }

        if record.last_check.elapsed() > runner.unhealthy_interval() {
            info!(
                runner = %runner.short_description(),
                "Runner is not healthy, but will be checked!"
            );
            record.reset();
            return true;
        }

        false
    }

    /// Records the transport-level outcome of a job request
    pub fn mark_health(&self, runner: &RunnerConfig, healthy: bool) -> bool {
        let mut records = self.records.lock();
        let record = records
            .entry(runner.token().to_string())
            .or_insert_with(HealthRecord::new);

        if healthy {
            record.reset();
            return true;
        }

        record.failures += 1;
        if record.failures == runner.unhealthy_requests_limit() {
            warn!(
                runner = %runner.short_description(),
                failures = record.failures,
                "Runner is not healthy and will be disabled for {:?}!",
                runner.unhealthy_interval()
            );
        }
        false
    }

    pub fn state(&self, runner: &RunnerConfig) -> CircuitState {
        let records = self.records.lock();
        let Some(record) = records.get(runner.token()) else {
            return CircuitState::Closed;
        };

        if record.failures < runner.unhealthy_requests_limit() {
            CircuitState::Closed
        } else if record.last_check.elapsed() > runner.unhealthy_interval() {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    pub fn failures(&self, runner: &RunnerConfig) -> u32 {
        self.records
            .lock()
            .get(runner.token())
            .map(|r| r.failures)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::runner;
    use tokio::time::{self, Duration};

    fn unhealthy_runner() -> RunnerConfig {
        let mut runner = runner("token-1", 0);
        runner.unhealthy_requests_limit = 3;
        runner.unhealthy_interval = 60;
        runner
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_limit() {
        let health = HealthMonitor::new();
        let runner = unhealthy_runner();

        assert!(health.is_healthy(&runner));
        health.mark_health(&runner, false);
        health.mark_health(&runner, false);
        assert!(health.is_healthy(&runner));
        assert_eq!(health.state(&runner), CircuitState::Closed);

        health.mark_health(&runner, false);
        assert!(!health.is_healthy(&runner));
        assert_eq!(health.state(&runner), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_mark_closes_breaker() {
        let health = HealthMonitor::new();
        let runner = unhealthy_runner();

        for _ in 0..3 {
            health.mark_health(&runner, false);
        }
        assert!(!health.is_healthy(&runner));

        health.mark_health(&runner, true);
        assert!(health.is_healthy(&runner));
        assert_eq!(health.failures(&runner), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_after_interval() {
        let health = HealthMonitor::new();
        let runner = unhealthy_runner();

        for _ in 0..3 {
            health.mark_health(&runner, false);
        }
        assert!(!health.is_healthy(&runner));

        time::advance(Duration::from_secs(30)).await;
        assert!(!health.is_healthy(&runner));

        time::advance(Duration::from_secs(31)).await;
        assert_eq!(health.state(&runner), CircuitState::HalfOpen);

        // The probe is granted once and resets the counter
        assert!(health.is_healthy(&runner));
        assert_eq!(health.failures(&runner), 0);
        assert_eq!(health.state(&runner), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_for_full_interval() {
        let health = HealthMonitor::new();
        let runner = unhealthy_runner();

        for _ in 0..3 {
            health.mark_health(&runner, false);
        }
        time::advance(Duration::from_secs(61)).await;
        assert!(health.is_healthy(&runner));

        for _ in 0..3 {
            health.mark_health(&runner, false);
        }
        assert!(!health.is_healthy(&runner));

        time::advance(Duration::from_secs(59)).await;
        assert!(!health.is_healthy(&runner));
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_are_per_runner() {
        let health = HealthMonitor::new();
        let first = unhealthy_runner();
        let second = runner("token-2", 0);

        for _ in 0..3 {
            health.mark_health(&first, false);
        }
        assert!(!health.is_healthy(&first));
        assert!(health.is_healthy(&second));
    }
}
