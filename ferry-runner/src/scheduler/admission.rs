//! Per-runner admission control
//!
//! Gates how many builds and how many in-flight job requests each runner may
//! have, and keeps the registry of live builds. Counters are created the
//! first time a runner is seen and live for the rest of the process.

use ferry_core::domain::runner::shorten_token;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::build::Build;
use crate::config::RunnerConfig;

const ADAPTIVE_INCREASE: f64 = 1.1;
const ADAPTIVE_DECREASE: f64 = 0.95;

#[derive(Debug, Clone)]
struct RunnerCounter {
    name: String,
    builds: usize,
    requests: usize,
    /// Request limit used when adaptive request concurrency is enabled;
    /// starts at zero so a fresh runner ramps up from a single request
    adaptive_limit: f64,
}

impl RunnerCounter {
    fn new(runner: &RunnerConfig) -> Self {
        Self {
            name: runner.name.clone(),
            builds: 0,
            requests: 0,
            adaptive_limit: 0.0,
        }
    }

    fn request_limit(&self, runner: &RunnerConfig) -> usize {
        let limit = runner.request_concurrency();
        if !runner.adaptive_request_concurrency {
            return limit;
        }
        (self.adaptive_limit.ceil() as usize).clamp(1, limit)
    }
}

/// Counter values exported as metrics
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerCounters {
    pub token: String,
    pub name: String,
    pub requests: usize,
    pub adaptive_limit: f64,
}

/// Key of the live-build histogram
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateStage {
    /// Shortened runner token
    pub runner: String,
    pub runner_name: String,
    pub state: String,
    pub stage: String,
}

/// Per-runner build and request gates plus the live-build registry
#[derive(Default)]
pub struct AdmissionController {
    counters: Mutex<HashMap<String, RunnerCounter>>,
    builds: Mutex<Vec<Arc<Build>>>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_counter<T>(&self, runner: &RunnerConfig, f: impl FnOnce(&mut RunnerCounter) -> T) -> T {
        let mut counters = self.counters.lock();
        let counter = counters
            .entry(runner.token().to_string())
            .or_insert_with(|| RunnerCounter::new(runner));
        f(counter)
    }

    /// Takes a build slot unless the runner is at its limit (0 is unlimited)
    pub fn acquire_build(&self, runner: &RunnerConfig) -> bool {
        self.with_counter(runner, |counter| {
            if runner.limit > 0 && counter.builds >= runner.limit {
                return false;
            }
            counter.builds += 1;
            true
        })
    }

    pub fn release_build(&self, runner: &RunnerConfig) -> bool {
        self.with_counter(runner, |counter| {
            if counter.builds == 0 {
                return false;
            }
            counter.builds -= 1;
            true
        })
    }

    /// Takes a request slot unless the runner's request limit is reached
    pub fn acquire_request(&self, runner: &RunnerConfig) -> bool {
        self.with_counter(runner, |counter| {
            if counter.requests >= counter.request_limit(runner) {
                return false;
            }
            counter.requests += 1;
            true
        })
    }

    /// Returns a request slot; `has_job` feeds the adaptive request limit
    pub fn release_request(&self, runner: &RunnerConfig, has_job: bool) -> bool {
        self.with_counter(runner, |counter| {
            if runner.adaptive_request_concurrency {
                let factor = if has_job {
                    ADAPTIVE_INCREASE
                } else {
                    ADAPTIVE_DECREASE
                };
                counter.adaptive_limit = (counter.adaptive_limit * factor)
                    .clamp(1.0, runner.request_concurrency() as f64);
            }

            if counter.requests == 0 {
                return false;
            }
            counter.requests -= 1;
            true
        })
    }

    /// Assigns the build's concurrency ids and registers it as live
    ///
    /// Each id is the smallest value not held by another live build in the
    /// same scope: the runner for `runner_id`, the runner and project for
    /// `project_runner_id`.
    pub fn add_build(&self, mut build: Build) -> Arc<Build> {
        let mut builds = self.builds.lock();

        let mut runner_ids = HashSet::new();
        let mut project_ids = HashSet::new();
        for other in builds.iter().filter(|b| b.token() == build.token()) {
            runner_ids.insert(other.runner_id());
            if other.project_id() == build.project_id() {
                project_ids.insert(other.project_runner_id());
            }
        }

        let runner_id = (0..).find(|id| !runner_ids.contains(id)).unwrap_or(0);
        let project_runner_id = (0..).find(|id| !project_ids.contains(id)).unwrap_or(0);
        build.assign_ids(runner_id, project_runner_id);

        let build = Arc::new(build);
        builds.push(Arc::clone(&build));

        debug!(
            runner = %build.runner().short_description(),
            job = build.job().id,
            runner_id,
            project_runner_id,
            "Build registered"
        );
        build
    }

    /// Removes a build by identity; false when it is not registered
    pub fn remove_build(&self, build: &Arc<Build>) -> bool {
        let mut builds = self.builds.lock();
        match builds.iter().position(|b| Arc::ptr_eq(b, build)) {
            Some(index) => {
                builds.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn builds_count(&self) -> usize {
        self.builds.lock().len()
    }

    pub fn builds(&self) -> Vec<Arc<Build>> {
        self.builds.lock().clone()
    }

    /// Live builds by runner, state and stage
    ///
    /// Every known runner gets an `idle` entry so its series never disappears.
    pub fn state_stage_histogram(&self) -> BTreeMap<StateStage, usize> {
        let mut histogram = BTreeMap::new();

        for (token, counter) in self.counters.lock().iter() {
            histogram.insert(
                StateStage {
                    runner: shorten_token(token),
                    runner_name: counter.name.clone(),
                    state: "idle".to_string(),
                    stage: "idle".to_string(),
                },
                0,
            );
        }

        for build in self.builds.lock().iter() {
            let key = StateStage {
                runner: build.runner().short_description(),
                runner_name: build.runner().name.clone(),
                state: build.state().to_string(),
                stage: build.stage().to_string(),
            };
            *histogram.entry(key).or_insert(0) += 1;
        }

        histogram
    }

    pub fn runner_counters(&self) -> Vec<RunnerCounters> {
        self.counters
            .lock()
            .iter()
            .map(|(token, counter)| RunnerCounters {
                token: token.clone(),
                name: counter.name.clone(),
                requests: counter.requests,
                adaptive_limit: counter.adaptive_limit,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorData;
    use crate::testing::{job, runner};
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    fn new_build(runner: &Arc<RunnerConfig>, job_id: i64, project_id: i64) -> Build {
        Build::new(
            job(job_id, project_id),
            Arc::clone(runner),
            ExecutorData::new("mock"),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_build_limit() {
        let admission = AdmissionController::new();
        let runner = runner("token-1", 2);

        assert!(admission.acquire_build(&runner));
        assert!(admission.acquire_build(&runner));
        assert!(!admission.acquire_build(&runner));

        assert!(admission.release_build(&runner));
        assert!(admission.acquire_build(&runner));
    }

    #[test]
    fn test_zero_limit_is_unlimited() {
        let admission = AdmissionController::new();
        let runner = runner("token-1", 0);

        for _ in 0..100 {
            assert!(admission.acquire_build(&runner));
        }
    }

    #[test]
    fn test_release_without_acquire() {
        let admission = AdmissionController::new();
        let runner = runner("token-1", 1);

        assert!(!admission.release_build(&runner));
        assert!(!admission.release_request(&runner, false));
    }

    #[test]
    fn test_counters_are_per_runner() {
        let admission = AdmissionController::new();
        let first = runner("token-1", 1);
        let second = runner("token-2", 1);

        assert!(admission.acquire_build(&first));
        assert!(!admission.acquire_build(&first));
        assert!(admission.acquire_build(&second));
    }

    #[test]
    fn test_concurrent_build_holders_never_exceed_limit() {
        const LIMIT: usize = 3;
        const THREADS: usize = 32;

        let admission = Arc::new(AdmissionController::new());
        let runner = Arc::new(runner("token-1", LIMIT));
        let holders = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let admission = Arc::clone(&admission);
                let runner = Arc::clone(&runner);
                let holders = Arc::clone(&holders);
                let peak = Arc::clone(&peak);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..200 {
                        if admission.acquire_build(&runner) {
                            let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            holders.fetch_sub(1, Ordering::SeqCst);
                            assert!(admission.release_build(&runner));
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= LIMIT);
        assert!(peak.load(Ordering::SeqCst) >= 1);

        // All capacity is back
        for _ in 0..LIMIT {
            assert!(admission.acquire_build(&runner));
        }
        assert!(!admission.acquire_build(&runner));
    }

    #[test]
    fn test_concurrent_requests_never_exceed_limit() {
        let admission = Arc::new(AdmissionController::new());
        let mut config = runner("token-1", 0);
        config.request_concurrency = 2;
        let runner = Arc::new(config);
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let admission = Arc::clone(&admission);
                let runner = Arc::clone(&runner);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    admission.acquire_request(&runner)
                })
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted, 2);

        assert!(admission.release_request(&runner, false));
        assert!(admission.acquire_request(&runner));
    }

    #[test]
    fn test_request_concurrency_defaults_to_one() {
        let admission = AdmissionController::new();
        let runner = runner("token-1", 0);

        assert!(admission.acquire_request(&runner));
        assert!(!admission.acquire_request(&runner));
    }

    #[test]
    fn test_adaptive_request_limit() {
        let admission = AdmissionController::new();
        let mut config = runner("token-1", 0);
        config.request_concurrency = 4;
        config.adaptive_request_concurrency = true;

        // A fresh runner starts with a single request in flight
        assert!(admission.acquire_request(&config));
        assert!(!admission.acquire_request(&config));
        admission.release_request(&config, true);
        assert_eq!(admission.runner_counters()[0].adaptive_limit, 1.0);

        // One more job lifts the limit past 1, so two requests fit
        assert!(admission.acquire_request(&config));
        admission.release_request(&config, true);
        assert!(admission.acquire_request(&config));
        assert!(admission.acquire_request(&config));
        assert!(!admission.acquire_request(&config));
        admission.release_request(&config, false);
        admission.release_request(&config, false);

        // Requests that return nothing shrink the limit down to 1
        for _ in 0..100 {
            assert!(admission.acquire_request(&config));
            admission.release_request(&config, false);
        }
        assert!(admission.acquire_request(&config));
        assert!(!admission.acquire_request(&config));
        admission.release_request(&config, true);

        // Requests that return jobs grow it back, never above the configured limit
        for _ in 0..100 {
            assert!(admission.acquire_request(&config));
            admission.release_request(&config, true);
        }
        for _ in 0..4 {
            assert!(admission.acquire_request(&config));
        }
        assert!(!admission.acquire_request(&config));

        let counters = admission.runner_counters();
        assert_eq!(counters[0].adaptive_limit, 4.0);
    }

    #[test]
    fn test_add_build_assigns_smallest_free_ids() {
        let admission = AdmissionController::new();
        let runner = Arc::new(runner("token-1", 0));

        let a = admission.add_build(new_build(&runner, 1, 10));
        let b = admission.add_build(new_build(&runner, 2, 10));
        let c = admission.add_build(new_build(&runner, 3, 20));

        assert_eq!((a.runner_id(), a.project_runner_id()), (0, 0));
        assert_eq!((b.runner_id(), b.project_runner_id()), (1, 1));
        assert_eq!((c.runner_id(), c.project_runner_id()), (2, 0));

        // Freed ids are reused
        assert!(admission.remove_build(&a));
        let d = admission.add_build(new_build(&runner, 4, 10));
        assert_eq!((d.runner_id(), d.project_runner_id()), (0, 0));
    }

    #[test]
    fn test_ids_are_scoped_by_runner() {
        let admission = AdmissionController::new();
        let first = Arc::new(runner("token-1", 0));
        let second = Arc::new(runner("token-2", 0));

        let a = admission.add_build(new_build(&first, 1, 10));
        let b = admission.add_build(new_build(&second, 2, 10));

        assert_eq!(a.runner_id(), 0);
        assert_eq!(b.runner_id(), 0);
        assert_eq!(b.project_runner_id(), 0);
    }

    #[test]
    fn test_concurrent_add_build_ids_are_unique() {
        const BUILDS: usize = 24;

        let admission = Arc::new(AdmissionController::new());
        let runner = Arc::new(runner("token-1", 0));
        let barrier = Arc::new(Barrier::new(BUILDS));

        let handles: Vec<_> = (0..BUILDS)
            .map(|i| {
                let admission = Arc::clone(&admission);
                let runner = Arc::clone(&runner);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let build = new_build(&runner, i as i64, 10);
                    barrier.wait();
                    admission.add_build(build)
                })
            })
            .collect();

        let builds: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let runner_ids: HashSet<_> = builds.iter().map(|b| b.runner_id()).collect();
        let project_ids: HashSet<_> = builds.iter().map(|b| b.project_runner_id()).collect();
        assert_eq!(runner_ids.len(), BUILDS);
        assert_eq!(project_ids.len(), BUILDS);
        assert_eq!(admission.builds_count(), BUILDS);
    }

    #[test]
    fn test_remove_build_is_idempotent() {
        let admission = AdmissionController::new();
        let runner = Arc::new(runner("token-1", 0));

        let a = admission.add_build(new_build(&runner, 1, 10));
        let b = admission.add_build(new_build(&runner, 2, 10));

        assert!(admission.remove_build(&a));
        assert!(!admission.remove_build(&a));

        assert_eq!(admission.builds_count(), 1);
        assert!(Arc::ptr_eq(&admission.builds()[0], &b));
    }

    #[test]
    fn test_state_stage_histogram() {
        let admission = AdmissionController::new();
        let runner = Arc::new(runner("token-123456789", 0));
        assert!(admission.acquire_build(&runner));

        admission.add_build(new_build(&runner, 1, 10));
        admission.add_build(new_build(&runner, 2, 10));

        let histogram = admission.state_stage_histogram();
        let idle = StateStage {
            runner: "token-12".to_string(),
            runner_name: runner.name.clone(),
            state: "idle".to_string(),
            stage: "idle".to_string(),
        };
        let pending = StateStage {
            state: "pending".to_string(),
            stage: "prepare_executor".to_string(),
            ..idle.clone()
        };

        assert_eq!(histogram.get(&idle), Some(&0));
        assert_eq!(histogram.get(&pending), Some(&2));
    }
}
