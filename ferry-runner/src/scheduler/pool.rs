//! Worker pool
//!
//! Idle workers wait on the offer queue and run one cycle per runner handed
//! to them. The pool is resized one worker at a time towards the configured
//! concurrency; every step checks the interrupt token so a shutdown never
//! waits behind a long resize.
//!
//! Each worker owns a child of the pool's stop token. Stopping a worker
//! cancels its token: an idle worker exits at once, a busy one finishes its
//! current cycle first and no longer takes offers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::metrics::SchedulerMetrics;
use crate::scheduler::offers::OfferQueue;

/// Pause after each cycle before a worker takes the next offer
const DEFAULT_CYCLE_PAUSE: Duration = Duration::from_millis(50);

/// Work done for one offered runner
#[async_trait]
pub trait RunnerCycle: Send + Sync + 'static {
    async fn process(&self, worker: usize, runner: Arc<RunnerConfig>);
}

struct WorkerHandle {
    id: usize,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct WorkerPool {
    queue: Arc<OfferQueue>,
    cycle: Arc<dyn RunnerCycle>,
    metrics: Arc<SchedulerMetrics>,
    workers: Mutex<Vec<WorkerHandle>>,
    /// Stopped workers that may still be finishing a cycle
    retired: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicUsize,
    stop_all: CancellationToken,
    pause: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<OfferQueue>,
        cycle: Arc<dyn RunnerCycle>,
        metrics: Arc<SchedulerMetrics>,
    ) -> Self {
        Self {
            queue,
            cycle,
            metrics,
            workers: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            stop_all: CancellationToken::new(),
            pause: DEFAULT_CYCLE_PAUSE,
        }
    }

    pub fn current_workers(&self) -> usize {
        self.workers.lock().len()
    }

    #[cfg(test)]
    pub fn worker_ids(&self) -> Vec<usize> {
        self.workers.lock().iter().map(|w| w.id).collect()
    }

    /// Moves the worker count towards `desired`, one worker per step
    ///
    /// Returns early, leaving the resize partially applied, when `interrupt`
    /// fires; the next call picks up from there.
    pub async fn update_workers(&self, desired: usize, interrupt: &CancellationToken) -> usize {
        loop {
            let current = self.current_workers();
            if current == desired {
                break;
            }

            if interrupt.is_cancelled() {
                debug!(current, desired, "Worker resize interrupted");
                break;
            }

            if current > desired {
                self.stop_worker();
            } else {
                self.start_worker();
            }

            tokio::task::yield_now().await;
        }

        self.retired.lock().retain(|handle| !handle.is_finished());
        self.current_workers()
    }

    fn start_worker(&self) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let stop = self.stop_all.child_token();

        let handle = tokio::spawn(work(
            id,
            Arc::clone(&self.queue),
            Arc::clone(&self.cycle),
            stop.clone(),
            self.pause,
        ));

        let slots = {
            let mut workers = self.workers.lock();
            workers.push(WorkerHandle { id, stop, handle });
            workers.len()
        };

        self.metrics.worker_slot_operation("add");
        self.metrics.set_worker_slots(slots);
    }

    fn stop_worker(&self) {
        let (worker, slots) = {
            let mut workers = self.workers.lock();
            let worker = workers.pop();
            (worker, workers.len())
        };

        let Some(worker) = worker else {
            return;
        };

        worker.stop.cancel();
        self.retired.lock().push(worker.handle);

        self.metrics.worker_slot_operation("remove");
        self.metrics.set_worker_slots(slots);
    }

    /// Stops every worker and waits for their current cycles to finish
    pub async fn stop_workers(&self) {
        self.stop_all.cancel();

        let mut handles: Vec<_> = {
            let mut workers = self.workers.lock();
            workers.drain(..).map(|w| w.handle).collect()
        };
        handles.extend(self.retired.lock().drain(..));

        info!("Waiting for {} worker(s) to finish", handles.len());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker task panicked: {}", e);
            }
        }

        self.metrics.set_worker_slots(0);
    }
}

async fn work(
    id: usize,
    queue: Arc<OfferQueue>,
    cycle: Arc<dyn RunnerCycle>,
    stop: CancellationToken,
    pause: Duration,
) {
    debug!(worker = id, "Starting worker");

    loop {
        let runner = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            runner = queue.receive() => match runner {
                Some(runner) => runner,
                None => break,
            },
        };

        cycle.process(id, runner).await;

        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = time::sleep(pause) => {}
        }
    }

    debug!(worker = id, "Worker stopped");
}
