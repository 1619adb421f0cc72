//! Job trace streaming
//!
//! Job output is buffered in memory and pushed to the job source on a fixed
//! interval by a background task. Completing the trace stops that task,
//! sends whatever is left and reports the final job state. Output past the
//! per-job limit is replaced by a notice and dropped, which also bounds the
//! buffer while the job source is unreachable.

use async_trait::async_trait;
use ferry_core::domain::job::{FailureReason, JobCredentials};
use ferry_core::dto::job::UpdateJob;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::HttpNetwork;
use crate::error::Result;
use crate::network::JobTrace;

const FINAL_UPDATE_ATTEMPTS: u32 = 3;
const FINAL_UPDATE_INITIAL_DELAY_MS: u64 = 250;

#[derive(Default)]
struct Pending {
    output: String,
    /// Bytes of output taken in for this job, sent or not
    logged: usize,
    truncated: bool,
}

/// Buffered output of a single job and the position already sent
struct TraceSink {
    network: HttpNetwork,
    job: JobCredentials,
    limit: usize,
    pending: Mutex<Pending>,
    /// Bytes already accepted by the job source; also serializes flushes
    sent: tokio::sync::Mutex<usize>,
}

impl TraceSink {
    fn append(&self, line: &str) {
        let mut pending = self.pending.lock();
        if pending.truncated {
            return;
        }

        let room = self.limit.saturating_sub(pending.logged);
        if line.len() < room {
            pending.output.push_str(line);
            pending.output.push('\n');
            pending.logged += line.len() + 1;
            return;
        }

        let mut cut = room.min(line.len());
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        pending.output.push_str(&line[..cut]);
        pending.output.push_str(&limit_exceeded_message(self.limit));
        pending.logged = self.limit;
        pending.truncated = true;
        warn!(job = self.job.id, limit = self.limit, "Job output limit reached");
    }

    fn drain(&self) -> String {
        std::mem::take(&mut self.pending.lock().output)
    }

    /// Sends buffered output; on failure the chunk is put back in front
    async fn flush(&self) -> Result<()> {
        let mut sent = self.sent.lock().await;

        let chunk = self.drain();
        if chunk.is_empty() {
            return Ok(());
        }

        let len = chunk.len();
        match self.network.patch_trace(&self.job, *sent, chunk.clone()).await {
            Ok(()) => {
                *sent += len;
                Ok(())
            }
            Err(e) => {
                self.pending.lock().output.insert_str(0, &chunk);
                Err(e)
            }
        }
    }
}

/// [`JobTrace`] backed by the job source's trace and state endpoints
pub struct HttpJobTrace {
    sink: Arc<TraceSink>,
    stop: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
    finished: AtomicBool,
}

impl HttpJobTrace {
    /// Opens a trace for `job` and starts the periodic sender
    pub fn start(network: HttpNetwork, job: JobCredentials) -> Arc<Self> {
        let interval = network.trace_interval();
        let sink = Arc::new(TraceSink {
            limit: network.trace_limit(),
            network,
            job,
            pending: Mutex::new(Pending::default()),
            sent: tokio::sync::Mutex::new(0),
        });
        let stop = CancellationToken::new();
        let flusher = Self::spawn_sender(Arc::clone(&sink), stop.clone(), interval);

        Arc::new(Self {
            sink,
            stop,
            flusher: Mutex::new(Some(flusher)),
            finished: AtomicBool::new(false),
        })
    }

    /// Whether a final state has already been reported
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Spawns a background task to send trace output periodically
    fn spawn_sender(
        sink: Arc<TraceSink>,
        stop: CancellationToken,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = sink.flush().await {
                    warn!(job = sink.job.id, "Failed to send trace: {}", e);
                }
            }
        })
    }

    async fn finish(&self, update: UpdateJob) {
        if self.finished.swap(true, Ordering::SeqCst) {
            debug!(job = self.sink.job.id, "Trace already finished");
            return;
        }

        self.stop.cancel();
        let flusher = self.flusher.lock().take();
        if let Some(flusher) = flusher {
            let _ = flusher.await;
        }

        if let Err(e) = self.sink.flush().await {
            warn!(job = self.sink.job.id, "Failed to send final trace: {}", e);
        }

        let mut delay_ms = FINAL_UPDATE_INITIAL_DELAY_MS;
        for attempt in 1..=FINAL_UPDATE_ATTEMPTS {
            match self.sink.network.update_job(&self.sink.job, &update).await {
                Ok(()) => {
                    info!(
                        job = self.sink.job.id,
                        state = %update.state,
                        "Job state reported"
                    );
                    return;
                }
                Err(e) if e.is_forbidden() => {
                    warn!(
                        job = self.sink.job.id,
                        "Job source no longer accepts updates for this job: {}", e
                    );
                    return;
                }
                Err(e) if attempt < FINAL_UPDATE_ATTEMPTS => {
                    warn!(
                        job = self.sink.job.id,
                        "Failed to report job state (attempt {}/{}): {}",
                        attempt,
                        FINAL_UPDATE_ATTEMPTS,
                        e
                    );
                    time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms *= 2;
                }
                Err(e) => {
                    error!(
                        job = self.sink.job.id,
                        "Giving up reporting job state after {} attempts: {}",
                        FINAL_UPDATE_ATTEMPTS,
                        e
                    );
                }
            }
        }
    }
}

fn limit_exceeded_message(limit: usize) -> String {
    format!(
        "\nJob's log exceeded limit of {} bytes.\n\
         Job execution will continue but no more output will be collected.\n",
        limit
    )
}

impl Drop for HttpJobTrace {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[async_trait]
impl JobTrace for HttpJobTrace {
    fn write(&self, line: &str) {
        self.sink.append(line);
    }

    async fn success(&self) {
        let update = UpdateJob::success(&self.sink.job.token);
        self.finish(update).await;
    }

    async fn fail(&self, message: &str, reason: FailureReason) {
        debug!(job = self.sink.job.id, %reason, "Job failed: {}", message);
        let update = UpdateJob::failed(&self.sink.job.token, reason);
        self.finish(update).await;
    }
}
