//! Runner offers
//!
//! A zero-capacity hand-off between the feeder and the workers. An idle
//! worker registers a one-shot slot and waits on it; an offer is delivered
//! straight into such a slot and never buffered. A worker that gave up
//! waiting leaves a closed slot behind, which offers skip.

use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::config::RunnerConfig;

type Slot = oneshot::Sender<Arc<RunnerConfig>>;

pub struct OfferQueue {
    idle: mpsc::UnboundedSender<Slot>,
    waiting: Mutex<mpsc::UnboundedReceiver<Slot>>,
}

impl OfferQueue {
    pub fn new() -> Self {
        let (idle, waiting) = mpsc::unbounded_channel();
        Self {
            idle,
            waiting: Mutex::new(waiting),
        }
    }

    /// Waits until a runner is handed to this caller
    ///
    /// Cancel-safe: dropping the future withdraws the caller.
    pub async fn receive(&self) -> Option<Arc<RunnerConfig>> {
        let (slot, offer) = oneshot::channel();
        self.idle.send(slot).ok()?;
        offer.await.ok()
    }

    /// Hands `runner` to the next idle worker, waiting for one if needed
    ///
    /// Cancel-safe: nothing is delivered unless the future completes.
    pub async fn offer(&self, mut runner: Arc<RunnerConfig>) -> bool {
        let mut waiting = self.waiting.lock().await;
        while let Some(slot) = waiting.recv().await {
            match slot.send(runner) {
                Ok(()) => return true,
                Err(returned) => runner = returned,
            }
        }
        false
    }

    /// Hands `runner` to a worker already waiting; false when none is
    pub fn try_offer(&self, mut runner: Arc<RunnerConfig>) -> bool {
        // A blocked `offer` holds the lock, so no worker is idle
        let Ok(mut waiting) = self.waiting.try_lock() else {
            return false;
        };

        while let Ok(slot) = waiting.try_recv() {
            match slot.send(runner) {
                Ok(()) => return true,
                Err(returned) => runner = returned,
            }
        }
        false
    }
}

impl Default for OfferQueue {
    fn default() -> Self {
        Self::new()
    }
}
