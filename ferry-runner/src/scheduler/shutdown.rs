//! Shutdown and reload control
//!
//! Every external input (process signals, the scheduler finishing, the
//! shutdown timer) arrives as one [`ControlEvent`]. [`transition`] maps the
//! current [`Phase`] and an event to the next phase plus the actions to
//! perform, and [`ShutdownController::run`] is the single loop applying them.
//!
//! ```text
//! Running --SIGQUIT--> Draining --RunFinished--> Exiting(Completed)
//!    |                    |
//!    |               other stop
//!    |                    v
//!    +---other stop--> ForcedStop --RunFinished--> Exiting(Completed)
//!                         |--any stop--> Exiting(ForcedExit)
//!                         +--timeout---> Exiting(TimedOut)
//! ```

use std::sync::Arc;
use tokio::sync::{Notify, mpsc};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConfigStore;
use crate::session::SessionServer;

/// Terminating process signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Graceful: stop taking jobs and wait for running builds
    Quit,
    Terminate,
    Interrupt,
}

impl StopSignal {
    pub fn is_graceful(&self) -> bool {
        matches!(self, StopSignal::Quit)
    }
}

impl std::fmt::Display for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quit => write!(f, "SIGQUIT"),
            Self::Terminate => write!(f, "SIGTERM"),
            Self::Interrupt => write!(f, "SIGINT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Stop(StopSignal),
    /// Reload the configuration regardless of its modification time
    Reload,
    /// The scheduler stopped every worker
    RunFinished,
    ShutdownTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Completed,
    TimedOut,
    ForcedExit(StopSignal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    ForcedStop,
    Exiting(ExitReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Stop feeding and resizing, abandon pending job requests
    InterruptRun,
    AbortBuilds,
    CloseSessionServer,
    StartShutdownTimer,
    ReloadConfig,
    LogStillDraining,
}

/// Next phase and the actions entering it requires
pub fn transition(phase: Phase, event: ControlEvent) -> (Phase, Vec<Action>) {
    use Action::*;

    match (phase, event) {
        (Phase::Running, ControlEvent::Stop(signal)) if signal.is_graceful() => {
            (Phase::Draining, vec![InterruptRun])
        }
        (Phase::Running, ControlEvent::Stop(_)) => (
            Phase::ForcedStop,
            vec![
                InterruptRun,
                AbortBuilds,
                CloseSessionServer,
                StartShutdownTimer,
            ],
        ),
        (Phase::Running, ControlEvent::Reload) => (Phase::Running, vec![ReloadConfig]),
        (Phase::Running, ControlEvent::RunFinished) => {
            (Phase::Exiting(ExitReason::Completed), Vec::new())
        }

        (Phase::Draining, ControlEvent::Stop(signal)) if signal.is_graceful() => {
            (Phase::Draining, vec![LogStillDraining])
        }
        (Phase::Draining, ControlEvent::Stop(_)) => (
            Phase::ForcedStop,
            vec![AbortBuilds, CloseSessionServer, StartShutdownTimer],
        ),
        (Phase::Draining | Phase::ForcedStop, ControlEvent::RunFinished) => {
            (Phase::Exiting(ExitReason::Completed), Vec::new())
        }

        (Phase::ForcedStop, ControlEvent::Stop(signal)) => {
            (Phase::Exiting(ExitReason::ForcedExit(signal)), Vec::new())
        }
        (Phase::ForcedStop, ControlEvent::ShutdownTimeout) => {
            (Phase::Exiting(ExitReason::TimedOut), Vec::new())
        }

        (phase, _) => (phase, Vec::new()),
    }
}

/// What the control loop acts on
pub struct ControlHandles {
    pub interrupt: CancellationToken,
    pub abort_builds: CancellationToken,
    pub reload: Arc<Notify>,
    pub sessions: Option<Arc<SessionServer>>,
}

pub struct ShutdownController {
    phase: Phase,
    /// Read when the shutdown timer starts, so reloads up to then apply
    config: Arc<ConfigStore>,
    handles: ControlHandles,
}

impl ShutdownController {
    pub fn new(config: Arc<ConfigStore>, handles: ControlHandles) -> Self {
        Self {
            phase: Phase::Running,
            config,
            handles,
        }
    }

    /// Applies events until the process should exit
    ///
    /// A closed event channel counts as the scheduler having finished.
    pub async fn run(mut self, mut events: mpsc::Receiver<ControlEvent>) -> ExitReason {
        let mut deadline: Option<Instant> = None;

        loop {
            let event = tokio::select! {
                biased;
                event = events.recv() => event.unwrap_or(ControlEvent::RunFinished),
                _ = sleep_until(deadline) => ControlEvent::ShutdownTimeout,
            };

            let (next, actions) = transition(self.phase, event);
            if next != self.phase {
                info!(from = ?self.phase, to = ?next, event = ?event, "Shutdown phase changed");
            }

            for action in actions {
                self.apply(action, event, &mut deadline);
            }
            self.phase = next;

            if let Phase::Exiting(reason) = next {
                return reason;
            }
        }
    }

    fn apply(&self, action: Action, event: ControlEvent, deadline: &mut Option<Instant>) {
        match action {
            Action::InterruptRun => {
                if let ControlEvent::Stop(signal) = event {
                    if signal.is_graceful() {
                        warn!(
                            signal = %signal,
                            "Starting graceful shutdown, waiting for running builds to finish"
                        );
                    } else {
                        warn!(signal = %signal, "Starting forced shutdown");
                    }
                }
                self.handles.interrupt.cancel();
            }
            Action::AbortBuilds => {
                warn!("Aborting running builds");
                self.handles.abort_builds.cancel();
            }
            Action::CloseSessionServer => {
                if let Some(sessions) = &self.handles.sessions {
                    sessions.close();
                }
            }
            Action::StartShutdownTimer => {
                let timeout = self.config.snapshot().shutdown_timeout();
                *deadline = Some(Instant::now() + timeout);
                info!("Waiting up to {:?} for workers to stop", timeout);
            }
            Action::ReloadConfig => {
                info!("Configuration reload requested");
                self.handles.reload.notify_one();
            }
            Action::LogStillDraining => {
                warn!("Graceful shutdown already in progress, still waiting for builds to finish");
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
