//! Ferry Runner
//!
//! Polls one or more job sources for jobs and runs them on local executors.
//!
//! Architecture:
//! - Configuration: JSON file, hot-reloaded on change or on SIGHUP
//! - Scheduler: feeder, worker pool and job processor sharing admission
//!   counters and per-runner health
//! - Executors: pluggable backends that run the job steps
//! - API: Prometheus metrics and a debug listing of live builds
//!
//! SIGQUIT drains running builds before exiting; SIGTERM and SIGINT abort
//! them and exit within the shutdown timeout.

mod api;
mod build;
mod config;
mod executor;
mod metrics;
mod scheduler;
mod session;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use ferry_client::HttpNetwork;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::ApiState;
use crate::config::ConfigStore;
use crate::executor::{ExecutorRegistry, ShellProvider};
use crate::metrics::SchedulerMetrics;
use crate::scheduler::{ControlEvent, ExitReason, Scheduler, ShutdownController, StopSignal};
use crate::session::SessionServer;

const DEFAULT_LOG_FILTER: &str = "ferry_runner=info,ferry_client=info,tower_http=info";

#[derive(Parser)]
#[command(name = "ferry-runner")]
#[command(about = "Runs CI jobs fetched from one or more job sources", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "FERRY_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Address of the metrics and debug server; overrides `listen_address` from the file
    #[arg(long, env = "FERRY_LISTEN_ADDRESS")]
    listen_address: Option<String>,

    /// Default directory for shell executor builds
    #[arg(long, env = "FERRY_BUILDS_DIR", default_value = "builds")]
    builds_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let store = Arc::new(
        ConfigStore::load(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?,
    );
    let config = store.snapshot();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                config
                    .log_level
                    .as_deref()
                    .unwrap_or(DEFAULT_LOG_FILTER)
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting Ferry Runner (config: {}, runners: {}, concurrent: {})",
        cli.config.display(),
        config.runners.len(),
        config.concurrent
    );
    config.check_concurrency();

    let metrics = Arc::new(SchedulerMetrics::new().context("Failed to register metrics")?);

    let mut executors = ExecutorRegistry::new();
    executors.register("shell", Arc::new(ShellProvider::new(cli.builds_dir)));
    for runner in &config.runners {
        if !executors.contains(&runner.executor) {
            warn!(
                runner = %runner.short_description(),
                executor = %runner.executor,
                "Unknown executor, this runner will never take jobs"
            );
        }
    }

    let sessions = match &config.session_server {
        Some(session_config) => {
            let server = Arc::new(SessionServer::new(session_config.clone()));
            server.start().await.with_context(|| {
                format!(
                    "Failed to bind session server to {}",
                    session_config.listen_address
                )
            })?;
            Some(server)
        }
        None => None,
    };

    let scheduler = Arc::new(
        Scheduler::new(
            Arc::clone(&store),
            Arc::new(HttpNetwork::new()),
            Arc::new(executors),
            Arc::clone(&metrics),
        )
        .with_sessions(sessions.clone()),
    );

    let server_stop = CancellationToken::new();
    let server = match cli.listen_address.or_else(|| config.listen_address.clone()) {
        Some(address) => {
            let listener = TcpListener::bind(&address)
                .await
                .with_context(|| format!("Failed to bind metrics server to {}", address))?;
            info!("Metrics server listening on {}", address);

            let state = ApiState {
                config: Arc::clone(&store),
                admission: Arc::clone(scheduler.admission()),
                metrics: Arc::clone(&metrics),
            };
            let stop = server_stop.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = api::serve(listener, state, stop).await {
                    error!("Metrics server error: {}", e);
                }
            }))
        }
        None => None,
    };

    let (events, events_rx) = mpsc::channel(8);
    let _signals = spawn_signal_forwarder(events.clone())?;
    let controller = ShutdownController::new(Arc::clone(&store), scheduler.control_handles());

    let run = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            let result = scheduler.run().await;
            let _ = events.send(ControlEvent::RunFinished).await;
            result
        })
    };

    let reason = controller.run(events_rx).await;

    server_stop.cancel();
    if let Some(sessions) = &sessions {
        sessions.close();
    }

    match reason {
        ExitReason::Completed => {
            run.await.context("Scheduler task panicked")??;
            if let Some(server) = server {
                let _ = server.await;
            }
            info!("Ferry Runner stopped");
            Ok(())
        }
        ExitReason::TimedOut => Err(anyhow!(
            "shutdown timed out after {:?}",
            store.snapshot().shutdown_timeout()
        )),
        ExitReason::ForcedExit(signal) => Err(anyhow!("forced exit on {}", signal)),
    }
}

/// Forwards process signals to the shutdown controller
fn spawn_signal_forwarder(events: mpsc::Sender<ControlEvent>) -> Result<JoinHandle<()>> {
    let mut quit = signal(SignalKind::quit()).context("Failed to install SIGQUIT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = quit.recv() => ControlEvent::Stop(StopSignal::Quit),
                _ = terminate.recv() => ControlEvent::Stop(StopSignal::Terminate),
                _ = interrupt.recv() => ControlEvent::Stop(StopSignal::Interrupt),
                _ = hangup.recv() => ControlEvent::Reload,
            };

            if events.send(event).await.is_err() {
                break;
            }
        }
    }))
}
