//! fairq daemon
//!
//! Main daemon process: restores the queue, runs the scheduler, hosts the
//! ingestion worker and serves the control API.

mod ingest;

use clap::{Parser, Subcommand};
use fairq_api::create_router;
use fairq_core::{DaemonConfig, FairqError, FairqResult, GpuInventory, IngestMode};
use fairq_ingest::{IngestProcess, IngestionPipeline};
use fairq_runtime::DockerRuntime;
use fairq_scheduler::{ControlHandle, GpuAllocator, Scheduler, SchedulerSettings};
use fairq_store::{BundleStore, QueueStore};
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Time the ingest child gets to exit after its stdin is closed
const INGEST_STOP_GRACE: Duration = Duration::from_secs(30);

/// fairq daemon - fair-share GPU container queue
#[derive(Parser, Debug)]
#[command(name = "fairqd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Log level, overridden by RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the ingestion worker, writing tickets to stdout
    Ingest,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match DaemonConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fairqd: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let result = match args.command {
        Some(Command::Ingest) => {
            // stdout carries the ticket stream
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            ingest::run_worker(config).await
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            run_daemon(&args, config).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fairqd failed");
            ExitCode::FAILURE
        }
    }
}

async fn run_daemon(args: &Args, mut config: DaemonConfig) -> FairqResult<()> {
    if let Some(address) = &args.address {
        config.api.address = address.clone();
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }

    info!("Starting fairq daemon v{}", env!("CARGO_PKG_VERSION"));

    let runtime = Arc::new(DockerRuntime::new(config.runtime.clone()));
    let version = runtime.ping().await?;
    info!(version = %version, "Connected to docker");

    let store = QueueStore::open(&config.paths.state).await?;
    let inventory = GpuInventory::from_config(&config.gpu);

    let (tickets, ticket_rx) = mpsc::unbounded_channel();
    let (scheduler, control) = Scheduler::new(
        SchedulerSettings::from_config(&config),
        runtime.clone(),
        GpuAllocator::new(inventory.clone()),
        ticket_rx,
    );
    let mut scheduler = scheduler.with_store(store);
    scheduler.restore().await;

    let ingestion = match config.ingest.mode {
        IngestMode::Subprocess => {
            let program = std::env::current_exe()?;
            let mut child_args: Vec<OsString> = Vec::new();
            if let Some(path) = &args.config {
                child_args.push("--config".into());
                child_args.push(path.clone().into_os_string());
            }
            if let Some(level) = &args.log_level {
                child_args.push("--log-level".into());
                child_args.push(level.into());
            }
            child_args.push("ingest".into());
            Ingestion::Process(IngestProcess::spawn(&program, child_args, tickets)?)
        }
        IngestMode::Task => {
            let pipeline = IngestionPipeline::new(
                BundleStore::new(&config.paths, config.ingest.remove_invalid),
                runtime.clone(),
                config.ingest.clone(),
                inventory,
            );
            // Own flag: the task keeps forwarding until the scheduler is
            // done serving and only then is told to stop
            let (stop, stop_rx) = watch::channel(false);
            Ingestion::Task {
                stop,
                task: tokio::spawn(async move { pipeline.run(tickets, stop_rx).await }),
            }
        }
    };
    control.ingest_started(&config.ingest.mode.to_string());

    let scheduler_task = tokio::spawn(scheduler.run());
    spawn_signal_handler(control.clone());

    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .map_err(|e| FairqError::Config(format!("invalid API address: {}", e)))?;
    let serve_result = serve(addr, control.clone()).await;

    // The server only returns once shutdown was requested or it failed.
    // Ingestion stops first; closing its ticket channel lets the scheduler
    // queue what was still in flight before its final snapshot.
    control.request_shutdown();
    ingestion.stop().await;
    control.ingest_stopped();
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Scheduler task panicked");
    }

    info!("fairq daemon stopped");
    serve_result
}

enum Ingestion {
    Process(IngestProcess),
    Task {
        stop: watch::Sender<bool>,
        task: JoinHandle<()>,
    },
}

impl Ingestion {
    /// Stop the worker and wait until its ticket sender is dropped
    async fn stop(self) {
        match self {
            Ingestion::Process(process) => {
                if let Err(e) = process.stop(INGEST_STOP_GRACE).await {
                    warn!(error = %e, "Failed to stop ingest process");
                }
            }
            Ingestion::Task { stop, task } => {
                stop.send_replace(true);
                if let Err(e) = task.await {
                    warn!(error = %e, "Ingestion task panicked");
                }
            }
        }
        info!("Ingestion stopped");
    }
}

async fn serve(addr: SocketAddr, control: ControlHandle) -> FairqResult<()> {
    let router = create_router(control.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server listening on {}", addr);

    let shutdown = control.shutdown_signal();
    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown(shutdown))
        .await?;
    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn spawn_signal_handler(control: ControlHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = terminate.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Cannot listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("Received termination signal");
        control.request_shutdown();
    });
}
