use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{signal, sync::oneshot};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::lib::{
    config::types::{AppConfig, LogFormat},
    scheduler::types::Scheduler,
    store::open_store,
    tasks::docker::{ContainerRuntime, DockerRuntime},
    worker::{
        types::{TaskServer, Worker},
        worker::run_tasks,
    },
};

mod lib {
    pub mod config;
    pub mod scheduler;
    pub mod store;
    pub mod tasks;
    pub mod worker;
}

/// Single node container task runner.
#[derive(Debug, Parser)]
#[command(name = "cubelet", version, about)]
struct Cli {
    /// Path to a TOML config file; defaults to ./cubelet.toml when present.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides `log.level`.
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Overrides `log.format`.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }
    config.validate()?;

    init_logging(&config.log.level, config.log.format)?;
    info!(backend = ?config.store.backend, "starting cubelet");

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect(config.call_timeout(), config.pull_timeout())
            .await
            .context("failed to connect to the container engine")?,
    );
    let store = open_store(&config.store).context("failed to open task store")?;
    info!(backend = store.backend(), "task store ready");

    let worker = Arc::new(Worker::new(&config.worker.name, store, runtime.clone()));
    let recovered = worker.recover().context("failed to recover scheduled tasks")?;
    if recovered > 0 {
        info!(recovered, "re-queued tasks scheduled before the last shutdown");
    }
    let runner = tokio::spawn(run_tasks(worker.clone(), config.idle_interval()));

    let scheduler = config.scheduler.enabled.then(|| {
        tokio::spawn(Scheduler::new(runtime.clone(), config.poll_interval()).run())
    });

    let server = TaskServer::new(worker.clone(), &config.server.address, config.server.port);
    let listener = server
        .bind()
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    let (close_tx, close_rx) = oneshot::channel::<()>();
    let server_handle = tokio::spawn(server.start_server(listener, async move {
        let _ = close_rx.await;
    }));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping all containers");

    // Containers go first so nothing keeps running once the API is gone.
    let sweep = worker.stop_all_tasks().await;
    match &sweep {
        Ok(report) => info!(
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            "container sweep finished"
        ),
        Err(e) => error!(error = %e, "container sweep failed"),
    }

    runner.abort();
    if let Some(scheduler) = scheduler {
        scheduler.abort();
    }

    let _ = close_tx.send(());
    match tokio::time::timeout(config.shutdown_grace(), server_handle).await {
        Ok(Ok(Ok(()))) => info!("server closed"),
        Ok(Ok(Err(e))) => error!(error = %e, "server exited with error"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!("server did not drain in time, exiting"),
    }

    sweep.context("failed to stop running containers")?;
    info!("cubelet exited");
    Ok(())
}

fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("failed to initialise json logging")?,
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("failed to initialise pretty logging")?,
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
