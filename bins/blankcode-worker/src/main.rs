mod config;
mod health;
mod store;
mod worker;

use anyhow::Context;
use blankcode_common::config::ExecutionConfig;
use blankcode_engine::sandbox::{DockerSandbox, LocalSandbox};
use blankcode_engine::{Coordinator, ExecutionEngine, Sandbox};
use config::WorkerConfig;
use std::sync::Arc;
use store::RedisBackend;
use tokio::sync::watch;
use tracing::{error, info, warn};
use worker::{Collaborators, Worker};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}

async fn build_sandbox(config: &ExecutionConfig) -> anyhow::Result<Arc<dyn Sandbox>> {
    if config.docker_enabled {
        let docker = DockerSandbox::new(config.pids_limit)?;
        docker
            .ping()
            .await
            .context("Docker is enabled but the daemon is unreachable (set DOCKER_ENABLED=false for local mode)")?;
        info!(pids_limit = config.pids_limit, "Using Docker sandbox");
        Ok(Arc::new(docker))
    } else {
        warn!("DOCKER_ENABLED=false: running submissions as local processes without memory, CPU or network isolation");
        Ok(Arc::new(LocalSandbox::new()))
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Blankcode worker booting...");

    let execution = Arc::new(ExecutionConfig::from_env().context("Invalid execution configuration")?);
    let worker_config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    info!(
        timeout_ms = execution.timeout_ms,
        memory_limit_mb = execution.memory_limit_mb,
        cpu_limit = execution.cpu_limit,
        workspace_dir = %execution.workspace_dir.display(),
        languages = ?execution.list_languages(),
        "Execution configuration loaded"
    );

    let sandbox = build_sandbox(&execution).await?;
    let coordinator = Coordinator::new(ExecutionEngine::new(sandbox, execution.clone()));

    let backend = Arc::new(
        RedisBackend::connect(&worker_config.redis_url, worker_config.lock_ms).await?,
    );
    info!(redis_url = %worker_config.redis_url, "Connected to Redis");

    let worker = Arc::new(Worker::new(
        Collaborators {
            queue: backend.clone(),
            submissions: backend.clone(),
            exercises: backend.clone(),
            progress: backend,
            grader: Arc::new(coordinator),
        },
        worker_config.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health = worker_config.health_addr.map(|addr| {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(addr, rx).await {
                error!(error = %format!("{:#}", e), "Health server failed");
            }
        })
    });

    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Received shutdown signal, draining in-flight jobs...");
        let _ = shutdown_tx.send(true);
    });

    info!(concurrency = worker_config.concurrency, "Ready to accept jobs");
    worker.run(shutdown_rx).await?;

    if let Some(handle) = health {
        let _ = handle.await;
    }
    info!("Worker shutdown complete");
    Ok(())
}
