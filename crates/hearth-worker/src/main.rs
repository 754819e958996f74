use std::sync::Arc;

use clap::Parser;
use hearth_core::HearthConfig;
use hearth_lock::LockManager;
use hearth_queue::{Queue, RetryPolicy, Storage, Worker, WorkerOptions};
use tokio::sync::watch;
use tracing::info;

mod cli;
mod handlers;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hearth=info,hearth_queue=info,hearth_lock=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > HEARTH_CONFIG env > ~/.hearth/hearth.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("HEARTH_CONFIG").ok());
    let config = HearthConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        HearthConfig::default()
    });

    info!(path = %config.database.path, "opening SQLite database");
    let queue = Arc::new(Queue::new(Storage::from_config(
        &config.database,
        &config.storage,
    )?));
    let locks = Arc::new(LockManager::from_config(&config.lock)?);

    match cli.command {
        Command::Work { queue: name, max_jobs } => {
            let mut options = WorkerOptions::from_config(&config.worker);
            if let Some(name) = name {
                options.queue = name;
            }
            options.max_jobs = max_jobs;

            let registry = Arc::new(handlers::builtin_registry(Arc::clone(&locks)));
            info!(handlers = ?registry.names(), "job handlers registered");
            let worker = Worker::new(
                Arc::clone(&queue),
                registry,
                RetryPolicy::from_config(&config.worker),
                options,
            );

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("interrupt received; finishing current job");
                        let _ = shutdown_tx.send(true);
                    }
                    Err(e) => {
                        tracing::warn!("cannot listen for Ctrl-C ({e}); stop the worker with a signal");
                        // keep the sender alive so the worker doesn't read a closed channel as shutdown
                        std::future::pending::<()>().await;
                        drop(shutdown_tx);
                    }
                }
            });

            let stats = worker.run(shutdown_rx).await;
            println!(
                "processed {} job(s): {} succeeded, {} retried, {} failed",
                stats.processed, stats.succeeded, stats.retried, stats.failed
            );
        }
        ref command => {
            let output = cli::execute(command, &queue, &locks)?;
            println!("{output}");
        }
    }

    Ok(())
}
