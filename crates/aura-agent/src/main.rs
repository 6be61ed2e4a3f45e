//! Aura agent binary: runs the voice agent worker.
//!
//! `aura-agent connect --room <name>` dispatches a single job for the named
//! room and keeps the session alive until SIGINT/SIGTERM.
//! `aura-agent download-files` fetches the local models ahead of time.

use aura_agent::{download_files, entrypoint, load_config, JobRequest, Worker, WorkerOptions};
use aura_types::DEFAULT_ROOM_NAME;
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "aura-agent", version, about = "Aura AI voice agent worker")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "AURA_CONFIG_PATH", default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Join a room directly and run one job in it.
    Connect {
        /// Room to join.
        #[arg(long, default_value = DEFAULT_ROOM_NAME)]
        room: String,
    },
    /// Download the voice activity and turn detection models.
    DownloadFiles,
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine; real deployments set the environment directly.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = load_config(Some(&cli.config))
        .expect("failed to load configuration; the agent cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(path = %cli.config, "resolved startup configuration path");
    config.livekit.warn_if_incomplete();

    let room = match cli.command {
        Command::Connect { room } => room,
        Command::DownloadFiles => {
            return match download_files(&config).await {
                Ok(files) => {
                    for file in &files {
                        tracing::info!(path = %file.display(), "model file ready");
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to download model files");
                    ExitCode::FAILURE
                }
            };
        }
    };

    let config = Arc::new(config);
    let livekit = config.livekit.clone();
    let worker = Worker::new(WorkerOptions::new(livekit, move |ctx| {
        entrypoint(ctx, Arc::clone(&config))
    }));

    // The sender stays alive so the worker keeps serving until a signal arrives.
    let (jobs_tx, jobs_rx) = mpsc::channel(8);
    if jobs_tx.send(JobRequest::new(room)).await.is_err() {
        tracing::error!("job channel closed before dispatch");
        return ExitCode::FAILURE;
    }

    let outcomes = worker.run(jobs_rx, shutdown_signal()).await;
    drop(jobs_tx);

    let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
    tracing::info!(jobs = outcomes.len(), failed, "aura agent shut down");

    if failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, shutting down worker"); }
        () = terminate => { tracing::info!("received SIGTERM, shutting down worker"); }
    }
}
