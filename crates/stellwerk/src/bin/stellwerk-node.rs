//! stellwerk-node — one processing unit of a stellwerk node.
//!
//! Rank 0 runs the scheduler, every other rank a worker unit. Units find
//! each other through per-rank endpoints derived from a shared base
//! address.
//!
//! # Usage
//!
//! ```bash
//! # Local IPC node with four units
//! stellwerk-node --rank 1 &
//! stellwerk-node --rank 2 &
//! stellwerk-node --rank 3 &
//! stellwerk-node --rank 0 --spawn rand_reduce --min 2 --max 3
//!
//! # TCP across hosts
//! STELLWERK_TRANSPORT=tcp STELLWERK_HOST=10.0.0.1 stellwerk-node --rank 0 --units 8
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use stellwerk::{builtin_registry, init, Role, StellwerkConfig, TransportKind};

/// One processing unit of a stellwerk node.
#[derive(Parser, Debug)]
#[command(name = "stellwerk-node", version, about)]
struct Cli {
    /// Rank of this unit within its node (0 = scheduler).
    #[arg(long, env = "STELLWERK_RANK")]
    rank: u32,

    /// Total processing units on this node, scheduler included.
    #[arg(long, env = "STELLWERK_UNITS", default_value_t = 4)]
    units: u32,

    /// Transport type: "ipc" or "tcp".
    #[arg(long, env = "STELLWERK_TRANSPORT", default_value = "ipc")]
    transport: String,

    /// TCP host (only used with --transport tcp).
    #[arg(long, env = "STELLWERK_HOST", default_value = "127.0.0.1")]
    host: String,

    /// TCP base port; unit r binds base_port + r.
    #[arg(long, env = "STELLWERK_BASE_PORT", default_value_t = 5600)]
    base_port: u16,

    /// IPC socket name prefix (only used with --transport ipc).
    #[arg(long, env = "STELLWERK_IPC_PREFIX", default_value = "node")]
    ipc_prefix: String,

    /// Optional TOML config file; flags are ignored when it is given.
    #[arg(long, env = "STELLWERK_CONFIG")]
    config: Option<PathBuf>,

    /// Scheduler role only: submit this kernel once the node is up, wait
    /// for it, then shut the node down.
    #[arg(long)]
    spawn: Option<String>,

    /// Minimum units for --spawn.
    #[arg(long, default_value_t = 2)]
    min: u32,

    /// Maximum units for --spawn.
    #[arg(long, default_value_t = 4)]
    max: u32,
}

impl Cli {
    fn to_config(&self) -> anyhow::Result<StellwerkConfig> {
        if let Some(path) = &self.config {
            return Ok(StellwerkConfig::load(path)?);
        }
        let mut config = StellwerkConfig::default();
        config.node.units = self.units;
        config.transport.kind = match self.transport.as_str() {
            "tcp" => TransportKind::Tcp,
            _ => TransportKind::Ipc,
        };
        config.transport.host = self.host.clone();
        config.transport.base_port = self.base_port;
        config.transport.ipc_prefix = self.ipc_prefix.clone();
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting stellwerk-node");

    let config = cli.to_config()?;
    let role = init(&config, cli.rank, builtin_registry()).await?;

    match role {
        Role::Worker(worker) => {
            if let Err(e) = worker.run().await {
                tracing::error!(error = %e, "worker unit failed");
                std::process::exit(1);
            }
        }
        Role::Scheduler(scheduler) => {
            // Let the worker units bind their endpoints.
            tokio::time::sleep(Duration::from_millis(500)).await;

            if let Some(kernel) = cli.spawn.clone() {
                let s = Arc::clone(&scheduler);
                let (min, max) = (cli.min, cli.max);
                tokio::task::spawn_blocking(move || {
                    let tid = s.spawn(&kernel, min, max);
                    s.wait_for(tid);
                    tracing::info!(%tid, "submitted task completed");
                })
                .await?;
            } else {
                shutdown_signal().await;
                tracing::info!("shutdown signal received");
            }

            tokio::task::spawn_blocking(move || scheduler.finalize()).await?;
        }
    }

    tracing::info!("stellwerk-node exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
    }
}
