//! stellwerk-demo — a whole node in one process.
//!
//! Launches the in-process cluster, submits the built-in reduction kernel
//! over 2..4 units, waits for it, and shuts down.

use clap::Parser;

use stellwerk::{builtin_registry, Cluster};

/// Single-process stellwerk demo.
#[derive(Parser, Debug)]
#[command(name = "stellwerk-demo", version, about)]
struct Cli {
    /// Total processing units, scheduler included.
    #[arg(long, default_value_t = 5)]
    units: u32,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!("stellwerk task system");

    let cluster = Cluster::launch(cli.units, builtin_registry());

    let tid = cluster.spawn("rand_reduce", 2, 4);
    cluster.wait_for(tid);
    tracing::info!(%tid, "task finished");

    cluster.shutdown()?;
    Ok(())
}
