//! # keel - reconciliation worker
//!
//! ## Startup Sequence
//!
//! 1. **Configuration** - Parse flags and `KEEL_*` environment variables
//! 2. **Store** - Connect to SurrealDB, apply the schema, check health
//! 3. **Repositories** - Build the outbox, status, secret and cache handles
//! 4. **Worker** - Start the outbox poller and (optionally) the drift sweeper
//!
//! ## Shutdown
//!
//! SIGTERM/SIGINT stop both loops between attempts. In-flight attempts are
//! not interrupted; an event whose attempt is cut short by process exit is
//! reclaimed by another worker once its lease expires.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use keel_reconciler::{SimulatedInfrastructure, Worker, install_signal_handlers};
use keel_store::{ControlPlaneStore, Repositories};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    init_tracing();

    let cli = Cli::parse();
    let worker_config = cli.worker_config();
    info!(worker_id = %worker_config.worker_id, "keel starting");

    let store = ControlPlaneStore::open(cli.store_config())
        .await
        .context("Failed to open the control-plane store")?;
    store
        .health_check()
        .await
        .context("Store health check failed")?;
    info!(url = %store.config().url, "Store connected and healthy");

    let repos = Repositories::surreal(&store, cli.outbox_config(), cli.cache_config());

    // No real cloud drivers are linked into this binary yet.
    let registry = Arc::new(Arc::new(SimulatedInfrastructure::new()).registry());
    warn!("Running with simulated infrastructure drivers");

    let worker =
        Worker::new(worker_config, registry, repos).context("Invalid worker configuration")?;
    let signals = install_signal_handlers(worker.shutdown_handle());

    info!(startup = ?start_time.elapsed(), "keel running. Press Ctrl+C to stop.");
    let stats = worker.run().await.context("Worker loop failed")?;
    signals.abort();

    info!(
        ticks = stats.poller.ticks,
        reconciled = stats.poller.reconciled,
        failed = stats.poller.failed,
        sweeps = stats.sweeper.map_or(0, |s| s.sweeps),
        "keel stopped gracefully"
    );
    Ok(())
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
