//! Reconciliation engine for keel.
//!
//! Converges declared resources against real infrastructure:
//!
//! - **Outbox poller**: claims change events from the durable queue under a
//!   lease and runs each through the reconcile wrapper.
//! - **Reconcile wrapper**: finalizer hook, `creating`/`deleting` status,
//!   driver dispatch under a timeout, `error` status on failure.
//! - **Driver registry**: exactly one [`Driver`] per resource kind.
//! - **Drift sweeper**: re-reconciles live resources whose cached observed
//!   state cannot prove they match the desired state.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use keel_core::WorkerId;
//! use keel_reconciler::{SimulatedInfrastructure, Worker, WorkerConfig};
//! use keel_store::InMemoryBackend;
//!
//! #[tokio::main]
//! async fn main() -> keel_reconciler::Result<()> {
//!     let backend = InMemoryBackend::default();
//!     let registry = Arc::new(Arc::new(SimulatedInfrastructure::new()).registry());
//!     let worker = Worker::new(
//!         WorkerConfig::new(WorkerId::generate("local")),
//!         registry,
//!         backend.repositories(),
//!     )?;
//!
//!     let shutdown = worker.shutdown_handle();
//!     keel_reconciler::install_signal_handlers(shutdown);
//!     worker.run().await?;
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod dispatch;
pub mod drift;
pub mod driver;
pub mod error;
pub mod poller;
pub mod reconcile;
pub mod retry;
pub mod sim;
pub mod sweeper;
pub mod worker;

// Re-export main types
pub use context::ReconcileContext;
pub use dispatch::DriverRegistry;
pub use drift::desired_matches_observed;
pub use driver::{Driver, DriverOutcome};
pub use error::{Error, Result};
pub use poller::{OutboxPoller, PollOutcome, PollerStats, TickReport};
pub use reconcile::{Finalizer, NoopFinalizer, Reconciler};
pub use retry::{RetryDecision, RetryPolicy};
pub use sim::SimulatedInfrastructure;
pub use sweeper::{DriftSweeper, SweepReport, SweeperStats};
pub use worker::{
    ShutdownHandle, ShutdownSignal, Worker, WorkerConfig, WorkerStats, install_signal_handlers,
};
