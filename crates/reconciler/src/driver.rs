//! The driver contract.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ReconcileContext;
use crate::error::Result;

/// How a driver finished an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverOutcome {
    /// Infrastructure matches the spec; `actual` is the cached snapshot.
    Converged { actual: Value },
    /// Teardown completed.
    Deleted,
    /// Dependency data is missing; the resource stays `creating`.
    Pending { reason: String },
}

impl DriverOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Converged { .. } => "converged",
            Self::Deleted => "deleted",
            Self::Pending { .. } => "pending",
        }
    }
}

/// Converges the infrastructure behind one resource kind.
///
/// Implementations must honour the following:
///
/// - **Idempotent ensure.** `reconcile` may run any number of times for the
///   same generation, from the poller and the drift sweeper concurrently.
///   Repeated calls must never provision duplicate infrastructure.
/// - **Deletion.** When the resource's desired state is `deleted`, tear down
///   best-effort and finish with [`ReconcileContext::report_deleted`].
/// - **Convergence.** Otherwise converge and finish with
///   [`ReconcileContext::report_ready`], caching a snapshot the drift check
///   for the kind can read.
/// - **Missing dependencies.** When data the driver depends on is not there
///   yet, finish with [`ReconcileContext::report_pending`]; this is not an
///   error.
/// - **Failures.** Infrastructure errors are returned as `Err`. The caller
///   writes the `error` status.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn reconcile(&self, ctx: &ReconcileContext) -> Result<DriverOutcome>;
}
