//! Drift sweeper.
//!
//! Periodically re-reconciles live resources whose cached observation cannot
//! prove they are converged, independent of the outbox.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use keel_core::{RequestId, WorkerId};
use keel_store::ResourceFilter;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::drift::desired_matches_observed;
use crate::error::Result;
use crate::poller::widen;
use crate::reconcile::Reconciler;
use crate::worker::ShutdownSignal;

/// Counts for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Resources loaded.
    pub scanned: usize,
    /// Resources proven in sync by the cache.
    pub in_sync: usize,
    pub reconciled: usize,
    pub failed: usize,
    /// The sweep did not run because another was in flight.
    pub skipped: bool,
}

impl SweepReport {
    const fn skipped() -> Self {
        Self {
            scanned: 0,
            in_sync: 0,
            reconciled: 0,
            failed: 0,
            skipped: true,
        }
    }
}

/// Totals over the lifetime of a sweep loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweeperStats {
    pub sweeps: u64,
    pub skipped: u64,
    pub reconciled: u64,
    pub failed: u64,
    pub errors: u64,
}

/// Clears the in-flight flag when a sweep ends, however it ends.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Re-reconciles drifted resources.
#[derive(Debug, Clone)]
pub struct DriftSweeper {
    worker_id: WorkerId,
    reconciler: Reconciler,
    batch_size: usize,
    running: Arc<AtomicBool>,
}

impl DriftSweeper {
    #[must_use]
    pub fn new(worker_id: WorkerId, reconciler: Reconciler, batch_size: usize) -> Self {
        Self {
            worker_id,
            reconciler,
            batch_size,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run one sweep. Overlapping calls return a skipped report.
    ///
    /// # Errors
    ///
    /// Returns an error only when the resource list cannot be loaded;
    /// per-resource failures are counted in the report.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(worker_id = %self.worker_id, "Sweep already in flight, skipping");
            return Ok(SweepReport::skipped());
        }
        let _guard = SweepGuard(&self.running);

        let repos = self.reconciler.repositories();
        let resources = repos
            .resources
            .list(&ResourceFilter::live().limit(self.batch_size))
            .await?;

        let mut report = SweepReport {
            scanned: resources.len(),
            ..SweepReport::default()
        };

        for resource in resources {
            let observed = match repos.observed.get(&resource.resource_id).await {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(resource_id = %resource.resource_id, error = %err, "Observed cache read failed");
                    None
                }
            };

            if desired_matches_observed(&resource, observed.as_ref()) {
                report.in_sync = report.in_sync.saturating_add(1);
                continue;
            }

            let resource_id = resource.resource_id.clone();
            let request_id = RequestId::for_sweep(&self.worker_id, &resource_id);
            debug!(resource_id = %resource_id, request_id = %request_id, "Drift detected");

            match self.reconciler.reconcile(resource, request_id).await {
                Ok(_) => report.reconciled = report.reconciled.saturating_add(1),
                Err(err) => {
                    report.failed = report.failed.saturating_add(1);
                    warn!(resource_id = %resource_id, error = %err, "Drift reconcile failed");
                }
            }
        }

        if report.reconciled > 0 || report.failed > 0 {
            info!(
                worker_id = %self.worker_id,
                scanned = report.scanned,
                reconciled = report.reconciled,
                failed = report.failed,
                "Drift sweep complete"
            );
        }

        Ok(report)
    }

    /// Sweep every `interval` until a shutdown signal arrives.
    pub async fn run(
        &self,
        interval: Duration,
        mut shutdown: broadcast::Receiver<ShutdownSignal>,
    ) -> SweeperStats {
        info!(
            worker_id = %self.worker_id,
            interval_ms = interval.as_millis(),
            batch_size = self.batch_size,
            "Starting drift sweeper"
        );

        let mut stats = SweeperStats::default();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                signal = shutdown.recv() => {
                    info!(worker_id = %self.worker_id, signal = ?signal.ok(), "Drift sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report.skipped => stats.skipped = stats.skipped.saturating_add(1),
                        Ok(report) => {
                            stats.sweeps = stats.sweeps.saturating_add(1);
                            stats.reconciled = stats.reconciled.saturating_add(widen(report.reconciled));
                            stats.failed = stats.failed.saturating_add(widen(report.failed));
                        }
                        Err(err) => {
                            stats.errors = stats.errors.saturating_add(1);
                            error!(worker_id = %self.worker_id, error = %err, "Drift sweep failed");
                        }
                    }
                }
            }
        }

        stats
    }
}
