//! Outbox poller: claims change events and drives them through the
//! reconcile wrapper.

use std::time::Duration;

use chrono::Utc;
use keel_core::{EventId, OutboxEvent, RequestId, ResourceId, WorkerId, deadline_after};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::driver::DriverOutcome;
use crate::error::{Error, Result};
use crate::reconcile::Reconciler;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::worker::ShutdownSignal;

/// Result of processing at most one event.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// Nothing was claimable.
    Idle,
    /// The event's resource was reconciled and the event marked done.
    Reconciled {
        event_id: EventId,
        resource_id: ResourceId,
        outcome: DriverOutcome,
    },
    /// The resource no longer exists; the event was marked done unprocessed.
    Skipped {
        event_id: EventId,
        resource_id: ResourceId,
    },
    /// The attempt failed and the retry policy was applied.
    Failed {
        event_id: EventId,
        resource_id: ResourceId,
        error: Error,
        decision: RetryDecision,
    },
}

/// Counts for one drain of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reconciled: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl TickReport {
    #[must_use]
    pub const fn processed(&self) -> usize {
        self.reconciled
            .saturating_add(self.skipped)
            .saturating_add(self.failed)
    }
}

/// Totals over the lifetime of a poll loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStats {
    pub ticks: u64,
    pub reconciled: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Ticks that ended in a queue or repository error.
    pub errors: u64,
}

impl PollerStats {
    fn record(&mut self, report: TickReport) {
        self.reconciled = self.reconciled.saturating_add(widen(report.reconciled));
        self.skipped = self.skipped.saturating_add(widen(report.skipped));
        self.failed = self.failed.saturating_add(widen(report.failed));
    }
}

/// Widen a per-run count into a lifetime total.
pub(crate) fn widen(count: usize) -> u64 {
    u64::try_from(count).unwrap_or(u64::MAX)
}

/// Drains the outbox one event at a time.
#[derive(Debug, Clone)]
pub struct OutboxPoller {
    worker_id: WorkerId,
    reconciler: Reconciler,
    retry: RetryPolicy,
    max_events_per_tick: usize,
}

impl OutboxPoller {
    #[must_use]
    pub fn new(worker_id: WorkerId, reconciler: Reconciler) -> Self {
        Self {
            worker_id,
            reconciler,
            retry: RetryPolicy::default(),
            max_events_per_tick: 1,
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_max_events_per_tick(mut self, max: usize) -> Self {
        self.max_events_per_tick = max.max(1);
        self
    }

    #[must_use]
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Claim and process at most one event.
    ///
    /// # Errors
    ///
    /// Returns an error when the queue itself cannot be read or updated.
    /// Reconcile failures are not errors here; they come back as
    /// [`PollOutcome::Failed`].
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        let repos = self.reconciler.repositories();
        let Some(event) = repos.outbox.claim_next(&self.worker_id).await? else {
            return Ok(PollOutcome::Idle);
        };

        debug!(
            worker_id = %self.worker_id,
            event_id = %event.event_id,
            resource_id = %event.resource_id,
            attempts = event.attempts,
            "Claimed outbox event"
        );

        let resource = match repos.resources.get_by_resource_id(&event.resource_id).await {
            Ok(Some(resource)) => resource,
            Ok(None) => {
                repos.outbox.mark_done(&event.event_id).await?;
                info!(
                    event_id = %event.event_id,
                    resource_id = %event.resource_id,
                    "Resource vanished, event dropped"
                );
                return Ok(PollOutcome::Skipped {
                    event_id: event.event_id,
                    resource_id: event.resource_id,
                });
            }
            Err(err) => return self.fail(event, Error::from(err)).await,
        };

        let request_id = RequestId::for_event(&self.worker_id, &event.event_id);
        match self.reconciler.reconcile(resource, request_id).await {
            Ok(outcome) => {
                repos.outbox.mark_done(&event.event_id).await?;
                Ok(PollOutcome::Reconciled {
                    event_id: event.event_id,
                    resource_id: event.resource_id,
                    outcome,
                })
            }
            Err(err) => self.fail(event, err).await,
        }
    }

    async fn fail(&self, event: OutboxEvent, error: Error) -> Result<PollOutcome> {
        let outbox = &self.reconciler.repositories().outbox;
        let message = error.to_string();
        let decision = self.retry.decide(event.attempts);

        let updated = match decision {
            RetryDecision::Immediate => outbox.mark_failed(&event.event_id, &message).await?,
            RetryDecision::After(delay) => {
                let retry_at = deadline_after(Utc::now(), delay);
                outbox
                    .mark_failed_until(&event.event_id, &message, retry_at)
                    .await?
            }
            RetryDecision::DeadLetter => {
                let retired = outbox.dead_letter(&event.event_id, &message).await?;
                error!(
                    event_id = %event.event_id,
                    resource_id = %event.resource_id,
                    attempts = retired.attempts,
                    error = %message,
                    "Event dead-lettered"
                );
                retired
            }
        };

        warn!(
            event_id = %event.event_id,
            resource_id = %event.resource_id,
            attempts = updated.attempts,
            decision = ?decision,
            error = %message,
            "Outbox event failed"
        );

        Ok(PollOutcome::Failed {
            event_id: event.event_id,
            resource_id: event.resource_id,
            error,
            decision,
        })
    }

    /// Drain up to `max_events_per_tick` events, stopping early when the
    /// queue is idle or an event fails.
    ///
    /// # Errors
    ///
    /// Returns the first queue error; events processed before it stay
    /// processed.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();

        for _ in 0..self.max_events_per_tick {
            match self.poll_once().await? {
                PollOutcome::Idle => break,
                PollOutcome::Reconciled { .. } => {
                    report.reconciled = report.reconciled.saturating_add(1);
                }
                PollOutcome::Skipped { .. } => report.skipped = report.skipped.saturating_add(1),
                PollOutcome::Failed { .. } => {
                    report.failed = report.failed.saturating_add(1);
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Poll every `interval` until a shutdown signal arrives. The in-flight
    /// tick always completes first.
    pub async fn run(
        &self,
        interval: Duration,
        mut shutdown: broadcast::Receiver<ShutdownSignal>,
    ) -> PollerStats {
        info!(
            worker_id = %self.worker_id,
            interval_ms = interval.as_millis(),
            "Starting outbox poller"
        );

        let mut stats = PollerStats::default();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                signal = shutdown.recv() => {
                    info!(worker_id = %self.worker_id, signal = ?signal.ok(), "Outbox poller stopping");
                    break;
                }
                _ = ticker.tick() => {
                    stats.ticks = stats.ticks.saturating_add(1);
                    match self.tick().await {
                        Ok(report) => {
                            if report.processed() > 0 {
                                debug!(
                                    reconciled = report.reconciled,
                                    skipped = report.skipped,
                                    failed = report.failed,
                                    "Poll tick complete"
                                );
                            }
                            stats.record(report);
                        }
                        Err(err) => {
                            stats.errors = stats.errors.saturating_add(1);
                            error!(worker_id = %self.worker_id, error = %err, "Poll tick failed");
                        }
                    }
                }
            }
        }

        stats
    }
}
