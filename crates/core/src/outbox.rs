//! Outbox events: durable reconciliation triggers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EventId, ResourceId, WorkerId};

/// Event type written by the API whenever a resource document changes.
pub const RESOURCE_CHANGED: &str = "RESOURCE_CHANGED";

/// `now + delay`, clamped to the latest representable instant.
#[must_use]
pub fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time-bounded exclusive claim on an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLock {
    pub locked_by: WorkerId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub locked_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub lock_expires_at: DateTime<Utc>,
}

impl EventLock {
    /// Lease held by `worker` from `now` for `lease`.
    #[must_use]
    pub fn acquire(worker: WorkerId, now: DateTime<Utc>, lease: Duration) -> Self {
        Self {
            locked_by: worker,
            locked_at: now,
            lock_expires_at: deadline_after(now, lease),
        }
    }

    /// A lease is expired once its deadline is not in the future.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_expires_at <= now
    }
}

/// Append-only reconciliation trigger keyed by resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub resource_id: ResourceId,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub processed: bool,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<EventLock>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Set when the retry policy gave up on the event.
    #[serde(default)]
    pub dead_lettered: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Create a pending event with a fresh id.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        resource_id: impl Into<ResourceId>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            event_id: EventId::generate(),
            event_type: event_type.into(),
            resource_id: resource_id.into(),
            payload,
            processed: false,
            processed_at: None,
            lock: None,
            attempts: 0,
            last_error: None,
            dead_lettered: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// `RESOURCE_CHANGED` event with an empty payload.
    #[must_use]
    pub fn resource_changed(resource_id: impl Into<ResourceId>) -> Self {
        Self::new(RESOURCE_CHANGED, resource_id, serde_json::Value::Null)
    }

    /// Use a caller-supplied stable id.
    #[must_use]
    pub fn with_event_id(mut self, event_id: impl Into<EventId>) -> Self {
        self.event_id = event_id.into();
        self
    }

    /// Reset queue bookkeeping to the state `enqueue` inserts.
    #[must_use]
    pub fn into_pending(mut self) -> Self {
        let now = Utc::now();
        self.processed = false;
        self.processed_at = None;
        self.lock = None;
        self.attempts = 0;
        self.last_error = None;
        self.dead_lettered = false;
        self.updated_at = now;
        self
    }

    /// Whether a worker may claim this event at `now`.
    #[must_use]
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        !self.processed
            && self
                .lock
                .as_ref()
                .is_none_or(|lock| lock.is_expired_at(now))
    }
}
