//! In-memory repositories for tests and single-process runs.
//!
//! Each backend guards its documents with a tokio lock, so every operation is
//! atomic with respect to the others on the same instance. That is exactly the
//! guarantee the outbox claim needs inside one process.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{
    EventId, EventLock, OutboxEvent, Resource, ResourceId, ResourceStatus, Secret, SecretId,
    StatusPatch, WorkerId,
};
use tokio::sync::{Mutex, RwLock};

use crate::error::{PersistenceError, PersistenceResult};
use crate::repository::{
    OutboxConfig, OutboxQueue, ResourceFilter, ResourceRepository, SecretsRepository,
    StatusRepository,
};

/// In-memory resource documents.
#[derive(Debug, Default)]
pub struct InMemoryResources {
    resources: RwLock<HashMap<ResourceId, Resource>>,
}

impl InMemoryResources {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a resource, as the API layer would.
    pub async fn save(&self, resource: Resource) {
        self.resources
            .write()
            .await
            .insert(resource.resource_id.clone(), resource);
    }

    /// Remove a resource document entirely.
    pub async fn remove(&self, resource_id: &ResourceId) -> Option<Resource> {
        self.resources.write().await.remove(resource_id)
    }
}

#[async_trait]
impl ResourceRepository for InMemoryResources {
    async fn get_by_resource_id(&self, id: &ResourceId) -> PersistenceResult<Option<Resource>> {
        Ok(self.resources.read().await.get(id).cloned())
    }

    async fn list(&self, filter: &ResourceFilter) -> PersistenceResult<Vec<Resource>> {
        let resources = self.resources.read().await;
        let mut matching: Vec<Resource> = resources
            .values()
            .filter(|resource| filter.matches(resource))
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.resource_id.cmp(&b.resource_id))
        });
        matching.truncate(filter.limit.unwrap_or(usize::MAX));

        Ok(matching)
    }
}

/// In-memory status documents.
#[derive(Debug, Default)]
pub struct InMemoryStatuses {
    statuses: RwLock<HashMap<ResourceId, ResourceStatus>>,
}

impl InMemoryStatuses {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusRepository for InMemoryStatuses {
    async fn upsert(
        &self,
        resource_id: &ResourceId,
        patch: StatusPatch,
    ) -> PersistenceResult<ResourceStatus> {
        let mut statuses = self.statuses.write().await;
        let status = statuses
            .entry(resource_id.clone())
            .or_insert_with(|| ResourceStatus::initial(resource_id.clone()));
        status.apply(patch);
        Ok(status.clone())
    }

    async fn get(&self, resource_id: &ResourceId) -> PersistenceResult<Option<ResourceStatus>> {
        Ok(self.statuses.read().await.get(resource_id).cloned())
    }
}

/// In-memory outbox queue.
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    events: Mutex<Vec<OutboxEvent>>,
    config: OutboxConfig,
}

impl InMemoryOutbox {
    #[must_use]
    pub fn new(config: OutboxConfig) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Number of events, processed or not.
    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }

    async fn update<F>(&self, event_id: &EventId, apply: F) -> PersistenceResult<OutboxEvent>
    where
        F: FnOnce(&mut OutboxEvent, DateTime<Utc>) + Send,
    {
        let mut events = self.events.lock().await;
        let event = events
            .iter_mut()
            .find(|event| &event.event_id == event_id)
            .ok_or_else(|| PersistenceError::not_found("outbox_event", event_id.as_str()))?;
        let now = Utc::now();
        apply(event, now);
        event.updated_at = now;
        Ok(event.clone())
    }
}

fn record_failure(event: &mut OutboxEvent, error: &str) {
    event.attempts = event.attempts.saturating_add(1);
    event.last_error = Some(error.to_string());
}

#[async_trait]
impl OutboxQueue for InMemoryOutbox {
    fn lease(&self) -> Duration {
        self.config.lease
    }

    async fn enqueue(&self, event: OutboxEvent) -> PersistenceResult<OutboxEvent> {
        let event = event.into_pending();
        let mut events = self.events.lock().await;
        if events.iter().any(|existing| existing.event_id == event.event_id) {
            return Err(PersistenceError::already_exists(
                "outbox_event",
                event.event_id.as_str(),
            ));
        }
        events.push(event.clone());
        Ok(event)
    }

    async fn claim_next(&self, worker: &WorkerId) -> PersistenceResult<Option<OutboxEvent>> {
        let mut events = self.events.lock().await;
        let now = Utc::now();

        let candidate = events
            .iter_mut()
            .filter(|event| event.is_claimable_at(now))
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.event_id.cmp(&b.event_id))
            });

        Ok(candidate.map(|event| {
            event.lock = Some(EventLock::acquire(worker.clone(), now, self.config.lease));
            event.updated_at = now;
            event.clone()
        }))
    }

    async fn mark_done(&self, event_id: &EventId) -> PersistenceResult<OutboxEvent> {
        self.update(event_id, |event, now| {
            event.processed = true;
            event.processed_at = Some(now);
            event.lock = None;
        })
        .await
    }

    async fn mark_failed(
        &self,
        event_id: &EventId,
        error: &str,
    ) -> PersistenceResult<OutboxEvent> {
        self.update(event_id, |event, now| {
            record_failure(event, error);
            if let Some(lock) = event.lock.as_mut() {
                lock.lock_expires_at = now;
            }
        })
        .await
    }

    async fn mark_failed_until(
        &self,
        event_id: &EventId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> PersistenceResult<OutboxEvent> {
        self.update(event_id, |event, _| {
            record_failure(event, error);
            if let Some(lock) = event.lock.as_mut() {
                lock.lock_expires_at = retry_at;
            }
        })
        .await
    }

    async fn dead_letter(
        &self,
        event_id: &EventId,
        error: &str,
    ) -> PersistenceResult<OutboxEvent> {
        self.update(event_id, |event, now| {
            record_failure(event, error);
            event.processed = true;
            event.processed_at = Some(now);
            event.dead_lettered = true;
            event.lock = None;
        })
        .await
    }

    async fn get(&self, event_id: &EventId) -> PersistenceResult<Option<OutboxEvent>> {
        Ok(self
            .events
            .lock()
            .await
            .iter()
            .find(|event| &event.event_id == event_id)
            .cloned())
    }
}

/// In-memory secrets.
#[derive(Debug, Default)]
pub struct InMemorySecrets {
    secrets: RwLock<HashMap<SecretId, Secret>>,
}

impl InMemorySecrets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.secrets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.secrets.read().await.is_empty()
    }
}

#[async_trait]
impl SecretsRepository for InMemorySecrets {
    async fn create(&self, secret: Secret) -> PersistenceResult<Secret> {
        let mut secrets = self.secrets.write().await;
        if secrets.contains_key(&secret.secret_id) {
            return Err(PersistenceError::already_exists(
                "secret",
                secret.secret_id.as_str(),
            ));
        }
        secrets.insert(secret.secret_id.clone(), secret.clone());
        Ok(secret)
    }

    async fn get(&self, secret_id: &SecretId) -> PersistenceResult<Option<Secret>> {
        Ok(self.secrets.read().await.get(secret_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

    use std::sync::Arc;

    use keel_core::{DesiredState, ResourceKind, StatusState};

    use super::*;

    fn outbox(lease: Duration) -> InMemoryOutbox {
        InMemoryOutbox::new(OutboxConfig::default().with_lease(lease))
    }

    #[tokio::test]
    async fn test_enqueue_resets_bookkeeping() {
        let queue = outbox(Duration::from_secs(30));
        let mut event = OutboxEvent::resource_changed("r-1");
        event.attempts = 7;
        event.processed = true;

        let stored = queue.enqueue(event).await.unwrap();
        assert_eq!(stored.attempts, 0);
        assert!(!stored.processed);
        assert!(stored.lock.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_duplicate_event_id() {
        let queue = outbox(Duration::from_secs(30));
        let first = OutboxEvent::resource_changed("r-1").with_event_id("evt-1");
        let second = OutboxEvent::resource_changed("r-1").with_event_id("evt-1");

        assert!(queue.enqueue(first).await.is_ok());
        let duplicate = queue.enqueue(second).await;
        assert!(matches!(duplicate, Err(PersistenceError::AlreadyExists { .. })));
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_claim_takes_oldest_first() {
        let queue = outbox(Duration::from_secs(30));
        let worker = WorkerId::from("w-1");
        let mut older = OutboxEvent::resource_changed("r-old");
        older.created_at -= chrono::Duration::seconds(10);
        let newer = OutboxEvent::resource_changed("r-new");

        queue.enqueue(newer).await.unwrap();
        queue.enqueue(older.clone()).await.unwrap();

        let claimed = queue.claim_next(&worker).await.unwrap().unwrap();
        assert_eq!(claimed.event_id, older.event_id);
        assert_eq!(
            claimed.lock.as_ref().map(|lock| &lock.locked_by),
            Some(&worker)
        );
    }

    #[tokio::test]
    async fn test_live_lease_is_not_reclaimed() {
        let queue = outbox(Duration::from_secs(60));
        queue
            .enqueue(OutboxEvent::resource_changed("r-1"))
            .await
            .unwrap();

        assert!(queue.claim_next(&WorkerId::from("w-1")).await.unwrap().is_some());
        assert!(queue.claim_next(&WorkerId::from("w-2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let queue = outbox(Duration::ZERO);
        let event = queue
            .enqueue(OutboxEvent::resource_changed("r-1"))
            .await
            .unwrap();

        let first = queue.claim_next(&WorkerId::from("w-1")).await.unwrap();
        let second = queue.claim_next(&WorkerId::from("w-2")).await.unwrap();

        assert_eq!(first.map(|e| e.event_id), Some(event.event_id.clone()));
        let second = second.unwrap();
        assert_eq!(second.event_id, event.event_id);
        assert_eq!(
            second.lock.map(|lock| lock.locked_by),
            Some(WorkerId::from("w-2"))
        );
    }

    #[tokio::test]
    async fn test_oversized_lease_claims_without_overflow() {
        let queue = outbox(Duration::from_secs(u64::MAX));
        queue
            .enqueue(OutboxEvent::resource_changed("r-1"))
            .await
            .unwrap();

        let claimed = queue.claim_next(&WorkerId::from("w-1")).await.unwrap();
        assert_eq!(
            claimed.and_then(|e| e.lock).map(|lock| lock.lock_expires_at),
            Some(DateTime::<Utc>::MAX_UTC)
        );
        assert!(queue.claim_next(&WorkerId::from("w-2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let queue = Arc::new(outbox(Duration::from_secs(60)));
        let event = queue
            .enqueue(OutboxEvent::resource_changed("r-1"))
            .await
            .unwrap();

        let claims = (0..16).map(|i| {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.claim_next(&WorkerId::from(format!("w-{i}"))).await })
        });

        let mut winners = 0;
        for claim in claims {
            if let Some(claimed) = claim.await.unwrap().unwrap() {
                assert_eq!(claimed.event_id, event.event_id);
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_mark_failed_makes_event_claimable_again() {
        let queue = outbox(Duration::from_secs(60));
        let worker = WorkerId::from("w-1");
        let event = queue
            .enqueue(OutboxEvent::resource_changed("r-1"))
            .await
            .unwrap();

        queue.claim_next(&worker).await.unwrap();
        let failed = queue.mark_failed(&event.event_id, "engine down").await.unwrap();
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.last_error.as_deref(), Some("engine down"));

        let reclaimed = queue.claim_next(&worker).await.unwrap().unwrap();
        assert_eq!(reclaimed.event_id, event.event_id);
        assert_eq!(reclaimed.attempts, 1);
    }

    #[tokio::test]
    async fn test_mark_failed_until_defers_reclaim() {
        let queue = outbox(Duration::from_secs(60));
        let worker = WorkerId::from("w-1");
        let event = queue
            .enqueue(OutboxEvent::resource_changed("r-1"))
            .await
            .unwrap();

        queue.claim_next(&worker).await.unwrap();
        queue
            .mark_failed_until(
                &event.event_id,
                "engine down",
                Utc::now() + chrono::Duration::seconds(30),
            )
            .await
            .unwrap();

        assert!(queue.claim_next(&worker).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_done_and_dead_letter_are_terminal() {
        let queue = outbox(Duration::ZERO);
        let worker = WorkerId::from("w-1");
        let done = queue
            .enqueue(OutboxEvent::resource_changed("r-1"))
            .await
            .unwrap();
        let dead = queue
            .enqueue(OutboxEvent::resource_changed("r-2"))
            .await
            .unwrap();

        let processed = queue.mark_done(&done.event_id).await.unwrap();
        assert!(processed.processed);
        assert!(processed.processed_at.is_some());
        assert!(processed.lock.is_none());

        let retired = queue.dead_letter(&dead.event_id, "gave up").await.unwrap();
        assert!(retired.processed);
        assert!(retired.dead_lettered);
        assert_eq!(retired.attempts, 1);

        assert!(queue.claim_next(&worker).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_done_unknown_event_is_not_found() {
        let queue = outbox(Duration::ZERO);
        let result = queue.mark_done(&EventId::from("missing")).await;
        assert!(matches!(result, Err(PersistenceError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_list_orders_by_recent_update_and_limits() {
        let resources = InMemoryResources::new();
        let now = Utc::now();
        for (i, offset) in [30_i64, 10, 20].into_iter().enumerate() {
            let mut resource =
                Resource::new(format!("r-{i}"), ResourceKind::Volume, "p-1", "data");
            resource.updated_at = now - chrono::Duration::seconds(offset);
            resources.save(resource).await;
        }
        resources
            .save(
                Resource::new("r-gone", ResourceKind::Volume, "p-1", "old")
                    .with_desired_state(DesiredState::Deleted),
            )
            .await;

        let listed = resources
            .list(&ResourceFilter::live().limit(2))
            .await
            .unwrap();
        let ids: Vec<&str> = listed.iter().map(|r| r.resource_id.as_str()).collect();
        assert_eq!(ids, vec!["r-1", "r-2"]);
    }

    #[tokio::test]
    async fn test_status_upsert_creates_then_merges() {
        let statuses = InMemoryStatuses::new();
        let id = ResourceId::from("r-1");

        let created = statuses
            .upsert(&id, StatusPatch::state(StatusState::Creating).with_message("start"))
            .await
            .unwrap();
        assert_eq!(created.resource_id, id);
        assert_eq!(created.observed_generation, 0);

        let ready = statuses
            .upsert(
                &id,
                StatusPatch::state(StatusState::Ready).with_observed_generation(2),
            )
            .await
            .unwrap();
        assert_eq!(ready.state, StatusState::Ready);
        assert_eq!(ready.message, "start");
        assert!(ready.last_updated_at >= created.last_updated_at);
    }

    #[tokio::test]
    async fn test_secrets_round_trip() {
        let secrets = InMemorySecrets::new();
        let secret = secrets
            .create(Secret::new("db-password", "s3cret"))
            .await
            .unwrap();
        let loaded = secrets.get(&secret.secret_id).await.unwrap();
        assert_eq!(loaded.map(|s| s.value), Some("s3cret".to_string()));
        assert!(secrets.create(secret).await.is_err());
    }
}
