//! SurrealDB-backed repositories.
//!
//! Record ids mirror the domain ids (`resource:<resource_id>`,
//! `outbox_event:<event_id>`, ...). Timestamps are stored as epoch
//! milliseconds, so the lease predicate is a plain numeric comparison.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{
    EventId, EventLock, OutboxEvent, Resource, ResourceId, ResourceStatus, Secret, SecretId,
    StatusPatch, WorkerId,
};
use tracing::debug;

use crate::client::ControlPlaneStore;
use crate::error::{PersistenceError, PersistenceResult, from_surrealdb_error};
use crate::repository::{
    OutboxConfig, OutboxQueue, ResourceFilter, ResourceRepository, SecretsRepository,
    StatusRepository,
};

const RESOURCE_TABLE: &str = "resource";
const STATUS_TABLE: &str = "resource_status";
const OUTBOX_TABLE: &str = "outbox_event";
const SECRET_TABLE: &str = "secret";

const CLAIMABLE: &str =
    "processed = false AND (lock = NONE OR lock = NULL OR lock.lock_expires_at <= $now)";

fn first_or_not_found<T>(rows: Vec<T>, entity_type: &str, id: &str) -> PersistenceResult<T> {
    rows.into_iter()
        .next()
        .ok_or_else(|| PersistenceError::not_found(entity_type, id))
}

/// Resource documents.
#[derive(Debug, Clone)]
pub struct SurrealResources {
    store: ControlPlaneStore,
}

impl SurrealResources {
    #[must_use]
    pub fn new(store: ControlPlaneStore) -> Self {
        Self { store }
    }

    /// Insert or replace a resource document. Used by the API side and tests;
    /// the engine never writes resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn save(&self, resource: Resource) -> PersistenceResult<Resource> {
        let id = resource.resource_id.as_str().to_string();
        let saved: Option<Resource> = self
            .store
            .db()
            .upsert((RESOURCE_TABLE, id))
            .content(resource)
            .await
            .map_err(from_surrealdb_error)?;

        saved.ok_or_else(|| PersistenceError::query_failed("failed to save resource"))
    }
}

#[async_trait]
impl ResourceRepository for SurrealResources {
    async fn get_by_resource_id(&self, id: &ResourceId) -> PersistenceResult<Option<Resource>> {
        let resource: Option<Resource> = self
            .store
            .db()
            .select((RESOURCE_TABLE, id.as_str().to_string()))
            .await
            .map_err(from_surrealdb_error)?;

        Ok(resource)
    }

    async fn list(&self, filter: &ResourceFilter) -> PersistenceResult<Vec<Resource>> {
        let mut clauses = Vec::new();
        if filter.exclude_desired_state.is_some() {
            clauses.push("desired_state != $excluded_state");
        }
        if filter.kind.is_some() {
            clauses.push("kind = $kind");
        }
        if filter.project_id.is_some() {
            clauses.push("project_id = $project_id");
        }

        let mut query = String::from("SELECT * FROM resource");
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDER BY updated_at DESC, resource_id ASC");
        if filter.limit.is_some() {
            query.push_str(" LIMIT $limit");
        }

        let mut request = self.store.db().query(query);
        if let Some(state) = filter.exclude_desired_state {
            request = request.bind(("excluded_state", state.as_str().to_string()));
        }
        if let Some(kind) = filter.kind {
            request = request.bind(("kind", kind.as_str().to_string()));
        }
        if let Some(project_id) = &filter.project_id {
            request = request.bind(("project_id", project_id.as_str().to_string()));
        }
        if let Some(limit) = filter.limit {
            request = request.bind(("limit", u64::try_from(limit).unwrap_or(u64::MAX)));
        }

        let resources: Vec<Resource> = request
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(resources)
    }
}

/// Status documents.
#[derive(Debug, Clone)]
pub struct SurrealStatuses {
    store: ControlPlaneStore,
}

impl SurrealStatuses {
    #[must_use]
    pub fn new(store: ControlPlaneStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StatusRepository for SurrealStatuses {
    async fn upsert(
        &self,
        resource_id: &ResourceId,
        patch: StatusPatch,
    ) -> PersistenceResult<ResourceStatus> {
        let now = Utc::now();

        // resource_id comes from the key, never from the patch
        let mut query = String::from(
            "UPSERT type::thing('resource_status', $id) SET resource_id = $id, last_updated_at = $now",
        );
        if patch.observed_generation.is_some() {
            query.push_str(", observed_generation = $observed_generation");
        }
        if patch.state.is_some() {
            query.push_str(", state = $state");
        }
        if patch.message.is_some() {
            query.push_str(", message = $message");
        }
        match &patch.details {
            Some(serde_json::Value::Null) => query.push_str(", details = NONE"),
            Some(_) => query.push_str(", details = $details"),
            None => {}
        }
        query.push_str(" RETURN AFTER");

        let id = resource_id.as_str().to_string();
        let mut request = self
            .store
            .db()
            .query(query)
            .bind(("id", id.clone()))
            .bind(("now", now.timestamp_millis()));
        if let Some(generation) = patch.observed_generation {
            request = request.bind(("observed_generation", generation));
        }
        if let Some(state) = patch.state {
            request = request.bind(("state", state.as_str().to_string()));
        }
        if let Some(message) = patch.message {
            request = request.bind(("message", message));
        }
        if let Some(details) = patch.details.filter(|d| !d.is_null()) {
            request = request.bind(("details", details));
        }

        let rows: Vec<ResourceStatus> = request
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        first_or_not_found(rows, STATUS_TABLE, &id)
    }

    async fn get(&self, resource_id: &ResourceId) -> PersistenceResult<Option<ResourceStatus>> {
        let status: Option<ResourceStatus> = self
            .store
            .db()
            .select((STATUS_TABLE, resource_id.as_str().to_string()))
            .await
            .map_err(from_surrealdb_error)?;

        Ok(status)
    }
}

/// Outbox queue with lease-based claiming.
#[derive(Debug, Clone)]
pub struct SurrealOutbox {
    store: ControlPlaneStore,
    config: OutboxConfig,
}

impl SurrealOutbox {
    #[must_use]
    pub fn new(store: ControlPlaneStore, config: OutboxConfig) -> Self {
        Self { store, config }
    }

    /// Oldest claimable event as of `now`, if any.
    async fn next_candidate(&self, now: DateTime<Utc>) -> PersistenceResult<Option<OutboxEvent>> {
        let query = format!(
            "SELECT * FROM outbox_event WHERE {CLAIMABLE} ORDER BY created_at ASC, event_id ASC LIMIT 1"
        );
        let rows: Vec<OutboxEvent> = self
            .store
            .db()
            .query(query)
            .bind(("now", now.timestamp_millis()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(rows.into_iter().next())
    }

    /// Conditional update: only succeeds if the event is still claimable.
    async fn try_claim(
        &self,
        event_id: &EventId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> PersistenceResult<Option<OutboxEvent>> {
        let query = format!(
            "UPDATE type::thing('outbox_event', $event_id) SET lock = $lock, updated_at = $now WHERE {CLAIMABLE} RETURN AFTER"
        );
        let lock = EventLock::acquire(worker.clone(), now, self.config.lease);
        let rows: Vec<OutboxEvent> = self
            .store
            .db()
            .query(query)
            .bind(("event_id", event_id.as_str().to_string()))
            .bind(("lock", lock))
            .bind(("now", now.timestamp_millis()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(rows.into_iter().next())
    }

    async fn record_failure(
        &self,
        event_id: &EventId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> PersistenceResult<OutboxEvent> {
        let now = Utc::now();
        let mut response = self
            .store
            .db()
            .query(
                "UPDATE type::thing('outbox_event', $event_id) \
                 SET attempts += 1, last_error = $error, updated_at = $now RETURN AFTER;",
            )
            .query(
                "UPDATE type::thing('outbox_event', $event_id) \
                 SET lock.lock_expires_at = $retry_at WHERE lock != NONE AND lock != NULL RETURN AFTER;",
            )
            .bind(("event_id", event_id.as_str().to_string()))
            .bind(("error", error.to_string()))
            .bind(("now", now.timestamp_millis()))
            .bind(("retry_at", retry_at.timestamp_millis()))
            .await
            .map_err(from_surrealdb_error)?;

        let counted: Vec<OutboxEvent> = response.take(0).map_err(from_surrealdb_error)?;
        let released: Vec<OutboxEvent> = response.take(1).map_err(from_surrealdb_error)?;

        match released.into_iter().next() {
            Some(event) => Ok(event),
            None => first_or_not_found(counted, OUTBOX_TABLE, event_id.as_str()),
        }
    }
}

#[async_trait]
impl OutboxQueue for SurrealOutbox {
    fn lease(&self) -> Duration {
        self.config.lease
    }

    async fn enqueue(&self, event: OutboxEvent) -> PersistenceResult<OutboxEvent> {
        let event = event.into_pending();
        let id = event.event_id.as_str().to_string();
        let created: Option<OutboxEvent> = self
            .store
            .db()
            .create((OUTBOX_TABLE, id.clone()))
            .content(event)
            .await
            .map_err(|err| match from_surrealdb_error(err) {
                PersistenceError::AlreadyExists { .. } => {
                    PersistenceError::already_exists(OUTBOX_TABLE, id.as_str())
                }
                other => other,
            })?;

        created.ok_or_else(|| PersistenceError::query_failed("failed to enqueue outbox event"))
    }

    async fn claim_next(&self, worker: &WorkerId) -> PersistenceResult<Option<OutboxEvent>> {
        for attempt in 0..self.config.max_claim_attempts {
            let now = Utc::now();
            let Some(candidate) = self.next_candidate(now).await? else {
                return Ok(None);
            };

            match self.try_claim(&candidate.event_id, worker, now).await {
                Ok(Some(claimed)) => return Ok(Some(claimed)),
                Ok(None) => {
                    debug!(event_id = %candidate.event_id, attempt, "Lost claim race");
                }
                Err(err) if err.is_conflict() => {
                    debug!(event_id = %candidate.event_id, attempt, error = %err, "Claim conflicted");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(None)
    }

    async fn mark_done(&self, event_id: &EventId) -> PersistenceResult<OutboxEvent> {
        let now = Utc::now().timestamp_millis();
        let rows: Vec<OutboxEvent> = self
            .store
            .db()
            .query(
                "UPDATE type::thing('outbox_event', $event_id) \
                 SET processed = true, processed_at = $now, lock = NONE, updated_at = $now RETURN AFTER",
            )
            .bind(("event_id", event_id.as_str().to_string()))
            .bind(("now", now))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        first_or_not_found(rows, OUTBOX_TABLE, event_id.as_str())
    }

    async fn mark_failed(
        &self,
        event_id: &EventId,
        error: &str,
    ) -> PersistenceResult<OutboxEvent> {
        self.record_failure(event_id, error, Utc::now()).await
    }

    async fn mark_failed_until(
        &self,
        event_id: &EventId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> PersistenceResult<OutboxEvent> {
        self.record_failure(event_id, error, retry_at).await
    }

    async fn dead_letter(
        &self,
        event_id: &EventId,
        error: &str,
    ) -> PersistenceResult<OutboxEvent> {
        let now = Utc::now().timestamp_millis();
        let rows: Vec<OutboxEvent> = self
            .store
            .db()
            .query(
                "UPDATE type::thing('outbox_event', $event_id) \
                 SET attempts += 1, last_error = $error, processed = true, processed_at = $now, \
                 dead_lettered = true, lock = NONE, updated_at = $now RETURN AFTER",
            )
            .bind(("event_id", event_id.as_str().to_string()))
            .bind(("error", error.to_string()))
            .bind(("now", now))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        first_or_not_found(rows, OUTBOX_TABLE, event_id.as_str())
    }

    async fn get(&self, event_id: &EventId) -> PersistenceResult<Option<OutboxEvent>> {
        let event: Option<OutboxEvent> = self
            .store
            .db()
            .select((OUTBOX_TABLE, event_id.as_str().to_string()))
            .await
            .map_err(from_surrealdb_error)?;

        Ok(event)
    }
}

/// Secret documents.
#[derive(Debug, Clone)]
pub struct SurrealSecrets {
    store: ControlPlaneStore,
}

impl SurrealSecrets {
    #[must_use]
    pub fn new(store: ControlPlaneStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SecretsRepository for SurrealSecrets {
    async fn create(&self, secret: Secret) -> PersistenceResult<Secret> {
        let id = secret.secret_id.as_str().to_string();
        let created: Option<Secret> = self
            .store
            .db()
            .create((SECRET_TABLE, id))
            .content(secret)
            .await
            .map_err(from_surrealdb_error)?;

        created.ok_or_else(|| PersistenceError::query_failed("failed to create secret"))
    }

    async fn get(&self, secret_id: &SecretId) -> PersistenceResult<Option<Secret>> {
        let secret: Option<Secret> = self
            .store
            .db()
            .select((SECRET_TABLE, secret_id.as_str().to_string()))
            .await
            .map_err(from_surrealdb_error)?;

        Ok(secret)
    }
}
