//! Repository traits consumed by the reconciliation engine.
//!
//! Every backend (SurrealDB, in-memory) implements these; the engine only ever
//! sees `Arc<dyn ...>` handles bundled in [`crate::Repositories`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{
    DesiredState, EventId, ObservedEntry, OutboxEvent, ProjectId, Resource, ResourceId,
    ResourceKind, ResourceStatus, Secret, SecretId, StatusPatch, WorkerId,
};

use crate::error::PersistenceResult;

/// Filter for listing resources. Results are ordered most recently updated
/// first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceFilter {
    /// Skip resources in this desired state.
    pub exclude_desired_state: Option<DesiredState>,
    /// Only resources of this kind.
    pub kind: Option<ResourceKind>,
    /// Only resources of this project.
    pub project_id: Option<ProjectId>,
    /// Maximum number of resources returned.
    pub limit: Option<usize>,
}

impl ResourceFilter {
    /// Create an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live resources: everything not marked for deletion.
    #[must_use]
    pub fn live() -> Self {
        Self::new().excluding(DesiredState::Deleted)
    }

    #[must_use]
    pub fn excluding(mut self, state: DesiredState) -> Self {
        self.exclude_desired_state = Some(state);
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: ResourceKind) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn with_project(mut self, project_id: impl Into<ProjectId>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a resource passes every predicate of the filter.
    #[must_use]
    pub fn matches(&self, resource: &Resource) -> bool {
        self.exclude_desired_state
            .is_none_or(|state| resource.desired_state != state)
            && self
                .kind
                .is_none_or(|kind| resource.kind == kind.as_str())
            && self
                .project_id
                .as_ref()
                .is_none_or(|project| &resource.project_id == project)
    }
}

/// Read access to declared resources.
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    /// Load a resource by id.
    async fn get_by_resource_id(&self, id: &ResourceId) -> PersistenceResult<Option<Resource>>;

    /// List resources matching `filter`, most recently updated first.
    async fn list(&self, filter: &ResourceFilter) -> PersistenceResult<Vec<Resource>>;
}

/// Status documents, 1:1 with resources.
#[async_trait]
pub trait StatusRepository: Send + Sync {
    /// Merge `patch` into the status of `resource_id`, creating it if absent.
    /// Always stamps `last_updated_at`.
    async fn upsert(
        &self,
        resource_id: &ResourceId,
        patch: StatusPatch,
    ) -> PersistenceResult<ResourceStatus>;

    /// Load the status of a resource.
    async fn get(&self, resource_id: &ResourceId) -> PersistenceResult<Option<ResourceStatus>>;
}

/// Lease settings shared by outbox backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxConfig {
    /// How long a claim stays exclusive. Must exceed the worst-case driver
    /// call latency.
    pub lease: Duration,
    /// How many times `claim_next` retries after losing a race.
    pub max_claim_attempts: u32,
}

impl OutboxConfig {
    #[must_use]
    pub const fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(60),
            max_claim_attempts: 3,
        }
    }
}

/// Durable at-least-once queue of reconciliation triggers.
#[async_trait]
pub trait OutboxQueue: Send + Sync {
    /// How long a claim holds an event before another worker may take it.
    fn lease(&self) -> Duration;

    /// Insert `event` as pending: unprocessed, zero attempts, no lock. Does not
    /// deduplicate.
    async fn enqueue(&self, event: OutboxEvent) -> PersistenceResult<OutboxEvent>;

    /// Atomically lease the oldest claimable event to `worker`.
    ///
    /// Returns `None` when nothing is claimable or another worker won every
    /// race for the candidates seen.
    async fn claim_next(&self, worker: &WorkerId) -> PersistenceResult<Option<OutboxEvent>>;

    /// Mark an event processed and release its lock.
    async fn mark_done(&self, event_id: &EventId) -> PersistenceResult<OutboxEvent>;

    /// Record a failure and expire the lease now so the event is claimable on
    /// the next poll.
    async fn mark_failed(&self, event_id: &EventId, error: &str)
    -> PersistenceResult<OutboxEvent>;

    /// Record a failure and keep the event unclaimable until `retry_at`.
    async fn mark_failed_until(
        &self,
        event_id: &EventId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> PersistenceResult<OutboxEvent>;

    /// Record a final failure and retire the event.
    async fn dead_letter(&self, event_id: &EventId, error: &str)
    -> PersistenceResult<OutboxEvent>;

    /// Load an event by id.
    async fn get(&self, event_id: &EventId) -> PersistenceResult<Option<OutboxEvent>>;
}

/// Credentials storage.
#[async_trait]
pub trait SecretsRepository: Send + Sync {
    /// Store a new secret.
    async fn create(&self, secret: Secret) -> PersistenceResult<Secret>;

    /// Load a secret by id.
    async fn get(&self, secret_id: &SecretId) -> PersistenceResult<Option<Secret>>;
}

/// Short-lived cache of driver-reported actual state. The TTL is applied by
/// the cache, never by callers.
#[async_trait]
pub trait ObservedCache: Send + Sync {
    async fn get(&self, resource_id: &ResourceId) -> PersistenceResult<Option<ObservedEntry>>;

    async fn set(&self, resource_id: &ResourceId, entry: ObservedEntry) -> PersistenceResult<()>;

    async fn invalidate(&self, resource_id: &ResourceId) -> PersistenceResult<()>;
}
