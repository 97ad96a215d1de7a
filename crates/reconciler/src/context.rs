//! Per-attempt reconcile context handed to drivers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_core::{
    ObservedEntry, RequestId, Resource, ResourceKind, StatusPatch, StatusState,
};
use keel_store::{ObservedCache, Repositories, SecretsRepository, StatusRepository};
use serde_json::{Value, json};
use tracing::warn;

use crate::driver::DriverOutcome;
use crate::error::Result;

/// Everything a driver may touch during one reconcile attempt.
///
/// The `report_*` helpers are the only way drivers should finish an attempt:
/// each writes the status document and the observed cache together and
/// returns the matching [`DriverOutcome`].
#[derive(Clone)]
pub struct ReconcileContext {
    resource: Resource,
    request_id: RequestId,
    started_at: DateTime<Utc>,
    statuses: Arc<dyn StatusRepository>,
    observed: Arc<dyn ObservedCache>,
    secrets: Arc<dyn SecretsRepository>,
}

impl ReconcileContext {
    #[must_use]
    pub fn new(resource: Resource, request_id: RequestId, repos: &Repositories) -> Self {
        Self {
            resource,
            request_id,
            started_at: Utc::now(),
            statuses: Arc::clone(&repos.statuses),
            observed: Arc::clone(&repos.observed),
            secrets: Arc::clone(&repos.secrets),
        }
    }

    #[must_use]
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn statuses(&self) -> &Arc<dyn StatusRepository> {
        &self.statuses
    }

    #[must_use]
    pub fn observed(&self) -> &Arc<dyn ObservedCache> {
        &self.observed
    }

    #[must_use]
    pub fn secrets(&self) -> &Arc<dyn SecretsRepository> {
        &self.secrets
    }

    /// Resolve the resource's kind tag.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::UnknownKind`] for an unrecognised tag.
    pub fn kind(&self) -> Result<ResourceKind> {
        Ok(self.resource.resource_kind()?)
    }

    /// Converged: status `ready` at the current generation, cache holds
    /// `actual`.
    ///
    /// # Errors
    ///
    /// Returns an error if the status write fails.
    pub async fn report_ready(&self, actual: Value) -> Result<DriverOutcome> {
        self.report_ready_with_details(actual, None).await
    }

    /// Like [`Self::report_ready`] with driver-specific status details.
    /// `None` clears details left by an earlier attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the status write fails.
    pub async fn report_ready_with_details(
        &self,
        actual: Value,
        details: Option<Value>,
    ) -> Result<DriverOutcome> {
        let kind = self.kind()?;
        let patch = StatusPatch::state(StatusState::Ready)
            .with_observed_generation(self.resource.generation)
            .with_message(format!("Reconciled generation {}", self.resource.generation))
            .with_details(details.unwrap_or(Value::Null));

        self.statuses
            .upsert(&self.resource.resource_id, patch)
            .await?;
        self.remember(ObservedEntry::new(kind, actual.clone())).await;

        Ok(DriverOutcome::Converged { actual })
    }

    /// Teardown finished: status `ready` with `{deleted: true}` details.
    ///
    /// # Errors
    ///
    /// Returns an error if the status write fails.
    pub async fn report_deleted(&self) -> Result<DriverOutcome> {
        let kind = self.kind()?;
        let patch = StatusPatch::state(StatusState::Ready)
            .with_observed_generation(self.resource.generation)
            .with_message("Deleted")
            .with_details(json!({ "deleted": true }));

        self.statuses
            .upsert(&self.resource.resource_id, patch)
            .await?;
        self.remember(ObservedEntry::deleted(kind)).await;

        Ok(DriverOutcome::Deleted)
    }

    /// Dependency data is missing: status stays `creating` and the sweeper
    /// picks the resource up again. The cache is cleared so the next sweep
    /// treats the resource as unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the status write fails.
    pub async fn report_pending(&self, reason: impl Into<String>) -> Result<DriverOutcome> {
        let reason = reason.into();
        let patch = StatusPatch::state(StatusState::Creating).with_message(reason.clone());

        self.statuses
            .upsert(&self.resource.resource_id, patch)
            .await?;
        if let Err(err) = self.observed.invalidate(&self.resource.resource_id).await {
            warn!(resource_id = %self.resource.resource_id, error = %err, "Failed to clear observed state");
        }

        Ok(DriverOutcome::Pending { reason })
    }

    async fn remember(&self, entry: ObservedEntry) {
        if let Err(err) = self.observed.set(&self.resource.resource_id, entry).await {
            warn!(resource_id = %self.resource.resource_id, error = %err, "Failed to cache observed state");
        }
    }
}

impl std::fmt::Debug for ReconcileContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileContext")
            .field("resource_id", &self.resource.resource_id)
            .field("request_id", &self.request_id)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use keel_core::{DesiredState, ResourceId};
    use keel_store::InMemoryBackend;

    use super::*;

    fn context(resource: Resource, backend: &InMemoryBackend) -> ReconcileContext {
        ReconcileContext::new(resource, RequestId::from("req-1"), &backend.repositories())
    }

    #[tokio::test]
    async fn test_report_ready_writes_status_and_cache() {
        let backend = InMemoryBackend::default();
        let resource = Resource::new("r-1", ResourceKind::Volume, "p-1", "data").with_generation(4);
        let ctx = context(resource, &backend);

        let outcome = ctx.report_ready(json!({ "size_gb": 10 })).await;
        assert!(matches!(outcome, Ok(DriverOutcome::Converged { .. })));

        let id = ResourceId::from("r-1");
        let status = backend.repositories().statuses.get(&id).await.ok().flatten();
        assert_eq!(status.as_ref().map(|s| s.state), Some(StatusState::Ready));
        assert_eq!(status.map(|s| s.observed_generation), Some(4));

        let cached = backend.repositories().observed.get(&id).await.ok().flatten();
        assert_eq!(
            cached.and_then(|entry| entry.field("size_gb").cloned()),
            Some(json!(10))
        );
    }

    #[tokio::test]
    async fn test_report_deleted_marks_details() {
        let backend = InMemoryBackend::default();
        let resource = Resource::new("r-2", ResourceKind::Bucket, "p-1", "assets")
            .with_desired_state(DesiredState::Deleted);
        let ctx = context(resource, &backend);

        let outcome = ctx.report_deleted().await;
        assert!(matches!(outcome, Ok(DriverOutcome::Deleted)));

        let id = ResourceId::from("r-2");
        let status = backend.repositories().statuses.get(&id).await.ok().flatten();
        assert_eq!(
            status.and_then(|s| s.details),
            Some(json!({ "deleted": true }))
        );
        let cached = backend.repositories().observed.get(&id).await.ok().flatten();
        assert!(cached.is_some_and(|entry| entry.is_deleted()));
    }

    #[tokio::test]
    async fn test_recreate_after_delete_clears_deleted_details() {
        let backend = InMemoryBackend::default();
        let deleted = Resource::new("r-4", ResourceKind::Bucket, "p-1", "assets")
            .with_desired_state(DesiredState::Deleted);
        let outcome = context(deleted.clone(), &backend).report_deleted().await;
        assert!(matches!(outcome, Ok(DriverOutcome::Deleted)));

        let recreated = deleted
            .with_desired_state(DesiredState::Running)
            .with_generation(2);
        let outcome = context(recreated, &backend).report_ready(json!({})).await;
        assert!(matches!(outcome, Ok(DriverOutcome::Converged { .. })));

        let id = ResourceId::from("r-4");
        let status = backend.repositories().statuses.get(&id).await.ok().flatten();
        assert_eq!(status.as_ref().map(|s| s.state), Some(StatusState::Ready));
        assert_eq!(status.as_ref().map(|s| s.observed_generation), Some(2));
        assert_eq!(status.and_then(|s| s.details), None);
    }

    #[tokio::test]
    async fn test_report_pending_keeps_creating() {
        let backend = InMemoryBackend::default();
        let resource = Resource::new("r-3", ResourceKind::HttpRoute, "p-1", "site");
        let ctx = context(resource, &backend);

        let outcome = ctx.report_pending("Waiting for target").await;
        assert!(matches!(outcome, Ok(DriverOutcome::Pending { .. })));

        let status = backend
            .repositories()
            .statuses
            .get(&ResourceId::from("r-3"))
            .await
            .ok()
            .flatten();
        assert_eq!(status.as_ref().map(|s| s.state), Some(StatusState::Creating));
        assert_eq!(status.map(|s| s.message), Some("Waiting for target".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_kind_cannot_report_ready() {
        let backend = InMemoryBackend::default();
        let resource =
            Resource::new("r-4", ResourceKind::Compute, "p-1", "api").with_raw_kind("lambda");
        let ctx = context(resource, &backend);

        let outcome = ctx.report_ready(json!({})).await;
        assert!(matches!(outcome, Err(crate::Error::UnknownKind { .. })));
    }
}
