//! Reconcile wrapper: one attempt at converging one resource.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{RequestId, Resource, StatusPatch, StatusState};
use keel_store::Repositories;
use tracing::{debug, info, warn};

use crate::context::ReconcileContext;
use crate::dispatch::DriverRegistry;
use crate::driver::DriverOutcome;
use crate::error::{Error, Result};

/// Hook run before any status change. Failing it fails the attempt.
#[async_trait]
pub trait Finalizer: Send + Sync {
    async fn before_reconcile(&self, resource: &Resource) -> Result<()>;
}

/// Finalizer that accepts every resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFinalizer;

#[async_trait]
impl Finalizer for NoopFinalizer {
    async fn before_reconcile(&self, _resource: &Resource) -> Result<()> {
        Ok(())
    }
}

/// Runs reconcile attempts through the driver registry.
#[derive(Clone)]
pub struct Reconciler {
    registry: Arc<DriverRegistry>,
    repos: Repositories,
    finalizer: Arc<dyn Finalizer>,
    driver_timeout: Option<Duration>,
}

impl Reconciler {
    #[must_use]
    pub fn new(registry: Arc<DriverRegistry>, repos: Repositories) -> Self {
        Self {
            registry,
            repos,
            finalizer: Arc::new(NoopFinalizer),
            driver_timeout: None,
        }
    }

    #[must_use]
    pub fn with_finalizer(mut self, finalizer: Arc<dyn Finalizer>) -> Self {
        self.finalizer = finalizer;
        self
    }

    /// Bound every driver call; `None` lets drivers run unbounded.
    #[must_use]
    pub fn with_driver_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.driver_timeout = timeout;
        self
    }

    #[must_use]
    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    /// Reconcile `resource` once.
    ///
    /// On failure the status is set to `error` with the failure message and
    /// the original error is returned. A failing status write is only logged.
    ///
    /// # Errors
    ///
    /// Returns the finalizer, status or driver error that ended the attempt.
    pub async fn reconcile(
        &self,
        resource: Resource,
        request_id: RequestId,
    ) -> Result<DriverOutcome> {
        let resource_id = resource.resource_id.clone();
        let ctx = ReconcileContext::new(resource, request_id, &self.repos);

        match self.attempt(&ctx).await {
            Ok(outcome) => {
                info!(
                    resource_id = %resource_id,
                    request_id = %ctx.request_id(),
                    outcome = outcome.label(),
                    elapsed_ms = chrono::Utc::now().signed_duration_since(ctx.started_at()).num_milliseconds(),
                    "Reconcile finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                warn!(
                    resource_id = %resource_id,
                    request_id = %ctx.request_id(),
                    error = %err,
                    "Reconcile failed"
                );
                let patch = StatusPatch::state(StatusState::Error).with_message(err.to_string());
                if let Err(status_err) = self.repos.statuses.upsert(&resource_id, patch).await {
                    warn!(
                        resource_id = %resource_id,
                        error = %status_err,
                        "Failed to record error status"
                    );
                }
                Err(err)
            }
        }
    }

    async fn attempt(&self, ctx: &ReconcileContext) -> Result<DriverOutcome> {
        let resource = ctx.resource();
        self.finalizer.before_reconcile(resource).await?;

        let (state, message) = if resource.is_deletion_requested() {
            (
                StatusState::Deleting,
                format!("Deleting generation {}", resource.generation),
            )
        } else {
            (
                StatusState::Creating,
                format!("Reconciling generation {}", resource.generation),
            )
        };
        self.repos
            .statuses
            .upsert(
                &resource.resource_id,
                StatusPatch::state(state).with_message(message),
            )
            .await?;

        debug!(
            resource_id = %resource.resource_id,
            kind = %resource.kind,
            generation = resource.generation,
            "Dispatching to driver"
        );

        match self.driver_timeout {
            Some(limit) => tokio::time::timeout(limit, self.registry.dispatch(ctx))
                .await
                .map_err(|_| Error::driver_timeout(resource.kind.as_str(), limit))?,
            None => self.registry.dispatch(ctx).await,
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("driver_timeout", &self.driver_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use keel_core::{DesiredState, ResourceId, ResourceKind, ResourceStatus};
    use keel_store::InMemoryBackend;
    use serde_json::json;

    use super::*;
    use crate::driver::Driver;

    /// Test driver whose behavior is fixed at construction.
    enum Script {
        Ready,
        Fail(&'static str),
        Hang,
        /// Records the status seen at dispatch time, then converges.
        Inspect(Arc<tokio::sync::Mutex<Option<ResourceStatus>>>),
    }

    #[async_trait]
    impl Driver for Script {
        async fn reconcile(&self, ctx: &ReconcileContext) -> Result<DriverOutcome> {
            match self {
                Self::Ready => ctx.report_ready(json!({ "ok": true })).await,
                Self::Fail(reason) => Err(Error::driver_failed(ctx.resource().kind.as_str(), *reason)),
                Self::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    ctx.report_ready(json!({})).await
                }
                Self::Inspect(seen) => {
                    let status = ctx.statuses().get(&ctx.resource().resource_id).await?;
                    *seen.lock().await = status;
                    ctx.report_ready(json!({})).await
                }
            }
        }
    }

    fn registry_of(driver: Script) -> Arc<DriverRegistry> {
        let driver: Arc<dyn Driver> = Arc::new(driver);
        Arc::new(DriverRegistry {
            compute: Arc::clone(&driver),
            volume: Arc::clone(&driver),
            bucket: Arc::clone(&driver),
            http_route: Arc::clone(&driver),
            database: Arc::clone(&driver),
            broker: Arc::clone(&driver),
            observability: driver,
        })
    }

    async fn status_of(backend: &InMemoryBackend, id: &str) -> Option<ResourceStatus> {
        backend
            .repositories()
            .statuses
            .get(&ResourceId::from(id))
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_success_keeps_driver_status() {
        let backend = InMemoryBackend::default();
        let reconciler = Reconciler::new(registry_of(Script::Ready), backend.repositories());
        let resource = Resource::new("r-1", ResourceKind::Compute, "p-1", "api").with_generation(2);

        let outcome = reconciler.reconcile(resource, RequestId::from("req")).await;
        assert!(matches!(outcome, Ok(DriverOutcome::Converged { .. })));

        let status = status_of(&backend, "r-1").await;
        assert_eq!(status.as_ref().map(|s| s.state), Some(StatusState::Ready));
        assert_eq!(status.map(|s| s.observed_generation), Some(2));
    }

    #[tokio::test]
    async fn test_creating_status_before_dispatch() {
        let backend = InMemoryBackend::default();
        let seen = Arc::new(tokio::sync::Mutex::new(None));
        let reconciler = Reconciler::new(
            registry_of(Script::Inspect(Arc::clone(&seen))),
            backend.repositories(),
        );
        let resource = Resource::new("r-1", ResourceKind::Volume, "p-1", "data").with_generation(7);

        let outcome = reconciler.reconcile(resource, RequestId::from("req")).await;
        assert!(outcome.is_ok());

        let seen = seen.lock().await.clone();
        assert_eq!(seen.as_ref().map(|s| s.state), Some(StatusState::Creating));
        assert_eq!(seen.as_ref().map(|s| s.observed_generation), Some(0));
        assert!(seen.is_some_and(|s| s.message.contains('7')));
    }

    #[tokio::test]
    async fn test_deleting_status_before_dispatch() {
        let backend = InMemoryBackend::default();
        let seen = Arc::new(tokio::sync::Mutex::new(None));
        let reconciler = Reconciler::new(
            registry_of(Script::Inspect(Arc::clone(&seen))),
            backend.repositories(),
        );
        let resource = Resource::new("r-1", ResourceKind::Bucket, "p-1", "assets")
            .with_desired_state(DesiredState::Deleted);

        assert!(reconciler.reconcile(resource, RequestId::from("req")).await.is_ok());
        assert_eq!(
            seen.lock().await.as_ref().map(|s| s.state),
            Some(StatusState::Deleting)
        );
    }

    #[tokio::test]
    async fn test_driver_failure_sets_error_status() {
        let backend = InMemoryBackend::default();
        let reconciler =
            Reconciler::new(registry_of(Script::Fail("disk full")), backend.repositories());
        let resource = Resource::new("r-1", ResourceKind::Volume, "p-1", "data");

        let outcome = reconciler.reconcile(resource, RequestId::from("req")).await;
        assert!(matches!(outcome, Err(Error::DriverFailed { .. })));

        let status = status_of(&backend, "r-1").await;
        assert_eq!(status.as_ref().map(|s| s.state), Some(StatusState::Error));
        assert!(status.is_some_and(|s| s.message.contains("disk full")));
    }

    #[tokio::test]
    async fn test_unknown_kind_sets_error_status() {
        let backend = InMemoryBackend::default();
        let reconciler = Reconciler::new(registry_of(Script::Ready), backend.repositories());
        let resource =
            Resource::new("r-1", ResourceKind::Compute, "p-1", "api").with_raw_kind("quantum");

        let outcome = reconciler.reconcile(resource, RequestId::from("req")).await;
        assert!(matches!(outcome, Err(Error::UnknownKind { .. })));

        let status = status_of(&backend, "r-1").await;
        assert_eq!(status.as_ref().map(|s| s.state), Some(StatusState::Error));
        assert_eq!(status.map(|s| s.message), Some("Unknown kind: quantum".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_timeout_is_a_failure() {
        let backend = InMemoryBackend::default();
        let reconciler = Reconciler::new(registry_of(Script::Hang), backend.repositories())
            .with_driver_timeout(Some(Duration::from_secs(5)));
        let resource = Resource::new("r-1", ResourceKind::Broker, "p-1", "queue");

        let outcome = reconciler.reconcile(resource, RequestId::from("req")).await;
        assert!(matches!(outcome, Err(Error::DriverTimeout { timeout_ms: 5000, .. })));

        let status = status_of(&backend, "r-1").await;
        assert_eq!(status.map(|s| s.state), Some(StatusState::Error));
    }

    struct Refuse(AtomicUsize);

    #[async_trait]
    impl Finalizer for Refuse {
        async fn before_reconcile(&self, _resource: &Resource) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(Error::finalizer_failed("children still attached"))
        }
    }

    #[tokio::test]
    async fn test_failing_finalizer_fails_attempt() {
        let backend = InMemoryBackend::default();
        let finalizer = Arc::new(Refuse(AtomicUsize::new(0)));
        let reconciler = Reconciler::new(registry_of(Script::Ready), backend.repositories())
            .with_finalizer(finalizer.clone());
        let resource = Resource::new("r-1", ResourceKind::Compute, "p-1", "api");

        let outcome = reconciler.reconcile(resource, RequestId::from("req")).await;
        assert!(matches!(outcome, Err(Error::FinalizerFailed { .. })));
        assert_eq!(finalizer.0.load(Ordering::SeqCst), 1);

        let status = status_of(&backend, "r-1").await;
        assert_eq!(status.map(|s| s.state), Some(StatusState::Error));
    }
}
