//! Kind dispatch.
//!
//! One field per [`ResourceKind`] and an exhaustive match: adding a kind
//! without registering a driver is a compile error.

use std::sync::Arc;

use keel_core::ResourceKind;

use crate::context::ReconcileContext;
use crate::driver::{Driver, DriverOutcome};
use crate::error::Result;

/// Exactly one driver per resource kind.
#[derive(Clone)]
pub struct DriverRegistry {
    pub compute: Arc<dyn Driver>,
    pub volume: Arc<dyn Driver>,
    pub bucket: Arc<dyn Driver>,
    pub http_route: Arc<dyn Driver>,
    pub database: Arc<dyn Driver>,
    pub broker: Arc<dyn Driver>,
    pub observability: Arc<dyn Driver>,
}

impl DriverRegistry {
    /// The driver registered for `kind`.
    #[must_use]
    pub fn driver_for(&self, kind: ResourceKind) -> &Arc<dyn Driver> {
        match kind {
            ResourceKind::Compute => &self.compute,
            ResourceKind::Volume => &self.volume,
            ResourceKind::Bucket => &self.bucket,
            ResourceKind::HttpRoute => &self.http_route,
            ResourceKind::Database => &self.database,
            ResourceKind::Broker => &self.broker,
            ResourceKind::Observability => &self.observability,
        }
    }

    /// Resolve the resource's kind and run its driver.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::UnknownKind`] when the kind tag does not
    /// resolve, otherwise whatever the driver returns.
    pub async fn dispatch(&self, ctx: &ReconcileContext) -> Result<DriverOutcome> {
        let kind = ctx.kind()?;
        self.driver_for(kind).reconcile(ctx).await
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry").finish_non_exhaustive()
    }
}
