//! Core domain types for the keel reconciliation engine.
//!
//! - [`Resource`]: a declared unit of infrastructure with a desired state
//! - [`ResourceStatus`]: the last-known reconciliation status of a resource
//! - [`OutboxEvent`]: a durable, lease-claimed reconciliation trigger
//! - [`ObservedEntry`]: the last actual state a driver reported
//! - [`Secret`]: credentials provisioned by drivers

pub mod error;
pub mod ids;
pub mod observed;
pub mod outbox;
pub mod resource;
pub mod secret;
pub mod status;

pub use error::{Error, Result};
pub use ids::{EventId, ProjectId, RequestId, ResourceId, SecretId, WorkerId};
pub use observed::ObservedEntry;
pub use outbox::{EventLock, OutboxEvent, RESOURCE_CHANGED, deadline_after};
pub use resource::{DesiredState, Resource, ResourceKind};
pub use secret::Secret;
pub use status::{ResourceStatus, StatusPatch, StatusState};
