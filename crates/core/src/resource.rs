//! Declared resources and their kinds.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::{ProjectId, ResourceId};

/// Closed set of resource kinds the engine knows how to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Compute container.
    Compute,
    /// Persistent volume.
    Volume,
    /// Object-storage bucket.
    Bucket,
    /// Reverse-proxy route to another resource.
    HttpRoute,
    /// Managed database.
    Database,
    /// Message broker.
    Broker,
    /// Observability sink.
    Observability,
}

impl ResourceKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Compute,
        Self::Volume,
        Self::Bucket,
        Self::HttpRoute,
        Self::Database,
        Self::Broker,
        Self::Observability,
    ];

    /// Wire tag of this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Compute => "compute",
            Self::Volume => "volume",
            Self::Bucket => "bucket",
            Self::HttpRoute => "http_route",
            Self::Database => "database",
            Self::Broker => "broker",
            Self::Observability => "observability",
        }
    }

    /// Whether the kind has a binary running/stopped notion.
    #[must_use]
    pub const fn has_running_flag(&self) -> bool {
        matches!(self, Self::Compute | Self::Database)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::unknown_kind(s))
    }
}

/// User-declared target state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    #[default]
    Running,
    Paused,
    Deleted,
}

impl DesiredState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DesiredState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "deleted" => Ok(Self::Deleted),
            other => Err(Error::unknown_desired_state(other)),
        }
    }
}

/// A declared unit of infrastructure.
///
/// Written by the API layer; the reconciliation engine only reads it. The
/// `kind` field keeps the raw tag as stored so that a tag no driver knows
/// about still loads and fails at dispatch time through the normal error
/// path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub resource_id: ResourceId,
    /// Raw kind tag; resolve with [`Resource::resource_kind`].
    pub kind: String,
    pub project_id: ProjectId,
    pub name: String,
    /// Kind-specific specification document.
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub desired_state: DesiredState,
    /// Incremented by the API on every spec or desired-state mutation.
    #[serde(default)]
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_resource_id: Option<ResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_resource_id: Option<ResourceId>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// Create a resource at generation 1 with an empty spec.
    #[must_use]
    pub fn new(
        resource_id: impl Into<ResourceId>,
        kind: ResourceKind,
        project_id: impl Into<ProjectId>,
        name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            resource_id: resource_id.into(),
            kind: kind.as_str().to_string(),
            project_id: project_id.into(),
            name: name.into(),
            spec: serde_json::Value::Object(serde_json::Map::new()),
            desired_state: DesiredState::Running,
            generation: 1,
            parent_resource_id: None,
            root_resource_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the spec document.
    #[must_use]
    pub fn with_spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = spec;
        self
    }

    /// Set the desired state.
    #[must_use]
    pub fn with_desired_state(mut self, desired_state: DesiredState) -> Self {
        self.desired_state = desired_state;
        self
    }

    /// Set the generation.
    #[must_use]
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Attach the resource to a parent, inheriting the parent's root.
    #[must_use]
    pub fn with_parent(mut self, parent: &Resource) -> Self {
        self.parent_resource_id = Some(parent.resource_id.clone());
        self.root_resource_id = Some(
            parent
                .root_resource_id
                .clone()
                .unwrap_or_else(|| parent.resource_id.clone()),
        );
        self
    }

    /// Overwrite the raw kind tag.
    #[must_use]
    pub fn with_raw_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Resolve the kind tag against the closed set of kinds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownKind`] when the tag matches no kind.
    pub fn resource_kind(&self) -> Result<ResourceKind> {
        self.kind.parse()
    }

    /// Whether the user asked for the resource to be torn down.
    #[must_use]
    pub const fn is_deletion_requested(&self) -> bool {
        matches!(self.desired_state, DesiredState::Deleted)
    }

    /// Read a string field from the spec.
    #[must_use]
    pub fn spec_str(&self, key: &str) -> Option<&str> {
        self.spec.get(key).and_then(serde_json::Value::as_str)
    }
}
