//! Last-known reconciliation status of a resource.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::ResourceId;

/// User-visible reconciliation state.
///
/// `Ready` and `Error` are terminal for one attempt but re-enterable on the
/// next trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    #[default]
    Creating,
    Ready,
    Error,
    Deleting,
}

impl StatusState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Deleting => "deleting",
        }
    }
}

impl std::fmt::Display for StatusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StatusState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "creating" => Ok(Self::Creating),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            "deleting" => Ok(Self::Deleting),
            other => Err(Error::unknown_status_state(other)),
        }
    }
}

/// Status document, 1:1 with a resource. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub resource_id: ResourceId,
    /// Generation that was last reconciled successfully.
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default)]
    pub state: StatusState,
    #[serde(default)]
    pub message: String,
    /// Driver-specific details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated_at: DateTime<Utc>,
}

impl ResourceStatus {
    /// Fresh status for a resource that has never been reconciled.
    #[must_use]
    pub fn initial(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            observed_generation: 0,
            state: StatusState::Creating,
            message: String::new(),
            details: None,
            last_updated_at: Utc::now(),
        }
    }

    /// Apply a patch in place, stamping `last_updated_at`.
    pub fn apply(&mut self, patch: StatusPatch) {
        if let Some(generation) = patch.observed_generation {
            self.observed_generation = generation;
        }
        if let Some(state) = patch.state {
            self.state = state;
        }
        if let Some(message) = patch.message {
            self.message = message;
        }
        if let Some(details) = patch.details {
            self.details = Some(details).filter(|d| !d.is_null());
        }
        self.last_updated_at = Utc::now();
    }
}

/// Partial status update.
///
/// Carries no resource id; the id is the key the patch is applied under.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StatusState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StatusPatch {
    /// Patch that only moves the state.
    #[must_use]
    pub fn state(state: StatusState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub const fn with_observed_generation(mut self, generation: u64) -> Self {
        self.observed_generation = Some(generation);
        self
    }
}
