//! Observed-state snapshots reported by drivers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::ResourceKind;

/// Last actual state a driver reported for a resource.
///
/// Not authoritative. An absent entry means "unknown", never "deleted".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedEntry {
    pub kind: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub observed_at: DateTime<Utc>,
    /// Driver-defined snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<serde_json::Value>,
}

impl ObservedEntry {
    /// Snapshot observed now.
    #[must_use]
    pub fn new(kind: ResourceKind, actual: serde_json::Value) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            observed_at: Utc::now(),
            actual: Some(actual),
        }
    }

    /// Snapshot recording a completed teardown.
    #[must_use]
    pub fn deleted(kind: ResourceKind) -> Self {
        Self::new(kind, serde_json::json!({ "deleted": true }))
    }

    /// Field of the snapshot, if both exist.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.actual.as_ref().and_then(|actual| actual.get(key))
    }

    /// Boolean field of the snapshot; non-boolean values read as absent.
    #[must_use]
    pub fn flag(&self, key: &str) -> Option<bool> {
        self.field(key).and_then(serde_json::Value::as_bool)
    }

    /// Whether the snapshot says the infrastructure is gone.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.flag("deleted").unwrap_or(false)
    }
}
