//! Credentials provisioned by drivers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ResourceId, SecretId};

/// Stored credential. Encryption at rest belongs to the secrets layer.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub secret_id: SecretId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<ResourceId>,
    pub name: String,
    pub value: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Secret {
    /// Create a secret with a generated id.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            secret_id: SecretId::generate(),
            resource_id: None,
            name: name.into(),
            value: value.into(),
            created_at: Utc::now(),
        }
    }

    /// Bind the secret to the resource it was provisioned for.
    #[must_use]
    pub fn for_resource(mut self, resource_id: ResourceId) -> Self {
        self.resource_id = Some(resource_id);
        self
    }
}

// Keeps secret values out of logs.
impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("secret_id", &self.secret_id)
            .field("resource_id", &self.resource_id)
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}
