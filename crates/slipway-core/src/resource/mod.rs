//! Resource model.
//!
//! A resource is a declarative object managed by the control plane, the
//! thing reconcilers compare against reality. Its `spec` and `metadata` are
//! opaque structured payloads whose concrete variant is identified by
//! `(api_version, kind)` (see [`crate::dispatch`]). Event history is
//! append-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A declarative resource managed by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Store-assigned, lexicographically sortable unique id. `None` until
    /// the resource is first stored; stable across updates to the same `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Caller-supplied unique id.
    pub id: String,
    /// Payload schema version, half of the type discriminator.
    pub api_version: String,
    /// Payload kind, the other half of the type discriminator.
    pub kind: String,
    /// The application this resource belongs to.
    pub application: String,
    /// Opaque structured metadata.
    pub metadata: Value,
    /// Opaque desired-state payload.
    pub spec: Value,
}

impl Resource {
    /// Creates an unstored resource with empty metadata.
    pub fn new(
        id: impl Into<String>,
        api_version: impl Into<String>,
        kind: impl Into<String>,
        application: impl Into<String>,
        spec: Value,
    ) -> Self {
        Self {
            uid: None,
            id: id.into(),
            api_version: api_version.into(),
            kind: kind.into(),
            application: application.into(),
            metadata: Value::Object(serde_json::Map::new()),
            spec,
        }
    }
}

/// Lightweight resource header streamed by
/// [`all_resources`](crate::store::SqliteResourceRepository::all_resources).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHeader {
    /// Caller-supplied resource id.
    pub id: String,
    /// Payload schema version.
    pub api_version: String,
    /// Payload kind.
    pub kind: String,
}

/// One entry in a resource's append-only event history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEvent {
    /// The store-assigned uid of the resource the event belongs to.
    pub resource_uid: String,
    /// When the event happened. Taken from the event, not from the store.
    pub timestamp: DateTime<Utc>,
    /// The event kind (`resource-created`, `resource-delta-detected`, ...).
    pub kind: String,
    /// Opaque structured payload.
    pub payload: Value,
    /// When set, the event is dropped if the most recent event for the same
    /// resource has the same kind.
    #[serde(default)]
    pub suppress_repeats: bool,
}

impl ResourceEvent {
    /// Creates an event with an empty payload.
    pub fn new(
        resource_uid: impl Into<String>,
        timestamp: DateTime<Utc>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            resource_uid: resource_uid.into(),
            timestamp,
            kind: kind.into(),
            payload: Value::Object(serde_json::Map::new()),
            suppress_repeats: false,
        }
    }

    /// Marks the event as suppressing same-kind repeats.
    #[must_use]
    pub const fn suppressing_repeats(mut self) -> Self {
        self.suppress_repeats = true;
        self
    }
}

/// Per-resource projection returned by
/// [`get_summaries_by_application`](crate::store::SqliteResourceRepository::get_summaries_by_application).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSummary {
    /// Caller-supplied resource id.
    pub id: String,
    /// Payload schema version.
    pub api_version: String,
    /// Payload kind.
    pub kind: String,
    /// The owning application.
    pub application: String,
    /// The kind of the most recent history event, or `"created"` when the
    /// resource has no history yet.
    pub status: String,
}
