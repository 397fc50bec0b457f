#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ctxmesh-types** – Shared primitive data structures for CtxMesh.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines context identifiers, the authoritative metadata record, the
//! in-process event type, the event-stream envelope, and the wire bodies of
//! the context API. It intentionally makes no assumptions about I/O or
//! storage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

//─────────────────────────────
//  Limits
//─────────────────────────────

/// Maximum allowed length of a context identifier.
pub const MAX_CONTEXT_ID_LEN: usize = 256;

/// Metadata fields owned by the store; stripped from caller-supplied extras.
pub const RESERVED_METADATA_FIELDS: &[&str] = &["version", "lastModified", "size"];

/// Request header marking a propagation push from another node.
///
/// A write carrying this header brings pre-assigned authoritative metadata
/// and is applied verbatim instead of being versioned locally.
pub const ORIGIN_HEADER: &str = "x-ctxmesh-origin";

//─────────────────────────────
//  Context identifier
//─────────────────────────────

/// Opaque identifier of a context.
///
/// Identifiers are non-empty UTF-8 strings. Because an identifier becomes a
/// file name on disk, path separators and NUL bytes are rejected at
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    /// Create a validated context identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, StoreError> {
        let id = id.into();
        if id.is_empty() {
            return Err(StoreError::Invalid("context id must not be empty".into()));
        }
        if id.len() > MAX_CONTEXT_ID_LEN {
            return Err(StoreError::Invalid(format!(
                "context id too long: {} > {}",
                id.len(),
                MAX_CONTEXT_ID_LEN
            )));
        }
        if id.contains(['/', '\\', '\0']) {
            return Err(StoreError::Invalid(format!(
                "context id contains forbidden characters: {id:?}"
            )));
        }
        if id == "." || id == ".." {
            return Err(StoreError::Invalid(format!("context id is reserved: {id:?}")));
        }
        Ok(Self(id))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContextId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

//─────────────────────────────
//  Context metadata
//─────────────────────────────

/// Authoritative per-context metadata maintained by the store.
///
/// `version` starts at 1 on first save and is incremented by exactly 1 on
/// every subsequent save. `extra` carries caller-supplied free-form fields
/// (conversation ids, agent ids, ...) which are flattened into the same JSON
/// object on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMetadata {
    /// Monotonically increasing version, starting at 1.
    pub version: u64,
    /// Wall-clock timestamp of the last successful save.
    pub last_modified: DateTime<Utc>,
    /// Byte length of the serialized payload at save time.
    pub size: u64,
    /// Caller-supplied free-form fields, merged in on save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContextMetadata {
    /// Strip store-owned fields out of caller-supplied extras.
    ///
    /// The store is the sole source of `version`, `lastModified` and `size`;
    /// callers attempting to supply them are silently overridden.
    pub fn sanitize_extra(mut extra: Map<String, Value>) -> Map<String, Value> {
        for field in RESERVED_METADATA_FIELDS {
            extra.remove(*field);
        }
        extra
    }
}

//─────────────────────────────
//  In-process events
//─────────────────────────────

/// Event published on the in-process bus after a committed store mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContextEvent {
    /// A context was created or overwritten.
    Updated {
        /// The context that changed.
        id: ContextId,
        /// Metadata as committed, including the new version.
        metadata: ContextMetadata,
    },
    /// A context was removed.
    Deleted {
        /// The context that was removed.
        id: ContextId,
    },
}

impl ContextEvent {
    /// The context this event refers to.
    pub fn context_id(&self) -> &ContextId {
        match self {
            ContextEvent::Updated { id, .. } | ContextEvent::Deleted { id } => id,
        }
    }
}

//─────────────────────────────
//  Event-stream envelope
//─────────────────────────────

/// Kind discriminator of a [`StreamEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEventKind {
    /// First event on every stream connection.
    Connected,
    /// Periodic keep-alive to defeat idle-connection middleboxes.
    Ping,
    /// A context was created or overwritten.
    Update,
    /// A context was removed.
    Delete,
    /// The subscriber fell behind and must perform a full catch-up.
    Resync,
}

/// Envelope carried on both event-stream endpoints.
///
/// Serialized as a single `data: <JSON>` chunk per event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    /// Event kind.
    pub event: StreamEventKind,
    /// Context the event refers to; absent on `connected`/`ping`/`resync`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,
    /// Committed metadata; present on `update` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ContextMetadata>,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    fn bare(event: StreamEventKind) -> Self {
        Self {
            event,
            context_id: None,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    /// Stream-attach acknowledgement.
    pub fn connected() -> Self {
        Self::bare(StreamEventKind::Connected)
    }

    /// Keep-alive event.
    pub fn ping() -> Self {
        Self::bare(StreamEventKind::Ping)
    }

    /// Overflow marker telling the subscriber to re-enter catch-up.
    pub fn resync() -> Self {
        Self::bare(StreamEventKind::Resync)
    }

    /// Update announcement carrying the committed metadata.
    pub fn update(id: ContextId, metadata: ContextMetadata) -> Self {
        Self {
            event: StreamEventKind::Update,
            context_id: Some(id),
            metadata: Some(metadata),
            timestamp: Utc::now(),
        }
    }

    /// Delete announcement.
    pub fn delete(id: ContextId) -> Self {
        Self {
            event: StreamEventKind::Delete,
            context_id: Some(id),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    /// Translate a bus event into its wire envelope.
    pub fn from_context_event(event: ContextEvent) -> Self {
        match event {
            ContextEvent::Updated { id, metadata } => Self::update(id, metadata),
            ContextEvent::Deleted { id } => Self::delete(id),
        }
    }
}

//─────────────────────────────
//  Context API wire bodies
//─────────────────────────────

/// Body of `PUT /contexts/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveRequest {
    /// The context payload, treated opaquely.
    pub context: Value,
    /// Optional caller-supplied metadata fields to merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Response of `PUT /contexts/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResponse {
    /// Whether the save was accepted.
    pub success: bool,
    /// The saved context identifier.
    pub context_id: ContextId,
    /// Metadata as committed, including the assigned version.
    pub metadata: ContextMetadata,
}

/// Response of `DELETE /contexts/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    /// Whether the delete was accepted.
    pub success: bool,
}

/// One entry of `GET /contexts?includeMetadata=true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Context identifier.
    pub id: ContextId,
    /// Current committed metadata.
    pub metadata: ContextMetadata,
}

//─────────────────────────────
//  Node roles
//─────────────────────────────

/// Role a node plays in the replication tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Single write-authoritative node.
    Central,
    /// Mirrors central for a region.
    Regional,
    /// Mirrors a regional, closest to clients.
    Cache,
}

impl NodeRole {
    /// Tag this node advertises in the peer directory.
    pub fn peer_tag(&self) -> &'static str {
        match self {
            NodeRole::Central => "central",
            NodeRole::Regional => "regional",
            NodeRole::Cache => "cache",
        }
    }

    /// Tag of the upstream this node subscribes to, if any.
    pub fn upstream_tag(&self) -> Option<&'static str> {
        match self {
            NodeRole::Central => None,
            NodeRole::Regional => Some("central"),
            NodeRole::Cache => Some("regional"),
        }
    }

    /// Whether this node is the write authority.
    pub fn is_central(&self) -> bool {
        matches!(self, NodeRole::Central)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.peer_tag())
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "central" => Ok(NodeRole::Central),
            "regional" => Ok(NodeRole::Regional),
            "cache" => Ok(NodeRole::Cache),
            other => Err(format!("unknown server type: {other:?}")),
        }
    }
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors surfaced by context storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested context does not exist.
    #[error("context not found: {0}")]
    NotFound(ContextId),
    /// The request was malformed (bad id, missing payload).
    #[error("invalid request: {0}")]
    Invalid(String),
    /// Disk failure on read or write.
    #[error("storage i/o failure: {0}")]
    Io(#[from] std::io::Error),
    /// Payload or metadata could not be (de)serialized.
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the error denotes an absent context.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
