#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ctxmesh-store** – Durable versioned context storage for CtxMesh.
//!
//! This crate defines the [`ContextStore`] contract and provides the
//! file-backed driver used by every node role. Each context is persisted as
//! two JSON files under the data directory, fronted by a bounded LRU cache,
//! and mutated only under a per-context lock so that version assignment is
//! linearized per id while distinct ids proceed concurrently.
//!
//! Committed mutations are announced on the injected event bus *after*
//! durability is achieved; the apply-from-upstream variants used by the
//! replication pipeline suppress that announcement so propagated changes
//! never loop back into the channel they arrived on.

use async_trait::async_trait;
use serde_json::{Map, Value};

use ctxmesh_types::{ContextEntry, ContextId, ContextMetadata, StoreError};

mod cache;
mod file;

pub use file::{FileStore, DEFAULT_CACHE_CAPACITY};

//─────────────────────────────
//  Store trait
//─────────────────────────────

/// Abstraction over durable per-context storage.
///
/// Implementations guarantee that `save` is serialized per context id, that
/// versions increase by exactly 1 per successful save, and that events are
/// published exactly once per committed mutation (never for the
/// apply-from-upstream variants).
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Fetch the payload of a context.
    async fn get(&self, id: &ContextId) -> Result<Value, StoreError>;

    /// Fetch the committed metadata of a context.
    async fn get_metadata(&self, id: &ContextId) -> Result<ContextMetadata, StoreError>;

    /// Persist a payload, assigning the next monotonic version.
    ///
    /// `extra` carries caller-supplied metadata fields; store-owned fields
    /// inside it are ignored. Returns the metadata as committed.
    async fn save(
        &self,
        id: &ContextId,
        payload: &Value,
        extra: Map<String, Value>,
    ) -> Result<ContextMetadata, StoreError>;

    /// Mirror an upstream save, keeping the pre-assigned metadata verbatim.
    ///
    /// No version is assigned and nothing is published. Deliveries with a
    /// version not strictly greater than the local one are ignored, which
    /// makes re-delivery idempotent; the return value reports whether the
    /// update was applied.
    async fn apply_update(
        &self,
        id: &ContextId,
        payload: &Value,
        metadata: ContextMetadata,
    ) -> Result<bool, StoreError>;

    /// Remove a context and its metadata.
    async fn delete(&self, id: &ContextId) -> Result<(), StoreError>;

    /// Mirror an upstream delete; absence is a no-op and nothing is published.
    async fn apply_delete(&self, id: &ContextId) -> Result<(), StoreError>;

    /// Enumerate all stored context ids.
    async fn list(&self) -> Result<Vec<ContextId>, StoreError>;

    /// Enumerate all stored contexts with their metadata.
    async fn list_with_metadata(&self) -> Result<Vec<ContextEntry>, StoreError>;

    /// Number of stored contexts.
    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.list().await?.len())
    }
}
