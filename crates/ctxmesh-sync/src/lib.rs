#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ctxmesh-sync** – Replication pipeline for CtxMesh.
//!
//! Three collaborators live here, all speaking the context API of the node
//! crate:
//!
//! - [`UpstreamClient`] wraps the HTTP surface of an upstream node: catch-up
//!   listings, payload fetches, forwarded client writes, origin-tagged
//!   propagation pushes, and the long-lived event-stream subscription.
//! - [`ReplicaSync`] is the loop non-central nodes run to first catch up
//!   with their upstream and then stay in sync over the event stream,
//!   falling back to a full reconcile on overflow, error, or idleness.
//! - [`Propagator`] is central's best-effort fan-out that pushes committed
//!   changes to every online regional peer without ever blocking the
//!   originating request.
//!
//! Everything applied from upstream goes through the store's
//! apply-from-upstream operations, so propagated changes are never
//! re-announced locally and re-deliveries are idempotent per version.

mod client;
mod propagate;
mod replica;

pub use client::{EventStream, UpstreamClient};
pub use propagate::Propagator;
pub use replica::{ReplicaSync, SyncConfig};
