//! Shared state handed to every request handler.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use ctxmesh_bus::EventBus;
use ctxmesh_peers::PeerDirectory;
use ctxmesh_store::ContextStore;
use ctxmesh_sync::{Propagator, ReplicaSync};

use crate::config::NodeConfig;
use crate::metrics::NodeMetrics;

/// State shared by all handlers of one node.
#[derive(Clone)]
pub struct AppState {
    /// Resolved node settings.
    pub config: Arc<NodeConfig>,
    /// Durable context storage.
    pub store: Arc<dyn ContextStore>,
    /// In-process event bus feeding the stream endpoints.
    pub bus: Arc<dyn EventBus>,
    /// Overlay peer directory.
    pub peers: Arc<dyn PeerDirectory>,
    /// Regional fan-out; present on central only.
    pub propagator: Option<Arc<Propagator>>,
    /// Upstream sync loop; present on non-central nodes only.
    pub sync: Option<Arc<ReplicaSync>>,
    /// Upstream base URL resolved by the sync loop.
    pub upstream: Arc<RwLock<Option<String>>>,
    /// Prometheus metric handles.
    pub metrics: Arc<NodeMetrics>,
    /// Process start, for uptime reporting.
    pub started: Instant,
}

impl AppState {
    /// Upstream base URL for forwarded writes and lazy pulls.
    ///
    /// Prefers the address the sync loop discovered; falls back to the
    /// statically configured authority.
    pub async fn resolve_upstream(&self) -> Option<String> {
        if let Some(base) = self.upstream.read().await.clone() {
            return Some(base);
        }
        self.config.central_authority.clone()
    }
}
