//! Central's best-effort fan-out to regional peers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use ctxmesh_peers::{online_with_tag, PeerDirectory, PeerInfo};
use ctxmesh_types::{ContextId, ContextMetadata};

use crate::client::UpstreamClient;

/// Per-peer push deadline.
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Tag of the peers central pushes to.
const FANOUT_TAG: &str = "regional";

#[derive(Debug, Clone)]
enum Push {
    Update {
        id: ContextId,
        payload: Value,
        metadata: ContextMetadata,
    },
    Delete {
        id: ContextId,
    },
}

impl Push {
    fn context_id(&self) -> &ContextId {
        match self {
            Push::Update { id, .. } | Push::Delete { id } => id,
        }
    }
}

//─────────────────────────────
//  Propagator
//─────────────────────────────

/// Pushes committed central writes to every online regional peer.
///
/// Fan-out runs on detached tasks and never blocks the originating request;
/// a failing or slow peer is logged and counted, nothing more. Streaming
/// covers peers with an open subscription; these direct pushes cover peers
/// that have not opened one yet (fresh replicas, replicas in backoff).
pub struct Propagator {
    peers: Arc<dyn PeerDirectory>,
    node_id: String,
    pushes: AtomicU64,
    failures: AtomicU64,
}

impl Propagator {
    /// Propagator identifying itself as `node_id` on pushed writes.
    pub fn new(peers: Arc<dyn PeerDirectory>, node_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            peers,
            node_id: node_id.into(),
            pushes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    /// Total pushes attempted.
    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    /// Pushes that failed or timed out.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Fan a committed save out to the regional peers. Returns immediately.
    pub fn propagate_update(
        self: &Arc<Self>,
        id: ContextId,
        payload: Value,
        metadata: ContextMetadata,
    ) {
        let this = self.clone();
        tokio::spawn(this.fan_out(Push::Update {
            id,
            payload,
            metadata,
        }));
    }

    /// Fan a committed delete out to the regional peers. Returns immediately.
    pub fn propagate_delete(self: &Arc<Self>, id: ContextId) {
        let this = self.clone();
        tokio::spawn(this.fan_out(Push::Delete { id }));
    }

    async fn fan_out(self: Arc<Self>, push: Push) {
        let peers = match self.peers.peers().await {
            Ok(peers) => peers,
            Err(err) => {
                warn!(error = ?err, "peer discovery failed; skipping propagation");
                return;
            }
        };

        let targets: Vec<PeerInfo> = online_with_tag(&peers, FANOUT_TAG)
            .into_iter()
            .cloned()
            .collect();
        if targets.is_empty() {
            debug!(context_id = %push.context_id(), "no regional peers online");
            return;
        }

        let mut tasks = Vec::with_capacity(targets.len());
        for peer in targets {
            let this = self.clone();
            let push = push.clone();
            tasks.push(tokio::spawn(async move {
                this.push_to_peer(peer, push).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn push_to_peer(&self, peer: PeerInfo, push: Push) {
        self.pushes.fetch_add(1, Ordering::Relaxed);
        let context_id = push.context_id().clone();

        let attempt = tokio::time::timeout(PUSH_TIMEOUT, async {
            let client = UpstreamClient::new(&peer.base_url())?;
            match &push {
                Push::Update {
                    id,
                    payload,
                    metadata,
                } => client.push_update(id, payload, metadata, &self.node_id).await,
                Push::Delete { id } => client.push_delete(id, &self.node_id).await,
            }
        })
        .await;

        match attempt {
            Ok(Ok(())) => {
                debug!(peer = %peer.name, context_id = %context_id, "change propagated")
            }
            Ok(Err(err)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %peer.name, context_id = %context_id, error = ?err, "propagation push failed");
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %peer.name, context_id = %context_id, "propagation push timed out");
            }
        }
    }
}
