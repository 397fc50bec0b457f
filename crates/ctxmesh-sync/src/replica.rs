//! The sync loop non-central nodes run against their upstream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use ctxmesh_peers::{select_upstream, PeerDirectory};
use ctxmesh_store::ContextStore;
use ctxmesh_types::{NodeRole, StreamEvent, StreamEventKind};

use crate::client::UpstreamClient;

/// Ceiling multiplier for the failure backoff.
const MAX_BACKOFF_FACTOR: u32 = 10;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Settings of one replica's sync loop.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Role of this node; decides which upstream tag to look for.
    pub role: NodeRole,
    /// Region tag a cache constrains its regional lookup to.
    pub region: Option<String>,
    /// Identity announced on stream subscriptions.
    pub node_id: String,
    /// Upstream base URL used when peer discovery yields nothing.
    pub fallback_upstream: Option<String>,
    /// Catch-up cadence, idle reconcile window, and initial backoff.
    pub sync_interval: Duration,
}

//─────────────────────────────
//  Replica sync loop
//─────────────────────────────

/// Keeps a non-central node converged with its upstream.
///
/// Each cycle discovers the upstream, performs a full catch-up, then holds
/// the event stream open. An explicit `resync`, an idle window of one
/// `sync_interval`, or a clean reconcile request loops straight back into
/// catch-up; a failure backs off exponentially (capped at 10× the interval)
/// before re-entering discovery.
pub struct ReplicaSync {
    store: Arc<dyn ContextStore>,
    peers: Arc<dyn PeerDirectory>,
    config: SyncConfig,
    upstream: Arc<RwLock<Option<String>>>,
    cycles: AtomicU64,
}

impl ReplicaSync {
    /// Sync loop for `store`, discovering upstreams through `peers`.
    pub fn new(
        store: Arc<dyn ContextStore>,
        peers: Arc<dyn PeerDirectory>,
        config: SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            peers,
            config,
            upstream: Arc::new(RwLock::new(None)),
            cycles: AtomicU64::new(0),
        })
    }

    /// Shared handle to the currently resolved upstream base URL.
    ///
    /// The request router uses this to forward client writes to the
    /// authority without re-running discovery.
    pub fn upstream_handle(&self) -> Arc<RwLock<Option<String>>> {
        self.upstream.clone()
    }

    /// Completed catch-up passes, exposed for metrics and status.
    pub fn cycle_count(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Run the loop until the process shuts down.
    pub async fn run(self: Arc<Self>) {
        let initial = self.config.sync_interval;
        let max_backoff = initial * MAX_BACKOFF_FACTOR;
        let mut backoff = initial;

        loop {
            match self.sync_cycle().await {
                Ok(()) => {
                    // Reconcile requested: re-enter catch-up right away.
                    backoff = initial;
                }
                Err(err) => {
                    warn!(error = ?err, backoff_secs = backoff.as_secs(), "sync cycle failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }
    }

    /// One DISCOVER → CATCHUP → STREAM pass.
    async fn sync_cycle(&self) -> Result<()> {
        let base = self.discover().await?;
        *self.upstream.write().await = Some(base.clone());
        let client = UpstreamClient::new(&base)?;

        let applied = self.catch_up(&client).await?;
        self.cycles.fetch_add(1, Ordering::Relaxed);
        info!(upstream = %base, applied, "catch-up complete");

        self.stream_events(&client).await
    }

    /// Resolve the upstream base URL via the peer directory, falling back to
    /// the statically configured one.
    async fn discover(&self) -> Result<String> {
        let Some(tag) = self.config.role.upstream_tag() else {
            bail!("central has no upstream to sync from");
        };

        match self.peers.peers().await {
            Ok(peers) => {
                if let Some(peer) = select_upstream(&peers, tag, self.config.region.as_deref()) {
                    debug!(peer = %peer.name, tag, "upstream discovered");
                    return Ok(peer.base_url());
                }
                debug!(tag, "no matching peer online");
            }
            Err(err) => warn!(error = ?err, "peer directory unavailable"),
        }

        self.config
            .fallback_upstream
            .clone()
            .context("no upstream: discovery found no peer and no fallback is configured")
    }

    /// Pull every context whose upstream version is strictly newer.
    async fn catch_up(&self, client: &UpstreamClient) -> Result<usize> {
        let entries = client.list_with_metadata().await?;
        let mut applied = 0;

        for entry in entries {
            let local_version = match self.store.get_metadata(&entry.id).await {
                Ok(meta) => Some(meta.version),
                Err(err) if err.is_not_found() => None,
                Err(err) => return Err(err).context("local metadata read failed"),
            };
            if local_version.is_some_and(|v| entry.metadata.version <= v) {
                continue;
            }

            // The context may disappear upstream between listing and fetch;
            // its delete will arrive through the stream.
            let Some(payload) = client.fetch_context(&entry.id).await? else {
                debug!(context_id = %entry.id, "context vanished during catch-up");
                continue;
            };
            if self
                .store
                .apply_update(&entry.id, &payload, entry.metadata)
                .await
                .context("apply of upstream context failed")?
            {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Consume the upstream stream until a reconcile is due.
    ///
    /// `Ok(())` means loop back into catch-up immediately (resync or idle);
    /// an error means the connection is gone and the caller should back off.
    async fn stream_events(&self, client: &UpstreamClient) -> Result<()> {
        let mut stream = client
            .subscribe(self.config.role.peer_tag(), &self.config.node_id)
            .await?;

        loop {
            let next = tokio::time::timeout(self.config.sync_interval, stream.next_event()).await;
            let event = match next {
                Err(_) => {
                    debug!("stream idle; reconciling");
                    return Ok(());
                }
                Ok(Ok(Some(event))) => event,
                Ok(Ok(None)) => bail!("event stream closed by upstream"),
                Ok(Err(err)) => return Err(err),
            };

            match event.event {
                StreamEventKind::Connected => {
                    debug!(upstream = %client.base_url(), "event stream attached")
                }
                StreamEventKind::Ping => {}
                StreamEventKind::Resync => {
                    info!("upstream requested resync");
                    return Ok(());
                }
                StreamEventKind::Update => self.apply_stream_update(client, event).await?,
                StreamEventKind::Delete => self.apply_stream_delete(event).await?,
            }
        }
    }

    async fn apply_stream_update(&self, client: &UpstreamClient, event: StreamEvent) -> Result<()> {
        let (Some(id), Some(metadata)) = (event.context_id, event.metadata) else {
            warn!("update event without contextId or metadata; ignoring");
            return Ok(());
        };

        let payload = match client.fetch_context(&id).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(context_id = %id, "announced context already gone upstream");
                return Ok(());
            }
            Err(err) => {
                // Transient fetch trouble; the periodic reconcile covers it.
                warn!(context_id = %id, error = ?err, "payload fetch for stream update failed");
                return Ok(());
            }
        };

        let applied = self
            .store
            .apply_update(&id, &payload, metadata)
            .await
            .context("apply of streamed update failed")?;
        if applied {
            debug!(context_id = %id, "streamed update applied");
        }
        Ok(())
    }

    async fn apply_stream_delete(&self, event: StreamEvent) -> Result<()> {
        let Some(id) = event.context_id else {
            warn!("delete event without contextId; ignoring");
            return Ok(());
        };
        self.store
            .apply_delete(&id)
            .await
            .context("apply of streamed delete failed")?;
        debug!(context_id = %id, "streamed delete applied");
        Ok(())
    }
}
