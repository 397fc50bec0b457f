#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ctxmesh-node** – HTTP node of the CtxMesh replication tree.
//!
//! A node wires the durable [`ctxmesh_store::FileStore`], the in-process
//! [`ctxmesh_bus::InMemoryBus`], peer discovery, and the replication
//! pipeline behind one axum router. The surface is identical on every role;
//! behavior differs where it must: central versions writes and fans them
//! out, regionals and caches run the sync loop and forward writes upstream.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::RwLock;
use tracing::info;

use ctxmesh_bus::{EventBus, InMemoryBus};
use ctxmesh_peers::{OverlayDirectory, PeerDirectory, StaticDirectory};
use ctxmesh_store::{ContextStore, FileStore, DEFAULT_CACHE_CAPACITY};
use ctxmesh_sync::{Propagator, ReplicaSync, SyncConfig};
use ctxmesh_types::NodeRole;

pub mod config;
mod error;
pub mod metrics;
mod routes;
pub mod state;

pub use config::{Cli, NodeConfig};
pub use routes::router;
pub use state::AppState;

/// Ring capacity of the node's event bus.
const BUS_CAPACITY: usize = 256;

/// Wire up all components for the given configuration.
///
/// Peer discovery goes through the overlay endpoint when one is configured
/// and an empty static directory otherwise.
pub async fn build_state(config: NodeConfig) -> Result<AppState> {
    let peers: Arc<dyn PeerDirectory> = match &config.overlay_endpoint {
        Some(endpoint) => Arc::new(OverlayDirectory::new(endpoint)?),
        None => Arc::new(StaticDirectory::default()),
    };
    build_state_with_peers(config, peers).await
}

/// Wire up all components with an explicit peer directory.
pub async fn build_state_with_peers(
    config: NodeConfig,
    peers: Arc<dyn PeerDirectory>,
) -> Result<AppState> {
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(BUS_CAPACITY));
    let store: Arc<dyn ContextStore> = Arc::new(
        FileStore::open_with_cache(
            &config.data_dir,
            bus.clone(),
            DEFAULT_CACHE_CAPACITY,
            config.cache_ttl,
        )
        .await
        .with_context(|| format!("failed to initialize data dir {}", config.data_dir.display()))?,
    );
    let node_metrics = Arc::new(metrics::NodeMetrics::new()?);

    let (propagator, sync, upstream) = match config.role {
        NodeRole::Central => (
            Some(Propagator::new(peers.clone(), config.node_id.clone())),
            None,
            Arc::new(RwLock::new(None)),
        ),
        role => {
            let sync = ReplicaSync::new(
                store.clone(),
                peers.clone(),
                SyncConfig {
                    role,
                    region: (role == NodeRole::Cache).then(|| config.region_id.clone()),
                    node_id: config.node_id.clone(),
                    fallback_upstream: config.central_authority.clone(),
                    sync_interval: config.sync_interval,
                },
            );
            let upstream = sync.upstream_handle();
            (None, Some(sync), upstream)
        }
    };

    Ok(AppState {
        config: Arc::new(config),
        store,
        bus,
        peers,
        propagator,
        sync,
        upstream,
        metrics: node_metrics,
        started: Instant::now(),
    })
}

/// Run a node until shutdown.
///
/// Binds the configured port, spawns the sync loop on non-central roles,
/// and serves until SIGINT/SIGTERM. Startup failures bubble up so the
/// process exits non-zero.
pub async fn run(config: NodeConfig) -> Result<()> {
    let state = build_state(config).await?;

    if let Some(sync) = state.sync.clone() {
        tokio::spawn(sync.run());
        info!("replica sync loop started");
    }

    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        role = %state.config.role,
        node_id = %state.config.node_id,
        region = %state.config.region_id,
        addr = %addr,
        "node listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
