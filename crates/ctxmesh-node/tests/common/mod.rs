//! Shared fixture: spin up fully wired nodes on ephemeral ports.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;
use uuid::Uuid;

use ctxmesh_node::{build_state_with_peers, router, AppState, NodeConfig};
use ctxmesh_peers::{PeerDirectory, StaticDirectory};
use ctxmesh_types::NodeRole;

pub struct TestNode {
    pub addr: SocketAddr,
    pub base: String,
    pub state: AppState,
    _data_dir: TempDir,
}

pub fn test_config(role: NodeRole, data_dir: &TempDir, upstream: Option<String>) -> NodeConfig {
    NodeConfig {
        role,
        port: 0,
        data_dir: data_dir.path().to_path_buf(),
        node_id: format!("test-{role}-{}", Uuid::new_v4()),
        region_id: "test-region".to_string(),
        central_authority: upstream,
        sync_interval: Duration::from_millis(300),
        cache_ttl: Duration::from_secs(60),
        overlay_endpoint: None,
    }
}

pub async fn spawn_node(role: NodeRole, upstream: Option<String>) -> TestNode {
    spawn_node_with_peers(role, upstream, Arc::new(StaticDirectory::default())).await
}

pub async fn spawn_node_with_peers(
    role: NodeRole,
    upstream: Option<String>,
    peers: Arc<dyn PeerDirectory>,
) -> TestNode {
    let data_dir = TempDir::new().unwrap();
    let config = test_config(role, &data_dir, upstream);
    let state = build_state_with_peers(config, peers).await.unwrap();

    if let Some(sync) = state.sync.clone() {
        tokio::spawn(sync.run());
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestNode {
        addr,
        base: format!("http://{addr}"),
        state,
        _data_dir: data_dir,
    }
}

/// Poll `probe` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
