#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ctxmesh-peers** – Peer discovery capability for CtxMesh.
//!
//! The replication pipeline never talks to the overlay network directly; it
//! consumes the [`PeerDirectory`] capability defined here. Production wiring
//! queries the overlay agent's local HTTP endpoint, tests and static
//! deployments supply a fixed peer set.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Timeout for queries against the overlay agent.
const OVERLAY_TIMEOUT: Duration = Duration::from_secs(5);

//─────────────────────────────
//  Peer records
//─────────────────────────────

/// One node known to the overlay.
///
/// `tags` carries the node's role (`central`, `regional`, `cache`) plus any
/// region identifier it advertises; `address` is `host:port` or a full base
/// URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Overlay hostname of the peer.
    pub name: String,
    /// Reachable address, `host:port` or an absolute URL.
    pub address: String,
    /// Role and region tags advertised by the peer.
    pub tags: Vec<String>,
    /// Whether the overlay currently sees the peer.
    pub online: bool,
}

impl PeerInfo {
    /// Whether the peer advertises the given tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// HTTP base URL of the peer's context API.
    pub fn base_url(&self) -> String {
        if self.address.starts_with("http://") || self.address.starts_with("https://") {
            self.address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", self.address)
        }
    }
}

/// Pick an online peer carrying `tag`, optionally constrained to a region.
///
/// Used by replicas to resolve their upstream: regionals look for `central`,
/// caches for a `regional` advertising their own region tag.
pub fn select_upstream<'a>(
    peers: &'a [PeerInfo],
    tag: &str,
    region: Option<&str>,
) -> Option<&'a PeerInfo> {
    peers
        .iter()
        .filter(|p| p.online && p.has_tag(tag))
        .find(|p| region.map_or(true, |r| p.has_tag(r)))
}

/// All online peers carrying `tag`; central uses this for regional fan-out.
pub fn online_with_tag<'a>(peers: &'a [PeerInfo], tag: &str) -> Vec<&'a PeerInfo> {
    peers.iter().filter(|p| p.online && p.has_tag(tag)).collect()
}

//─────────────────────────────
//  Directory trait
//─────────────────────────────

/// Source of the current peer set.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Enumerate all peers the overlay currently knows about.
    async fn peers(&self) -> Result<Vec<PeerInfo>>;
}

//─────────────────────────────
//  Static directory
//─────────────────────────────

/// Fixed peer set, used by tests and overlay-less deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    peers: Vec<PeerInfo>,
}

impl StaticDirectory {
    /// Directory serving the given peer set.
    pub fn new(peers: Vec<PeerInfo>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl PeerDirectory for StaticDirectory {
    async fn peers(&self) -> Result<Vec<PeerInfo>> {
        Ok(self.peers.clone())
    }
}

//─────────────────────────────
//  Overlay-backed directory
//─────────────────────────────

/// Directory querying the overlay agent's local HTTP endpoint.
///
/// The agent answers `GET {endpoint}/peers` with a JSON array of
/// [`PeerInfo`] records covering every node enrolled in the private network.
pub struct OverlayDirectory {
    endpoint: String,
    client: reqwest::Client,
}

impl OverlayDirectory {
    /// Directory backed by the overlay agent at `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(OVERLAY_TIMEOUT)
            .build()
            .context("failed to build overlay http client")?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl PeerDirectory for OverlayDirectory {
    async fn peers(&self) -> Result<Vec<PeerInfo>> {
        let url = format!("{}/peers", self.endpoint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("overlay query failed: {url}"))?
            .error_for_status()
            .context("overlay query rejected")?;
        response
            .json::<Vec<PeerInfo>>()
            .await
            .context("malformed overlay peer list")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str, tags: &[&str], online: bool) -> PeerInfo {
        PeerInfo {
            name: name.to_string(),
            address: format!("{name}.mesh:8080"),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            online,
        }
    }

    #[test]
    fn base_url_normalization() {
        let mut p = peer("r1", &["regional"], true);
        assert_eq!(p.base_url(), "http://r1.mesh:8080");

        p.address = "https://r1.example.com/".to_string();
        assert_eq!(p.base_url(), "https://r1.example.com");
    }

    #[test]
    fn select_upstream_prefers_online_tagged_peers() {
        let peers = vec![
            peer("c-down", &["central"], false),
            peer("r1", &["regional", "eu-west"], true),
            peer("c1", &["central"], true),
        ];

        assert_eq!(select_upstream(&peers, "central", None).unwrap().name, "c1");
        assert_eq!(
            select_upstream(&peers, "regional", Some("eu-west")).unwrap().name,
            "r1"
        );
        assert!(select_upstream(&peers, "regional", Some("us-east")).is_none());
    }

    #[test]
    fn online_with_tag_filters_offline_peers() {
        let peers = vec![
            peer("r1", &["regional"], true),
            peer("r2", &["regional"], false),
            peer("c1", &["central"], true),
        ];
        let regionals = online_with_tag(&peers, "regional");
        assert_eq!(regionals.len(), 1);
        assert_eq!(regionals[0].name, "r1");
    }

    #[tokio::test]
    async fn static_directory_round_trip() {
        let dir = StaticDirectory::new(vec![peer("c1", &["central"], true)]);
        let peers = dir.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "c1");
    }

    #[test]
    fn peer_info_wire_shape() {
        let json = serde_json::json!({
            "name": "r1",
            "address": "r1.mesh:8080",
            "tags": ["regional", "eu-west"],
            "online": true
        });
        let p: PeerInfo = serde_json::from_value(json).unwrap();
        assert!(p.has_tag("eu-west"));
    }
}
