//! Node configuration, resolved from CLI flags and environment variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use uuid::Uuid;

use ctxmesh_types::NodeRole;

//─────────────────────────────
//  CLI structure
//─────────────────────────────

/// Raw command line; every flag falls back to its environment variable.
#[derive(Debug, Parser)]
#[command(name = "ctxmesh-node")]
#[command(about = "CtxMesh node - tiered replicating context store for AI agents")]
#[command(version)]
pub struct Cli {
    /// Node role: central, regional, or cache
    #[arg(long, env = "SERVER_TYPE", default_value = "central")]
    server_type: String,

    /// HTTP listen port
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Directory holding the persistent context files
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Stable node identity; a fresh UUID when unset
    #[arg(long, env = "NODE_ID")]
    node_id: Option<String>,

    /// Region this node serves
    #[arg(long, env = "REGION_ID", default_value = "default")]
    region_id: String,

    /// Fallback upstream URL when peer discovery finds nothing
    #[arg(long, env = "CENTRAL_AUTHORITY")]
    central_authority: Option<String>,

    /// Sync cadence and idle reconcile window, in milliseconds
    #[arg(long, env = "SYNC_INTERVAL", default_value_t = 60_000)]
    sync_interval: u64,

    /// Freshness window of the in-memory context cache, in milliseconds
    #[arg(long, env = "CACHE_TTL", default_value_t = 60_000)]
    cache_ttl: u64,

    /// Overlay agent endpoint used for peer discovery
    #[arg(long, env = "OVERLAY_ENDPOINT")]
    overlay_endpoint: Option<String>,
}

//─────────────────────────────
//  Resolved configuration
//─────────────────────────────

/// Fully resolved node settings.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Role of this node in the replication tree.
    pub role: NodeRole,
    /// HTTP listen port.
    pub port: u16,
    /// Persistent data directory.
    pub data_dir: PathBuf,
    /// Identity announced to peers and on propagated writes.
    pub node_id: String,
    /// Region this node serves.
    pub region_id: String,
    /// Statically configured upstream, used when discovery yields nothing.
    pub central_authority: Option<String>,
    /// Sync cadence and initial backoff of the replica loop.
    pub sync_interval: Duration,
    /// Freshness window of cached contexts.
    pub cache_ttl: Duration,
    /// Overlay agent endpoint, if any.
    pub overlay_endpoint: Option<String>,
}

impl Cli {
    /// Resolve the raw arguments into a [`NodeConfig`].
    pub fn into_config(self) -> Result<NodeConfig> {
        let role = self
            .server_type
            .parse::<NodeRole>()
            .map_err(|err| anyhow!("SERVER_TYPE: {err}"))?;

        if !role.is_central() && self.central_authority.is_none() && self.overlay_endpoint.is_none()
        {
            tracing::warn!(
                "no CENTRAL_AUTHORITY or OVERLAY_ENDPOINT configured; this {role} node cannot sync"
            );
        }

        Ok(NodeConfig {
            role,
            port: self.port,
            data_dir: self.data_dir,
            node_id: self
                .node_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            region_id: self.region_id,
            central_authority: self.central_authority,
            sync_interval: Duration::from_millis(self.sync_interval),
            cache_ttl: Duration::from_millis(self.cache_ttl),
            overlay_endpoint: self.overlay_endpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_to_a_central_node() {
        let cli = Cli::parse_from(["ctxmesh-node"]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.role, NodeRole::Central);
        assert_eq!(config.port, 8080);
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert!(!config.node_id.is_empty());
    }

    #[test]
    fn explicit_flags_override_defaults() {
        let cli = Cli::parse_from([
            "ctxmesh-node",
            "--server-type",
            "cache",
            "--port",
            "9100",
            "--region-id",
            "eu-west",
            "--central-authority",
            "http://regional.mesh:8080",
            "--sync-interval",
            "5000",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.role, NodeRole::Cache);
        assert_eq!(config.port, 9100);
        assert_eq!(config.region_id, "eu-west");
        assert_eq!(
            config.central_authority.as_deref(),
            Some("http://regional.mesh:8080")
        );
        assert_eq!(config.sync_interval, Duration::from_secs(5));
    }

    #[test]
    fn unknown_role_is_rejected() {
        let cli = Cli::parse_from(["ctxmesh-node", "--server-type", "edge"]);
        assert!(cli.into_config().is_err());
    }
}
