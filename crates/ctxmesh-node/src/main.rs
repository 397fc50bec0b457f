#![forbid(unsafe_code)]

//! CtxMesh node binary.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ctxmesh_node::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Cli::parse().into_config()?;
    info!(
        "Starting ctxmesh-node v{} as {}",
        env!("CARGO_PKG_VERSION"),
        config.role
    );

    ctxmesh_node::run(config).await
}
