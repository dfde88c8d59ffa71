//! wanproxyd — paired TCP proxy with dedup, compression and transport
//! encryption between instances.

use std::path::PathBuf;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=debug wanproxyd wanproxy.toml
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("wanproxy.toml"));

    tracing::info!(config = %config_path.display(), "wanproxyd starting");
    wanproxyd::run(&config_path).await
}
