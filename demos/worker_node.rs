//! Media Node Demo
//!
//! Runs a media node backed by the in-memory loopback engine. Front-ends
//! connect to it with the secret from `MEDIANODE_SECRET` (default `s3cret`).
//!
//! ```text
//! cargo run --example worker_node -- [config.json]
//! ```

use medianode_core::logging::init_logging;
use medianode_worker::{LoopbackEngine, WorkerConfig, WorkerServer};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging("info,medianode_worker=debug");

    let mut config = match std::env::args().nth(1) {
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig {
            listen_addr: "127.0.0.1:4443".parse()?,
            ..Default::default()
        },
    };
    if config.secret.is_empty() {
        config.secret = std::env::var("MEDIANODE_SECRET").unwrap_or_else(|_| "s3cret".to_string());
    }

    let handle = WorkerServer::new(config, Arc::new(LoopbackEngine::new()))?
        .bind()
        .await?;
    info!("🚀 Media node listening on ws://{}", handle.local_addr());
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down, {} front-ends connected", handle.session_count());
    handle.shutdown();
    Ok(())
}
