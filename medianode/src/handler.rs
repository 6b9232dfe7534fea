//! Entry point of the front-end

use crate::config::FrontendConfig;
use crate::directory::WorkerDirectory;
use crate::router::Router;
use crate::worker::WorkerNode;
use medianode_core::MediaNodeError;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Places routers on the media node pool
///
/// The handler owns its [`WorkerDirectory`]; there is no process-wide state.
/// Channels to media nodes open lazily, on the first router placed there.
#[derive(Debug)]
pub struct MediaHandler {
    directory: WorkerDirectory,
}

impl MediaHandler {
    /// Create a handler over the configured pool
    pub fn new(config: &FrontendConfig) -> Result<Self, MediaNodeError> {
        let directory = WorkerDirectory::from_config(config)?;
        info!(
            "Media handler over {} media nodes ({:?})",
            directory.workers().len(),
            directory.policy()
        );
        Ok(Self { directory })
    }

    /// Handler over an existing directory
    pub fn with_directory(directory: WorkerDirectory) -> Self {
        Self { directory }
    }

    /// The media node pool
    pub fn directory(&self) -> &WorkerDirectory {
        &self.directory
    }

    /// Every media node of the pool
    pub fn workers(&self) -> &[Arc<WorkerNode>] {
        self.directory.workers()
    }

    /// Create a router on one media node
    ///
    /// Exactly one node is tried. When it cannot be reached the creation
    /// fails; another node is never attempted.
    pub async fn create_router(&self, media_codecs: Option<Value>) -> Result<Router, MediaNodeError> {
        let worker = self.directory.select()?;
        worker.create_router(media_codecs).await.map_err(|e| {
            warn!("Router creation on {} failed: {}", worker.address(), e);
            e
        })
    }

    /// Drop every channel; all routers and their descendants close
    pub fn close(&self) {
        for worker in self.directory.workers() {
            worker.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_rejects_empty_pool() {
        let err = MediaHandler::new(&FrontendConfig::default()).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIGURATION");
    }

    #[tokio::test]
    async fn test_unreachable_node_fails_creation() {
        let config = FrontendConfig {
            connect_timeout_ms: 500,
            ..FrontendConfig::with_nodes(["127.0.0.1:1"], "s3cret")
        };
        let handler = MediaHandler::new(&config).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handler.create_router(None))
            .await
            .unwrap();
        assert!(result.unwrap_err().is_connection_error());
        handler.close();
    }
}
