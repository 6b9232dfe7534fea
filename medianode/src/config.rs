//! Front-end configuration

use crate::directory::SelectionPolicy;
use medianode_core::{ChannelOptions, MediaNodeError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// One media node the front-end may place routers on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaNodeConfig {
    /// `host:port` or a full `ws://` URL
    pub address: String,
    /// Pre-shared secret presented in the handshake
    pub secret: String,
}

/// Front-end settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    /// Media node pool
    pub media_nodes: Vec<MediaNodeConfig>,
    /// Window for a single request, in milliseconds
    pub request_timeout_ms: u64,
    /// Window for the WebSocket handshake, in milliseconds
    pub connect_timeout_ms: u64,
    /// How a media node is picked for a new router
    pub selection_policy: SelectionPolicy,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            media_nodes: Vec::new(),
            request_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            selection_policy: SelectionPolicy::Random,
        }
    }
}

impl FrontendConfig {
    /// Configuration for a pool sharing one secret
    pub fn with_nodes<I, S>(addresses: I, secret: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            media_nodes: addresses
                .into_iter()
                .map(|address| MediaNodeConfig {
                    address: address.into(),
                    secret: secret.to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MediaNodeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| MediaNodeError::InvalidConfiguration {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::from_json_str(&text)
    }

    /// Parse from JSON; missing fields take their defaults
    pub fn from_json_str(text: &str) -> Result<Self, MediaNodeError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| MediaNodeError::InvalidConfiguration {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the front-end cannot run with
    pub fn validate(&self) -> Result<(), MediaNodeError> {
        let invalid = |reason: String| Err(MediaNodeError::InvalidConfiguration { reason });

        if self.media_nodes.is_empty() {
            return invalid("media_nodes must not be empty".to_string());
        }
        for node in &self.media_nodes {
            if node.address.is_empty() {
                return invalid("media node address must not be empty".to_string());
            }
            if node.secret.is_empty() {
                return invalid(format!("secret of media node {} must not be empty", node.address));
            }
        }
        if self.request_timeout_ms == 0 {
            return invalid("request_timeout_ms must be positive".to_string());
        }
        if self.connect_timeout_ms == 0 {
            return invalid("connect_timeout_ms must be positive".to_string());
        }
        Ok(())
    }

    /// Timeouts for every channel opened by this front-end
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pool_rejected() {
        let err = FrontendConfig::default().validate().unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIGURATION");
    }

    #[test]
    fn test_from_json() {
        let config = FrontendConfig::from_json_str(
            r#"{
                "media_nodes": [
                    { "address": "10.0.0.1:8000", "secret": "a" },
                    { "address": "ws://10.0.0.2:8000", "secret": "b" }
                ],
                "selection_policy": "most_free_capacity"
            }"#,
        )
        .unwrap();

        assert_eq!(config.media_nodes.len(), 2);
        assert_eq!(config.selection_policy, SelectionPolicy::MostFreeCapacity);
        assert_eq!(config.request_timeout_ms, 10_000);
        assert_eq!(
            config.channel_options().connect_timeout,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_empty_secret_rejected() {
        let config = FrontendConfig::with_nodes(["127.0.0.1:8000"], "");
        assert!(config.validate().is_err());

        let config = FrontendConfig {
            request_timeout_ms: 0,
            ..FrontendConfig::with_nodes(["127.0.0.1:8000"], "s3cret")
        };
        assert!(config.validate().is_err());
    }
}
