//! Media node configuration

use medianode_core::MediaNodeError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Media node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Address the control channel listens on
    pub listen_addr: SocketAddr,
    /// Pre-shared secret front-ends must present
    pub secret: String,
    /// Capacity sampling period in milliseconds
    pub capacity_interval_ms: u64,
    /// Window for requests this node sends, in milliseconds
    pub request_timeout_ms: u64,
    /// Router defaults
    pub router: RouterSettings,
    /// WebRTC transport defaults
    pub web_rtc_transport: WebRtcTransportSettings,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            secret: String::new(),
            capacity_interval_ms: 1000,
            request_timeout_ms: 10_000,
            router: RouterSettings::default(),
            web_rtc_transport: WebRtcTransportSettings::default(),
        }
    }
}

impl WorkerConfig {
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

    /// Reject settings the node cannot run with
    pub fn validate(&self) -> Result<(), MediaNodeError> {
        let invalid = |reason: &str| {
            Err(MediaNodeError::InvalidConfiguration {
                reason: reason.to_string(),
            })
        };

        if self.secret.is_empty() {
            return invalid("secret must not be empty");
        }
        if self.capacity_interval_ms == 0 {
            return invalid("capacity_interval_ms must be positive");
        }
        if self.request_timeout_ms == 0 {
            return invalid("request_timeout_ms must be positive");
        }
        if !self.router.media_codecs.is_array() {
            return invalid("router.media_codecs must be an array");
        }
        if self.web_rtc_transport.listen_ips.is_empty() {
            return invalid("web_rtc_transport.listen_ips must not be empty");
        }
        Ok(())
    }

    /// Capacity sampling period
    pub fn capacity_interval(&self) -> Duration {
        Duration::from_millis(self.capacity_interval_ms)
    }

    /// Request window
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Router defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Media codecs used when a `createRouter` request carries none
    pub media_codecs: Value,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            media_codecs: default_media_codecs(),
        }
    }
}

/// Opus, VP8, VP9 and two H264 profiles
pub fn default_media_codecs() -> Value {
    json!([
        {
            "kind": "audio",
            "mimeType": "audio/opus",
            "clockRate": 48000,
            "channels": 2
        },
        {
            "kind": "video",
            "mimeType": "video/VP8",
            "clockRate": 90000,
            "parameters": { "x-google-start-bitrate": 1000 }
        },
        {
            "kind": "video",
            "mimeType": "video/VP9",
            "clockRate": 90000,
            "parameters": { "profile-id": 2, "x-google-start-bitrate": 1000 }
        },
        {
            "kind": "video",
            "mimeType": "video/h264",
            "clockRate": 90000,
            "parameters": {
                "packetization-mode": 1,
                "profile-level-id": "4d0032",
                "level-asymmetry-allowed": 1,
                "x-google-start-bitrate": 1000
            }
        },
        {
            "kind": "video",
            "mimeType": "video/h264",
            "clockRate": 90000,
            "parameters": {
                "packetization-mode": 1,
                "profile-level-id": "42e01f",
                "level-asymmetry-allowed": 1,
                "x-google-start-bitrate": 1000
            }
        }
    ])
}

/// Address a transport listens on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenIp {
    /// Local address
    pub ip: String,
    /// Address advertised in ICE candidates, when behind NAT
    #[serde(default)]
    pub announced_ip: Option<String>,
}

/// WebRTC transport defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcTransportSettings {
    /// Listening addresses
    pub listen_ips: Vec<ListenIp>,
    /// Initial outgoing bitrate estimate in bps
    pub initial_available_outgoing_bitrate: u32,
    /// Floor for the outgoing bitrate estimate in bps
    pub minimum_available_outgoing_bitrate: u32,
    /// Incoming bitrate cap applied to every new transport, 0 to disable
    pub max_incoming_bitrate: u32,
}

impl Default for WebRtcTransportSettings {
    fn default() -> Self {
        Self {
            listen_ips: vec![ListenIp {
                ip: "0.0.0.0".to_string(),
                announced_ip: None,
            }],
            initial_available_outgoing_bitrate: 1_000_000,
            minimum_available_outgoing_bitrate: 600_000,
            max_incoming_bitrate: 1_500_000,
        }
    }
}

impl WebRtcTransportSettings {
    /// Fill in whatever the requester left out of its transport options
    pub fn apply_defaults(&self, options: Value) -> Value {
        let mut options = match options {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };

        if !options.contains_key("listenIps") {
            options.insert("listenIps".to_string(), json!(self.listen_ips));
        }
        options
            .entry("initialAvailableOutgoingBitrate")
            .or_insert_with(|| json!(self.initial_available_outgoing_bitrate));
        options
            .entry("minimumAvailableOutgoingBitrate")
            .or_insert_with(|| json!(self.minimum_available_outgoing_bitrate));

        Value::Object(options)
    }
}
