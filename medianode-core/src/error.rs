//! Error types for the media node control plane

use crate::protocol::{ErrorCode, RequestError, Target};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Kind of resource addressed by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Top-level routing context
    Router,
    /// ICE/DTLS endpoint
    Transport,
    /// Inbound media stream
    Producer,
    /// Outbound media stream
    Consumer,
    /// Router-scoped audio level subscription
    AudioLevelObserver,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Router => "router",
            ResourceKind::Transport => "transport",
            ResourceKind::Producer => "producer",
            ResourceKind::Consumer => "consumer",
            ResourceKind::AudioLevelObserver => "audio level observer",
        };
        f.write_str(name)
    }
}

/// Main error type for media node operations
#[derive(Error, Debug)]
pub enum MediaNodeError {
    /// Could not open the channel to a worker
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed {
        /// Worker address
        address: String,
        /// Reason for connection failure
        reason: String,
    },

    /// The worker refused the handshake
    #[error("Handshake rejected by {address}")]
    HandshakeRejected {
        /// Worker address
        address: String,
    },

    /// The channel dropped before a reply arrived
    #[error("Channel closed")]
    ChannelClosed,

    /// No reply within the request window
    #[error("Request {method} timed out after {duration:?}")]
    Timeout {
        /// Method of the request that timed out
        method: String,
        /// Duration after which timeout occurred
        duration: Duration,
    },

    /// The addressed resource does not exist on the worker
    #[error("No such {kind}: {id}")]
    NotFound {
        /// Resource kind
        kind: ResourceKind,
        /// Identifier that was not found
        id: String,
    },

    /// The media engine operation itself failed
    #[error("Engine error: {reason}")]
    Engine {
        /// Reason reported by the engine
        reason: String,
    },

    /// Unknown method for the given target
    #[error("Unsupported method \"{method}\" for {target}")]
    UnsupportedMethod {
        /// Request target
        target: Target,
        /// Method name
        method: String,
    },

    /// Malformed message or payload
    #[error("Invalid message: {reason}")]
    InvalidMessage {
        /// Reason the message was rejected
        reason: String,
    },

    /// Error reported by the remote side of a channel
    #[error("Request rejected ({code}): {reason}")]
    Rejected {
        /// Wire error code
        code: ErrorCode,
        /// Reason reported by the remote side
        reason: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Reason the configuration was rejected
        reason: String,
    },

    /// No worker configured to host a router
    #[error("No media nodes configured")]
    NoWorkers,

    /// Server start failed
    #[error("Failed to start server on {address}: {source}")]
    ServerStartFailed {
        /// Address that failed to bind
        address: std::net::SocketAddr,
        /// Underlying error
        source: std::io::Error,
    },
}

impl MediaNodeError {
    /// Get error code for programmatic handling
    pub fn error_code(&self) -> String {
        match self {
            MediaNodeError::ConnectionFailed { .. } => "CONNECTION_FAILED".to_string(),
            MediaNodeError::HandshakeRejected { .. } => "HANDSHAKE_REJECTED".to_string(),
            MediaNodeError::ChannelClosed => "CHANNEL_CLOSED".to_string(),
            MediaNodeError::Timeout { .. } => "TIMEOUT".to_string(),
            MediaNodeError::NotFound { .. } => "NOT_FOUND".to_string(),
            MediaNodeError::Engine { .. } => "ENGINE_ERROR".to_string(),
            MediaNodeError::UnsupportedMethod { .. } => "UNSUPPORTED_METHOD".to_string(),
            MediaNodeError::InvalidMessage { .. } => "INVALID_MESSAGE".to_string(),
            MediaNodeError::Rejected { code, .. } => code.to_string(),
            MediaNodeError::InvalidConfiguration { .. } => "INVALID_CONFIGURATION".to_string(),
            MediaNodeError::NoWorkers => "NO_WORKERS".to_string(),
            MediaNodeError::ServerStartFailed { .. } => "SERVER_START_FAILED".to_string(),
        }
    }

    /// Whether the error means the channel is unusable
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            MediaNodeError::ConnectionFailed { .. }
                | MediaNodeError::HandshakeRejected { .. }
                | MediaNodeError::ChannelClosed
        )
    }

    /// Whether the error is a missing resource, locally or as reported by a worker
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            MediaNodeError::NotFound { .. }
                | MediaNodeError::Rejected {
                    code: ErrorCode::NotFound,
                    ..
                }
        )
    }

    /// Shorthand for a not-found error
    pub fn not_found(kind: ResourceKind, id: impl fmt::Display) -> Self {
        MediaNodeError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Shorthand for an engine failure
    pub fn engine(reason: impl Into<String>) -> Self {
        MediaNodeError::Engine {
            reason: reason.into(),
        }
    }

    /// Wire representation sent back to a requester
    pub fn to_request_error(&self) -> RequestError {
        let code = match self {
            MediaNodeError::NotFound { .. } => ErrorCode::NotFound,
            MediaNodeError::UnsupportedMethod { .. } => ErrorCode::UnsupportedMethod,
            MediaNodeError::InvalidMessage { .. } => ErrorCode::InvalidMessage,
            MediaNodeError::Engine { .. } => ErrorCode::EngineError,
            MediaNodeError::Rejected { code, .. } => *code,
            _ => ErrorCode::Internal,
        };

        RequestError {
            code,
            reason: self.to_string(),
        }
    }
}

impl From<RequestError> for MediaNodeError {
    fn from(error: RequestError) -> Self {
        MediaNodeError::Rejected {
            code: error.code,
            reason: error.reason,
        }
    }
}

impl From<serde_json::Error> for MediaNodeError {
    fn from(error: serde_json::Error) -> Self {
        MediaNodeError::InvalidMessage {
            reason: error.to_string(),
        }
    }
}
