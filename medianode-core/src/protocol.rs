//! Control channel wire protocol
//!
//! Every frame is a JSON text message tagged by `type`. Requests expect exactly
//! one response carrying the same `id`; notifications never get a reply.
//! `internal` holds the identifiers that address the target resource and
//! `data` holds the method payload.

use crate::ids::{ConsumerId, ProducerId, RouterId, TransportId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Header carrying the pre-shared secret during the WebSocket handshake
pub const SECRET_HEADER: &str = "x-medianode-secret";

/// Request and notification method names
pub mod method {
    /// Free capacity of the media node
    pub const FREE: &str = "free";
    /// Create a router on a worker
    pub const CREATE_ROUTER: &str = "createRouter";
    /// Create the router's audio level observer
    pub const CREATE_AUDIO_LEVEL_OBSERVER: &str = "createAudioLevelObserver";
    /// Router RTP capabilities
    pub const GET_RTP_CAPABILITIES: &str = "getRtpCapabilities";
    /// Create a WebRTC transport
    pub const CREATE_WEBRTC_TRANSPORT: &str = "createWebRtcTransport";
    /// Check whether a producer can be consumed
    pub const CAN_CONSUME: &str = "canConsume";
    /// Add a producer to the audio level observer
    pub const ADD_PRODUCER: &str = "addProducer";
    /// Cap incoming bitrate on a transport
    pub const SET_MAX_INCOMING_BITRATE: &str = "setMaxIncomingBitrate";
    /// Provide remote DTLS parameters
    pub const CONNECT: &str = "connect";
    /// Restart ICE on a transport
    pub const RESTART_ICE: &str = "restartIce";
    /// Create a producer
    pub const PRODUCE: &str = "produce";
    /// Create a consumer
    pub const CONSUME: &str = "consume";
    /// Engine statistics
    pub const GET_STATS: &str = "getStats";
    /// Pause a stream
    pub const PAUSE: &str = "pause";
    /// Resume a stream
    pub const RESUME: &str = "resume";
    /// Set consumer preferred layers
    pub const SET_PREFERRED_LAYERS: &str = "setPreferredLayers";
    /// Set consumer priority
    pub const SET_PRIORITY: &str = "setPriority";
    /// Request a key frame
    pub const REQUEST_KEY_FRAME: &str = "requestKeyFrame";
    /// Close the addressed resource
    pub const CLOSE: &str = "close";
    /// Audio volumes above threshold
    pub const VOLUMES: &str = "volumes";
    /// All observed producers silent
    pub const SILENCE: &str = "silence";
    /// Transport DTLS state changed
    pub const DTLS_STATE_CHANGE: &str = "dtlsstatechange";
    /// Stream score changed
    pub const SCORE: &str = "score";
    /// Producer video orientation changed
    pub const VIDEO_ORIENTATION_CHANGE: &str = "videoorientationchange";
    /// Consumer's transport closed
    pub const TRANSPORT_CLOSE: &str = "transportclose";
    /// Consumer's producer closed
    pub const PRODUCER_CLOSE: &str = "producerclose";
    /// Consumer's producer paused
    pub const PRODUCER_PAUSE: &str = "producerpause";
    /// Consumer's producer resumed
    pub const PRODUCER_RESUME: &str = "producerresume";
    /// Consumer layers changed
    pub const LAYERS_CHANGE: &str = "layerschange";
}

/// Which handler a message is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Target {
    /// The media node process itself
    MediaNode,
    /// Router factory of the worker
    Worker,
    /// A router
    Router,
    /// A router's audio level observer
    Audio,
    /// A transport
    Transport,
    /// A producer
    Producer,
    /// A consumer
    Consumer,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Target::MediaNode => "mediaNode",
            Target::Worker => "worker",
            Target::Router => "router",
            Target::Audio => "audio",
            Target::Transport => "transport",
            Target::Producer => "producer",
            Target::Consumer => "consumer",
        };
        f.write_str(name)
    }
}

/// Identifiers addressing a resource in the router tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Internal {
    /// Owning router
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_id: Option<RouterId>,
    /// Owning transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<TransportId>,
    /// Addressed producer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_id: Option<ProducerId>,
    /// Addressed consumer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<ConsumerId>,
}

impl Internal {
    /// Scope of a router
    pub fn router(router_id: RouterId) -> Self {
        Self {
            router_id: Some(router_id),
            ..Default::default()
        }
    }

    /// Scope of a transport
    pub fn transport(router_id: RouterId, transport_id: TransportId) -> Self {
        Self {
            router_id: Some(router_id),
            transport_id: Some(transport_id),
            ..Default::default()
        }
    }

    /// Scope of a producer
    pub fn producer(router_id: RouterId, transport_id: TransportId, producer_id: ProducerId) -> Self {
        Self {
            router_id: Some(router_id),
            transport_id: Some(transport_id),
            producer_id: Some(producer_id),
            consumer_id: None,
        }
    }

    /// Scope of a consumer
    pub fn consumer(router_id: RouterId, transport_id: TransportId, consumer_id: ConsumerId) -> Self {
        Self {
            router_id: Some(router_id),
            transport_id: Some(transport_id),
            producer_id: None,
            consumer_id: Some(consumer_id),
        }
    }
}

/// Wire error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Addressed resource does not exist
    NotFound,
    /// Method unknown for the target
    UnsupportedMethod,
    /// Payload could not be decoded
    InvalidMessage,
    /// Engine operation failed
    EngineError,
    /// Anything else
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::UnsupportedMethod => "UNSUPPORTED_METHOD",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::EngineError => "ENGINE_ERROR",
            ErrorCode::Internal => "INTERNAL",
        };
        f.write_str(code)
    }
}

/// Structured failure carried by a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestError {
    /// Machine readable code
    pub code: ErrorCode,
    /// Human readable reason
    pub reason: String,
}

/// A single frame on the control channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireMessage {
    /// Request expecting exactly one response
    Request {
        /// Correlation id, unique per channel and direction
        id: u32,
        /// Addressed handler
        target: Target,
        /// Method name
        method: String,
        /// Resource scope
        #[serde(default)]
        internal: Internal,
        /// Method payload
        #[serde(default)]
        data: Value,
    },
    /// Reply to a request
    Response {
        /// Id of the request being answered
        id: u32,
        /// Failure, when the request was rejected
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RequestError>,
        /// Result payload
        #[serde(default)]
        data: Value,
    },
    /// One-way message
    Notification {
        /// Addressed handler
        target: Target,
        /// Method name
        method: String,
        /// Resource scope
        #[serde(default)]
        internal: Internal,
        /// Method payload
        #[serde(default)]
        data: Value,
    },
}

/// Decode a method payload
pub fn decode<T: DeserializeOwned>(data: Value) -> Result<T, crate::MediaNodeError> {
    // Methods without payload may legitimately send null
    let data = if data.is_null() {
        Value::Object(Default::default())
    } else {
        data
    };
    Ok(serde_json::from_value(data)?)
}

/// Encode a method payload
pub fn encode<T: Serialize>(payload: &T) -> Result<Value, crate::MediaNodeError> {
    Ok(serde_json::to_value(payload)?)
}

/// Media kind of a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio stream
    Audio,
    /// Video stream
    Video,
}

/// DTLS state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    /// No DTLS yet
    New,
    /// Handshake in progress
    Connecting,
    /// Handshake complete
    Connected,
    /// Handshake failed
    Failed,
    /// Closed by either side
    Closed,
}

/// Current spatial and temporal layers of a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    /// Spatial layer
    pub spatial_layer: u8,
    /// Temporal layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal_layer: Option<u8>,
}

/// Volume of a single producer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioVolume {
    /// Observed producer
    pub producer_id: ProducerId,
    /// Average volume in dBvo
    pub volume: i8,
}

/// `free` response
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FreeResponse {
    /// Free capacity in percent
    pub free: f64,
}

/// `createRouter` request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRouterRequest {
    /// Router media codecs, opaque to the control plane. Null selects the
    /// media node's configured defaults.
    #[serde(default)]
    pub media_codecs: Value,
}

/// `createRouter` response
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CreateRouterResponse {
    /// Identifier of the new router
    pub id: RouterId,
}

/// `createAudioLevelObserver` request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioLevelObserverOptions {
    /// Maximum number of entries in a `volumes` event
    pub max_entries: u16,
    /// Minimum average volume in dBvo to be reported
    pub threshold: i8,
    /// Reporting interval in milliseconds
    pub interval: u32,
}

impl Default for AudioLevelObserverOptions {
    fn default() -> Self {
        Self {
            max_entries: 1,
            threshold: -80,
            interval: 800,
        }
    }
}

/// `getRtpCapabilities` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilitiesResponse {
    /// Router RTP capabilities
    pub rtp_capabilities: Value,
}

/// `createWebRtcTransport` request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebRtcTransportRequest {
    /// Engine transport options
    pub web_rtc_transport_options: Value,
}

/// `createWebRtcTransport` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportData {
    /// Identifier of the new transport
    pub id: TransportId,
    /// Local ICE parameters
    pub ice_parameters: Value,
    /// Local ICE candidates
    pub ice_candidates: Value,
    /// Local DTLS parameters
    pub dtls_parameters: Value,
    /// Application data
    #[serde(default)]
    pub app_data: Value,
}

/// `canConsume` request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanConsumeRequest {
    /// Producer to consume
    pub producer_id: ProducerId,
    /// Consuming endpoint capabilities
    pub rtp_capabilities: Value,
}

/// `canConsume` response
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanConsumeResponse {
    /// Whether the producer can be consumed
    pub can_consume: bool,
}

/// `addProducer` request
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddProducerRequest {
    /// Producer to observe
    pub producer_id: ProducerId,
}

/// `setMaxIncomingBitrate` request
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetMaxIncomingBitrateRequest {
    /// Bitrate in bps
    pub max_incoming_bitrate: u32,
}

/// `connect` request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    /// Remote DTLS parameters
    pub dtls_parameters: Value,
}

/// `restartIce` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartIceResponse {
    /// New local ICE parameters
    pub ice_parameters: Value,
}

/// `produce` request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    /// Media kind
    pub kind: MediaKind,
    /// RTP parameters
    pub rtp_parameters: Value,
    /// Application data
    #[serde(default)]
    pub app_data: Value,
}

/// `produce` response
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProduceResponse {
    /// Identifier of the new producer
    pub id: ProducerId,
}

/// `consume` request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    /// Producer to consume
    pub producer_id: ProducerId,
    /// Consuming endpoint capabilities
    pub rtp_capabilities: Value,
    /// Start paused
    #[serde(default)]
    pub paused: bool,
}

/// `consume` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    /// Identifier of the new consumer
    pub id: ConsumerId,
    /// Consumed producer
    pub producer_id: ProducerId,
    /// Media kind
    pub kind: MediaKind,
    /// RTP parameters
    pub rtp_parameters: Value,
    /// Consumer type (simple, simulcast, svc, pipe)
    #[serde(rename = "type")]
    pub consumer_type: String,
    /// Whether the consumer starts paused
    #[serde(default)]
    pub paused: bool,
    /// Whether the producer is paused
    pub producer_paused: bool,
    /// Initial score
    #[serde(default)]
    pub score: Value,
    /// Application data
    #[serde(default)]
    pub app_data: Value,
}

/// `getStats` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    /// Engine statistics
    pub stats: Value,
}

/// `setPreferredLayers` request
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPreferredLayersRequest {
    /// Preferred spatial layer
    pub spatial_layer: u8,
    /// Preferred temporal layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal_layer: Option<u8>,
}

/// `setPriority` request
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SetPriorityRequest {
    /// Priority, 1 to 255
    pub priority: u8,
}

/// `volumes` notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumesNotification {
    /// Producers above the threshold, loudest first
    pub volumes: Vec<AudioVolume>,
}

/// `dtlsstatechange` notification
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsStateChangeNotification {
    /// New DTLS state
    pub dtls_state: DtlsState,
}

/// `score` notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreNotification {
    /// Engine score, opaque to the control plane
    pub score: Value,
}

/// `videoorientationchange` notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoOrientationNotification {
    /// Engine video orientation
    pub video_orientation: Value,
}

/// `layerschange` notification
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LayersChangeNotification {
    /// New layers, absent when no layer is being sent
    #[serde(default)]
    pub layers: Option<ConsumerLayers>,
}
