//! Media engine abstraction
//!
//! The worker never touches media itself. It drives an engine through these
//! traits and turns the engine's events into channel notifications. Every
//! parameter blob is passed through untouched.

mod loopback;

pub use loopback::{
    LoopbackAudioLevelObserver, LoopbackConsumer, LoopbackEngine, LoopbackProducer, LoopbackRouter,
    LoopbackTransport,
};

use async_trait::async_trait;
use medianode_core::ids::{ConsumerId, ProducerId, RouterId, TransportId};
use medianode_core::protocol::{AudioLevelObserverOptions, AudioVolume, ConsumerLayers, DtlsState, MediaKind};
use medianode_core::MediaNodeError;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sender handed to the engine for the events of one router tree
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// Something that happened inside the engine, scoped to one router
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Audio level observer volumes above threshold
    Volumes {
        /// Loudest producers first
        volumes: Vec<AudioVolume>,
    },
    /// Audio level observer saw only silence
    Silence,
    /// The router was closed by the engine
    RouterClosed,
    /// Transport DTLS state changed
    DtlsStateChange {
        /// Transport
        transport_id: TransportId,
        /// New state
        dtls_state: DtlsState,
    },
    /// Transport closed by the engine
    TransportClosed {
        /// Transport
        transport_id: TransportId,
    },
    /// Producer score changed
    ProducerScore {
        /// Owning transport
        transport_id: TransportId,
        /// Producer
        producer_id: ProducerId,
        /// Engine score
        score: Value,
    },
    /// Producer video orientation changed
    VideoOrientationChange {
        /// Owning transport
        transport_id: TransportId,
        /// Producer
        producer_id: ProducerId,
        /// Engine video orientation
        video_orientation: Value,
    },
    /// Producer closed by the engine
    ProducerClosed {
        /// Owning transport
        transport_id: TransportId,
        /// Producer
        producer_id: ProducerId,
    },
    /// The consumer's transport closed
    ConsumerTransportClosed {
        /// Owning transport
        transport_id: TransportId,
        /// Consumer
        consumer_id: ConsumerId,
    },
    /// The consumer's producer closed
    ConsumerProducerClosed {
        /// Owning transport
        transport_id: TransportId,
        /// Consumer
        consumer_id: ConsumerId,
    },
    /// The consumer's producer paused
    ConsumerProducerPaused {
        /// Owning transport
        transport_id: TransportId,
        /// Consumer
        consumer_id: ConsumerId,
    },
    /// The consumer's producer resumed
    ConsumerProducerResumed {
        /// Owning transport
        transport_id: TransportId,
        /// Consumer
        consumer_id: ConsumerId,
    },
    /// Consumer score changed
    ConsumerScore {
        /// Owning transport
        transport_id: TransportId,
        /// Consumer
        consumer_id: ConsumerId,
        /// Engine score
        score: Value,
    },
    /// Consumer layers changed
    ConsumerLayersChange {
        /// Owning transport
        transport_id: TransportId,
        /// Consumer
        consumer_id: ConsumerId,
        /// New layers, `None` when nothing is sent
        layers: Option<ConsumerLayers>,
    },
    /// Consumer closed by the engine
    ConsumerClosed {
        /// Owning transport
        transport_id: TransportId,
        /// Consumer
        consumer_id: ConsumerId,
    },
}

impl EngineEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::Volumes { .. } => "volumes",
            EngineEvent::Silence => "silence",
            EngineEvent::RouterClosed => "router_closed",
            EngineEvent::DtlsStateChange { .. } => "dtls_state_change",
            EngineEvent::TransportClosed { .. } => "transport_closed",
            EngineEvent::ProducerScore { .. } => "producer_score",
            EngineEvent::VideoOrientationChange { .. } => "video_orientation_change",
            EngineEvent::ProducerClosed { .. } => "producer_closed",
            EngineEvent::ConsumerTransportClosed { .. } => "consumer_transport_closed",
            EngineEvent::ConsumerProducerClosed { .. } => "consumer_producer_closed",
            EngineEvent::ConsumerProducerPaused { .. } => "consumer_producer_paused",
            EngineEvent::ConsumerProducerResumed { .. } => "consumer_producer_resumed",
            EngineEvent::ConsumerScore { .. } => "consumer_score",
            EngineEvent::ConsumerLayersChange { .. } => "consumer_layers_change",
            EngineEvent::ConsumerClosed { .. } => "consumer_closed",
        }
    }
}

/// Factory of engine routers
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Create a router; its whole tree reports events through `events`
    async fn create_router(
        &self,
        media_codecs: Value,
        events: EngineEventSender,
    ) -> Result<Arc<dyn EngineRouter>, MediaNodeError>;
}

/// Engine router
#[async_trait]
pub trait EngineRouter: Send + Sync {
    /// Identifier minted by the engine
    fn id(&self) -> RouterId;

    /// RTP capabilities derived from the router's media codecs
    fn rtp_capabilities(&self) -> Value;

    /// Whether `producer_id` can be consumed by an endpoint with `rtp_capabilities`
    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &Value) -> bool;

    /// Create a WebRTC transport
    async fn create_webrtc_transport(
        &self,
        options: Value,
    ) -> Result<Arc<dyn EngineTransport>, MediaNodeError>;

    /// Create an audio level observer
    async fn create_audio_level_observer(
        &self,
        options: AudioLevelObserverOptions,
    ) -> Result<Arc<dyn EngineAudioLevelObserver>, MediaNodeError>;

    /// Close the router and everything it owns
    fn close(&self);
}

/// Engine WebRTC transport
#[async_trait]
pub trait EngineTransport: Send + Sync {
    /// Identifier minted by the engine
    fn id(&self) -> TransportId;
    /// Local ICE parameters
    fn ice_parameters(&self) -> Value;
    /// Local ICE candidates
    fn ice_candidates(&self) -> Value;
    /// Local DTLS parameters
    fn dtls_parameters(&self) -> Value;
    /// Application data given at creation
    fn app_data(&self) -> Value;

    /// Provide the remote DTLS parameters
    async fn connect(&self, dtls_parameters: Value) -> Result<(), MediaNodeError>;
    /// Cap the incoming bitrate
    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), MediaNodeError>;
    /// Restart ICE and return the new local ICE parameters
    async fn restart_ice(&self) -> Result<Value, MediaNodeError>;
    /// Start receiving media
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<Arc<dyn EngineProducer>, MediaNodeError>;
    /// Start sending the media of `producer_id`
    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: Value,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>, MediaNodeError>;
    /// Engine statistics
    async fn get_stats(&self) -> Result<Value, MediaNodeError>;

    /// Close the transport with its producers and consumers
    fn close(&self);
}

/// Engine producer
#[async_trait]
pub trait EngineProducer: Send + Sync {
    /// Identifier minted by the engine
    fn id(&self) -> ProducerId;
    /// Media kind
    fn kind(&self) -> MediaKind;
    /// Pause
    async fn pause(&self) -> Result<(), MediaNodeError>;
    /// Resume
    async fn resume(&self) -> Result<(), MediaNodeError>;
    /// Engine statistics
    async fn get_stats(&self) -> Result<Value, MediaNodeError>;
    /// Close
    fn close(&self);
}

/// Engine consumer
#[async_trait]
pub trait EngineConsumer: Send + Sync {
    /// Identifier minted by the engine
    fn id(&self) -> ConsumerId;
    /// Consumed producer
    fn producer_id(&self) -> ProducerId;
    /// Media kind
    fn kind(&self) -> MediaKind;
    /// Negotiated RTP parameters
    fn rtp_parameters(&self) -> Value;
    /// Consumer type (simple, simulcast, svc, pipe)
    fn consumer_type(&self) -> String;
    /// Whether the consumer is paused
    fn paused(&self) -> bool;
    /// Whether the consumed producer is paused
    fn producer_paused(&self) -> bool;
    /// Current score
    fn score(&self) -> Value;

    /// Pause
    async fn pause(&self) -> Result<(), MediaNodeError>;
    /// Resume
    async fn resume(&self) -> Result<(), MediaNodeError>;
    /// Choose the layers to forward
    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> Result<(), MediaNodeError>;
    /// Set bandwidth priority
    async fn set_priority(&self, priority: u8) -> Result<(), MediaNodeError>;
    /// Ask the producer endpoint for a key frame
    async fn request_key_frame(&self) -> Result<(), MediaNodeError>;
    /// Engine statistics
    async fn get_stats(&self) -> Result<Value, MediaNodeError>;
    /// Close
    fn close(&self);
}

/// Engine audio level observer
#[async_trait]
pub trait EngineAudioLevelObserver: Send + Sync {
    /// Start observing an audio producer
    async fn add_producer(&self, producer_id: ProducerId) -> Result<(), MediaNodeError>;
    /// Close
    fn close(&self);
}
