//! Proxy of a consumer hosted on a media node

use crate::event::{CloseOrigin, ConsumerEvent, EventEmitter, EventStream};
use crate::relay::{EventRelay, NotificationSink, ResourceKey};
use crate::rpc::RpcClient;
use crate::state::{ResourceState, StateCell};
use crate::transport::TransportInner;
use medianode_core::protocol::{
    decode, method, ConsumeResponse, ConsumerLayers, LayersChangeNotification, ScoreNotification,
    SetPreferredLayersRequest, SetPriorityRequest, StatsResponse,
};
use medianode_core::{ConsumerId, MediaKind, ProducerId, TransportId};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Media flowing out of a media node to an endpoint
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

pub(crate) struct ConsumerInner {
    id: ConsumerId,
    producer_id: ProducerId,
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: Value,
    consumer_type: String,
    app_data: Value,
    rpc: RpcClient,
    relay: Arc<EventRelay>,
    transport: Weak<TransportInner>,
    state: StateCell,
    producer_paused: Mutex<bool>,
    score: Mutex<Value>,
    layers: Mutex<Option<ConsumerLayers>>,
    events: EventEmitter<ConsumerEvent>,
}

impl Consumer {
    pub(crate) fn new(
        reply: ConsumeResponse,
        rpc: RpcClient,
        relay: Arc<EventRelay>,
        transport: &Arc<TransportInner>,
    ) -> Self {
        let initial = if reply.paused {
            ResourceState::Paused
        } else {
            ResourceState::Active
        };

        let inner = Arc::new(ConsumerInner {
            id: reply.id,
            producer_id: reply.producer_id,
            transport_id: transport.id(),
            kind: reply.kind,
            rtp_parameters: reply.rtp_parameters,
            consumer_type: reply.consumer_type,
            app_data: reply.app_data,
            rpc,
            relay,
            transport: Arc::downgrade(transport),
            state: StateCell::new(initial),
            producer_paused: Mutex::new(reply.producer_paused),
            score: Mutex::new(reply.score),
            layers: Mutex::new(None),
            events: EventEmitter::new(),
        });

        let weak: Weak<ConsumerInner> = Arc::downgrade(&inner);
        let sink: Weak<dyn NotificationSink> = weak;
        inner.relay.register(ResourceKey::Consumer(inner.id), sink);
        Self { inner }
    }

    /// Identifier assigned by the media node
    pub fn id(&self) -> ConsumerId {
        self.inner.id
    }

    /// Consumed producer
    pub fn producer_id(&self) -> ProducerId {
        self.inner.producer_id
    }

    /// Owning transport
    pub fn transport_id(&self) -> TransportId {
        self.inner.transport_id
    }

    /// Media kind
    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    /// RTP parameters negotiated by the media node
    pub fn rtp_parameters(&self) -> &Value {
        &self.inner.rtp_parameters
    }

    /// Consumer type (simple, simulcast, svc, pipe)
    pub fn consumer_type(&self) -> &str {
        &self.inner.consumer_type
    }

    /// Application data
    pub fn app_data(&self) -> &Value {
        &self.inner.app_data
    }

    /// Lifecycle state
    pub fn state(&self) -> ResourceState {
        self.inner.state.get()
    }

    /// Whether the consumer itself is paused
    pub fn paused(&self) -> bool {
        self.state() == ResourceState::Paused
    }

    /// Whether the consumer is gone
    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Whether the consumed producer is paused, as last reported
    pub fn producer_paused(&self) -> bool {
        *self.inner.producer_paused.lock()
    }

    /// Last score reported by the media node
    pub fn score(&self) -> Value {
        self.inner.score.lock().clone()
    }

    /// Layers currently forwarded, as last reported
    pub fn current_layers(&self) -> Option<ConsumerLayers> {
        *self.inner.layers.lock()
    }

    /// Subscribe to this consumer's events
    pub fn events(&self) -> EventStream<ConsumerEvent> {
        self.inner.events.subscribe()
    }

    /// Pause the consumer
    pub async fn pause(&self) {
        if self.is_closed() {
            debug!("pause() on closed consumer {}", self.id());
            return;
        }
        if self.inner.rpc.execute(method::PAUSE, &json!({})).await {
            self.inner.state.transition(ResourceState::Paused);
        }
    }

    /// Resume the consumer
    pub async fn resume(&self) {
        if self.is_closed() {
            debug!("resume() on closed consumer {}", self.id());
            return;
        }
        if self.inner.rpc.execute(method::RESUME, &json!({})).await {
            self.inner.state.transition(ResourceState::Active);
        }
    }

    /// Choose the spatial and temporal layers to forward
    pub async fn set_preferred_layers(&self, spatial_layer: u8, temporal_layer: Option<u8>) {
        let request = SetPreferredLayersRequest {
            spatial_layer,
            temporal_layer,
        };
        self.inner
            .rpc
            .execute(method::SET_PREFERRED_LAYERS, &request)
            .await;
    }

    /// Set the bandwidth priority, 1 to 255
    pub async fn set_priority(&self, priority: u8) {
        self.inner
            .rpc
            .execute(method::SET_PRIORITY, &SetPriorityRequest { priority })
            .await;
    }

    /// Ask the sending endpoint for a key frame
    pub async fn request_key_frame(&self) {
        self.inner
            .rpc
            .execute(method::REQUEST_KEY_FRAME, &json!({}))
            .await;
    }

    /// Engine statistics
    pub async fn get_stats(&self) -> Option<Value> {
        self.inner
            .rpc
            .request::<StatsResponse, _>(method::GET_STATS, &json!({}))
            .await
            .map(|reply| reply.stats)
    }

    /// Close the consumer on the media node and locally
    pub fn close(&self) {
        if !self.inner.state.close() {
            return;
        }
        debug!("Closing consumer {}", self.id());
        self.inner.rpc.notify(method::CLOSE, json!({}));
        self.inner.finish(CloseOrigin::Local);
    }

    pub(crate) fn close_silently(&self, origin: CloseOrigin) {
        self.inner.close_silently(origin);
    }
}

impl ConsumerInner {
    fn close_silently(&self, origin: CloseOrigin) {
        if self.state.close() {
            self.finish(origin);
        }
    }

    fn finish(&self, origin: CloseOrigin) {
        self.relay.unregister(ResourceKey::Consumer(self.id));
        if let Some(transport) = self.transport.upgrade() {
            transport.forget_consumer(self.id);
        }

        debug!("Consumer {} closed ({})", self.id, origin);
        self.events.emit(ConsumerEvent::Closed { origin });
        self.events.finish();
    }

    fn set_producer_paused(&self, paused: bool) {
        *self.producer_paused.lock() = paused;
        self.events.emit(if paused {
            ConsumerEvent::ProducerPause
        } else {
            ConsumerEvent::ProducerResume
        });
    }
}

impl NotificationSink for ConsumerInner {
    fn on_notification(&self, method: &str, data: Value) {
        if self.state.get().is_closed() {
            return;
        }

        match method {
            method::PRODUCER_PAUSE => self.set_producer_paused(true),
            method::PRODUCER_RESUME => self.set_producer_paused(false),
            method::SCORE => match decode::<ScoreNotification>(data) {
                Ok(ScoreNotification { score }) => {
                    *self.score.lock() = score.clone();
                    self.events.emit(ConsumerEvent::Score { score });
                }
                Err(e) => warn!("Bad score for consumer {}: {}", self.id, e),
            },
            method::LAYERS_CHANGE => match decode::<LayersChangeNotification>(data) {
                Ok(LayersChangeNotification { layers }) => {
                    *self.layers.lock() = layers;
                    self.events.emit(ConsumerEvent::LayersChange { layers });
                }
                Err(e) => warn!("Bad layers for consumer {}: {}", self.id, e),
            },
            method::TRANSPORT_CLOSE => self.close_silently(CloseOrigin::TransportClosed),
            method::PRODUCER_CLOSE => self.close_silently(CloseOrigin::ProducerClosed),
            method::CLOSE => self.close_silently(CloseOrigin::Remote),
            other => debug!("Ignoring consumer notification \"{}\"", other),
        }
    }

    fn on_channel_closed(&self) {
        self.close_silently(CloseOrigin::ChannelClosed);
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.inner.id)
            .field("producer_id", &self.inner.producer_id)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}
