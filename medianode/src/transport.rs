//! Proxy of a WebRTC transport hosted on a media node

use crate::consumer::Consumer;
use crate::event::{CloseOrigin, EventEmitter, EventStream, TransportEvent};
use crate::producer::Producer;
use crate::relay::{EventRelay, NotificationSink, ResourceKey};
use crate::router::RouterInner;
use crate::rpc::RpcClient;
use crate::state::{ResourceState, StateCell};
use medianode_core::protocol::{
    decode, method, ConnectRequest, ConsumeRequest, ConsumeResponse, DtlsState,
    DtlsStateChangeNotification, ProduceRequest, ProduceResponse, RestartIceResponse,
    SetMaxIncomingBitrateRequest, StatsResponse, WebRtcTransportData,
};
use medianode_core::{
    ConsumerId, Internal, MediaKind, ProducerId, RouterId, Target, TransportId,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// ICE/DTLS endpoint on a media node, owning producers and consumers
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

pub(crate) struct TransportInner {
    id: TransportId,
    router_id: RouterId,
    ice_parameters: Mutex<Value>,
    ice_candidates: Value,
    dtls_parameters: Value,
    app_data: Value,
    rpc: RpcClient,
    relay: Arc<EventRelay>,
    router: Weak<RouterInner>,
    state: StateCell,
    dtls_state: Mutex<Option<DtlsState>>,
    producers: Mutex<HashMap<ProducerId, Producer>>,
    consumers: Mutex<HashMap<ConsumerId, Consumer>>,
    events: EventEmitter<TransportEvent>,
}

impl Transport {
    pub(crate) fn new(
        data: WebRtcTransportData,
        rpc: RpcClient,
        relay: Arc<EventRelay>,
        router: &Arc<RouterInner>,
    ) -> Self {
        let inner = Arc::new(TransportInner {
            id: data.id,
            router_id: router.id(),
            ice_parameters: Mutex::new(data.ice_parameters),
            ice_candidates: data.ice_candidates,
            dtls_parameters: data.dtls_parameters,
            app_data: data.app_data,
            rpc,
            relay,
            router: Arc::downgrade(router),
            state: StateCell::new(ResourceState::Created),
            dtls_state: Mutex::new(None),
            producers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            events: EventEmitter::new(),
        });

        let weak: Weak<TransportInner> = Arc::downgrade(&inner);
        let sink: Weak<dyn NotificationSink> = weak;
        inner.relay.register(ResourceKey::Transport(inner.id), sink);
        Self { inner }
    }

    /// Identifier assigned by the media node
    pub fn id(&self) -> TransportId {
        self.inner.id
    }

    /// Owning router
    pub fn router_id(&self) -> RouterId {
        self.inner.router_id
    }

    /// Local ICE parameters, refreshed by [`Transport::restart_ice`]
    pub fn ice_parameters(&self) -> Value {
        self.inner.ice_parameters.lock().clone()
    }

    /// Local ICE candidates
    pub fn ice_candidates(&self) -> &Value {
        &self.inner.ice_candidates
    }

    /// Local DTLS parameters
    pub fn dtls_parameters(&self) -> &Value {
        &self.inner.dtls_parameters
    }

    /// Application data given at creation
    pub fn app_data(&self) -> &Value {
        &self.inner.app_data
    }

    /// Lifecycle state; `Active` once connected
    pub fn state(&self) -> ResourceState {
        self.inner.state.get()
    }

    /// Whether the transport is gone
    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Last DTLS state reported by the media node
    pub fn dtls_state(&self) -> Option<DtlsState> {
        *self.inner.dtls_state.lock()
    }

    /// Live producer by id
    pub fn producer(&self, id: ProducerId) -> Option<Producer> {
        self.inner.producers.lock().get(&id).cloned()
    }

    /// Live consumer by id
    pub fn consumer(&self, id: ConsumerId) -> Option<Consumer> {
        self.inner.consumers.lock().get(&id).cloned()
    }

    /// Number of live producers
    pub fn producer_count(&self) -> usize {
        self.inner.producers.lock().len()
    }

    /// Number of live consumers
    pub fn consumer_count(&self) -> usize {
        self.inner.consumers.lock().len()
    }

    /// Subscribe to this transport's events
    pub fn events(&self) -> EventStream<TransportEvent> {
        self.inner.events.subscribe()
    }

    /// Provide the remote DTLS parameters
    pub async fn connect(&self, dtls_parameters: Value) {
        if self.is_closed() {
            debug!("connect() on closed transport {}", self.id());
            return;
        }
        let request = ConnectRequest { dtls_parameters };
        if self.inner.rpc.execute(method::CONNECT, &request).await {
            self.inner.state.transition(ResourceState::Active);
        }
    }

    /// Cap the bitrate the media node accepts from the endpoint
    pub async fn set_max_incoming_bitrate(&self, bitrate: u32) {
        let request = SetMaxIncomingBitrateRequest {
            max_incoming_bitrate: bitrate,
        };
        self.inner
            .rpc
            .execute(method::SET_MAX_INCOMING_BITRATE, &request)
            .await;
    }

    /// Restart ICE and return the new local ICE parameters
    pub async fn restart_ice(&self) -> Option<Value> {
        let reply: RestartIceResponse = self
            .inner
            .rpc
            .request(method::RESTART_ICE, &json!({}))
            .await?;
        *self.inner.ice_parameters.lock() = reply.ice_parameters.clone();
        Some(reply.ice_parameters)
    }

    /// Start receiving media from the endpoint
    pub async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Option<Producer> {
        if self.is_closed() {
            warn!("produce() on closed transport {}", self.id());
            return None;
        }

        let request = ProduceRequest {
            kind,
            rtp_parameters,
            app_data: app_data.clone(),
        };
        let reply: ProduceResponse = self.inner.rpc.request(method::PRODUCE, &request).await?;

        let rpc = self.inner.rpc.scoped(
            Target::Producer,
            Internal::producer(self.inner.router_id, self.inner.id, reply.id),
        );
        let producer = Producer::new(
            reply.id,
            kind,
            app_data,
            rpc,
            Arc::clone(&self.inner.relay),
            &self.inner,
        );

        self.inner
            .producers
            .lock()
            .insert(producer.id(), producer.clone());
        if self.is_closed() {
            producer.close_silently(CloseOrigin::Parent);
        }
        info!("Producer {} ({:?}) created on transport {}", producer.id(), kind, self.id());
        Some(producer)
    }

    /// Start sending the media of `producer_id` to the endpoint
    pub async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: Value,
        paused: bool,
    ) -> Option<Consumer> {
        if self.is_closed() {
            warn!("consume() on closed transport {}", self.id());
            return None;
        }

        let request = ConsumeRequest {
            producer_id,
            rtp_capabilities,
            paused,
        };
        let reply: ConsumeResponse = self.inner.rpc.request(method::CONSUME, &request).await?;

        let rpc = self.inner.rpc.scoped(
            Target::Consumer,
            Internal::consumer(self.inner.router_id, self.inner.id, reply.id),
        );
        let consumer = Consumer::new(reply, rpc, Arc::clone(&self.inner.relay), &self.inner);

        self.inner
            .consumers
            .lock()
            .insert(consumer.id(), consumer.clone());
        if self.is_closed() {
            consumer.close_silently(CloseOrigin::Parent);
        }
        info!(
            "Consumer {} of producer {} created on transport {}",
            consumer.id(),
            producer_id,
            self.id()
        );
        Some(consumer)
    }

    /// Engine statistics
    pub async fn get_stats(&self) -> Option<Value> {
        self.inner
            .rpc
            .request::<StatsResponse, _>(method::GET_STATS, &json!({}))
            .await
            .map(|reply| reply.stats)
    }

    /// Close the transport on the media node and locally, with its producers and consumers
    pub fn close(&self) {
        if !self.inner.state.close() {
            return;
        }
        debug!("Closing transport {}", self.id());
        self.inner.rpc.notify(method::CLOSE, json!({}));
        self.inner.finish(CloseOrigin::Local);
    }

    pub(crate) fn close_silently(&self, origin: CloseOrigin) {
        self.inner.close_silently(origin);
    }
}

impl TransportInner {
    pub(crate) fn id(&self) -> TransportId {
        self.id
    }

    pub(crate) fn forget_producer(&self, id: ProducerId) {
        self.producers.lock().remove(&id);
    }

    pub(crate) fn forget_consumer(&self, id: ConsumerId) {
        self.consumers.lock().remove(&id);
    }

    fn close_silently(&self, origin: CloseOrigin) {
        if self.state.close() {
            self.finish(origin);
        }
    }

    fn finish(&self, origin: CloseOrigin) {
        self.relay.unregister(ResourceKey::Transport(self.id));

        // Children go with the parent; the media node does the same on its side
        let producers = std::mem::take(&mut *self.producers.lock());
        let consumers = std::mem::take(&mut *self.consumers.lock());
        debug!(
            "Transport {} closed ({}), dropping {} producers and {} consumers",
            self.id,
            origin,
            producers.len(),
            consumers.len()
        );
        for producer in producers.into_values() {
            producer.close_silently(CloseOrigin::Parent);
        }
        for consumer in consumers.into_values() {
            consumer.close_silently(CloseOrigin::Parent);
        }

        if let Some(router) = self.router.upgrade() {
            router.forget_transport(self.id);
        }
        self.events.emit(TransportEvent::Closed { origin });
        self.events.finish();
    }
}

impl NotificationSink for TransportInner {
    fn on_notification(&self, method: &str, data: Value) {
        if self.state.get().is_closed() {
            return;
        }

        match method {
            method::DTLS_STATE_CHANGE => match decode::<DtlsStateChangeNotification>(data) {
                Ok(DtlsStateChangeNotification { dtls_state }) => {
                    *self.dtls_state.lock() = Some(dtls_state);
                    self.events
                        .emit(TransportEvent::DtlsStateChange { dtls_state });
                }
                Err(e) => warn!("Bad DTLS state for transport {}: {}", self.id, e),
            },
            method::CLOSE => self.close_silently(CloseOrigin::Remote),
            other => debug!("Ignoring transport notification \"{}\"", other),
        }
    }

    fn on_channel_closed(&self) {
        self.close_silently(CloseOrigin::ChannelClosed);
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.inner.id)
            .field("router_id", &self.inner.router_id)
            .field("state", &self.state())
            .finish()
    }
}
