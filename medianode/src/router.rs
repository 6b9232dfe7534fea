//! Proxy of a router hosted on a media node

use crate::audio_level_observer::AudioLevelObserver;
use crate::event::{CloseOrigin, EventEmitter, EventStream, RouterEvent};
use crate::relay::{EventRelay, NotificationSink, ResourceKey};
use crate::rpc::RpcClient;
use crate::state::{ResourceState, StateCell};
use crate::transport::Transport;
use crate::worker::WorkerNode;
use medianode_core::protocol::{
    method, AudioLevelObserverOptions, CanConsumeRequest, CanConsumeResponse,
    CreateWebRtcTransportRequest, RtpCapabilitiesResponse, WebRtcTransportData,
};
use medianode_core::{Channel, Internal, ProducerId, RouterId, Target, TransportId};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Routing context on a media node; the root of a resource tree
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

pub(crate) struct RouterInner {
    id: RouterId,
    rpc: RpcClient,
    relay: Arc<EventRelay>,
    worker: Weak<WorkerNode>,
    state: StateCell,
    transports: Mutex<HashMap<TransportId, Transport>>,
    audio_level_observer: Mutex<Option<AudioLevelObserver>>,
    events: EventEmitter<RouterEvent>,
}

impl Router {
    pub(crate) fn new(
        id: RouterId,
        channel: Channel,
        relay: Arc<EventRelay>,
        worker: Weak<WorkerNode>,
    ) -> Self {
        let inner = Arc::new(RouterInner {
            id,
            rpc: RpcClient::new(channel, Target::Router, Internal::router(id)),
            relay,
            worker,
            state: StateCell::new(ResourceState::Active),
            transports: Mutex::new(HashMap::new()),
            audio_level_observer: Mutex::new(None),
            events: EventEmitter::new(),
        });

        let weak: Weak<RouterInner> = Arc::downgrade(&inner);
        let sink: Weak<dyn NotificationSink> = weak;
        inner.relay.register(ResourceKey::Router(id), sink);
        Self { inner }
    }

    /// Identifier assigned by the media node
    pub fn id(&self) -> RouterId {
        self.inner.id
    }

    /// Media node hosting this router, while the front-end keeps it
    pub fn worker(&self) -> Option<Arc<WorkerNode>> {
        self.inner.worker.upgrade()
    }

    /// Lifecycle state
    pub fn state(&self) -> ResourceState {
        self.inner.state.get()
    }

    /// Whether the router is gone
    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Live transport by id
    pub fn transport(&self, id: TransportId) -> Option<Transport> {
        self.inner.transports.lock().get(&id).cloned()
    }

    /// Every live transport
    pub fn transports(&self) -> Vec<Transport> {
        self.inner.transports.lock().values().cloned().collect()
    }

    /// The router's audio level observer, if one was created
    pub fn audio_level_observer(&self) -> Option<AudioLevelObserver> {
        self.inner.audio_level_observer.lock().clone()
    }

    /// Subscribe to this router's events
    pub fn events(&self) -> EventStream<RouterEvent> {
        self.inner.events.subscribe()
    }

    /// RTP capabilities of the router
    pub async fn rtp_capabilities(&self) -> Option<Value> {
        self.inner
            .rpc
            .request::<RtpCapabilitiesResponse, _>(method::GET_RTP_CAPABILITIES, &json!({}))
            .await
            .map(|reply| reply.rtp_capabilities)
    }

    /// Whether an endpoint with `rtp_capabilities` can consume `producer_id`
    pub async fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: Value) -> Option<bool> {
        let request = CanConsumeRequest {
            producer_id,
            rtp_capabilities,
        };
        self.inner
            .rpc
            .request::<CanConsumeResponse, _>(method::CAN_CONSUME, &request)
            .await
            .map(|reply| reply.can_consume)
    }

    /// Create a WebRTC transport; the media node fills in options left out
    pub async fn create_webrtc_transport(&self, options: Value) -> Option<Transport> {
        if self.is_closed() {
            debug!("create_webrtc_transport() on closed router {}", self.id());
            return None;
        }

        let request = CreateWebRtcTransportRequest {
            web_rtc_transport_options: options,
        };
        let data: WebRtcTransportData = self
            .inner
            .rpc
            .request(method::CREATE_WEBRTC_TRANSPORT, &request)
            .await?;

        let rpc = self
            .inner
            .rpc
            .scoped(Target::Transport, Internal::transport(self.id(), data.id));
        let transport = Transport::new(data, rpc, Arc::clone(&self.inner.relay), &self.inner);

        self.inner
            .transports
            .lock()
            .insert(transport.id(), transport.clone());
        if self.is_closed() {
            transport.close_silently(CloseOrigin::Parent);
        }
        info!("Transport {} created on router {}", transport.id(), self.id());
        Some(transport)
    }

    /// Create the router's audio level observer
    pub async fn create_audio_level_observer(
        &self,
        options: AudioLevelObserverOptions,
    ) -> Option<AudioLevelObserver> {
        if self.is_closed() {
            debug!("create_audio_level_observer() on closed router {}", self.id());
            return None;
        }
        if !self
            .inner
            .rpc
            .execute(method::CREATE_AUDIO_LEVEL_OBSERVER, &options)
            .await
        {
            return None;
        }

        let rpc = self
            .inner
            .rpc
            .scoped(Target::Audio, Internal::router(self.id()));
        let observer =
            AudioLevelObserver::new(self.id(), options, rpc, Arc::clone(&self.inner.relay));

        *self.inner.audio_level_observer.lock() = Some(observer.clone());
        if self.is_closed() {
            observer.close_silently(CloseOrigin::Parent);
        }
        Some(observer)
    }

    /// Close the router on the media node and locally, with everything it owns
    pub fn close(&self) {
        if !self.inner.state.close() {
            return;
        }
        debug!("Closing router {}", self.id());
        self.inner.rpc.notify(method::CLOSE, json!({}));
        self.inner.finish(CloseOrigin::Local);
    }

    pub(crate) fn close_silently(&self, origin: CloseOrigin) {
        self.inner.close_silently(origin);
    }
}

impl RouterInner {
    pub(crate) fn id(&self) -> RouterId {
        self.id
    }

    pub(crate) fn forget_transport(&self, id: TransportId) {
        self.transports.lock().remove(&id);
    }

    fn close_silently(&self, origin: CloseOrigin) {
        if self.state.close() {
            self.finish(origin);
        }
    }

    fn finish(&self, origin: CloseOrigin) {
        self.relay.unregister(ResourceKey::Router(self.id));

        let transports = std::mem::take(&mut *self.transports.lock());
        let observer = self.audio_level_observer.lock().take();
        info!(
            "Router {} closed ({}), dropping {} transports",
            self.id,
            origin,
            transports.len()
        );
        for transport in transports.into_values() {
            transport.close_silently(CloseOrigin::Parent);
        }
        if let Some(observer) = observer {
            observer.close_silently(CloseOrigin::Parent);
        }

        if let Some(worker) = self.worker.upgrade() {
            worker.forget_router(self.id);
        }
        self.events.emit(RouterEvent::Closed { origin });
        self.events.finish();
    }
}

impl NotificationSink for RouterInner {
    fn on_notification(&self, method: &str, _data: Value) {
        match method {
            method::CLOSE => self.close_silently(CloseOrigin::Remote),
            other => debug!("Ignoring router notification \"{}\"", other),
        }
    }

    fn on_channel_closed(&self) {
        self.close_silently(CloseOrigin::ChannelClosed);
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("transports", &self.inner.transports.lock().len())
            .finish()
    }
}
