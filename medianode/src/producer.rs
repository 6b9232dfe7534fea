//! Proxy of a producer hosted on a media node

use crate::event::{CloseOrigin, EventEmitter, EventStream, ProducerEvent};
use crate::relay::{EventRelay, NotificationSink, ResourceKey};
use crate::rpc::RpcClient;
use crate::state::{ResourceState, StateCell};
use crate::transport::TransportInner;
use medianode_core::protocol::{
    decode, method, ScoreNotification, StatsResponse, VideoOrientationNotification,
};
use medianode_core::{MediaKind, ProducerId, TransportId};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Media flowing into a media node from an endpoint
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

pub(crate) struct ProducerInner {
    id: ProducerId,
    transport_id: TransportId,
    kind: MediaKind,
    app_data: Value,
    rpc: RpcClient,
    relay: Arc<EventRelay>,
    transport: Weak<TransportInner>,
    state: StateCell,
    score: Mutex<Value>,
    video_orientation: Mutex<Option<Value>>,
    events: EventEmitter<ProducerEvent>,
}

impl Producer {
    pub(crate) fn new(
        id: ProducerId,
        kind: MediaKind,
        app_data: Value,
        rpc: RpcClient,
        relay: Arc<EventRelay>,
        transport: &Arc<TransportInner>,
    ) -> Self {
        let inner = Arc::new(ProducerInner {
            id,
            transport_id: transport.id(),
            kind,
            app_data,
            rpc,
            relay,
            transport: Arc::downgrade(transport),
            state: StateCell::new(ResourceState::Active),
            score: Mutex::new(json!([])),
            video_orientation: Mutex::new(None),
            events: EventEmitter::new(),
        });

        let weak: Weak<ProducerInner> = Arc::downgrade(&inner);
        let sink: Weak<dyn NotificationSink> = weak;
        inner.relay.register(ResourceKey::Producer(id), sink);
        Self { inner }
    }

    /// Identifier assigned by the media node
    pub fn id(&self) -> ProducerId {
        self.inner.id
    }

    /// Owning transport
    pub fn transport_id(&self) -> TransportId {
        self.inner.transport_id
    }

    /// Media kind
    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    /// Application data given at creation
    pub fn app_data(&self) -> &Value {
        &self.inner.app_data
    }

    /// Lifecycle state
    pub fn state(&self) -> ResourceState {
        self.inner.state.get()
    }

    /// Whether the producer is paused
    pub fn paused(&self) -> bool {
        self.state() == ResourceState::Paused
    }

    /// Whether the producer is gone
    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Last score reported by the media node
    pub fn score(&self) -> Value {
        self.inner.score.lock().clone()
    }

    /// Last video orientation reported by the media node
    pub fn video_orientation(&self) -> Option<Value> {
        self.inner.video_orientation.lock().clone()
    }

    /// Subscribe to this producer's events
    pub fn events(&self) -> EventStream<ProducerEvent> {
        self.inner.events.subscribe()
    }

    /// Pause the producer
    pub async fn pause(&self) {
        if self.is_closed() {
            debug!("pause() on closed producer {}", self.id());
            return;
        }
        if self.inner.rpc.execute(method::PAUSE, &json!({})).await {
            self.inner.state.transition(ResourceState::Paused);
        }
    }

    /// Resume the producer
    pub async fn resume(&self) {
        if self.is_closed() {
            debug!("resume() on closed producer {}", self.id());
            return;
        }
        if self.inner.rpc.execute(method::RESUME, &json!({})).await {
            self.inner.state.transition(ResourceState::Active);
        }
    }

    /// Engine statistics
    pub async fn get_stats(&self) -> Option<Value> {
        self.inner
            .rpc
            .request::<StatsResponse, _>(method::GET_STATS, &json!({}))
            .await
            .map(|reply| reply.stats)
    }

    /// Close the producer on the media node and locally
    pub fn close(&self) {
        if !self.inner.state.close() {
            return;
        }
        debug!("Closing producer {}", self.id());
        self.inner.rpc.notify(method::CLOSE, json!({}));
        self.inner.finish(CloseOrigin::Local);
    }

    pub(crate) fn close_silently(&self, origin: CloseOrigin) {
        self.inner.close_silently(origin);
    }
}

impl ProducerInner {
    fn close_silently(&self, origin: CloseOrigin) {
        if self.state.close() {
            self.finish(origin);
        }
    }

    fn finish(&self, origin: CloseOrigin) {
        self.relay.unregister(ResourceKey::Producer(self.id));
        if let Some(transport) = self.transport.upgrade() {
            transport.forget_producer(self.id);
        }

        debug!("Producer {} closed ({})", self.id, origin);
        self.events.emit(ProducerEvent::Closed { origin });
        self.events.finish();
    }
}

impl NotificationSink for ProducerInner {
    fn on_notification(&self, method: &str, data: Value) {
        if self.state.get().is_closed() {
            return;
        }

        match method {
            method::SCORE => match decode::<ScoreNotification>(data) {
                Ok(ScoreNotification { score }) => {
                    *self.score.lock() = score.clone();
                    self.events.emit(ProducerEvent::Score { score });
                }
                Err(e) => warn!("Bad score for producer {}: {}", self.id, e),
            },
            method::VIDEO_ORIENTATION_CHANGE => match decode::<VideoOrientationNotification>(data) {
                Ok(VideoOrientationNotification { video_orientation }) => {
                    *self.video_orientation.lock() = Some(video_orientation.clone());
                    self.events
                        .emit(ProducerEvent::VideoOrientationChange { video_orientation });
                }
                Err(e) => warn!("Bad video orientation for producer {}: {}", self.id, e),
            },
            method::CLOSE => self.close_silently(CloseOrigin::Remote),
            other => debug!("Ignoring producer notification \"{}\"", other),
        }
    }

    fn on_channel_closed(&self) {
        self.close_silently(CloseOrigin::ChannelClosed);
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}
