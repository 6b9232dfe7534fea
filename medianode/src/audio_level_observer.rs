//! Proxy of a router's audio level observer

use crate::event::{AudioLevelObserverEvent, CloseOrigin, EventEmitter, EventStream};
use crate::relay::{EventRelay, NotificationSink, ResourceKey};
use crate::rpc::RpcClient;
use crate::state::{ResourceState, StateCell};
use medianode_core::protocol::{
    decode, method, AddProducerRequest, AudioLevelObserverOptions, VolumesNotification,
};
use medianode_core::{ProducerId, RouterId};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Periodic report of the loudest audio producers of a router
///
/// A router has at most one observer. It lives as long as its router.
#[derive(Clone)]
pub struct AudioLevelObserver {
    inner: Arc<ObserverInner>,
}

struct ObserverInner {
    router_id: RouterId,
    options: AudioLevelObserverOptions,
    rpc: RpcClient,
    relay: Arc<EventRelay>,
    state: StateCell,
    events: EventEmitter<AudioLevelObserverEvent>,
}

impl AudioLevelObserver {
    pub(crate) fn new(
        router_id: RouterId,
        options: AudioLevelObserverOptions,
        rpc: RpcClient,
        relay: Arc<EventRelay>,
    ) -> Self {
        let inner = Arc::new(ObserverInner {
            router_id,
            options,
            rpc,
            relay,
            state: StateCell::new(ResourceState::Active),
            events: EventEmitter::new(),
        });

        let weak: Weak<ObserverInner> = Arc::downgrade(&inner);
        let sink: Weak<dyn NotificationSink> = weak;
        inner
            .relay
            .register(ResourceKey::AudioLevelObserver(router_id), sink);
        Self { inner }
    }

    /// Observed router
    pub fn router_id(&self) -> RouterId {
        self.inner.router_id
    }

    /// Options given at creation
    pub fn options(&self) -> AudioLevelObserverOptions {
        self.inner.options
    }

    /// Whether the observer is gone
    pub fn is_closed(&self) -> bool {
        self.inner.state.get().is_closed()
    }

    /// Subscribe to volume reports
    pub fn events(&self) -> EventStream<AudioLevelObserverEvent> {
        self.inner.events.subscribe()
    }

    /// Start observing an audio producer of the router
    pub async fn add_producer(&self, producer_id: ProducerId) {
        if self.is_closed() {
            debug!("add_producer() on closed observer of router {}", self.router_id());
            return;
        }
        self.inner
            .rpc
            .execute(method::ADD_PRODUCER, &AddProducerRequest { producer_id })
            .await;
    }

    pub(crate) fn close_silently(&self, origin: CloseOrigin) {
        self.inner.close_silently(origin);
    }
}

impl ObserverInner {
    fn close_silently(&self, origin: CloseOrigin) {
        if !self.state.close() {
            return;
        }
        self.relay
            .unregister(ResourceKey::AudioLevelObserver(self.router_id));
        self.events.emit(AudioLevelObserverEvent::Closed { origin });
        self.events.finish();
    }
}

impl NotificationSink for ObserverInner {
    fn on_notification(&self, method: &str, data: Value) {
        if self.state.get().is_closed() {
            return;
        }

        match method {
            method::VOLUMES => match decode::<VolumesNotification>(data) {
                Ok(VolumesNotification { volumes }) => {
                    self.events.emit(AudioLevelObserverEvent::Volumes { volumes })
                }
                Err(e) => warn!("Bad volumes for router {}: {}", self.router_id, e),
            },
            method::SILENCE => self.events.emit(AudioLevelObserverEvent::Silence),
            other => debug!("Ignoring audio level observer notification \"{}\"", other),
        }
    }

    fn on_channel_closed(&self) {
        self.close_silently(CloseOrigin::ChannelClosed);
    }
}

impl fmt::Debug for AudioLevelObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioLevelObserver")
            .field("router_id", &self.inner.router_id)
            .field("options", &self.inner.options)
            .field("closed", &self.is_closed())
            .finish()
    }
}
