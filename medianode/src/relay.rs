//! Dispatch of media node notifications to proxies
//!
//! One relay exists per channel. Proxies register under their [`ResourceKey`]
//! when created and unregister when they close; the relay only holds weak
//! references, so it never keeps a proxy alive.

use medianode_core::protocol::method;
use medianode_core::{
    ConsumerId, Inbound, MediaNodeError, Notification, ProducerId, RouterId, Target, TransportId,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Receiver of the notifications addressed to one resource
pub(crate) trait NotificationSink: Send + Sync {
    /// Apply a notification from the media node
    fn on_notification(&self, method: &str, data: Value);

    /// The channel is gone; close without telling the media node
    fn on_channel_closed(&self);
}

/// Dispatch key of a proxied resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    /// Router
    Router(RouterId),
    /// Transport
    Transport(TransportId),
    /// Producer
    Producer(ProducerId),
    /// Consumer
    Consumer(ConsumerId),
    /// Audio level observer of the router
    AudioLevelObserver(RouterId),
}

impl ResourceKey {
    /// Key a notification is addressed to, if its scope names one
    pub fn of(notification: &Notification) -> Option<Self> {
        let internal = &notification.internal;

        match notification.target {
            Target::Router => {
                let router_id = internal.router_id?;
                match notification.method.as_str() {
                    method::VOLUMES | method::SILENCE => Some(ResourceKey::AudioLevelObserver(router_id)),
                    _ => Some(ResourceKey::Router(router_id)),
                }
            }
            Target::Audio => internal.router_id.map(ResourceKey::AudioLevelObserver),
            Target::Transport => internal.transport_id.map(ResourceKey::Transport),
            Target::Producer => internal.producer_id.map(ResourceKey::Producer),
            Target::Consumer => internal.consumer_id.map(ResourceKey::Consumer),
            Target::MediaNode | Target::Worker => None,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Router(id) => write!(f, "router {}", id),
            ResourceKey::Transport(id) => write!(f, "transport {}", id),
            ResourceKey::Producer(id) => write!(f, "producer {}", id),
            ResourceKey::Consumer(id) => write!(f, "consumer {}", id),
            ResourceKey::AudioLevelObserver(id) => write!(f, "audio level observer of router {}", id),
        }
    }
}

/// Per-channel dispatch table
pub struct EventRelay {
    peer: String,
    sinks: Mutex<HashMap<ResourceKey, Weak<dyn NotificationSink>>>,
}

impl fmt::Debug for EventRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRelay")
            .field("peer", &self.peer)
            .field("registered", &self.len())
            .finish()
    }
}

impl EventRelay {
    /// Create an empty relay for the channel to `peer`
    pub fn new(peer: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            peer: peer.into(),
            sinks: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn register(&self, key: ResourceKey, sink: Weak<dyn NotificationSink>) {
        if self.sinks.lock().insert(key, sink).is_some() {
            warn!("{} registered twice on {}", key, self.peer);
        }
    }

    pub(crate) fn unregister(&self, key: ResourceKey) {
        self.sinks.lock().remove(&key);
    }

    /// Number of registered resources
    pub fn len(&self) -> usize {
        self.sinks.lock().len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a resource is registered under `key`
    pub fn contains(&self, key: ResourceKey) -> bool {
        self.sinks.lock().contains_key(&key)
    }

    /// Deliver a notification to the one resource it names.
    ///
    /// Returns whether a resource took it; unknown ids are dropped.
    pub fn dispatch(&self, notification: Notification) -> bool {
        let Some(key) = ResourceKey::of(&notification) else {
            trace!(
                "Dropping unscoped {} notification \"{}\"",
                notification.target,
                notification.method
            );
            return false;
        };

        // Never call into a proxy with the table locked
        let sink = self.sinks.lock().get(&key).cloned();
        let Some(sink) = sink else {
            trace!("Dropping \"{}\" for unknown {}", notification.method, key);
            return false;
        };

        match sink.upgrade() {
            Some(sink) => {
                sink.on_notification(&notification.method, notification.data);
                true
            }
            None => {
                self.unregister(key);
                trace!("Dropping \"{}\" for released {}", notification.method, key);
                false
            }
        }
    }

    /// Close every registered resource after the channel dropped
    pub fn close_all(&self) {
        let sinks: Vec<_> = self.sinks.lock().drain().collect();
        if sinks.is_empty() {
            return;
        }

        info!(
            "Channel to {} lost, closing {} resources",
            self.peer,
            sinks.len()
        );
        for (_, sink) in sinks {
            if let Some(sink) = sink.upgrade() {
                sink.on_channel_closed();
            }
        }
    }

    /// Consume the channel's inbound messages until it closes
    pub(crate) async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(message) = inbound.recv().await {
            match message {
                Inbound::Notification(notification) => {
                    debug!(
                        "notification [peer:{}, target:{}, method:{}]",
                        self.peer, notification.target, notification.method
                    );
                    self.dispatch(notification);
                }
                Inbound::Request(request) => {
                    let error = MediaNodeError::UnsupportedMethod {
                        target: request.target,
                        method: request.method.clone(),
                    };
                    warn!("Media node {} sent a request: {}", self.peer, error);
                    request.respond(Err(error));
                }
            }
        }

        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medianode_core::Internal;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        channel_closed: Mutex<bool>,
    }

    impl NotificationSink for Recorder {
        fn on_notification(&self, method: &str, _data: Value) {
            self.seen.lock().push(method.to_string());
        }

        fn on_channel_closed(&self) {
            *self.channel_closed.lock() = true;
        }
    }

    fn notification(target: Target, method: &str, internal: Internal) -> Notification {
        Notification {
            target,
            method: method.to_string(),
            internal,
            data: json!({}),
        }
    }

    #[test]
    fn test_dispatch_by_id() {
        let relay = EventRelay::new("test");
        let router_id = RouterId::new();
        let transport_id = TransportId::new();
        let consumer_id = ConsumerId::new();

        let recorder = Arc::new(Recorder::default());
        let sink: Arc<dyn NotificationSink> = recorder.clone();
        relay.register(ResourceKey::Consumer(consumer_id), Arc::downgrade(&sink));

        assert!(relay.dispatch(notification(
            Target::Consumer,
            method::PRODUCER_PAUSE,
            Internal::consumer(router_id, transport_id, consumer_id),
        )));
        // Unknown id: dropped without error
        assert!(!relay.dispatch(notification(
            Target::Consumer,
            method::PRODUCER_PAUSE,
            Internal::consumer(router_id, transport_id, ConsumerId::new()),
        )));

        assert_eq!(*recorder.seen.lock(), vec![method::PRODUCER_PAUSE.to_string()]);
    }

    #[test]
    fn test_volumes_go_to_observer() {
        let router_id = RouterId::new();
        let volumes = notification(Target::Router, method::VOLUMES, Internal::router(router_id));
        let close = notification(Target::Router, method::CLOSE, Internal::router(router_id));

        assert_eq!(
            ResourceKey::of(&volumes),
            Some(ResourceKey::AudioLevelObserver(router_id))
        );
        assert_eq!(ResourceKey::of(&close), Some(ResourceKey::Router(router_id)));
        assert_eq!(
            ResourceKey::of(&notification(Target::Transport, method::CLOSE, Internal::default())),
            None
        );
    }

    #[test]
    fn test_released_sinks_are_pruned() {
        let relay = EventRelay::new("test");
        let router_id = RouterId::new();

        let sink: Arc<dyn NotificationSink> = Arc::new(Recorder::default());
        relay.register(ResourceKey::Router(router_id), Arc::downgrade(&sink));
        drop(sink);

        assert!(!relay.dispatch(notification(
            Target::Router,
            method::CLOSE,
            Internal::router(router_id)
        )));
        assert!(relay.is_empty());
    }

    #[test]
    fn test_close_all_drains() {
        let relay = EventRelay::new("test");
        let recorder = Arc::new(Recorder::default());
        let sink: Arc<dyn NotificationSink> = recorder.clone();
        relay.register(ResourceKey::Producer(ProducerId::new()), Arc::downgrade(&sink));

        relay.close_all();
        assert!(*recorder.channel_closed.lock());
        assert!(relay.is_empty());

        // Second call has nothing left to close
        relay.close_all();
    }
}
