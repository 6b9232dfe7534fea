//! Events raised by proxies
//!
//! Every proxy owns an [`EventEmitter`]; callers subscribe to it and get an
//! [`EventStream`] that receives everything emitted after the subscription.

use medianode_core::protocol::{AudioVolume, ConsumerLayers, DtlsState};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;
use tracing::trace;

/// Why a resource closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOrigin {
    /// `close()` was called on it
    Local,
    /// The media node closed it
    Remote,
    /// An ancestor was closed
    Parent,
    /// The consumer's transport closed on the media node
    TransportClosed,
    /// The consumed producer closed on the media node
    ProducerClosed,
    /// The channel to the media node was lost
    ChannelClosed,
}

impl fmt::Display for CloseOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = match self {
            CloseOrigin::Local => "local",
            CloseOrigin::Remote => "remote",
            CloseOrigin::Parent => "parent",
            CloseOrigin::TransportClosed => "transport closed",
            CloseOrigin::ProducerClosed => "producer closed",
            CloseOrigin::ChannelClosed => "channel closed",
        };
        f.write_str(origin)
    }
}

/// Router events
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    /// The router closed
    Closed {
        /// Cause
        origin: CloseOrigin,
    },
}

impl RouterEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            RouterEvent::Closed { .. } => "close",
        }
    }
}

/// Transport events
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// DTLS state changed on the media node
    DtlsStateChange {
        /// New state
        dtls_state: DtlsState,
    },
    /// The transport closed
    Closed {
        /// Cause
        origin: CloseOrigin,
    },
}

impl TransportEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            TransportEvent::DtlsStateChange { .. } => "dtlsstatechange",
            TransportEvent::Closed { .. } => "close",
        }
    }
}

/// Producer events
#[derive(Debug, Clone, PartialEq)]
pub enum ProducerEvent {
    /// Score reported by the media node
    Score {
        /// Engine score
        score: Value,
    },
    /// Video orientation reported by the media node
    VideoOrientationChange {
        /// Engine video orientation
        video_orientation: Value,
    },
    /// The producer closed
    Closed {
        /// Cause
        origin: CloseOrigin,
    },
}

impl ProducerEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            ProducerEvent::Score { .. } => "score",
            ProducerEvent::VideoOrientationChange { .. } => "videoorientationchange",
            ProducerEvent::Closed { .. } => "close",
        }
    }
}

/// Consumer events
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    /// The consumed producer paused
    ProducerPause,
    /// The consumed producer resumed
    ProducerResume,
    /// Score reported by the media node
    Score {
        /// Engine score
        score: Value,
    },
    /// Forwarded layers changed
    LayersChange {
        /// New layers, `None` when nothing is forwarded
        layers: Option<ConsumerLayers>,
    },
    /// The consumer closed
    Closed {
        /// Cause
        origin: CloseOrigin,
    },
}

impl ConsumerEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            ConsumerEvent::ProducerPause => "producerpause",
            ConsumerEvent::ProducerResume => "producerresume",
            ConsumerEvent::Score { .. } => "score",
            ConsumerEvent::LayersChange { .. } => "layerschange",
            ConsumerEvent::Closed { .. } => "close",
        }
    }
}

/// Audio level observer events
#[derive(Debug, Clone, PartialEq)]
pub enum AudioLevelObserverEvent {
    /// Producers above the threshold, loudest first
    Volumes {
        /// Volumes per producer
        volumes: Vec<AudioVolume>,
    },
    /// Every observed producer is below the threshold
    Silence,
    /// The observer closed with its router
    Closed {
        /// Cause
        origin: CloseOrigin,
    },
}

impl AudioLevelObserverEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            AudioLevelObserverEvent::Volumes { .. } => "volumes",
            AudioLevelObserverEvent::Silence => "silence",
            AudioLevelObserverEvent::Closed { .. } => "close",
        }
    }
}

/// Stream of proxy events for async iteration
#[derive(Debug)]
pub struct EventStream<E> {
    receiver: mpsc::UnboundedReceiver<E>,
}

impl<E> EventStream<E> {
    /// Create a new event stream with a receiver
    pub fn new(receiver: mpsc::UnboundedReceiver<E>) -> Self {
        Self { receiver }
    }

    /// Get the next event; `None` once the emitter is gone
    pub async fn next(&mut self) -> Option<E> {
        self.receiver.recv().await
    }

    /// Try to get the next event without blocking
    pub fn try_next(&mut self) -> Result<Option<E>, mpsc::error::TryRecvError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(mpsc::error::TryRecvError::Disconnected)
            }
        }
    }

    /// Stop receiving
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Fan-out of events to every live subscriber
#[derive(Debug)]
pub(crate) struct EventEmitter<E> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E: Clone> EventEmitter<E> {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> EventStream<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        EventStream::new(rx)
    }

    pub(crate) fn emit(&self, event: E) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        trace!("Event delivered to {} subscribers", subscribers.len());
    }

    /// Drop every subscriber so their streams end
    pub(crate) fn finish(&self) {
        self.subscribers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emitter_fans_out() {
        let emitter = EventEmitter::new();
        let mut first = emitter.subscribe();
        let mut second = emitter.subscribe();

        emitter.emit(ConsumerEvent::ProducerPause);
        assert_eq!(first.next().await, Some(ConsumerEvent::ProducerPause));
        assert_eq!(second.next().await, Some(ConsumerEvent::ProducerPause));

        emitter.finish();
        assert_eq!(first.next().await, None);
    }

    #[test]
    fn test_next_waits_for_emit() {
        let emitter = EventEmitter::new();
        let mut stream = emitter.subscribe();

        let mut next = tokio_test::task::spawn(stream.next());
        tokio_test::assert_pending!(next.poll());

        emitter.emit(AudioLevelObserverEvent::Silence);
        assert!(next.is_woken());
        tokio_test::assert_ready_eq!(next.poll(), Some(AudioLevelObserverEvent::Silence));
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let emitter = EventEmitter::new();
        let stream = emitter.subscribe();
        drop(stream);

        emitter.emit(RouterEvent::Closed {
            origin: CloseOrigin::Local,
        });
        assert!(emitter.subscribers.lock().is_empty());
    }

    #[test]
    fn test_event_types_match_wire_names() {
        assert_eq!(ConsumerEvent::ProducerResume.event_type(), "producerresume");
        assert_eq!(
            TransportEvent::DtlsStateChange {
                dtls_state: DtlsState::Connected
            }
            .event_type(),
            "dtlsstatechange"
        );
        assert_eq!(AudioLevelObserverEvent::Silence.event_type(), "silence");
    }
}
