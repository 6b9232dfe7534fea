//! Authoritative router handler
//!
//! Owns the engine router, its transports and its optional audio level
//! observer. Engine events of the whole router tree arrive on one queue and
//! are pumped out as channel notifications.

use crate::config::WebRtcTransportSettings;
use crate::engine::{EngineAudioLevelObserver, EngineEvent, EngineRouter};
use crate::transport::TransportHandler;
use dashmap::DashMap;
use medianode_core::ids::{ConsumerId, RouterId, TransportId};
use medianode_core::protocol::{
    decode, encode, method, AddProducerRequest, AudioLevelObserverOptions, CanConsumeRequest,
    CanConsumeResponse, CreateWebRtcTransportRequest, DtlsStateChangeNotification, Internal,
    LayersChangeNotification, RtpCapabilitiesResponse, ScoreNotification, Target,
    VideoOrientationNotification, VolumesNotification,
};
use medianode_core::{Channel, MediaNodeError, ResourceKind};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub(crate) type RouterTable = DashMap<RouterId, Arc<RouterHandler>>;

pub(crate) struct RouterHandler {
    id: RouterId,
    router: Arc<dyn EngineRouter>,
    transports: DashMap<TransportId, Arc<TransportHandler>>,
    audio_level_observer: Mutex<Option<Arc<dyn EngineAudioLevelObserver>>>,
    transport_settings: WebRtcTransportSettings,
    closed: AtomicBool,
}

/// Notification to push for one engine event
struct Outgoing {
    target: Target,
    method: &'static str,
    internal: Internal,
    data: Value,
}

impl RouterHandler {
    pub(crate) fn new(
        router: Arc<dyn EngineRouter>,
        transport_settings: WebRtcTransportSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: router.id(),
            router,
            transports: DashMap::new(),
            audio_level_observer: Mutex::new(None),
            transport_settings,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> RouterId {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn transport_count(&self) -> usize {
        self.transports.len()
    }

    pub(crate) async fn handle_request(
        &self,
        method: &str,
        data: Value,
    ) -> Result<Value, MediaNodeError> {
        match method {
            method::CREATE_AUDIO_LEVEL_OBSERVER => {
                let options: AudioLevelObserverOptions = decode(data)?;
                self.create_audio_level_observer(options).await?;
                Ok(json!({}))
            }
            method::GET_RTP_CAPABILITIES => encode(&RtpCapabilitiesResponse {
                rtp_capabilities: self.router.rtp_capabilities(),
            }),
            method::CREATE_WEBRTC_TRANSPORT => {
                let request: CreateWebRtcTransportRequest = decode(data)?;
                self.create_webrtc_transport(request.web_rtc_transport_options)
                    .await
            }
            method::CAN_CONSUME => {
                let request: CanConsumeRequest = decode(data)?;
                let can_consume = self
                    .router
                    .can_consume(request.producer_id, &request.rtp_capabilities);
                encode(&CanConsumeResponse { can_consume })
            }
            other => Err(MediaNodeError::UnsupportedMethod {
                target: Target::Router,
                method: other.to_string(),
            }),
        }
    }

    pub(crate) async fn handle_audio_request(
        &self,
        method: &str,
        data: Value,
    ) -> Result<Value, MediaNodeError> {
        match method {
            method::ADD_PRODUCER => {
                let request: AddProducerRequest = decode(data)?;
                let observer = self
                    .audio_level_observer
                    .lock()
                    .clone()
                    .ok_or_else(|| {
                        MediaNodeError::not_found(ResourceKind::AudioLevelObserver, self.id)
                    })?;
                observer.add_producer(request.producer_id).await?;
                Ok(json!({}))
            }
            other => Err(MediaNodeError::UnsupportedMethod {
                target: Target::Audio,
                method: other.to_string(),
            }),
        }
    }

    async fn create_audio_level_observer(
        &self,
        options: AudioLevelObserverOptions,
    ) -> Result<(), MediaNodeError> {
        if self.audio_level_observer.lock().is_some() {
            return Err(MediaNodeError::engine(
                "Router already has an audio level observer",
            ));
        }

        let observer = self.router.create_audio_level_observer(options).await?;

        let mut slot = self.audio_level_observer.lock();
        if slot.is_some() {
            // Lost a race with a concurrent request
            observer.close();
            return Err(MediaNodeError::engine(
                "Router already has an audio level observer",
            ));
        }
        *slot = Some(observer);
        info!("Audio level observer created on router {}", self.id);
        Ok(())
    }

    async fn create_webrtc_transport(&self, options: Value) -> Result<Value, MediaNodeError> {
        let options = self.transport_settings.apply_defaults(options);
        let transport = self.router.create_webrtc_transport(options).await?;

        let max_incoming_bitrate = self.transport_settings.max_incoming_bitrate;
        if max_incoming_bitrate > 0 {
            if let Err(e) = transport.set_max_incoming_bitrate(max_incoming_bitrate).await {
                warn!(
                    "Failed to cap incoming bitrate of transport {}: {}",
                    transport.id(),
                    e
                );
            }
        }

        let handler = Arc::new(TransportHandler::new(self.id, transport));
        let data = handler.describe();

        // Register before checking so a concurrent close sees it
        self.transports.insert(data.id, Arc::clone(&handler));
        if self.is_closed() {
            if let Some((_, handler)) = self.transports.remove(&data.id) {
                handler.close();
            }
            return Err(MediaNodeError::not_found(ResourceKind::Router, self.id));
        }

        info!("Transport {} created on router {}", data.id, self.id);
        encode(&data)
    }

    pub(crate) fn transport(
        &self,
        id: Option<TransportId>,
    ) -> Result<Arc<TransportHandler>, MediaNodeError> {
        let id = id.ok_or_else(|| MediaNodeError::InvalidMessage {
            reason: "missing transportId".to_string(),
        })?;
        self.transports
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MediaNodeError::not_found(ResourceKind::Transport, id))
    }

    /// Close a transport on request of the front-end
    pub(crate) fn close_transport(&self, id: TransportId) -> bool {
        match self.transports.remove(&id) {
            Some((_, transport)) => {
                debug!("Closing transport {} of router {}", id, self.id);
                transport.close();
                true
            }
            None => false,
        }
    }

    /// Close the engine router with everything below it
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "Closing router {} with {} transports",
            self.id,
            self.transport_count()
        );

        self.drop_children();
        self.router.close();
    }

    /// Drop local state after the engine closed the router itself
    fn forget(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Router {} closed by the engine", self.id);
        self.drop_children();
    }

    fn drop_children(&self) {
        let ids: Vec<TransportId> = self.transports.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, transport)) = self.transports.remove(&id) {
                transport.forget();
            }
        }
        self.audio_level_observer.lock().take();
    }

    /// Update local maps for an engine event and build its notification
    fn apply(&self, event: EngineEvent) -> Result<Outgoing, MediaNodeError> {
        let router_id = self.id;

        let outgoing = match event {
            EngineEvent::Volumes { volumes } => Outgoing {
                target: Target::Router,
                method: method::VOLUMES,
                internal: Internal::router(router_id),
                data: encode(&VolumesNotification { volumes })?,
            },
            EngineEvent::Silence => Outgoing {
                target: Target::Router,
                method: method::SILENCE,
                internal: Internal::router(router_id),
                data: json!({}),
            },
            EngineEvent::RouterClosed => {
                self.forget();
                Outgoing {
                    target: Target::Router,
                    method: method::CLOSE,
                    internal: Internal::router(router_id),
                    data: json!({}),
                }
            }
            EngineEvent::DtlsStateChange {
                transport_id,
                dtls_state,
            } => Outgoing {
                target: Target::Transport,
                method: method::DTLS_STATE_CHANGE,
                internal: Internal::transport(router_id, transport_id),
                data: encode(&DtlsStateChangeNotification { dtls_state })?,
            },
            EngineEvent::TransportClosed { transport_id } => {
                if let Some((_, transport)) = self.transports.remove(&transport_id) {
                    transport.forget();
                }
                Outgoing {
                    target: Target::Transport,
                    method: method::CLOSE,
                    internal: Internal::transport(router_id, transport_id),
                    data: json!({}),
                }
            }
            EngineEvent::ProducerScore {
                transport_id,
                producer_id,
                score,
            } => Outgoing {
                target: Target::Producer,
                method: method::SCORE,
                internal: Internal::producer(router_id, transport_id, producer_id),
                data: encode(&ScoreNotification { score })?,
            },
            EngineEvent::VideoOrientationChange {
                transport_id,
                producer_id,
                video_orientation,
            } => Outgoing {
                target: Target::Producer,
                method: method::VIDEO_ORIENTATION_CHANGE,
                internal: Internal::producer(router_id, transport_id, producer_id),
                data: encode(&VideoOrientationNotification { video_orientation })?,
            },
            EngineEvent::ProducerClosed {
                transport_id,
                producer_id,
            } => {
                if let Some(transport) = self.transports.get(&transport_id) {
                    transport.forget_producer(producer_id);
                }
                Outgoing {
                    target: Target::Producer,
                    method: method::CLOSE,
                    internal: Internal::producer(router_id, transport_id, producer_id),
                    data: json!({}),
                }
            }
            EngineEvent::ConsumerTransportClosed {
                transport_id,
                consumer_id,
            } => self.consumer_gone(transport_id, consumer_id, method::TRANSPORT_CLOSE),
            EngineEvent::ConsumerProducerClosed {
                transport_id,
                consumer_id,
            } => self.consumer_gone(transport_id, consumer_id, method::PRODUCER_CLOSE),
            EngineEvent::ConsumerClosed {
                transport_id,
                consumer_id,
            } => self.consumer_gone(transport_id, consumer_id, method::CLOSE),
            EngineEvent::ConsumerProducerPaused {
                transport_id,
                consumer_id,
            } => Outgoing {
                target: Target::Consumer,
                method: method::PRODUCER_PAUSE,
                internal: Internal::consumer(router_id, transport_id, consumer_id),
                data: json!({}),
            },
            EngineEvent::ConsumerProducerResumed {
                transport_id,
                consumer_id,
            } => Outgoing {
                target: Target::Consumer,
                method: method::PRODUCER_RESUME,
                internal: Internal::consumer(router_id, transport_id, consumer_id),
                data: json!({}),
            },
            EngineEvent::ConsumerScore {
                transport_id,
                consumer_id,
                score,
            } => Outgoing {
                target: Target::Consumer,
                method: method::SCORE,
                internal: Internal::consumer(router_id, transport_id, consumer_id),
                data: encode(&ScoreNotification { score })?,
            },
            EngineEvent::ConsumerLayersChange {
                transport_id,
                consumer_id,
                layers,
            } => Outgoing {
                target: Target::Consumer,
                method: method::LAYERS_CHANGE,
                internal: Internal::consumer(router_id, transport_id, consumer_id),
                data: encode(&LayersChangeNotification { layers })?,
            },
        };

        Ok(outgoing)
    }

    fn consumer_gone(
        &self,
        transport_id: TransportId,
        consumer_id: ConsumerId,
        method: &'static str,
    ) -> Outgoing {
        if let Some(transport) = self.transports.get(&transport_id) {
            transport.forget_consumer(consumer_id);
        }
        Outgoing {
            target: Target::Consumer,
            method,
            internal: Internal::consumer(self.id, transport_id, consumer_id),
            data: json!({}),
        }
    }
}

/// Forward the engine events of one router to the front-end until the
/// router goes away or the channel drops
pub(crate) fn spawn_event_pump(
    handler: Weak<RouterHandler>,
    routers: Weak<RouterTable>,
    channel: Channel,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(router) = handler.upgrade() else {
                break;
            };
            if router.is_closed() {
                debug!(
                    "Dropping {} event of closed router {}",
                    event.event_type(),
                    router.id()
                );
                continue;
            }

            let engine_closed_router = matches!(event, EngineEvent::RouterClosed);
            let outgoing = match router.apply(event) {
                Ok(outgoing) => outgoing,
                Err(e) => {
                    error!("Failed to encode engine event of router {}: {}", router.id(), e);
                    continue;
                }
            };

            if engine_closed_router {
                if let Some(routers) = routers.upgrade() {
                    routers.remove(&router.id());
                }
            }

            if let Err(e) = channel.notify(
                outgoing.target,
                outgoing.method,
                outgoing.internal,
                outgoing.data,
            ) {
                debug!("Stopping event pump of router {}: {}", router.id(), e);
                break;
            }
        }
    })
}
