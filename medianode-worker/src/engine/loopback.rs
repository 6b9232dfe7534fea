//! In-memory engine that forwards no media
//!
//! Keeps the object graph and the state transitions a real engine would have
//! (producer close reaches its consumers, connect reports DTLS progress) so a
//! worker can be exercised end to end without native media code. Tests use
//! [`LoopbackRouter::emit`] to inject engine-originated events.

use super::{
    EngineAudioLevelObserver, EngineConsumer, EngineEvent, EngineEventSender, EngineProducer,
    EngineRouter, EngineTransport, MediaEngine,
};
use async_trait::async_trait;
use dashmap::DashMap;
use medianode_core::ids::{ConsumerId, ProducerId, RouterId, TransportId};
use medianode_core::protocol::{AudioLevelObserverOptions, ConsumerLayers, DtlsState, MediaKind};
use medianode_core::MediaNodeError;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

type RouterTable = DashMap<RouterId, Arc<LoopbackRouter>>;

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn kind_name(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    }
}

fn kind_value(kind: MediaKind) -> Value {
    Value::from(kind_name(kind))
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Engine keeping every object in memory
#[derive(Debug, Clone, Default)]
pub struct LoopbackEngine {
    routers: Arc<RouterTable>,
}

impl LoopbackEngine {
    /// Create an empty engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Live router by id
    pub fn router(&self, id: RouterId) -> Option<Arc<LoopbackRouter>> {
        self.routers.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live routers
    pub fn router_count(&self) -> usize {
        self.routers.len()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_router(
        &self,
        media_codecs: Value,
        events: EngineEventSender,
    ) -> Result<Arc<dyn EngineRouter>, MediaNodeError> {
        if !media_codecs.is_array() {
            return Err(MediaNodeError::engine("mediaCodecs must be an array"));
        }

        let engine = Arc::downgrade(&self.routers);
        let router = Arc::new_cyclic(|me| LoopbackRouter {
            id: RouterId::new(),
            me: me.clone(),
            engine,
            media_codecs,
            events,
            transports: DashMap::new(),
            producers: DashMap::new(),
            consumers: DashMap::new(),
            observer: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        debug!("Loopback router {} created", router.id);
        self.routers.insert(router.id, Arc::clone(&router));
        Ok(router)
    }
}

/// Router of the loopback engine
#[derive(Debug)]
pub struct LoopbackRouter {
    id: RouterId,
    me: Weak<LoopbackRouter>,
    engine: Weak<RouterTable>,
    media_codecs: Value,
    events: EngineEventSender,
    transports: DashMap<TransportId, Arc<LoopbackTransport>>,
    producers: DashMap<ProducerId, Arc<LoopbackProducer>>,
    consumers: DashMap<ConsumerId, Arc<LoopbackConsumer>>,
    observer: Mutex<Option<Arc<LoopbackAudioLevelObserver>>>,
    closed: AtomicBool,
}

impl LoopbackRouter {
    /// Push an event as if the engine raised it. Returns `false` once nobody listens.
    pub fn emit(&self, event: EngineEvent) -> bool {
        if self.events.send(event).is_err() {
            debug!("Loopback router {} has no event listener", self.id);
            return false;
        }
        true
    }

    /// Whether the router was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Live transport by id
    pub fn transport(&self, id: TransportId) -> Option<Arc<LoopbackTransport>> {
        self.transports.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live transports
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    /// Number of live producers
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    /// Number of live consumers
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Paused flag of a live producer
    pub fn producer_paused(&self, id: ProducerId) -> Option<bool> {
        self.producers
            .get(&id)
            .map(|producer| producer.paused.load(Ordering::SeqCst))
    }

    /// Paused flag of a live consumer
    pub fn consumer_paused(&self, id: ConsumerId) -> Option<bool> {
        self.consumers
            .get(&id)
            .map(|consumer| consumer.paused.load(Ordering::SeqCst))
    }

    /// Producers watched by the audio level observer
    pub fn observed_producer_count(&self) -> usize {
        self.observer
            .lock()
            .as_ref()
            .map(|observer| observer.producers.lock().len())
            .unwrap_or(0)
    }

    fn codecs_of_kind(&self, kind: MediaKind) -> Vec<Value> {
        let kind = kind_value(kind);
        self.media_codecs
            .as_array()
            .map(|codecs| {
                codecs
                    .iter()
                    .filter(|codec| codec.get("kind") == Some(&kind))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn ensure_open(&self) -> Result<(), MediaNodeError> {
        if self.is_closed() {
            return Err(MediaNodeError::engine(format!("Router {} closed", self.id)));
        }
        Ok(())
    }

    fn consumers_where(&self, predicate: impl Fn(&LoopbackConsumer) -> bool) -> Vec<ConsumerId> {
        self.consumers
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| *entry.key())
            .collect()
    }
}

#[async_trait]
impl EngineRouter for LoopbackRouter {
    fn id(&self) -> RouterId {
        self.id
    }

    fn rtp_capabilities(&self) -> Value {
        json!({
            "codecs": self.media_codecs,
            "headerExtensions": [],
        })
    }

    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &Value) -> bool {
        let Some(producer) = self.producers.get(&producer_id) else {
            return false;
        };
        let kind = kind_value(producer.kind);

        rtp_capabilities
            .get("codecs")
            .and_then(Value::as_array)
            .map(|codecs| codecs.iter().any(|codec| codec.get("kind") == Some(&kind)))
            .unwrap_or(false)
    }

    async fn create_webrtc_transport(
        &self,
        options: Value,
    ) -> Result<Arc<dyn EngineTransport>, MediaNodeError> {
        self.ensure_open()?;

        let listen_ips = options
            .get("listenIps")
            .and_then(Value::as_array)
            .filter(|ips| !ips.is_empty())
            .ok_or_else(|| MediaNodeError::engine("listenIps is required"))?;

        let mut rng = rand::thread_rng();
        let ice_candidates: Vec<Value> = listen_ips
            .iter()
            .filter_map(|listen_ip| {
                let ip = match listen_ip {
                    Value::String(ip) => ip.clone(),
                    other => other
                        .get("announcedIp")
                        .and_then(Value::as_str)
                        .or_else(|| other.get("ip").and_then(Value::as_str))?
                        .to_string(),
                };
                Some(json!({
                    "foundation": "udpcandidate",
                    "ip": ip,
                    "port": rng.gen_range(40000..50000),
                    "priority": 1076302079u32,
                    "protocol": "udp",
                    "type": "host",
                }))
            })
            .collect();

        let transport = Arc::new(LoopbackTransport {
            id: TransportId::new(),
            router: self.me.clone(),
            ice_parameters: Mutex::new(LoopbackTransport::fresh_ice_parameters()),
            ice_candidates: Value::Array(ice_candidates),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{
                    "algorithm": "sha-256",
                    "value": random_token(64),
                }],
            }),
            app_data: options.get("appData").cloned().unwrap_or_else(|| json!({})),
            connected: AtomicBool::new(false),
            max_incoming_bitrate: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        });

        self.transports.insert(transport.id, Arc::clone(&transport));
        Ok(transport)
    }

    async fn create_audio_level_observer(
        &self,
        options: AudioLevelObserverOptions,
    ) -> Result<Arc<dyn EngineAudioLevelObserver>, MediaNodeError> {
        self.ensure_open()?;
        if options.max_entries == 0 {
            return Err(MediaNodeError::engine("maxEntries must be at least 1"));
        }

        let observer = Arc::new(LoopbackAudioLevelObserver {
            router: self.me.clone(),
            options,
            producers: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        });
        *self.observer.lock() = Some(Arc::clone(&observer));
        Ok(observer)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Loopback router {} closed", self.id);

        for entry in self.transports.iter() {
            entry.value().closed.store(true, Ordering::SeqCst);
        }
        for entry in self.producers.iter() {
            entry.value().closed.store(true, Ordering::SeqCst);
        }
        for entry in self.consumers.iter() {
            entry.value().closed.store(true, Ordering::SeqCst);
        }
        self.transports.clear();
        self.producers.clear();
        self.consumers.clear();
        if let Some(observer) = self.observer.lock().take() {
            observer.closed.store(true, Ordering::SeqCst);
        }

        if let Some(engine) = self.engine.upgrade() {
            engine.remove(&self.id);
        }
    }
}

/// Transport of the loopback engine
#[derive(Debug)]
pub struct LoopbackTransport {
    id: TransportId,
    router: Weak<LoopbackRouter>,
    ice_parameters: Mutex<Value>,
    ice_candidates: Value,
    dtls_parameters: Value,
    app_data: Value,
    connected: AtomicBool,
    max_incoming_bitrate: AtomicU32,
    closed: AtomicBool,
}

impl LoopbackTransport {
    fn fresh_ice_parameters() -> Value {
        json!({
            "usernameFragment": random_token(16),
            "password": random_token(32),
            "iceLite": true,
        })
    }

    /// Whether `connect` succeeded
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Last applied incoming bitrate cap, 0 when unset
    pub fn max_incoming_bitrate(&self) -> u32 {
        self.max_incoming_bitrate.load(Ordering::SeqCst)
    }

    fn live_router(&self) -> Result<Arc<LoopbackRouter>, MediaNodeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaNodeError::engine(format!("Transport {} closed", self.id)));
        }
        self.router
            .upgrade()
            .ok_or_else(|| MediaNodeError::engine(format!("Transport {} closed", self.id)))
    }
}

#[async_trait]
impl EngineTransport for LoopbackTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn ice_parameters(&self) -> Value {
        self.ice_parameters.lock().clone()
    }

    fn ice_candidates(&self) -> Value {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> Value {
        self.dtls_parameters.clone()
    }

    fn app_data(&self) -> Value {
        self.app_data.clone()
    }

    async fn connect(&self, dtls_parameters: Value) -> Result<(), MediaNodeError> {
        let router = self.live_router()?;
        if dtls_parameters.get("fingerprints").is_none() {
            return Err(MediaNodeError::engine("dtlsParameters.fingerprints is required"));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(MediaNodeError::engine("connect() already called"));
        }

        for dtls_state in [DtlsState::Connecting, DtlsState::Connected] {
            router.emit(EngineEvent::DtlsStateChange {
                transport_id: self.id,
                dtls_state,
            });
        }
        Ok(())
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), MediaNodeError> {
        self.live_router()?;
        self.max_incoming_bitrate.store(bitrate, Ordering::SeqCst);
        Ok(())
    }

    async fn restart_ice(&self) -> Result<Value, MediaNodeError> {
        self.live_router()?;
        let ice_parameters = Self::fresh_ice_parameters();
        *self.ice_parameters.lock() = ice_parameters.clone();
        Ok(ice_parameters)
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<Arc<dyn EngineProducer>, MediaNodeError> {
        let router = self.live_router()?;
        if router.codecs_of_kind(kind).is_empty() {
            return Err(MediaNodeError::engine(format!(
                "Router has no {} codec",
                kind_name(kind)
            )));
        }

        let producer = Arc::new(LoopbackProducer {
            id: ProducerId::new(),
            transport_id: self.id,
            kind,
            router: Arc::downgrade(&router),
            _rtp_parameters: rtp_parameters,
            _app_data: app_data,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        router.producers.insert(producer.id, Arc::clone(&producer));
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: Value,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>, MediaNodeError> {
        let router = self.live_router()?;
        if !router.can_consume(producer_id, &rtp_capabilities) {
            return Err(MediaNodeError::engine(format!(
                "Cannot consume producer {}",
                producer_id
            )));
        }
        let producer = router
            .producers
            .get(&producer_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MediaNodeError::engine(format!("Producer {} not found", producer_id)))?;

        let consumer = Arc::new(LoopbackConsumer {
            id: ConsumerId::new(),
            producer_id,
            transport_id: self.id,
            kind: producer.kind,
            router: Arc::downgrade(&router),
            rtp_parameters: json!({
                "codecs": router.codecs_of_kind(producer.kind),
                "encodings": [{ "ssrc": rand::thread_rng().gen::<u32>() }],
            }),
            paused: AtomicBool::new(paused),
            producer_paused: AtomicBool::new(producer.paused.load(Ordering::SeqCst)),
            priority: AtomicU8::new(1),
            preferred_layers: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        router.consumers.insert(consumer.id, Arc::clone(&consumer));
        Ok(consumer)
    }

    async fn get_stats(&self) -> Result<Value, MediaNodeError> {
        self.live_router()?;
        let ice_state = if self.is_connected() { "connected" } else { "new" };
        Ok(json!([{
            "type": "webrtc-transport",
            "transportId": self.id,
            "timestamp": now_millis(),
            "iceState": ice_state,
            "bytesReceived": 0,
            "bytesSent": 0,
        }]))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(router) = self.router.upgrade() else {
            return;
        };
        router.transports.remove(&self.id);

        let producers: Vec<_> = router
            .producers
            .iter()
            .filter(|entry| entry.value().transport_id == self.id)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for producer in producers {
            producer.close();
        }

        for consumer_id in router.consumers_where(|consumer| consumer.transport_id == self.id) {
            if let Some((_, consumer)) = router.consumers.remove(&consumer_id) {
                consumer.closed.store(true, Ordering::SeqCst);
                router.emit(EngineEvent::ConsumerTransportClosed {
                    transport_id: self.id,
                    consumer_id,
                });
            }
        }
    }
}

/// Producer of the loopback engine
#[derive(Debug)]
pub struct LoopbackProducer {
    id: ProducerId,
    transport_id: TransportId,
    kind: MediaKind,
    router: Weak<LoopbackRouter>,
    _rtp_parameters: Value,
    _app_data: Value,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackProducer {
    fn set_paused(&self, paused: bool) -> Result<(), MediaNodeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaNodeError::engine(format!("Producer {} closed", self.id)));
        }
        if self.paused.swap(paused, Ordering::SeqCst) == paused {
            return Ok(());
        }
        let Some(router) = self.router.upgrade() else {
            return Ok(());
        };

        for consumer_id in router.consumers_where(|consumer| consumer.producer_id == self.id) {
            let Some(consumer) = router.consumers.get(&consumer_id).map(|e| Arc::clone(e.value()))
            else {
                continue;
            };
            consumer.producer_paused.store(paused, Ordering::SeqCst);
            let event = if paused {
                EngineEvent::ConsumerProducerPaused {
                    transport_id: consumer.transport_id,
                    consumer_id,
                }
            } else {
                EngineEvent::ConsumerProducerResumed {
                    transport_id: consumer.transport_id,
                    consumer_id,
                }
            };
            router.emit(event);
        }
        Ok(())
    }
}

#[async_trait]
impl EngineProducer for LoopbackProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn pause(&self) -> Result<(), MediaNodeError> {
        self.set_paused(true)
    }

    async fn resume(&self) -> Result<(), MediaNodeError> {
        self.set_paused(false)
    }

    async fn get_stats(&self) -> Result<Value, MediaNodeError> {
        Ok(json!([{
            "type": "inbound-rtp",
            "kind": kind_value(self.kind),
            "timestamp": now_millis(),
            "packetCount": 0,
        }]))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(router) = self.router.upgrade() else {
            return;
        };
        router.producers.remove(&self.id);
        if let Some(observer) = router.observer.lock().as_ref() {
            observer.producers.lock().remove(&self.id);
        }

        for consumer_id in router.consumers_where(|consumer| consumer.producer_id == self.id) {
            if let Some((_, consumer)) = router.consumers.remove(&consumer_id) {
                consumer.closed.store(true, Ordering::SeqCst);
                router.emit(EngineEvent::ConsumerProducerClosed {
                    transport_id: consumer.transport_id,
                    consumer_id,
                });
            }
        }
    }
}

/// Consumer of the loopback engine
#[derive(Debug)]
pub struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    transport_id: TransportId,
    kind: MediaKind,
    router: Weak<LoopbackRouter>,
    rtp_parameters: Value,
    paused: AtomicBool,
    producer_paused: AtomicBool,
    priority: AtomicU8,
    preferred_layers: Mutex<Option<ConsumerLayers>>,
    closed: AtomicBool,
}

impl LoopbackConsumer {
    fn ensure_open(&self) -> Result<(), MediaNodeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaNodeError::engine(format!("Consumer {} closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineConsumer for LoopbackConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> String {
        "simple".to_string()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn producer_paused(&self) -> bool {
        self.producer_paused.load(Ordering::SeqCst)
    }

    fn score(&self) -> Value {
        json!({ "score": 10, "producerScore": 10, "producerScores": [] })
    }

    async fn pause(&self) -> Result<(), MediaNodeError> {
        self.ensure_open()?;
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), MediaNodeError> {
        self.ensure_open()?;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> Result<(), MediaNodeError> {
        self.ensure_open()?;
        *self.preferred_layers.lock() = Some(layers);
        Ok(())
    }

    async fn set_priority(&self, priority: u8) -> Result<(), MediaNodeError> {
        self.ensure_open()?;
        if priority == 0 {
            return Err(MediaNodeError::engine("priority must be between 1 and 255"));
        }
        self.priority.store(priority, Ordering::SeqCst);
        Ok(())
    }

    async fn request_key_frame(&self) -> Result<(), MediaNodeError> {
        self.ensure_open()
    }

    async fn get_stats(&self) -> Result<Value, MediaNodeError> {
        self.ensure_open()?;
        Ok(json!([{
            "type": "outbound-rtp",
            "kind": kind_value(self.kind),
            "timestamp": now_millis(),
            "priority": self.priority.load(Ordering::SeqCst),
            "preferredLayers": *self.preferred_layers.lock(),
        }]))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(router) = self.router.upgrade() {
            router.consumers.remove(&self.id);
        }
    }
}

/// Audio level observer of the loopback engine
#[derive(Debug)]
pub struct LoopbackAudioLevelObserver {
    router: Weak<LoopbackRouter>,
    options: AudioLevelObserverOptions,
    producers: Mutex<HashSet<ProducerId>>,
    closed: AtomicBool,
}

impl LoopbackAudioLevelObserver {
    /// Options the observer was created with
    pub fn options(&self) -> AudioLevelObserverOptions {
        self.options
    }
}

#[async_trait]
impl EngineAudioLevelObserver for LoopbackAudioLevelObserver {
    async fn add_producer(&self, producer_id: ProducerId) -> Result<(), MediaNodeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaNodeError::engine("Audio level observer closed"));
        }
        let router = self
            .router
            .upgrade()
            .ok_or_else(|| MediaNodeError::engine("Audio level observer closed"))?;
        let kind = router
            .producers
            .get(&producer_id)
            .map(|producer| producer.kind)
            .ok_or_else(|| MediaNodeError::engine(format!("Producer {} not found", producer_id)))?;
        if kind != MediaKind::Audio {
            return Err(MediaNodeError::engine(format!(
                "Producer {} is not an audio producer",
                producer_id
            )));
        }

        self.producers.lock().insert(producer_id);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.producers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn codecs() -> Value {
        json!([
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
        ])
    }

    async fn router() -> (Arc<dyn EngineRouter>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = LoopbackEngine::new().create_router(codecs(), tx).await.unwrap();
        (router, rx)
    }

    async fn transport(router: &Arc<dyn EngineRouter>) -> Arc<dyn EngineTransport> {
        router
            .create_webrtc_transport(json!({ "listenIps": [{ "ip": "127.0.0.1" }] }))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_reports_dtls_progress() {
        let (router, mut events) = router().await;
        let transport = transport(&router).await;

        transport
            .connect(json!({ "role": "client", "fingerprints": [] }))
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert!(matches!(first, EngineEvent::DtlsStateChange { dtls_state: DtlsState::Connecting, .. }));
        assert!(matches!(second, EngineEvent::DtlsStateChange { dtls_state: DtlsState::Connected, .. }));

        // A second connect is an engine error
        assert!(transport.connect(json!({ "fingerprints": [] })).await.is_err());
    }

    #[tokio::test]
    async fn test_producer_close_reaches_consumers() {
        let (router, mut events) = router().await;
        let send = transport(&router).await;
        let recv = transport(&router).await;

        let producer = send
            .produce(MediaKind::Audio, json!({}), json!({}))
            .await
            .unwrap();
        let consumer = recv
            .consume(producer.id(), router.rtp_capabilities(), false)
            .await
            .unwrap();

        producer.close();

        match events.recv().await.unwrap() {
            EngineEvent::ConsumerProducerClosed {
                transport_id,
                consumer_id,
            } => {
                assert_eq!(transport_id, recv.id());
                assert_eq!(consumer_id, consumer.id());
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_can_consume_requires_matching_kind() {
        let (router, _events) = router().await;
        let send = transport(&router).await;
        let producer = send
            .produce(MediaKind::Video, json!({}), json!({}))
            .await
            .unwrap();

        let audio_only = json!({ "codecs": [{ "kind": "audio", "mimeType": "audio/opus" }] });
        assert!(!router.can_consume(producer.id(), &audio_only));
        assert!(router.can_consume(producer.id(), &router.rtp_capabilities()));
        assert!(!router.can_consume(ProducerId::new(), &router.rtp_capabilities()));
    }

    #[tokio::test]
    async fn test_transport_requires_listen_ips() {
        let (router, _events) = router().await;
        let err = router.create_webrtc_transport(json!({})).await.err().unwrap();
        assert_eq!(err.error_code(), "ENGINE_ERROR");
    }
}
