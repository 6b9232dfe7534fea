//! Worker server tests over a real WebSocket on the loopback interface

use futures::{SinkExt, StreamExt};
use medianode_core::protocol::{
    decode, method, ConsumeResponse, CreateRouterResponse, ErrorCode, FreeResponse,
    ProduceResponse, WebRtcTransportData, SECRET_HEADER,
};
use medianode_core::*;
use medianode_worker::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const SECRET: &str = "s3cret";

async fn start_worker(engine: LoopbackEngine) -> WorkerHandle {
    let config = WorkerConfig {
        secret: SECRET.to_string(),
        capacity_interval_ms: 20,
        ..Default::default()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let handle = WorkerServer::new(config, Arc::new(engine))
        .unwrap()
        .with_sampler(|| -> Result<f64, SampleError> { Ok(42.0) })
        .serve(listener)
        .unwrap();

    // Wait for the first capacity sample
    for _ in 0..50 {
        if handle.capacity().free.is_some() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    handle
}

async fn connect(handle: &WorkerHandle) -> (Channel, mpsc::UnboundedReceiver<Inbound>) {
    let options = ChannelOptions {
        request_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
    };
    Channel::connect(&handle.local_addr().to_string(), SECRET, options)
        .await
        .unwrap()
}

async fn create_router(channel: &Channel) -> RouterId {
    let reply = channel
        .request(
            Target::Worker,
            method::CREATE_ROUTER,
            Internal::default(),
            json!({ "mediaCodecs": null }),
        )
        .await
        .unwrap();
    decode::<CreateRouterResponse>(reply).unwrap().id
}

async fn create_transport(channel: &Channel, router_id: RouterId) -> WebRtcTransportData {
    let reply = channel
        .request(
            Target::Router,
            method::CREATE_WEBRTC_TRANSPORT,
            Internal::router(router_id),
            json!({ "webRtcTransportOptions": { "appData": { "peer": "alice" } } }),
        )
        .await
        .unwrap();
    decode(reply).unwrap()
}

async fn next_notification(rx: &mut mpsc::UnboundedReceiver<Inbound>) -> Notification {
    match timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(Inbound::Notification(notification))) => notification,
        other => panic!("Expected notification, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_wrong_secret_is_rejected() {
    let handle = start_worker(LoopbackEngine::new()).await;

    let err = Channel::connect(
        &handle.local_addr().to_string(),
        "guess",
        ChannelOptions::default(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, MediaNodeError::HandshakeRejected { .. }));
    assert!(err.is_connection_error());
    assert_eq!(handle.session_count(), 0);
    handle.shutdown();
}

#[tokio::test]
async fn test_free_returns_last_sample() {
    let handle = start_worker(LoopbackEngine::new()).await;
    let (channel, _inbound) = connect(&handle).await;

    sleep(Duration::from_millis(50)).await;
    let reply = channel
        .request(Target::MediaNode, method::FREE, Internal::default(), json!({}))
        .await
        .unwrap();
    let free: FreeResponse = decode(reply).unwrap();
    assert_eq!(free.free, 42.0);

    handle.shutdown();
}

#[tokio::test]
async fn test_create_router_uses_default_codecs() {
    let engine = LoopbackEngine::new();
    let handle = start_worker(engine.clone()).await;
    let (channel, _inbound) = connect(&handle).await;

    let router_id = create_router(&channel).await;
    assert_eq!(engine.router_count(), 1);

    let reply = channel
        .request(
            Target::Router,
            method::GET_RTP_CAPABILITIES,
            Internal::router(router_id),
            Value::Null,
        )
        .await
        .unwrap();
    let codecs = reply["rtpCapabilities"]["codecs"].as_array().unwrap();
    assert_eq!(codecs.len(), default_media_codecs().as_array().unwrap().len());

    handle.shutdown();
}

#[tokio::test]
async fn test_transport_carries_defaults_and_app_data() {
    let engine = LoopbackEngine::new();
    let handle = start_worker(engine.clone()).await;
    let (channel, _inbound) = connect(&handle).await;

    let router_id = create_router(&channel).await;
    let transport = create_transport(&channel, router_id).await;

    assert_eq!(transport.app_data, json!({ "peer": "alice" }));
    assert!(!transport.ice_candidates.as_array().unwrap().is_empty());

    let loopback = engine.router(router_id).unwrap();
    let engine_transport = loopback.transport(transport.id).unwrap();
    assert_eq!(engine_transport.max_incoming_bitrate(), 1_500_000);

    handle.shutdown();
}

#[tokio::test]
async fn test_consume_on_unknown_transport_is_not_found() {
    let handle = start_worker(LoopbackEngine::new()).await;
    let (channel, _inbound) = connect(&handle).await;
    let router_id = create_router(&channel).await;

    let started = tokio::time::Instant::now();
    let err = channel
        .request(
            Target::Transport,
            method::CONSUME,
            Internal::transport(router_id, TransportId::new()),
            json!({ "producerId": ProducerId::new(), "rtpCapabilities": {} }),
        )
        .await
        .unwrap_err();

    match err {
        MediaNodeError::Rejected { code, reason } => {
            assert_eq!(code, ErrorCode::NotFound);
            assert!(reason.contains("No such transport"));
        }
        other => panic!("Expected NOT_FOUND, got: {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    handle.shutdown();
}

#[tokio::test]
async fn test_unsupported_method() {
    let handle = start_worker(LoopbackEngine::new()).await;
    let (channel, _inbound) = connect(&handle).await;

    let err = channel
        .request(Target::Worker, "dance", Internal::default(), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MediaNodeError::Rejected {
            code: ErrorCode::UnsupportedMethod,
            ..
        }
    ));

    handle.shutdown();
}

#[tokio::test]
async fn test_close_notification_closes_router() {
    let engine = LoopbackEngine::new();
    let handle = start_worker(engine.clone()).await;
    let (channel, _inbound) = connect(&handle).await;

    let router_id = create_router(&channel).await;
    let loopback = engine.router(router_id).unwrap();

    channel
        .notify(Target::Router, method::CLOSE, Internal::router(router_id), json!({}))
        .unwrap();
    // Closing twice is harmless
    channel
        .notify(Target::Router, method::CLOSE, Internal::router(router_id), json!({}))
        .unwrap();

    sleep(Duration::from_millis(100)).await;
    assert!(loopback.is_closed());
    assert_eq!(engine.router_count(), 0);

    let err = channel
        .request(
            Target::Router,
            method::GET_RTP_CAPABILITIES,
            Internal::router(router_id),
            Value::Null,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MediaNodeError::Rejected {
            code: ErrorCode::NotFound,
            ..
        }
    ));

    handle.shutdown();
}

#[tokio::test]
async fn test_channel_loss_closes_routers() {
    let engine = LoopbackEngine::new();
    let handle = start_worker(engine.clone()).await;
    let (channel, _inbound) = connect(&handle).await;

    create_router(&channel).await;
    create_router(&channel).await;
    assert_eq!(engine.router_count(), 2);
    assert_eq!(handle.session_count(), 1);

    channel.close();
    sleep(Duration::from_millis(200)).await;

    assert_eq!(engine.router_count(), 0);
    assert_eq!(handle.session_count(), 0);
    handle.shutdown();
}

#[tokio::test]
async fn test_engine_events_become_notifications() {
    let engine = LoopbackEngine::new();
    let handle = start_worker(engine.clone()).await;
    let (channel, mut inbound) = connect(&handle).await;

    let router_id = create_router(&channel).await;
    let loopback = engine.router(router_id).unwrap();

    assert!(loopback.emit(EngineEvent::Silence));
    let notification = next_notification(&mut inbound).await;
    assert_eq!(notification.target, Target::Router);
    assert_eq!(notification.method, method::SILENCE);
    assert_eq!(notification.internal.router_id, Some(router_id));

    let transport = create_transport(&channel, router_id).await;
    channel
        .request(
            Target::Transport,
            method::CONNECT,
            Internal::transport(router_id, transport.id),
            json!({ "dtlsParameters": { "role": "client", "fingerprints": [] } }),
        )
        .await
        .unwrap();

    for expected in ["connecting", "connected"] {
        let notification = next_notification(&mut inbound).await;
        assert_eq!(notification.target, Target::Transport);
        assert_eq!(notification.method, method::DTLS_STATE_CHANGE);
        assert_eq!(notification.internal.transport_id, Some(transport.id));
        assert_eq!(notification.data["dtlsState"], expected);
    }

    handle.shutdown();
}

#[tokio::test]
async fn test_producer_pause_reaches_consumer() {
    let engine = LoopbackEngine::new();
    let handle = start_worker(engine.clone()).await;
    let (channel, mut inbound) = connect(&handle).await;

    let router_id = create_router(&channel).await;
    let send = create_transport(&channel, router_id).await;
    let recv = create_transport(&channel, router_id).await;

    let reply = channel
        .request(
            Target::Transport,
            method::PRODUCE,
            Internal::transport(router_id, send.id),
            json!({ "kind": "audio", "rtpParameters": {} }),
        )
        .await
        .unwrap();
    let producer: ProduceResponse = decode(reply).unwrap();

    let reply = channel
        .request(
            Target::Transport,
            method::CONSUME,
            Internal::transport(router_id, recv.id),
            json!({
                "producerId": producer.id,
                "rtpCapabilities": { "codecs": [{ "kind": "audio", "mimeType": "audio/opus" }] },
                "paused": true,
            }),
        )
        .await
        .unwrap();
    let consumer: ConsumeResponse = decode(reply).unwrap();
    assert!(consumer.paused);
    assert!(!consumer.producer_paused);
    assert_eq!(consumer.producer_id, producer.id);

    channel
        .request(
            Target::Producer,
            method::PAUSE,
            Internal::producer(router_id, send.id, producer.id),
            Value::Null,
        )
        .await
        .unwrap();

    let notification = next_notification(&mut inbound).await;
    assert_eq!(notification.target, Target::Consumer);
    assert_eq!(notification.method, method::PRODUCER_PAUSE);
    assert_eq!(notification.internal.consumer_id, Some(consumer.id));

    // Closing the producer tells the consumer
    channel
        .notify(
            Target::Producer,
            method::CLOSE,
            Internal::producer(router_id, send.id, producer.id),
            json!({}),
        )
        .unwrap();
    let notification = next_notification(&mut inbound).await;
    assert_eq!(notification.method, method::PRODUCER_CLOSE);
    assert_eq!(notification.internal.consumer_id, Some(consumer.id));

    handle.shutdown();
}

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn raw_connect(handle: &WorkerHandle) -> RawSocket {
    let mut request = format!("ws://{}", handle.local_addr())
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(SECRET_HEADER, HeaderValue::from_static(SECRET));
    let (ws, _) = connect_async(request).await.unwrap();
    ws
}

async fn send_raw(ws: &mut RawSocket, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn next_response(ws: &mut RawSocket) -> (u32, Option<ErrorCode>) {
    loop {
        match timeout(Duration::from_secs(1), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str(&text).unwrap() {
                WireMessage::Response { id, error, .. } => {
                    return (id, error.map(|error| error.code))
                }
                other => panic!("Expected a response, got: {:?}", other),
            },
            Ok(Some(Ok(_))) => continue,
            other => panic!("No reply to the request: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_undecodable_requests_are_answered() {
    let handle = start_worker(LoopbackEngine::new()).await;
    let mut ws = raw_connect(&handle).await;
    let started = Instant::now();

    send_raw(
        &mut ws,
        json!({ "type": "request", "id": 10, "target": "bogusTarget", "method": "free", "data": {} }),
    )
    .await;
    assert_eq!(
        next_response(&mut ws).await,
        (10, Some(ErrorCode::UnsupportedMethod))
    );

    send_raw(
        &mut ws,
        json!({
            "type": "request",
            "id": 11,
            "target": "transport",
            "method": "consume",
            "internal": { "routerId": "r1", "transportId": "t1" },
            "data": {},
        }),
    )
    .await;
    assert_eq!(
        next_response(&mut ws).await,
        (11, Some(ErrorCode::InvalidMessage))
    );

    // Still usable afterwards
    send_raw(
        &mut ws,
        json!({ "type": "request", "id": 12, "target": "mediaNode", "method": "free" }),
    )
    .await;
    assert_eq!(next_response(&mut ws).await, (12, None));

    assert!(started.elapsed() < Duration::from_secs(2));
    handle.shutdown();
}
