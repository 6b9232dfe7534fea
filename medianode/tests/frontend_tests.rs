//! Front-end proxies driving a loopback media node over a real WebSocket

use medianode::*;
use futures::{SinkExt, StreamExt};
use medianode_core::protocol::{method, ErrorCode};
use medianode_core::{Channel, Internal, Target};
use medianode_worker::engine::LoopbackRouter;
use medianode_worker::{
    EngineEvent, LoopbackEngine, SampleError, WorkerConfig, WorkerHandle, WorkerServer,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

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

    for _ in 0..50 {
        if handle.capacity().free.is_some() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    handle
}

fn handler_for(addresses: &[String]) -> MediaHandler {
    let config = FrontendConfig {
        request_timeout_ms: 2_000,
        connect_timeout_ms: 1_000,
        ..FrontendConfig::with_nodes(addresses.iter().cloned(), SECRET)
    };
    MediaHandler::new(&config).unwrap()
}

fn audio_capabilities() -> Value {
    json!({ "codecs": [{ "kind": "audio", "mimeType": "audio/opus" }] })
}

/// Poll `condition` until it holds or two seconds pass
async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    timeout(Duration::from_secs(2), future)
        .await
        .expect("timed out")
}

fn engine_router(engine: &LoopbackEngine, router: &Router) -> Arc<LoopbackRouter> {
    engine.router(router.id()).expect("router exists on the engine")
}

struct Session {
    engine: LoopbackEngine,
    worker: WorkerHandle,
    handler: MediaHandler,
    router: Router,
}

async fn session() -> Session {
    let engine = LoopbackEngine::new();
    let worker = start_worker(engine.clone()).await;
    let handler = handler_for(&[worker.local_addr().to_string()]);
    let router = handler.create_router(None).await.unwrap();
    Session {
        engine,
        worker,
        handler,
        router,
    }
}

#[tokio::test]
async fn test_router_verbs() {
    let Session {
        engine,
        worker,
        handler,
        router,
    } = session().await;

    assert_eq!(router.state(), ResourceState::Active);
    assert!(router.worker().is_some());
    assert_eq!(handler.workers()[0].router_count(), 1);
    assert_eq!(handler.workers()[0].state(), ConnectionState::Connected);
    assert_eq!(engine.router_count(), 1);

    let capabilities = router.rtp_capabilities().await.unwrap();
    assert!(capabilities["codecs"].as_array().is_some_and(|codecs| !codecs.is_empty()));

    let transport = router
        .create_webrtc_transport(json!({ "appData": { "peer": "alice" } }))
        .await
        .unwrap();
    assert_eq!(transport.state(), ResourceState::Created);
    assert_eq!(transport.router_id(), router.id());
    assert_eq!(transport.app_data()["peer"], "alice");
    assert!(transport.ice_candidates().as_array().is_some_and(|c| !c.is_empty()));
    assert!(router.transport(transport.id()).is_some());

    let producer = transport
        .produce(MediaKind::Audio, json!({}), json!({ "source": "mic" }))
        .await
        .unwrap();
    assert_eq!(router.can_consume(producer.id(), audio_capabilities()).await, Some(true));
    assert_eq!(router.can_consume(producer.id(), json!({ "codecs": [] })).await, Some(false));

    handler.close();
    worker.shutdown();
}

#[tokio::test]
async fn test_transport_verbs() {
    let Session {
        engine,
        worker,
        handler,
        router,
    } = session().await;

    let transport = router.create_webrtc_transport(json!({})).await.unwrap();
    let mut events = transport.events();

    transport.connect(json!({ "role": "client", "fingerprints": [] })).await;
    assert_eq!(transport.state(), ResourceState::Active);

    let event = within(events.next()).await.unwrap();
    assert_eq!(event.event_type(), "dtlsstatechange");
    let engine_transport = engine_router(&engine, &router)
        .transport(transport.id())
        .unwrap();
    assert!(engine_transport.is_connected());
    assert!(eventually(|| transport.dtls_state() == Some(DtlsState::Connected)).await);

    transport.set_max_incoming_bitrate(900_000).await;
    assert_eq!(engine_transport.max_incoming_bitrate(), 900_000);

    let before = transport.ice_parameters();
    let after = transport.restart_ice().await.unwrap();
    assert_ne!(before, after);
    assert_eq!(transport.ice_parameters(), after);

    assert!(transport.get_stats().await.is_some());

    handler.close();
    worker.shutdown();
}

#[tokio::test]
async fn test_produce_pause_resume_ends_active() {
    let Session {
        engine,
        worker,
        handler,
        router,
    } = session().await;

    let transport = router.create_webrtc_transport(json!({})).await.unwrap();
    let producer = transport
        .produce(MediaKind::Audio, json!({}), Value::Null)
        .await
        .unwrap();
    assert_eq!(producer.state(), ResourceState::Active);
    assert_eq!(producer.transport_id(), transport.id());
    assert_eq!(transport.producer_count(), 1);

    producer.pause().await;
    assert_eq!(producer.state(), ResourceState::Paused);
    assert!(producer.paused());
    assert_eq!(
        engine_router(&engine, &router).producer_paused(producer.id()),
        Some(true)
    );

    producer.resume().await;
    assert_eq!(producer.state(), ResourceState::Active);
    assert_eq!(
        engine_router(&engine, &router).producer_paused(producer.id()),
        Some(false)
    );

    assert!(producer.get_stats().await.is_some());

    handler.close();
    worker.shutdown();
}

#[tokio::test]
async fn test_consumer_caches_last_notification() {
    let Session {
        engine,
        worker,
        handler,
        router,
    } = session().await;

    let send = router.create_webrtc_transport(json!({})).await.unwrap();
    let recv = router.create_webrtc_transport(json!({})).await.unwrap();
    let producer = send
        .produce(MediaKind::Audio, json!({}), Value::Null)
        .await
        .unwrap();
    let consumer = recv
        .consume(producer.id(), audio_capabilities(), true)
        .await
        .unwrap();
    assert_eq!(consumer.state(), ResourceState::Paused);
    assert_eq!(consumer.producer_id(), producer.id());
    assert_eq!(consumer.kind(), MediaKind::Audio);
    assert!(!consumer.producer_paused());

    let mut events = consumer.events();
    producer.pause().await;
    assert_eq!(within(events.next()).await, Some(ConsumerEvent::ProducerPause));

    engine_router(&engine, &router).emit(EngineEvent::ConsumerScore {
        transport_id: recv.id(),
        consumer_id: consumer.id(),
        score: json!(7),
    });
    assert_eq!(
        within(events.next()).await,
        Some(ConsumerEvent::Score { score: json!(7) })
    );

    assert!(consumer.producer_paused());
    assert_eq!(consumer.score(), json!(7));

    handler.close();
    worker.shutdown();
}

#[tokio::test]
async fn test_consumer_verbs() {
    let Session {
        engine,
        worker,
        handler,
        router,
    } = session().await;

    let send = router.create_webrtc_transport(json!({})).await.unwrap();
    let recv = router.create_webrtc_transport(json!({})).await.unwrap();
    let producer = send
        .produce(MediaKind::Audio, json!({}), Value::Null)
        .await
        .unwrap();
    let consumer = recv
        .consume(producer.id(), audio_capabilities(), false)
        .await
        .unwrap();
    assert_eq!(consumer.state(), ResourceState::Active);

    consumer.pause().await;
    assert!(consumer.paused());
    assert_eq!(
        engine_router(&engine, &router).consumer_paused(consumer.id()),
        Some(true)
    );
    consumer.resume().await;
    assert_eq!(consumer.state(), ResourceState::Active);

    consumer.set_preferred_layers(1, Some(0)).await;
    consumer.set_priority(2).await;
    consumer.request_key_frame().await;
    assert!(consumer.get_stats().await.is_some());
    assert!(!consumer.is_closed());

    handler.close();
    worker.shutdown();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let Session {
        engine,
        worker,
        handler,
        router,
    } = session().await;

    let transport = router.create_webrtc_transport(json!({})).await.unwrap();
    let producer = transport
        .produce(MediaKind::Audio, json!({}), Value::Null)
        .await
        .unwrap();
    let mut events = producer.events();

    producer.close();
    producer.close();
    assert!(producer.is_closed());
    assert_eq!(transport.producer_count(), 0);
    assert_eq!(
        within(events.next()).await,
        Some(ProducerEvent::Closed {
            origin: CloseOrigin::Local
        })
    );
    assert_eq!(within(events.next()).await, None);

    // A verb on a closed producer is a no-op
    producer.pause().await;
    assert!(producer.is_closed());

    assert!(eventually(|| engine_router(&engine, &router).producer_count() == 0).await);

    handler.close();
    worker.shutdown();
}

#[tokio::test]
async fn test_router_close_cascades() {
    let Session {
        engine,
        worker,
        handler,
        router,
    } = session().await;

    let send = router.create_webrtc_transport(json!({})).await.unwrap();
    let recv = router.create_webrtc_transport(json!({})).await.unwrap();
    let producer = send
        .produce(MediaKind::Audio, json!({}), Value::Null)
        .await
        .unwrap();
    let consumer = recv
        .consume(producer.id(), audio_capabilities(), false)
        .await
        .unwrap();
    let observer = router
        .create_audio_level_observer(AudioLevelObserverOptions::default())
        .await
        .unwrap();

    let mut consumer_events = consumer.events();
    router.close();

    assert!(router.is_closed());
    assert!(send.is_closed());
    assert!(recv.is_closed());
    assert!(producer.is_closed());
    assert!(consumer.is_closed());
    assert!(observer.is_closed());
    assert!(router.transports().is_empty());
    assert_eq!(
        within(consumer_events.next()).await,
        Some(ConsumerEvent::Closed {
            origin: CloseOrigin::Parent
        })
    );
    assert_eq!(handler.workers()[0].router_count(), 0);
    assert!(eventually(|| engine.router_count() == 0).await);

    // Second close is a no-op
    router.close();
    assert!(router.create_webrtc_transport(json!({})).await.is_none());

    handler.close();
    worker.shutdown();
}

#[tokio::test]
async fn test_consume_unknown_transport_fails_fast() {
    let engine = LoopbackEngine::new();
    let worker = start_worker(engine.clone()).await;

    let options = ChannelOptions {
        request_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(1),
    };
    let (channel, _inbound) = Channel::connect(&worker.local_addr().to_string(), SECRET, options)
        .await
        .unwrap();

    let rpc = RpcClient::new(channel, Target::Worker, Internal::default());
    let reply = rpc
        .call("createRouter", json!({ "mediaCodecs": null }))
        .await
        .unwrap();
    let router_id: RouterId = serde_json::from_value(reply["id"].clone()).unwrap();

    let transport = rpc.scoped(
        Target::Transport,
        Internal::transport(router_id, TransportId::new()),
    );
    let started = Instant::now();
    let err = transport
        .call(
            "consume",
            json!({
                "producerId": ProducerId::new(),
                "rtpCapabilities": audio_capabilities(),
                "paused": false,
            }),
        )
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(1));
    match err {
        MediaNodeError::Rejected { code, reason } => {
            assert_eq!(code, ErrorCode::NotFound);
            assert!(reason.contains("transport"), "reason: {}", reason);
        }
        other => panic!("Expected a rejection, got: {:?}", other),
    }

    rpc.channel().close();
    worker.shutdown();
}

#[tokio::test]
async fn test_worker_initiated_close_reaches_proxy() {
    let Session {
        engine,
        worker,
        handler,
        router,
    } = session().await;

    let transport = router.create_webrtc_transport(json!({})).await.unwrap();
    let mut events = transport.events();

    engine_router(&engine, &router).emit(EngineEvent::TransportClosed {
        transport_id: transport.id(),
    });

    assert_eq!(
        within(events.next()).await,
        Some(TransportEvent::Closed {
            origin: CloseOrigin::Remote
        })
    );
    assert!(transport.is_closed());
    assert!(router.transport(transport.id()).is_none());
    assert!(!router.is_closed());

    let mut router_events = router.events();
    engine_router(&engine, &router).emit(EngineEvent::RouterClosed);
    assert_eq!(
        within(router_events.next()).await,
        Some(RouterEvent::Closed {
            origin: CloseOrigin::Remote
        })
    );
    assert_eq!(handler.workers()[0].router_count(), 0);

    handler.close();
    worker.shutdown();
}

#[tokio::test]
async fn test_unknown_ids_are_dropped() {
    let Session {
        engine,
        worker,
        handler,
        router,
    } = session().await;

    let transport = router.create_webrtc_transport(json!({})).await.unwrap();
    let mut events = transport.events();

    // Events for resources the front-end never saw
    let node_router = engine_router(&engine, &router);
    node_router.emit(EngineEvent::TransportClosed {
        transport_id: TransportId::new(),
    });
    node_router.emit(EngineEvent::ConsumerScore {
        transport_id: transport.id(),
        consumer_id: ConsumerId::new(),
        score: json!(3),
    });
    node_router.emit(EngineEvent::DtlsStateChange {
        transport_id: transport.id(),
        dtls_state: DtlsState::Failed,
    });

    assert_eq!(
        within(events.next()).await,
        Some(TransportEvent::DtlsStateChange {
            dtls_state: DtlsState::Failed
        })
    );
    assert!(!transport.is_closed());
    assert!(!router.is_closed());

    handler.close();
    worker.shutdown();
}

#[tokio::test]
async fn test_volumes_reach_observer() {
    let Session {
        engine,
        worker,
        handler,
        router,
    } = session().await;

    let transport = router.create_webrtc_transport(json!({})).await.unwrap();
    let producer = transport
        .produce(MediaKind::Audio, json!({}), Value::Null)
        .await
        .unwrap();
    let observer = router
        .create_audio_level_observer(AudioLevelObserverOptions::default())
        .await
        .unwrap();
    assert_eq!(observer.router_id(), router.id());
    assert!(router.audio_level_observer().is_some());

    observer.add_producer(producer.id()).await;
    assert_eq!(engine_router(&engine, &router).observed_producer_count(), 1);

    let mut events = observer.events();
    let volumes = vec![AudioVolume {
        producer_id: producer.id(),
        volume: -40,
    }];
    engine_router(&engine, &router).emit(EngineEvent::Volumes {
        volumes: volumes.clone(),
    });
    engine_router(&engine, &router).emit(EngineEvent::Silence);

    assert_eq!(
        within(events.next()).await,
        Some(AudioLevelObserverEvent::Volumes { volumes })
    );
    assert_eq!(
        within(events.next()).await,
        Some(AudioLevelObserverEvent::Silence)
    );

    handler.close();
    worker.shutdown();
}

#[tokio::test]
async fn test_capacity_is_reported() {
    let Session {
        worker, handler, ..
    } = session().await;

    sleep(Duration::from_millis(500)).await;
    let node = &handler.workers()[0];
    assert_eq!(node.capacity().await, Some(42.0));
    assert_eq!(node.last_capacity(), Some(42.0));
    assert_eq!(handler.directory().refresh_capacity().await, vec![Some(42.0)]);

    handler.close();
    worker.shutdown();
}

#[tokio::test]
async fn test_channel_loss_closes_proxies() {
    let Session {
        worker,
        handler,
        router,
        ..
    } = session().await;

    let transport = router.create_webrtc_transport(json!({})).await.unwrap();
    let producer = transport
        .produce(MediaKind::Audio, json!({}), Value::Null)
        .await
        .unwrap();
    let mut events = router.events();

    worker.shutdown();

    assert_eq!(
        within(events.next()).await,
        Some(RouterEvent::Closed {
            origin: CloseOrigin::ChannelClosed
        })
    );
    assert!(transport.is_closed());
    assert!(producer.is_closed());
    assert_eq!(handler.workers()[0].router_count(), 0);
    assert!(eventually(|| handler.workers()[0].state() == ConnectionState::Disconnected).await);

    // The node is gone: creation fails and is not retried elsewhere
    let err = handler.create_router(None).await.unwrap_err();
    assert!(err.is_connection_error());
}

#[tokio::test]
async fn test_no_fallback_to_another_node() {
    let engine = LoopbackEngine::new();
    let up = start_worker(engine.clone()).await;

    // Reserve a port with nobody listening on it
    let down = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let down_addr = down.local_addr().unwrap().to_string();
    drop(down);

    let handler = handler_for(&[up.local_addr().to_string(), down_addr]);

    let mut created = 0;
    for _ in 0..20 {
        match handler.create_router(None).await {
            Ok(_) => created += 1,
            Err(e) => assert!(e.is_connection_error(), "unexpected error: {}", e),
        }
    }

    // Every success landed on the live node; every failure stayed a failure
    assert_eq!(handler.workers()[0].router_count(), created);
    assert_eq!(handler.workers()[1].router_count(), 0);
    assert_eq!(engine.router_count(), created);

    handler.close();
    up.shutdown();
}

#[tokio::test]
async fn test_handler_close_cascades() {
    let Session {
        engine,
        worker,
        handler,
        router,
    } = session().await;

    let transport = router.create_webrtc_transport(json!({})).await.unwrap();
    handler.close();

    assert!(router.is_closed());
    assert!(transport.is_closed());
    assert_eq!(handler.workers()[0].router_count(), 0);
    assert_eq!(handler.workers()[0].state(), ConnectionState::Disconnected);

    // The media node drops the routers of the lost channel
    assert!(eventually(|| engine.router_count() == 0).await);
    assert!(eventually(|| worker.session_count() == 0).await);

    worker.shutdown();
}

#[tokio::test]
async fn test_most_free_capacity_policy() {
    let engine = LoopbackEngine::new();
    let worker = start_worker(engine.clone()).await;

    let config = FrontendConfig {
        selection_policy: SelectionPolicy::MostFreeCapacity,
        connect_timeout_ms: 500,
        ..FrontendConfig::with_nodes(
            ["127.0.0.1:1".to_string(), worker.local_addr().to_string()],
            SECRET,
        )
    };
    let handler = MediaHandler::new(&config).unwrap();

    // The unreachable node reports nothing and ranks last
    let capacities = handler.directory().refresh_capacity().await;
    assert_eq!(capacities, vec![None, Some(42.0)]);

    for _ in 0..5 {
        handler.create_router(None).await.unwrap();
    }
    assert_eq!(handler.workers()[1].router_count(), 5);

    handler.close();
    worker.shutdown();
}

/// Media node that places routers but answers `getRtpCapabilities` only
/// after `late` and never answers anything else
async fn start_sluggish_node(late: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut frames) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(Message::Text(text))) = frames.next().await {
            let request: Value = serde_json::from_str(&text).unwrap();
            let id = request["id"].clone();
            match request["method"].as_str() {
                Some(method::CREATE_ROUTER) => {
                    let reply = json!({
                        "type": "response",
                        "id": id,
                        "data": { "id": RouterId::new() }
                    });
                    let _ = tx.send(reply);
                }
                Some(method::GET_RTP_CAPABILITIES) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        sleep(late).await;
                        let _ = tx.send(json!({
                            "type": "response",
                            "id": id,
                            "data": { "rtpCapabilities": audio_capabilities() }
                        }));
                    });
                }
                _ => {}
            }
        }
    });

    address
}

#[tokio::test]
async fn test_unanswered_verbs_resolve_to_none() {
    let address = start_sluggish_node(Duration::from_millis(600)).await;
    let config = FrontendConfig {
        request_timeout_ms: 200,
        connect_timeout_ms: 1_000,
        ..FrontendConfig::with_nodes([address], SECRET)
    };
    let handler = MediaHandler::new(&config).unwrap();
    let router = handler.create_router(None).await.unwrap();
    let state = router.state();

    let started = Instant::now();
    assert_eq!(within(router.rtp_capabilities()).await, None);
    assert!(within(router.create_webrtc_transport(json!({}))).await.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(router.transports().is_empty());

    // The late answer to the timed out request is dropped
    sleep(Duration::from_millis(700)).await;
    assert!(!router.is_closed());
    assert_eq!(router.state(), state);
    assert_eq!(handler.workers()[0].router_count(), 1);

    handler.close();
}
