//! Front-end Demo
//!
//! Drives a running media node (see the `worker_node` demo): creates a router,
//! a sending and a receiving transport, an audio producer consumed on the
//! other transport and an audio level observer, then prints the events the
//! media node pushes back.
//!
//! ```text
//! cargo run --example frontend -- [ws://127.0.0.1:4443]
//! ```

use medianode::{AudioLevelObserverOptions, FrontendConfig, MediaHandler, MediaKind};
use medianode_core::logging::init_logging;
use serde_json::json;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging("info,medianode=debug");

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:4443".to_string());
    let secret = std::env::var("MEDIANODE_SECRET").unwrap_or_else(|_| "s3cret".to_string());

    let handler = MediaHandler::new(&FrontendConfig::with_nodes([address], &secret))?;

    let capacities = handler.directory().refresh_capacity().await;
    info!("📊 Free capacity: {:?}", capacities);

    let router = handler.create_router(None).await?;
    info!("📝 Router {} created", router.id());

    let capabilities = router
        .rtp_capabilities()
        .await
        .ok_or_else(|| anyhow::anyhow!("no RTP capabilities"))?;

    let send = router
        .create_webrtc_transport(json!({ "appData": { "direction": "send" } }))
        .await
        .ok_or_else(|| anyhow::anyhow!("send transport creation failed"))?;
    let recv = router
        .create_webrtc_transport(json!({ "appData": { "direction": "recv" } }))
        .await
        .ok_or_else(|| anyhow::anyhow!("recv transport creation failed"))?;

    let mut send_events = send.events();
    send.connect(json!({ "role": "client", "fingerprints": [] })).await;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), send_events.next()).await
    {
        info!("Transport {} event: {:?}", send.id(), event);
    }

    let producer = send
        .produce(MediaKind::Audio, json!({}), json!({ "source": "mic" }))
        .await
        .ok_or_else(|| anyhow::anyhow!("produce failed"))?;
    let consumer = recv
        .consume(producer.id(), capabilities, true)
        .await
        .ok_or_else(|| anyhow::anyhow!("consume failed"))?;
    consumer.resume().await;
    info!(
        "🎧 Consumer {} of producer {} is {}",
        consumer.id(),
        producer.id(),
        consumer.state()
    );

    let observer = router
        .create_audio_level_observer(AudioLevelObserverOptions::default())
        .await
        .ok_or_else(|| anyhow::anyhow!("observer creation failed"))?;
    observer.add_producer(producer.id()).await;

    let mut consumer_events = consumer.events();
    producer.pause().await;
    producer.resume().await;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), consumer_events.next()).await
    {
        info!("Consumer {} event: {}", consumer.id(), event.event_type());
    }

    if let Some(stats) = consumer.get_stats().await {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }

    router.close();
    info!(
        "✅ Router closed; transports closed: {}, consumer closed: {}",
        send.is_closed() && recv.is_closed(),
        consumer.is_closed()
    );

    handler.close();
    Ok(())
}
