//! # Media Node Front-end
//!
//! Delegates media routing to a pool of remote media nodes. The front-end
//! picks a node for each new router, talks to it over one WebSocket control
//! channel and mirrors the node's resources as local proxies:
//! router → transport → producer / consumer, plus one optional audio level
//! observer per router. Notifications pushed by the node are replayed as
//! events on the matching proxy.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use medianode::{FrontendConfig, MediaHandler};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FrontendConfig::with_nodes(["127.0.0.1:4443"], "s3cret");
//!     let handler = MediaHandler::new(&config)?;
//!
//!     let router = handler.create_router(None).await?;
//!     let transport = router
//!         .create_webrtc_transport(json!({ "appData": { "peer": "alice" } }))
//!         .await
//!         .ok_or("transport creation failed")?;
//!
//!     let mut events = transport.events();
//!     while let Some(event) = events.next().await {
//!         println!("Transport event: {}", event.event_type());
//!     }
//!
//!     handler.close();
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use medianode_core::protocol::{
    AudioLevelObserverOptions, AudioVolume, ConsumerLayers, DtlsState,
};
pub use medianode_core::{
    ChannelOptions, ConsumerId, MediaKind, MediaNodeError, ProducerId, RouterId, TransportId,
};

pub mod audio_level_observer;
pub mod config;
pub mod consumer;
pub mod directory;
pub mod event;
pub mod handler;
pub mod producer;
pub mod relay;
pub mod router;
pub mod rpc;
pub mod state;
pub mod transport;
pub mod worker;

// Re-export main API types
pub use audio_level_observer::AudioLevelObserver;
pub use config::{FrontendConfig, MediaNodeConfig};
pub use consumer::Consumer;
pub use directory::{SelectionPolicy, WorkerDirectory};
pub use event::{
    AudioLevelObserverEvent, CloseOrigin, ConsumerEvent, EventStream, ProducerEvent, RouterEvent,
    TransportEvent,
};
pub use handler::MediaHandler;
pub use producer::Producer;
pub use relay::{EventRelay, ResourceKey};
pub use router::Router;
pub use rpc::RpcClient;
pub use state::ResourceState;
pub use transport::Transport;
pub use worker::{ConnectionState, WorkerNode};
