//! # Media Node Worker
//!
//! The media node side of the control plane. Accepts authenticated control
//! channels from front-ends, answers capacity queries from a periodically
//! refreshed snapshot and drives a [`engine::MediaEngine`] on behalf of each
//! channel. Engine events are forwarded to the front-end as notifications.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod capacity;
pub mod config;
pub mod engine;
mod router;
pub mod server;
mod session;
mod transport;

// Re-export main types
pub use capacity::{CapacityReporter, CapacitySampler, CapacitySnapshot, ProcStatSampler, SampleError};
pub use config::{default_media_codecs, ListenIp, RouterSettings, WebRtcTransportSettings, WorkerConfig};
pub use engine::{EngineEvent, LoopbackEngine, MediaEngine};
pub use server::{WorkerHandle, WorkerServer};
