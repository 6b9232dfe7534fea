//! # Media Node Core
//!
//! Control-plane plumbing shared by media node workers and the front-ends that
//! drive them: the WebSocket control channel, request correlation with
//! deadlines, the wire protocol and the error taxonomy.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod correlator;
pub mod error;
pub mod ids;
pub mod logging;
pub mod protocol;

// Re-export main types
pub use channel::{Channel, ChannelOptions, IncomingRequest, Inbound, Notification};
pub use correlator::{Correlator, PendingRequest, DEFAULT_REQUEST_TIMEOUT};
pub use error::{MediaNodeError, ResourceKind};
pub use ids::{ConsumerId, ProducerId, RouterId, TransportId};
pub use protocol::{Internal, MediaKind, Target, WireMessage};
