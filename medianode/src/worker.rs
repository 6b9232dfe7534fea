//! One configured media node and its lazily opened channel

use crate::config::MediaNodeConfig;
use crate::event::CloseOrigin;
use crate::relay::EventRelay;
use crate::router::Router;
use crate::rpc::RpcClient;
use medianode_core::protocol::{
    decode, encode, method, CreateRouterRequest, CreateRouterResponse, FreeResponse,
};
use medianode_core::{Channel, ChannelOptions, Internal, MediaNodeError, RouterId, Target};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Connection state of a media node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live channel
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Channel is up
    Connected,
}

#[derive(Clone)]
struct Connection {
    channel: Channel,
    relay: Arc<EventRelay>,
}

/// A media node of the pool
///
/// The channel is opened on first use and shared by every router placed on
/// this node. Once it drops, everything hosted here is closed; the next use
/// opens a fresh channel.
pub struct WorkerNode {
    address: String,
    secret: String,
    options: ChannelOptions,
    connection: Mutex<Option<Connection>>,
    connect_lock: tokio::sync::Mutex<()>,
    connecting: AtomicBool,
    last_capacity: Mutex<Option<f64>>,
    routers: Mutex<HashMap<RouterId, Router>>,
}

impl WorkerNode {
    /// Create a disconnected node
    pub fn new(config: &MediaNodeConfig, options: ChannelOptions) -> Arc<Self> {
        Arc::new(Self {
            address: config.address.clone(),
            secret: config.secret.clone(),
            options,
            connection: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            connecting: AtomicBool::new(false),
            last_capacity: Mutex::new(None),
            routers: Mutex::new(HashMap::new()),
        })
    }

    /// Configured address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        if self.connecting.load(Ordering::SeqCst) {
            return ConnectionState::Connecting;
        }
        match self.live_connection() {
            Some(_) => ConnectionState::Connected,
            None => ConnectionState::Disconnected,
        }
    }

    /// Free capacity from the last `capacity()` call; `None` when unknown
    pub fn last_capacity(&self) -> Option<f64> {
        *self.last_capacity.lock()
    }

    /// Routers currently hosted on this node
    pub fn routers(&self) -> Vec<Router> {
        self.routers.lock().values().cloned().collect()
    }

    /// Number of routers currently hosted on this node
    pub fn router_count(&self) -> usize {
        self.routers.lock().len()
    }

    /// Ask the node for its free capacity
    ///
    /// Any failure, including a timeout, yields `None`: unknown, never zero.
    pub async fn capacity(self: &Arc<Self>) -> Option<f64> {
        let free = match self.connection().await {
            Ok(connection) => {
                RpcClient::new(connection.channel, Target::MediaNode, Internal::default())
                    .request::<FreeResponse, _>(method::FREE, &json!({}))
                    .await
                    .map(|reply| reply.free)
            }
            Err(e) => {
                warn!("Capacity of {} unknown: {}", self.address, e);
                None
            }
        };

        *self.last_capacity.lock() = free;
        free
    }

    /// Create a router on this node
    pub(crate) async fn create_router(
        self: &Arc<Self>,
        media_codecs: Option<Value>,
    ) -> Result<Router, MediaNodeError> {
        let connection = self.connection().await?;

        let request = CreateRouterRequest {
            media_codecs: media_codecs.unwrap_or(Value::Null),
        };
        let reply = connection
            .channel
            .request(
                Target::Worker,
                method::CREATE_ROUTER,
                Internal::default(),
                encode(&request)?,
            )
            .await?;
        let CreateRouterResponse { id } = decode(reply)?;

        let router = Router::new(
            id,
            connection.channel.clone(),
            Arc::clone(&connection.relay),
            Arc::downgrade(self),
        );
        self.routers.lock().insert(id, router.clone());

        // The channel may have dropped while we were registering
        if connection.channel.is_closed() {
            router.close_silently(CloseOrigin::ChannelClosed);
            return Err(MediaNodeError::ChannelClosed);
        }

        info!("Router {} created on media node {}", id, self.address);
        Ok(router)
    }

    pub(crate) fn forget_router(&self, id: RouterId) {
        self.routers.lock().remove(&id);
    }

    /// Drop the channel; every router hosted here closes
    pub fn close(&self) {
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            info!("Closing channel to media node {}", self.address);
            connection.channel.close();
            connection.relay.close_all();
        }
        self.routers.lock().clear();
    }

    fn live_connection(&self) -> Option<Connection> {
        self.connection
            .lock()
            .as_ref()
            .filter(|connection| !connection.channel.is_closed())
            .cloned()
    }

    async fn connection(&self) -> Result<Connection, MediaNodeError> {
        if let Some(connection) = self.live_connection() {
            return Ok(connection);
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(connection) = self.live_connection() {
            return Ok(connection);
        }

        debug!("Opening channel to media node {}", self.address);
        self.connecting.store(true, Ordering::SeqCst);
        let result = Channel::connect(&self.address, &self.secret, self.options).await;
        self.connecting.store(false, Ordering::SeqCst);

        let (channel, inbound) = result.map_err(|e| {
            error!("Cannot reach media node {}: {}", self.address, e);
            e
        })?;

        let relay = EventRelay::new(self.address.clone());
        tokio::spawn(Arc::clone(&relay).run(inbound));

        let connection = Connection { channel, relay };
        *self.connection.lock() = Some(connection.clone());
        Ok(connection)
    }
}

impl fmt::Debug for WorkerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerNode")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("last_capacity", &self.last_capacity())
            .field("routers", &self.router_count())
            .finish()
    }
}
