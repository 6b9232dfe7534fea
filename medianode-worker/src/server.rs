//! Control channel server of a media node

use crate::capacity::{CapacityReporter, CapacitySampler, CapacitySnapshot, ProcStatSampler};
use crate::config::WorkerConfig;
use crate::engine::MediaEngine;
use crate::session::Session;
use dashmap::DashMap;
use medianode_core::protocol::SECRET_HEADER;
use medianode_core::{Channel, MediaNodeError};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use uuid::Uuid;

/// Media node server accepting front-end channels
pub struct WorkerServer {
    config: WorkerConfig,
    engine: Arc<dyn MediaEngine>,
    capacity: CapacityReporter,
}

impl WorkerServer {
    /// Create a server driving `engine`
    pub fn new(config: WorkerConfig, engine: Arc<dyn MediaEngine>) -> Result<Self, MediaNodeError> {
        config.validate()?;
        let capacity = CapacityReporter::new(config.capacity_interval());
        Ok(Self {
            config,
            engine,
            capacity,
        })
    }

    /// Sample capacity with `sampler` instead of `/proc/stat`
    pub fn with_sampler<S: CapacitySampler>(mut self, sampler: S) -> Self {
        self.capacity.start(sampler);
        self
    }

    /// Bind the configured address and start accepting connections
    pub async fn bind(self) -> Result<WorkerHandle, MediaNodeError> {
        let address = self.config.listen_addr;
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| MediaNodeError::ServerStartFailed { address, source: e })?;
        self.serve(listener)
    }

    /// Start accepting connections on an already bound listener
    pub fn serve(mut self, listener: TcpListener) -> Result<WorkerHandle, MediaNodeError> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| MediaNodeError::ServerStartFailed {
                address: self.config.listen_addr,
                source: e,
            })?;

        if !self.capacity.is_running() {
            self.capacity.start(ProcStatSampler::new());
        }

        let shared = Arc::new(ServerShared {
            capacity_snapshot: self.capacity.shared(),
            capacity: Mutex::new(self.capacity),
            config: Arc::new(self.config),
            engine: self.engine,
            sessions: DashMap::new(),
        });

        tracing::info!("Media node listening on {}", local_addr);
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));

        Ok(WorkerHandle {
            local_addr,
            accept_task,
            shared,
        })
    }
}

struct ServerShared {
    config: Arc<WorkerConfig>,
    engine: Arc<dyn MediaEngine>,
    capacity: Mutex<CapacityReporter>,
    capacity_snapshot: Arc<parking_lot::RwLock<CapacitySnapshot>>,
    sessions: DashMap<Uuid, Channel>,
}

async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::debug!("New connection from {}", addr);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    handle_connection(shared, stream, addr).await;
                });
            }
            Err(e) => {
                tracing::error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_connection(shared: Arc<ServerShared>, stream: TcpStream, addr: SocketAddr) {
    let secret = shared.config.secret.clone();
    let authorize = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let presented = request
            .headers()
            .get(SECRET_HEADER)
            .map(|value| value.as_bytes());

        if presented == Some(secret.as_bytes()) {
            return Ok(response);
        }

        tracing::warn!("Rejecting {}: missing or wrong secret", addr);
        let mut rejection = ErrorResponse::new(None);
        *rejection.status_mut() = StatusCode::FORBIDDEN;
        Err(rejection)
    };

    let ws_stream = match accept_hdr_async(stream, authorize).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let session_id = Uuid::new_v4();
    let (channel, inbound) =
        Channel::from_stream(addr.to_string(), ws_stream, shared.config.request_timeout());
    shared.sessions.insert(session_id, channel.clone());

    let session = Session::new(
        session_id,
        channel,
        Arc::clone(&shared.engine),
        Arc::clone(&shared.capacity_snapshot),
        Arc::clone(&shared.config),
    );
    session.run(inbound).await;

    shared.sessions.remove(&session_id);
}

/// Running media node server
pub struct WorkerHandle {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    shared: Arc<ServerShared>,
}

impl WorkerHandle {
    /// Address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connected front-ends
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Last capacity snapshot
    pub fn capacity(&self) -> CapacitySnapshot {
        *self.shared.capacity_snapshot.read()
    }

    /// Run until the accept loop stops
    pub async fn wait(self) {
        if let Err(e) = self.accept_task.await {
            if !e.is_cancelled() {
                tracing::error!("Accept loop of {} failed: {}", self.local_addr, e);
            }
        }
    }

    /// Stop accepting, drop every channel and stop capacity sampling
    pub fn shutdown(self) {
        self.accept_task.abort();

        let sessions: Vec<Channel> = self
            .shared
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for channel in sessions {
            channel.close();
        }

        self.shared.capacity.lock().stop();
        tracing::info!("Media node on {} shut down", self.local_addr);
    }
}
