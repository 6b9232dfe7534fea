//! One front-end connection
//!
//! Routes requests by target to the router tree created over this channel.
//! Each request runs as its own task so a slow engine call never holds up the
//! connection. When the channel goes away every router it created is closed.

use crate::capacity::CapacitySnapshot;
use crate::config::WorkerConfig;
use crate::engine::MediaEngine;
use crate::router::{spawn_event_pump, RouterHandler, RouterTable};
use crate::transport::TransportHandler;
use medianode_core::ids::RouterId;
use medianode_core::protocol::{
    decode, encode, method, CreateRouterRequest, CreateRouterResponse, FreeResponse, Internal,
    Target,
};
use medianode_core::{Channel, Inbound, IncomingRequest, MediaNodeError, Notification, ResourceKind};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub(crate) struct Session {
    id: Uuid,
    channel: Channel,
    engine: Arc<dyn MediaEngine>,
    capacity: Arc<RwLock<CapacitySnapshot>>,
    config: Arc<WorkerConfig>,
    routers: Arc<RouterTable>,
}

impl Session {
    pub(crate) fn new(
        id: Uuid,
        channel: Channel,
        engine: Arc<dyn MediaEngine>,
        capacity: Arc<RwLock<CapacitySnapshot>>,
        config: Arc<WorkerConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            channel,
            engine,
            capacity,
            config,
            routers: Arc::new(RouterTable::new()),
        })
    }

    /// Serve the channel until it closes
    pub(crate) async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        info!("Session {} started for {}", self.id, self.channel.peer());

        while let Some(message) = inbound.recv().await {
            match message {
                Inbound::Request(request) => {
                    let session = Arc::clone(&self);
                    tokio::spawn(async move {
                        session.handle_request(request).await;
                    });
                }
                Inbound::Notification(notification) => self.handle_notification(notification),
            }
        }

        self.close_all_routers();
        info!("Session {} ended", self.id);
    }

    async fn handle_request(&self, mut request: IncomingRequest) {
        let data = std::mem::take(&mut request.data);
        debug!(
            "request [session:{}, id:{}, target:{}, method:{}]",
            self.id,
            request.id(),
            request.target,
            request.method
        );

        let result = self
            .dispatch(request.target, &request.method, request.internal, data)
            .await;

        if let Err(e) = &result {
            match e {
                MediaNodeError::Engine { .. } => {
                    error!("{} {} failed: {}", request.target, request.method, e)
                }
                _ => warn!("{} {} rejected: {}", request.target, request.method, e),
            }
        }

        request.respond(result);
    }

    async fn dispatch(
        &self,
        target: Target,
        method: &str,
        internal: Internal,
        data: Value,
    ) -> Result<Value, MediaNodeError> {
        match target {
            Target::MediaNode => self.handle_media_node_request(method),
            Target::Worker => self.handle_worker_request(method, data).await,
            Target::Router => {
                self.router(internal.router_id)?
                    .handle_request(method, data)
                    .await
            }
            Target::Audio => {
                self.router(internal.router_id)?
                    .handle_audio_request(method, data)
                    .await
            }
            Target::Transport => self.transport(&internal)?.handle_request(method, data).await,
            Target::Producer => {
                self.transport(&internal)?
                    .handle_producer_request(internal.producer_id, method, data)
                    .await
            }
            Target::Consumer => {
                self.transport(&internal)?
                    .handle_consumer_request(internal.consumer_id, method, data)
                    .await
            }
        }
    }

    fn handle_media_node_request(&self, method: &str) -> Result<Value, MediaNodeError> {
        match method {
            method::FREE => {
                let free = self
                    .capacity
                    .read()
                    .free
                    .ok_or_else(|| MediaNodeError::engine("Capacity not sampled yet"))?;
                encode(&FreeResponse { free })
            }
            other => Err(MediaNodeError::UnsupportedMethod {
                target: Target::MediaNode,
                method: other.to_string(),
            }),
        }
    }

    async fn handle_worker_request(
        &self,
        method: &str,
        data: Value,
    ) -> Result<Value, MediaNodeError> {
        match method {
            method::CREATE_ROUTER => {
                let request: CreateRouterRequest = decode(data)?;
                let media_codecs = match request.media_codecs {
                    Value::Null => self.config.router.media_codecs.clone(),
                    Value::Array(codecs) if codecs.is_empty() => {
                        self.config.router.media_codecs.clone()
                    }
                    codecs => codecs,
                };

                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let router = self.engine.create_router(media_codecs, events_tx).await?;
                let handler =
                    RouterHandler::new(router, self.config.web_rtc_transport.clone());
                let id = handler.id();

                spawn_event_pump(
                    Arc::downgrade(&handler),
                    Arc::downgrade(&self.routers),
                    self.channel.clone(),
                    events_rx,
                );

                // Register before checking so a concurrent channel loss sees it
                self.routers.insert(id, Arc::clone(&handler));
                if self.channel.is_closed() {
                    if let Some((_, handler)) = self.routers.remove(&id) {
                        handler.close();
                    }
                    return Err(MediaNodeError::ChannelClosed);
                }

                info!("Router {} created for session {}", id, self.id);
                encode(&CreateRouterResponse { id })
            }
            other => Err(MediaNodeError::UnsupportedMethod {
                target: Target::Worker,
                method: other.to_string(),
            }),
        }
    }

    fn handle_notification(&self, notification: Notification) {
        debug!(
            "notification [session:{}, target:{}, method:{}]",
            self.id, notification.target, notification.method
        );

        if notification.method != method::CLOSE {
            warn!(
                "Unknown {} notification \"{}\"",
                notification.target, notification.method
            );
            return;
        }

        let internal = notification.internal;
        let closed = match notification.target {
            Target::Router => internal
                .router_id
                .and_then(|id| self.routers.remove(&id))
                .map(|(_, router)| router.close())
                .is_some(),
            Target::Transport => match (self.router(internal.router_id), internal.transport_id) {
                (Ok(router), Some(transport_id)) => router.close_transport(transport_id),
                _ => false,
            },
            Target::Producer => match (self.transport(&internal), internal.producer_id) {
                (Ok(transport), Some(producer_id)) => transport.close_producer(producer_id),
                _ => false,
            },
            Target::Consumer => match (self.transport(&internal), internal.consumer_id) {
                (Ok(transport), Some(consumer_id)) => transport.close_consumer(consumer_id),
                _ => false,
            },
            other => {
                warn!("Close notification for {} is not supported", other);
                return;
            }
        };

        if !closed {
            debug!(
                "Ignoring close of unknown {} [internal:{:?}]",
                notification.target, internal
            );
        }
    }

    fn router(&self, id: Option<RouterId>) -> Result<Arc<RouterHandler>, MediaNodeError> {
        let id = id.ok_or_else(|| MediaNodeError::InvalidMessage {
            reason: "missing routerId".to_string(),
        })?;
        self.routers
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MediaNodeError::not_found(ResourceKind::Router, id))
    }

    fn transport(&self, internal: &Internal) -> Result<Arc<TransportHandler>, MediaNodeError> {
        self.router(internal.router_id)?
            .transport(internal.transport_id)
    }

    fn close_all_routers(&self) {
        let ids: Vec<RouterId> = self.routers.iter().map(|entry| *entry.key()).collect();
        if !ids.is_empty() {
            info!(
                "Channel to {} lost, closing {} routers",
                self.channel.peer(),
                ids.len()
            );
        }

        for id in ids {
            if let Some((_, router)) = self.routers.remove(&id) {
                router.close();
            }
        }
    }
}
