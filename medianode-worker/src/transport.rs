//! Authoritative transport handler with its producers and consumers

use crate::engine::{EngineConsumer, EngineProducer, EngineTransport};
use dashmap::DashMap;
use medianode_core::ids::{ConsumerId, ProducerId, RouterId, TransportId};
use medianode_core::protocol::{
    decode, encode, method, ConnectRequest, ConsumeRequest, ConsumeResponse, ConsumerLayers,
    ProduceRequest, ProduceResponse, RestartIceResponse, SetMaxIncomingBitrateRequest,
    SetPreferredLayersRequest, SetPriorityRequest, StatsResponse, Target, WebRtcTransportData,
};
use medianode_core::{MediaNodeError, ResourceKind};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) struct TransportHandler {
    router_id: RouterId,
    transport: Arc<dyn EngineTransport>,
    producers: DashMap<ProducerId, Arc<dyn EngineProducer>>,
    consumers: DashMap<ConsumerId, Arc<dyn EngineConsumer>>,
}

impl TransportHandler {
    pub(crate) fn new(router_id: RouterId, transport: Arc<dyn EngineTransport>) -> Self {
        Self {
            router_id,
            transport,
            producers: DashMap::new(),
            consumers: DashMap::new(),
        }
    }

    pub(crate) fn id(&self) -> TransportId {
        self.transport.id()
    }

    /// Attributes returned to the creator
    pub(crate) fn describe(&self) -> WebRtcTransportData {
        WebRtcTransportData {
            id: self.transport.id(),
            ice_parameters: self.transport.ice_parameters(),
            ice_candidates: self.transport.ice_candidates(),
            dtls_parameters: self.transport.dtls_parameters(),
            app_data: self.transport.app_data(),
        }
    }

    pub(crate) async fn handle_request(
        &self,
        method: &str,
        data: Value,
    ) -> Result<Value, MediaNodeError> {
        match method {
            method::SET_MAX_INCOMING_BITRATE => {
                let request: SetMaxIncomingBitrateRequest = decode(data)?;
                self.transport
                    .set_max_incoming_bitrate(request.max_incoming_bitrate)
                    .await?;
                Ok(json!({}))
            }
            method::CONNECT => {
                let request: ConnectRequest = decode(data)?;
                self.transport.connect(request.dtls_parameters).await?;
                Ok(json!({}))
            }
            method::RESTART_ICE => {
                let ice_parameters = self.transport.restart_ice().await?;
                encode(&RestartIceResponse { ice_parameters })
            }
            method::PRODUCE => {
                let request: ProduceRequest = decode(data)?;
                let producer = self
                    .transport
                    .produce(request.kind, request.rtp_parameters, request.app_data)
                    .await?;
                let id = producer.id();

                info!(
                    "Producer {} ({:?}) created on transport {} of router {}",
                    id,
                    producer.kind(),
                    self.id(),
                    self.router_id
                );
                self.producers.insert(id, producer);
                encode(&ProduceResponse { id })
            }
            method::CONSUME => {
                let request: ConsumeRequest = decode(data)?;
                let consumer = self
                    .transport
                    .consume(request.producer_id, request.rtp_capabilities, request.paused)
                    .await?;

                let response = ConsumeResponse {
                    id: consumer.id(),
                    producer_id: consumer.producer_id(),
                    kind: consumer.kind(),
                    rtp_parameters: consumer.rtp_parameters(),
                    consumer_type: consumer.consumer_type(),
                    paused: consumer.paused(),
                    producer_paused: consumer.producer_paused(),
                    score: consumer.score(),
                    app_data: json!({}),
                };

                info!(
                    "Consumer {} of producer {} created on transport {}",
                    response.id,
                    response.producer_id,
                    self.id()
                );
                self.consumers.insert(response.id, consumer);
                encode(&response)
            }
            method::GET_STATS => {
                let stats = self.transport.get_stats().await?;
                encode(&StatsResponse { stats })
            }
            other => Err(MediaNodeError::UnsupportedMethod {
                target: Target::Transport,
                method: other.to_string(),
            }),
        }
    }

    pub(crate) async fn handle_producer_request(
        &self,
        producer_id: Option<ProducerId>,
        method: &str,
        _data: Value,
    ) -> Result<Value, MediaNodeError> {
        let producer = self.producer(producer_id)?;

        match method {
            method::PAUSE => {
                producer.pause().await?;
                Ok(json!({}))
            }
            method::RESUME => {
                producer.resume().await?;
                Ok(json!({}))
            }
            method::GET_STATS => {
                let stats = producer.get_stats().await?;
                encode(&StatsResponse { stats })
            }
            other => Err(MediaNodeError::UnsupportedMethod {
                target: Target::Producer,
                method: other.to_string(),
            }),
        }
    }

    pub(crate) async fn handle_consumer_request(
        &self,
        consumer_id: Option<ConsumerId>,
        method: &str,
        data: Value,
    ) -> Result<Value, MediaNodeError> {
        let consumer = self.consumer(consumer_id)?;

        match method {
            method::PAUSE => {
                consumer.pause().await?;
                Ok(json!({}))
            }
            method::RESUME => {
                consumer.resume().await?;
                Ok(json!({}))
            }
            method::SET_PREFERRED_LAYERS => {
                let request: SetPreferredLayersRequest = decode(data)?;
                consumer
                    .set_preferred_layers(ConsumerLayers {
                        spatial_layer: request.spatial_layer,
                        temporal_layer: request.temporal_layer,
                    })
                    .await?;
                Ok(json!({}))
            }
            method::SET_PRIORITY => {
                let request: SetPriorityRequest = decode(data)?;
                consumer.set_priority(request.priority).await?;
                Ok(json!({}))
            }
            method::REQUEST_KEY_FRAME => {
                consumer.request_key_frame().await?;
                Ok(json!({}))
            }
            method::GET_STATS => {
                let stats = consumer.get_stats().await?;
                encode(&StatsResponse { stats })
            }
            other => Err(MediaNodeError::UnsupportedMethod {
                target: Target::Consumer,
                method: other.to_string(),
            }),
        }
    }

    fn producer(&self, id: Option<ProducerId>) -> Result<Arc<dyn EngineProducer>, MediaNodeError> {
        let id = id.ok_or_else(|| MediaNodeError::InvalidMessage {
            reason: "missing producerId".to_string(),
        })?;
        self.producers
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MediaNodeError::not_found(ResourceKind::Producer, id))
    }

    fn consumer(&self, id: Option<ConsumerId>) -> Result<Arc<dyn EngineConsumer>, MediaNodeError> {
        let id = id.ok_or_else(|| MediaNodeError::InvalidMessage {
            reason: "missing consumerId".to_string(),
        })?;
        self.consumers
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MediaNodeError::not_found(ResourceKind::Consumer, id))
    }

    /// Close a producer on request of the front-end
    pub(crate) fn close_producer(&self, id: ProducerId) -> bool {
        match self.producers.remove(&id) {
            Some((_, producer)) => {
                debug!("Closing producer {}", id);
                producer.close();
                true
            }
            None => false,
        }
    }

    /// Close a consumer on request of the front-end
    pub(crate) fn close_consumer(&self, id: ConsumerId) -> bool {
        match self.consumers.remove(&id) {
            Some((_, consumer)) => {
                debug!("Closing consumer {}", id);
                consumer.close();
                true
            }
            None => false,
        }
    }

    /// Forget a producer the engine already closed
    pub(crate) fn forget_producer(&self, id: ProducerId) -> bool {
        self.producers.remove(&id).is_some()
    }

    /// Forget a consumer the engine already closed
    pub(crate) fn forget_consumer(&self, id: ConsumerId) -> bool {
        self.consumers.remove(&id).is_some()
    }

    pub(crate) fn producer_count(&self) -> usize {
        self.producers.len()
    }

    pub(crate) fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Close the engine transport; the engine takes its producers and consumers down
    pub(crate) fn close(&self) {
        debug!(
            "Closing transport {} with {} producers and {} consumers",
            self.id(),
            self.producer_count(),
            self.consumer_count()
        );
        self.producers.clear();
        self.consumers.clear();
        self.transport.close();
    }

    /// Drop local state after the engine closed the transport itself
    pub(crate) fn forget(&self) {
        self.producers.clear();
        self.consumers.clear();
    }
}
