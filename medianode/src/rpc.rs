//! Generic request/notification client bound to one remote resource

use medianode_core::protocol::{decode, encode};
use medianode_core::{Channel, Internal, MediaNodeError, Target};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Sends requests and notifications to one resource on a media node
///
/// Every proxy verb goes through here: the target and scope are fixed at
/// construction and only the method and payload vary per call.
#[derive(Debug, Clone)]
pub struct RpcClient {
    channel: Channel,
    target: Target,
    internal: Internal,
}

impl RpcClient {
    /// Bind a client to `target` scoped by `internal`
    pub fn new(channel: Channel, target: Target, internal: Internal) -> Self {
        Self {
            channel,
            target,
            internal,
        }
    }

    /// A client for another resource on the same channel
    pub fn scoped(&self, target: Target, internal: Internal) -> Self {
        Self::new(self.channel.clone(), target, internal)
    }

    /// Addressed target
    pub fn target(&self) -> Target {
        self.target
    }

    /// Addressed scope
    pub fn internal(&self) -> Internal {
        self.internal
    }

    /// Underlying channel
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Issue a request and return the raw reply
    pub async fn call(&self, method: &str, data: Value) -> Result<Value, MediaNodeError> {
        self.channel
            .request(self.target, method, self.internal, data)
            .await
    }

    /// Issue a request and decode its reply. Failures are logged and yield `None`.
    pub async fn request<T, P>(&self, method: &str, payload: &P) -> Option<T>
    where
        T: DeserializeOwned,
        P: Serialize,
    {
        let result = match encode(payload) {
            Ok(data) => self.call(method, data).await.and_then(decode),
            Err(e) => Err(e),
        };

        match result {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!("{} {}() failed: {}", self.target, method, e);
                None
            }
        }
    }

    /// Issue a request whose reply carries nothing. Failures are logged.
    pub async fn execute<P: Serialize>(&self, method: &str, payload: &P) -> bool {
        let result = match encode(payload) {
            Ok(data) => self.call(method, data).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(_) => true,
            Err(e) => {
                warn!("{} {}() failed: {}", self.target, method, e);
                false
            }
        }
    }

    /// Send a notification; a dead channel is not an error for fire-and-forget
    pub fn notify(&self, method: &str, data: Value) {
        if let Err(e) = self
            .channel
            .notify(self.target, method, self.internal, data)
        {
            debug!("{} {} notification dropped: {}", self.target, method, e);
        }
    }
}
