//! WebSocket control channel between a front-end and a media node
//!
//! A channel multiplexes many in-flight requests and one-way notifications
//! over a single connection. One reader task decodes frames and one writer
//! task serializes outgoing ones, so no caller ever blocks the connection.

use crate::correlator::{Correlator, DEFAULT_REQUEST_TIMEOUT};
use crate::error::MediaNodeError;
use crate::protocol::{ErrorCode, Internal, RequestError, Target, WireMessage, SECRET_HEADER};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Timeouts applied to a channel
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    /// Window for a single request
    pub request_timeout: Duration,
    /// Window for the WebSocket handshake
    pub connect_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// One-way message received from the peer
#[derive(Debug, Clone)]
pub struct Notification {
    /// Addressed handler
    pub target: Target,
    /// Method name
    pub method: String,
    /// Resource scope
    pub internal: Internal,
    /// Payload
    pub data: Value,
}

/// Request received from the peer, answered through [`IncomingRequest::respond`]
#[derive(Debug)]
pub struct IncomingRequest {
    /// Addressed handler
    pub target: Target,
    /// Method name
    pub method: String,
    /// Resource scope
    pub internal: Internal,
    /// Payload
    pub data: Value,
    id: u32,
    channel: Channel,
}

impl IncomingRequest {
    /// Correlation id chosen by the peer
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Send the single reply for this request
    pub fn respond(self, result: Result<Value, MediaNodeError>) {
        let frame = match result {
            Ok(data) => WireMessage::Response {
                id: self.id,
                error: None,
                data,
            },
            Err(error) => WireMessage::Response {
                id: self.id,
                error: Some(error.to_request_error()),
                data: Value::Null,
            },
        };

        if let Err(e) = self.channel.send_frame(&frame) {
            debug!("Dropping response {} to {}: {}", self.id, self.channel.peer(), e);
        }
    }
}

/// Message delivered to the owner of a channel
#[derive(Debug)]
pub enum Inbound {
    /// Peer expects a reply
    Request(IncomingRequest),
    /// Peer expects nothing back
    Notification(Notification),
}

#[derive(Debug)]
struct Shared {
    peer: String,
    correlator: Arc<Correlator>,
    closed: watch::Sender<bool>,
}

impl Shared {
    /// Returns `true` for the call that actually closed the channel
    fn mark_closed(&self) -> bool {
        let was_closed = self.closed.send_replace(true);
        if !was_closed {
            info!("Channel to {} closed", self.peer);
            self.correlator.fail_all();
        }
        !was_closed
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

struct ChannelInner {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Message>,
}

/// Cloneable handle on a control channel
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.inner.shared.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Channel {
    /// Open a channel to a media node, presenting `secret` in the handshake
    pub async fn connect(
        address: &str,
        secret: &str,
        options: ChannelOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Inbound>), MediaNodeError> {
        let url = if address.starts_with("ws://") || address.starts_with("wss://") {
            address.to_string()
        } else {
            format!("ws://{}", address)
        };

        let mut request =
            url.as_str()
                .into_client_request()
                .map_err(|e| MediaNodeError::ConnectionFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                })?;
        let secret =
            HeaderValue::from_str(secret).map_err(|_| MediaNodeError::InvalidConfiguration {
                reason: "secret is not a valid header value".to_string(),
            })?;
        request.headers_mut().insert(SECRET_HEADER, secret);

        debug!("Connecting to media node {}", address);

        let ws = match tokio::time::timeout(options.connect_timeout, connect_async(request)).await
        {
            Err(_) => {
                return Err(MediaNodeError::ConnectionFailed {
                    address: address.to_string(),
                    reason: format!("handshake timed out after {:?}", options.connect_timeout),
                })
            }
            Ok(Err(tokio_tungstenite::tungstenite::Error::Http(response)))
                if response.status() == StatusCode::FORBIDDEN =>
            {
                warn!("Media node {} rejected our secret", address);
                return Err(MediaNodeError::HandshakeRejected {
                    address: address.to_string(),
                });
            }
            Ok(Err(e)) => {
                return Err(MediaNodeError::ConnectionFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok((ws, _response))) => ws,
        };

        info!("Connected to media node {}", address);
        Ok(Self::from_stream(address, ws, options.request_timeout))
    }

    /// Wrap an established WebSocket and start its reader and writer tasks
    pub fn from_stream<S>(
        peer: impl Into<String>,
        ws: WebSocketStream<S>,
        request_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Inbound>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            peer: peer.into(),
            correlator: Arc::new(Correlator::new(request_timeout)),
            closed,
        });

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ChannelInner {
            shared: Arc::clone(&shared),
            outgoing: outgoing_tx,
        });

        let (sink, stream) = ws.split();
        tokio::spawn(write_loop(Arc::clone(&shared), sink, outgoing_rx));
        tokio::spawn(read_loop(shared, Arc::downgrade(&inner), stream, inbound_tx));

        (Self { inner }, inbound_rx)
    }

    /// Issue a request and wait for its reply or the deadline
    pub async fn request(
        &self,
        target: Target,
        method: &str,
        internal: Internal,
        data: Value,
    ) -> Result<Value, MediaNodeError> {
        let pending = self.inner.shared.correlator.register(method);
        if self.is_closed() {
            return Err(MediaNodeError::ChannelClosed);
        }

        debug!(
            "request [peer:{}, id:{}, target:{}, method:{}]",
            self.peer(),
            pending.id(),
            target,
            method
        );

        self.send_frame(&WireMessage::Request {
            id: pending.id(),
            target,
            method: method.to_string(),
            internal,
            data,
        })?;

        pending.wait().await
    }

    /// Send a one-way notification
    pub fn notify(
        &self,
        target: Target,
        method: &str,
        internal: Internal,
        data: Value,
    ) -> Result<(), MediaNodeError> {
        debug!(
            "notification [peer:{}, target:{}, method:{}]",
            self.peer(),
            target,
            method
        );

        self.send_frame(&WireMessage::Notification {
            target,
            method: method.to_string(),
            internal,
            data,
        })
    }

    /// Close the connection. Pending requests fail with [`MediaNodeError::ChannelClosed`].
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        let _ = self.inner.outgoing.send(Message::Close(None));
        self.inner.shared.mark_closed();
    }

    /// Whether the connection is gone
    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_closed()
    }

    /// Resolves once the connection is gone
    pub async fn closed(&self) {
        let mut rx = self.inner.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Address of the peer
    pub fn peer(&self) -> &str {
        &self.inner.shared.peer
    }

    /// Requests still awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.inner.shared.correlator.pending_count()
    }

    fn send_frame(&self, frame: &WireMessage) -> Result<(), MediaNodeError> {
        if self.is_closed() {
            return Err(MediaNodeError::ChannelClosed);
        }
        let text = serde_json::to_string(frame)?;
        self.inner
            .outgoing
            .send(Message::Text(text))
            .map_err(|_| MediaNodeError::ChannelClosed)
    }
}

// The `watch::Ref` must be dropped before the caller awaits anything else
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Fail the request or response a broken frame still names by id.
///
/// Frames without a readable id are dropped after logging.
fn answer_undecodable(
    shared: &Shared,
    inner: &Weak<ChannelInner>,
    text: &str,
    error: serde_json::Error,
) {
    warn!("Invalid frame from {}: {}", shared.peer, error);

    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        return;
    };
    let Some(id) = frame
        .get("id")
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
    else {
        return;
    };

    match frame.get("type").and_then(Value::as_str) {
        Some("request") => {
            let rejection = match frame.get("target") {
                Some(target) if serde_json::from_value::<Target>(target.clone()).is_err() => {
                    RequestError {
                        code: ErrorCode::UnsupportedMethod,
                        reason: format!("Unknown target {}", target),
                    }
                }
                _ => RequestError {
                    code: ErrorCode::InvalidMessage,
                    reason: error.to_string(),
                },
            };

            let Some(inner) = inner.upgrade() else { return };
            let channel = Channel { inner };
            let response = WireMessage::Response {
                id,
                error: Some(rejection),
                data: Value::Null,
            };
            if let Err(e) = channel.send_frame(&response) {
                debug!("Dropping rejection of request {} from {}: {}", id, shared.peer, e);
            }
        }
        Some("response") => {
            shared.correlator.resolve(
                id,
                Err(MediaNodeError::InvalidMessage {
                    reason: error.to_string(),
                }),
            );
        }
        _ => {}
    }
}

async fn write_loop<S>(
    shared: Arc<Shared>,
    mut sink: futures::stream::SplitSink<WebSocketStream<S>, Message>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut closed = shared.closed.subscribe();

    loop {
        tokio::select! {
            biased;
            message = outgoing.recv() => {
                let Some(message) = message else { break };
                let is_close = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    error!("Failed to send to {}: {}", shared.peer, e);
                    break;
                }
                if is_close {
                    break;
                }
            }
            _ = wait_closed(&mut closed) => break,
        }
    }

    let _ = sink.close().await;
    shared.mark_closed();
}

async fn read_loop<S>(
    shared: Arc<Shared>,
    inner: Weak<ChannelInner>,
    mut stream: futures::stream::SplitStream<WebSocketStream<S>>,
    inbound: mpsc::UnboundedSender<Inbound>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut closed = shared.closed.subscribe();

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = wait_closed(&mut closed) => break,
        };

        match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<WireMessage>(&text) {
                Ok(WireMessage::Response { id, error, data }) => {
                    let result = match error {
                        Some(error) => Err(error.into()),
                        None => Ok(data),
                    };
                    shared.correlator.resolve(id, result);
                }
                Ok(WireMessage::Request {
                    id,
                    target,
                    method,
                    internal,
                    data,
                }) => {
                    let Some(inner) = inner.upgrade() else { break };
                    let request = IncomingRequest {
                        target,
                        method,
                        internal,
                        data,
                        id,
                        channel: Channel { inner },
                    };
                    if inbound.send(Inbound::Request(request)).is_err() {
                        debug!("No listener for requests from {}", shared.peer);
                    }
                }
                Ok(WireMessage::Notification {
                    target,
                    method,
                    internal,
                    data,
                }) => {
                    let notification = Notification {
                        target,
                        method,
                        internal,
                        data,
                    };
                    if inbound.send(Inbound::Notification(notification)).is_err() {
                        debug!("No listener for notifications from {}", shared.peer);
                    }
                }
                Err(e) => answer_undecodable(&shared, &inner, &text, e),
            },
            Some(Ok(Message::Close(_))) => {
                debug!("Peer {} sent close", shared.peer);
                break;
            }
            Some(Err(e)) => {
                error!("WebSocket error on channel to {}: {}", shared.peer, e);
                break;
            }
            None => {
                debug!("Channel to {} stream ended", shared.peer);
                break;
            }
            Some(Ok(_)) => {
                // Ignore other message types (Binary, Ping, Pong)
            }
        }
    }

    shared.mark_closed();
}
