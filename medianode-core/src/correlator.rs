//! Request/response correlation with a fixed deadline
//!
//! Every outgoing request gets a pending slot keyed by its id. The slot is
//! resolved by whichever comes first: the reply, the deadline, or the channel
//! closing. Removal from the pending table is the one-shot guard, so the loser
//! of that race finds nothing and has no effect.

use crate::error::MediaNodeError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Default request window
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type ResultSender = oneshot::Sender<Result<Value, MediaNodeError>>;

#[derive(Debug)]
struct PendingEntry {
    method: String,
    tx: ResultSender,
}

/// Pending request table of one channel
#[derive(Debug)]
pub struct Correlator {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, PendingEntry>>,
    timeout: Duration,
}

impl Correlator {
    /// Create a correlator arming `timeout` on every request
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Request window
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Allocate an id and a pending slot for a request about to be sent
    pub fn register(self: &Arc<Self>, method: &str) -> PendingRequest {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.pending.lock().insert(
            id,
            PendingEntry {
                method: method.to_string(),
                tx,
            },
        );

        PendingRequest {
            id,
            method: method.to_string(),
            rx,
            correlator: Arc::clone(self),
        }
    }

    /// Deliver a reply. Returns `false` when the slot was already resolved.
    pub fn resolve(&self, id: u32, result: Result<Value, MediaNodeError>) -> bool {
        match self.take(id) {
            Some(entry) => {
                let _ = entry.tx.send(result);
                true
            }
            None => {
                debug!("Discarding reply for unknown or expired request {}", id);
                false
            }
        }
    }

    /// Fail every pending request, used when the channel drops
    pub fn fail_all(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (id, entry) in drained {
            debug!("Failing request {} ({}) on channel close", id, entry.method);
            let _ = entry.tx.send(Err(MediaNodeError::ChannelClosed));
        }
    }

    /// Number of requests awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn take(&self, id: u32) -> Option<PendingEntry> {
        self.pending.lock().remove(&id)
    }
}

/// Handle on a request awaiting its reply
///
/// Dropping the handle abandons the request; a reply arriving later is
/// discarded.
#[derive(Debug)]
pub struct PendingRequest {
    id: u32,
    method: String,
    rx: oneshot::Receiver<Result<Value, MediaNodeError>>,
    correlator: Arc<Correlator>,
}

impl PendingRequest {
    /// Correlation id to put on the wire
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wait for the reply or the deadline, whichever comes first
    pub async fn wait(mut self) -> Result<Value, MediaNodeError> {
        let window = self.correlator.timeout;

        match tokio::time::timeout(window, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MediaNodeError::ChannelClosed),
            Err(_) => {
                if self.correlator.take(self.id).is_some() {
                    debug!("Request {} ({}) timed out", self.id, self.method);
                    Err(MediaNodeError::Timeout {
                        method: self.method.clone(),
                        duration: window,
                    })
                } else {
                    // The reply took the slot between the deadline and now
                    self.rx
                        .try_recv()
                        .unwrap_or(Err(MediaNodeError::ChannelClosed))
                }
            }
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.correlator.take(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_reply_resolves_request() {
        let correlator = Arc::new(Correlator::new(Duration::from_secs(1)));
        let pending = correlator.register("getStats");
        let id = pending.id();

        assert!(correlator.resolve(id, Ok(json!({"stats": []}))));
        let value = pending.wait().await.unwrap();
        assert_eq!(value, json!({"stats": []}));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_then_late_reply_is_discarded() {
        let correlator = Arc::new(Correlator::new(Duration::from_millis(20)));
        let pending = correlator.register("restartIce");
        let id = pending.id();

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, MediaNodeError::Timeout { ref method, .. } if method == "restartIce"));

        // Late reply has no slot left
        assert!(!correlator.resolve(id, Ok(json!({}))));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_stays_pending_until_reply() {
        let correlator = Arc::new(Correlator::new(Duration::from_secs(5)));
        let pending = correlator.register("canConsume");
        let id = pending.id();

        let mut waiting = tokio_test::task::spawn(pending.wait());
        tokio_test::assert_pending!(waiting.poll());

        assert!(correlator.resolve(id, Ok(json!({"canConsume": true}))));
        assert!(waiting.is_woken());
        let value = tokio_test::assert_ready_ok!(waiting.poll());
        assert_eq!(value["canConsume"], true);
    }

    #[tokio::test]
    async fn test_second_reply_is_ignored() {
        let correlator = Arc::new(Correlator::new(Duration::from_secs(1)));
        let pending = correlator.register("pause");
        let id = pending.id();

        assert!(correlator.resolve(id, Ok(json!(1))));
        assert!(!correlator.resolve(id, Ok(json!(2))));
        assert_eq!(pending.wait().await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_fail_all_on_close() {
        let correlator = Arc::new(Correlator::new(Duration::from_secs(5)));
        let first = correlator.register("connect");
        let second = correlator.register("produce");
        assert_ne!(first.id(), second.id());

        correlator.fail_all();
        assert!(matches!(first.wait().await, Err(MediaNodeError::ChannelClosed)));
        assert!(matches!(second.wait().await, Err(MediaNodeError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_dropped_request_frees_slot() {
        let correlator = Arc::new(Correlator::new(Duration::from_secs(5)));
        let pending = correlator.register("consume");
        let id = pending.id();
        drop(pending);

        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.resolve(id, Ok(json!({}))));
    }
}
