//! Correlation table: request id → pending completion + timeout timer.
//!
//! Every exit path (reply, rejection, timeout, discard) goes through
//! `DashMap::remove`, so exactly one of them observes the entry. Late,
//! duplicate and unknown replies find nothing and are no-ops.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use relay_core::{RelayError, RequestId};

/// Outcome delivered to the waiting caller.
pub type Completion = Result<Value, RelayError>;

struct PendingEntry {
    responder: oneshot::Sender<Completion>,
    timer: Option<AbortHandle>,
    created_at: Instant,
}

/// Receiving half of a pending request.
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<Completion>,
}

impl PendingReply {
    /// Wait for the outcome. A dropped entry (discard, shutdown) reads as
    /// `RelayError::Abandoned`.
    pub async fn wait(self) -> Completion {
        self.rx.await.unwrap_or(Err(RelayError::Abandoned))
    }
}

/// Table of in-flight correlated requests.
pub struct PendingRequests {
    entries: Arc<DashMap<RequestId, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Allocate a fresh id and start its timeout in one step.
    pub fn create(&self, timeout: Duration) -> (RequestId, PendingReply) {
        let (id, reply) = self.register();
        self.arm(&id, timeout);
        (id, reply)
    }

    /// Allocate a fresh id without starting a timer.
    pub fn register(&self) -> (RequestId, PendingReply) {
        let id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        let _ = self.entries.insert(
            id.clone(),
            PendingEntry {
                responder: tx,
                timer: None,
                created_at: Instant::now(),
            },
        );
        (id, PendingReply { rx })
    }

    /// Start the timeout for a registered entry. If the entry already
    /// completed, the timer is cancelled immediately.
    pub fn arm(&self, id: &RequestId, timeout: Duration) {
        let entries = Arc::clone(&self.entries);
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, entry)) = entries.remove(&timer_id) {
                debug!(request_id = %timer_id, ?timeout, "request timed out");
                let _ = entry.responder.send(Err(RelayError::Timeout(timeout)));
            }
        });

        match self.entries.get_mut(id) {
            Some(mut entry) => entry.timer = Some(handle.abort_handle()),
            None => handle.abort(),
        }
    }

    /// Complete a request successfully. Returns `false` if the id is unknown.
    pub fn resolve(&self, id: &RequestId, value: Value) -> bool {
        self.complete(id, Ok(value))
    }

    /// Complete a request with a failure. Returns `false` if the id is unknown.
    pub fn reject(&self, id: &RequestId, error: RelayError) -> bool {
        self.complete(id, Err(error))
    }

    /// Drop an entry without delivering an outcome.
    pub fn discard(&self, id: &RequestId) -> bool {
        match self.entries.remove(id) {
            Some((_, entry)) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    fn complete(&self, id: &RequestId, outcome: Completion) -> bool {
        let Some((_, entry)) = self.entries.remove(id) else {
            return false;
        };
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        debug!(
            request_id = %id,
            ok = outcome.is_ok(),
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "request completed"
        );
        let _ = entry.responder.send(outcome);
        true
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
