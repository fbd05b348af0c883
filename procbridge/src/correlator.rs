//! Request correlator - matches worker responses to in-flight requests.
//!
//! Every request gets a fresh [`RequestId`] and an entry in the pending table.
//! Four paths remove entries: a matching response, the request deadline, a
//! worker failure, or the caller dropping its handle. Each entry arms its own
//! deadline timer, so a request expires on time whether or not anyone is
//! awaiting its handle. Removal from the table
//! happens under one mutex and whoever removes an entry owns its responder, so a
//! request resolves at most once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::bridge::protocol::{RequestId, RequestMessage, ResponseBody, ResponseMessage};
use crate::error::BridgeError;

type Outcome = Result<Value, BridgeError>;

struct PendingRequest {
    created_at: Instant,
    timeout: Duration,
    responder: oneshot::Sender<Outcome>,
    timer: AbortHandle,
}

impl PendingRequest {
    fn resolve(self, outcome: Outcome) {
        self.timer.abort();
        // Receiver gone means the caller stopped waiting; nothing left to do.
        let _ = self.responder.send(outcome);
    }
}

/// What happened to a decoded response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Delivered,
    /// No pending request had this id (already timed out, failed, or never sent).
    Stale,
}

pub struct Correlator {
    pending: StdMutex<HashMap<RequestId, PendingRequest>>,
    outbound: mpsc::UnboundedSender<RequestMessage>,
    stale: AtomicU64,
}

impl Correlator {
    /// Requests accepted by [`submit`](Self::submit) are queued on `outbound`
    /// for the supervisor to write.
    pub fn new(outbound: mpsc::UnboundedSender<RequestMessage>) -> Arc<Self> {
        Arc::new(Self {
            pending: StdMutex::new(HashMap::new()),
            outbound,
            stale: AtomicU64::new(0),
        })
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Pending table mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Register a request and queue it for the worker.
    ///
    /// Must be called within a tokio runtime; the deadline timer runs as a task.
    pub fn submit<P: Serialize + ?Sized>(
        self: &Arc<Self>,
        payload: &P,
        timeout: Duration,
    ) -> Result<ResponseHandle, BridgeError> {
        let id = RequestId::new();
        let message = RequestMessage::from_payload(id, payload)
            .map_err(|e| BridgeError::InvalidPayload(e.0))?;

        let (responder, rx) = oneshot::channel();
        let created_at = Instant::now();
        let deadline = created_at + timeout;
        let timer = tokio::spawn(expire_at(Arc::downgrade(self), id, deadline)).abort_handle();
        self.table().insert(
            id,
            PendingRequest {
                created_at,
                timeout,
                responder,
                timer,
            },
        );

        if self.outbound.send(message).is_err() {
            if let Some(entry) = self.table().remove(&id) {
                entry.timer.abort();
            }
            return Err(BridgeError::unavailable("bridge is shut down"));
        }

        tracing::debug!(request_id = %id, timeout_ms = timeout.as_millis() as u64, "Request submitted");
        Ok(ResponseHandle {
            id,
            deadline,
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// Route a decoded response to its pending request.
    pub fn on_message(&self, message: ResponseMessage) -> Resolution {
        let ResponseMessage { id, body } = message;
        let Some(entry) = self.table().remove(&id) else {
            self.stale.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(request_id = %id, "Discarding stale response");
            return Resolution::Stale;
        };

        let latency_ms = entry.created_at.elapsed().as_millis() as u64;
        let outcome = match body {
            ResponseBody::Result(value) => {
                tracing::debug!(request_id = %id, latency_ms, "Request resolved");
                Ok(value)
            }
            ResponseBody::Error(message) => {
                tracing::info!(request_id = %id, latency_ms, %message, "Worker reported error");
                Err(BridgeError::Worker { id, message })
            }
        };
        entry.resolve(outcome);
        Resolution::Delivered
    }

    /// Resolve `id` with `Timeout` if it is still pending.
    pub fn on_timeout(&self, id: RequestId) -> bool {
        let Some(entry) = self.table().remove(&id) else {
            return false;
        };
        tracing::warn!(request_id = %id, timeout_ms = entry.timeout.as_millis() as u64, "Request timed out");
        let elapsed = entry.timeout;
        entry.resolve(Err(BridgeError::Timeout { id, elapsed }));
        true
    }

    /// Fail a single request, e.g. when writing it to the worker failed.
    pub fn fail(&self, id: RequestId, error: BridgeError) -> bool {
        match self.table().remove(&id) {
            Some(entry) => {
                entry.resolve(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with `WorkerUnavailable`.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.table().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            tracing::warn!(request_id = %id, %reason, "Failing request");
            entry.resolve(Err(BridgeError::unavailable(reason)));
        }
        count
    }

    /// Drop a request without resolving it (caller went away).
    fn forget(&self, id: &RequestId) -> bool {
        match self.table().remove(id) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.table().contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    /// Responses discarded because their id was not pending.
    pub fn stale_count(&self) -> u64 {
        self.stale.load(Ordering::Relaxed)
    }
}

async fn expire_at(correlator: Weak<Correlator>, id: RequestId, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    if let Some(correlator) = correlator.upgrade() {
        correlator.on_timeout(id);
    }
}

/// Handle to one in-flight request.
///
/// Dropping the handle before it resolves removes the pending entry, so a late
/// response for it is treated as stale.
pub struct ResponseHandle {
    id: RequestId,
    deadline: Instant,
    rx: oneshot::Receiver<Outcome>,
    correlator: Arc<Correlator>,
}

impl ResponseHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the response, the deadline, or a worker failure.
    ///
    /// The request expires at its deadline even if this is never called.
    pub async fn wait(mut self) -> Result<Value, BridgeError> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BridgeError::unavailable("request dropped by bridge")),
            Err(_) => {
                // Either we expire the entry here or a resolution won the race
                // and is already sitting in the channel.
                self.correlator.on_timeout(self.id);
                self.rx
                    .try_recv()
                    .unwrap_or_else(|_| Err(BridgeError::unavailable("request dropped by bridge")))
            }
        }
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        if self.correlator.forget(&self.id) {
            tracing::debug!(request_id = %self.id, "Request abandoned before resolution");
        }
    }
}
