use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::dispatcher::panic_message;

/// Resumes the caller with the raw response value.
pub type Continuation = Box<dyn FnOnce(Bytes) + Send + Sync + 'static>;

/// Matches query responses to the requests that caused them.
///
/// Requests are created on the main loop and resolved from the network task,
/// so the pending table is a concurrent map shared by every clone. Nothing
/// here ever expires: a response that never arrives leaves its entry behind
/// until someone calls [`CorrelationBus::abandon`].
#[derive(Clone, Default)]
pub struct CorrelationBus {
    pending: Arc<DashMap<Uuid, Continuation>>,
}

impl std::fmt::Debug for CorrelationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationBus")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl CorrelationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `continuation` under a fresh request id.
    ///
    /// The continuation runs on whichever task resolves the request. Callers
    /// that touch main-loop state must redispatch from inside it.
    pub fn new_request<F>(&self, continuation: F) -> Uuid
    where
        F: FnOnce(Bytes) + Send + Sync + 'static,
    {
        let mut id = Uuid::new_v4();
        // never overwrite a parked caller
        while self.pending.contains_key(&id) {
            id = Uuid::new_v4();
        }
        self.pending.insert(id, Box::new(continuation));
        debug!(request_id = %id, "parked request");
        id
    }

    /// Like [`new_request`](Self::new_request) but hands back a receiver for async callers.
    pub fn new_request_channel(&self) -> (Uuid, oneshot::Receiver<Bytes>) {
        let (tx, rx) = oneshot::channel();
        let id = self.new_request(move |value| {
            // receiver gone means the caller stopped waiting
            let _ = tx.send(value);
        });
        (id, rx)
    }

    /// Remove the request and run its continuation exactly once.
    ///
    /// Unknown, late or duplicate ids are logged and return `false`.
    pub fn resolve(&self, request_id: Uuid, value: Bytes) -> bool {
        let Some((_, continuation)) = self.pending.remove(&request_id) else {
            warn!(request_id = %request_id, "response for unknown or already resolved request");
            return false;
        };

        if let Err(panic) = catch_unwind(AssertUnwindSafe(move || continuation(value))) {
            let reason = panic_message(panic.as_ref());
            error!(request_id = %request_id, "continuation panicked: {reason}");
        }
        true
    }

    /// Forget a request without running it. Used by callers that layer their
    /// own deadline on top.
    pub fn abandon(&self, request_id: Uuid) -> bool {
        let removed = self.pending.remove(&request_id).is_some();
        if removed {
            debug!(request_id = %request_id, "abandoned request");
        }
        removed
    }

    pub fn is_pending(&self, request_id: Uuid) -> bool {
        self.pending.contains_key(&request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
