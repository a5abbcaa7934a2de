//! Request sessions and the pending-request table

use crate::error::{DuplexError, Result};
use crate::ids::{CorrelationId, IdAllocator};
use crate::messages::stamp;

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Handler for responses to a request.
///
/// Receives every response matching the request's identifier together with the
/// session, and completes the caller's future by calling
/// [`RequestSession::resolve`] when it is satisfied.
pub type ResponseHandler = Arc<dyn Fn(Value, RequestSession) + Send + Sync>;

/// Sessions awaiting a response, keyed by the wire form of their identifier
#[derive(Default)]
pub struct PendingTable {
    sessions: Mutex<HashMap<String, RequestSession>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Refuses a second entry for the same identifier.
    pub(crate) fn insert(&self, session: RequestSession) -> bool {
        let mut sessions = self.sessions.lock();
        let key = session.id().wire_key();
        if sessions.contains_key(&key) {
            return false;
        }
        sessions.insert(key, session);
        true
    }

    /// Look up the session waiting on `key`
    pub fn get(&self, key: &str) -> Option<RequestSession> {
        self.sessions.lock().get(key).cloned()
    }

    /// Remove `session` if it is still the entry for its identifier
    fn remove(&self, session: &RequestSession) {
        let mut sessions = self.sessions.lock();
        let key = session.id().wire_key();
        if sessions
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(&current.inner, &session.inner))
        {
            sessions.remove(&key);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sessions.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Abandon every pending session, waking their callers with `Abandoned`
    pub(crate) fn abandon_all(&self) -> usize {
        let sessions: Vec<RequestSession> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        let count = sessions.len();
        for session in sessions {
            session.abandon();
        }
        count
    }
}

struct SessionInner {
    id: CorrelationId,
    payload: Value,
    handler: Option<ResponseHandler>,
    completion: Mutex<Option<oneshot::Sender<Result<Value>>>>,
    table: Weak<PendingTable>,
    ids: Arc<IdAllocator>,
    debug: bool,
}

/// One outstanding request.
///
/// Cheap to clone; every clone refers to the same request. It resolves
/// exactly once: later calls to [`resolve`](Self::resolve) or
/// [`abandon`](Self::abandon) return `false` and change nothing.
#[derive(Clone)]
pub struct RequestSession {
    inner: Arc<SessionInner>,
}

impl RequestSession {
    /// Allocate an identifier, stamp it on `payload` and register the session
    /// before anything is sent.
    pub(crate) fn open(
        table: &Arc<PendingTable>,
        ids: &Arc<IdAllocator>,
        payload: Value,
        handler: Option<ResponseHandler>,
        debug: bool,
    ) -> (Self, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();

        loop {
            let id = ids.allocate();
            let session = Self {
                inner: Arc::new(SessionInner {
                    id,
                    payload: stamp(payload.clone(), id),
                    handler: handler.clone(),
                    completion: Mutex::new(None),
                    table: Arc::downgrade(table),
                    ids: ids.clone(),
                    debug,
                }),
            };

            if table.insert(session.clone()) {
                *session.inner.completion.lock() = Some(tx);
                if debug {
                    debug!(id = %id, payload = %session.inner.payload, "Request registered");
                }
                return (session, rx);
            }

            // Allocator and table disagree; keep the id out of circulation
            error!(id = %id, "Correlation id already pending, allocating another");
        }
    }

    pub fn id(&self) -> CorrelationId {
        self.inner.id
    }

    /// The payload as sent, including the correlation field
    pub fn payload(&self) -> &Value {
        &self.inner.payload
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.completion.lock().is_none()
    }

    /// Deliver a matching response: to the handler if one was given,
    /// otherwise straight to the caller.
    pub(crate) fn received(&self, response: Value) {
        match &self.inner.handler {
            Some(handler) => {
                let handler = handler.clone();
                let session = self.clone();
                let outcome = catch_unwind(AssertUnwindSafe(move || handler(response, session)));
                if outcome.is_err() {
                    error!(id = %self.inner.id, "Response handler panicked, abandoning request");
                    self.abandon();
                }
            }
            None => {
                self.resolve(response);
            }
        }
    }

    /// Complete the request with `response`
    pub fn resolve(&self, response: Value) -> bool {
        if self.inner.debug {
            debug!(id = %self.inner.id, "Resolve");
        }
        self.complete(Ok(response))
    }

    /// Give up on the request; the caller sees `DuplexError::Abandoned`
    pub fn abandon(&self) -> bool {
        self.complete(Err(DuplexError::Abandoned))
    }

    fn complete(&self, outcome: Result<Value>) -> bool {
        let Some(tx) = self.inner.completion.lock().take() else {
            return false;
        };

        if let Some(table) = self.inner.table.upgrade() {
            table.remove(self);
        }
        self.inner.ids.release(self.inner.id);

        // The caller may have stopped waiting
        let _ = tx.send(outcome);
        true
    }
}

impl std::fmt::Debug for RequestSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSession")
            .field("id", &self.inner.id)
            .field("payload", &self.inner.payload)
            .field("has_handler", &self.inner.handler.is_some())
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
