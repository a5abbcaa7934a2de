//! Duplex client implementation

use crate::config::DuplexConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{DuplexError, Result};
use crate::messages::Payload;
use crate::router::{EventRouter, MatchKey, Subscription};
use crate::session::{RequestSession, ResponseHandler};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};

/// A role-prefixed task request, `{"task": "<role>.<endpoint>", "body": ..}`
#[derive(Debug, Clone, Serialize)]
pub struct TaskRequest {
    pub task: String,
    pub body: Value,
}

impl TaskRequest {
    pub fn new(role: &str, endpoint: &str, body: Value) -> Self {
        Self {
            task: format!("{role}.{endpoint}"),
            body,
        }
    }
}

/// The operations a higher-level façade may build on
#[async_trait]
pub trait DuplexApi: Send + Sync {
    /// Role prefix for [`call`](Self::call)
    fn role(&self) -> &str;

    fn connection_state(&self) -> ConnectionState;

    /// Fire-and-forget send; `false` if the socket is not open
    fn send_payload(&self, payload: Payload) -> bool;

    /// Send a request and wait for its response
    async fn request_value(&self, payload: Value) -> Result<Value>;

    /// Listen for unsolicited messages
    fn watch(&self, key: MatchKey, action: Box<dyn Fn(&Value) + Send + Sync>) -> Subscription;

    /// Send `{task: "<role>.<endpoint>", body}` and wait for the response
    async fn call(&self, endpoint: &str, body: Value) -> Result<Value> {
        let request = TaskRequest::new(self.role(), endpoint, body);
        self.request_value(serde_json::to_value(request)?).await
    }
}

/// Duplex WebSocket client
///
/// Multiplexes concurrent requests and unsolicited pushes over one
/// reconnecting socket. This struct is cheaply cloneable.
///
/// The socket's reader and writer tasks and any reconnect timer hold the
/// shared connection, so dropping every clone does not stop them. Call
/// [`dispose`](Self::dispose) when done.
#[derive(Clone)]
pub struct DuplexClient {
    connection: ConnectionManager,
}

impl DuplexClient {
    /// Create a new client with its own event router
    pub fn new(config: DuplexConfig) -> Result<Self> {
        Self::with_router(config, EventRouter::new())
    }

    /// Create a client that dispatches unsolicited messages to `router`
    pub fn with_router(config: DuplexConfig, router: EventRouter) -> Result<Self> {
        Ok(Self {
            connection: ConnectionManager::new(config, router)?,
        })
    }

    /// Create a client and open its connection.
    ///
    /// If the first handshake fails the client is disposed and the error is
    /// returned; nothing keeps dialing. Use [`connect_lazy`](Self::connect_lazy)
    /// to keep retrying in the background instead.
    pub async fn connect(config: DuplexConfig) -> Result<Self> {
        let client = Self::new(config)?;
        if let Err(e) = client.connection.connect().await {
            client.dispose();
            return Err(e);
        }
        Ok(client)
    }

    /// Create a client and start connecting.
    ///
    /// A failed first handshake is logged and retried every `reconnect_delay`;
    /// await [`wait_open`](Self::wait_open) for the outcome.
    pub async fn connect_lazy(config: DuplexConfig) -> Result<Self> {
        let client = Self::new(config)?;
        if let Err(e) = client.connection.connect().await {
            debug!(error = %e, "Initial connect failed, retrying in background");
        }
        Ok(client)
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn router(&self) -> &EventRouter {
        self.connection.router()
    }

    pub fn config(&self) -> &DuplexConfig {
        self.connection.config()
    }

    /// Get the current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Get a receiver for connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state_receiver()
    }

    /// Open the connection if it is not already open
    pub async fn open(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Wait until the connection is open
    pub async fn wait_open(&self) -> Result<()> {
        self.connection.wait_open().await
    }

    /// Send without expecting a response
    pub fn send(&self, payload: impl Into<Payload>) -> bool {
        self.connection.send(payload)
    }

    /// Send a request and wait for the response carrying its identifier
    pub async fn request(&self, payload: Value) -> Result<Value> {
        self.dispatch(payload, None).await
    }

    /// Send a request whose responses go to `handler`.
    ///
    /// The handler sees every response carrying the request's identifier and
    /// decides when to call [`RequestSession::resolve`]; the returned future
    /// completes with the value it resolves with.
    pub async fn request_with<F>(&self, payload: Value, handler: F) -> Result<Value>
    where
        F: Fn(Value, RequestSession) + Send + Sync + 'static,
    {
        let handler: ResponseHandler = Arc::new(handler);
        self.dispatch(payload, Some(handler)).await
    }

    /// Typed request: serializes `payload` and deserializes the response
    pub async fn request_as<Req: Serialize, Res: DeserializeOwned>(
        &self,
        payload: &Req,
    ) -> Result<Res> {
        let response = self.request(serde_json::to_value(payload)?).await?;
        serde_json::from_value(response).map_err(DuplexError::Serialization)
    }

    /// Subscribe to unsolicited messages matching `key`
    pub fn subscribe<F>(&self, key: impl Into<MatchKey>, action: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.router().subscribe(key, action)
    }

    /// Number of requests awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.connection.pending().len()
    }

    /// Shut the client down, abandoning pending requests
    pub fn dispose(&self) {
        self.connection.dispose();
    }

    async fn dispatch(&self, payload: Value, handler: Option<ResponseHandler>) -> Result<Value> {
        if self.connection_state() == ConnectionState::Disposed {
            return Err(DuplexError::Shutdown);
        }

        let config = self.connection.config();
        let (session, response_rx) = RequestSession::open(
            self.connection.pending(),
            self.connection.ids(),
            payload,
            handler,
            config.debug,
        );

        if config.debug {
            debug!(request = ?session, "Request");
        }

        if !self.connection.send(session.payload().clone()) {
            session.abandon();
            return Err(DuplexError::NotConnected);
        }

        let outcome = match config.request_timeout {
            Some(limit) => match timeout(limit, response_rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(id = %session.id(), timeout = ?limit, "Request timed out");
                    session.abandon();
                    return Err(DuplexError::Timeout);
                }
            },
            None => response_rx.await,
        };

        // Sender dropped without completing
        outcome.unwrap_or(Err(DuplexError::Abandoned))
    }
}

#[async_trait]
impl DuplexApi for DuplexClient {
    fn role(&self) -> &str {
        &self.config().role
    }

    fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    fn send_payload(&self, payload: Payload) -> bool {
        self.connection.send(payload)
    }

    async fn request_value(&self, payload: Value) -> Result<Value> {
        self.dispatch(payload, None).await
    }

    fn watch(&self, key: MatchKey, action: Box<dyn Fn(&Value) + Send + Sync>) -> Subscription {
        self.router().subscribe(key, action)
    }
}
