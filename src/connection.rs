//! Connection lifecycle: open, send, receive, reconnect
//!
//! A [`ConnectionManager`] owns one WebSocket to one endpoint. Every open
//! socket gets a reader task, which decodes and routes inbound frames strictly
//! in arrival order, and a writer task fed by an unbounded channel.
//!
//! Losing the socket, whether by error or by the peer closing it, moves the
//! state to `Closed` and schedules a reconnect timer. At most one timer exists
//! at a time; it retries every `reconnect_delay` until a handshake succeeds.

use crate::config::DuplexConfig;
use crate::error::{DuplexError, Result};
use crate::ids::IdAllocator;
use crate::messages::{correlation_key, decode, Payload};
use crate::router::EventRouter;
use crate::session::PendingTable;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle state of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress
    Connecting,
    /// Socket open; sends are accepted
    Open,
    /// No socket and no retry scheduled yet
    Closed,
    /// Waiting on the reconnect timer
    Reconnecting,
    /// Shut down by the owner; terminal
    Disposed,
}

/// The live socket's tasks and outbound queue
struct Link {
    tx: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

struct ConnectionInner {
    config: DuplexConfig,
    url: String,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    timers_scheduled: AtomicU64,
    // Bumped whenever a socket is installed or detached, so late events from
    // a detached socket can be recognised and ignored
    generation: AtomicU64,
    pending: Arc<PendingTable>,
    ids: Arc<IdAllocator>,
    router: EventRouter,
}

/// Owns the transport to one endpoint.
///
/// Cheaply cloneable; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

impl ConnectionManager {
    /// Create a manager for `config`. Nothing is dialed until [`connect`](Self::connect).
    pub fn new(mut config: DuplexConfig, router: EventRouter) -> Result<Self> {
        config.ensure_identity();
        let url = config.endpoint_url()?;
        router.set_debug(config.debug);

        let (state, _) = watch::channel(ConnectionState::Closed);

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                config,
                url,
                state,
                link: Mutex::new(None),
                reconnect_timer: Mutex::new(None),
                timers_scheduled: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                pending: Arc::new(PendingTable::new()),
                ids: Arc::new(IdAllocator::new()),
                router,
            }),
        })
    }

    pub fn config(&self) -> &DuplexConfig {
        &self.inner.config
    }

    /// The URL dialed, including the identity parameter
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Get a receiver for connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.inner.pending
    }

    pub fn ids(&self) -> &Arc<IdAllocator> {
        &self.inner.ids
    }

    pub fn router(&self) -> &EventRouter {
        &self.inner.router
    }

    /// Whether a reconnect timer is currently pending
    pub fn reconnect_pending(&self) -> bool {
        self.inner.reconnect_timer.lock().is_some()
    }

    /// Total number of reconnect timers ever scheduled
    pub fn reconnect_timers_scheduled(&self) -> u64 {
        self.inner.timers_scheduled.load(Ordering::SeqCst)
    }

    /// Open the transport.
    ///
    /// On failure the state becomes `Closed`, the reconnect cycle starts in
    /// the background and the error is returned. If a handshake or a
    /// reconnect is already under way this waits for it instead of dialing a
    /// second socket.
    pub async fn connect(&self) -> Result<()> {
        if self.reconnect_pending() {
            return self.wait_open().await;
        }

        match self.inner.claim_connect() {
            ConnectionState::Closed => {}
            ConnectionState::Disposed => return Err(DuplexError::Shutdown),
            ConnectionState::Open => return Ok(()),
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                debug!("Connect already in progress, waiting");
                return self.wait_open().await;
            }
        }
        info!(url = %self.inner.url, "Connecting");

        match self.inner.open_transport().await {
            Ok(socket) => {
                self.inner.install(socket, false);
                match self.state() {
                    ConnectionState::Open => Ok(()),
                    ConnectionState::Disposed => Err(DuplexError::Shutdown),
                    _ => self.wait_open().await,
                }
            }
            Err(e) => {
                warn!(error = %e, "Connection failed");
                self.inner.handle_close("connect failed");
                Err(e)
            }
        }
    }

    /// Wait until the connection is open. Fails with `Shutdown` once disposed.
    pub async fn wait_open(&self) -> Result<()> {
        let mut state_rx = self.inner.state.subscribe();
        loop {
            match *state_rx.borrow_and_update() {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Disposed => return Err(DuplexError::Shutdown),
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(DuplexError::Shutdown);
            }
        }
    }

    /// Send a payload if the socket is open.
    ///
    /// Returns `false` without queueing when it is not, and starts a
    /// reconnect as a side effect.
    pub fn send(&self, payload: impl Into<Payload>) -> bool {
        self.inner.send(payload.into())
    }

    /// Drop the current socket and schedule a retry, unless one is pending
    pub fn reconnect(&self) {
        self.inner.reconnect();
    }

    /// Decode and route one inbound frame
    pub fn process(&self, raw: &str) {
        self.inner.process(raw);
    }

    /// Shut down for good: cancel any retry, close the socket and abandon
    /// every pending request.
    pub fn dispose(&self) {
        let previous = self.inner.state.send_replace(ConnectionState::Disposed);
        if previous == ConnectionState::Disposed {
            return;
        }

        if let Some(timer) = self.inner.reconnect_timer.lock().take() {
            timer.abort();
        }
        self.inner.detach();

        let abandoned = self.inner.pending.abandon_all();
        info!(abandoned, "Connection disposed");
    }
}

impl ConnectionInner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        // Disposed is terminal
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Disposed || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Move `Closed` to `Connecting` atomically, returning the state seen.
    /// Only the caller that observed `Closed` may dial.
    fn claim_connect(&self) -> ConnectionState {
        let mut observed = ConnectionState::Closed;
        self.state.send_if_modified(|current| {
            observed = *current;
            if *current != ConnectionState::Closed {
                return false;
            }
            *current = ConnectionState::Connecting;
            true
        });
        observed
    }

    async fn open_transport(&self) -> Result<Socket> {
        match timeout(self.config.connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(e)) => Err(DuplexError::Connection(e.to_string())),
            Err(_) => Err(DuplexError::Timeout),
        }
    }

    /// Adopt a freshly opened socket. `from_timer` is set when called by the
    /// reconnect task itself, which must not abort its own handle.
    fn install(self: &Arc<Self>, socket: Socket, from_timer: bool) {
        // Held throughout so reconnect() cannot interleave
        let mut timer = self.reconnect_timer.lock();

        if self.state() == ConnectionState::Disposed {
            debug!("Discarding socket opened after dispose");
            return;
        }

        if let Some(handle) = timer.take() {
            if !from_timer {
                handle.abort();
            }
            debug!("Reconnect timer cleared");
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(self.clone(), sink, rx, generation));
        let reader = tokio::spawn(read_loop(self.clone(), stream, generation));

        if let Some(old) = self.link.lock().replace(Link { tx, reader }) {
            old.reader.abort();
        }

        self.set_state(ConnectionState::Open);
        info!(url = %self.url, "Connected");
    }

    /// Forget the current socket: its events are ignored from now on and the
    /// writer closes it once its queue is dropped.
    fn detach(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(link) = self.link.lock().take() {
            link.reader.abort();
            drop(link.tx);
        }
    }

    fn send(self: &Arc<Self>, payload: Payload) -> bool {
        if self.config.debug {
            debug!(payload = %payload, "Sending");
        }

        if self.state() == ConnectionState::Open {
            let message = match payload.into_message() {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize payload");
                    return false;
                }
            };

            let sent = self
                .link
                .lock()
                .as_ref()
                .is_some_and(|link| link.tx.send(message).is_ok());
            if sent {
                return true;
            }
        }

        debug!(state = ?self.state(), "Send while not open");
        if self.state() != ConnectionState::Disposed {
            self.reconnect();
        }
        false
    }

    fn reconnect(self: &Arc<Self>) {
        debug!("Reconnect called");
        if self.state() == ConnectionState::Disposed {
            return;
        }

        let mut timer = self.reconnect_timer.lock();
        if timer.is_some() {
            debug!("Reconnect already pending");
            return;
        }

        self.detach();

        if !self.config.auto_reconnect {
            self.set_state(ConnectionState::Closed);
            info!("Auto-reconnect disabled, staying closed");
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("No Tokio runtime available to schedule a reconnect");
            self.set_state(ConnectionState::Closed);
            return;
        };

        self.set_state(ConnectionState::Reconnecting);
        self.timers_scheduled.fetch_add(1, Ordering::SeqCst);
        *timer = Some(runtime.spawn(self.clone().reconnect_loop()));
        info!(delay = ?self.config.reconnect_delay, "Reconnect scheduled");
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut attempt = 0u32;

        loop {
            sleep(self.config.reconnect_delay).await;
            if self.state() == ConnectionState::Disposed {
                return;
            }

            attempt += 1;
            info!(attempt, url = %self.url, "Reconnecting");
            self.set_state(ConnectionState::Connecting);

            match self.open_transport().await {
                Ok(socket) => {
                    self.install(socket, true);
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");

                    if self
                        .config
                        .max_reconnect_attempts
                        .is_some_and(|max| attempt >= max)
                    {
                        error!(attempt, "Giving up on reconnecting");
                        self.reconnect_timer.lock().take();
                        self.set_state(ConnectionState::Closed);
                        return;
                    }

                    self.set_state(ConnectionState::Reconnecting);
                }
            }
        }
    }

    /// A socket went away, by error or by close; both are handled the same
    fn handle_close(self: &Arc<Self>, reason: &str) {
        if self.state() == ConnectionState::Disposed {
            return;
        }
        if self.reconnect_timer.lock().is_some() {
            debug!(reason, "Close while reconnect pending");
            return;
        }

        warn!(reason, "Connection closed");
        self.set_state(ConnectionState::Closed);
        self.reconnect();
    }

    fn transport_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(reason, "Ignoring event from detached socket");
            return;
        }
        self.handle_close(reason);
    }

    fn process(&self, raw: &str) {
        let message = match decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed message");
                return;
            }
        };

        if self.config.debug {
            debug!(message = %message, "Message from server");
        }

        let Some(key) = correlation_key(&message) else {
            self.router.update(&message);
            return;
        };

        if self.config.debug {
            debug!(id = %key, "Processing response");
        }

        match self.pending.get(&key) {
            Some(session) => session.received(message),
            None => debug!(id = %key, "No pending request, dropping response"),
        }
    }
}

async fn read_loop(inner: Arc<ConnectionInner>, mut stream: SplitStream<Socket>, generation: u64) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => inner.process(&text),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => inner.process(&text),
                Err(_) => warn!("Dropping non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                break format!("closed by peer ({frame:?})");
            }
            // Ping/pong are answered by tungstenite
            Some(Ok(_)) => {}
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        }
    };

    inner.transport_lost(generation, &reason);
}

async fn write_loop(
    inner: Arc<ConnectionInner>,
    mut sink: SplitSink<Socket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    generation: u64,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = sink.send(message).await {
            inner.transport_lost(generation, &e.to_string());
            return;
        }
    }

    // Queue dropped: the socket was detached
    let _ = sink.close().await;
}
