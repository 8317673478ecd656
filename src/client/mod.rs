//! Clients of a zipper.
//!
//! Every client speaks the same handshake and keeps its connection alive the
//! same way; what differs per role is how data streams are set up once the
//! zipper accepts the handshake. That part is a [`RoleBehavior`]:
//!
//! - [`Source`] (and an upstream zipper) opens a data stream and writes to it.
//! - [`ZipperSender`] does the same to cascade data to another zipper.
//! - [`StreamFunction`] waits for the zipper to open streams, runs its
//!   [`Handler`] on every frame and writes the results back.
//! - [`OutputConnector`] receives the workflow's final output.
//!
//! A client that loses an accepted connection reconnects on its own with a
//! fixed backoff, unless the zipper rejected it or it was closed.

mod role;
mod sfn;
mod source;

use futures::future::BoxFuture;
use futures::{SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::time::timeout;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use role::RoleBehavior;
pub use sfn::{Handler, OutputConnector, Responder, StreamFunction};
pub use source::{Originator, Source, ZipperSender};

use crate::config::{DEFAULT_BUFFER_SIZE, RuntimeEnv};
use crate::connection::{
    Connection, ConnectionInfo, ConnectionState, Heartbeat, HeartbeatConfig, LifecycleEvent, Role,
    StateMachine, read_control,
};
use crate::frame::{Frame, HandshakeFrame, Packet, Tag, TypedFrame};
use crate::transport::{Dialer, Session};
use crate::{MeshError, Result};

const EVENT_CAPACITY: usize = 32;

/// Client timing, credentials and buffering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Only the timeout applies; clients answer the zipper's heartbeats.
    pub heartbeat: HeartbeatConfig,
    pub handshake_timeout: Duration,
    pub ack_timeout: Duration,
    /// Pause between connection attempts.
    pub retry_backoff: Duration,
    /// Token presented in the handshake.
    pub credential: Option<String>,
    /// Reconnect after losing an accepted connection.
    pub auto_reconnect: bool,
    /// Inbound buffer of stream functions and output connectors.
    pub buffer_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            handshake_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(3),
            credential: None,
            auto_reconnect: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ClientOptions {
    /// Defaults with the buffer size taken from the environment.
    pub fn from_runtime(env: &RuntimeEnv) -> Self {
        Self { buffer_size: env.buffer_size, ..Self::default() }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }
}

/// A client connection to one zipper.
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    name: String,
    addr: String,
    dialer: Arc<dyn Dialer>,
    behavior: Arc<dyn RoleBehavior>,
    options: ClientOptions,
    state: StateMachine,
    link: Mutex<Option<Link>>,
    events: broadcast::Sender<LifecycleEvent>,
    shutdown: CancellationToken,
}

/// The current accepted connection.
struct Link {
    conn: Arc<Connection>,
    /// Set when the client itself replaces or closes the connection.
    retired: Arc<AtomicBool>,
    _heartbeat: Arc<Heartbeat>,
}

impl Client {
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        dialer: Arc<dyn Dialer>,
        options: ClientOptions,
        behavior: Arc<dyn RoleBehavior>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ClientInner {
                name: name.into(),
                addr: addr.into(),
                dialer,
                behavior,
                options,
                state: StateMachine::new(),
                link: Mutex::new(None),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn role(&self) -> Role {
        self.inner.behavior.role()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// State changes as a stream, starting with the current state.
    pub fn state_updates(&self) -> impl Stream<Item = ConnectionState> + 'static {
        WatchStream::new(self.inner.state.subscribe())
    }

    /// Lifecycle events of every connection this client makes.
    pub fn events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    /// [`Client::events`] as a stream. Events missed by a slow reader are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = LifecycleEvent> + 'static {
        BroadcastStream::new(self.inner.events.subscribe()).filter_map(|event| async move { event.ok() })
    }

    /// Id the zipper assigned to the current connection.
    pub async fn connection_id(&self) -> Option<u64> {
        self.inner.connection().await.map(|conn| conn.id())
    }

    /// Connect once. A rejection is returned as [`MeshError::Rejected`].
    pub async fn connect(&self) -> Result<()> {
        self.inner.establish().await
    }

    /// Connect, retrying with a fixed backoff until connected, rejected or cancelled.
    pub async fn retry(&self, cancel: &CancellationToken) -> Result<()> {
        self.inner.retry(cancel).await
    }

    /// Connect with at most `count` attempts. Returns whether it connected.
    pub async fn retry_with_count(&self, count: u32, cancel: &CancellationToken) -> bool {
        self.inner.retry_with_count(count, cancel).await
    }

    /// Write an encoded frame on the data stream.
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        let conn = self.inner.connection().await.ok_or(MeshError::Closed)?;
        conn.send_data(frame).await
    }

    /// Write `carriage` with `tag` as a new transaction from this client.
    pub async fn write(&self, tag: Tag, carriage: impl Into<bytes::Bytes>) -> Result<()> {
        let conn = self.inner.connection().await.ok_or(MeshError::Closed)?;
        let data = crate::frame::DataFrame::new(
            uuid::Uuid::new_v4().to_string(),
            conn.id().to_string(),
            tag,
            carriage,
        );
        conn.send_data(data.to_frame()?).await
    }

    /// Close the connection and stop reconnecting.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.retire("client closed").await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.inner.name)
            .field("addr", &self.inner.addr)
            .field("role", &self.inner.behavior.role())
            .field("state", &self.inner.state.current())
            .finish()
    }
}

impl ClientInner {
    fn publish(&self, event: LifecycleEvent) {
        // Nobody may be listening.
        let _ = self.events.send(event);
    }

    async fn connection(&self) -> Option<Arc<Connection>> {
        let link = self.link.lock().await;
        link.as_ref().map(|link| Arc::clone(&link.conn)).filter(|conn| !conn.is_closed())
    }

    /// Close the current connection without triggering a reconnect.
    async fn retire(&self, reason: &str) {
        if let Some(link) = self.link.lock().await.take() {
            link.retired.store(true, Ordering::Release);
            link.conn.close(reason);
        }
    }

    async fn establish(self: &Arc<Self>) -> Result<()> {
        self.retire("reconnecting").await;
        if self.shutdown.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        self.state.transition(ConnectionState::Connecting);

        let result = self.dial_and_authenticate().await;
        if result.is_err() && self.state.current() != ConnectionState::Disconnected {
            self.state.transition(ConnectionState::Disconnected);
        }
        result
    }

    async fn dial_and_authenticate(self: &Arc<Self>) -> Result<()> {
        let session = self.dialer.dial(&self.addr).await?;
        self.publish(LifecycleEvent::Connected { remote_addr: session.remote_addr() });
        match self.authenticate(&session).await {
            Ok(link) => {
                *self.link.lock().await = Some(link);
                Ok(())
            }
            Err(e) => {
                session.close("handshake failed");
                Err(e)
            }
        }
    }

    async fn authenticate(self: &Arc<Self>, session: &Arc<dyn Session>) -> Result<Link> {
        let (mut reader, mut writer) = session.open_stream().await?.framed();
        self.state.transition(ConnectionState::Authenticating);

        let role = self.behavior.role();
        let observed_tags = self.behavior.observed_tags();
        let hello = HandshakeFrame::new(&self.name, role)
            .with_observed_tags(observed_tags.iter().copied())
            .with_credential(self.options.credential.clone());
        writer.send(hello.to_frame()?).await?;

        let wait = self.options.handshake_timeout;
        let reply = match timeout(wait, reader.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => return Err(MeshError::Closed),
            Err(_) => return Err(MeshError::timeout(wait, "waiting for handshake reply")),
        };
        let id = match Packet::try_from(&reply)? {
            Packet::Accepted(accepted) => accepted.connection_id,
            Packet::Rejected(rejected) => {
                self.state.transition(ConnectionState::Rejected);
                warn!(name = %self.name, addr = %self.addr, reason = %rejected.reason, "Handshake rejected");
                self.publish(LifecycleEvent::Rejected { reason: rejected.reason.clone() });
                return Err(MeshError::rejected(rejected.reason));
            }
            other => return Err(MeshError::unexpected_frame("Accepted", other.frame_type())),
        };
        self.state.transition(ConnectionState::Accepted);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let info = ConnectionInfo { id, name: self.name.clone(), role, observed_tags };
        let conn = Arc::new(Connection::new(
            info,
            Arc::clone(session),
            writer,
            self.state.clone(),
            self.shutdown.child_token(),
            events_tx,
        ));
        self.publish(LifecycleEvent::Accepted { connection_id: id });

        let heartbeat = Arc::new(Heartbeat::spawn(Arc::clone(&conn), self.options.heartbeat, false));
        tokio::spawn(read_control(Arc::clone(&conn), reader, Arc::clone(&heartbeat), true));

        if let Err(e) = self.behavior.on_accepted(&conn, &self.options).await {
            conn.close("data stream setup failed");
            return Err(e);
        }
        self.state.transition(ConnectionState::Ready);

        let retired = Arc::new(AtomicBool::new(false));
        tokio::spawn(supervise(Arc::downgrade(self), events_rx, Arc::clone(&retired)));
        info!(name = %self.name, role = %role, addr = %self.addr, connection = id, "Connected to zipper");
        Ok(Link { conn, retired, _heartbeat: heartbeat })
    }

    async fn retry(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if cancel.is_cancelled() || self.shutdown.is_cancelled() {
                return Err(MeshError::Cancelled);
            }
            match self.establish().await {
                Ok(()) => return Ok(()),
                Err(e @ MeshError::Rejected { .. }) => return Err(e),
                Err(e) => warn!(
                    name = %self.name,
                    addr = %self.addr,
                    attempt,
                    error = %e,
                    backoff = ?self.options.retry_backoff,
                    "Connect failed, retrying"
                ),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(MeshError::Cancelled),
                _ = self.shutdown.cancelled() => return Err(MeshError::Cancelled),
                _ = tokio::time::sleep(self.options.retry_backoff) => {}
            }
        }
    }

    async fn retry_with_count(self: &Arc<Self>, count: u32, cancel: &CancellationToken) -> bool {
        for attempt in 1..=count {
            if cancel.is_cancelled() || self.shutdown.is_cancelled() {
                return false;
            }
            match self.establish().await {
                Ok(()) => return true,
                Err(MeshError::Rejected { .. }) => return false,
                Err(e) => warn!(name = %self.name, addr = %self.addr, attempt, count, error = %e, "Connect failed"),
            }
            if attempt < count {
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = self.shutdown.cancelled() => return false,
                    _ = tokio::time::sleep(self.options.retry_backoff) => {}
                }
            }
        }
        false
    }
}

/// Republish a connection's events and reconnect when it is lost.
///
/// Boxed because reconnecting spawns a new supervisor from within.
fn supervise(
    inner: Weak<ClientInner>,
    events: mpsc::UnboundedReceiver<LifecycleEvent>,
    retired: Arc<AtomicBool>,
) -> BoxFuture<'static, ()> {
    Box::pin(supervise_events(inner, events, retired))
}

async fn supervise_events(
    inner: Weak<ClientInner>,
    mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
    retired: Arc<AtomicBool>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.publish(event.clone());
        let LifecycleEvent::Closed { reason, .. } = event else {
            continue;
        };
        if retired.load(Ordering::Acquire) || inner.shutdown.is_cancelled() || !inner.options.auto_reconnect {
            return;
        }
        warn!(name = %inner.name, addr = %inner.addr, reason = %reason, "Connection lost, reconnecting");
        let cancel = inner.shutdown.clone();
        if let Err(e) = inner.retry(&cancel).await {
            debug!(name = %inner.name, error = %e, "Stopped reconnecting");
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;
    use crate::server::{Server, ServerOptions};
    use crate::transport::mem::MemNetwork;

    fn fast() -> ClientOptions {
        ClientOptions { retry_backoff: Duration::from_millis(50), ..ClientOptions::default() }
    }

    fn zipper(network: &MemNetwork, addr: &str) -> Arc<Server> {
        let config = WorkflowConfig::new("zipper", "127.0.0.1", 9000).with_functions(["echo"]);
        let server = Arc::new(Server::new(&config).with_options(ServerOptions {
            reject_linger: Duration::from_millis(50),
            ..ServerOptions::default()
        }));
        let listener = network.listen(addr);
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener).await });
        server
    }

    #[tokio::test]
    async fn source_connects_and_reports_events() {
        let network = MemNetwork::new();
        let server = zipper(&network, "zipper");
        let source = Source::new("camera", "zipper", Arc::new(network.dialer()), fast());
        let mut events = source.client().events();

        source.connect().await.unwrap();
        assert_eq!(source.client().state(), ConnectionState::Ready);
        assert!(matches!(events.recv().await.unwrap(), LifecycleEvent::Connected { .. }));
        let id = match events.recv().await.unwrap() {
            LifecycleEvent::Accepted { connection_id } => connection_id,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(source.client().connection_id().await, Some(id));
        assert!(server.registry().contains(id));

        source.write(0x10, &b"frame"[..]).await.unwrap();
        assert_eq!(source.client().state(), ConnectionState::TransportingData);
        source.close().await;
        assert_eq!(source.client().state(), ConnectionState::Disconnected);
        assert!(matches!(source.write(0x10, &b"late"[..]).await, Err(MeshError::Closed)));
        server.shutdown();
    }

    #[tokio::test]
    async fn rejection_stops_retrying() {
        let network = MemNetwork::new();
        let server = zipper(&network, "zipper");
        let handler = |_tag: Tag, _data: &[u8]| -> Option<(Tag, bytes::Bytes)> { None };
        let sfn = StreamFunction::new("resize", "zipper", Arc::new(network.dialer()), fast(), [], handler);

        let err = sfn.client().retry(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MeshError::Rejected { .. }));
        assert_eq!(sfn.client().state(), ConnectionState::Disconnected);
        assert!(!server.registry().contains_name("resize"));
        server.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_retry_gives_up_on_an_absent_zipper() {
        let network = MemNetwork::new();
        let source = Source::new("camera", "nowhere", Arc::new(network.dialer()), fast());
        let started = tokio::time::Instant::now();
        assert!(!source.client().retry_with_count(3, &CancellationToken::new()).await);
        assert_eq!(started.elapsed(), Duration::from_millis(100));
        assert_eq!(source.client().state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn cancelled_retry_returns() {
        let network = MemNetwork::new();
        let source = Source::new("camera", "nowhere", Arc::new(network.dialer()), fast());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(source.client().retry(&cancel).await, Err(MeshError::Cancelled)));
    }

    #[tokio::test]
    async fn lost_connection_is_reestablished() {
        let network = MemNetwork::new();
        let server = zipper(&network, "zipper");
        let source = Source::new("camera", "zipper", Arc::new(network.dialer()), fast());
        source.connect().await.unwrap();
        let first = source.client().connection_id().await.unwrap();
        let mut events = Box::pin(source.client().event_stream());

        server.registry().get(first).unwrap().connection().close("kicked");
        let mut closed = false;
        while let Some(event) = events.next().await {
            match event {
                LifecycleEvent::Closed { connection_id, .. } => {
                    assert_eq!(connection_id, first);
                    closed = true;
                }
                LifecycleEvent::Accepted { connection_id } => {
                    assert_ne!(connection_id, first);
                    break;
                }
                _ => {}
            }
        }
        assert!(closed);
        let mut states = Box::pin(source.client().state_updates());
        while let Some(state) = states.next().await {
            if state == ConnectionState::Ready {
                break;
            }
        }
        source.close().await;
        server.shutdown();
    }
}
