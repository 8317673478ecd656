//! Connections shared by the zipper and its clients.
//!
//! A [`Connection`] is an accepted transport session plus its control stream.
//! Data streams are attached later according to the role's
//! [`DataStreamPolicy`]. Lifecycle changes are reported to the owner as
//! [`LifecycleEvent`]s on a channel.

pub mod heartbeat;
mod role;
mod state;

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use heartbeat::{Heartbeat, HeartbeatConfig};
pub use role::{DataStreamPolicy, Role};
pub use state::{ConnectionState, StateMachine};

use crate::frame::{Frame, FrameError, FrameReader, FrameType, FrameWriter, Tag};
use crate::transport::Session;
use crate::{MeshError, Result};

/// Something that happened to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Transport session established, handshake not yet sent.
    Connected { remote_addr: String },
    /// Handshake accepted.
    Accepted { connection_id: u64 },
    /// Handshake refused; the connection is closed and is not retried.
    Rejected { reason: String },
    /// The peer stopped renewing its heartbeat.
    HeartbeatExpired { connection_id: u64 },
    /// The connection is gone.
    Closed { connection_id: u64, reason: String },
}

/// Sender half for lifecycle events.
pub type EventSender = mpsc::UnboundedSender<LifecycleEvent>;

/// An authenticated connection.
pub struct Connection {
    id: u64,
    name: String,
    role: Role,
    observed_tags: Vec<Tag>,
    session: Arc<dyn Session>,
    control: Mutex<FrameWriter>,
    data: Mutex<Option<FrameWriter>>,
    state: StateMachine,
    cancel: CancellationToken,
    closed: AtomicBool,
    events: EventSender,
}

/// Identity fields fixed by the handshake.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub name: String,
    pub role: Role,
    pub observed_tags: Vec<Tag>,
}

impl Connection {
    /// Wrap an accepted session. `cancel` should be a child of the owner's token.
    pub fn new(
        info: ConnectionInfo,
        session: Arc<dyn Session>,
        control: FrameWriter,
        state: StateMachine,
        cancel: CancellationToken,
        events: EventSender,
    ) -> Self {
        let ConnectionInfo { id, name, role, observed_tags } = info;
        Self {
            id,
            name,
            role,
            observed_tags,
            session,
            control: Mutex::new(control),
            data: Mutex::new(None),
            state,
            cancel,
            closed: AtomicBool::new(false),
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote_addr(&self) -> String {
        self.session.remote_addr()
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn state(&self) -> &StateMachine {
        &self.state
    }

    /// Whether a frame with `tag` should be delivered to this peer.
    pub fn observes(&self, tag: Tag) -> bool {
        self.observed_tags.is_empty() || self.observed_tags.contains(&tag)
    }

    /// Token cancelled when this connection closes.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write one frame on the control stream.
    pub async fn send_control(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(MeshError::Closed);
        }
        let mut control = self.control.lock().await;
        control.send(frame).await?;
        Ok(())
    }

    /// Slot holding the writer of this connection's data stream.
    pub(crate) fn data_slot(&self) -> &Mutex<Option<FrameWriter>> {
        &self.data
    }

    /// Write one frame on the data stream. Fails when no data stream is attached.
    pub async fn send_data(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(MeshError::Closed);
        }
        let mut slot = self.data.lock().await;
        let writer = slot.as_mut().ok_or_else(|| MeshError::transport("no data stream attached"))?;
        if let Err(e) = writer.send(frame).await {
            *slot = None;
            return Err(e.into());
        }
        if self.state.current() == ConnectionState::Ready {
            self.state.transition(ConnectionState::TransportingData);
        }
        Ok(())
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) {
        // The owner may already be gone during shutdown.
        let _ = self.events.send(event);
    }

    /// Close the connection. Only the first call has any effect.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            connection = self.id,
            name = %self.name,
            role = %self.role,
            peer = %self.session.remote_addr(),
            reason,
            "Connection closed"
        );
        self.cancel.cancel();
        self.session.close(reason);
        self.state.transition(ConnectionState::Disconnected);
        self.emit(LifecycleEvent::Closed { connection_id: self.id, reason: reason.to_string() });
    }
}

/// Drain the control stream of `conn` until it ends.
///
/// Heartbeats renew `heartbeat`; with `echo` set each one is answered. A
/// malformed frame or the end of the stream closes the connection.
pub(crate) async fn read_control(
    conn: Arc<Connection>,
    mut reader: FrameReader,
    heartbeat: Arc<Heartbeat>,
    echo: bool,
) {
    let cancel = conn.cancel_token().clone();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = reader.next() => next,
        };
        match next {
            Some(Ok(frame)) if frame.frame_type() == FrameType::Heartbeat => {
                heartbeat.renew();
                if echo {
                    if let Err(e) = conn.send_control(frame).await {
                        debug!(connection = conn.id(), error = %e, "Failed to echo heartbeat");
                    }
                }
            }
            Some(Ok(frame)) => {
                debug!(connection = conn.id(), frame_type = %frame.frame_type(), "Ignoring control frame");
            }
            Some(Err(FrameError::Io(e))) => {
                debug!(connection = conn.id(), error = %e, "Control stream failed");
                conn.close("connection lost");
                break;
            }
            Some(Err(e)) => {
                warn!(
                    connection = conn.id(),
                    name = %conn.name(),
                    peer = %conn.remote_addr(),
                    error = %e,
                    "Malformed control frame"
                );
                conn.close("protocol error");
                break;
            }
            None => {
                conn.close("control stream closed");
                break;
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("role", &self.role)
            .field("state", &self.state.current())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!(connection = self.id, "Dropping connection");
        self.cancel.cancel();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::mem::MemSession;

    /// A connection over an in-memory session, plus the peer session and the event receiver.
    pub(crate) async fn connection_pair(
        info: ConnectionInfo,
    ) -> (Arc<Connection>, Arc<MemSession>, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (local, remote) = MemSession::pair("test");
        let local: Arc<dyn Session> = Arc::new(local);
        let control = local.open_stream().await.unwrap();
        let (_, writer) = control.framed();
        let (tx, rx) = mpsc::unbounded_channel();
        let state = StateMachine::new();
        for next in [
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Accepted,
            ConnectionState::Ready,
        ] {
            state.transition(next);
        }
        let conn = Connection::new(info, local, writer, state, CancellationToken::new(), tx);
        (Arc::new(conn), Arc::new(remote), rx)
    }

    pub(crate) fn info(id: u64, name: &str, role: Role) -> ConnectionInfo {
        ConnectionInfo { id, name: name.to_string(), role, observed_tags: Vec::new() }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reported_once() {
        let (conn, peer, mut events) = connection_pair(info(7, "sfn", Role::StreamFunction)).await;
        conn.close("first");
        conn.close("second");

        assert!(conn.is_closed());
        assert!(conn.cancel_token().is_cancelled());
        assert_eq!(conn.state().current(), ConnectionState::Disconnected);
        assert_eq!(
            events.recv().await,
            Some(LifecycleEvent::Closed { connection_id: 7, reason: "first".to_string() })
        );
        assert!(events.try_recv().is_err());
        assert!(matches!(peer.open_stream().await, Err(MeshError::Closed)));
        let beat = Frame::new(crate::frame::FrameType::Heartbeat, bytes::Bytes::new());
        assert!(matches!(conn.send_control(beat).await, Err(MeshError::Closed)));
    }

    #[tokio::test]
    async fn tag_filter_defaults_to_everything() {
        let (conn, _peer, _events) = connection_pair(info(1, "all", Role::StreamFunction)).await;
        assert!(conn.observes(0x10));

        let mut filtered = info(2, "some", Role::StreamFunction);
        filtered.observed_tags = vec![0x10];
        let (conn, _peer, _events) = connection_pair(filtered).await;
        assert!(conn.observes(0x10));
        assert!(!conn.observes(0x11));
    }

    #[tokio::test]
    async fn control_reader_echoes_heartbeats_and_closes_on_garbage() {
        use tokio::io::AsyncWriteExt;

        let (conn, peer, _events) = connection_pair(info(4, "src", Role::Source)).await;
        // The peer reads echoes off the stream `conn` writes its control frames to.
        let (mut echoes, _) = peer.accept_stream().await.unwrap().unwrap().framed();
        let mut inbound = peer.open_stream().await.unwrap();
        let (reader, _) = conn.session().accept_stream().await.unwrap().unwrap().framed();

        let heartbeat = Arc::new(Heartbeat::spawn(Arc::clone(&conn), HeartbeatConfig::default(), false));
        let task = tokio::spawn(read_control(Arc::clone(&conn), reader, heartbeat, true));

        let beat = Frame::new(FrameType::Heartbeat, bytes::Bytes::new()).encode().unwrap();
        inbound.writer.write_all(&beat).await.unwrap();
        let echoed = echoes.next().await.unwrap().unwrap();
        assert_eq!(echoed.frame_type(), FrameType::Heartbeat);

        inbound.writer.write_all(&[0x00, 0x00, 0x03, 0x7f, 0x00, 0x00]).await.unwrap();
        task.await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn data_without_stream_is_an_error() {
        let (conn, _peer, _events) = connection_pair(info(3, "src", Role::Source)).await;
        let frame = Frame::new(crate::frame::FrameType::Payload, bytes::Bytes::new());
        assert!(matches!(conn.send_data(frame).await, Err(MeshError::Transport { .. })));
    }
}
