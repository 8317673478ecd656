//! Per-session handling on the zipper: handshake, registration, data streams.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ServerOptions;
use super::dispatch::read_data_from_source;
use super::peer::ServerPeer;
use super::registry::Registry;
use crate::connection::{
    Connection, ConnectionInfo, ConnectionState, DataStreamPolicy, Heartbeat, LifecycleEvent, Role,
    StateMachine, read_control,
};
use crate::frame::{
    AcceptedFrame, AckFrame, Frame, FrameReader, FrameWriter, HandshakeFrame, InitFrame, RejectedFrame,
    TypedFrame,
};
use crate::router::Router;
use crate::transport::Session;

/// Everything a session task needs from its server.
pub(crate) struct SessionContext {
    pub router: Arc<Router>,
    pub registry: Arc<Registry>,
    pub options: ServerOptions,
    pub auth_token: Option<String>,
    pub ingress: mpsc::Sender<Frame>,
    pub relay: mpsc::Sender<Frame>,
    pub cancel: CancellationToken,
    pub next_id: AtomicU64,
}

impl SessionContext {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Decide whether a handshake may proceed. `Err` carries the rejection reason.
    fn authorize(&self, handshake: &HandshakeFrame) -> Result<(), String> {
        if let Some(token) = &self.auth_token {
            if handshake.credential.as_deref() != Some(token.as_str()) {
                return Err(format!("authentication failed for '{}'", handshake.name));
            }
        }
        if handshake.name.is_empty() {
            return Err("missing client name".to_string());
        }
        match handshake.role {
            Role::None => Err(format!("unknown client type for '{}'", handshake.name)),
            Role::StreamFunction if !self.router.exists(&handshake.name) => {
                Err(format!("function '{}' is not part of the workflow", handshake.name))
            }
            _ => Ok(()),
        }
    }
}

/// Run one session from handshake to teardown.
pub(crate) async fn handle_session(ctx: Arc<SessionContext>, session: Arc<dyn Session>) {
    let peer_addr = session.remote_addr();
    let state = StateMachine::new();
    state.transition(ConnectionState::Connecting);

    let Some((reader, writer, handshake)) = read_handshake(&ctx, &session, &state).await else {
        session.close("handshake failed");
        return;
    };

    if let Err(reason) = ctx.authorize(&handshake) {
        warn!(
            peer = %peer_addr,
            name = %handshake.name,
            role = %handshake.role,
            reason = %reason,
            "Rejecting handshake"
        );
        state.transition(ConnectionState::Rejected);
        reject(&ctx, session, writer, reason).await;
        return;
    }

    let id = ctx.next_id();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    state.transition(ConnectionState::Accepted);
    let info = ConnectionInfo {
        id,
        name: handshake.name,
        role: handshake.role,
        observed_tags: handshake.observed_tags,
    };
    let conn = Arc::new(Connection::new(
        info,
        Arc::clone(&session),
        writer,
        state.clone(),
        ctx.cancel.child_token(),
        events_tx,
    ));

    let accepted = match AcceptedFrame::new(id).to_frame() {
        Ok(frame) => conn.send_control(frame).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = accepted {
        debug!(connection = id, peer = %peer_addr, error = %e, "Failed to send Accepted");
        conn.close("handshake failed");
        return;
    }

    let peer = Arc::new(ServerPeer::new(Arc::clone(&conn), ctx.options.ack_timeout, ctx.options.dispatch.channel_capacity));
    ctx.registry.insert(Arc::clone(&peer));
    state.transition(ConnectionState::Ready);
    conn.emit(LifecycleEvent::Accepted { connection_id: id });
    info!(
        connection = id,
        name = %conn.name(),
        role = %conn.role(),
        peer = %peer_addr,
        "Connection accepted"
    );

    let heartbeat = Arc::new(Heartbeat::spawn(Arc::clone(&conn), ctx.options.heartbeat, true));
    tokio::spawn(read_control(Arc::clone(&conn), reader, heartbeat, false));
    if conn.role().data_stream_policy() == DataStreamPolicy::ClientOpens {
        tokio::spawn(accept_data_streams(Arc::clone(&ctx), Arc::clone(&conn)));
    }

    let cancel = conn.cancel_token().clone();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(LifecycleEvent::Closed { .. }) | None => break,
            Some(event) => debug!(connection = id, ?event, "Lifecycle event"),
        }
    }

    ctx.registry.remove(id);
    conn.close("session ended");
}

async fn read_handshake(
    ctx: &SessionContext,
    session: &Arc<dyn Session>,
    state: &StateMachine,
) -> Option<(FrameReader, FrameWriter, HandshakeFrame)> {
    let peer = session.remote_addr();
    let wait = ctx.options.handshake_timeout;

    let control = match timeout(wait, session.accept_stream()).await {
        Ok(Ok(Some(stream))) => stream,
        Ok(Ok(None)) => {
            debug!(peer = %peer, "Session closed before opening a control stream");
            return None;
        }
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "Failed to accept control stream");
            return None;
        }
        Err(_) => {
            warn!(peer = %peer, timeout = ?wait, "No control stream opened");
            return None;
        }
    };
    let (mut reader, writer) = control.framed();
    state.transition(ConnectionState::Authenticating);

    let frame = match timeout(wait, reader.next()).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(Some(Err(e))) => {
            warn!(peer = %peer, error = %e, "Malformed handshake");
            return None;
        }
        Ok(None) => {
            debug!(peer = %peer, "Control stream closed before handshake");
            return None;
        }
        Err(_) => {
            warn!(peer = %peer, timeout = ?wait, "Handshake timed out");
            return None;
        }
    };
    match HandshakeFrame::from_frame(&frame) {
        Ok(handshake) => Some((reader, writer, handshake)),
        Err(e) => {
            warn!(peer = %peer, frame_type = %frame.frame_type(), error = %e, "Expected a handshake");
            None
        }
    }
}

async fn reject(ctx: &SessionContext, session: Arc<dyn Session>, mut writer: FrameWriter, reason: String) {
    match RejectedFrame::new(reason).to_frame() {
        Ok(frame) => {
            if let Err(e) = writer.send(frame).await {
                debug!(peer = %session.remote_addr(), error = %e, "Failed to send Rejected");
            }
        }
        Err(e) => debug!(error = %e, "Failed to encode Rejected"),
    }
    // Let the client read the rejection and hang up first.
    let _ = timeout(ctx.options.reject_linger, session.closed()).await;
    session.close("handshake rejected");
}

/// Accept the data streams a client opens: `Init` in, `Ack` out, then read data.
async fn accept_data_streams(ctx: Arc<SessionContext>, conn: Arc<Connection>) {
    let cancel = conn.cancel_token().clone();
    let id = conn.id();
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = conn.session().accept_stream() => accepted,
        };
        let stream = match accepted {
            Ok(Some(stream)) => stream,
            Ok(None) => break,
            Err(e) => {
                debug!(connection = id, error = %e, "Stopped accepting data streams");
                break;
            }
        };
        let (mut reader, mut writer) = stream.framed();

        let init = match timeout(ctx.options.ack_timeout, reader.next()).await {
            Ok(Some(Ok(frame))) => InitFrame::from_frame(&frame).map_err(|e| e.to_string()),
            Ok(Some(Err(e))) => Err(e.to_string()),
            Ok(None) => Err("stream closed before Init".to_string()),
            Err(_) => Err("timed out waiting for Init".to_string()),
        };
        match init {
            Ok(init) if init.connection_id == id => {}
            Ok(init) => {
                warn!(connection = id, claimed = init.connection_id, "Init for another connection");
                conn.close("protocol error");
                break;
            }
            Err(reason) => {
                warn!(connection = id, name = %conn.name(), reason = %reason, "Bad data stream");
                conn.close("protocol error");
                break;
            }
        }

        let acked = match AckFrame::new(id).to_frame() {
            Ok(frame) => writer.send(frame).await.map_err(crate::MeshError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = acked {
            debug!(connection = id, error = %e, "Failed to ack data stream");
            conn.close("data stream failed");
            break;
        }
        *conn.data_slot().lock().await = Some(writer);
        if conn.state().current() == ConnectionState::Ready {
            conn.state().transition(ConnectionState::TransportingData);
        }

        let target = if conn.role() == Role::ZipperSender { ctx.relay.clone() } else { ctx.ingress.clone() };
        debug!(connection = id, name = %conn.name(), "Data stream attached");
        tokio::spawn(read_data_from_source(Arc::clone(&conn), reader, target));
    }
}
