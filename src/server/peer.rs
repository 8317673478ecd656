//! The zipper's side of an accepted connection.
//!
//! For roles the zipper sends data to (stream functions and output
//! connectors) frames go through a bounded queue drained by a writer task.
//! On the first frame the task opens a stream, writes `CreateStream`, and
//! waits for the peer's `Ack`; a reader task then forwards whatever the peer
//! writes back to the pipeline. Callers never wait on the peer: a full queue
//! is reported as an error right away.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use super::registry::{Downstream, DownstreamKind, Replica};
use crate::connection::{Connection, Role};
use crate::frame::{AckFrame, CreateStreamFrame, Frame, FrameReader, FrameType, Tag, TypedFrame};
use crate::{MeshError, Result};

/// An accepted connection as the zipper uses it.
pub struct ServerPeer {
    conn: Arc<Connection>,
    ack_timeout: Duration,
    queue_capacity: usize,
    outbound: OnceLock<mpsc::Sender<Frame>>,
}

impl ServerPeer {
    pub fn new(conn: Arc<Connection>, ack_timeout: Duration, queue_capacity: usize) -> Self {
        Self { conn, ack_timeout, queue_capacity: queue_capacity.max(1), outbound: OnceLock::new() }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Queue `frame` for the data stream, starting the writer task if needed.
    ///
    /// Frames the peer writes back are forwarded to `responses`, or discarded
    /// when there is none. Only the first call's `responses` is kept.
    fn enqueue(&self, frame: Frame, responses: Option<&mpsc::Sender<Frame>>) -> Result<()> {
        if self.conn.is_closed() {
            return Err(MeshError::Closed);
        }
        let outbound = self.outbound.get_or_init(|| {
            let (tx, rx) = mpsc::channel(self.queue_capacity);
            tokio::spawn(write_data(Arc::clone(&self.conn), rx, responses.cloned(), self.ack_timeout));
            tx
        });
        match outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(MeshError::transport(format!(
                "outbound queue of connection {} is full",
                self.conn.id()
            ))),
            Err(TrySendError::Closed(_)) => Err(MeshError::Closed),
        }
    }

    /// Send a frame back to a source on the data stream it opened.
    pub async fn backflow(&self, frame: Frame) -> Result<()> {
        self.conn.send_data(frame).await
    }
}

/// Drains a peer's outbound queue onto its data stream.
///
/// Failing to open the stream or to write closes the connection, which
/// removes the peer from the registry.
async fn write_data(
    conn: Arc<Connection>,
    mut queue: mpsc::Receiver<Frame>,
    responses: Option<mpsc::Sender<Frame>>,
    ack_timeout: Duration,
) {
    let cancel = conn.cancel_token().clone();
    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = open_data_stream(&conn, ack_timeout, responses) => opened,
    };
    if let Err(e) = opened {
        warn!(connection = conn.id(), name = %conn.name(), error = %e, "Failed to open data stream");
        conn.close("data stream failed");
        return;
    }

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = conn.send_data(frame) => sent,
        };
        if let Err(e) = sent {
            debug!(connection = conn.id(), error = %e, "Data stream write failed");
            conn.close("data stream failed");
            break;
        }
    }
}

async fn open_data_stream(conn: &Arc<Connection>, ack_timeout: Duration, responses: Option<mpsc::Sender<Frame>>) -> Result<()> {
    let id = conn.id();
    let (mut reader, mut writer) = conn.session().open_stream().await?.framed();
    writer.send(CreateStreamFrame::new(id).to_frame()?).await?;

    let reply = tokio::time::timeout(ack_timeout, reader.next())
        .await
        .map_err(|_| MeshError::timeout(ack_timeout, "waiting for data stream ack"))?;
    let ack = match reply {
        Some(frame) => AckFrame::from_frame(&frame?)?,
        None => return Err(MeshError::Closed),
    };
    if ack.connection_id != id {
        return Err(MeshError::transport(format!(
            "data stream ack for connection {} on connection {id}",
            ack.connection_id
        )));
    }
    debug!(connection = id, name = %conn.name(), "Data stream open");

    *conn.data_slot().lock().await = Some(writer);
    tokio::spawn(read_responses(Arc::clone(conn), reader, responses));
    Ok(())
}

async fn read_responses(conn: Arc<Connection>, mut reader: FrameReader, responses: Option<mpsc::Sender<Frame>>) {
    let cancel = conn.cancel_token().clone();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = reader.next() => next,
        };
        match next {
            Some(Ok(frame)) if frame.frame_type() == FrameType::Payload => match &responses {
                Some(responses) => {
                    if responses.send(frame).await.is_err() {
                        debug!(connection = conn.id(), "Pipeline gone, stopping response reader");
                        break;
                    }
                }
                None => trace!(connection = conn.id(), "Discarding data from output connector"),
            },
            Some(Ok(frame)) => {
                debug!(connection = conn.id(), frame_type = %frame.frame_type(), "Ignoring frame on data stream");
            }
            Some(Err(e)) => {
                warn!(connection = conn.id(), name = %conn.name(), error = %e, "Malformed response frame");
                conn.close("protocol error");
                break;
            }
            None => {
                debug!(connection = conn.id(), "Data stream ended");
                break;
            }
        }
    }
}

#[async_trait]
impl Replica for ServerPeer {
    fn id(&self) -> u64 {
        self.conn.id()
    }

    fn observes(&self, tag: Tag) -> bool {
        self.conn.observes(tag)
    }

    async fn dispatch(&self, frame: Frame, responses: &mpsc::Sender<Frame>) -> Result<()> {
        self.enqueue(frame, Some(responses))
    }

    fn cancel(&self, reason: &str) {
        self.conn.close(reason);
    }
}

#[async_trait]
impl Downstream for ServerPeer {
    fn name(&self) -> &str {
        self.conn.name()
    }

    fn kind(&self) -> DownstreamKind {
        match self.conn.role() {
            Role::UpstreamZipper | Role::ZipperSender => DownstreamKind::Zipper,
            _ => DownstreamKind::Connector,
        }
    }

    async fn deliver(&self, frame: Frame) -> Result<()> {
        if !self.conn.observes(crate::frame::DataFrame::peek_tag(&frame)?) {
            return Ok(());
        }
        self.enqueue(frame, None)
    }
}

impl std::fmt::Debug for ServerPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPeer").field("conn", &self.conn).finish()
    }
}
