//! Clients that open their own data stream: sources, upstream zippers and
//! zipper senders.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::role::RoleBehavior;
use super::{Client, ClientOptions};
use crate::connection::{Connection, Role};
use crate::frame::{AckFrame, DataFrame, Frame, FrameReader, FrameType, InitFrame, Tag, TypedFrame};
use crate::server::{Downstream, DownstreamKind};
use crate::transport::Dialer;
use crate::{MeshError, Result};

/// Callback for frames the zipper sends back to a source.
pub type BackflowHandler = Arc<dyn Fn(DataFrame) + Send + Sync>;

/// Opens a data stream after the handshake: `Init` out, `Ack` in.
pub struct Originator {
    role: Role,
    backflow: Option<BackflowHandler>,
}

impl Originator {
    pub fn new(role: Role) -> Self {
        Self { role, backflow: None }
    }

    pub fn with_backflow(mut self, handler: impl Fn(DataFrame) + Send + Sync + 'static) -> Self {
        self.backflow = Some(Arc::new(handler));
        self
    }
}

#[async_trait]
impl RoleBehavior for Originator {
    fn role(&self) -> Role {
        self.role
    }

    async fn on_accepted(&self, conn: &Arc<Connection>, options: &ClientOptions) -> Result<()> {
        let id = conn.id();
        let (mut reader, mut writer) = conn.session().open_stream().await?.framed();
        writer.send(InitFrame::new(id).to_frame()?).await?;

        let reply = timeout(options.ack_timeout, reader.next())
            .await
            .map_err(|_| MeshError::timeout(options.ack_timeout, "waiting for data stream ack"))?;
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

        *conn.data_slot().lock().await = Some(writer);
        tokio::spawn(read_backflow(Arc::clone(conn), reader, self.backflow.clone()));
        Ok(())
    }
}

async fn read_backflow(conn: Arc<Connection>, mut reader: FrameReader, handler: Option<BackflowHandler>) {
    let cancel = conn.cancel_token().clone();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = reader.next() => next,
        };
        match next {
            Some(Ok(frame)) if frame.frame_type() == FrameType::Payload => {
                let Some(handler) = &handler else {
                    continue;
                };
                match DataFrame::from_frame(&frame) {
                    Ok(data) => handler(data),
                    Err(e) => warn!(connection = conn.id(), error = %e, "Dropping unreadable backflow"),
                }
            }
            Some(Ok(frame)) => {
                debug!(connection = conn.id(), frame_type = %frame.frame_type(), "Ignoring frame on data stream");
            }
            Some(Err(e)) => {
                debug!(connection = conn.id(), error = %e, "Data stream failed");
                break;
            }
            None => break,
        }
    }
}

/// Feeds data into a workflow.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use zipmesh::client::{ClientOptions, Source};
/// use zipmesh::transport::mem::MemNetwork;
///
/// # async fn run(network: MemNetwork) -> zipmesh::Result<()> {
/// let source = Source::new("camera", "zipper-1", Arc::new(network.dialer()), ClientOptions::default());
/// source.connect().await?;
/// source.write(0x10, &b"frame-0001"[..]).await?;
/// # Ok(())
/// # }
/// ```
pub struct Source {
    client: Client,
}

impl Source {
    pub fn new(name: impl Into<String>, addr: impl Into<String>, dialer: Arc<dyn Dialer>, options: ClientOptions) -> Self {
        Self::from_behavior(name, addr, dialer, options, Originator::new(Role::Source))
    }

    /// A source that also receives the workflow's results for its own data.
    pub fn with_backflow(
        name: impl Into<String>,
        addr: impl Into<String>,
        dialer: Arc<dyn Dialer>,
        options: ClientOptions,
        handler: impl Fn(DataFrame) + Send + Sync + 'static,
    ) -> Self {
        let behavior = Originator::new(Role::Source).with_backflow(handler);
        Self::from_behavior(name, addr, dialer, options, behavior)
    }

    /// A zipper feeding its own output into another zipper's workflow.
    pub fn upstream_zipper(
        name: impl Into<String>,
        addr: impl Into<String>,
        dialer: Arc<dyn Dialer>,
        options: ClientOptions,
    ) -> Self {
        Self::from_behavior(name, addr, dialer, options, Originator::new(Role::UpstreamZipper))
    }

    fn from_behavior(
        name: impl Into<String>,
        addr: impl Into<String>,
        dialer: Arc<dyn Dialer>,
        options: ClientOptions,
        behavior: Originator,
    ) -> Self {
        Self { client: Client::new(name, addr, dialer, options, Arc::new(behavior)) }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn connect(&self) -> Result<()> {
        self.client.connect().await
    }

    pub async fn write(&self, tag: Tag, carriage: impl Into<Bytes>) -> Result<()> {
        self.client.write(tag, carriage).await
    }

    pub async fn close(&self) {
        self.client.close().await
    }
}

/// Cascades a zipper's output to another zipper of the mesh.
///
/// Frames are forwarded as they are, keeping their transaction and source.
pub struct ZipperSender {
    client: Client,
}

impl ZipperSender {
    /// `name` is the local zipper's name; `addr` the zipper to send to.
    pub fn new(name: &str, addr: impl Into<String>, dialer: Arc<dyn Dialer>, options: ClientOptions) -> Self {
        let behavior = Arc::new(Originator::new(Role::ZipperSender));
        Self { client: Client::new(name, addr, dialer, options, behavior) }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Downstream for ZipperSender {
    fn name(&self) -> &str {
        self.client.addr()
    }

    fn kind(&self) -> DownstreamKind {
        DownstreamKind::Zipper
    }

    async fn deliver(&self, frame: Frame) -> Result<()> {
        self.client.send_frame(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;
    use crate::server::Server;
    use crate::transport::mem::MemNetwork;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn backflow_reaches_the_originating_source() {
        let network = MemNetwork::new();
        // No stages: every frame goes straight to broadcast.
        let config = WorkflowConfig::new("zipper", "127.0.0.1", 9000);
        let server = Arc::new(Server::new(&config));
        let listener = network.listen("zipper");
        {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await });
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let source = Source::with_backflow("camera", "zipper", Arc::new(network.dialer()), ClientOptions::default(), move |data| {
            let _ = tx.send(data);
        });
        let quiet = Arc::new(Mutex::new(Vec::new()));
        let other = Source::with_backflow("radar", "zipper", Arc::new(network.dialer()), ClientOptions::default(), {
            let quiet = Arc::clone(&quiet);
            move |data| quiet.lock().unwrap().push(data)
        });
        source.connect().await.unwrap();
        other.connect().await.unwrap();

        source.write(0x10, &b"ping"[..]).await.unwrap();
        let back = rx.recv().await.unwrap();
        assert_eq!(back.tag, 0x10);
        assert_eq!(&back.carriage[..], b"ping");
        assert_eq!(back.source_id, source.client().connection_id().await.unwrap().to_string());
        assert!(quiet.lock().unwrap().is_empty());

        source.close().await;
        other.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn unconnected_sender_fails_delivery() {
        let network = MemNetwork::new();
        let sender = ZipperSender::new("zipper-1", "zipper-2", Arc::new(network.dialer()), ClientOptions::default());
        let frame = DataFrame::new("tx", "1", 1, Bytes::new()).to_frame().unwrap();
        assert!(matches!(sender.deliver(frame).await, Err(MeshError::Closed)));
        assert_eq!(sender.kind(), DownstreamKind::Zipper);
        assert_eq!(Downstream::name(&sender), "zipper-2");
    }
}
