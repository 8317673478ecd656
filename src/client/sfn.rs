//! Clients the zipper opens data streams to: stream functions and output
//! connectors.
//!
//! Inbound frames go through a [`DropOldestQueue`] so a slow handler never
//! holds up the stream reader; when the queue fills the oldest frames go.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::role::RoleBehavior;
use super::{Client, ClientOptions};
use crate::Result;
use crate::buffer::DropOldestQueue;
use crate::connection::{Connection, ConnectionState, Role};
use crate::frame::{AckFrame, CreateStreamFrame, DataFrame, FrameReader, FrameType, FrameWriter, Tag, TypedFrame};
use crate::transport::Dialer;

/// Processing step of a stream function.
///
/// Gets the tag and carriage of each observed frame and returns the tag and
/// carriage of the result. `None` or an empty carriage emits nothing.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, tag: Tag, carriage: &[u8]) -> Option<(Tag, Bytes)>;
}

impl<F> Handler for F
where
    F: Fn(Tag, &[u8]) -> Option<(Tag, Bytes)> + Send + Sync + 'static,
{
    fn handle(&self, tag: Tag, carriage: &[u8]) -> Option<(Tag, Bytes)> {
        self(tag, carriage)
    }
}

/// Callback of an output connector.
pub type Sink = Arc<dyn Fn(&DataFrame) + Send + Sync>;

#[derive(Clone)]
enum Consumer {
    Function(Arc<dyn Handler>),
    Connector(Sink),
}

/// Accepts the streams the zipper opens: `CreateStream` in, `Ack` out.
pub struct Responder {
    role: Role,
    tags: Vec<Tag>,
    consumer: Consumer,
}

impl Responder {
    pub fn function(tags: impl IntoIterator<Item = Tag>, handler: impl Handler) -> Self {
        Self {
            role: Role::StreamFunction,
            tags: tags.into_iter().collect(),
            consumer: Consumer::Function(Arc::new(handler)),
        }
    }

    pub fn connector(tags: impl IntoIterator<Item = Tag>, sink: impl Fn(&DataFrame) + Send + Sync + 'static) -> Self {
        Self {
            role: Role::OutputConnector,
            tags: tags.into_iter().collect(),
            consumer: Consumer::Connector(Arc::new(sink)),
        }
    }
}

#[async_trait]
impl RoleBehavior for Responder {
    fn role(&self) -> Role {
        self.role
    }

    fn observed_tags(&self) -> Vec<Tag> {
        self.tags.clone()
    }

    async fn on_accepted(&self, conn: &Arc<Connection>, options: &ClientOptions) -> Result<()> {
        tokio::spawn(accept_streams(
            Arc::clone(conn),
            self.consumer.clone(),
            options.ack_timeout,
            options.buffer_size,
        ));
        Ok(())
    }
}

async fn accept_streams(conn: Arc<Connection>, consumer: Consumer, ack_timeout: Duration, buffer_size: usize) {
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

        let create = match timeout(ack_timeout, reader.next()).await {
            Ok(Some(Ok(frame))) => CreateStreamFrame::from_frame(&frame).map_err(|e| e.to_string()),
            Ok(Some(Err(e))) => Err(e.to_string()),
            Ok(None) => Err("stream closed before CreateStream".to_string()),
            Err(_) => Err("timed out waiting for CreateStream".to_string()),
        };
        match create {
            Ok(create) if create.connection_id == id => {}
            Ok(create) => {
                warn!(connection = id, claimed = create.connection_id, "CreateStream for another connection");
                continue;
            }
            Err(reason) => {
                warn!(connection = id, reason = %reason, "Bad data stream from zipper");
                continue;
            }
        }
        let acked = match AckFrame::new(id).to_frame() {
            Ok(frame) => writer.send(frame).await.map_err(crate::MeshError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = acked {
            debug!(connection = id, error = %e, "Failed to ack data stream");
            continue;
        }
        debug!(connection = id, name = %conn.name(), "Data stream open");
        tokio::spawn(serve_stream(Arc::clone(&conn), reader, writer, consumer.clone(), buffer_size));
    }
}

async fn serve_stream(
    conn: Arc<Connection>,
    mut reader: FrameReader,
    writer: FrameWriter,
    consumer: Consumer,
    buffer_size: usize,
) {
    let queue = Arc::new(DropOldestQueue::new(buffer_size));
    let worker = tokio::spawn(consume(Arc::clone(&conn), Arc::clone(&queue), writer, consumer));
    let cancel = conn.cancel_token().clone();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = reader.next() => next,
        };
        match next {
            Some(Ok(frame)) if frame.frame_type() == FrameType::Payload => match DataFrame::from_frame(&frame) {
                Ok(data) => {
                    queue.push(data);
                }
                Err(e) => warn!(connection = conn.id(), error = %e, "Dropping unreadable frame"),
            },
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

    queue.close();
    if let Err(e) = worker.await {
        warn!(connection = conn.id(), error = %e, "Handler task failed");
    }
}

async fn consume(conn: Arc<Connection>, queue: Arc<DropOldestQueue<DataFrame>>, mut writer: FrameWriter, consumer: Consumer) {
    while let Some(data) = queue.pop().await {
        match &consumer {
            Consumer::Connector(sink) => sink(&data),
            Consumer::Function(handler) => {
                let Some((tag, carriage)) = handler.handle(data.tag, &data.carriage) else {
                    trace!(connection = conn.id(), tag = data.tag, "Handler produced nothing");
                    continue;
                };
                if carriage.is_empty() {
                    trace!(connection = conn.id(), tag, "Handler produced an empty result");
                    continue;
                }
                let frame = match data.respond(tag, carriage).to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(connection = conn.id(), error = %e, "Dropping oversized result");
                        continue;
                    }
                };
                if let Err(e) = writer.send(frame).await {
                    debug!(connection = conn.id(), error = %e, "Failed to write result");
                    break;
                }
                if conn.state().current() == ConnectionState::Ready {
                    conn.state().transition(ConnectionState::TransportingData);
                }
            }
        }
    }
}

/// A workflow step: receives the frames it observes and writes back results.
///
/// ```rust,no_run
/// use bytes::Bytes;
/// use std::sync::Arc;
/// use zipmesh::client::{ClientOptions, StreamFunction};
/// use zipmesh::transport::mem::MemNetwork;
///
/// # async fn run(network: MemNetwork) -> zipmesh::Result<()> {
/// let echo = StreamFunction::new(
///     "echo",
///     "zipper-1",
///     Arc::new(network.dialer()),
///     ClientOptions::default(),
///     [0x10],
///     |_tag: u32, carriage: &[u8]| -> Option<(u32, Bytes)> { Some((0x20, Bytes::copy_from_slice(carriage))) },
/// );
/// echo.connect().await?;
/// # Ok(())
/// # }
/// ```
pub struct StreamFunction {
    client: Client,
}

impl StreamFunction {
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        dialer: Arc<dyn Dialer>,
        options: ClientOptions,
        tags: impl IntoIterator<Item = Tag>,
        handler: impl Handler,
    ) -> Self {
        let behavior = Arc::new(Responder::function(tags, handler));
        Self { client: Client::new(name, addr, dialer, options, behavior) }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn connect(&self) -> Result<()> {
        self.client.connect().await
    }

    pub async fn close(&self) {
        self.client.close().await
    }
}

/// Receives the final output of the workflow.
pub struct OutputConnector {
    client: Client,
}

impl OutputConnector {
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        dialer: Arc<dyn Dialer>,
        options: ClientOptions,
        tags: impl IntoIterator<Item = Tag>,
        sink: impl Fn(&DataFrame) + Send + Sync + 'static,
    ) -> Self {
        let behavior = Arc::new(Responder::connector(tags, sink));
        Self { client: Client::new(name, addr, dialer, options, behavior) }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn connect(&self) -> Result<()> {
        self.client.connect().await
    }

    pub async fn close(&self) {
        self.client.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{connection_pair, info};
    use crate::frame::Frame;

    fn upper(tag: Tag, carriage: &[u8]) -> Option<(Tag, Bytes)> {
        (tag == 0x10).then(|| (0x20, Bytes::from(carriage.to_ascii_uppercase())))
    }

    async fn zipper_side(remote: &crate::transport::mem::MemSession, id: u64) -> (FrameReader, FrameWriter) {
        use crate::transport::Session;
        let (mut reader, mut writer) = remote.open_stream().await.unwrap().framed();
        writer.send(CreateStreamFrame::new(id).to_frame().unwrap()).await.unwrap();
        let ack = AckFrame::from_frame(&reader.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(ack.connection_id, id);
        (reader, writer)
    }

    fn data(tag: Tag, carriage: &'static [u8]) -> Frame {
        DataFrame::new("tx-9", "3", tag, carriage).to_frame().unwrap()
    }

    #[tokio::test]
    async fn function_answers_in_the_same_transaction() {
        let (conn, remote, _events) = connection_pair(info(21, "upper", Role::StreamFunction)).await;
        let behavior = Responder::function([0x10], upper);
        assert_eq!(behavior.observed_tags(), vec![0x10]);
        behavior.on_accepted(&conn, &ClientOptions::default()).await.unwrap();

        let (mut reader, mut writer) = zipper_side(&remote, 21).await;
        writer.send(data(0x11, b"skip")).await.unwrap();
        writer.send(data(0x10, b"ping")).await.unwrap();

        let reply = DataFrame::from_frame(&reader.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply.tag, 0x20);
        assert_eq!(&reply.carriage[..], b"PING");
        assert_eq!(reply.transaction_id, "tx-9");
        assert_eq!(reply.source_id, "3");
        assert_eq!(conn.state().current(), ConnectionState::TransportingData);
    }

    #[tokio::test]
    async fn empty_results_are_not_written_back() {
        let (conn, remote, _events) = connection_pair(info(24, "filter", Role::StreamFunction)).await;
        let filter = |_tag: Tag, carriage: &[u8]| -> Option<(Tag, Bytes)> {
            match carriage {
                b"empty" => Some((0x20, Bytes::new())),
                _ => Some((0x21, Bytes::from_static(b"marker"))),
            }
        };
        Responder::function([], filter).on_accepted(&conn, &ClientOptions::default()).await.unwrap();

        let (mut reader, mut writer) = zipper_side(&remote, 24).await;
        writer.send(data(0x10, b"empty")).await.unwrap();
        writer.send(data(0x10, b"other")).await.unwrap();

        let reply = DataFrame::from_frame(&reader.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply.tag, 0x21);
        assert_eq!(&reply.carriage[..], b"marker");
    }

    #[tokio::test]
    async fn connector_sees_every_frame() {
        let (conn, remote, _events) = connection_pair(info(22, "sink", Role::OutputConnector)).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let behavior = Responder::connector([], move |data: &DataFrame| {
            let _ = tx.send(data.clone());
        });
        assert_eq!(behavior.role(), Role::OutputConnector);
        behavior.on_accepted(&conn, &ClientOptions::default()).await.unwrap();

        let (_reader, mut writer) = zipper_side(&remote, 22).await;
        writer.send(data(0x20, b"one")).await.unwrap();
        writer.send(data(0x21, b"two")).await.unwrap();
        assert_eq!(&rx.recv().await.unwrap().carriage[..], b"one");
        assert_eq!(&rx.recv().await.unwrap().carriage[..], b"two");
    }

    #[tokio::test]
    async fn stream_for_another_connection_is_not_acked() {
        let (conn, remote, _events) = connection_pair(info(23, "upper", Role::StreamFunction)).await;
        Responder::function([], upper).on_accepted(&conn, &ClientOptions::default()).await.unwrap();

        use crate::transport::Session;
        let (mut reader, mut writer) = remote.open_stream().await.unwrap().framed();
        writer.send(CreateStreamFrame::new(99).to_frame().unwrap()).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_millis(100), reader.next()).await;
        assert!(matches!(outcome, Err(_) | Ok(None)));
    }
}
