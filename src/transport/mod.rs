//! Transport abstraction.
//!
//! A [`Session`] is one multiplexed connection between a client and the zipper
//! (a QUIC connection in production). Sessions carry any number of
//! bidirectional streams; the first stream a client opens is the control
//! stream, later ones are data streams.

pub mod mem;
#[cfg(feature = "quic")]
pub mod quic;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::Result;
use crate::frame::{FrameReader, FrameWriter, codec};

/// Boxed read half of a stream.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a stream.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A bidirectional byte stream inside a session.
pub struct BiStream {
    pub reader: BoxReader,
    pub writer: BoxWriter,
}

impl BiStream {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self { reader: Box::new(reader), writer: Box::new(writer) }
    }

    /// Split into a frame reader and a frame writer.
    pub fn framed(self) -> (FrameReader, FrameWriter) {
        codec::framed(self.reader, self.writer)
    }
}

impl std::fmt::Debug for BiStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BiStream").finish_non_exhaustive()
    }
}

/// One multiplexed connection.
#[async_trait::async_trait]
pub trait Session: Send + Sync + 'static {
    /// Process-unique id of this session.
    fn id(&self) -> u64;

    /// Address of the peer, for logging.
    fn remote_addr(&self) -> String;

    /// Open a new bidirectional stream toward the peer.
    async fn open_stream(&self) -> Result<BiStream>;

    /// Wait for the peer to open a stream.
    ///
    /// Returns `Ok(None)` once the session is closed.
    async fn accept_stream(&self) -> Result<Option<BiStream>>;

    /// Close the session and every stream in it. Idempotent.
    fn close(&self, reason: &str);

    /// Resolves once the session is closed by either side.
    async fn closed(&self);
}

/// Accepts sessions on the zipper side.
#[async_trait::async_trait]
pub trait Listener: Send + 'static {
    /// Wait for the next session. `Ok(None)` means the listener shut down.
    async fn accept(&mut self) -> Result<Option<Arc<dyn Session>>>;

    fn local_addr(&self) -> Result<SocketAddr>;
}

/// Opens sessions on the client side.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn Session>>;
}
