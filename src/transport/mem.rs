//! In-process transport.
//!
//! Sessions are pairs of channels exchanging `tokio::io::duplex` pipes. Closing
//! either side fails every pending read and write on every stream of the
//! session, which is what a QUIC connection close does.

use dashmap::DashMap;
use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

use super::{BiStream, Dialer, Listener, Session};
use crate::{MeshError, Result};

const PIPE_CAPACITY: usize = 64 * 1024;
const ACCEPT_BACKLOG: usize = 64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A registry of in-process listeners, addressed by name.
#[derive(Clone, Default)]
pub struct MemNetwork {
    listeners: Arc<DashMap<String, mpsc::Sender<Arc<dyn Session>>>>,
    next_port: Arc<AtomicU16>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a listener to `addr`. Rebinding replaces the previous listener.
    pub fn listen(&self, addr: impl Into<String>) -> MemListener {
        let addr = addr.into();
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        self.listeners.insert(addr.clone(), tx);
        let port = 10_000 + self.next_port.fetch_add(1, Ordering::Relaxed);
        MemListener { addr, port, incoming: rx, network: self.clone() }
    }

    pub fn dialer(&self) -> MemDialer {
        MemDialer { network: self.clone() }
    }
}

/// Listener half of [`MemNetwork`].
pub struct MemListener {
    addr: String,
    port: u16,
    incoming: mpsc::Receiver<Arc<dyn Session>>,
    network: MemNetwork,
}

impl MemListener {
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Drop for MemListener {
    fn drop(&mut self) {
        self.network.listeners.remove(&self.addr);
    }
}

#[async_trait::async_trait]
impl Listener for MemListener {
    async fn accept(&mut self) -> Result<Option<Arc<dyn Session>>> {
        Ok(self.incoming.recv().await)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, self.port)))
    }
}

/// Dialer half of [`MemNetwork`].
#[derive(Clone)]
pub struct MemDialer {
    network: MemNetwork,
}

#[async_trait::async_trait]
impl Dialer for MemDialer {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn Session>> {
        let listener = self
            .network
            .listeners
            .get(addr)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MeshError::connection_failed(addr, "no listener bound"))?;

        let (client, server) = MemSession::pair(addr);
        listener
            .send(Arc::new(server))
            .await
            .map_err(|_| MeshError::connection_failed(addr, "listener closed"))?;
        Ok(Arc::new(client))
    }
}

/// One side of an in-process session.
pub struct MemSession {
    id: u64,
    peer: String,
    outgoing: mpsc::UnboundedSender<BiStream>,
    incoming: Mutex<mpsc::UnboundedReceiver<BiStream>>,
    closed: CancellationToken,
}

impl MemSession {
    /// A connected pair of sessions sharing one close signal.
    pub fn pair(label: &str) -> (MemSession, MemSession) {
        let closed = CancellationToken::new();
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = MemSession {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer: format!("{label}#server"),
            outgoing: b_tx,
            incoming: Mutex::new(a_rx),
            closed: closed.clone(),
        };
        let b = MemSession {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer: format!("{label}#client-{}", a.id),
            outgoing: a_tx,
            incoming: Mutex::new(b_rx),
            closed,
        };
        (a, b)
    }

    fn guarded_stream(&self, stream: tokio::io::DuplexStream) -> BiStream {
        let (reader, writer) = tokio::io::split(stream);
        BiStream::new(
            Guarded::new(reader, self.closed.clone()),
            Guarded::new(writer, self.closed.clone()),
        )
    }
}

#[async_trait::async_trait]
impl Session for MemSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn remote_addr(&self) -> String {
        self.peer.clone()
    }

    async fn open_stream(&self) -> Result<BiStream> {
        if self.closed.is_cancelled() {
            return Err(MeshError::Closed);
        }
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        self.outgoing.send(self.guarded_stream(remote)).map_err(|_| MeshError::Closed)?;
        Ok(self.guarded_stream(local))
    }

    async fn accept_stream(&self) -> Result<Option<BiStream>> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            stream = incoming.recv() => Ok(stream),
        }
    }

    fn close(&self, reason: &str) {
        if !self.closed.is_cancelled() {
            debug!(session = self.id, reason, "Closing in-memory session");
            self.closed.cancel();
        }
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }
}

pin_project! {
    /// Stream half that fails once its session is closed.
    struct Guarded<T> {
        #[pin]
        inner: T,
        token: CancellationToken,
        closed: Pin<Box<WaitForCancellationFutureOwned>>,
    }
}

impl<T> Guarded<T> {
    fn new(inner: T, token: CancellationToken) -> Self {
        let closed = Box::pin(token.clone().cancelled_owned());
        Self { inner, token, closed }
    }
}

fn poll_closed(
    token: &CancellationToken,
    closed: &mut Pin<Box<WaitForCancellationFutureOwned>>,
    cx: &mut Context<'_>,
) -> bool {
    token.is_cancelled() || closed.as_mut().poll(cx).is_ready()
}

fn session_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "session closed")
}

impl<T: AsyncRead> AsyncRead for Guarded<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if poll_closed(this.token, this.closed, cx) {
            return Poll::Ready(Err(session_closed()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<T: AsyncWrite> AsyncWrite for Guarded<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        if poll_closed(this.token, this.closed, cx) {
            return Poll::Ready(Err(session_closed()));
        }
        this.inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        if poll_closed(this.token, this.closed, cx) {
            return Poll::Ready(Err(session_closed()));
        }
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
