//! QUIC transport on `quinn`.
//!
//! The zipper serves a self-signed certificate unless one is configured.
//! [`QuicDialer::trusting`] verifies the zipper against the given trust
//! anchors; [`QuicDialer::new`] accepts any certificate and is meant for
//! trusted networks and tests.
//!
//! The listener completes every handshake on its own task, so a peer that
//! stalls mid-handshake holds up nobody but itself.

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{Endpoint, IdleTimeout, TransportConfig, VarInt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BiStream, Dialer, Listener, Session};
use crate::{MeshError, Result};

/// ALPN protocol id spoken by zipmesh peers.
pub const ALPN: &[u8] = b"zipmesh/1";

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const KEEP_ALIVE: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKLOG: usize = 64;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn transport_config() -> Result<Arc<TransportConfig>> {
    let idle = IdleTimeout::try_from(IDLE_TIMEOUT)
        .map_err(|e| MeshError::transport_with_source("invalid idle timeout", e))?;
    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(idle)).keep_alive_interval(Some(KEEP_ALIVE));
    Ok(Arc::new(transport))
}

/// Certificate and key presented by the zipper.
pub struct ServerIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl ServerIdentity {
    /// A fresh self-signed certificate for `localhost` and `127.0.0.1`.
    pub fn self_signed() -> Result<Self> {
        let names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        let certified = rcgen::generate_simple_self_signed(names)
            .map_err(|e| MeshError::transport_with_source("failed to generate certificate", e))?;
        let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
        Ok(Self { cert_chain: vec![certified.cert.der().clone()], key: key.into() })
    }

    /// Load a DER certificate and a PKCS#8 DER key from disk.
    pub fn from_der_files(cert: &Path, key: &Path) -> Result<Self> {
        let key_bytes = std::fs::read(key).map_err(|e| MeshError::file_error(key.to_path_buf(), e))?;
        Ok(Self { cert_chain: vec![load_certificate(cert)?], key: PrivatePkcs8KeyDer::from(key_bytes).into() })
    }
}

/// Read one DER certificate from disk.
pub fn load_certificate(path: &Path) -> Result<CertificateDer<'static>> {
    let bytes = std::fs::read(path).map_err(|e| MeshError::file_error(path.to_path_buf(), e))?;
    Ok(CertificateDer::from(bytes))
}

fn server_config(identity: ServerIdentity) -> Result<quinn::ServerConfig> {
    let mut tls = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| MeshError::transport_with_source("unsupported TLS configuration", e))?
        .with_no_client_auth()
        .with_single_cert(identity.cert_chain, identity.key)
        .map_err(|e| MeshError::transport_with_source("invalid server certificate", e))?;
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = QuicServerConfig::try_from(tls)
        .map_err(|e| MeshError::transport_with_source("no initial cipher suite", e))?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(transport_config()?);
    Ok(config)
}

/// Client TLS settings. Without `roots` any server certificate is accepted.
fn client_config(roots: Option<RootCertStore>) -> Result<quinn::ClientConfig> {
    let provider = provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| MeshError::transport_with_source("unsupported TLS configuration", e))?;
    let mut tls = match roots {
        Some(roots) => builder.with_root_certificates(roots).with_no_client_auth(),
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
            .with_no_client_auth(),
    };
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = QuicClientConfig::try_from(tls)
        .map_err(|e| MeshError::transport_with_source("no initial cipher suite", e))?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(transport_config()?);
    Ok(config)
}

#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// A QUIC connection.
pub struct QuicSession {
    connection: quinn::Connection,
}

impl QuicSession {
    pub fn new(connection: quinn::Connection) -> Self {
        Self { connection }
    }
}

#[async_trait::async_trait]
impl Session for QuicSession {
    fn id(&self) -> u64 {
        self.connection.stable_id() as u64
    }

    fn remote_addr(&self) -> String {
        self.connection.remote_address().to_string()
    }

    async fn open_stream(&self) -> Result<BiStream> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| MeshError::transport_with_source("failed to open stream", e))?;
        Ok(BiStream::new(recv, send))
    }

    async fn accept_stream(&self) -> Result<Option<BiStream>> {
        match self.connection.accept_bi().await {
            Ok((send, recv)) => Ok(Some(BiStream::new(recv, send))),
            Err(
                quinn::ConnectionError::ApplicationClosed(_)
                | quinn::ConnectionError::LocallyClosed
                | quinn::ConnectionError::ConnectionClosed(_)
                | quinn::ConnectionError::TimedOut,
            ) => Ok(None),
            Err(e) => Err(MeshError::transport_with_source("failed to accept stream", e)),
        }
    }

    fn close(&self, reason: &str) {
        debug!(peer = %self.connection.remote_address(), reason, "Closing QUIC connection");
        self.connection.close(VarInt::from_u32(0), reason.as_bytes());
    }

    async fn closed(&self) {
        let _ = self.connection.closed().await;
    }
}

/// Accepts QUIC connections for the zipper.
pub struct QuicListener {
    endpoint: Endpoint,
    sessions: mpsc::Receiver<Arc<dyn Session>>,
    cancel: CancellationToken,
}

impl QuicListener {
    /// Bind a UDP socket on `addr` and serve `identity`. Must be called
    /// inside a tokio runtime.
    pub fn bind(addr: SocketAddr, identity: ServerIdentity) -> Result<Self> {
        let endpoint = Endpoint::server(server_config(identity)?, addr)
            .map_err(|e| MeshError::transport_with_source(format!("failed to bind {addr}"), e))?;
        let (tx, sessions) = mpsc::channel(ACCEPT_BACKLOG);
        let cancel = CancellationToken::new();
        tokio::spawn(accept_incoming(endpoint.clone(), tx, cancel.clone()));
        info!(%addr, "QUIC listener bound");
        Ok(Self { endpoint, sessions, cancel })
    }
}

impl Drop for QuicListener {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.endpoint.close(VarInt::from_u32(0), b"zipper shutting down");
    }
}

/// Hand every incoming connection to its own handshake task.
async fn accept_incoming(endpoint: Endpoint, sessions: mpsc::Sender<Arc<dyn Session>>, cancel: CancellationToken) {
    loop {
        let incoming = tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };
        let remote = incoming.remote_address().to_string();
        let handshake = async move {
            let connection = incoming
                .await
                .map_err(|e| MeshError::transport_with_source("QUIC handshake failed", e))?;
            Ok(Arc::new(QuicSession::new(connection)) as Arc<dyn Session>)
        };
        spawn_handshake(remote, handshake, HANDSHAKE_TIMEOUT, sessions.clone());
    }
    debug!("QUIC accept loop ended");
}

/// Finish one handshake within `limit` and queue the session for `accept`.
fn spawn_handshake<F>(
    remote: String,
    handshake: F,
    limit: Duration,
    sessions: mpsc::Sender<Arc<dyn Session>>,
) -> JoinHandle<()>
where
    F: Future<Output = Result<Arc<dyn Session>>> + Send + 'static,
{
    tokio::spawn(async move {
        match timeout(limit, handshake).await {
            Ok(Ok(session)) => {
                if sessions.send(session).await.is_err() {
                    debug!(%remote, "Listener closed before the session was accepted");
                }
            }
            Ok(Err(e)) => debug!(%remote, error = %e, "QUIC handshake failed"),
            Err(_) => warn!(%remote, timeout = ?limit, "QUIC handshake timed out"),
        }
    })
}

#[async_trait::async_trait]
impl Listener for QuicListener {
    async fn accept(&mut self) -> Result<Option<Arc<dyn Session>>> {
        Ok(self.sessions.recv().await)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .map_err(|e| MeshError::transport_with_source("listener has no local address", e))
    }
}

/// Dials zipper endpoints over QUIC.
pub struct QuicDialer {
    endpoint: Endpoint,
}

impl QuicDialer {
    /// A dialer that accepts any zipper certificate.
    pub fn new() -> Result<Self> {
        Self::with_config(client_config(None)?)
    }

    /// A dialer that only connects to zippers whose certificate chains to
    /// one of `anchors` and names the dialed host.
    pub fn trusting(anchors: impl IntoIterator<Item = CertificateDer<'static>>) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for anchor in anchors {
            roots
                .add(anchor)
                .map_err(|e| MeshError::transport_with_source("invalid trust anchor", e))?;
        }
        Self::with_config(client_config(Some(roots))?)
    }

    fn with_config(config: quinn::ClientConfig) -> Result<Self> {
        let bind: SocketAddr = SocketAddr::from(([0, 0, 0, 0], 0));
        let mut endpoint = Endpoint::client(bind)
            .map_err(|e| MeshError::transport_with_source("failed to bind client socket", e))?;
        endpoint.set_default_client_config(config);
        Ok(Self { endpoint })
    }
}

/// Host part of `host:port`, as checked against the zipper certificate.
fn server_name(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

#[async_trait::async_trait]
impl Dialer for QuicDialer {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn Session>> {
        let remote = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| MeshError::connection_failed_with_source(addr, "address lookup failed", Box::new(e)))?
            .next()
            .ok_or_else(|| MeshError::connection_failed(addr, "address did not resolve"))?;
        let connecting = self
            .endpoint
            .connect(remote, server_name(addr))
            .map_err(|e| MeshError::connection_failed_with_source(addr, "invalid remote", Box::new(e)))?;
        let connection = connecting
            .await
            .map_err(|e| MeshError::connection_failed_with_source(addr, "QUIC handshake failed", Box::new(e)))?;
        debug!(%remote, "QUIC connection established");
        Ok(Arc::new(QuicSession::new(connection)))
    }
}
