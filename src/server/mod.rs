//! The zipper.
//!
//! A [`Server`] accepts sessions from a [`Listener`], authenticates them,
//! keeps them in its [`Registry`] and runs the dispatcher pipeline over the
//! data its sources produce.
//!
//! ```rust,no_run
//! use zipmesh::config::WorkflowConfig;
//! use zipmesh::server::Server;
//! use zipmesh::transport::mem::MemNetwork;
//!
//! # async fn run() -> zipmesh::Result<()> {
//! let network = MemNetwork::new();
//! let config = WorkflowConfig::new("zipper-1", "127.0.0.1", 9000).with_functions(["echo"]);
//! let server = Server::new(&config).on_received_data(|data| println!("out: {:?}", data.carriage));
//! server.serve(network.listen(config.addr())).await
//! # }
//! ```

pub mod dispatch;
mod peer;
pub mod registry;
mod session;

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use dispatch::{DataHook, DispatchChannels, DispatchOptions, Dispatcher};
pub use peer::ServerPeer;
pub use registry::{Downstream, DownstreamKind, Registry, Replica};

use crate::Result;
use crate::client::{ClientOptions, ZipperSender};
use crate::config::WorkflowConfig;
use crate::connection::HeartbeatConfig;
use crate::frame::DataFrame;
use crate::mesh::MeshNode;
use crate::router::Router;
use crate::transport::{Dialer, Listener};
use session::{SessionContext, handle_session};

/// Zipper timing and sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    pub heartbeat: HeartbeatConfig,
    /// Time a new session has to open its control stream and send a handshake.
    pub handshake_timeout: Duration,
    /// Time to wait for `Ack` or `Init` on a new data stream.
    pub ack_timeout: Duration,
    /// How long a rejected session is kept open for the client to read the reason.
    pub reject_linger: Duration,
    pub dispatch: DispatchOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            handshake_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(5),
            reject_linger: Duration::from_secs(1),
            dispatch: DispatchOptions::default(),
        }
    }
}

/// A zipper serving one workflow.
pub struct Server {
    name: String,
    auth_token: Option<String>,
    router: Arc<Router>,
    registry: Arc<Registry>,
    options: ServerOptions,
    hook: Option<DataHook>,
    mesh: Mutex<Vec<Arc<ZipperSender>>>,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(config: &WorkflowConfig) -> Self {
        Self {
            name: config.name.clone(),
            auth_token: config.auth_token().map(str::to_string),
            router: Arc::new(Router::new(config.functions.iter().cloned())),
            registry: Arc::new(Registry::new()),
            options: ServerOptions::default(),
            hook: None,
            mesh: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Observe every frame leaving the pipeline.
    pub fn on_received_data(mut self, hook: impl Fn(&DataFrame) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cascade pipeline output to the other zippers of the mesh.
    ///
    /// Each node gets a [`ZipperSender`] that keeps reconnecting in the
    /// background until the server shuts down.
    pub fn join_mesh(&self, nodes: Vec<MeshNode>, dialer: Arc<dyn Dialer>, options: ClientOptions) {
        let mut mesh = self.mesh.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for node in nodes {
            let sender = Arc::new(ZipperSender::new(&self.name, node.addr(), Arc::clone(&dialer), options.clone()));
            self.registry.add_downstream(format!("zipper:{}", node.name), Arc::clone(&sender) as Arc<dyn Downstream>);

            info!(zipper = %node.name, addr = %node.addr(), "Cascading to mesh peer");

            let cancel = self.cancel.clone();
            let connecting = Arc::clone(&sender);
            tokio::spawn(async move {
                if let Err(e) = connecting.client().retry(&cancel).await {
                    warn!(zipper = %node.name, addr = %node.addr(), error = %e, "Gave up joining mesh peer");
                }
            });
            mesh.push(sender);
        }
    }

    /// Accept sessions until the listener closes or [`Server::shutdown`] is called.
    ///
    /// Only listener failures are returned; per-session errors are logged and
    /// contained.
    pub async fn serve<L: Listener>(&self, mut listener: L) -> Result<()> {
        let channels = Dispatcher::spawn(
            &self.router,
            Arc::clone(&self.registry),
            self.options.dispatch,
            self.hook.clone(),
            self.cancel.child_token(),
        );
        let ctx = Arc::new(SessionContext {
            router: Arc::clone(&self.router),
            registry: Arc::clone(&self.registry),
            options: self.options,
            auth_token: self.auth_token.clone(),
            ingress: channels.ingress.clone(),
            relay: channels.relay.clone(),
            cancel: self.cancel.child_token(),
            next_id: AtomicU64::new(1),
        });
        info!(
            zipper = %self.name,
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            functions = self.router.len(),
            "Zipper listening"
        );

        let result = loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok(Some(session)) => {
                    tokio::spawn(handle_session(Arc::clone(&ctx), session));
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        channels.cancel.cancel();
        ctx.cancel.cancel();
        self.registry.close_all("zipper shutting down");
        let senders: Vec<_> = self.mesh.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).drain(..).collect();
        for sender in senders {
            sender.client().close().await;
        }
        info!(zipper = %self.name, "Zipper stopped");
        result
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name)
            .field("router", &self.router)
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Role;
    use crate::frame::{AcceptedFrame, HandshakeFrame, Packet, TypedFrame};
    use crate::transport::Session;
    use crate::transport::mem::MemNetwork;
    use futures::{SinkExt, StreamExt};

    fn config() -> WorkflowConfig {
        let mut config = WorkflowConfig::new("zipper", "127.0.0.1", 9000).with_functions(["echo"]);
        config.auth = Some(crate::config::AuthConfig { token: "s3cret".to_string() });
        config
    }

    async fn handshake(session: &Arc<dyn Session>, frame: HandshakeFrame) -> Packet {
        let (mut reader, mut writer) = session.open_stream().await.unwrap().framed();
        writer.send(frame.to_frame().unwrap()).await.unwrap();
        let reply = reader.next().await.unwrap().unwrap();
        Packet::try_from(&reply).unwrap()
    }

    #[tokio::test]
    async fn handshakes_are_checked() {
        let network = MemNetwork::new();
        let server = Arc::new(Server::new(&config()));
        let listener = network.listen("zipper");
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };
        let dialer = network.dialer();

        let cases = [
            (HandshakeFrame::new("echo", Role::StreamFunction), false),
            (HandshakeFrame::new("echo", Role::StreamFunction).with_credential(Some("nope".into())), false),
            (HandshakeFrame::new("resize", Role::StreamFunction).with_credential(Some("s3cret".into())), false),
            (HandshakeFrame::new("mystery", Role::None).with_credential(Some("s3cret".into())), false),
            (HandshakeFrame::new("echo", Role::StreamFunction).with_credential(Some("s3cret".into())), true),
            (HandshakeFrame::new("camera", Role::Source).with_credential(Some("s3cret".into())), true),
        ];
        for (frame, accepted) in cases {
            let name = frame.name.clone();
            let session = dialer.dial("zipper").await.unwrap();
            match handshake(&session, frame).await {
                Packet::Accepted(AcceptedFrame { connection_id }) => {
                    assert!(accepted, "{name} should be rejected");
                    assert!(server.registry().contains(connection_id));
                }
                Packet::Rejected(_) => assert!(!accepted, "{name} should be accepted"),
                other => panic!("unexpected reply {other:?}"),
            }
            if !accepted {
                session.close("rejected");
            }
        }
        assert_eq!(server.registry().replica_count("echo"), 1);
        assert!(!server.registry().contains_name("resize"));

        server.shutdown();
        serving.await.unwrap().unwrap();
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn shutdown_before_serve_returns_immediately() {
        let network = MemNetwork::new();
        let listener = network.listen("zipper");
        let server = Server::new(&config());
        server.shutdown();
        assert!(server.serve(listener).await.is_ok());
    }
}
