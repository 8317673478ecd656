//! Streaming-mesh runtime.
//!
//! A *zipper* accepts connections from sources, stream functions and output
//! connectors over QUIC, and routes every data frame a source writes through
//! the workflow's stream functions in order before broadcasting the result.
//!
//! # Features
//!
//! - **Framing**: length-prefixed frames with typed views ([`frame`])
//! - **Liveness**: handshake, heartbeats and a per-connection state machine ([`connection`])
//! - **Dispatch**: one pipeline stage per workflow function, round-robin over replicas ([`server`])
//! - **Clients**: every role with automatic reconnect ([`client`])
//! - **Mesh**: cascading output to other zippers ([`mesh`])
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use std::sync::Arc;
//! use zipmesh::client::{ClientOptions, Source, StreamFunction};
//! use zipmesh::config::WorkflowConfig;
//! use zipmesh::server::Server;
//! use zipmesh::transport::mem::MemNetwork;
//!
//! #[tokio::main]
//! async fn main() -> zipmesh::Result<()> {
//!     let network = MemNetwork::new();
//!     let config = WorkflowConfig::new("zipper-1", "127.0.0.1", 9000).with_functions(["echo"]);
//!     let zipper = Arc::new(Server::new(&config).on_received_data(|data| println!("{:?}", data.carriage)));
//!     let listener = network.listen("zipper-1");
//!     let serving = Arc::clone(&zipper);
//!     tokio::spawn(async move { serving.serve(listener).await });
//!
//!     let dialer = Arc::new(network.dialer());
//!     let echo = StreamFunction::new("echo", "zipper-1", dialer.clone(), ClientOptions::default(), [0x10],
//!         |_tag: u32, carriage: &[u8]| -> Option<(u32, Bytes)> { Some((0x20, Bytes::copy_from_slice(carriage))) });
//!     echo.connect().await?;
//!
//!     let source = Source::new("camera", "zipper-1", dialer, ClientOptions::default());
//!     source.connect().await?;
//!     source.write(0x10, &b"ping"[..]).await?;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod connection;
mod error;
pub mod frame;
pub mod logging;
pub mod mesh;
pub mod router;
pub mod server;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod transport;

pub use error::*;

pub use client::{Client, ClientOptions, OutputConnector, Source, StreamFunction, ZipperSender};
pub use config::{RuntimeEnv, WorkflowConfig};
pub use connection::{ConnectionState, LifecycleEvent, Role};
pub use frame::{DataFrame, Frame, FrameError, FrameType, Tag};
pub use router::{App, Router};
pub use server::{Server, ServerOptions};

/// Entry point for running a zipper from a workflow file.
///
/// # Examples
///
/// ```rust,no_run
/// use zipmesh::{RuntimeEnv, Zipmesh};
///
/// #[tokio::main]
/// async fn main() -> zipmesh::Result<()> {
///     let env = RuntimeEnv::from_env();
///     let config = Zipmesh::load(&env.config_path)?;
///     Zipmesh::run(&config, &env).await
/// }
/// ```
pub struct Zipmesh;

impl Zipmesh {
    /// Read and validate a workflow file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<WorkflowConfig> {
        WorkflowConfig::parse(path)
    }

    /// Serve `config` over QUIC until Ctrl+C or SIGTERM.
    ///
    /// Uses the configured certificate, or a self-signed one without it. When
    /// the config names a mesh document the other zippers in it are joined as
    /// cascade targets.
    #[cfg(feature = "quic")]
    pub async fn run(config: &WorkflowConfig, env: &RuntimeEnv) -> Result<()> {
        use std::sync::Arc;
        use tracing::info;
        use transport::quic::{QuicListener, ServerIdentity};

        let identity = match &config.tls {
            Some(tls) => ServerIdentity::from_der_files(&tls.cert, &tls.key)?,
            None => ServerIdentity::self_signed()?,
        };
        let addr = tokio::net::lookup_host(config.addr())
            .await
            .map_err(|e| MeshError::connection_failed_with_source(config.addr(), "cannot resolve", Box::new(e)))?
            .next()
            .ok_or_else(|| MeshError::connection_failed(config.addr(), "no address"))?;
        let listener = QuicListener::bind(addr, identity)?;
        let server = Arc::new(Server::new(config));

        let mut options = ClientOptions::from_runtime(env);
        if let Some(token) = config.auth_token() {
            options = options.with_credential(token);
        }
        if let Some(url) = &config.mesh_config_url {
            #[cfg(feature = "mesh")]
            {
                use transport::quic::{QuicDialer, load_certificate};

                let dialer = match config.tls.as_ref().and_then(|tls| tls.ca.as_deref()) {
                    Some(ca) => QuicDialer::trusting([load_certificate(ca)?])?,
                    None => {
                        tracing::warn!("No tls.ca configured, mesh peers are dialed without certificate verification");
                        QuicDialer::new()?
                    }
                };
                let nodes = mesh::fetch_mesh_config(url, &config.name).await?;
                server.join_mesh(nodes, Arc::new(dialer), options);
            }
            #[cfg(not(feature = "mesh"))]
            tracing::warn!(url = %url, "Built without mesh support, ignoring mesh_config_url");
        }

        let mut serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };
        let joined = tokio::select! {
            joined = &mut serving => joined,
            signal = shutdown_signal() => {
                info!(signal, "Shutting down");
                server.shutdown();
                (&mut serving).await
            }
        };
        joined.map_err(|e| MeshError::transport_with_source("serve task failed", e))?
    }
}

/// Resolves with the name of the first termination signal received.
#[cfg(feature = "quic")]
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => tokio::select! {
                _ = ctrl_c => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                ctrl_c.await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await;
        "Ctrl+C"
    }
}
