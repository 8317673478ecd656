//! Error types for the mesh runtime.
//!
//! Every fallible operation in zipmesh returns [`MeshError`]. Wire-level codec
//! failures have their own [`FrameError`](crate::frame::FrameError) type which
//! converts into [`MeshError::Protocol`].
//!
//! ## Error Categories
//!
//! - **Connection Errors**: dialing a zipper, transport session failures
//! - **Handshake Errors**: the zipper rejected our handshake
//! - **Protocol Errors**: malformed or unexpected frames
//! - **Configuration Errors**: invalid workflow files or mesh documents
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use zipmesh::MeshError;
//!
//! let error = MeshError::connection_failed("127.0.0.1:9000", "connection refused");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```
//!
//! A rejection is final and is never retried:
//!
//! ```rust
//! use zipmesh::MeshError;
//!
//! let error = MeshError::rejected("function 'resize' is not part of the workflow");
//! assert!(!error.is_retryable());
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::frame::FrameError;

/// Result type alias for mesh operations.
pub type Result<T, E = MeshError> = std::result::Result<T, E>;

/// Main error type for mesh operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MeshError {
    #[error("Failed to connect to {addr}: {reason}")]
    Connection {
        addr: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Handshake rejected by zipper: {reason}")]
    Rejected { reason: String },

    #[error("Protocol error: {0}")]
    Protocol(#[source] FrameError),

    #[error("Unexpected {found} frame while waiting for {expected}")]
    UnexpectedFrame { expected: String, found: String },

    #[error("Transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Operation timed out after {duration:?}: {context}")]
    Timeout { duration: Duration, context: String },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Config file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Mesh config error: {reason}")]
    Mesh {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Connection closed")]
    Closed,

    #[error("Operation cancelled")]
    Cancelled,
}

impl MeshError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            MeshError::Connection { .. } => true,
            MeshError::Transport { .. } => true,
            MeshError::Timeout { .. } => true,
            MeshError::Closed => true,
            MeshError::Mesh { .. } => true,
            MeshError::Rejected { .. } => false,
            MeshError::Protocol(_) => false,
            MeshError::UnexpectedFrame { .. } => false,
            MeshError::Config { .. } => false,
            MeshError::File { .. } => false,
            MeshError::Cancelled => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            MeshError::Connection { .. } => vec![
                "Ensure the zipper is running and listening on the configured address",
                "Check firewall rules for UDP traffic",
                "Retry after the backoff interval",
            ],
            MeshError::Rejected { .. } => vec![
                "Check that the function name appears in the zipper workflow",
                "Verify the client type is supported",
                "Verify the credential matches the zipper auth token",
            ],
            MeshError::Protocol(_) | MeshError::UnexpectedFrame { .. } => vec![
                "Ensure both peers run compatible zipmesh versions",
                "Check for non-zipmesh traffic on the port",
            ],
            MeshError::Transport { .. } => vec![
                "Check network connectivity",
                "Reconnect to establish a fresh session",
            ],
            MeshError::Timeout { .. } => vec![
                "Increase the timeout duration",
                "Verify the peer is responding",
            ],
            MeshError::Config { .. } => vec![
                "Check the workflow file against the documented format",
                "Declare at least one function with a unique name",
            ],
            MeshError::File { .. } => vec![
                "Check the config file exists and is readable",
                "Use a .yaml or .yml extension",
            ],
            MeshError::Mesh { .. } => vec![
                "Check the mesh config URL is reachable",
                "Verify the document is a JSON array of {name, host, port}",
            ],
            MeshError::Closed => vec!["Reconnect to the zipper"],
            MeshError::Cancelled => vec![],
        }
    }

    /// Helper constructor for connection errors.
    pub fn connection_failed(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        MeshError::Connection { addr: addr.into(), reason: reason.into(), source: None }
    }

    /// Helper constructor for connection errors with source.
    pub fn connection_failed_with_source(
        addr: impl Into<String>,
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        MeshError::Connection { addr: addr.into(), reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for handshake rejections.
    pub fn rejected(reason: impl Into<String>) -> Self {
        MeshError::Rejected { reason: reason.into() }
    }

    /// Helper constructor for transport errors.
    pub fn transport(context: impl Into<String>) -> Self {
        MeshError::Transport { context: context.into(), source: None }
    }

    /// Helper constructor for transport errors with source.
    pub fn transport_with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        MeshError::Transport { context: context.into(), source: Some(Box::new(source)) }
    }

    /// Helper constructor for timeouts.
    pub fn timeout(duration: Duration, context: impl Into<String>) -> Self {
        MeshError::Timeout { duration, context: context.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        MeshError::Config { reason: reason.into() }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        MeshError::File { path, source }
    }

    /// Helper constructor for mesh document errors.
    pub fn mesh(reason: impl Into<String>) -> Self {
        MeshError::Mesh { reason: reason.into(), source: None }
    }

    /// Helper constructor for unexpected frames.
    pub fn unexpected_frame(expected: impl Into<String>, found: impl std::fmt::Display) -> Self {
        MeshError::UnexpectedFrame { expected: expected.into(), found: found.to_string() }
    }
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Transport { context: "stream i/o failed".to_string(), source: Some(Box::new(err)) }
    }
}

impl From<FrameError> for MeshError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(source) => MeshError::Transport {
                context: "stream i/o failed".to_string(),
                source: Some(Box::new(source)),
            },
            other => MeshError::Protocol(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_is_final() {
        let err = MeshError::rejected("mismatched function name");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("mismatched function name"));
        assert!(!err.recovery_suggestions().is_empty());
    }

    #[test]
    fn io_error_becomes_transport_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer went away");
        let err: MeshError = io_err.into();
        assert!(matches!(err, MeshError::Transport { .. }));
        assert!(err.is_retryable());
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("peer went away"));
    }

    #[test]
    fn frame_errors_are_protocol_errors() {
        let err: MeshError = FrameError::InvalidFrameType(0x7f).into();
        assert!(matches!(err, MeshError::Protocol(FrameError::InvalidFrameType(0x7f))));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("0x7f"));
    }

    #[test]
    fn frame_io_errors_stay_retryable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: MeshError = FrameError::Io(io_err).into();
        assert!(matches!(err, MeshError::Transport { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn cancellation_has_no_suggestions() {
        assert!(MeshError::Cancelled.recovery_suggestions().is_empty());
        assert!(!MeshError::Cancelled.is_retryable());
    }

    #[cfg(test)]
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
          #[test]
          fn error_messages_carry_their_context(
            addr in "[a-z0-9.]{1,20}:[0-9]{1,5}",
            reason in ".*",
            duration_ms in 1u64..60000u64
          ) {
            let connection = MeshError::connection_failed(addr.clone(), reason.clone());
            let rejected = MeshError::rejected(reason.clone());
            let timeout = MeshError::timeout(Duration::from_millis(duration_ms), reason.clone());

            let connection_msg = connection.to_string();
            prop_assert!(connection_msg.contains(&addr));
            prop_assert!(connection_msg.contains(&reason));
            prop_assert!(rejected.to_string().contains(&reason));
            prop_assert!(timeout.to_string().contains(&reason));

            prop_assert!(connection.is_retryable());
            prop_assert!(timeout.is_retryable());
            prop_assert!(!rejected.is_retryable());
          }

          #[test]
          fn source_chain_is_preserved(
            base_message in ".*",
            layers in prop::collection::vec("[a-z ]{0,12}", 1..4)
          ) {
            let mut current: Box<dyn std::error::Error + Send + Sync> =
              Box::new(std::io::Error::other(base_message.clone()));
            for (i, reason) in layers.iter().enumerate() {
              current = Box::new(MeshError::connection_failed_with_source(
                format!("node-{i}:9000"),
                reason.clone(),
                current,
              ));
            }

            let mut depth = 0;
            let mut found_base = false;
            let mut cursor: Option<&(dyn std::error::Error + 'static)> = Some(current.as_ref());
            while let Some(err) = cursor {
              if err.source().is_none() {
                found_base = err.to_string().contains(&base_message);
              }
              depth += 1;
              cursor = err.source();
              if depth > 10 {
                break;
              }
            }

            prop_assert_eq!(depth, layers.len() + 1);
            prop_assert!(found_base);
          }
        }
    }
}
