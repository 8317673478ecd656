//! Client roles.

use std::fmt;

/// The kind of peer on a connection, fixed by a successful handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Unknown or missing client type. Always rejected.
    None,
    /// Produces data into the workflow.
    Source,
    /// Processes data for one workflow step.
    StreamFunction,
    /// Another zipper feeding data into this zipper's workflow.
    UpstreamZipper,
    /// Another zipper cascading its workflow results to this one.
    ZipperSender,
    /// Receives the final results of the workflow.
    OutputConnector,
}

/// Which side opens the data stream of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStreamPolicy {
    /// The client opens one data stream right after being accepted.
    ClientOpens,
    /// The zipper opens a data stream the first time it has data to deliver.
    ServerOpens,
    /// Control stream only.
    None,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::None => "none",
            Role::Source => "source",
            Role::StreamFunction => "stream-function",
            Role::UpstreamZipper => "upstream-zipper",
            Role::ZipperSender => "zipper-sender",
            Role::OutputConnector => "output-connector",
        }
    }

    /// Parse the client type carried by a handshake. Unknown names map to [`Role::None`].
    pub fn from_wire(value: &str) -> Self {
        match value {
            "source" => Role::Source,
            "stream-function" => Role::StreamFunction,
            "upstream-zipper" => Role::UpstreamZipper,
            "zipper-sender" => Role::ZipperSender,
            "output-connector" => Role::OutputConnector,
            _ => Role::None,
        }
    }

    pub fn data_stream_policy(self) -> DataStreamPolicy {
        match self {
            Role::Source | Role::UpstreamZipper | Role::ZipperSender => DataStreamPolicy::ClientOpens,
            Role::StreamFunction | Role::OutputConnector => DataStreamPolicy::ServerOpens,
            Role::None => DataStreamPolicy::None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
