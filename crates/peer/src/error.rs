//! Error types for RPC channels, pools and relays.

use protocol::ProtocolError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced to callers of the peer API.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Transport or codec failure on an established or negotiating stream.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The channel closed before the call completed.
    #[error("connection closed while waiting for response")]
    ConnectionClosed,

    /// The peer failed negotiation. The cause is only logged locally.
    #[error("negotiation with {peer} failed")]
    Rejected { peer: String },

    /// The outbound queue was full, so the command was not sent.
    #[error("outbound queue full, dropped command {0:?}")]
    Backpressure(String),

    /// The remote side has no handler for the tag.
    #[error("unknown tag: {0}")]
    UnknownTag(String),

    /// The remote handler failed.
    #[error("remote handler failed: {0}")]
    Remote(String),

    /// The channel never received a reverse port advertisement.
    #[error("peer {0} did not advertise a reverse port")]
    NoReversePort(String),

    /// The server was started without an outgoing pipeline.
    #[error("connect-back is not available on this server")]
    ConnectBackDisabled,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl RpcError {
    /// Returns true if the error means the connection is gone.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            RpcError::Protocol(e) => e.is_transport(),
            RpcError::ConnectionClosed | RpcError::Rejected { .. } => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Protocol(ProtocolError::Io(err))
    }
}

/// Result type alias for peer operations.
pub type RpcResult<T> = std::result::Result<T, RpcError>;
