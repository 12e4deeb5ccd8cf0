//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
///
/// A peer that merely fails a check during negotiation is not an error: steps
/// report that as [`Negotiated::Reject`](crate::negotiation::Negotiated::Reject).
/// Errors are reserved for transport failures and for malformed input on a
/// channel that is otherwise usable.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Transport errors
    /// Underlying socket I/O failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream in the middle of a field or frame.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    // Wire errors
    /// A length-prefixed negotiation field exceeds the accepted maximum.
    #[error("field too large: {size} bytes exceeds maximum of {max} bytes")]
    FieldTooLarge {
        /// Announced field size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame is structurally invalid (bad magic, truncated content, bad compression).
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Key material could not be generated or configured.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// TLS configuration or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    // Configuration errors
    /// A deadline was constructed from a negative value other than the `-1` sentinel.
    #[error("invalid deadline: {0} ms (use -1 for no deadline or a positive value)")]
    InvalidDeadline(i64),

    /// A background task panicked or was cancelled unexpectedly.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    /// Returns true for failures of the underlying transport.
    ///
    /// Everything else is caused by what the peer sent (or by local
    /// misconfiguration) rather than by the socket itself.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_) | ProtocolError::ConnectionClosed(_)
        )
    }

    /// Maps a failed read of `what`, reporting an early EOF as a closed connection.
    pub(crate) fn truncated(err: std::io::Error, what: &str) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::ConnectionClosed(format!("stream ended inside a {what}"))
        } else {
            ProtocolError::Io(err)
        }
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<rsa::Error> for ProtocolError {
    fn from(err: rsa::Error) -> Self {
        match err {
            rsa::Error::Decryption => ProtocolError::Decryption(err.to_string()),
            rsa::Error::InvalidModulus
            | rsa::Error::InvalidExponent
            | rsa::Error::PublicExponentTooSmall
            | rsa::Error::PublicExponentTooLarge
            | rsa::Error::ModulusTooLarge => ProtocolError::InvalidPublicKey(err.to_string()),
            _ => ProtocolError::Encryption(err.to_string()),
        }
    }
}

impl From<rustls::Error> for ProtocolError {
    fn from(err: rustls::Error) -> Self {
        ProtocolError::Tls(err.to_string())
    }
}
