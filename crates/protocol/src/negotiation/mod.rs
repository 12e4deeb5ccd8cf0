//! Stream negotiation: pluggable steps that turn a raw stream into a trusted one.
//!
//! A [`NegotiationStep`] consumes a [`DuplexStream`] and either hands back a
//! (possibly re-wrapped) stream or rejects the peer. Steps are composed into a
//! [`NegotiationPipeline`], and each one runs under a [`guard`] that enforces
//! its [`Deadline`] by closing the stream.
//!
//! Rejection is an outcome, not an error. `Err` is reserved for transport
//! failures, which callers surface as connection failures.

mod handshake;
mod pipeline;
mod secret;
mod timeout;
mod tls;

use std::future::Future;
use std::pin::Pin;

pub use handshake::{CryptoHandshakeStep, CIPHER_LAYER};
pub use pipeline::NegotiationPipeline;
pub use secret::{transcript_hash, RandomTokens, SharedSecretGateStep, TokenSource, DEFAULT_TOKEN_LENGTH};
pub use timeout::{guard, Deadline, DEFAULT_STEP_TIMEOUT, NO_DEADLINE};
pub use tls::{TlsRole, TlsSettings, TlsSettingsBuilder, TlsStep, TLS_LAYER};

use crate::error::Result;
use crate::stream::DuplexStream;

/// Result of running one step or a whole pipeline.
#[derive(Debug)]
pub enum Negotiated {
    /// The peer passed; continue with this stream.
    Continue(DuplexStream),
    /// The peer failed a check or timed out. The stream has been closed.
    Reject,
}

impl Negotiated {
    /// Returns true if the peer was rejected.
    pub fn is_reject(&self) -> bool {
        matches!(self, Negotiated::Reject)
    }

    /// Returns the negotiated stream, if any.
    pub fn into_stream(self) -> Option<DuplexStream> {
        match self {
            Negotiated::Continue(stream) => Some(stream),
            Negotiated::Reject => None,
        }
    }
}

/// Boxed future returned by [`NegotiationStep::negotiate`].
pub type NegotiationFuture<'a> = Pin<Box<dyn Future<Output = Result<Negotiated>> + Send + 'a>>;

/// One stage of stream negotiation.
///
/// A step instance may be shared by many pipelines and connections; any
/// per-connection state lives inside the future returned by `negotiate`.
pub trait NegotiationStep: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// How long the step may run before the stream is forcibly closed.
    fn deadline(&self) -> Deadline;

    /// Runs the step over `stream`.
    fn negotiate(&self, stream: DuplexStream) -> NegotiationFuture<'_>;
}

/// Closes `stream`, logs why locally and returns [`Negotiated::Reject`].
///
/// The reason never goes on the wire.
pub(crate) fn reject(stream: DuplexStream, step: &'static str, reason: &str) -> Negotiated {
    tracing::debug!(step, peer = ?stream.peer_addr(), reason, "Rejecting peer");
    stream.close();
    Negotiated::Reject
}
