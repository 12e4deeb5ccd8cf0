//! Challenge/response proof of a pre-shared password.
//!
//! ```text
//! -> tl                                  (fresh random token)
//! <- tr
//! -> hex(SHA-256(password | tl | tr | password))
//! <- hex(SHA-256(password | tr | tl | password))
//! ```
//!
//! The password only ever enters the hash. Each side verifies a digest that
//! covers a token it chose itself, so a recorded exchange cannot be replayed.
//! This proves possession of the shared secret, not the identity of the peer.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use super::{reject, Deadline, Negotiated, NegotiationFuture, NegotiationStep};
use crate::crypto::CryptoEngine;
use crate::error::Result;
use crate::stream::DuplexStream;
use crate::wire::{read_string_field, write_string};

const NAME: &str = "shared-secret";

/// Default challenge token length in characters.
pub const DEFAULT_TOKEN_LENGTH: usize = 10;

/// Source of challenge tokens.
pub trait TokenSource: Send + Sync {
    /// Returns a token of exactly `length` characters.
    fn next_token(&self, length: usize) -> String;
}

/// Random base64 tokens drawn from a [`CryptoEngine`].
#[derive(Debug, Clone, Default)]
pub struct RandomTokens {
    engine: CryptoEngine,
}

impl RandomTokens {
    pub fn new(engine: CryptoEngine) -> Self {
        Self { engine }
    }
}

impl TokenSource for RandomTokens {
    fn next_token(&self, length: usize) -> String {
        // base64 of n bytes is never shorter than n characters.
        let mut token = STANDARD.encode(self.engine.random_bytes(length));
        token.truncate(length);
        token
    }
}

/// Hex SHA-256 over `password | first | second | password`.
pub fn transcript_hash(password: &str, first: &str, second: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(first.as_bytes());
    hasher.update(second.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Negotiation step gating the connection on a shared password.
#[derive(Clone)]
pub struct SharedSecretGateStep {
    password: String,
    token_length: usize,
    tokens: Arc<dyn TokenSource>,
    deadline: Deadline,
}

impl SharedSecretGateStep {
    /// Creates the step with random tokens and the default 20 second timeout.
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            token_length: DEFAULT_TOKEN_LENGTH,
            tokens: Arc::new(RandomTokens::default()),
            deadline: Deadline::default(),
        }
    }

    /// Replaces the token source.
    pub fn with_token_source(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Sets the token length in characters.
    pub fn with_token_length(mut self, length: usize) -> Self {
        self.token_length = length;
        self
    }

    /// Overrides the timeout.
    pub fn with_timeout(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    async fn run(&self, mut stream: DuplexStream) -> Result<Negotiated> {
        let local_token = self.tokens.next_token(self.token_length);
        write_string(&mut stream, &local_token).await?;

        let Some(remote_token) = read_string_field(&mut stream).await? else {
            return Ok(reject(stream, NAME, "blank or malformed token"));
        };
        if remote_token == local_token {
            return Ok(reject(stream, NAME, "peer echoed our token"));
        }

        let proof = transcript_hash(&self.password, &local_token, &remote_token);
        write_string(&mut stream, &proof).await?;

        let Some(received) = read_string_field(&mut stream).await? else {
            return Ok(reject(stream, NAME, "blank or malformed proof"));
        };
        let expected = transcript_hash(&self.password, &remote_token, &local_token);
        if received != expected {
            return Ok(reject(stream, NAME, "proof mismatch"));
        }

        tracing::trace!(step = NAME, peer = ?stream.peer_addr(), "Shared secret verified");
        Ok(Negotiated::Continue(stream))
    }
}

impl NegotiationStep for SharedSecretGateStep {
    fn name(&self) -> &'static str {
        NAME
    }

    fn deadline(&self) -> Deadline {
        self.deadline
    }

    fn negotiate(&self, stream: DuplexStream) -> NegotiationFuture<'_> {
        Box::pin(self.run(stream))
    }
}

impl std::fmt::Debug for SharedSecretGateStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecretGateStep")
            .field("password", &"[REDACTED]")
            .field("token_length", &self.token_length)
            .field("deadline", &self.deadline)
            .finish()
    }
}
