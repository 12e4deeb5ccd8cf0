//! Ephemeral RSA key exchange bootstrapping AES-CTR stream encryption.
//!
//! Both peers run the same sequence:
//!
//! ```text
//! -> modulus, exponent           (ephemeral RSA public key)
//! <- modulus, exponent
//! -> RSA-OAEP(peer key, local symmetric key), local IV
//! <- RSA-OAEP(local key, peer symmetric key), peer IV
//! ```
//!
//! Afterwards writes are encrypted with the peer's symmetric key and reads are
//! decrypted with the local one. Each side therefore controls the key that
//! protects its own inbound traffic, and the peer can only produce readable
//! traffic if it decrypted that key with the matching private key.

use tracing::trace;

use super::{reject, Deadline, Negotiated, NegotiationFuture, NegotiationStep};
use crate::cipher::{CipherReader, CipherWriter};
use crate::crypto::{AsymmetricKeys, CryptoEngine, SymmetricKey};
use crate::error::Result;
use crate::stream::DuplexStream;
use crate::wire::{read_field, write_block};

const NAME: &str = "crypto-handshake";

/// Name of the layers this step pushes onto the stream.
pub const CIPHER_LAYER: &str = "aes-ctr";

/// Progress through the exchange, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakePhase {
    GeneratingKeys,
    ExchangingPublicKeys,
    ExchangingSymmetricKeys,
    Complete,
}

/// Negotiation step performing the key exchange above.
#[derive(Debug, Clone)]
pub struct CryptoHandshakeStep {
    engine: CryptoEngine,
    deadline: Deadline,
}

impl CryptoHandshakeStep {
    /// Creates the step with the default 20 second timeout.
    pub fn new(engine: CryptoEngine) -> Self {
        Self {
            engine,
            deadline: Deadline::default(),
        }
    }

    /// Overrides the timeout.
    pub fn with_timeout(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// Returns the engine used for key generation.
    pub fn engine(&self) -> &CryptoEngine {
        &self.engine
    }

    async fn run(&self, mut stream: DuplexStream) -> Result<Negotiated> {
        let peer = stream.peer_addr();
        let phase = |current: HandshakePhase| {
            trace!(step = NAME, peer = ?peer, phase = ?current, "Handshake progress")
        };

        phase(HandshakePhase::GeneratingKeys);
        let local_keys = self.engine.generate_keypair_async().await?;
        let local_symmetric = self.engine.generate_symmetric_key();

        phase(HandshakePhase::ExchangingPublicKeys);
        write_block(&mut stream, &local_keys.modulus_bytes()?).await?;
        write_block(&mut stream, &local_keys.exponent_bytes()?).await?;

        let Some(modulus) = read_field(&mut stream).await? else {
            return Ok(reject(stream, NAME, "blank or oversized modulus"));
        };
        let Some(exponent) = read_field(&mut stream).await? else {
            return Ok(reject(stream, NAME, "blank or oversized exponent"));
        };
        let peer_keys = match AsymmetricKeys::from_public_components(&modulus, &exponent) {
            Ok(keys) => keys,
            Err(e) => return Ok(reject(stream, NAME, &e.to_string())),
        };

        phase(HandshakePhase::ExchangingSymmetricKeys);
        let wrapped = match peer_keys.encrypt(&self.engine, local_symmetric.key()) {
            Ok(wrapped) => wrapped,
            Err(e) => return Ok(reject(stream, NAME, &e.to_string())),
        };
        write_block(&mut stream, &wrapped).await?;
        write_block(&mut stream, local_symmetric.iv()).await?;

        let Some(peer_wrapped) = read_field(&mut stream).await? else {
            return Ok(reject(stream, NAME, "blank or oversized symmetric key"));
        };
        let Some(peer_iv) = read_field(&mut stream).await? else {
            return Ok(reject(stream, NAME, "blank or oversized IV"));
        };
        let peer_symmetric = match local_keys
            .decrypt(&peer_wrapped)
            .and_then(|key| SymmetricKey::from_parts(key, &peer_iv))
        {
            Ok(key) => key,
            Err(e) => return Ok(reject(stream, NAME, &e.to_string())),
        };

        let outbound = peer_symmetric.cipher()?;
        let inbound = local_symmetric.cipher()?;
        let stream = stream
            .wrap_reader(CIPHER_LAYER, |reader| CipherReader::new(reader, inbound))
            .wrap_writer(CIPHER_LAYER, |writer| CipherWriter::new(writer, outbound));

        phase(HandshakePhase::Complete);
        Ok(Negotiated::Continue(stream))
    }
}

impl NegotiationStep for CryptoHandshakeStep {
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
