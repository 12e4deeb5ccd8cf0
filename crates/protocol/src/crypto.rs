//! Key material and the cryptographic engine used during negotiation.
//!
//! The engine is an explicit handle rather than a process-wide singleton: it
//! carries key sizes and an entropy source, and every operation forks a fresh
//! RNG from that source. A seeded engine makes handshakes reproducible in tests.

use std::sync::{Arc, Mutex};

use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher as _};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::{ProtocolError, Result};

/// Default RSA modulus size in bits.
pub const DEFAULT_ASYMMETRIC_KEY_BITS: usize = 2048;

/// Smallest RSA modulus the engine will generate.
pub const MIN_ASYMMETRIC_KEY_BITS: usize = 1024;

/// Largest RSA modulus the engine will generate or accept from a peer.
pub const MAX_ASYMMETRIC_KEY_BITS: usize = 4096;

/// Initialization vector length for the stream cipher.
pub const IV_LENGTH: usize = 16;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Supported symmetric key sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymmetricKeySize {
    Aes128,
    Aes192,
    #[default]
    Aes256,
}

impl SymmetricKeySize {
    /// Maps a key size in bits to a supported variant.
    pub fn from_bits(bits: usize) -> Result<Self> {
        match bits {
            128 => Ok(Self::Aes128),
            192 => Ok(Self::Aes192),
            256 => Ok(Self::Aes256),
            other => Err(ProtocolError::HandshakeFailed(format!(
                "unsupported symmetric key size: {other} bits"
            ))),
        }
    }

    fn from_len(len: usize) -> Option<Self> {
        match len {
            16 => Some(Self::Aes128),
            24 => Some(Self::Aes192),
            32 => Some(Self::Aes256),
            _ => None,
        }
    }

    /// Key length in bytes.
    pub fn byte_len(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    /// Key length in bits.
    pub fn bits(self) -> usize {
        self.byte_len() * 8
    }
}

#[derive(Clone)]
enum Entropy {
    Os,
    Seeded(Arc<Mutex<StdRng>>),
}

/// Explicit handle for key generation and randomness.
#[derive(Clone)]
pub struct CryptoEngine {
    asymmetric_bits: usize,
    symmetric_size: SymmetricKeySize,
    entropy: Entropy,
}

impl CryptoEngine {
    /// Creates an engine with default key sizes and OS entropy.
    pub fn new() -> Self {
        Self {
            asymmetric_bits: DEFAULT_ASYMMETRIC_KEY_BITS,
            symmetric_size: SymmetricKeySize::default(),
            entropy: Entropy::Os,
        }
    }

    /// Creates an engine whose randomness is fully determined by `seed`.
    ///
    /// Only meant for tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            entropy: Entropy::Seeded(Arc::new(Mutex::new(StdRng::seed_from_u64(seed)))),
            ..Self::new()
        }
    }

    /// Sets the RSA modulus size.
    pub fn with_asymmetric_bits(mut self, bits: usize) -> Result<Self> {
        if !(MIN_ASYMMETRIC_KEY_BITS..=MAX_ASYMMETRIC_KEY_BITS).contains(&bits) {
            return Err(ProtocolError::HandshakeFailed(format!(
                "asymmetric key size must be between {MIN_ASYMMETRIC_KEY_BITS} and \
                 {MAX_ASYMMETRIC_KEY_BITS} bits, got {bits}"
            )));
        }
        self.asymmetric_bits = bits;
        Ok(self)
    }

    /// Sets the symmetric key size.
    pub fn with_symmetric_key_size(mut self, size: SymmetricKeySize) -> Self {
        self.symmetric_size = size;
        self
    }

    /// Returns the configured RSA modulus size.
    pub fn asymmetric_bits(&self) -> usize {
        self.asymmetric_bits
    }

    /// Returns the configured symmetric key size.
    pub fn symmetric_key_size(&self) -> SymmetricKeySize {
        self.symmetric_size
    }

    /// Forks a fresh RNG from the engine's entropy source.
    pub fn rng(&self) -> StdRng {
        match &self.entropy {
            Entropy::Os => StdRng::from_entropy(),
            Entropy::Seeded(master) => {
                let mut master = master.lock().unwrap_or_else(|e| e.into_inner());
                StdRng::seed_from_u64(master.next_u64())
            }
        }
    }

    /// Returns `len` random bytes.
    pub fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        self.rng().fill_bytes(&mut bytes);
        bytes
    }

    /// Generates an ephemeral RSA keypair. CPU bound; prefer
    /// [`generate_keypair_async`](Self::generate_keypair_async) from async code.
    pub fn generate_keypair(&self) -> Result<AsymmetricKeys> {
        let mut rng = self.rng();
        let private = RsaPrivateKey::new(&mut rng, self.asymmetric_bits)?;
        Ok(AsymmetricKeys::from_private(private))
    }

    /// Generates an ephemeral RSA keypair on the blocking pool.
    pub async fn generate_keypair_async(&self) -> Result<AsymmetricKeys> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.generate_keypair())
            .await
            .map_err(|e| ProtocolError::Internal(format!("key generation task failed: {e}")))?
    }

    /// Generates a fresh symmetric key and IV.
    pub fn generate_symmetric_key(&self) -> SymmetricKey {
        let mut rng = self.rng();
        let mut key = vec![0u8; self.symmetric_size.byte_len()];
        rng.fill_bytes(&mut key);
        let mut iv = [0u8; IV_LENGTH];
        rng.fill_bytes(&mut iv);
        SymmetricKey {
            size: self.symmetric_size,
            key,
            iv,
        }
    }
}

impl Default for CryptoEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CryptoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEngine")
            .field("asymmetric_bits", &self.asymmetric_bits)
            .field("symmetric_size", &self.symmetric_size)
            .field(
                "entropy",
                &match self.entropy {
                    Entropy::Os => "os",
                    Entropy::Seeded(_) => "seeded",
                },
            )
            .finish()
    }
}

/// An RSA keypair where either half may be absent.
///
/// The local ephemeral key has both halves; a key reconstructed from a peer's
/// modulus and exponent has only the public half.
#[derive(Clone)]
pub struct AsymmetricKeys {
    public: Option<RsaPublicKey>,
    private: Option<RsaPrivateKey>,
}

impl AsymmetricKeys {
    fn from_private(private: RsaPrivateKey) -> Self {
        Self {
            public: Some(private.to_public_key()),
            private: Some(private),
        }
    }

    /// Reconstructs a public key from big-endian modulus and exponent bytes.
    pub fn from_public_components(modulus: &[u8], exponent: &[u8]) -> Result<Self> {
        let n = BigUint::from_bytes_be(modulus);
        let e = BigUint::from_bytes_be(exponent);
        let public = RsaPublicKey::new(n, e)?;
        Ok(Self {
            public: Some(public),
            private: None,
        })
    }

    /// Returns whether the private half is present.
    pub fn has_private(&self) -> bool {
        self.private.is_some()
    }

    fn public(&self) -> Result<&RsaPublicKey> {
        self.public
            .as_ref()
            .ok_or_else(|| ProtocolError::InvalidPublicKey("public key absent".to_string()))
    }

    /// Big-endian modulus bytes of the public key.
    pub fn modulus_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.public()?.n().to_bytes_be())
    }

    /// Big-endian public exponent bytes.
    pub fn exponent_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.public()?.e().to_bytes_be())
    }

    /// Encrypts `data` with RSA-OAEP(SHA-256) under the public key.
    pub fn encrypt(&self, engine: &CryptoEngine, data: &[u8]) -> Result<Vec<u8>> {
        let mut rng = engine.rng();
        Ok(self
            .public()?
            .encrypt(&mut rng, Oaep::new::<Sha256>(), data)?)
    }

    /// Decrypts RSA-OAEP(SHA-256) ciphertext with the private key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let private = self
            .private
            .as_ref()
            .ok_or_else(|| ProtocolError::Decryption("private key absent".to_string()))?;
        Ok(private.decrypt(Oaep::new::<Sha256>(), ciphertext)?)
    }
}

impl std::fmt::Debug for AsymmetricKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsymmetricKeys")
            .field("bits", &self.public.as_ref().map(|k| k.size() * 8))
            .field("has_private", &self.has_private())
            .finish()
    }
}

/// A symmetric key and IV. Generated fresh per connection attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey {
    size: SymmetricKeySize,
    key: Vec<u8>,
    iv: [u8; IV_LENGTH],
}

impl SymmetricKey {
    /// Builds a key from raw parts received during a handshake.
    pub fn from_parts(key: Vec<u8>, iv: &[u8]) -> Result<Self> {
        let size = SymmetricKeySize::from_len(key.len()).ok_or_else(|| {
            ProtocolError::HandshakeFailed(format!("invalid symmetric key length: {}", key.len()))
        })?;
        let iv: [u8; IV_LENGTH] = iv.try_into().map_err(|_| {
            ProtocolError::HandshakeFailed(format!(
                "invalid IV length: expected {IV_LENGTH}, got {}",
                iv.len()
            ))
        })?;
        Ok(Self { size, key, iv })
    }

    /// Key size.
    pub fn size(&self) -> SymmetricKeySize {
        self.size
    }

    /// Raw key bytes.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The IV; not secret.
    pub fn iv(&self) -> &[u8; IV_LENGTH] {
        &self.iv
    }

    /// Starts a keystream at the beginning of this key/IV pair.
    pub fn cipher(&self) -> Result<StreamCipher> {
        let invalid = |e: ctr::cipher::InvalidLength| ProtocolError::HandshakeFailed(e.to_string());
        let keystream = match self.size {
            SymmetricKeySize::Aes128 => {
                Keystream::Aes128(Aes128Ctr::new_from_slices(&self.key, &self.iv).map_err(invalid)?)
            }
            SymmetricKeySize::Aes192 => {
                Keystream::Aes192(Aes192Ctr::new_from_slices(&self.key, &self.iv).map_err(invalid)?)
            }
            SymmetricKeySize::Aes256 => {
                Keystream::Aes256(Aes256Ctr::new_from_slices(&self.key, &self.iv).map_err(invalid)?)
            }
        };
        Ok(StreamCipher(keystream))
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("size", &self.size)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

enum Keystream {
    Aes128(Aes128Ctr),
    Aes192(Aes192Ctr),
    Aes256(Aes256Ctr),
}

/// AES-CTR keystream for one direction of a stream.
pub struct StreamCipher(Keystream);

impl StreamCipher {
    /// XORs the next `buf.len()` keystream bytes into `buf`.
    pub fn apply(&mut self, buf: &mut [u8]) {
        match &mut self.0 {
            Keystream::Aes128(c) => c.apply_keystream(buf),
            Keystream::Aes192(c) => c.apply_keystream(buf),
            Keystream::Aes256(c) => c.apply_keystream(buf),
        }
    }
}

impl std::fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.0 {
            Keystream::Aes128(_) => "aes-128-ctr",
            Keystream::Aes192(_) => "aes-192-ctr",
            Keystream::Aes256(_) => "aes-256-ctr",
        };
        f.write_str(name)
    }
}
