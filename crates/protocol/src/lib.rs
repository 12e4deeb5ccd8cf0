//! # Duplink Protocol Library
//!
//! Stream negotiation, encryption and framing for the Duplink RPC and relay
//! peers.
//!
//! ## Overview
//!
//! - **Streams**: [`DuplexStream`] couples a reader and a writer with a
//!   shared [`CloseHandle`] so any layer can tear the connection down
//! - **Negotiation**: pluggable steps (key exchange, shared secret, TLS)
//!   composed into a [`NegotiationPipeline`], each under a timeout guard
//! - **Crypto**: ephemeral RSA key exchange and AES-CTR stream ciphers
//! - **Frame Codec**: length-prefixed framing with optional LZ4 compression
//! - **Envelopes**: JSON RPC envelopes carried one per frame
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Envelopes                  │  JSON, tagged
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Length-prefixed, LZ4
//! ├─────────────────────────────────────────┤
//! │       Negotiated layers (optional)      │  AES-CTR and/or TLS
//! ├─────────────────────────────────────────┤
//! │              TCP stream                 │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Envelope, Frame, FrameCodec};
//!
//! # async fn hello() -> protocol::Result<()> {
//! let (mut local, mut remote) = tokio::io::duplex(4096);
//! let codec = FrameCodec::new();
//!
//! let envelope = Envelope::command("Hello", &"Bob")?;
//! codec.write_frame(&mut local, &Frame::new(envelope.to_json()?)).await?;
//!
//! if let Some(frame) = codec.read_frame(&mut remote).await? {
//!     let decoded = Envelope::from_json(&frame.payload)?;
//!     assert_eq!(decoded.payload_as::<String>()?, "Bob");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`stream`]: Duplex streams and close handles
//! - [`negotiation`]: Negotiation steps, pipeline and timeout guard
//! - [`crypto`]: Key generation and ciphers
//! - [`cipher`]: Encrypting reader and writer adapters
//! - [`wire`]: Length-prefixed fields used during negotiation
//! - [`framing`]: Frame codec with compression
//! - [`messages`]: RPC envelope definitions
//! - [`error`]: Error types

pub mod cipher;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod messages;
pub mod negotiation;
pub mod stream;
pub mod wire;

pub use crypto::{AsymmetricKeys, CryptoEngine, SymmetricKey, SymmetricKeySize};
pub use error::{ProtocolError, Result};
pub use framing::{Frame, FrameCodec, FrameFlags, FRAME_MAGIC, MAX_FRAME_SIZE};
pub use messages::{
    Envelope, EnvelopeKind, FailureCode, FailureReason, ReversePort, PROTOCOL_VERSION,
    REVERSE_PORT_TAG,
};
pub use negotiation::{
    guard, CryptoHandshakeStep, Deadline, Negotiated, NegotiationPipeline, NegotiationStep,
    SharedSecretGateStep, TlsSettings, TlsStep,
};
pub use stream::{pipe, CloseHandle, DuplexStream};
