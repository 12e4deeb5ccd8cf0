//! TLS as a negotiation step.
//!
//! The handshake itself is delegated to rustls. Certificates are supplied as
//! PEM; with a CA and a certificate/key pair on both sides the handshake is
//! mutual, with only a CA on the client side it authenticates the server.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use super::{Deadline, Negotiated, NegotiationFuture, NegotiationStep};
use crate::error::{ProtocolError, Result};
use crate::stream::{DuplexStream, StreamMeta};

const NAME: &str = "tls";

/// Written by the server once it has accepted the client.
const HANDSHAKE_CONFIRMED: u8 = 0x01;

/// Name of the layer this step pushes onto the stream.
pub const TLS_LAYER: &str = "tls";

/// Client and server TLS configurations built from PEM material.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
}

impl TlsSettings {
    pub fn builder() -> TlsSettingsBuilder {
        TlsSettingsBuilder::default()
    }

    /// Whether these settings can run the client role.
    pub fn supports_client(&self) -> bool {
        self.client.is_some()
    }

    /// Whether these settings can run the server role.
    pub fn supports_server(&self) -> bool {
        self.server.is_some()
    }
}

/// Builder for [`TlsSettings`].
#[derive(Debug, Clone, Default)]
pub struct TlsSettingsBuilder {
    ca_cert_pem: Option<Vec<u8>>,
    cert_pem: Option<Vec<u8>>,
    key_pem: Option<Vec<u8>>,
    require_client_auth: bool,
}

impl TlsSettingsBuilder {
    /// Trust anchors used to verify the peer.
    pub fn ca_cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ca_cert_pem = Some(pem.into());
        self
    }

    /// Local certificate chain, leaf first.
    pub fn cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.cert_pem = Some(pem.into());
        self
    }

    /// Private key for the local certificate.
    pub fn key_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.key_pem = Some(pem.into());
        self
    }

    /// Whether the server role demands a client certificate signed by the CA.
    pub fn require_client_auth(mut self, require: bool) -> Self {
        self.require_client_auth = require;
        self
    }

    pub fn build(self) -> Result<TlsSettings> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let roots = self
            .ca_cert_pem
            .as_deref()
            .map(root_store)
            .transpose()?
            .map(Arc::new);

        let identity = match (self.cert_pem.as_deref(), self.key_pem.as_deref()) {
            (Some(cert), Some(key)) => Some((parse_certificates(cert)?, parse_private_key(key)?)),
            (None, None) => None,
            _ => {
                return Err(ProtocolError::Tls(
                    "certificate and private key must be configured together".into(),
                ))
            }
        };

        let client = match &roots {
            Some(roots) => Some(Arc::new(client_config(&provider, roots, identity.as_ref())?)),
            None => None,
        };

        let server = match identity {
            Some((certs, key)) => {
                let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
                    .with_safe_default_protocol_versions()?;
                let builder = if self.require_client_auth {
                    let roots = roots.clone().ok_or_else(|| {
                        ProtocolError::Tls("client authentication requires a CA certificate".into())
                    })?;
                    let verifier =
                        WebPkiClientVerifier::builder_with_provider(roots, Arc::clone(&provider))
                            .build()
                            .map_err(|e| ProtocolError::Tls(format!("client verifier error: {e}")))?;
                    builder.with_client_cert_verifier(verifier)
                } else {
                    builder.with_no_client_auth()
                };
                Some(Arc::new(builder.with_single_cert(certs, key)?))
            }
            None => None,
        };

        if client.is_none() && server.is_none() {
            return Err(ProtocolError::Tls(
                "TLS needs a CA certificate, a certificate and key, or both".into(),
            ));
        }

        Ok(TlsSettings { client, server })
    }
}

fn client_config(
    provider: &Arc<CryptoProvider>,
    roots: &Arc<RootCertStore>,
    identity: Option<&(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
) -> Result<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(Arc::clone(provider))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(Arc::clone(roots));
    Ok(match identity {
        Some((certs, key)) => builder.with_client_auth_cert(certs.clone(), key.clone_key())?,
        None => builder.with_no_client_auth(),
    })
}

fn root_store(pem: &[u8]) -> Result<RootCertStore> {
    let certs = parse_certificates(pem)?;
    let mut store = RootCertStore::empty();
    for cert in certs {
        store
            .add(cert)
            .map_err(|e| ProtocolError::Tls(format!("failed to add CA certificate: {e}")))?;
    }
    Ok(store)
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProtocolError::Tls(format!("failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(ProtocolError::Tls("no certificates found in PEM".into()));
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| ProtocolError::Tls(format!("failed to parse private key: {e}")))
}

/// Which side of the handshake a [`TlsStep`] plays.
#[derive(Debug, Clone)]
pub enum TlsRole {
    /// Connects, verifying the server against `server_name`.
    Client(ServerName<'static>),
    /// Accepts.
    Server,
}

/// Negotiation step wrapping the stream in TLS.
#[derive(Debug, Clone)]
pub struct TlsStep {
    settings: Arc<TlsSettings>,
    role: TlsRole,
    deadline: Deadline,
}

impl TlsStep {
    /// Client role; `server_name` is matched against the server certificate.
    pub fn client(settings: Arc<TlsSettings>, server_name: &str) -> Result<Self> {
        if !settings.supports_client() {
            return Err(ProtocolError::Tls("client role requires a CA certificate".into()));
        }
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| ProtocolError::Tls(format!("invalid server name {server_name:?}: {e}")))?;
        Ok(Self {
            settings,
            role: TlsRole::Client(name),
            deadline: Deadline::default(),
        })
    }

    /// Server role.
    pub fn server(settings: Arc<TlsSettings>) -> Result<Self> {
        if !settings.supports_server() {
            return Err(ProtocolError::Tls(
                "server role requires a certificate and private key".into(),
            ));
        }
        Ok(Self {
            settings,
            role: TlsRole::Server,
            deadline: Deadline::default(),
        })
    }

    /// Overrides the timeout.
    pub fn with_timeout(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn role(&self) -> &TlsRole {
        &self.role
    }

    async fn run(&self, stream: DuplexStream) -> Result<Negotiated> {
        let (io, meta) = stream.into_joined();

        let result = match &self.role {
            TlsRole::Client(name) => {
                let config = self.settings.client.clone().ok_or_else(|| {
                    ProtocolError::Tls("client role requires a CA certificate".into())
                })?;
                TlsConnector::from(config)
                    .connect(name.clone(), io)
                    .await
                    .map(|tls| DuplexStream::from_joined(tls, meta.clone(), TLS_LAYER))
            }
            TlsRole::Server => {
                let config = self.settings.server.clone().ok_or_else(|| {
                    ProtocolError::Tls("server role requires a certificate".into())
                })?;
                TlsAcceptor::from(config)
                    .accept(io)
                    .await
                    .map(|tls| DuplexStream::from_joined(tls, meta.clone(), TLS_LAYER))
            }
        };

        let stream = match result {
            Ok(stream) => stream,
            // rustls reports protocol and certificate failures as InvalidData.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Ok(reject_handshake(&meta, &e));
            }
            Err(e) => {
                meta.close_handle().close();
                return Err(e.into());
            }
        };

        match self.role {
            TlsRole::Client(_) => Ok(await_confirmation(stream, &meta).await),
            TlsRole::Server => {
                let mut stream = stream;
                let confirmed = async {
                    stream.write_all(&[HANDSHAKE_CONFIRMED]).await?;
                    stream.flush().await
                };
                if let Err(e) = confirmed.await {
                    meta.close_handle().close();
                    return Err(e.into());
                }
                Ok(Negotiated::Continue(stream))
            }
        }
    }
}

/// Under TLS 1.3 the client finishes before the server has checked its
/// certificate, so the client waits for the server's confirmation byte.
async fn await_confirmation(mut stream: DuplexStream, meta: &StreamMeta) -> Negotiated {
    let mut byte = [0u8; 1];
    match stream.read_exact(&mut byte).await {
        Ok(_) if byte[0] == HANDSHAKE_CONFIRMED => Negotiated::Continue(stream),
        Ok(_) => {
            let error = std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected confirmation byte {:#04x}", byte[0]),
            );
            reject_handshake(meta, &error)
        }
        Err(e) => reject_handshake(meta, &e),
    }
}

fn reject_handshake(meta: &StreamMeta, error: &std::io::Error) -> Negotiated {
    debug!(step = NAME, peer = ?meta.peer_addr(), error = %error, "TLS handshake failed");
    meta.close_handle().close();
    Negotiated::Reject
}

impl NegotiationStep for TlsStep {
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
