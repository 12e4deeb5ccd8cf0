//! Configuration management for Duplink peers.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/duplink/config.toml`.
//! Besides plain settings it knows how to assemble the negotiation pipelines
//! that the RPC server, client and relay run on every connection.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use protocol::crypto::{MAX_ASYMMETRIC_KEY_BITS, MIN_ASYMMETRIC_KEY_BITS};
use protocol::negotiation::{DEFAULT_TOKEN_LENGTH, NO_DEADLINE};
use protocol::{
    CryptoEngine, CryptoHandshakeStep, Deadline, NegotiationPipeline, SharedSecretGateStep,
    SymmetricKeySize, TlsSettings, TlsStep,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::ChannelOptions;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("{section}.timeout_ms must be -1 or greater than 0, got {value}")]
    InvalidTimeout { section: &'static str, value: i64 },

    #[error("asymmetric_key_bits must be between 1024 and 4096, got {0}")]
    InvalidAsymmetricKeyBits(usize),

    #[error("symmetric_key_bits must be 128, 192 or 256, got {0}")]
    InvalidSymmetricKeyBits(usize),

    #[error("token_length must be between 1 and 1024, got {0}")]
    InvalidTokenLength(usize),

    #[error("shared secret password must not be empty")]
    EmptySharedSecret,

    #[error("tls is enabled but {0} is not configured")]
    MissingTlsMaterial(&'static str),

    #[error("relay {0} host and port must be configured together")]
    IncompleteRelayAddress(&'static str),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default timeout for every negotiation step, in milliseconds.
const DEFAULT_TIMEOUT_MS: i64 = 20_000;

/// Upper bound on the shared-secret token length.
const MAX_TOKEN_LENGTH: usize = 1024;

/// Main configuration structure for a Duplink peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,

    /// Ephemeral key exchange settings.
    pub crypto: CryptoConfig,

    /// Pre-shared password gate.
    pub shared_secret: SharedSecretConfig,

    pub tls: TlsConfig,

    /// RPC server and channel behaviour.
    pub rpc: RpcConfig,

    /// TCP relay endpoints.
    pub relay: RelayConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

/// Crypto handshake configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CryptoConfig {
    /// Run the key exchange on every connection.
    pub enabled: bool,

    /// Step timeout in milliseconds (-1 = unlimited).
    pub timeout_ms: i64,

    /// RSA modulus size for the ephemeral keypair.
    pub asymmetric_key_bits: usize,

    /// AES key size.
    pub symmetric_key_bits: usize,
}

/// Shared-secret gate configuration. The gate runs only when a password is set.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SharedSecretConfig {
    pub password: Option<String>,

    /// Step timeout in milliseconds (-1 = unlimited).
    pub timeout_ms: i64,

    /// Challenge token length in characters.
    pub token_length: usize,
}

/// TLS configuration. Paths point at PEM files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,

    /// Step timeout in milliseconds (-1 = unlimited).
    pub timeout_ms: i64,

    /// Trust anchors for verifying the peer.
    pub ca_cert: Option<PathBuf>,

    /// Local certificate chain.
    pub cert: Option<PathBuf>,

    /// Private key for `cert`.
    pub key: Option<PathBuf>,

    /// Require clients to present a certificate signed by `ca_cert`.
    pub require_client_auth: bool,

    /// Name the client expects in the server's certificate.
    pub server_name: String,
}

/// How a channel runs the handlers for inbound commands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HandlerConcurrency {
    /// One handler at a time, in arrival order.
    #[default]
    Sequential,
    /// Every handler on its own task.
    Concurrent,
}

/// RPC configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RpcConfig {
    /// Address the server binds to.
    pub listen_host: String,

    /// Server port (0 = ephemeral).
    pub listen_port: u16,

    /// Close the connection on an unknown tag instead of dropping the envelope.
    pub strict_unknown_tags: bool,

    pub handler_concurrency: HandlerConcurrency,

    /// Tell servers which port our own listener uses.
    pub advertise_reverse_port: bool,
}

/// Relay configuration. Entry uses `exit_*`, Exit uses `target_*`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_host: String,

    /// Relay port (0 = ephemeral).
    pub listen_port: u16,

    pub exit_host: Option<String>,
    pub exit_port: Option<u16>,

    pub target_host: Option<String>,
    pub target_port: Option<u16>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            asymmetric_key_bits: 2048,
            symmetric_key_bits: 256,
        }
    }
}

impl Default for SharedSecretConfig {
    fn default() -> Self {
        Self {
            password: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            token_length: DEFAULT_TOKEN_LENGTH,
        }
    }
}

impl std::fmt::Debug for SharedSecretConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecretConfig")
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_ms", &self.timeout_ms)
            .field("token_length", &self.token_length)
            .finish()
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            ca_cert: None,
            cert: None,
            key: None,
            require_client_auth: true,
            server_name: "localhost".to_string(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 0,
            strict_unknown_tags: false,
            handler_concurrency: HandlerConcurrency::Sequential,
            advertise_reverse_port: false,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 0,
            exit_host: None,
            exit_port: None,
            target_host: None,
            target_port: None,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("duplink")
        .join("config.toml")
}

/// Which side of a connection a pipeline is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Incoming,
    Outgoing,
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - DUPLINK_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - DUPLINK_SHARED_SECRET: Enable the shared-secret gate with this password
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("DUPLINK_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }

        if let Ok(password) = std::env::var("DUPLINK_SHARED_SECRET") {
            if !password.is_empty() {
                tracing::info!("Overriding shared secret from environment");
                self.shared_secret.password = Some(password);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        for (section, value) in [
            ("crypto", self.crypto.timeout_ms),
            ("shared_secret", self.shared_secret.timeout_ms),
            ("tls", self.tls.timeout_ms),
        ] {
            if value != NO_DEADLINE && value <= 0 {
                return Err(ConfigError::InvalidTimeout { section, value });
            }
        }

        let bits = self.crypto.asymmetric_key_bits;
        if !(MIN_ASYMMETRIC_KEY_BITS..=MAX_ASYMMETRIC_KEY_BITS).contains(&bits) {
            return Err(ConfigError::InvalidAsymmetricKeyBits(bits));
        }
        if SymmetricKeySize::from_bits(self.crypto.symmetric_key_bits).is_err() {
            return Err(ConfigError::InvalidSymmetricKeyBits(
                self.crypto.symmetric_key_bits,
            ));
        }

        let length = self.shared_secret.token_length;
        if length == 0 || length > MAX_TOKEN_LENGTH {
            return Err(ConfigError::InvalidTokenLength(length));
        }
        if self.shared_secret.password.as_deref() == Some("") {
            return Err(ConfigError::EmptySharedSecret);
        }

        if self.tls.enabled {
            let has_identity = self.tls.cert.is_some() && self.tls.key.is_some();
            if self.tls.cert.is_some() != self.tls.key.is_some() {
                return Err(ConfigError::MissingTlsMaterial("cert/key pair"));
            }
            if self.tls.ca_cert.is_none() && !has_identity {
                return Err(ConfigError::MissingTlsMaterial("ca_cert"));
            }
            if self.tls.require_client_auth && self.tls.ca_cert.is_none() {
                return Err(ConfigError::MissingTlsMaterial("ca_cert"));
            }
        }

        if self.relay.exit_host.is_some() != self.relay.exit_port.is_some() {
            return Err(ConfigError::IncompleteRelayAddress("exit"));
        }
        if self.relay.target_host.is_some() != self.relay.target_port.is_some() {
            return Err(ConfigError::IncompleteRelayAddress("target"));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Load from the default path with environment overrides applied,
    /// falling back to defaults if the file is unreadable.
    pub fn load_or_default() -> Self {
        let mut config = Self::load_default().unwrap_or_else(|e| {
            tracing::warn!("Ignoring unreadable configuration: {:#}", e);
            Self::default()
        });
        config.apply_env_overrides();
        config
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Builds the crypto engine described by the `[crypto]` section.
    pub fn crypto_engine(&self) -> Result<CryptoEngine, ConfigError> {
        let size = SymmetricKeySize::from_bits(self.crypto.symmetric_key_bits)
            .map_err(|_| ConfigError::InvalidSymmetricKeyBits(self.crypto.symmetric_key_bits))?;
        CryptoEngine::new()
            .with_asymmetric_bits(self.crypto.asymmetric_key_bits)
            .map(|engine| engine.with_symmetric_key_size(size))
            .map_err(|_| ConfigError::InvalidAsymmetricKeyBits(self.crypto.asymmetric_key_bits))
    }

    /// Channel behaviour from the `[rpc]` section.
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            strict_unknown_tags: self.rpc.strict_unknown_tags,
            concurrency: self.rpc.handler_concurrency,
        }
    }

    /// Pipeline for connections this peer accepts.
    pub fn incoming_pipeline(&self) -> Result<NegotiationPipeline> {
        self.pipeline(Direction::Incoming)
    }

    /// Pipeline for connections this peer opens.
    pub fn outgoing_pipeline(&self) -> Result<NegotiationPipeline> {
        self.pipeline(Direction::Outgoing)
    }

    /// Steps run in the order TLS, crypto handshake, shared secret.
    fn pipeline(&self, direction: Direction) -> Result<NegotiationPipeline> {
        self.validate()?;
        let mut pipeline = NegotiationPipeline::new();

        if self.tls.enabled {
            let settings = Arc::new(self.tls_settings()?);
            let step = match direction {
                Direction::Incoming => TlsStep::server(settings)?,
                Direction::Outgoing => TlsStep::client(settings, &self.tls.server_name)?,
            };
            pipeline = pipeline.with_step(step.with_timeout(deadline(self.tls.timeout_ms)?));
        }

        if self.crypto.enabled {
            let step = CryptoHandshakeStep::new(self.crypto_engine()?)
                .with_timeout(deadline(self.crypto.timeout_ms)?);
            pipeline = pipeline.with_step(step);
        }

        if let Some(password) = &self.shared_secret.password {
            let step = SharedSecretGateStep::new(password.clone())
                .with_token_length(self.shared_secret.token_length)
                .with_timeout(deadline(self.shared_secret.timeout_ms)?);
            pipeline = pipeline.with_step(step);
        }

        tracing::debug!(?direction, steps = ?pipeline.step_names(), "Built negotiation pipeline");
        Ok(pipeline)
    }

    fn tls_settings(&self) -> Result<TlsSettings> {
        let mut builder = TlsSettings::builder().require_client_auth(self.tls.require_client_auth);
        if let Some(path) = &self.tls.ca_cert {
            builder = builder.ca_cert_pem(read_pem(path)?);
        }
        if let Some(path) = &self.tls.cert {
            builder = builder.cert_pem(read_pem(path)?);
        }
        if let Some(path) = &self.tls.key {
            builder = builder.key_pem(read_pem(path)?);
        }
        builder.build().context("Invalid TLS material")
    }
}

fn deadline(timeout_ms: i64) -> Result<Deadline> {
    Deadline::from_millis(timeout_ms).context("Invalid step timeout")
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read PEM file: {}", path.display()))
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
