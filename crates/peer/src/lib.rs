//! # Duplink Peer Library
//!
//! Sockets, tasks and configuration on top of the [`protocol`] crate: an RPC
//! server and client that exchange tagged JSON envelopes over negotiated
//! streams, and a two-hop TCP relay that reuses the same negotiation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   accept    ┌──────────────────────┐   ready   ┌────────────┐
//! │  RpcServer   │ ──────────▶ │ NegotiationPipeline  │ ────────▶ │ RpcChannel │
//! └──────────────┘             │ TLS → crypto → secret│           └────────────┘
//! ┌──────────────┐   connect   └──────────────────────┘                 │
//! │  RpcClient   │ ── ConnectionPool ──▶ (same pipeline, client role) ──┘
//! └──────────────┘
//!
//! ┌───────┐  raw  ┌───────────┐  negotiated  ┌──────────┐  raw  ┌────────┐
//! │  app  │ ────▶ │   Entry   │ ═══════════▶ │   Exit   │ ────▶ │ target │
//! └───────┘       └───────────┘              └──────────┘       └────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use peer::{CommandRegistry, Config, RpcClient, RpcServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_or_default();
//!     peer::init_logging(&config.logging.level);
//!
//!     let mut registry = CommandRegistry::new();
//!     registry.register("Hello", |_ctx, name: String| async move {
//!         Ok(format!("Hello, {name}!"))
//!     });
//!     let server = RpcServer::from_config(&config, Arc::new(registry)).await?;
//!
//!     let client = RpcClient::from_config(&config, Arc::new(CommandRegistry::new()), None)?;
//!     let port = server.local_addr().port();
//!     let reply: String = client
//!         .send_command_and_wait_response("127.0.0.1", port, "Hello", &"Bob")
//!         .await?;
//!     assert_eq!(reply, "Hello, Bob!");
//!
//!     client.close_all().await;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration and pipeline construction
//! - [`registry`]: typed command handlers
//! - [`channel`]: one framed RPC connection
//! - [`pool`]: outbound connections shared per peer
//! - [`server`] / [`client`]: the RPC entry points
//! - [`relay`]: Entry/Exit tunnels and byte splicing

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod registry;
pub mod relay;
pub mod server;

// Re-export protocol for convenience
pub use protocol;

pub use channel::{ChannelOptions, ChannelState, RpcChannel};
pub use client::RpcClient;
pub use config::{Config, ConfigError, HandlerConcurrency};
pub use error::{RpcError, RpcResult};
pub use logging::init_logging;
pub use pool::{ConnectionPool, Connector};
pub use registry::{CallContext, CommandRegistry};
pub use relay::{
    splice, EntryConfig, ExitConfig, RelayHandle, RelayTarget, SpliceStats, TargetResolver, TcpRelay,
};
pub use server::RpcServer;
