//! RPC client: addresses peers by host and port over a connection pool.

use std::sync::Arc;

use protocol::NegotiationPipeline;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::channel::RpcChannel;
use crate::config::Config;
use crate::error::RpcResult;
use crate::pool::{ConnectionPool, Connector};
use crate::registry::CommandRegistry;

/// Sends commands and requests to remote servers.
///
/// Channels are pooled per (host, port), so repeated and concurrent calls to
/// the same server share one connection. Inbound commands on those channels
/// are dispatched to the client's own registry.
#[derive(Debug)]
pub struct RpcClient {
    pool: ConnectionPool,
}

impl RpcClient {
    pub fn new(connector: Connector) -> Self {
        Self {
            pool: ConnectionPool::new(connector),
        }
    }

    /// A client with the given pipeline and no extra options.
    pub fn with_pipeline(pipeline: NegotiationPipeline, registry: Arc<CommandRegistry>) -> Self {
        Self::new(Connector::new(pipeline, registry))
    }

    /// Builds a client from `config`'s outgoing pipeline.
    ///
    /// When `[rpc].advertise_reverse_port` is set and `listener_port` is
    /// given, every new channel advertises that port.
    pub fn from_config(
        config: &Config,
        registry: Arc<CommandRegistry>,
        listener_port: Option<u16>,
    ) -> anyhow::Result<Self> {
        let connector = Connector::new(config.outgoing_pipeline()?, registry)
            .with_options(config.channel_options());
        let client = Self::new(connector);
        Ok(match listener_port {
            Some(port) if config.rpc.advertise_reverse_port => client.with_reverse_capability(port),
            _ => client,
        })
    }

    /// Advertise `port` as our reverse port on every new channel.
    ///
    /// Channels opened before this call are closed with the old pool, so the
    /// next call reconnects with the advertisement.
    pub fn with_reverse_capability(self, port: u16) -> Self {
        debug!(port, "Enabling reverse capability");
        Self::new(self.pool.connector().clone().with_reverse_port(port))
    }

    pub fn reverse_port(&self) -> Option<u16> {
        self.pool.connector().reverse_port()
    }

    /// Returns the pooled channel to `host:port`, connecting if needed.
    pub async fn connect(&self, host: &str, port: u16) -> RpcResult<RpcChannel> {
        self.pool.get(host, port).await
    }

    /// Sends a fire-and-forget command.
    pub async fn send_command<T: Serialize>(
        &self,
        host: &str,
        port: u16,
        tag: &str,
        payload: &T,
    ) -> RpcResult<()> {
        self.connect(host, port).await?.send_command(tag, payload).await
    }

    /// Sends a request and waits for the reply.
    pub async fn send_command_and_wait_response<T, R>(
        &self,
        host: &str,
        port: u16,
        tag: &str,
        payload: &T,
    ) -> RpcResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        self.connect(host, port).await?.request(tag, payload).await
    }

    pub async fn close_connection(&self, host: &str, port: u16) {
        self.pool.close(host, port).await;
    }

    pub async fn close_all(&self) {
        self.pool.close_all().await;
    }

    pub fn connection_count(&self) -> usize {
        self.pool.count()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}
