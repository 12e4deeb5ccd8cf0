//! Outbound connections and the per-peer connection pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use protocol::{DuplexStream, NegotiationPipeline};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::channel::{ChannelOptions, RpcChannel};
use crate::error::RpcResult;
use crate::registry::CommandRegistry;

/// Opens and negotiates outbound channels.
#[derive(Debug, Clone)]
pub struct Connector {
    pipeline: NegotiationPipeline,
    registry: Arc<CommandRegistry>,
    options: ChannelOptions,
    reverse_port: Option<u16>,
}

impl Connector {
    pub fn new(pipeline: NegotiationPipeline, registry: Arc<CommandRegistry>) -> Self {
        Self {
            pipeline,
            registry,
            options: ChannelOptions::default(),
            reverse_port: None,
        }
    }

    pub fn with_options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }

    /// Advertise `port` on every new channel.
    pub fn with_reverse_port(mut self, port: u16) -> Self {
        self.reverse_port = Some(port);
        self
    }

    pub fn reverse_port(&self) -> Option<u16> {
        self.reverse_port
    }

    /// Connects to `host:port`, negotiates and starts a channel.
    pub async fn connect(&self, host: &str, port: u16) -> RpcResult<RpcChannel> {
        debug!(host, port, "Connecting");
        let tcp = TcpStream::connect((host, port)).await?;
        let stream = DuplexStream::from_tcp(tcp);
        let channel =
            RpcChannel::establish(stream, &self.pipeline, Arc::clone(&self.registry), self.options)
                .await?;

        if let Some(reverse) = self.reverse_port {
            // Best effort: the channel is usable without it.
            if let Err(e) = channel.advertise_reverse_port(reverse).await {
                debug!(host, port, error = %e, "Failed to advertise reverse port");
            }
        }
        Ok(channel)
    }
}

type PeerKey = (String, u16);

/// Shares one channel per (host, port).
///
/// Concurrent `get` calls for the same peer wait on a lock scoped to that peer,
/// so only one of them connects; unrelated peers never contend. Dropping the
/// pool closes every channel it still holds.
#[derive(Debug)]
pub struct ConnectionPool {
    connector: Connector,
    slots: DashMap<PeerKey, Arc<Mutex<Option<RpcChannel>>>>,
    connect_attempts: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(connector: Connector) -> Self {
        Self {
            connector,
            slots: DashMap::new(),
            connect_attempts: AtomicUsize::new(0),
        }
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Returns the open channel to `host:port`, connecting if there is none.
    pub async fn get(&self, host: &str, port: u16) -> RpcResult<RpcChannel> {
        let key = (host.to_string(), port);
        let mut current = loop {
            let slot = Arc::clone(self.slots.entry(key.clone()).or_default().value());
            let guard = Arc::clone(&slot).lock_owned().await;
            // `close` may have removed the slot while we waited for it.
            if self
                .slots
                .get(&key)
                .is_some_and(|live| Arc::ptr_eq(live.value(), &slot))
            {
                break guard;
            }
            debug!(host, port, "Pool slot closed while waiting, retrying");
        };

        if let Some(channel) = current.as_ref().filter(|c| !c.is_closed()) {
            return Ok(channel.clone());
        }

        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let channel = self.connector.connect(host, port).await?;
        info!(host, port, channel = %channel.id(), "Pooled new connection");
        *current = Some(channel.clone());
        Ok(channel)
    }

    /// Closes and forgets the channel to `host:port`. Idempotent.
    pub async fn close(&self, host: &str, port: u16) {
        let Some((_, slot)) = self.slots.remove(&(host.to_string(), port)) else {
            return;
        };
        let channel = slot.lock().await.take();
        if let Some(channel) = channel {
            channel.close().await;
            debug!(host, port, "Closed pooled connection");
        }
    }

    /// Closes every pooled channel.
    pub async fn close_all(&self) {
        let keys: Vec<PeerKey> = self.slots.iter().map(|e| e.key().clone()).collect();
        for (host, port) in keys {
            self.close(&host, port).await;
        }
    }

    /// Number of open pooled channels at this moment.
    pub fn count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| match entry.value().try_lock() {
                Ok(slot) => slot.as_ref().is_some_and(|c| !c.is_closed()),
                // Someone is connecting right now.
                Err(_) => false,
            })
            .count()
    }

    /// How many times the pool has dialled a peer.
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::Relaxed)
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        for entry in self.slots.iter() {
            // `get` borrows the pool, so no slot can be locked here.
            if let Ok(slot) = entry.value().try_lock() {
                if let Some(channel) = slot.as_ref() {
                    channel.close_now("connection pool dropped");
                }
            }
        }
    }
}
