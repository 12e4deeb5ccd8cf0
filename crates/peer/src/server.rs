//! RPC server: accept loop, per-connection negotiation and channel tracking.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use protocol::{DuplexStream, NegotiationPipeline};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelOptions, RpcChannel};
use crate::config::Config;
use crate::error::{RpcError, RpcResult};
use crate::pool::{ConnectionPool, Connector};
use crate::registry::CommandRegistry;

/// Back-off after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by the accept loop and connection tasks.
struct Acceptor {
    pipeline: NegotiationPipeline,
    registry: Arc<CommandRegistry>,
    options: ChannelOptions,
    channels: DashMap<Uuid, RpcChannel>,
    accepted_total: AtomicUsize,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Acceptor {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((tcp, addr)) => {
                    self.accepted_total.fetch_add(1, Ordering::Relaxed);
                    debug!(peer = %addr, "Accepted connection");
                    let acceptor = Arc::clone(&self);
                    self.tasks.spawn(async move { acceptor.serve(tcp, addr).await });
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
        debug!("Accept loop stopped");
    }

    /// Negotiates one connection and tracks its channel until it closes.
    async fn serve(&self, tcp: TcpStream, addr: SocketAddr) {
        let stream = DuplexStream::from_tcp(tcp);
        let close = stream.close_handle();

        let established = tokio::select! {
            _ = self.shutdown.cancelled() => {
                close.close();
                return;
            }
            established = RpcChannel::establish(
                stream,
                &self.pipeline,
                Arc::clone(&self.registry),
                self.options,
            ) => established,
        };

        let channel = match established {
            Ok(channel) => channel,
            Err(RpcError::Rejected { .. }) => {
                info!(peer = %addr, "Rejected connection");
                return;
            }
            Err(e) => {
                warn!(peer = %addr, error = %e, "Negotiation failed");
                return;
            }
        };

        let id = channel.id();
        self.channels.insert(id, channel.clone());
        // Shutdown may have swept the map before we inserted.
        if self.shutdown.is_cancelled() {
            channel.close().await;
        }

        channel.closed().await;
        self.channels.remove(&id);
        debug!(peer = %addr, channel = %id, "Connection finished");
    }
}

/// A listening RPC server.
pub struct RpcServer {
    local_addr: SocketAddr,
    acceptor: Arc<Acceptor>,
    back_pool: Option<ConnectionPool>,
}

impl RpcServer {
    /// Binds `[rpc].listen_host:listen_port` and starts accepting.
    ///
    /// `pipeline` negotiates accepted connections and, since the built-in
    /// steps are symmetric, connect-back connections too.
    pub async fn start(
        config: &Config,
        registry: Arc<CommandRegistry>,
        pipeline: NegotiationPipeline,
    ) -> RpcResult<Self> {
        let outgoing = pipeline.clone();
        Self::start_with_pipelines(config, registry, pipeline, Some(outgoing)).await
    }

    /// Like [`start`](Self::start) with a separate pipeline for connect-back,
    /// or none to disable it.
    pub async fn start_with_pipelines(
        config: &Config,
        registry: Arc<CommandRegistry>,
        incoming: NegotiationPipeline,
        outgoing: Option<NegotiationPipeline>,
    ) -> RpcResult<Self> {
        let listener =
            TcpListener::bind((config.rpc.listen_host.as_str(), config.rpc.listen_port)).await?;
        let local_addr = listener.local_addr()?;
        let options = config.channel_options();

        let back_pool = outgoing.map(|pipeline| {
            ConnectionPool::new(
                Connector::new(pipeline, Arc::clone(&registry)).with_options(options),
            )
        });

        info!(
            addr = %local_addr,
            steps = ?incoming.step_names(),
            handlers = ?registry.tags(),
            "RPC server listening"
        );

        let acceptor = Arc::new(Acceptor {
            pipeline: incoming,
            registry,
            options,
            channels: DashMap::new(),
            accepted_total: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        acceptor
            .tasks
            .spawn(Arc::clone(&acceptor).accept_loop(listener));

        Ok(Self {
            local_addr,
            acceptor,
            back_pool,
        })
    }

    /// Starts a server with both pipelines built from `config`.
    ///
    /// Connect-back is disabled when the configuration cannot produce an
    /// outgoing pipeline (for example TLS with a certificate but no CA).
    pub async fn from_config(config: &Config, registry: Arc<CommandRegistry>) -> anyhow::Result<Self> {
        let incoming = config.incoming_pipeline()?;
        let outgoing = match config.outgoing_pipeline() {
            Ok(pipeline) => Some(pipeline),
            Err(e) => {
                debug!("Connect-back disabled: {:#}", e);
                None
            }
        };
        Ok(Self::start_with_pipelines(config, registry, incoming, outgoing).await?)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of ready channels right now.
    pub fn connection_count(&self) -> usize {
        self.acceptor.channels.len()
    }

    /// Connections accepted since start, including rejected ones.
    pub fn accepted_total(&self) -> usize {
        self.acceptor.accepted_total.load(Ordering::Relaxed)
    }

    /// Snapshot of the ready channels.
    pub fn connections(&self) -> Vec<RpcChannel> {
        self.acceptor
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Opens a channel to the listener `channel`'s peer advertised.
    ///
    /// Best effort: the advertisement is only a hint and the peer may not be
    /// reachable at its source IP.
    pub async fn connect_back(&self, channel: &RpcChannel) -> RpcResult<RpcChannel> {
        let addr = channel.reverse_addr().ok_or_else(|| {
            RpcError::NoReversePort(
                channel
                    .peer_addr()
                    .map_or_else(|| "unknown peer".to_string(), |a| a.to_string()),
            )
        })?;
        let pool = self.back_pool.as_ref().ok_or(RpcError::ConnectBackDisabled)?;
        debug!(peer = ?channel.peer_addr(), reverse = %addr, "Connecting back");
        pool.get(&addr.ip().to_string(), addr.port()).await
    }

    /// Stops accepting, closes every channel and waits for connection tasks.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.acceptor.shutdown.cancel();

        for channel in self.connections() {
            channel.close().await;
        }
        if let Some(pool) = &self.back_pool {
            pool.close_all().await;
        }

        self.acceptor.tasks.close();
        self.acceptor.tasks.wait().await;
        info!(addr = %self.local_addr, "RPC server stopped");
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        // Stop accepting; established channels stay up until closed.
        self.acceptor.shutdown.cancel();
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connection_count())
            .field("accepted_total", &self.accepted_total())
            .finish()
    }
}
