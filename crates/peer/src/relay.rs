//! Two-hop TCP relay.
//!
//! ```text
//! local app ──raw──▶ Entry ══negotiated══▶ Exit ──raw──▶ target
//! ```
//!
//! The Entry runs an outgoing pipeline on the stream it opens to the Exit; the
//! Exit runs an incoming pipeline on what it accepts. Only after both succeed
//! are bytes spliced, so a rejected tunnel never carries application data.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use protocol::stream::{BoxReader, BoxWriter};
use protocol::{DuplexStream, Negotiated, NegotiationPipeline};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::error::{RpcError, RpcResult};

const SPLICE_BUFFER_SIZE: usize = 16 * 1024;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Bytes copied in each direction by [`splice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copies bytes both ways between `a` and `b` until either side ends.
///
/// EOF or an error in one direction closes both streams, which stops the
/// other direction; both copies have finished when this returns.
pub async fn splice(a: DuplexStream, b: DuplexStream) -> SpliceStats {
    let a_close = a.close_handle();
    let b_close = b.close_handle();
    let close_both = || {
        a_close.close();
        b_close.close();
    };

    let (a_reader, a_writer, _) = a.into_parts();
    let (b_reader, b_writer, _) = b.into_parts();

    let (a_to_b, b_to_a) = tokio::join!(
        async {
            let copied = pump(a_reader, b_writer).await;
            close_both();
            copied
        },
        async {
            let copied = pump(b_reader, a_writer).await;
            close_both();
            copied
        },
    );
    SpliceStats { a_to_b, b_to_a }
}

async fn pump(mut reader: BoxReader, mut writer: BoxWriter) -> u64 {
    let mut buf = vec![0u8; SPLICE_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Splice read ended");
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            debug!(error = %e, "Splice write ended");
            break;
        }
        if let Err(e) = writer.flush().await {
            debug!(error = %e, "Splice flush ended");
            break;
        }
        copied += n as u64;
    }
    let _ = writer.shutdown().await;
    copied
}

/// Maps the connecting Entry's address to a target; `None` rejects the tunnel.
pub type TargetResolver = Arc<dyn Fn(Option<SocketAddr>) -> Option<(String, u16)> + Send + Sync>;

/// Where an Exit forwards accepted tunnels.
#[derive(Clone)]
pub enum RelayTarget {
    Static { host: String, port: u16 },
    /// Chosen per tunnel, after negotiation.
    Dynamic(TargetResolver),
}

impl RelayTarget {
    pub fn fixed(host: impl Into<String>, port: u16) -> Self {
        RelayTarget::Static {
            host: host.into(),
            port,
        }
    }

    pub fn dynamic<F>(resolver: F) -> Self
    where
        F: Fn(Option<SocketAddr>) -> Option<(String, u16)> + Send + Sync + 'static,
    {
        RelayTarget::Dynamic(Arc::new(resolver))
    }

    fn resolve(&self, entry: Option<SocketAddr>) -> Option<(String, u16)> {
        match self {
            RelayTarget::Static { host, port } => Some((host.clone(), *port)),
            RelayTarget::Dynamic(resolver) => resolver(entry),
        }
    }
}

impl fmt::Debug for RelayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayTarget::Static { host, port } => write!(f, "Static({host}:{port})"),
            RelayTarget::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Entry side: local listener, forwards to an Exit.
#[derive(Debug, Clone)]
pub struct EntryConfig {
    pub listen_host: String,
    /// 0 picks an ephemeral port.
    pub listen_port: u16,
    pub exit_host: String,
    pub exit_port: u16,
    /// Run on the stream to the Exit.
    pub pipeline: NegotiationPipeline,
}

impl EntryConfig {
    /// Listens on an ephemeral loopback port.
    pub fn new(exit_host: impl Into<String>, exit_port: u16, pipeline: NegotiationPipeline) -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            exit_host: exit_host.into(),
            exit_port,
            pipeline,
        }
    }

    /// Reads `[relay]` and uses the outgoing pipeline.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let relay = &config.relay;
        let (Some(exit_host), Some(exit_port)) = (relay.exit_host.clone(), relay.exit_port) else {
            return Err(ConfigError::IncompleteRelayAddress("exit")).context("Invalid [relay] section");
        };
        Ok(Self {
            listen_host: relay.listen_host.clone(),
            listen_port: relay.listen_port,
            exit_host,
            exit_port,
            pipeline: config.outgoing_pipeline()?,
        })
    }
}

/// Exit side: accepts tunnels from Entries and forwards to a target.
#[derive(Debug, Clone)]
pub struct ExitConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub target: RelayTarget,
    /// Run on each accepted stream.
    pub pipeline: NegotiationPipeline,
}

impl ExitConfig {
    /// Listens on an ephemeral loopback port.
    pub fn new(target: RelayTarget, pipeline: NegotiationPipeline) -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            target,
            pipeline,
        }
    }

    /// Reads `[relay]` with a static target and uses the incoming pipeline.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let relay = &config.relay;
        let (Some(host), Some(port)) = (relay.target_host.clone(), relay.target_port) else {
            return Err(ConfigError::IncompleteRelayAddress("target")).context("Invalid [relay] section");
        };
        Ok(Self {
            listen_host: relay.listen_host.clone(),
            listen_port: relay.listen_port,
            target: RelayTarget::Static { host, port },
            pipeline: config.incoming_pipeline()?,
        })
    }
}

/// A relay role to start.
#[derive(Debug, Clone)]
pub enum TcpRelay {
    Entry(EntryConfig),
    Exit(ExitConfig),
}

impl TcpRelay {
    pub async fn init_entry(config: EntryConfig) -> RpcResult<RelayHandle> {
        TcpRelay::Entry(config).init().await
    }

    pub async fn init_exit(config: ExitConfig) -> RpcResult<RelayHandle> {
        TcpRelay::Exit(config).init().await
    }

    /// Binds the listener and starts accepting tunnels.
    pub async fn init(self) -> RpcResult<RelayHandle> {
        let (host, port) = match &self {
            TcpRelay::Entry(c) => (c.listen_host.as_str(), c.listen_port),
            TcpRelay::Exit(c) => (c.listen_host.as_str(), c.listen_port),
        };
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;

        match &self {
            TcpRelay::Entry(c) => info!(
                addr = %local_addr,
                exit = %format!("{}:{}", c.exit_host, c.exit_port),
                steps = ?c.pipeline.step_names(),
                "Relay entry listening"
            ),
            TcpRelay::Exit(c) => info!(
                addr = %local_addr,
                target = ?c.target,
                steps = ?c.pipeline.step_names(),
                "Relay exit listening"
            ),
        }

        let state = Arc::new(RelayState {
            role: self,
            active: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        state.tasks.spawn(Arc::clone(&state).accept_loop(listener));

        Ok(RelayHandle { local_addr, state })
    }
}

struct RelayState {
    role: TcpRelay,
    active: AtomicUsize,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Counts a tunnel as active for its lifetime.
struct ActiveTunnel<'a>(&'a AtomicUsize);

impl<'a> ActiveTunnel<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveTunnel<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RelayState {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((tcp, addr)) => {
                    let state = Arc::clone(&self);
                    self.tasks.spawn(async move {
                        let _active = ActiveTunnel::enter(&state.active);
                        // Dropping the tunnel future drops both sockets.
                        tokio::select! {
                            _ = state.shutdown.cancelled() => {
                                debug!(peer = %addr, "Tunnel cancelled by shutdown");
                            }
                            result = state.tunnel(tcp, addr) => match result {
                                Ok(stats) => debug!(
                                    peer = %addr,
                                    sent = stats.a_to_b,
                                    received = stats.b_to_a,
                                    "Tunnel closed"
                                ),
                                Err(RpcError::Rejected { peer }) => {
                                    info!(peer = %peer, "Tunnel rejected");
                                }
                                Err(e) => warn!(peer = %addr, error = %e, "Tunnel failed"),
                            },
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Relay accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
        debug!("Relay accept loop stopped");
    }

    async fn tunnel(&self, tcp: TcpStream, addr: SocketAddr) -> RpcResult<SpliceStats> {
        match &self.role {
            TcpRelay::Entry(config) => entry_tunnel(config, tcp).await,
            TcpRelay::Exit(config) => exit_tunnel(config, tcp, addr).await,
        }
    }
}

/// Stats are reported as local app → Exit and back.
async fn entry_tunnel(config: &EntryConfig, local: TcpStream) -> RpcResult<SpliceStats> {
    let local = DuplexStream::from_tcp(local);
    let exit = TcpStream::connect((config.exit_host.as_str(), config.exit_port)).await?;
    let exit = DuplexStream::from_tcp(exit);
    let exit_addr = exit.peer_addr();

    match config.pipeline.run(exit).await? {
        Negotiated::Continue(exit) => Ok(splice(local, exit).await),
        Negotiated::Reject => Err(rejected(exit_addr)),
    }
}

/// Stats are reported as Entry → target and back.
async fn exit_tunnel(config: &ExitConfig, tcp: TcpStream, addr: SocketAddr) -> RpcResult<SpliceStats> {
    let inbound = match config.pipeline.run(DuplexStream::from_tcp(tcp)).await? {
        Negotiated::Continue(stream) => stream,
        Negotiated::Reject => return Err(rejected(Some(addr))),
    };

    let Some((host, port)) = config.target.resolve(Some(addr)) else {
        debug!(peer = %addr, "No target for tunnel");
        inbound.close();
        return Err(rejected(Some(addr)));
    };

    let target = match TcpStream::connect((host.as_str(), port)).await {
        Ok(target) => target,
        Err(e) => {
            inbound.close();
            return Err(e.into());
        }
    };
    debug!(peer = %addr, target = %format!("{host}:{port}"), "Tunnel established");
    Ok(splice(inbound, DuplexStream::from_tcp(target)).await)
}

fn rejected(peer: Option<SocketAddr>) -> RpcError {
    RpcError::Rejected {
        peer: peer.map_or_else(|| "unknown peer".to_string(), |a| a.to_string()),
    }
}

/// A running relay.
pub struct RelayHandle {
    local_addr: SocketAddr,
    state: Arc<RelayState>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Tunnels accepted and not yet torn down, including ones still negotiating.
    pub fn active_tunnels(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Stops accepting, tears down every tunnel and waits for them. Idempotent.
    pub async fn shutdown(&self) {
        self.state.shutdown.cancel();
        self.state.tasks.close();
        self.state.tasks.wait().await;
        info!(addr = %self.local_addr, "Relay stopped");
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
    }
}

impl fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayHandle")
            .field("local_addr", &self.local_addr)
            .field("active_tunnels", &self.active_tunnels())
            .finish()
    }
}
