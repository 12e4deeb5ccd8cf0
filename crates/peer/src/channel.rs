//! Framed RPC over a negotiated stream.
//!
//! A channel owns two I/O tasks: a reader that decodes one envelope at a time
//! and routes it, and a writer that drains an outbound queue. Handlers never
//! run on the reader; they run on a per-channel worker (sequential mode) or on
//! their own tasks (concurrent mode), so a slow handler cannot stall reads.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use protocol::messages::{FailureCode, FailureReason, ReversePort, REVERSE_PORT_TAG};
use protocol::stream::{BoxReader, BoxWriter};
use protocol::{
    CloseHandle, DuplexStream, Envelope, EnvelopeKind, Frame, FrameCodec, Negotiated,
    NegotiationPipeline, ProtocolError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::HandlerConcurrency;
use crate::error::{RpcError, RpcResult};
use crate::registry::{CallContext, CommandRegistry};

/// Capacity of the outbound and dispatch queues.
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// The negotiation pipeline is still running.
    Negotiating,
    /// Envelopes flow in both directions.
    Ready,
    Closed,
}

/// Per-channel behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Close the connection on an unknown tag or undecodable envelope.
    pub strict_unknown_tags: bool,
    pub concurrency: HandlerConcurrency,
}

struct Shared {
    id: Uuid,
    peer_addr: Option<SocketAddr>,
    options: ChannelOptions,
    registry: Arc<CommandRegistry>,
    codec: FrameCodec,
    /// Encoded frames waiting for the writer task.
    outbound: mpsc::Sender<Vec<u8>>,
    pending: DashMap<u64, oneshot::Sender<Envelope>>,
    next_id: AtomicU64,
    reverse_port: OnceLock<u16>,
    closed: CancellationToken,
    stream_close: CloseHandle,
    io_tasks: TaskTracker,
}

impl Shared {
    /// Marks the channel closed, closes the stream and fails pending requests.
    fn shutdown(&self, reason: &str) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.stream_close.close();
        // Dropping the senders wakes every waiting caller.
        self.pending.clear();
        info!(channel = %self.id, peer = ?self.peer_addr, reason, "Channel closed");
    }
}

/// Removes a pending request when its caller finishes or gives up.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.id);
    }
}

/// A ready RPC connection. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct RpcChannel {
    shared: Arc<Shared>,
}

impl RpcChannel {
    /// Runs `pipeline` over `stream` and starts a channel on the result.
    pub async fn establish(
        stream: DuplexStream,
        pipeline: &NegotiationPipeline,
        registry: Arc<CommandRegistry>,
        options: ChannelOptions,
    ) -> RpcResult<Self> {
        let peer = stream.peer_addr();
        trace!(peer = ?peer, state = ?ChannelState::Negotiating, "Negotiating channel");

        match pipeline.run(stream).await? {
            Negotiated::Continue(stream) => Ok(Self::spawn(stream, registry, options)),
            Negotiated::Reject => Err(RpcError::Rejected {
                peer: peer.map_or_else(|| "unknown peer".to_string(), |a| a.to_string()),
            }),
        }
    }

    /// Starts a channel on an already negotiated stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(stream: DuplexStream, registry: Arc<CommandRegistry>, options: ChannelOptions) -> Self {
        let peer_addr = stream.peer_addr();
        let stream_close = stream.close_handle();
        let (reader, writer, meta) = stream.into_parts();
        let (outbound, outbound_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);

        let channel = Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                peer_addr,
                options,
                registry,
                codec: FrameCodec::new(),
                outbound,
                pending: DashMap::new(),
                next_id: AtomicU64::new(1),
                reverse_port: OnceLock::new(),
                closed: CancellationToken::new(),
                stream_close,
                io_tasks: TaskTracker::new(),
            }),
        };

        let tasks = &channel.shared.io_tasks;
        tasks.spawn(write_loop(Arc::clone(&channel.shared), writer, outbound_rx));
        tasks.spawn(read_loop(channel.clone(), reader));
        tasks.close();

        info!(
            channel = %channel.shared.id,
            peer = ?peer_addr,
            layers = ?meta.layers(),
            state = ?ChannelState::Ready,
            "Channel ready"
        );
        channel
    }

    /// Unique id of this connection, for logs and identity checks.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    pub fn state(&self) -> ChannelState {
        if self.is_closed() {
            ChannelState::Closed
        } else {
            ChannelState::Ready
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the channel is closed, from either side.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Port the peer advertised for its own listener.
    pub fn reverse_port(&self) -> Option<u16> {
        self.shared.reverse_port.get().copied()
    }

    /// Address to reach the peer's own listener: its IP plus the advertised port.
    pub fn reverse_addr(&self) -> Option<SocketAddr> {
        let port = self.reverse_port()?;
        self.shared.peer_addr.map(|addr| SocketAddr::new(addr.ip(), port))
    }

    /// Sends a fire-and-forget command.
    ///
    /// Never waits for the peer: if the outbound queue is full the command is
    /// dropped and [`RpcError::Backpressure`] returned.
    pub async fn send_command<T: Serialize>(&self, tag: &str, payload: &T) -> RpcResult<()> {
        self.try_send_envelope(&Envelope::command(tag, payload)?)
    }

    /// Sends a request and waits for its reply.
    ///
    /// Fails with [`RpcError::ConnectionClosed`] if the channel closes first.
    pub async fn request<T, R>(&self, tag: &str, payload: &T) -> RpcResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = self.encode(&Envelope::request(tag, id, payload)?)?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };
        // Checked after inserting so a concurrent shutdown cannot miss us.
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        self.shared
            .outbound
            .send(frame)
            .await
            .map_err(|_| RpcError::ConnectionClosed)?;

        let reply = rx.await.map_err(|_| RpcError::ConnectionClosed)?;
        match reply.kind {
            EnvelopeKind::Response => Ok(reply.payload_as()?),
            EnvelopeKind::Failure => {
                let reason: FailureReason = reply.payload_as()?;
                Err(match reason.code {
                    FailureCode::UnknownTag => RpcError::UnknownTag(reply.tag),
                    FailureCode::InvalidPayload | FailureCode::HandlerFailed => {
                        RpcError::Remote(reason.message)
                    }
                })
            }
            other => Err(RpcError::Protocol(ProtocolError::Deserialization(format!(
                "unexpected {other:?} envelope in reply to request {id}"
            )))),
        }
    }

    /// Alias of [`request`](Self::request).
    pub async fn send_command_and_wait_response<T, R>(&self, tag: &str, payload: &T) -> RpcResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        self.request(tag, payload).await
    }

    /// Tells the peer which port our own listener uses.
    pub async fn advertise_reverse_port(&self, port: u16) -> RpcResult<()> {
        debug!(channel = %self.shared.id, port, "Advertising reverse port");
        self.try_send_envelope(&Envelope::reverse_port(port)?)
    }

    /// Closes the channel and waits for its I/O tasks to finish. Idempotent.
    pub async fn close(&self) {
        self.shared.shutdown("closed locally");
        self.shared.io_tasks.wait().await;
    }

    /// Closes the channel without waiting; the I/O tasks wind down on their own.
    pub(crate) fn close_now(&self, reason: &str) {
        self.shared.shutdown(reason);
    }

    fn encode(&self, envelope: &Envelope) -> RpcResult<Vec<u8>> {
        let json = envelope.to_json()?;
        Ok(self.shared.codec.encode(&Frame::new(json))?)
    }

    async fn send_envelope(&self, envelope: &Envelope) -> RpcResult<()> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        let frame = self.encode(envelope)?;
        self.shared
            .outbound
            .send(frame)
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    fn try_send_envelope(&self, envelope: &Envelope) -> RpcResult<()> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        let permit = match self.shared.outbound.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                warn!(channel = %self.shared.id, tag = %envelope.tag, "Outbound queue full, dropping command");
                return Err(RpcError::Backpressure(envelope.tag.clone()));
            }
            Err(TrySendError::Closed(())) => return Err(RpcError::ConnectionClosed),
        };
        permit.send(self.encode(envelope)?);
        Ok(())
    }

    /// Handles a protocol error; returns false if the channel must close.
    fn tolerate(&self, problem: &str) -> bool {
        warn!(channel = %self.shared.id, peer = ?self.shared.peer_addr, problem, "Dropping envelope");
        !self.shared.options.strict_unknown_tags
    }

    /// Routes one inbound envelope. Returns false to stop reading.
    async fn route(&self, envelope: Envelope, dispatcher: &Dispatcher) -> bool {
        match envelope.kind {
            EnvelopeKind::Response | EnvelopeKind::Failure => {
                let waiter = envelope
                    .correlation_id
                    .and_then(|id| self.shared.pending.remove(&id));
                match waiter {
                    Some((_, tx)) => {
                        // The caller may have given up; that is fine.
                        let _ = tx.send(envelope);
                    }
                    None => debug!(tag = %envelope.tag, "Dropping unsolicited reply"),
                }
                true
            }
            EnvelopeKind::Command | EnvelopeKind::Request => {
                if envelope.tag == REVERSE_PORT_TAG {
                    self.record_reverse_port(&envelope);
                    return true;
                }
                if envelope.kind == EnvelopeKind::Request && envelope.correlation_id.is_none() {
                    return self.tolerate("request without correlation id");
                }
                if !self.shared.registry.contains(&envelope.tag) {
                    if !self.tolerate(&format!("unknown tag {:?}", envelope.tag)) {
                        return false;
                    }
                    if let Some(id) = envelope.correlation_id {
                        let reason = FailureReason::new(
                            FailureCode::UnknownTag,
                            format!("no handler for {}", envelope.tag),
                        );
                        self.reply(Envelope::failure(envelope.tag, id, &reason)).await;
                    }
                    return true;
                }
                dispatcher.dispatch(self, envelope).await
            }
        }
    }

    fn record_reverse_port(&self, envelope: &Envelope) {
        match envelope.payload_as::<ReversePort>() {
            Ok(ReversePort { port }) if port != 0 => {
                if self.shared.reverse_port.set(port).is_ok() {
                    info!(channel = %self.shared.id, peer = ?self.shared.peer_addr, port, "Peer advertised reverse port");
                } else {
                    debug!(channel = %self.shared.id, port, "Ignoring repeated reverse port advertisement");
                }
            }
            _ => warn!(channel = %self.shared.id, "Ignoring malformed reverse port advertisement"),
        }
    }

    /// Runs the handler for one command or request and replies if needed.
    async fn handle(&self, envelope: Envelope) {
        let Some(handler) = self.shared.registry.get(&envelope.tag) else {
            return;
        };
        let Envelope {
            tag,
            kind,
            correlation_id,
            payload,
            ..
        } = envelope;

        let ctx = CallContext {
            peer: self.shared.peer_addr,
            channel: self.clone(),
        };
        let outcome = handler(ctx, payload).await;

        if let Err(reason) = &outcome {
            warn!(channel = %self.shared.id, tag = %tag, code = ?reason.code, message = %reason.message, "Handler failed");
            if reason.code == FailureCode::InvalidPayload && self.shared.options.strict_unknown_tags {
                self.shared.shutdown("undecodable payload");
                return;
            }
        }

        if let (EnvelopeKind::Request, Some(id)) = (kind, correlation_id) {
            let reply = match outcome {
                Ok(value) => Envelope::response(tag, id, &value),
                Err(reason) => Envelope::failure(tag, id, &reason),
            };
            self.reply(reply).await;
        }
    }

    async fn reply(&self, reply: protocol::Result<Envelope>) {
        let sent = match reply {
            Ok(envelope) => self.send_envelope(&envelope).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            debug!(channel = %self.shared.id, error = %e, "Failed to send reply");
        }
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("id", &self.shared.id)
            .field("peer_addr", &self.shared.peer_addr)
            .field("state", &self.state())
            .field("pending", &self.shared.pending.len())
            .finish()
    }
}

/// Hands inbound commands to handlers off the reader task.
enum Dispatcher {
    /// Queue drained by one worker, preserving arrival order.
    Sequential(mpsc::Sender<Envelope>),
    Concurrent,
}

impl Dispatcher {
    fn start(channel: &RpcChannel) -> Self {
        match channel.shared.options.concurrency {
            HandlerConcurrency::Sequential => {
                let (tx, mut rx) = mpsc::channel::<Envelope>(CHANNEL_BUFFER_SIZE);
                let worker = channel.clone();
                tokio::spawn(async move {
                    while let Some(envelope) = rx.recv().await {
                        worker.handle(envelope).await;
                    }
                });
                Dispatcher::Sequential(tx)
            }
            HandlerConcurrency::Concurrent => Dispatcher::Concurrent,
        }
    }

    async fn dispatch(&self, channel: &RpcChannel, envelope: Envelope) -> bool {
        match self {
            Dispatcher::Sequential(queue) => tokio::select! {
                _ = channel.shared.closed.cancelled() => false,
                sent = queue.send(envelope) => sent.is_ok(),
            },
            Dispatcher::Concurrent => {
                let worker = channel.clone();
                tokio::spawn(async move { worker.handle(envelope).await });
                true
            }
        }
    }
}

async fn read_loop(channel: RpcChannel, mut reader: BoxReader) {
    let shared = Arc::clone(&channel.shared);
    let dispatcher = Dispatcher::start(&channel);

    let reason = loop {
        let frame = match shared.codec.read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break "peer closed the connection",
            Err(e) if e.is_transport() => {
                debug!(channel = %shared.id, error = %e, "Read failed");
                break "transport error";
            }
            Err(e) => {
                // The byte stream cannot be resynchronised after a bad frame.
                warn!(channel = %shared.id, error = %e, "Malformed frame");
                break "malformed frame";
            }
        };

        let envelope = match Envelope::from_json(&frame.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                if channel.tolerate(&e.to_string()) {
                    continue;
                }
                break "undecodable envelope";
            }
        };

        trace!(channel = %shared.id, tag = %envelope.tag, kind = ?envelope.kind, "Received envelope");
        if !channel.route(envelope, &dispatcher).await {
            break "protocol error";
        }
    };

    shared.shutdown(reason);
}

async fn write_loop(shared: Arc<Shared>, mut writer: BoxWriter, mut outbound: mpsc::Receiver<Vec<u8>>) {
    loop {
        let frame = tokio::select! {
            _ = shared.closed.cancelled() => break,
            next = outbound.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };

        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            debug!(channel = %shared.id, error = %e, "Write failed");
            shared.shutdown("transport error");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde::Deserialize;
    use tokio::sync::Notify;

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Hello {
        text: String,
    }

    fn hello_registry() -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        registry
            .register("Hello", |_ctx, hello: Hello| async move {
                Ok(format!("Hello, {}!", hello.text))
            })
            .register("Fail", |_ctx, _: ()| async move {
                Err::<(), _>(anyhow::anyhow!("handler exploded"))
            })
            .register("Stall", |_ctx, _: ()| async move {
                std::future::pending::<()>().await;
                Ok(())
            });
        registry
    }

    fn pair_with(server: CommandRegistry, options: ChannelOptions) -> (RpcChannel, RpcChannel) {
        let (a, b) = protocol::pipe(64 * 1024);
        (
            RpcChannel::spawn(a, Arc::new(CommandRegistry::new()), ChannelOptions::default()),
            RpcChannel::spawn(b, Arc::new(server), options),
        )
    }

    fn pair() -> (RpcChannel, RpcChannel) {
        pair_with(hello_registry(), ChannelOptions::default())
    }

    #[tokio::test]
    async fn test_request_response() {
        let (client, _server) = pair();
        let reply: String = client
            .request("Hello", &Hello { text: "Bob".into() })
            .await
            .unwrap();
        assert_eq!(reply, "Hello, Bob!");
        assert_eq!(client.pending_requests(), 0);
        assert_eq!(client.state(), ChannelState::Ready);
    }

    #[tokio::test]
    async fn test_remote_handler_failure() {
        let (client, _server) = pair();
        let err = client.request::<_, ()>("Fail", &()).await.unwrap_err();
        match err {
            RpcError::Remote(message) => assert!(message.contains("handler exploded")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_payload_is_reported() {
        let (client, _server) = pair();
        let err = client
            .request::<_, String>("Hello", &serde_json::json!({"name": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote(_)));
    }

    #[tokio::test]
    async fn test_unknown_tag_keeps_connection_open() {
        let (client, server) = pair();
        client.send_command("DoesNotExist", &()).await.unwrap();

        let err = client.request::<_, ()>("DoesNotExist", &()).await.unwrap_err();
        assert!(matches!(err, RpcError::UnknownTag(tag) if tag == "DoesNotExist"));

        let reply: String = client
            .request("Hello", &Hello { text: "again".into() })
            .await
            .unwrap();
        assert_eq!(reply, "Hello, again!");
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn test_strict_mode_closes_on_unknown_tag() {
        let options = ChannelOptions {
            strict_unknown_tags: true,
            ..ChannelOptions::default()
        };
        let (client, server) = pair_with(hello_registry(), options);

        let err = client.request::<_, ()>("DoesNotExist", &()).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
        tokio::time::timeout(Duration::from_secs(5), server.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_request_fails_when_connection_closes() {
        let (client, server) = pair();
        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.request::<_, ()>("Stall", &()).await })
        };

        // Wait until the request is in flight, then drop the connection.
        while client.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        server.close().await;

        let err = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_observable() {
        let (client, server) = pair();
        client.close().await;
        client.close().await;
        assert!(client.is_closed());
        assert_eq!(client.state(), ChannelState::Closed);

        let err = client.send_command("Hello", &()).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));

        tokio::time::timeout(Duration::from_secs(5), server.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sequential_commands_run_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CommandRegistry::new();
        let sink = Arc::clone(&seen);
        registry
            .register("Record", move |_ctx, n: u32| {
                let sink = Arc::clone(&sink);
                async move {
                    // Later commands finish faster; order must still hold.
                    tokio::time::sleep(Duration::from_millis(u64::from(10 - n % 10))).await;
                    sink.lock().unwrap().push(n);
                    Ok(())
                }
            })
            .register("Sync", |_ctx, _: ()| async move { Ok(()) });
        let (client, _server) = pair_with(registry, ChannelOptions::default());

        for n in 0..50u32 {
            client.send_command("Record", &n).await.unwrap();
        }
        client.request::<_, ()>("Sync", &()).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrent_mode_runs_handlers_in_parallel() {
        let gate = Arc::new(Notify::new());
        let mut registry = CommandRegistry::new();
        let wait_gate = Arc::clone(&gate);
        let open_gate = Arc::clone(&gate);
        registry
            .register("Wait", move |_ctx, _: ()| {
                let gate = Arc::clone(&wait_gate);
                async move {
                    gate.notified().await;
                    Ok("released")
                }
            })
            .register("Open", move |_ctx, _: ()| {
                let gate = Arc::clone(&open_gate);
                async move {
                    gate.notify_one();
                    Ok("opened")
                }
            });
        let options = ChannelOptions {
            concurrency: HandlerConcurrency::Concurrent,
            ..ChannelOptions::default()
        };
        let (client, _server) = pair_with(registry, options);

        let waiting = {
            let client = client.clone();
            tokio::spawn(async move { client.request::<_, String>("Wait", &()).await })
        };
        let opened: String = client.request("Open", &()).await.unwrap();
        assert_eq!(opened, "opened");

        let released = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(released, "released");
    }

    #[tokio::test]
    async fn test_commands_do_not_block_on_a_stalled_peer() {
        // The far end is never read, so the pipe and then the queue fill up.
        let (local, _stalled) = protocol::pipe(64 * 1024);
        let channel = RpcChannel::spawn(local, Arc::new(CommandRegistry::new()), ChannelOptions::default());
        let chunk = "terminal output\n".repeat(4 * 1024);

        let dropped = tokio::time::timeout(Duration::from_secs(5), async {
            let mut dropped = 0;
            for _ in 0..2000 {
                match channel.send_command("Output", &chunk).await {
                    Ok(()) => {}
                    Err(RpcError::Backpressure(tag)) => {
                        assert_eq!(tag, "Output");
                        dropped += 1;
                    }
                    Err(other) => panic!("unexpected error: {other:?}"),
                }
            }
            dropped
        })
        .await
        .expect("send_command waited on a stalled peer");

        assert!(dropped > 0);
        assert!(!channel.is_closed());
        channel.close().await;
    }

    #[tokio::test]
    async fn test_reverse_port_advertisement() {
        let (client, server) = pair();
        assert_eq!(server.reverse_port(), None);

        client.advertise_reverse_port(4242).await.unwrap();
        // Envelopes are processed in order, so the request acts as a barrier.
        let _: String = client
            .request("Hello", &Hello { text: "x".into() })
            .await
            .unwrap();

        assert_eq!(server.reverse_port(), Some(4242));
        // In-memory pipes have no address to combine the port with.
        assert_eq!(server.reverse_addr(), None);
    }

    #[tokio::test]
    async fn test_handler_can_call_back_over_its_channel() {
        let (notice_tx, mut notice_rx) = mpsc::channel::<String>(1);
        let mut client_registry = CommandRegistry::new();
        client_registry.register("Notice", move |_ctx, text: String| {
            let notice_tx = notice_tx.clone();
            async move {
                notice_tx.send(text).await?;
                Ok(())
            }
        });

        let mut server_registry = CommandRegistry::new();
        server_registry.register("Ask", |ctx: CallContext, _: ()| async move {
            ctx.channel.send_command("Notice", &"called back").await?;
            Ok(())
        });

        let (a, b) = protocol::pipe(64 * 1024);
        let client = RpcChannel::spawn(a, Arc::new(client_registry), ChannelOptions::default());
        let _server = RpcChannel::spawn(b, Arc::new(server_registry), ChannelOptions::default());

        client.request::<_, ()>("Ask", &()).await.unwrap();
        let notice = tokio::time::timeout(Duration::from_secs(5), notice_rx.recv())
            .await
            .unwrap();
        assert_eq!(notice.as_deref(), Some("called back"));
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_dropped() {
        let (raw, b) = protocol::pipe(64 * 1024);
        let _server = RpcChannel::spawn(b, Arc::new(hello_registry()), ChannelOptions::default());
        let (mut raw_reader, mut raw_writer, _meta) = raw.into_parts();
        let codec = FrameCodec::new();

        codec
            .write_frame(&mut raw_writer, &Frame::new(b"{not json".to_vec()))
            .await
            .unwrap();
        let request = Envelope::request("Hello", 9, &Hello { text: "raw".into() }).unwrap();
        codec
            .write_frame(&mut raw_writer, &Frame::new(request.to_json().unwrap()))
            .await
            .unwrap();

        let frame = codec.read_frame(&mut raw_reader).await.unwrap().unwrap();
        let reply = Envelope::from_json(&frame.payload).unwrap();
        assert_eq!(reply.kind, EnvelopeKind::Response);
        assert_eq!(reply.correlation_id, Some(9));
        assert_eq!(reply.payload_as::<String>().unwrap(), "Hello, raw!");
    }

    #[tokio::test]
    async fn test_establish_reports_rejection() {
        use protocol::SharedSecretGateStep;

        let (a, b) = protocol::pipe(64 * 1024);
        let left = NegotiationPipeline::new().with_step(SharedSecretGateStep::new("alpha"));
        let right = NegotiationPipeline::new().with_step(SharedSecretGateStep::new("bravo"));
        let registry = Arc::new(CommandRegistry::new());

        let (ra, rb) = tokio::join!(
            RpcChannel::establish(a, &left, Arc::clone(&registry), ChannelOptions::default()),
            RpcChannel::establish(b, &right, registry, ChannelOptions::default()),
        );
        assert!(matches!(ra, Err(RpcError::Rejected { .. })));
        assert!(matches!(rb, Err(RpcError::Rejected { .. })));
    }
}
