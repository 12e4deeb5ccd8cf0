//! Byte-level duplex streams with replaceable read/write layers.
//!
//! A [`DuplexStream`] owns one reader and one writer. Negotiation steps
//! re-wrap them (plaintext → encrypted, plaintext → TLS) by moving the current
//! reader or writer *into* a new layer, so every earlier layer stays active
//! underneath the new one.
//!
//! The innermost layer of every stream is a close-aware adapter bound to the
//! stream's [`CloseHandle`]. Closing the handle fails any pending or future
//! read/write at the transport level, which is how a task stuck in I/O on a
//! slow peer gets unblocked from the outside.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Boxed reader half of a stream.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed writer half of a stream.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Name of the innermost layer of every stream.
pub const TRANSPORT_LAYER: &str = "transport";

/// Shared handle that closes a stream from anywhere.
///
/// Cloning the handle is cheap; all clones observe the same state. Closing is
/// idempotent.
#[derive(Debug, Clone, Default)]
pub struct CloseHandle {
    token: CancellationToken,
}

impl CloseHandle {
    /// Creates a new open handle.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Closes the stream. Safe to call any number of times.
    pub fn close(&self) {
        if !self.token.is_cancelled() {
            tracing::trace!("Closing stream");
        }
        self.token.cancel();
    }

    /// Returns whether the stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits until the stream is closed.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream closed locally")
}

/// Innermost adapter: fails I/O once the owning stream is closed.
struct CloseAware<T> {
    inner: T,
    token: CancellationToken,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<T> CloseAware<T> {
    fn new(inner: T, handle: &CloseHandle) -> Self {
        let token = handle.token();
        let closed = Box::pin(token.clone().cancelled_owned());
        Self {
            inner,
            token,
            closed,
        }
    }

    /// Registers interest in closure and reports whether it already happened.
    fn poll_closed(&mut self, cx: &mut Context<'_>) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        self.closed.as_mut().poll(cx).is_ready()
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for CloseAware<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for CloseAware<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Everything about a stream except its reader and writer.
#[derive(Debug, Clone)]
pub struct StreamMeta {
    close: CloseHandle,
    peer_addr: Option<SocketAddr>,
    layers: Vec<&'static str>,
}

impl StreamMeta {
    /// Returns the close handle shared by every layer of the stream.
    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// Returns the remote address, if the transport has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Returns the layer names, innermost first.
    pub fn layers(&self) -> &[&'static str] {
        &self.layers
    }
}

/// A reader and writer joined back into one `AsyncRead + AsyncWrite` object.
///
/// Used to hand a stream to libraries that want a single I/O object, such as
/// a TLS connector.
pub struct Joined {
    reader: BoxReader,
    writer: BoxWriter,
}

impl AsyncRead for Joined {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for Joined {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

/// A bidirectional byte stream with independently replaceable layers.
pub struct DuplexStream {
    reader: BoxReader,
    writer: BoxWriter,
    meta: StreamMeta,
}

impl DuplexStream {
    /// Wraps an accepted or connected TCP socket.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        Self::from_split(reader, writer, peer_addr)
    }

    /// Builds a stream from an already split reader and writer.
    pub fn from_split<R, W>(reader: R, writer: W, peer_addr: Option<SocketAddr>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let close = CloseHandle::new();
        Self {
            reader: Box::new(CloseAware::new(reader, &close)),
            writer: Box::new(CloseAware::new(writer, &close)),
            meta: StreamMeta {
                close,
                peer_addr,
                layers: vec![TRANSPORT_LAYER],
            },
        }
    }

    /// Builds a stream from a single I/O object, e.g. one end of an in-memory pipe.
    pub fn from_io<T>(io: T, peer_addr: Option<SocketAddr>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::from_split(reader, writer, peer_addr)
    }

    /// Replaces the active reader with a layer built on top of it.
    pub fn wrap_reader<F, R>(self, layer: &'static str, wrap: F) -> Self
    where
        F: FnOnce(BoxReader) -> R,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let Self {
            reader,
            writer,
            mut meta,
        } = self;
        meta.layers.push(layer);
        Self {
            reader: Box::new(wrap(reader)),
            writer,
            meta,
        }
    }

    /// Replaces the active writer with a layer built on top of it.
    pub fn wrap_writer<F, W>(self, layer: &'static str, wrap: F) -> Self
    where
        F: FnOnce(BoxWriter) -> W,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let Self {
            reader,
            writer,
            mut meta,
        } = self;
        meta.layers.push(layer);
        Self {
            reader,
            writer: Box::new(wrap(writer)),
            meta,
        }
    }

    /// Joins the active reader and writer into one I/O object.
    pub fn into_joined(self) -> (Joined, StreamMeta) {
        (
            Joined {
                reader: self.reader,
                writer: self.writer,
            },
            self.meta,
        )
    }

    /// Rebuilds a stream around an I/O object that wraps a previously joined stream.
    pub fn from_joined<T>(io: T, mut meta: StreamMeta, layer: &'static str) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        meta.layers.push(layer);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            meta,
        }
    }

    /// Splits the stream into its active reader, writer and metadata.
    pub fn into_parts(self) -> (BoxReader, BoxWriter, StreamMeta) {
        (self.reader, self.writer, self.meta)
    }

    /// Returns a handle that closes this stream.
    pub fn close_handle(&self) -> CloseHandle {
        self.meta.close_handle()
    }

    /// Closes the stream. Idempotent.
    pub fn close(&self) {
        self.meta.close.close();
    }

    /// Returns whether the stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.meta.close.is_closed()
    }

    /// Returns the remote address, if the transport has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.meta.peer_addr
    }

    /// Returns the layer names, innermost first.
    pub fn layers(&self) -> &[&'static str] {
        self.meta.layers()
    }
}

impl AsyncRead for DuplexStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for DuplexStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for DuplexStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexStream")
            .field("peer_addr", &self.meta.peer_addr)
            .field("layers", &self.meta.layers)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Creates a connected pair of in-memory streams.
///
/// Handy for exercising negotiation steps without sockets.
pub fn pipe(max_buf_size: usize) -> (DuplexStream, DuplexStream) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (DuplexStream::from_io(a, None), DuplexStream::from_io(b, None))
}
