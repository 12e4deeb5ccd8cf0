//! Reader and writer layers that apply an AES-CTR keystream.
//!
//! CTR mode is byte granular, so these layers never change how many bytes
//! flow through a stream, only their values.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::StreamCipher;

/// Largest chunk a [`CipherWriter`] accepts per write call.
const MAX_WRITE_CHUNK: usize = 64 * 1024;

/// Decrypts everything read from the inner reader.
#[derive(Debug)]
pub struct CipherReader<R> {
    inner: R,
    cipher: StreamCipher,
}

impl<R> CipherReader<R> {
    pub fn new(inner: R, cipher: StreamCipher) -> Self {
        Self { inner, cipher }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CipherReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.cipher.apply(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

/// Encrypts everything written before passing it to the inner writer.
///
/// Keystream bytes are consumed as soon as a write is accepted, so accepted
/// ciphertext is parked in `pending` until the inner writer takes all of it.
#[derive(Debug)]
pub struct CipherWriter<W> {
    inner: W,
    cipher: StreamCipher,
    pending: Vec<u8>,
    written: usize,
}

impl<W> CipherWriter<W> {
    pub fn new(inner: W, cipher: StreamCipher) -> Self {
        Self {
            inner,
            cipher,
            pending: Vec::new(),
            written: 0,
        }
    }
}

impl<W: AsyncWrite + Unpin> CipherWriter<W> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write encrypted data",
                )));
            }
            self.written += n;
        }
        self.pending.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CipherWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let accepted = buf.len().min(MAX_WRITE_CHUNK);
        this.pending.extend_from_slice(&buf[..accepted]);
        this.cipher.apply(&mut this.pending);

        // The data is ours now; push what the inner writer takes right away.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(accepted))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
