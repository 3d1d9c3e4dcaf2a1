//! Peek-reader connection wrapper
//!
//! Wraps a stream with a small prefix buffer so the demultiplexer can
//! inspect the first byte without consuming it, and so engines can
//! re-inject bytes they have already read (HTTP request replay). Reads
//! drain the buffer before touching the underlying stream; no byte is
//! ever lost or duplicated across the wrapper.

use bytes::BytesMut;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Stream wrapper with an unread prefix buffer
#[derive(Debug)]
pub struct PeekStream<S> {
    inner: S,
    buffer: BytesMut,
}

impl<S> PeekStream<S> {
    /// Wrap a stream with an empty prefix buffer.
    pub fn new(inner: S) -> Self {
        PeekStream {
            inner,
            buffer: BytesMut::new(),
        }
    }

    /// Wrap a stream with already-read bytes re-injected at the head.
    pub fn with_prefix(inner: S, prefix: &[u8]) -> Self {
        PeekStream {
            inner,
            buffer: BytesMut::from(prefix),
        }
    }
}

impl<S: AsyncRead + Unpin> PeekStream<S> {
    /// Return the next byte without consuming it.
    pub async fn peek_byte(&mut self) -> io::Result<u8> {
        if self.buffer.is_empty() {
            let mut byte = [0u8; 1];
            let n = self.inner.read(&mut byte).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before first byte",
                ));
            }
            self.buffer.extend_from_slice(&byte);
        }
        Ok(self.buffer[0])
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buffer.is_empty() {
            let n = self.buffer.len().min(buf.remaining());
            let head = self.buffer.split_to(n);
            buf.put_slice(&head);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
