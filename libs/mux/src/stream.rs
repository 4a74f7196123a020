//! Stream handle.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::session::SessionInner;

/// Lifecycle of a stream as seen from this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    /// We sent `CLOSE`; the peer may still write.
    HalfClosedLocal,
    /// The peer sent `CLOSE`; we may still write.
    HalfClosedRemote,
    Closed,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One bidirectional byte stream inside a [`crate::Session`].
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]. `shutdown` sends a
/// half-close; dropping a stream that is still open resets it.
pub struct Stream {
    id: u32,
    session: Arc<SessionInner>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
    /// Bytes consumed since the last window update.
    unacked: u32,
    eof: bool,
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        session: Arc<SessionInner>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            id,
            session,
            inbound,
            pending: Bytes::new(),
            unacked: 0,
            eof: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.session
            .stream_snapshot(self.id)
            .map(|(state, _, _)| state)
            .unwrap_or(StreamState::Reset)
    }

    pub fn stats(&self) -> StreamStats {
        let (bytes_sent, bytes_received) = self
            .session
            .stream_snapshot(self.id)
            .map(|(_, sent, received)| (sent, received))
            .unwrap_or((0, 0));
        StreamStats {
            bytes_sent,
            bytes_received,
        }
    }

    /// Abort the stream in both directions.
    pub fn reset(&self) {
        self.session.reset_stream(self.id);
    }

    fn consumed(&mut self, n: usize) {
        self.unacked = self.unacked.saturating_add(n as u32);
        if self.unacked >= self.session.config.initial_window / 2 {
            self.session.grant_credit(self.id, self.unacked);
            self.unacked = 0;
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.eof || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        while this.pending.is_empty() {
            match this.inbound.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.pending = chunk,
                Poll::Ready(None) => {
                    this.session.inbound_finished(this.id)?;
                    this.eof = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending[..n]);
        this.pending.advance(n);
        this.consumed(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.session.poll_write(cx, self.id, data)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are queued to the session writer, which flushes each batch.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.session.shutdown_stream(self.id))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.session.release(self.id);
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.id).finish()
    }
}
