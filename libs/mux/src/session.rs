//! Session: one transport, many streams.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::frame::{Frame, FrameKind, MAX_DATA_CHUNK};
use crate::stream::{Stream, StreamState};
use crate::MuxError;

/// Default per-stream receive window.
pub const DEFAULT_INITIAL_WINDOW: u32 = 256 * 1024;

/// Default number of opened-but-not-accepted streams before new opens are reset.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 256;

/// Writer batches at most this many bytes before flushing.
const WRITE_BATCH_BYTES: usize = 256 * 1024;

/// Which end of the transport this session is. Decides stream id parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that dialed; opens odd stream ids.
    Client,
    /// The side that accepted; opens even stream ids.
    Server,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    fn opens(self, stream_id: u32) -> bool {
        match self {
            Role::Client => stream_id % 2 == 1,
            Role::Server => stream_id != 0 && stream_id % 2 == 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Receive window granted to the peer for every new stream.
    pub initial_window: u32,
    pub accept_backlog: usize,
    /// Send `PING` this often. `None` disables keepalive.
    pub keepalive_interval: Option<Duration>,
    /// Close the session when nothing arrived for this long.
    pub keepalive_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            initial_window: DEFAULT_INITIAL_WINDOW,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            keepalive_interval: None,
            keepalive_timeout: Duration::from_secs(30),
        }
    }
}

impl MuxConfig {
    pub fn with_keepalive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self.keepalive_timeout = timeout;
        self
    }
}

/// Point-in-time session counters.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub streams_opened: u64,
    pub streams_accepted: u64,
    pub active_streams: usize,
    pub last_activity_unix_ms: u64,
}

pub(crate) struct StreamEntry {
    pub(crate) state: StreamState,
    /// Bytes we may still send before the peer grants more.
    pub(crate) send_window: u32,
    /// Bytes the peer may still send before we grant more.
    pub(crate) recv_window: u32,
    pub(crate) inbound: Option<mpsc::UnboundedSender<Bytes>>,
    pub(crate) write_waker: Option<Waker>,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_received: u64,
}

impl StreamEntry {
    fn new(window: u32, inbound: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            state: StreamState::Open,
            send_window: window,
            recv_window: window,
            inbound: Some(inbound),
            write_waker: None,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

enum WriterMsg {
    Frame(Frame),
    Shutdown,
}

pub(crate) struct SessionInner {
    role: Role,
    pub(crate) config: MuxConfig,
    streams: Mutex<HashMap<u32, StreamEntry>>,
    writer_tx: mpsc::UnboundedSender<WriterMsg>,
    accept_tx: Mutex<Option<mpsc::Sender<Stream>>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
    next_stream_id: AtomicU32,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    last_activity_ms: AtomicU64,
    streams_opened: AtomicU64,
    streams_accepted: AtomicU64,
}

/// A multiplexed session over one transport.
///
/// Dropping the session closes it and resets every stream.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Wrap `io` and spawn the reader and writer tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<T>(io: T, role: Role, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let (closed_tx, _) = watch::channel(false);

        let keepalive = config.keepalive_interval;
        let inner = Arc::new(SessionInner {
            role,
            config,
            streams: Mutex::new(HashMap::new()),
            writer_tx,
            accept_tx: Mutex::new(Some(accept_tx)),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            closed: AtomicBool::new(false),
            closed_tx,
            last_activity_ms: AtomicU64::new(now_unix_ms()),
            streams_opened: AtomicU64::new(0),
            streams_accepted: AtomicU64::new(0),
        });

        tokio::spawn(read_loop(Arc::clone(&inner), reader));
        tokio::spawn(write_loop(Arc::clone(&inner), writer, writer_rx));
        if let Some(interval) = keepalive {
            tokio::spawn(keepalive_loop(Arc::clone(&inner), interval));
        }

        Self { inner }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Open a new outbound stream. The peer sees it on its next `accept`.
    pub fn open_stream(&self) -> Result<Stream, MuxError> {
        if self.inner.is_closed() {
            return Err(MuxError::SessionClosed);
        }

        let id = self
            .inner
            .next_stream_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| id.checked_add(2))
            .map_err(|_| MuxError::StreamIdsExhausted)?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock_streams()
            .insert(id, StreamEntry::new(self.inner.config.initial_window, tx));

        let stream = Stream::new(id, Arc::clone(&self.inner), rx);
        self.inner.send_frame(Frame::open(id))?;
        self.inner.streams_opened.fetch_add(1, Ordering::Relaxed);
        trace!(stream_id = id, "stream opened");
        Ok(stream)
    }

    /// Wait for the peer to open a stream. `None` once the session closed,
    /// even if streams were still queued.
    pub async fn accept(&self) -> Option<Stream> {
        let mut rx = self.inner.accept_rx.lock().await;
        let stream = rx.recv().await;
        if self.inner.is_closed() {
            // `close` skips the drain while an accept holds the queue.
            rx.close();
            while rx.try_recv().is_ok() {}
            return None;
        }
        stream
    }

    /// Close the session. Every open stream observes an error.
    pub fn close(&self) {
        self.inner.close("closed locally");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Resolves once the session is closed, for any reason.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn last_activity_unix_ms(&self) -> u64 {
        self.inner.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            streams_opened: self.inner.streams_opened.load(Ordering::Relaxed),
            streams_accepted: self.inner.streams_accepted.load(Ordering::Relaxed),
            active_streams: self.inner.lock_streams().len(),
            last_activity_unix_ms: self.last_activity_unix_ms(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.close("session dropped");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.inner.role)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl SessionInner {
    pub(crate) fn lock_streams(&self) -> MutexGuard<'_, HashMap<u32, StreamEntry>> {
        // A panic while holding the lock leaves the table consistent: every
        // mutation is a single field update.
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn send_frame(&self, frame: Frame) -> Result<(), MuxError> {
        self.writer_tx
            .send(WriterMsg::Frame(frame))
            .map_err(|_| MuxError::SessionClosed)
    }

    fn touch(&self) {
        self.last_activity_ms.store(now_unix_ms(), Ordering::Relaxed);
    }

    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(role = ?self.role, reason, "mux session closing");

        {
            let mut streams = self.lock_streams();
            for entry in streams.values_mut() {
                entry.inbound = None;
                entry.wake_writer();
            }
        }

        if let Ok(mut guard) = self.accept_tx.lock() {
            guard.take();
        }
        if let Ok(mut rx) = self.accept_rx.try_lock() {
            rx.close();
            while rx.try_recv().is_ok() {}
        }

        let _ = self.writer_tx.send(WriterMsg::Shutdown);
        self.closed_tx.send_replace(true);
    }

    // -------------------------------------------------------------------------
    // Stream-facing operations
    // -------------------------------------------------------------------------

    pub(crate) fn poll_write(
        &self,
        cx: &mut Context<'_>,
        id: u32,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.is_closed() {
            return Poll::Ready(Err(MuxError::SessionClosed.into()));
        }

        let mut streams = self.lock_streams();
        let Some(entry) = streams.get_mut(&id) else {
            return Poll::Ready(Err(MuxError::StreamReset(id).into()));
        };

        match entry.state {
            StreamState::Reset => return Poll::Ready(Err(MuxError::StreamReset(id).into())),
            StreamState::HalfClosedLocal | StreamState::Closed => {
                return Poll::Ready(Err(MuxError::WriteClosed(id).into()))
            }
            StreamState::Open | StreamState::HalfClosedRemote => {}
        }

        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if entry.send_window == 0 {
            entry.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = data
            .len()
            .min(entry.send_window as usize)
            .min(MAX_DATA_CHUNK);
        entry.send_window -= n as u32;
        entry.bytes_sent += n as u64;

        let frame = Frame::data(id, Bytes::copy_from_slice(&data[..n]));
        if let Err(e) = self.send_frame(frame) {
            return Poll::Ready(Err(e.into()));
        }
        Poll::Ready(Ok(n))
    }

    /// Half-close the local side.
    pub(crate) fn shutdown_stream(&self, id: u32) -> io::Result<()> {
        let mut streams = self.lock_streams();
        let Some(entry) = streams.get_mut(&id) else {
            return Err(MuxError::StreamReset(id).into());
        };

        let next = match entry.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            StreamState::HalfClosedLocal | StreamState::Closed => return Ok(()),
            StreamState::Reset => return Err(MuxError::StreamReset(id).into()),
        };

        if self.is_closed() {
            return Err(MuxError::SessionClosed.into());
        }

        entry.state = next;
        self.send_frame(Frame::close(id))?;
        Ok(())
    }

    pub(crate) fn reset_stream(&self, id: u32) {
        let mut streams = self.lock_streams();
        if let Some(entry) = streams.get_mut(&id) {
            if matches!(entry.state, StreamState::Closed | StreamState::Reset) {
                return;
            }
            entry.state = StreamState::Reset;
            entry.inbound = None;
            entry.wake_writer();
            let _ = self.send_frame(Frame::reset(id));
        }
    }

    /// Return `n` bytes of receive credit to the peer.
    pub(crate) fn grant_credit(&self, id: u32, n: u32) {
        let mut streams = self.lock_streams();
        if let Some(entry) = streams.get_mut(&id) {
            if matches!(entry.state, StreamState::Open | StreamState::HalfClosedLocal) {
                entry.recv_window = entry.recv_window.saturating_add(n);
                let _ = self.send_frame(Frame::window(id, n));
            }
        }
    }

    /// The inbound queue ended; decide between clean EOF and failure.
    pub(crate) fn inbound_finished(&self, id: u32) -> io::Result<()> {
        let streams = self.lock_streams();
        match streams.get(&id).map(|e| e.state) {
            Some(StreamState::HalfClosedRemote | StreamState::Closed) => Ok(()),
            Some(StreamState::Reset) => Err(MuxError::StreamReset(id).into()),
            _ => Err(MuxError::SessionClosed.into()),
        }
    }

    /// Forget a stream whose handle was dropped.
    pub(crate) fn release(&self, id: u32) {
        let removed = self.lock_streams().remove(&id);
        if let Some(entry) = removed {
            let abandoned = matches!(entry.state, StreamState::Open | StreamState::HalfClosedRemote);
            if abandoned && !self.is_closed() {
                let _ = self.send_frame(Frame::reset(id));
            }
        }
    }

    pub(crate) fn stream_snapshot(&self, id: u32) -> Option<(StreamState, u64, u64)> {
        self.lock_streams()
            .get(&id)
            .map(|e| (e.state, e.bytes_sent, e.bytes_received))
    }

    // -------------------------------------------------------------------------
    // Inbound frames
    // -------------------------------------------------------------------------

    fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<(), MuxError> {
        let id = frame.stream_id;
        match frame.kind {
            FrameKind::Ping => return self.send_frame(Frame::pong(frame.payload)),
            FrameKind::Pong => return Ok(()),
            _ if id == 0 => {
                return Err(MuxError::MalformedFrame(format!(
                    "{:?} frame on session stream 0",
                    frame.kind
                )))
            }
            _ => {}
        }

        match frame.kind {
            FrameKind::Open => self.on_open(id),
            FrameKind::Data => {
                self.on_data(id, frame.payload);
                Ok(())
            }
            FrameKind::Close => {
                self.on_close(id);
                Ok(())
            }
            FrameKind::Reset => {
                self.on_reset(id);
                Ok(())
            }
            FrameKind::Window => {
                let increment = frame.window_increment()?;
                self.on_window(id, increment);
                Ok(())
            }
            FrameKind::Ping | FrameKind::Pong => Ok(()),
        }
    }

    fn on_open(self: &Arc<Self>, id: u32) -> Result<(), MuxError> {
        if self.role.opens(id) {
            return Err(MuxError::MalformedFrame(format!(
                "peer opened stream {id} with our id parity"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut streams = self.lock_streams();
            if streams.contains_key(&id) {
                return Err(MuxError::MalformedFrame(format!("stream {id} opened twice")));
            }
            streams.insert(id, StreamEntry::new(self.config.initial_window, tx));
        }

        let stream = Stream::new(id, Arc::clone(self), rx);
        let sender = self
            .accept_tx
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().cloned());

        // On failure the rejected stream is dropped, which resets it.
        match sender {
            Some(tx) => match tx.try_send(stream) {
                Ok(()) => {
                    self.streams_accepted.fetch_add(1, Ordering::Relaxed);
                    trace!(stream_id = id, "stream accepted");
                }
                Err(_) => warn!(stream_id = id, "accept backlog full, resetting stream"),
            },
            None => drop(stream),
        }
        Ok(())
    }

    fn on_data(&self, id: u32, payload: Bytes) {
        let mut streams = self.lock_streams();
        let Some(entry) = streams.get_mut(&id) else {
            drop(streams);
            trace!(stream_id = id, "data for unknown stream");
            let _ = self.send_frame(Frame::reset(id));
            return;
        };

        if !matches!(entry.state, StreamState::Open | StreamState::HalfClosedLocal) {
            trace!(stream_id = id, state = ?entry.state, "data after remote close ignored");
            return;
        }

        if payload.len() > entry.recv_window as usize {
            warn!(
                stream_id = id,
                len = payload.len(),
                window = entry.recv_window,
                "peer exceeded receive window, resetting stream"
            );
            entry.state = StreamState::Reset;
            entry.inbound = None;
            entry.wake_writer();
            let _ = self.send_frame(Frame::reset(id));
            return;
        }

        entry.recv_window -= payload.len() as u32;
        entry.bytes_received += payload.len() as u64;
        if let Some(tx) = &entry.inbound {
            let _ = tx.send(payload);
        }
    }

    fn on_close(&self, id: u32) {
        let mut streams = self.lock_streams();
        if let Some(entry) = streams.get_mut(&id) {
            entry.state = match entry.state {
                StreamState::Open => StreamState::HalfClosedRemote,
                StreamState::HalfClosedLocal => StreamState::Closed,
                other => other,
            };
            entry.inbound = None;
        }
    }

    fn on_reset(&self, id: u32) {
        let mut streams = self.lock_streams();
        if let Some(entry) = streams.get_mut(&id) {
            entry.state = StreamState::Reset;
            entry.inbound = None;
            entry.wake_writer();
        }
    }

    fn on_window(&self, id: u32, increment: u32) {
        let mut streams = self.lock_streams();
        if let Some(entry) = streams.get_mut(&id) {
            entry.send_window = entry.send_window.saturating_add(increment);
            entry.wake_writer();
        }
    }
}

async fn read_loop<R>(inner: Arc<SessionInner>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut closed = inner.closed_tx.subscribe();
    loop {
        let result = tokio::select! {
            result = Frame::read_from(&mut reader) => result,
            _ = closed.wait_for(|c| *c) => return,
        };

        match result {
            Ok(Some(frame)) => {
                inner.touch();
                if let Err(e) = inner.handle_frame(frame) {
                    warn!(error = %e, "dropping mux session after protocol error");
                    inner.close("protocol error");
                    return;
                }
            }
            Ok(None) => {
                inner.close("transport closed by peer");
                return;
            }
            Err(e) => {
                debug!(error = %e, "mux transport read failed");
                inner.close("transport read failed");
                return;
            }
        }
    }
}

async fn write_loop<W>(
    inner: Arc<SessionInner>,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<WriterMsg>,
) where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(64 * 1024);
    while let Some(msg) = rx.recv().await {
        let mut shutdown = matches!(msg, WriterMsg::Shutdown);
        if let WriterMsg::Frame(frame) = msg {
            frame.encode(&mut buf);
        }

        while !shutdown && buf.len() < WRITE_BATCH_BYTES {
            match rx.try_recv() {
                Ok(WriterMsg::Frame(frame)) => frame.encode(&mut buf),
                Ok(WriterMsg::Shutdown) => shutdown = true,
                Err(_) => break,
            }
        }

        if !buf.is_empty() {
            let result = async {
                writer.write_all(&buf).await?;
                writer.flush().await
            }
            .await;
            buf.clear();
            if let Err(e) = result {
                debug!(error = %e, "mux transport write failed");
                inner.close("transport write failed");
                break;
            }
        }

        if shutdown {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn keepalive_loop(inner: Arc<SessionInner>, interval: Duration) {
    let mut closed = inner.closed_tx.subscribe();
    let mut nonce = 0u64;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = closed.wait_for(|c| *c) => return,
        }

        let idle_ms = now_unix_ms().saturating_sub(inner.last_activity_ms.load(Ordering::Relaxed));
        if idle_ms > inner.config.keepalive_timeout.as_millis() as u64 {
            warn!(idle_ms, "mux keepalive timeout");
            inner.close("keepalive timeout");
            return;
        }

        nonce = nonce.wrapping_add(1);
        if inner.send_frame(Frame::ping(nonce)).is_err() {
            return;
        }
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (Session, Session) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Session::new(a, Role::Client, MuxConfig::default()),
            Session::new(b, Role::Server, MuxConfig::default()),
        )
    }

    #[test]
    fn test_role_parity() {
        assert!(Role::Client.opens(1));
        assert!(!Role::Client.opens(2));
        assert!(Role::Server.opens(2));
        assert!(!Role::Server.opens(0));
    }

    #[tokio::test]
    async fn test_open_accept_echo() {
        let (client, server) = pair();

        let echo = tokio::spawn(async move {
            let mut stream = server.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.shutdown().await.unwrap();
            server
        });

        let mut stream = client.open_stream().unwrap();
        assert_eq!(stream.id(), 1);
        stream.write_all(b"hello mux").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"hello mux");

        let _server = echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_ids_are_even() {
        let (client, server) = pair();
        let s1 = server.open_stream().unwrap();
        let s2 = server.open_stream().unwrap();
        assert_eq!((s1.id(), s2.id()), (2, 4));

        let accepted = client.accept().await.unwrap();
        assert_eq!(accepted.id(), 2);
    }

    #[tokio::test]
    async fn test_close_resets_pending_reads() {
        let (client, server) = pair();
        let mut stream = client.open_stream().unwrap();
        let _peer = server.accept().await.unwrap();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            stream.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close();

        let result = reader.await.unwrap();
        assert!(result.is_err());
        assert!(client.open_stream().is_err());
    }

    #[tokio::test]
    async fn test_peer_drop_closes_session() {
        let (client, server) = pair();
        drop(server);
        tokio::time::timeout(Duration::from_secs(1), client.closed())
            .await
            .expect("session should observe peer close");
        assert!(client.is_closed());
        assert!(client.accept().await.is_none());
    }

    #[tokio::test]
    async fn test_reset_is_observed_by_peer() {
        let (client, server) = pair();
        let stream = client.open_stream().unwrap();
        let mut peer = server.accept().await.unwrap();

        stream.reset();
        let mut buf = [0u8; 4];
        let err = peer.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_stats_count_streams() {
        let (client, server) = pair();
        let _a = client.open_stream().unwrap();
        let _b = client.open_stream().unwrap();
        let _x = server.accept().await.unwrap();
        let _y = server.accept().await.unwrap();

        assert_eq!(client.stats().streams_opened, 2);
        assert_eq!(server.stats().streams_accepted, 2);
        assert_eq!(server.stats().active_streams, 2);
    }

    #[tokio::test]
    async fn test_no_accept_after_close() {
        let (client, server) = pair();
        let _a = client.open_stream().unwrap();
        let _b = client.open_stream().unwrap();
        for _ in 0..100 {
            if server.stats().streams_accepted == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(server.stats().streams_accepted, 2);

        // An accept in progress holds the queue while the session closes.
        let held = server.inner.accept_rx.lock().await;
        server.close();
        drop(held);

        assert!(server.accept().await.is_none());
        assert!(server.accept().await.is_none());
    }

    #[tokio::test]
    async fn test_keepalive_closes_silent_peer() {
        let (a, b) = tokio::io::duplex(1024);
        let config = MuxConfig::default()
            .with_keepalive(Duration::from_millis(20), Duration::from_millis(60));
        let session = Session::new(a, Role::Client, config);

        // Hold the other end open without ever answering pings.
        let _silent = b;
        tokio::time::timeout(Duration::from_secs(2), session.closed())
            .await
            .expect("keepalive should close the session");
    }
}
