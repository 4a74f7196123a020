//! Bidirectional byte relay between two streams.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

const RELAY_BUFFER: usize = 16 * 1024;

/// Bytes moved in each direction by a finished relay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    /// Ended by the idle timeout rather than by either side.
    pub idle: bool,
}

/// Copy bytes both ways until both directions finish.
///
/// EOF on one side half-closes the other, so a client that shuts down its
/// write half still receives the rest of the response. An error in one
/// direction does not cut the other short; its byte count is reported as 0.
///
/// With `idle_timeout`, the relay ends once neither direction has moved a
/// byte for that long. A half-closed relay still waiting for its response
/// counts as idle too.
pub async fn proxy_bidirectional<A, B>(
    a: A,
    b: B,
    idle_timeout: Option<Duration>,
) -> RelayStats
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let activity = Activity::new();

    let pumps = async {
        tokio::join!(
            pump(&mut a_read, &mut b_write, &activity, 0),
            pump(&mut b_read, &mut a_write, &activity, 1),
        )
    };

    let Some(idle_timeout) = idle_timeout else {
        let (a_to_b, b_to_a) = pumps.await;
        return RelayStats {
            a_to_b: a_to_b.unwrap_or(0),
            b_to_a: b_to_a.unwrap_or(0),
            idle: false,
        };
    };

    tokio::select! {
        (a_to_b, b_to_a) = pumps => RelayStats {
            a_to_b: a_to_b.unwrap_or(0),
            b_to_a: b_to_a.unwrap_or(0),
            idle: false,
        },
        _ = activity.idle_for(idle_timeout) => RelayStats {
            a_to_b: activity.a_to_b(),
            b_to_a: activity.b_to_a(),
            idle: true,
        },
    }
}

/// Last time either pump moved bytes, plus running byte counts.
struct Activity {
    last: std::sync::Mutex<Instant>,
    bytes: [AtomicU64; 2],
}

impl Activity {
    fn new() -> Self {
        Self {
            last: std::sync::Mutex::new(Instant::now()),
            bytes: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    fn touch(&self) {
        *self.last.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.last.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn a_to_b(&self) -> u64 {
        self.bytes[0].load(Ordering::Relaxed)
    }

    fn b_to_a(&self) -> u64 {
        self.bytes[1].load(Ordering::Relaxed)
    }

    /// Resolves once nothing moved for `timeout`.
    async fn idle_for(&self, timeout: Duration) {
        loop {
            let deadline = self.last() + timeout;
            tokio::time::sleep_until(deadline).await;
            if self.last() + timeout <= Instant::now() {
                return;
            }
        }
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, activity: &Activity, direction: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                activity.touch();
                writer.write_all(&buf[..n]).await?;
                activity.touch();
                total += n as u64;
                activity.bytes[direction].fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                let _ = writer.shutdown().await;
                return Err(e);
            }
        }
    }
    writer.shutdown().await?;
    Ok(total)
}
