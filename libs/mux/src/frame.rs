//! Frame encoding.
//!
//! Wire format:
//! - 1 byte frame kind
//! - 4 bytes stream id (big endian)
//! - 4 bytes payload length (big endian)
//! - payload
//!
//! Stream id 0 is reserved for session-level frames (`PING`/`PONG`).

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::MuxError;

/// Size of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 9;

/// Largest payload accepted from the wire.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Largest `DATA` payload this side emits.
pub const MAX_DATA_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Opens a stream; may carry no payload.
    Open = 0x01,
    Data = 0x02,
    /// Half-close: the sender will write no more on this stream.
    Close = 0x03,
    /// Abort the stream in both directions.
    Reset = 0x04,
    /// Grants the peer more send credit; payload is a u32 increment.
    Window = 0x05,
    Ping = 0x06,
    Pong = 0x07,
}

impl FrameKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Open),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::Close),
            0x04 => Some(Self::Reset),
            0x05 => Some(Self::Window),
            0x06 => Some(Self::Ping),
            0x07 => Some(Self::Pong),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, stream_id: u32, payload: Bytes) -> Self {
        Self {
            kind,
            stream_id,
            payload,
        }
    }

    pub fn open(stream_id: u32) -> Self {
        Self::new(FrameKind::Open, stream_id, Bytes::new())
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self::new(FrameKind::Data, stream_id, payload)
    }

    pub fn close(stream_id: u32) -> Self {
        Self::new(FrameKind::Close, stream_id, Bytes::new())
    }

    pub fn reset(stream_id: u32) -> Self {
        Self::new(FrameKind::Reset, stream_id, Bytes::new())
    }

    pub fn window(stream_id: u32, increment: u32) -> Self {
        Self::new(
            FrameKind::Window,
            stream_id,
            Bytes::copy_from_slice(&increment.to_be_bytes()),
        )
    }

    pub fn ping(nonce: u64) -> Self {
        Self::new(FrameKind::Ping, 0, Bytes::copy_from_slice(&nonce.to_be_bytes()))
    }

    pub fn pong(payload: Bytes) -> Self {
        Self::new(FrameKind::Pong, 0, payload)
    }

    /// Credit carried by a `WINDOW` frame.
    pub fn window_increment(&self) -> Result<u32, MuxError> {
        let bytes: [u8; 4] = self.payload.as_ref().try_into().map_err(|_| {
            MuxError::MalformedFrame(format!(
                "window frame payload must be 4 bytes, got {}",
                self.payload.len()
            ))
        })?;
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(FRAME_HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.stream_id);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Read one frame. `Ok(None)` means the transport ended cleanly on a
    /// frame boundary.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Frame>, MuxError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut filled = 0;
        while filled < FRAME_HEADER_LEN {
            let n = reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(MuxError::MalformedFrame(format!(
                    "transport ended inside a frame header ({filled} of {FRAME_HEADER_LEN} bytes)"
                )));
            }
            filled += n;
        }

        let kind = FrameKind::from_u8(header[0])
            .ok_or_else(|| MuxError::MalformedFrame(format!("unknown frame kind {:#04x}", header[0])))?;
        let stream_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;

        if len > MAX_FRAME_PAYLOAD {
            return Err(MuxError::FrameTooLarge {
                len,
                max: MAX_FRAME_PAYLOAD,
            });
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;

        Ok(Some(Frame {
            kind,
            stream_id,
            payload: Bytes::from(payload),
        }))
    }
}
