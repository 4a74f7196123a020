//! Multiplexer errors.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MuxError {
    /// The session is gone; every stream on it is reset.
    #[error("session closed")]
    SessionClosed,

    /// The peer (or the local side) aborted the stream.
    #[error("stream {0} reset")]
    StreamReset(u32),

    /// Write attempted after the local half was closed.
    #[error("stream {0} closed for writing")]
    WriteClosed(u32),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame payload too large: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// No more stream ids of this session's parity.
    #[error("stream ids exhausted")]
    StreamIdsExhausted,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        match err {
            MuxError::Io(e) => e,
            MuxError::SessionClosed => io::Error::new(io::ErrorKind::ConnectionAborted, err),
            MuxError::StreamReset(_) => io::Error::new(io::ErrorKind::ConnectionReset, err),
            MuxError::WriteClosed(_) => io::Error::new(io::ErrorKind::BrokenPipe, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
