//! Error types for message encoding and decoding.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the transport before a complete message arrived.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("message too large: {len} > {max}")]
    TooLarge { len: usize, max: usize },

    /// Bytes arrived but did not decode into the expected message.
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl WireError {
    /// True when the failure says nothing about the peer's intent, only
    /// that the transport went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            WireError::UnexpectedEof => true,
            WireError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for WireError {
    fn from(err: serde_json::Error) -> Self {
        WireError::Malformed(err.to_string())
    }
}
