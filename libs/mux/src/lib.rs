//! # outpost-mux
//!
//! Splits one transport (usually a TCP connection) into many independent,
//! ordered, flow-controlled byte streams.
//!
//! ## Architecture
//!
//! ```text
//! Stream handles ──poll_write──► writer queue ──► writer task ──► transport
//!        ▲                                                          │
//!        └──── per-stream inbound queue ◄── reader task ◄───────────┘
//!                                           │
//!                               stream table (id → StreamEntry)
//! ```
//!
//! Each session owns a table of stream entries keyed by stream id. A
//! [`Stream`] handle refers to its entry by id only, so closing the session
//! can fail every stream without chasing pointers.
//!
//! ## Usage
//!
//! ```ignore
//! let session = Session::new(tcp, Role::Client, MuxConfig::default());
//! let mut stream = session.open_stream()?;
//! stream.write_all(b"hello").await?;
//! stream.shutdown().await?;
//! ```

mod error;
mod frame;
mod session;
mod stream;

pub use error::MuxError;
pub use frame::{Frame, FrameKind, FRAME_HEADER_LEN, MAX_DATA_CHUNK, MAX_FRAME_PAYLOAD};
pub use session::{MuxConfig, Role, Session, SessionStats};
pub use stream::{Stream, StreamState, StreamStats};
