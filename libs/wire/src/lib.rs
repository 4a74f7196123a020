//! # outpost-wire
//!
//! Message types exchanged by outpost processes and the codecs that carry
//! them.
//!
//! ## Surfaces
//!
//! - Upstream registration handshake (`handshake`)
//! - Client proxy preamble (`proxy`)
//! - Inter-node forwarding and state sync (`peer`, `sync`)
//! - Gossip datagrams (`gossip`)
//!
//! ## Encodings
//!
//! - Length-prefixed JSON (`[u32 BE len][json]`) for every internal
//!   request/response, so a reader never consumes bytes past the message.
//! - Newline-delimited JSON for the client preamble, read one byte at a time
//!   for the same reason.
//! - One JSON document per UDP datagram for gossip.

mod codec;
mod error;
mod gossip;
mod handshake;
mod peer;
mod proxy;
mod sync;

pub use codec::*;
pub use error::WireError;
pub use gossip::*;
pub use handshake::*;
pub use peer::*;
pub use proxy::*;
pub use sync::*;
