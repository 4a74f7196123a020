//! Request path: client preamble, routing, forwarding and relay.
//!
//! ## Architecture
//!
//! ```text
//! Client -> ProxyListener -> Router -> local UpstreamConnection
//!                               |
//!                               +-> Forwarder -> peer link -> owner's upstream
//! ```
//!
//! A node that receives a forwarded request serves it from its local
//! registry only; it never forwards it on.

mod forwarder;
mod inflight;
mod listener;
mod relay;
mod router;

pub use forwarder::{Forwarder, ForwarderStats};
pub use inflight::{InFlight, InFlightGuard};
pub use listener::{ProxyListener, ProxySettings, ProxyStats};
pub use relay::{proxy_bidirectional, RelayStats};
pub use router::{RouteDecision, Router};
