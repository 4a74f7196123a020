//! Cluster membership and the replicated endpoint table.
//!
//! ## Components
//!
//! - `table`: endpoint → owner map with last-writer-wins conflict resolution
//! - `outbox`: per-peer queues of deltas awaiting piggyback
//! - `membership`: SWIM node states and precedence rules
//! - `gossip`: UDP probe loop and datagram handling
//! - `link`: multiplexed TCP links to peers
//! - `sync`: push-pull exchanges for join and anti-entropy

mod gossip;
mod link;
mod membership;
mod outbox;
mod sync;
mod table;

pub use gossip::Gossiper;
pub use link::PeerLinks;
pub use membership::{Departure, Member, Membership, SenderVerdict, TickReport};
pub use outbox::{Outbox, Outboxes};
pub use sync::{serve_sync, StateSync};
pub use table::{ApplyOutcome, ClaimKey, Endpoint, EndpointTable, TableSnapshot, Tombstone};
