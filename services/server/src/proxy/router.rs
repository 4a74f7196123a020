//! Routing decisions for proxied requests.
//!
//! Reads the endpoint table snapshot and membership; never blocks on the
//! network and never consults anything but local state.

use std::net::SocketAddr;
use std::sync::Arc;

use outpost_id::{EndpointId, NodeId};
use tracing::debug;

use crate::cluster::{EndpointTable, Membership};
use crate::registry::Registry;
use crate::upstream::UpstreamConnection;

/// Where a request for an endpoint should go.
#[derive(Debug, Clone)]
pub enum RouteDecision {
    /// This node owns the endpoint and holds the upstream.
    Local(Arc<UpstreamConnection>),
    /// Another live node owns it.
    Remote { node: NodeId, addr: SocketAddr },
    /// No live owner is known.
    Unresolved,
}

impl RouteDecision {
    pub fn kind(&self) -> &'static str {
        match self {
            RouteDecision::Local(_) => "local",
            RouteDecision::Remote { .. } => "remote",
            RouteDecision::Unresolved => "unresolved",
        }
    }
}

pub struct Router {
    local_id: NodeId,
    table: Arc<EndpointTable>,
    registry: Arc<Registry>,
    membership: Arc<Membership>,
}

impl Router {
    pub fn new(
        table: Arc<EndpointTable>,
        registry: Arc<Registry>,
        membership: Arc<Membership>,
    ) -> Self {
        Self {
            local_id: membership.local_id(),
            table,
            registry,
            membership,
        }
    }

    pub fn route(&self, endpoint_id: &EndpointId) -> RouteDecision {
        let Some(entry) = self.table.get(endpoint_id) else {
            return RouteDecision::Unresolved;
        };

        if entry.owner == self.local_id {
            return match self.registry.lookup_local(endpoint_id) {
                Some(conn) if conn.is_active() => RouteDecision::Local(conn),
                _ => {
                    debug!(endpoint_id = %endpoint_id, "Owned locally but no live upstream");
                    RouteDecision::Unresolved
                }
            };
        }

        match self.membership.member(&entry.owner) {
            Some(member) if self.membership.is_alive(&member.id) => RouteDecision::Remote {
                node: member.id,
                addr: member.addr,
            },
            _ => {
                debug!(
                    endpoint_id = %endpoint_id,
                    owner = %entry.owner,
                    "Owner not alive"
                );
                RouteDecision::Unresolved
            }
        }
    }
}
