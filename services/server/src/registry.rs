//! Local endpoint registry.
//!
//! Maps endpoint ids to the upstream connection serving them on this node.
//! Mutated only by the upstream connection manager. Every change is emitted,
//! in order, as a [`RegistryEvent`] for the membership layer to claim or
//! release the endpoint cluster-wide.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use outpost_id::{ConnectionId, EndpointId, NodeId};
use outpost_wire::{ClaimOp, EndpointDelta};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cluster::EndpointTable;
use crate::upstream::UpstreamConnection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered {
        endpoint_id: EndpointId,
        incarnation: u64,
    },
    Deregistered {
        endpoint_id: EndpointId,
        incarnation: u64,
    },
}

impl RegistryEvent {
    /// The ownership delta this event publishes for `owner`.
    pub fn to_delta(&self, owner: NodeId) -> EndpointDelta {
        let (endpoint_id, incarnation, op) = match self {
            RegistryEvent::Registered {
                endpoint_id,
                incarnation,
            } => (endpoint_id, *incarnation, ClaimOp::Claim),
            RegistryEvent::Deregistered {
                endpoint_id,
                incarnation,
            } => (endpoint_id, *incarnation, ClaimOp::Release),
        };
        EndpointDelta {
            endpoint_id: endpoint_id.clone(),
            owner,
            incarnation,
            op,
        }
    }
}

struct Registration {
    connection: Arc<UpstreamConnection>,
    incarnation: u64,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<EndpointId, Registration>,
    /// Last incarnation minted by this node, for any endpoint.
    counter: u64,
}

pub struct Registry {
    table: Arc<EndpointTable>,
    state: Mutex<RegistryState>,
    events: mpsc::UnboundedSender<RegistryEvent>,
}

impl Registry {
    /// Create a registry and the receiving end of its event stream.
    pub fn new(table: Arc<EndpointTable>) -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Self {
            table,
            state: Mutex::new(RegistryState::default()),
            events,
        };
        (registry, rx)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Incarnation strictly above anything this node or the cluster table has
    /// seen for `endpoint_id`, so the new claim supersedes all of them.
    fn mint(&self, state: &mut RegistryState, endpoint_id: &EndpointId) -> u64 {
        let seen = self.table.latest_incarnation(endpoint_id).unwrap_or(0);
        state.counter = state.counter.max(seen) + 1;
        state.counter
    }

    fn emit(&self, event: RegistryEvent) {
        // The receiver is gone only during shutdown.
        let _ = self.events.send(event);
    }

    /// Register `endpoint_id` as served by `connection`. The latest local
    /// registration wins. Returns the minted incarnation.
    pub fn register_local(
        &self,
        endpoint_id: &EndpointId,
        connection: Arc<UpstreamConnection>,
    ) -> u64 {
        let mut state = self.lock();
        let incarnation = self.mint(&mut state, endpoint_id);
        let connection_id = connection.id();
        let previous = state.entries.insert(
            endpoint_id.clone(),
            Registration {
                connection,
                incarnation,
            },
        );

        if let Some(previous) = previous {
            debug!(
                endpoint_id = %endpoint_id,
                replaced_connection = %previous.connection.id(),
                "Local registration replaced"
            );
        }
        info!(
            endpoint_id = %endpoint_id,
            connection_id = %connection_id,
            incarnation,
            "Endpoint registered locally"
        );

        self.emit(RegistryEvent::Registered {
            endpoint_id: endpoint_id.clone(),
            incarnation,
        });
        incarnation
    }

    /// Remove a local registration. A no-op, emitting nothing, when absent.
    pub fn deregister_local(&self, endpoint_id: &EndpointId) -> Option<u64> {
        let mut state = self.lock();
        let removed = state.entries.remove(endpoint_id)?;
        info!(
            endpoint_id = %endpoint_id,
            connection_id = %removed.connection.id(),
            incarnation = removed.incarnation,
            "Endpoint deregistered locally"
        );
        self.emit(RegistryEvent::Deregistered {
            endpoint_id: endpoint_id.clone(),
            incarnation: removed.incarnation,
        });
        Some(removed.incarnation)
    }

    /// Deregister only if `connection_id` still holds the registration, so a
    /// closing connection never removes a newer one.
    pub fn deregister_connection(
        &self,
        endpoint_id: &EndpointId,
        connection_id: ConnectionId,
    ) -> bool {
        let mut state = self.lock();
        let holds = state
            .entries
            .get(endpoint_id)
            .is_some_and(|r| r.connection.id() == connection_id);
        if !holds {
            return false;
        }
        if let Some(removed) = state.entries.remove(endpoint_id) {
            info!(
                endpoint_id = %endpoint_id,
                connection_id = %connection_id,
                incarnation = removed.incarnation,
                "Endpoint deregistered on connection close"
            );
            self.emit(RegistryEvent::Deregistered {
                endpoint_id: endpoint_id.clone(),
                incarnation: removed.incarnation,
            });
        }
        true
    }

    pub fn lookup_local(&self, endpoint_id: &EndpointId) -> Option<Arc<UpstreamConnection>> {
        self.lock()
            .entries
            .get(endpoint_id)
            .map(|r| Arc::clone(&r.connection))
    }

    pub fn incarnation_of(&self, endpoint_id: &EndpointId) -> Option<u64> {
        self.lock().entries.get(endpoint_id).map(|r| r.incarnation)
    }

    /// Re-mint every local registration at a fresh incarnation and emit it.
    ///
    /// Used after this node refutes a false death: peers tombstoned our old
    /// claims, and only a higher incarnation restores them.
    pub fn reassert_all(&self) -> usize {
        let mut state = self.lock();
        let ids: Vec<EndpointId> = state.entries.keys().cloned().collect();
        for endpoint_id in &ids {
            let incarnation = self.mint(&mut state, endpoint_id);
            if let Some(registration) = state.entries.get_mut(endpoint_id) {
                registration.incarnation = incarnation;
            }
            self.emit(RegistryEvent::Registered {
                endpoint_id: endpoint_id.clone(),
                incarnation,
            });
        }
        ids.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}
