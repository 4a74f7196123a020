//! Cluster-wide endpoint ownership table.
//!
//! Every node holds one table and mutates it only through
//! [`EndpointTable::apply_delta`] (plus owner removal when membership declares
//! a node gone). Readers load an immutable snapshot without locking.
//!
//! Claims are ordered by `(incarnation, owner)`: a greater key always wins,
//! so every node converges on the same owner regardless of arrival order.
//! Released claims leave a tombstone that rejects any claim at or below it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use outpost_id::{EndpointId, NodeId};
use outpost_wire::{ClaimOp, EndpointDelta};
use tracing::debug;

/// Total order over competing claims for one endpoint.
pub type ClaimKey = (u64, NodeId);

/// The authoritative owner of one endpoint, as this node sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: EndpointId,
    pub owner: NodeId,
    pub incarnation: u64,
    /// Last time a claim refreshed this entry.
    pub last_heartbeat: DateTime<Utc>,
}

impl Endpoint {
    pub fn key(&self) -> ClaimKey {
        (self.incarnation, self.owner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    pub owner: NodeId,
    pub incarnation: u64,
    pub created: Instant,
}

impl Tombstone {
    pub fn key(&self) -> ClaimKey {
        (self.incarnation, self.owner)
    }
}

/// Result of applying one delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The table changed; the delta is news worth relaying.
    Applied,
    /// Already known at exactly this key.
    Duplicate,
    /// Superseded by a greater claim or tombstone; discarded.
    Stale { winner: ClaimKey },
    /// Claim from a node that is dead, left or recently reaped; discarded.
    OwnerGone,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// Immutable view of the table.
#[derive(Debug, Clone, Default)]
pub struct TableSnapshot {
    entries: HashMap<EndpointId, Endpoint>,
    tombstones: HashMap<EndpointId, Tombstone>,
}

impl TableSnapshot {
    pub fn get(&self, id: &EndpointId) -> Option<&Endpoint> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.entries.values()
    }

    pub fn owned_by<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a Endpoint> + 'a {
        self.entries.values().filter(move |e| &e.owner == node)
    }

    pub fn tombstone(&self, id: &EndpointId) -> Option<&Tombstone> {
        self.tombstones.get(id)
    }

    /// Highest incarnation seen for `id`, live or released.
    pub fn latest_incarnation(&self, id: &EndpointId) -> Option<u64> {
        let live = self.entries.get(id).map(|e| e.incarnation);
        let dead = self.tombstones.get(id).map(|t| t.incarnation);
        live.max(dead)
    }

    /// Entries as claims and tombstones as releases, for a full-state sync.
    pub fn to_deltas(&self) -> Vec<EndpointDelta> {
        let claims = self.entries.values().map(|e| EndpointDelta {
            endpoint_id: e.id.clone(),
            owner: e.owner,
            incarnation: e.incarnation,
            op: ClaimOp::Claim,
        });
        let releases = self.tombstones.iter().map(|(id, t)| EndpointDelta {
            endpoint_id: id.clone(),
            owner: t.owner,
            incarnation: t.incarnation,
            op: ClaimOp::Release,
        });
        claims.chain(releases).collect()
    }
}

/// Endpoint table with lock-free snapshot reads.
///
/// Writers serialize on an internal mutex, build a new snapshot and swap it
/// in; readers never observe a half-applied delta.
pub struct EndpointTable {
    snapshot: ArcSwap<TableSnapshot>,
    write_lock: Mutex<()>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(TableSnapshot::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<TableSnapshot> {
        self.snapshot.load_full()
    }

    pub fn get(&self, id: &EndpointId) -> Option<Endpoint> {
        self.snapshot.load().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    pub fn latest_incarnation(&self, id: &EndpointId) -> Option<u64> {
        self.snapshot.load().latest_incarnation(id)
    }

    /// Apply one claim or release, enforcing the `(incarnation, owner)` order.
    pub fn apply_delta(&self, delta: &EndpointDelta) -> ApplyOutcome {
        self.update(|snap| apply(snap, delta))
    }

    /// Apply many deltas under a single snapshot swap.
    pub fn apply_batch(&self, deltas: &[EndpointDelta]) -> Vec<ApplyOutcome> {
        if deltas.is_empty() {
            return Vec::new();
        }
        self.update(|snap| deltas.iter().map(|delta| apply(snap, delta)).collect())
    }

    /// Tombstone every endpoint owned by `node`. Returns the removed ids.
    pub fn remove_owner(&self, node: &NodeId) -> Vec<EndpointId> {
        self.update(|snap| {
            let owned: Vec<Endpoint> = snap.owned_by(node).cloned().collect();
            let now = Instant::now();
            for endpoint in &owned {
                snap.entries.remove(&endpoint.id);
                snap.tombstones.insert(
                    endpoint.id.clone(),
                    Tombstone {
                        owner: endpoint.owner,
                        incarnation: endpoint.incarnation,
                        created: now,
                    },
                );
            }
            owned.into_iter().map(|e| e.id).collect()
        })
    }

    /// Forget tombstones older than `age`. Returns how many were dropped.
    pub fn reap_tombstones(&self, age: Duration) -> usize {
        self.update(|snap| {
            let before = snap.tombstones.len();
            snap.tombstones.retain(|_, t| t.created.elapsed() < age);
            before - snap.tombstones.len()
        })
    }

    fn update<R>(&self, f: impl FnOnce(&mut TableSnapshot) -> R) -> R {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = TableSnapshot::clone(&self.snapshot.load());
        let result = f(&mut next);
        self.snapshot.store(Arc::new(next));
        result
    }
}

impl Default for EndpointTable {
    fn default() -> Self {
        Self::new()
    }
}

fn apply(snap: &mut TableSnapshot, delta: &EndpointDelta) -> ApplyOutcome {
    let key: ClaimKey = (delta.incarnation, delta.owner);
    let id = &delta.endpoint_id;

    match delta.op {
        ClaimOp::Claim => {
            if let Some(tomb) = snap.tombstones.get(id) {
                if tomb.key() >= key {
                    return ApplyOutcome::Stale { winner: tomb.key() };
                }
            }
            if let Some(current) = snap.entries.get_mut(id) {
                if current.key() == key {
                    current.last_heartbeat = Utc::now();
                    return ApplyOutcome::Duplicate;
                }
                if current.key() > key {
                    debug!(
                        endpoint_id = %id,
                        winner = %current.owner,
                        winner_incarnation = current.incarnation,
                        loser = %delta.owner,
                        loser_incarnation = delta.incarnation,
                        "Conflicting claim discarded"
                    );
                    return ApplyOutcome::Stale {
                        winner: current.key(),
                    };
                }
            }
            snap.tombstones.remove(id);
            snap.entries.insert(
                id.clone(),
                Endpoint {
                    id: id.clone(),
                    owner: delta.owner,
                    incarnation: delta.incarnation,
                    last_heartbeat: Utc::now(),
                },
            );
            ApplyOutcome::Applied
        }
        ClaimOp::Release => {
            if let Some(current) = snap.entries.get(id) {
                if current.key() > key {
                    return ApplyOutcome::Stale {
                        winner: current.key(),
                    };
                }
            }
            if let Some(tomb) = snap.tombstones.get(id) {
                if tomb.key() == key {
                    return ApplyOutcome::Duplicate;
                }
                if tomb.key() > key {
                    return ApplyOutcome::Stale { winner: tomb.key() };
                }
            }
            snap.entries.remove(id);
            snap.tombstones.insert(
                id.clone(),
                Tombstone {
                    owner: delta.owner,
                    incarnation: delta.incarnation,
                    created: Instant::now(),
                },
            );
            ApplyOutcome::Applied
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn claim(id: &EndpointId, owner: NodeId, incarnation: u64) -> EndpointDelta {
        EndpointDelta {
            endpoint_id: id.clone(),
            owner,
            incarnation,
            op: ClaimOp::Claim,
        }
    }

    fn release(id: &EndpointId, owner: NodeId, incarnation: u64) -> EndpointDelta {
        EndpointDelta {
            op: ClaimOp::Release,
            ..claim(id, owner, incarnation)
        }
    }

    fn svc() -> EndpointId {
        EndpointId::parse("svc-a").unwrap()
    }

    #[test]
    fn test_higher_incarnation_wins() {
        let table = EndpointTable::new();
        let (a, b) = (NodeId::new(), NodeId::new());

        assert!(table.apply_delta(&claim(&svc(), a, 1)).is_applied());
        assert!(table.apply_delta(&claim(&svc(), b, 2)).is_applied());
        assert!(matches!(
            table.apply_delta(&claim(&svc(), a, 1)),
            ApplyOutcome::Stale { .. }
        ));
        assert_eq!(table.get(&svc()).unwrap().owner, b);
    }

    #[test]
    fn test_equal_incarnation_broken_by_owner() {
        let table = EndpointTable::new();
        let (a, b) = (NodeId::new(), NodeId::new());
        let winner = a.max(b);

        table.apply_delta(&claim(&svc(), a, 5));
        table.apply_delta(&claim(&svc(), b, 5));
        assert_eq!(table.get(&svc()).unwrap().owner, winner);
    }

    #[test]
    fn test_duplicate_claim_is_not_news() {
        let table = EndpointTable::new();
        let a = NodeId::new();
        table.apply_delta(&claim(&svc(), a, 1));
        assert_eq!(table.apply_delta(&claim(&svc(), a, 1)), ApplyOutcome::Duplicate);
    }

    #[test]
    fn test_release_leaves_tombstone() {
        let table = EndpointTable::new();
        let a = NodeId::new();
        table.apply_delta(&claim(&svc(), a, 3));
        assert!(table.apply_delta(&release(&svc(), a, 3)).is_applied());
        assert!(table.get(&svc()).is_none());

        // A late copy of the released claim must not resurrect it.
        assert!(!table.apply_delta(&claim(&svc(), a, 3)).is_applied());
        assert_eq!(table.latest_incarnation(&svc()), Some(3));

        // A fresh claim above the tombstone does.
        assert!(table.apply_delta(&claim(&svc(), a, 4)).is_applied());
    }

    #[test]
    fn test_release_of_older_claim_keeps_newer() {
        let table = EndpointTable::new();
        let (a, b) = (NodeId::new(), NodeId::new());
        table.apply_delta(&claim(&svc(), b, 7));
        assert!(matches!(
            table.apply_delta(&release(&svc(), a, 2)),
            ApplyOutcome::Stale { .. }
        ));
        assert_eq!(table.get(&svc()).unwrap().owner, b);
    }

    #[test]
    fn test_remove_owner_tombstones_everything_it_owns() {
        let table = EndpointTable::new();
        let (a, b) = (NodeId::new(), NodeId::new());
        let other = EndpointId::parse("svc-b").unwrap();
        let third = EndpointId::parse("svc-c").unwrap();
        table.apply_delta(&claim(&svc(), a, 1));
        table.apply_delta(&claim(&other, a, 1));
        table.apply_delta(&claim(&third, b, 1));

        let mut removed = table.remove_owner(&a);
        removed.sort();
        assert_eq!(removed, vec![svc(), other.clone()]);
        assert_eq!(table.len(), 1);
        assert!(!table.apply_delta(&claim(&other, a, 1)).is_applied());
    }

    #[test]
    fn test_snapshot_is_immutable() {
        let table = EndpointTable::new();
        let before = table.snapshot();
        table.apply_delta(&claim(&svc(), NodeId::new(), 1));
        assert!(before.is_empty());
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn test_batch_matches_one_by_one() {
        let table = EndpointTable::new();
        let (a, b) = (NodeId::new(), NodeId::new());
        let other = EndpointId::parse("svc-b").unwrap();
        let outcomes = table.apply_batch(&[
            claim(&svc(), a, 1),
            claim(&svc(), b, 2),
            claim(&svc(), a, 1),
            claim(&other, a, 1),
            claim(&other, a, 1),
        ]);

        assert!(outcomes[0].is_applied());
        assert!(outcomes[1].is_applied());
        assert!(matches!(outcomes[2], ApplyOutcome::Stale { .. }));
        assert!(outcomes[3].is_applied());
        assert_eq!(outcomes[4], ApplyOutcome::Duplicate);
        assert_eq!(table.get(&svc()).unwrap().owner, b);
        assert_eq!(table.len(), 2);
        assert!(table.apply_batch(&[]).is_empty());
    }

    #[test]
    fn test_reap_tombstones() {
        let table = EndpointTable::new();
        let a = NodeId::new();
        table.apply_delta(&release(&svc(), a, 1));
        assert_eq!(table.reap_tombstones(Duration::from_secs(60)), 0);
        assert_eq!(table.reap_tombstones(Duration::ZERO), 1);
        assert!(table.snapshot().tombstone(&svc()).is_none());
    }

    #[test]
    fn test_to_deltas_includes_releases() {
        let table = EndpointTable::new();
        let a = NodeId::new();
        table.apply_delta(&claim(&svc(), a, 1));
        table.apply_delta(&release(&EndpointId::parse("gone").unwrap(), a, 4));
        let deltas = table.snapshot().to_deltas();
        assert_eq!(deltas.len(), 2);
        assert!(deltas.iter().any(|d| d.op == ClaimOp::Release && d.incarnation == 4));
    }

    fn delta_strategy(owners: Vec<NodeId>) -> impl Strategy<Value = EndpointDelta> {
        (0..owners.len(), 1u64..6, any::<bool>()).prop_map(move |(i, inc, is_claim)| {
            let id = EndpointId::parse("svc-a").unwrap();
            if is_claim {
                claim(&id, owners[i], inc)
            } else {
                release(&id, owners[i], inc)
            }
        })
    }

    proptest! {
        #[test]
        fn prop_convergence_is_order_independent(
            (deltas, shuffled) in {
                let owners = vec![NodeId::new(), NodeId::new(), NodeId::new()];
                prop::collection::vec(delta_strategy(owners), 1..12)
                    .prop_flat_map(|d| (Just(d.clone()), Just(d).prop_shuffle()))
            }
        ) {
            let left = EndpointTable::new();
            let right = EndpointTable::new();
            for d in &deltas {
                left.apply_delta(d);
            }
            for d in &shuffled {
                right.apply_delta(d);
            }
            prop_assert_eq!(
                left.get(&svc()).map(|e| e.key()),
                right.get(&svc()).map(|e| e.key())
            );
        }

        #[test]
        fn prop_greatest_claim_visible_without_releases(
            incarnations in prop::collection::vec(1u64..100, 1..10)
        ) {
            let owners: Vec<NodeId> = incarnations.iter().map(|_| NodeId::new()).collect();
            let table = EndpointTable::new();
            for (owner, inc) in owners.iter().zip(&incarnations).rev() {
                table.apply_delta(&claim(&svc(), *owner, *inc));
            }
            let expected = owners
                .iter()
                .zip(&incarnations)
                .map(|(o, i)| (*i, *o))
                .max();
            prop_assert_eq!(table.get(&svc()).map(|e| e.key()), expected);
        }
    }
}
