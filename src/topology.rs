//! # Topology Construction
//!
//! Peer-side bootstrap state: the union of seed-returned peer lists, the
//! preferential-attachment draw, and the neighbor table. Selection weight is
//! `degree + 1` so a fresh network with all-zero degrees still attaches, and
//! draws are without replacement up to the outbound cap. Inbound attachments
//! bypass the cap, which preserves the power-law tail.

use std::collections::{BTreeSet, HashMap};

use rand::Rng;

use crate::identity::NodeId;
use crate::liveness::{Health, PingTracker};

/// Maximum outbound attachments a joining peer opens.
pub const ATTACH_CAP: usize = 3;

/// Which side initiated a neighbor connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// One attached neighbor.
#[derive(Debug)]
pub struct Neighbor {
    pub direction: Direction,
    /// Last degree the neighbor reported about itself.
    pub degree_hint: u32,
    pub tracker: PingTracker,
}

/// The peer's neighbor set. Mutated only by the owning peer actor.
#[derive(Debug, Default)]
pub struct NeighborTable {
    entries: HashMap<NodeId, Neighbor>,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current degree: every attached neighbor, both directions.
    pub fn degree(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Neighbor> {
        self.entries.get_mut(id)
    }

    /// Attach a neighbor. Returns false when already attached.
    pub fn insert(
        &mut self,
        id: NodeId,
        direction: Direction,
        degree_hint: u32,
        missed_ping_limit: u32,
    ) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(
            id,
            Neighbor {
                direction,
                degree_hint,
                tracker: PingTracker::new(missed_ping_limit),
            },
        );
        true
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Neighbor> {
        self.entries.remove(id)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.entries.keys().copied().collect()
    }

    /// Neighbors other than `except` that are not already condemned: the
    /// set a corroboration round queries.
    pub fn others_alive(&self, except: &NodeId) -> BTreeSet<NodeId> {
        self.entries
            .iter()
            .filter(|(id, n)| *id != except && n.tracker.state() != Health::Dead)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn outbound_count(&self) -> usize {
        self.entries
            .values()
            .filter(|n| n.direction == Direction::Outbound)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Neighbor)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&NodeId, &mut Neighbor)> {
        self.entries.iter_mut()
    }
}

/// Union the peer lists returned by the contacted seeds, minus ourselves.
pub fn union_peer_lists<I>(lists: I, this: NodeId) -> BTreeSet<NodeId>
where
    I: IntoIterator<Item = Vec<NodeId>>,
{
    lists
        .into_iter()
        .flatten()
        .filter(|p| *p != this)
        .collect()
}

/// Preferential-attachment draw: up to `cap` candidates, without
/// replacement, each weighted `degree + 1`.
pub fn select_attachments<R: Rng>(
    candidates: &[(NodeId, u32)],
    cap: usize,
    rng: &mut R,
) -> Vec<NodeId> {
    if candidates.len() <= cap {
        return candidates.iter().map(|(id, _)| *id).collect();
    }

    let mut pool: Vec<(NodeId, u64)> = candidates
        .iter()
        .map(|(id, degree)| (*id, u64::from(*degree) + 1))
        .collect();
    let mut picked = Vec::with_capacity(cap);

    while picked.len() < cap && !pool.is_empty() {
        let total: u64 = pool.iter().map(|(_, w)| *w).sum();
        let mut roll = rng.gen_range(0..total);
        let mut index = pool.len() - 1;
        for (i, (_, weight)) in pool.iter().enumerate() {
            if roll < *weight {
                index = i;
                break;
            }
            roll -= *weight;
        }
        picked.push(pool.swap_remove(index).0);
    }

    picked
}
