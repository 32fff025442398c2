//! # Liveness Detection State
//!
//! Per-neighbor failure detection in two stages. Stage one is the ping
//! tracker: every `T_ping` tick an unanswered nonce counts as a miss, and
//! three consecutive misses make the neighbor SUSPECT. Stage two is the
//! corroboration round: the suspecting peer asks its other neighbors to
//! test-ping the target, and only a majority of unreachable verdicts turns
//! SUSPECT into DEAD. A single flaky link therefore cannot evict a healthy
//! peer on its own.
//!
//! DEAD is terminal for the connection instance; the target only comes back
//! through a fresh registration and attach.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::identity::NodeId;

/// Interval of the neighbor ping loop.
pub const PING_INTERVAL: Duration = Duration::from_secs(13);

/// Consecutive misses that make a neighbor SUSPECT.
pub const MISSED_PING_LIMIT: u32 = 3;

/// How long a corroboration round waits for neighbor verdicts.
pub const CORROBORATION_WINDOW: Duration = Duration::from_secs(5);

/// Deadline for the short test ping a queried neighbor performs.
pub const TEST_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Health of one neighbor connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Suspect,
    Dead,
}

/// Ping bookkeeping for one neighbor.
#[derive(Clone, Copy, Debug)]
pub struct PingTracker {
    missed: u32,
    limit: u32,
    outstanding: Option<u64>,
    state: Health,
}

impl PingTracker {
    pub fn new(limit: u32) -> Self {
        Self {
            missed: 0,
            limit,
            outstanding: None,
            state: Health::Healthy,
        }
    }

    pub fn state(&self) -> Health {
        self.state
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// One `T_ping` tick: count a still-outstanding nonce as a miss, then
    /// arm `nonce` for this round. Returns `Some(Health::Suspect)` exactly
    /// when this tick caused the transition.
    pub fn tick(&mut self, nonce: u64) -> Option<Health> {
        if self.state == Health::Dead {
            return None;
        }
        let transition = if self.outstanding.is_some() {
            self.count_miss()
        } else {
            None
        };
        self.outstanding = Some(nonce);
        transition
    }

    /// A send failure counts the same as an unanswered ping.
    pub fn record_miss(&mut self) -> Option<Health> {
        if self.state == Health::Dead {
            return None;
        }
        self.count_miss()
    }

    fn count_miss(&mut self) -> Option<Health> {
        self.missed += 1;
        if self.missed >= self.limit && self.state == Health::Healthy {
            self.state = Health::Suspect;
            Some(Health::Suspect)
        } else {
            None
        }
    }

    /// A `PONG` with the armed nonce clears the miss counter (any response
    /// resets it) and restores HEALTHY. Returns false on a stale nonce.
    pub fn pong(&mut self, nonce: u64) -> bool {
        if self.outstanding != Some(nonce) {
            return false;
        }
        self.outstanding = None;
        self.missed = 0;
        if self.state == Health::Suspect {
            self.state = Health::Healthy;
        }
        true
    }

    /// Corroboration said the target is alive: back to HEALTHY, counters reset.
    pub fn corroboration_alive(&mut self) {
        self.missed = 0;
        self.outstanding = None;
        self.state = Health::Healthy;
    }

    pub fn mark_dead(&mut self) {
        self.state = Health::Dead;
    }
}

/// Outcome of a corroboration round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Dead,
    Alive,
}

/// One in-flight corroboration round for a suspect target.
///
/// The `nonce` is the query's timestamp field; neighbors that find the
/// target alive echo it back as a `PONG` nonce, which is how replies are
/// matched to the round.
#[derive(Debug)]
pub struct CorroborationRound {
    target: NodeId,
    nonce: u64,
    queried: BTreeSet<NodeId>,
    responded: BTreeSet<NodeId>,
    confirms: usize,
}

impl CorroborationRound {
    pub fn new(target: NodeId, nonce: u64, queried: BTreeSet<NodeId>) -> Self {
        Self {
            target,
            nonce,
            queried,
            responded: BTreeSet::new(),
            confirms: 0,
        }
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn queried(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.queried.iter().copied()
    }

    /// Majority over the neighbors actually queried.
    pub fn quorum(&self) -> usize {
        self.queried.len() / 2 + 1
    }

    /// True when `from` was queried and has not answered yet. Used to tell
    /// a round reply apart from an independent suspicion query.
    pub fn is_awaiting(&self, from: &NodeId) -> bool {
        self.queried.contains(from) && !self.responded.contains(from)
    }

    /// Record one neighbor's view of the target. Returns the verdict the
    /// moment it becomes decisive; replies from unqueried neighbors and
    /// duplicates are ignored.
    pub fn record(&mut self, from: NodeId, unreachable: bool) -> Option<Verdict> {
        if !self.queried.contains(&from) || !self.responded.insert(from) {
            return None;
        }
        if unreachable {
            self.confirms += 1;
        }
        if self.confirms >= self.quorum() {
            return Some(Verdict::Dead);
        }
        if self.responded.len() == self.queried.len() {
            return Some(Verdict::Alive);
        }
        None
    }

    /// Verdict at window expiry: dead only if the quorum was reached.
    pub fn expire(&self) -> Verdict {
        if self.confirms >= self.quorum() {
            Verdict::Dead
        } else {
            Verdict::Alive
        }
    }
}
