//! # Membership Ledger
//!
//! The seed-side consensus state: the authoritative set of live peers plus
//! per-proposal vote and report tallies. This is a pure state machine: the
//! [`crate::seed`] actor feeds it frames and acts on the returned outcomes,
//! so every consensus rule is testable without a socket.
//!
//! Majority is `floor(n_seeds/2) + 1` over the configured directory. ADD
//! counts distinct voting seeds; REMOVE counts distinct reporters that are
//! themselves live peers or seeds.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::identity::NodeId;

/// Result of tallying one ADD vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddVote {
    /// The subject is already live; no proposal is opened.
    AlreadyLive,
    /// Vote recorded; the proposal holds this many distinct votes.
    Pending(usize),
    /// This vote reached majority: the subject is now live.
    Committed,
}

/// Result of tallying one DEAD_NODE report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveReport {
    /// Reporter is neither a live peer nor a seed; not counted.
    Unauthorized,
    /// Report recorded; this many distinct reporters so far.
    Pending(usize),
    /// This report reached majority: the subject has been removed.
    Committed,
}

/// One seed's view of overlay membership and in-flight proposals.
#[derive(Debug)]
pub struct Ledger {
    majority: usize,
    live: BTreeSet<NodeId>,
    pending_add: HashMap<NodeId, BTreeSet<NodeId>>,
    pending_remove: HashMap<NodeId, BTreeSet<NodeId>>,
}

impl Ledger {
    pub fn new(n_seeds: usize) -> Self {
        Self {
            majority: n_seeds / 2 + 1,
            live: BTreeSet::new(),
            pending_add: HashMap::new(),
            pending_remove: HashMap::new(),
        }
    }

    pub fn majority(&self) -> usize {
        self.majority
    }

    pub fn is_live(&self, id: &NodeId) -> bool {
        self.live.contains(id)
    }

    pub fn live_peers(&self) -> Vec<NodeId> {
        self.live.iter().copied().collect()
    }

    /// The `PEER_LIST` answer for a registrant: every live peer but itself.
    pub fn peer_list_excluding(&self, peer: NodeId) -> Vec<NodeId> {
        self.live.iter().copied().filter(|p| *p != peer).collect()
    }

    pub fn has_pending_add(&self, peer: &NodeId) -> bool {
        self.pending_add.contains_key(peer)
    }

    /// Tally an ADD vote from `voter`. Duplicate votes from the same seed
    /// are idempotent. Reaching majority commits the peer and clears the
    /// proposal.
    pub fn record_add_vote(&mut self, peer: NodeId, voter: NodeId) -> AddVote {
        if self.live.contains(&peer) {
            return AddVote::AlreadyLive;
        }
        let votes = self.pending_add.entry(peer).or_default();
        votes.insert(voter);
        if votes.len() >= self.majority {
            self.pending_add.remove(&peer);
            self.live.insert(peer);
            AddVote::Committed
        } else {
            AddVote::Pending(self.pending_add[&peer].len())
        }
    }

    /// Apply a `COMMIT_ADD` heard from another seed. Returns true when this
    /// changed the live set.
    pub fn apply_commit_add(&mut self, peer: NodeId) -> bool {
        self.pending_add.remove(&peer);
        self.live.insert(peer)
    }

    /// Tally a DEAD_NODE report. `reporter_is_seed` is the directory check
    /// done by the caller; live-peer status is checked here. Reaching
    /// majority removes the subject and clears its state so a fresh
    /// registration can re-admit it.
    pub fn record_dead_report(
        &mut self,
        dead: NodeId,
        reporter: NodeId,
        reporter_is_seed: bool,
    ) -> RemoveReport {
        if !reporter_is_seed && !self.live.contains(&reporter) {
            debug!(%dead, %reporter, "dropping dead-node report from unknown reporter");
            return RemoveReport::Unauthorized;
        }
        let reporters = self.pending_remove.entry(dead).or_default();
        reporters.insert(reporter);
        if reporters.len() >= self.majority {
            self.commit_remove(dead);
            RemoveReport::Committed
        } else {
            RemoveReport::Pending(self.pending_remove[&dead].len())
        }
    }

    /// Apply a `PROPOSE_REMOVE` commit notification from another seed.
    /// Returns true when this changed the live set.
    pub fn apply_commit_remove(&mut self, dead: NodeId) -> bool {
        let was_live = self.live.contains(&dead);
        self.commit_remove(dead);
        was_live
    }

    fn commit_remove(&mut self, dead: NodeId) {
        self.live.remove(&dead);
        self.pending_remove.remove(&dead);
        self.pending_add.remove(&dead);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(port: u16) -> NodeId {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn seed(n: u16) -> NodeId {
        id(5000 + n)
    }

    #[test]
    fn add_commits_at_majority_of_three() {
        let mut ledger = Ledger::new(3);
        assert_eq!(ledger.majority(), 2);

        assert_eq!(ledger.record_add_vote(id(6001), seed(1)), AddVote::Pending(1));
        assert!(!ledger.is_live(&id(6001)));
        assert_eq!(ledger.record_add_vote(id(6001), seed(2)), AddVote::Committed);
        assert!(ledger.is_live(&id(6001)));
        assert!(!ledger.has_pending_add(&id(6001)));
    }

    #[test]
    fn single_seed_commits_immediately() {
        let mut ledger = Ledger::new(1);
        assert_eq!(ledger.record_add_vote(id(6001), seed(1)), AddVote::Committed);
        assert!(ledger.is_live(&id(6001)));
    }

    #[test]
    fn duplicate_votes_do_not_double_count() {
        let mut ledger = Ledger::new(3);
        assert_eq!(ledger.record_add_vote(id(6001), seed(1)), AddVote::Pending(1));
        assert_eq!(ledger.record_add_vote(id(6001), seed(1)), AddVote::Pending(1));
        assert!(!ledger.is_live(&id(6001)));
    }

    #[test]
    fn vote_for_live_peer_reports_already_live() {
        let mut ledger = Ledger::new(1);
        ledger.record_add_vote(id(6001), seed(1));
        assert_eq!(ledger.record_add_vote(id(6001), seed(1)), AddVote::AlreadyLive);
        assert_eq!(ledger.live_peers().len(), 1);
    }

    #[test]
    fn minority_stalls_without_commit() {
        let mut ledger = Ledger::new(5);
        assert_eq!(ledger.majority(), 3);
        ledger.record_add_vote(id(6001), seed(1));
        assert_eq!(ledger.record_add_vote(id(6001), seed(2)), AddVote::Pending(2));
        assert!(!ledger.is_live(&id(6001)));
        assert!(ledger.has_pending_add(&id(6001)));
    }

    #[test]
    fn peer_list_excludes_the_registrant() {
        let mut ledger = Ledger::new(1);
        ledger.record_add_vote(id(6001), seed(1));
        ledger.record_add_vote(id(6002), seed(1));
        assert_eq!(ledger.peer_list_excluding(id(6001)), vec![id(6002)]);
        assert_eq!(ledger.peer_list_excluding(id(6003)), vec![id(6001), id(6002)]);
    }

    #[test]
    fn remove_counts_live_peers_and_seeds_only() {
        let mut ledger = Ledger::new(3);
        ledger.record_add_vote(id(6001), seed(1));
        ledger.record_add_vote(id(6001), seed(2));
        ledger.record_add_vote(id(6002), seed(1));
        ledger.record_add_vote(id(6002), seed(2));

        // Unknown reporter is dropped.
        assert_eq!(
            ledger.record_dead_report(id(6001), id(7777), false),
            RemoveReport::Unauthorized
        );
        // Live peer counts.
        assert_eq!(
            ledger.record_dead_report(id(6001), id(6002), false),
            RemoveReport::Pending(1)
        );
        // A seed counts and completes the quorum of two.
        assert_eq!(
            ledger.record_dead_report(id(6001), seed(3), true),
            RemoveReport::Committed
        );
        assert!(!ledger.is_live(&id(6001)));
        assert!(ledger.is_live(&id(6002)));
    }

    #[test]
    fn duplicate_reports_do_not_double_count() {
        let mut ledger = Ledger::new(3);
        ledger.record_add_vote(id(6001), seed(1));
        ledger.record_add_vote(id(6001), seed(2));

        assert_eq!(
            ledger.record_dead_report(id(6001), seed(1), true),
            RemoveReport::Pending(1)
        );
        assert_eq!(
            ledger.record_dead_report(id(6001), seed(1), true),
            RemoveReport::Pending(1)
        );
        assert!(ledger.is_live(&id(6001)));
    }

    #[test]
    fn removal_reopens_registration() {
        let mut ledger = Ledger::new(1);
        ledger.record_add_vote(id(6001), seed(1));
        assert_eq!(
            ledger.record_dead_report(id(6001), seed(1), true),
            RemoveReport::Committed
        );
        assert!(!ledger.is_live(&id(6001)));

        // Fresh ADD proposal works after removal.
        assert_eq!(ledger.record_add_vote(id(6001), seed(1)), AddVote::Committed);
        assert!(ledger.is_live(&id(6001)));
    }

    #[test]
    fn commit_notifications_apply_directly() {
        let mut ledger = Ledger::new(3);
        assert!(ledger.apply_commit_add(id(6001)));
        assert!(!ledger.apply_commit_add(id(6001)));
        assert!(ledger.is_live(&id(6001)));

        assert!(ledger.apply_commit_remove(id(6001)));
        assert!(!ledger.apply_commit_remove(id(6001)));
        assert!(!ledger.is_live(&id(6001)));
    }
}
