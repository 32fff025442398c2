//! # Gossip Message Log
//!
//! Flood-gossip dedup state: a bounded log of payload digests with FIFO
//! eviction by first sight, plus the origination counter and payload format.
//!
//! The dedup key is `blake3(payload)`. The cache is an [`LruCache`] used
//! insert-only: lookups go through the non-promoting `contains`, so the
//! internal LRU order stays equal to insertion order and eviction is FIFO
//! even when duplicates keep re-arriving.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;

use crate::identity::NodeId;

/// Period between originated messages.
pub const GOSSIP_INTERVAL: Duration = Duration::from_secs(5);

/// Messages a peer originates before going forward-only.
pub const MAX_ORIGINATED: u64 = 10;

/// Message log capacity. Sized well past diameter × rate × retention for the
/// overlay scales this system targets, so a message cannot outlive its own
/// propagation.
pub const MESSAGE_LOG_CAP: usize = 8192;

/// Dedup key: blake3 of the payload string.
pub type Digest = [u8; 32];

/// What the log remembers about a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Seen {
    pub first_seen: u64,
    pub originator: NodeId,
}

/// Bounded FIFO log of seen gossip digests.
pub struct MessageLog {
    cache: LruCache<Digest, Seen>,
}

impl MessageLog {
    pub fn new(cap: usize) -> Self {
        let cap = NonZeroUsize::new(cap.max(1)).expect("max(1) is non-zero");
        Self {
            cache: LruCache::new(cap),
        }
    }

    pub fn digest(payload: &str) -> Digest {
        *blake3::hash(payload.as_bytes()).as_bytes()
    }

    /// Record a payload on first sight. Returns its digest when new,
    /// `None` when the payload was already seen (caller drops the frame).
    pub fn observe(&mut self, payload: &str, now: u64, originator: NodeId) -> Option<Digest> {
        let digest = Self::digest(payload);
        if self.cache.contains(&digest) {
            return None;
        }
        self.cache.put(
            digest,
            Seen {
                first_seen: now,
                originator,
            },
        );
        Some(digest)
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.cache.contains(digest)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Tracks how many messages this peer has originated.
#[derive(Clone, Copy, Debug)]
pub struct Originator {
    next_seq: u64,
    max: u64,
}

impl Originator {
    pub fn new(max: u64) -> Self {
        Self { next_seq: 1, max }
    }

    /// The next sequence number, or `None` once the budget is spent.
    pub fn next(&mut self) -> Option<u64> {
        if self.next_seq > self.max {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        Some(seq)
    }

    pub fn originated(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn exhausted(&self) -> bool {
        self.next_seq > self.max
    }
}

/// The originated payload format: `<timestamp>:<originator>:<seq_no>`.
pub fn payload_for(timestamp: u64, originator: NodeId, seq_no: u64) -> String {
    format!("{timestamp}:{originator}:{seq_no}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(port: u16) -> NodeId {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn first_sight_then_duplicate() {
        let mut log = MessageLog::new(16);
        let payload = payload_for(1_700_000_000, id(6001), 1);

        let digest = log.observe(&payload, 1_700_000_000, id(6001));
        assert!(digest.is_some());
        assert!(log.contains(&digest.unwrap()));

        assert_eq!(log.observe(&payload, 1_700_000_005, id(6001)), None);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn eviction_is_fifo_by_first_sight() {
        let mut log = MessageLog::new(2);
        let a = payload_for(1, id(6001), 1);
        let b = payload_for(2, id(6001), 2);
        let c = payload_for(3, id(6001), 3);

        let da = log.observe(&a, 1, id(6001)).unwrap();
        let db = log.observe(&b, 2, id(6001)).unwrap();

        // Duplicate arrivals of the oldest entry must not refresh it.
        assert_eq!(log.observe(&a, 4, id(6001)), None);
        assert_eq!(log.observe(&a, 5, id(6001)), None);

        let dc = log.observe(&c, 6, id(6001)).unwrap();
        assert!(!log.contains(&da), "oldest entry evicted first");
        assert!(log.contains(&db));
        assert!(log.contains(&dc));
    }

    #[test]
    fn distinct_payloads_distinct_digests() {
        let p1 = payload_for(1_700_000_000, id(6001), 1);
        let p2 = payload_for(1_700_000_000, id(6001), 2);
        let p3 = payload_for(1_700_000_000, id(6002), 1);
        assert_ne!(MessageLog::digest(&p1), MessageLog::digest(&p2));
        assert_ne!(MessageLog::digest(&p1), MessageLog::digest(&p3));
    }

    #[test]
    fn origination_budget() {
        let mut origin = Originator::new(3);
        assert_eq!(origin.next(), Some(1));
        assert_eq!(origin.next(), Some(2));
        assert_eq!(origin.next(), Some(3));
        assert_eq!(origin.next(), None);
        assert_eq!(origin.next(), None);
        assert!(origin.exhausted());
        assert_eq!(origin.originated(), 3);
    }

    #[test]
    fn payload_format() {
        assert_eq!(
            payload_for(1_700_000_000, id(6001), 4),
            "1700000000:127.0.0.1:6001:4"
        );
    }
}
