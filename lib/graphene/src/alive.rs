//! Liveness tracking for nodes reachable only through gateways.
//!
//! Direct neighbors (siblings) are covered by their channel's heartbeat and
//! sit in a plain set. Remote nodes announce themselves periodically; each
//! accepted announcement refreshes an expiration deadline. A looping floor
//! suppresses announcements arriving tighter than half the interval, which
//! is the signature of a flood echo.

use crate::identity::NodeId;
use hashbrown::{HashMap, HashSet};
use std::time::{Duration, Instant};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

const EXPIRY_FACTOR: u32 = 3;

/// Outcome of processing one inbound announcement.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AliveVerdict {
    /// Direct neighbor, nothing to track.
    Sibling,
    /// Announcement arrived under the looping floor; drop it, do not
    /// re-flood.
    Suppressed,
    /// Known node refreshed.
    Refreshed,
    /// First sign of life from this node.
    NewlyAlive,
}

struct AliveEntry {
    deadline: Instant,
    loop_floor: Instant,
}

pub struct AliveController {
    id: NodeId,
    interval: Duration,
    exp_timeout: Duration,
    looping_interval: Duration,
    next_announce: Instant,
    siblings: HashSet<NodeId>,
    entries: HashMap<NodeId, AliveEntry>,
}

impl AliveController {
    pub fn new(id: NodeId, interval: Duration) -> AliveController {
        AliveController {
            id,
            interval,
            exp_timeout: interval * EXPIRY_FACTOR,
            looping_interval: interval / 2,
            next_announce: Instant::now(),
            siblings: HashSet::new(),
            entries: HashMap::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn add_sibling(&mut self, id: NodeId) {
        self.siblings.insert(id);
        // A remote entry for a node that became a neighbor is obsolete.
        self.entries.remove(&id);
    }

    /// Forcibly expires a node, e.g. on channel loss or an unreachable
    /// notification. True when the node was known.
    pub fn expire(&mut self, id: NodeId) -> bool {
        if self.siblings.remove(&id) {
            return true;
        }

        self.entries.remove(&id).is_some()
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.siblings.contains(&id) || self.entries.contains_key(&id)
    }

    /// Processes one announcement for `id` observed at `now`.
    pub fn update_if(&mut self, id: NodeId, now: Instant) -> AliveVerdict {
        if self.siblings.contains(&id) {
            return AliveVerdict::Sibling;
        }

        if let Some(entry) = self.entries.get_mut(&id) {
            if now < entry.loop_floor {
                return AliveVerdict::Suppressed;
            }

            entry.deadline = now + self.exp_timeout;
            entry.loop_floor = now + self.looping_interval;
            return AliveVerdict::Refreshed;
        }

        self.entries.insert(
            id,
            AliveEntry {
                deadline: now + self.exp_timeout,
                loop_floor: now + self.looping_interval,
            },
        );

        AliveVerdict::NewlyAlive
    }

    /// True when it is time to announce ourselves again.
    pub fn announce_due(&self, now: Instant) -> bool {
        now >= self.next_announce
    }

    pub fn mark_announced(&mut self, now: Instant) {
        self.next_announce = now + self.interval;
    }

    /// Removes every entry past its deadline.
    pub fn check_expiration(&mut self, now: Instant) -> Vec<NodeId> {
        let mut expired = Vec::new();

        self.entries.retain(|&id, entry| {
            if entry.deadline <= now {
                expired.push(id);
                false
            } else {
                true
            }
        });

        expired
    }
}
