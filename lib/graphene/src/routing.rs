//! Routing table: destination node -> ordered gateway chains.
//!
//! A chain is the sequence of gateway ids that, followed in order, delivers
//! a packet to the destination. The empty chain means the destination is a
//! direct neighbor. Index 0 is the currently preferred chain; the rest are
//! fallbacks of equal or higher hop count. Chains expire when no data has
//! been forwarded along them for `stale_after`; the empty chain never does,
//! its liveness is the channel heartbeat's business.

use crate::identity::NodeId;
use hashbrown::HashMap;
use std::time::{Duration, Instant};

pub type GatewayChain = Vec<NodeId>;

/// Optional persistence collaborator. Invoked on every record change so a
/// host can reload routes across restarts.
pub trait RouteStore {
    fn persist(&mut self, dest: NodeId, chains: &[GatewayChain]);
    fn remove(&mut self, dest: NodeId);
}

/// Route table change produced by one mutating call.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RouteChange {
    /// A usable chain appeared for the destination at this index.
    Ready { dest: NodeId, index: usize },
    /// The chain at this index went away.
    Lost { dest: NodeId, index: usize },
    /// No chains remain for the destination.
    Unreachable { dest: NodeId },
}

struct ChainEntry {
    hops: GatewayChain,
    last_used: Instant,
}

struct RouteRecord {
    chains: Vec<ChainEntry>,
    fresh_at: Instant,
}

pub struct RoutingTable {
    records: HashMap<NodeId, RouteRecord>,
    /// Flood deduplication: (initiator, request id) -> first seen.
    seen_requests: HashMap<(NodeId, u64), Instant>,
    stale_after: Duration,
    request_gc_after: Duration,
    store: Option<Box<dyn RouteStore>>,
}

impl RoutingTable {
    pub fn new(stale_after: Duration) -> RoutingTable {
        RoutingTable {
            records: HashMap::new(),
            seen_requests: HashMap::new(),
            stale_after,
            request_gc_after: stale_after,
            store: None,
        }
    }

    pub fn with_store(stale_after: Duration, store: Box<dyn RouteStore>) -> RoutingTable {
        let mut table = RoutingTable::new(stale_after);
        table.store = Some(store);
        table
    }

    fn persist(&mut self, dest: NodeId) {
        if let Some(store) = self.store.as_mut() {
            match self.records.get(&dest) {
                Some(record) => {
                    let chains: Vec<GatewayChain> =
                        record.chains.iter().map(|entry| entry.hops.clone()).collect();
                    store.persist(dest, &chains);
                }
                None => store.remove(dest),
            }
        }
    }

    #[inline]
    pub fn has_route(&self, dest: NodeId) -> bool {
        self.records
            .get(&dest)
            .map_or(false, |record| !record.chains.is_empty())
    }

    pub fn is_neighbor(&self, dest: NodeId) -> bool {
        self.records
            .get(&dest)
            .map_or(false, |record| record.chains.iter().any(|entry| entry.hops.is_empty()))
    }

    /// When the record for `dest` was last updated.
    pub fn freshness(&self, dest: NodeId) -> Option<Instant> {
        self.records.get(&dest).map(|record| record.fresh_at)
    }

    /// Next hop towards `dest` along the preferred chain: the destination
    /// itself when it is a neighbor, otherwise the chain's first gateway.
    pub fn next_hop(&self, dest: NodeId) -> Option<NodeId> {
        let record = self.records.get(&dest)?;
        let entry = record.chains.first()?;

        Some(entry.hops.first().cloned().unwrap_or(dest))
    }

    pub fn chains(&self, dest: NodeId) -> Vec<GatewayChain> {
        self.records
            .get(&dest)
            .map(|record| record.chains.iter().map(|entry| entry.hops.clone()).collect())
            .unwrap_or_default()
    }

    /// Registers a direct neighbor (the empty chain, always preferred).
    pub fn insert_neighbor(&mut self, peer: NodeId, now: Instant) -> Option<RouteChange> {
        let record = self.records.entry(peer).or_insert_with(|| RouteRecord {
            chains: Vec::new(),
            fresh_at: now,
        });

        if record.chains.iter().any(|entry| entry.hops.is_empty()) {
            return None;
        }

        record.chains.insert(
            0,
            ChainEntry {
                hops: Vec::new(),
                last_used: now,
            },
        );
        record.fresh_at = now;

        self.persist(peer);
        Some(RouteChange::Ready { dest: peer, index: 0 })
    }

    /// Records a discovered chain for `dest`. Duplicates only refresh;
    /// shorter chains move ahead of longer fallbacks.
    pub fn record_chain(
        &mut self,
        dest: NodeId,
        chain: GatewayChain,
        now: Instant,
    ) -> Option<RouteChange> {
        let change = {
            let record = self.records.entry(dest).or_insert_with(|| RouteRecord {
                chains: Vec::new(),
                fresh_at: now,
            });

            record.fresh_at = now;

            if let Some(existing) = record.chains.iter_mut().find(|entry| entry.hops == chain) {
                existing.last_used = now;
                None
            } else {
                // Insert keeping the chains ordered by hop count, new chains
                // after equal-length ones (fallbacks in arrival order).
                let index = record
                    .chains
                    .iter()
                    .position(|entry| entry.hops.len() > chain.len())
                    .unwrap_or(record.chains.len());

                record.chains.insert(
                    index,
                    ChainEntry {
                        hops: chain,
                        last_used: now,
                    },
                );

                Some(RouteChange::Ready { dest, index })
            }
        };

        if change.is_some() {
            self.persist(dest);
        }

        change
    }

    /// Refreshes the preferred chain after data was forwarded along it.
    pub fn mark_forwarded(&mut self, dest: NodeId, now: Instant) {
        if let Some(record) = self.records.get_mut(&dest) {
            if let Some(entry) = record.chains.first_mut() {
                entry.last_used = now;
            }
        }
    }

    /// Tears down everything that depended on the direct channel to `peer`:
    /// the neighbor chain for `peer` itself and every chain whose first hop
    /// is `peer`.
    pub fn neighbor_lost(&mut self, peer: NodeId) -> Vec<RouteChange> {
        let mut changes = Vec::new();
        let mut emptied = Vec::new();
        let mut touched = Vec::new();

        for (&dest, record) in self.records.iter_mut() {
            let before = record.chains.len();
            let mut index = 0;

            record.chains.retain(|entry| {
                let broken = if dest == peer {
                    entry.hops.is_empty() || entry.hops.first() == Some(&peer)
                } else {
                    entry.hops.first() == Some(&peer)
                };

                if broken {
                    changes.push(RouteChange::Lost { dest, index });
                }

                index += 1;
                !broken
            });

            if record.chains.len() != before {
                touched.push(dest);
            }

            if record.chains.is_empty() {
                emptied.push(dest);
            }
        }

        for dest in emptied {
            self.records.remove(&dest);
            changes.push(RouteChange::Unreachable { dest });
            self.persist(dest);
        }

        for dest in touched {
            if self.records.contains_key(&dest) {
                self.persist(dest);
            }
        }

        changes
    }

    /// Removes the whole record for `dest`.
    pub fn remove_destination(&mut self, dest: NodeId) -> Vec<RouteChange> {
        let mut changes = Vec::new();

        if let Some(record) = self.records.remove(&dest) {
            for index in 0..record.chains.len() {
                changes.push(RouteChange::Lost { dest, index });
            }

            changes.push(RouteChange::Unreachable { dest });
            self.persist(dest);
        }

        changes
    }

    /// Drops every chain through the given gateway towards `dest` (an
    /// unreachable notification names the gateway, not our neighbor).
    pub fn gateway_lost(&mut self, dest: NodeId, gateway: NodeId) -> Vec<RouteChange> {
        let mut changes = Vec::new();
        let mut empty = false;

        if let Some(record) = self.records.get_mut(&dest) {
            let mut index = 0;

            record.chains.retain(|entry| {
                let broken = entry.hops.contains(&gateway);

                if broken {
                    changes.push(RouteChange::Lost { dest, index });
                }

                index += 1;
                !broken
            });

            empty = record.chains.is_empty();
        }

        if empty {
            self.records.remove(&dest);
            changes.push(RouteChange::Unreachable { dest });
        }

        if !changes.is_empty() {
            self.persist(dest);
        }

        changes
    }

    /// Expires chains with no forwarded data for `stale_after`. The empty
    /// chain is exempt.
    pub fn sweep_stale(&mut self, now: Instant) -> Vec<RouteChange> {
        let mut changes = Vec::new();
        let mut emptied = Vec::new();
        let stale_after = self.stale_after;

        for (&dest, record) in self.records.iter_mut() {
            let mut index = 0;

            record.chains.retain(|entry| {
                let stale =
                    !entry.hops.is_empty() && now.duration_since(entry.last_used) >= stale_after;

                if stale {
                    changes.push(RouteChange::Lost { dest, index });
                }

                index += 1;
                !stale
            });

            if record.chains.is_empty() {
                emptied.push(dest);
            }
        }

        for dest in emptied {
            self.records.remove(&dest);
            changes.push(RouteChange::Unreachable { dest });
            self.persist(dest);
        }

        let request_gc_after = self.request_gc_after;
        self.seen_requests
            .retain(|_, &mut first_seen| now.duration_since(first_seen) < request_gc_after);

        changes
    }

    /// Flood deduplication. True the first time a request id is seen.
    pub fn note_request(&mut self, initiator: NodeId, request_id: u64, now: Instant) -> bool {
        match self.seen_requests.insert((initiator, request_id), now) {
            Some(_) => false,
            None => true,
        }
    }

    /// Routing records rendered as "<destination>: <chain>" lines.
    pub fn dump_records(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .records
            .iter()
            .map(|(dest, record)| {
                let chains: Vec<String> = record
                    .chains
                    .iter()
                    .map(|entry| {
                        if entry.hops.is_empty() {
                            "direct".to_string()
                        } else {
                            entry
                                .hops
                                .iter()
                                .map(|id| id.to_string())
                                .collect::<Vec<_>>()
                                .join(" -> ")
                        }
                    })
                    .collect();

                format!("{}: [{}]", dest, chains.join(", "))
            })
            .collect();

        lines.sort();
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: NodeId = NodeId(0xA);
    const B: NodeId = NodeId(0xB);
    const G1: NodeId = NodeId(0x100);
    const G2: NodeId = NodeId(0x200);

    fn table() -> RoutingTable {
        RoutingTable::new(Duration::from_secs(50))
    }

    #[test]
    fn test_neighbor_is_preferred() {
        let mut rt = table();
        let now = Instant::now();

        assert_eq!(
            rt.insert_neighbor(A, now),
            Some(RouteChange::Ready { dest: A, index: 0 })
        );
        assert_eq!(rt.insert_neighbor(A, now), None);
        assert!(rt.is_neighbor(A));
        assert_eq!(rt.next_hop(A), Some(A));
    }

    #[test]
    fn test_chain_ordering_by_length() {
        let mut rt = table();
        let now = Instant::now();

        rt.record_chain(B, vec![G1, G2], now);
        assert_eq!(rt.next_hop(B), Some(G1));

        // A shorter chain takes over the preferred slot.
        rt.record_chain(B, vec![G2], now);
        assert_eq!(rt.next_hop(B), Some(G2));
        assert_eq!(rt.chains(B), vec![vec![G2], vec![G1, G2]]);
    }

    #[test]
    fn test_duplicate_chain_only_refreshes() {
        let mut rt = table();
        let now = Instant::now();

        assert!(rt.record_chain(B, vec![G1], now).is_some());
        assert!(rt.record_chain(B, vec![G1], now).is_none());
        assert_eq!(rt.chains(B).len(), 1);
    }

    #[test]
    fn test_equal_length_fallbacks_keep_arrival_order() {
        let mut rt = table();
        let now = Instant::now();

        rt.record_chain(B, vec![G1], now);
        rt.record_chain(B, vec![G2], now);

        assert_eq!(rt.chains(B), vec![vec![G1], vec![G2]]);
        assert_eq!(rt.next_hop(B), Some(G1));
    }

    #[test]
    fn test_neighbor_lost_cuts_first_hop_chains() {
        let mut rt = table();
        let now = Instant::now();

        rt.insert_neighbor(G1, now);
        rt.record_chain(B, vec![G1, G2], now);
        rt.record_chain(A, vec![G2], now);

        let changes = rt.neighbor_lost(G1);

        assert!(changes.contains(&RouteChange::Unreachable { dest: B }));
        assert!(changes.contains(&RouteChange::Unreachable { dest: G1 }));
        assert!(rt.has_route(A));
        assert!(!rt.has_route(B));
        assert!(!rt.has_route(G1));
    }

    #[test]
    fn test_gateway_lost_mid_chain() {
        let mut rt = table();
        let now = Instant::now();

        rt.record_chain(B, vec![G1, G2], now);

        let changes = rt.gateway_lost(B, G2);

        assert_eq!(
            changes,
            vec![
                RouteChange::Lost { dest: B, index: 0 },
                RouteChange::Unreachable { dest: B }
            ]
        );
    }

    #[test]
    fn test_stale_sweep_spares_neighbors() {
        let mut rt = table();
        let now = Instant::now();

        rt.insert_neighbor(A, now);
        rt.record_chain(B, vec![G1], now);

        let later = now + Duration::from_secs(60);
        let changes = rt.sweep_stale(later);

        assert!(changes.contains(&RouteChange::Unreachable { dest: B }));
        assert!(rt.is_neighbor(A));
    }

    #[test]
    fn test_forwarding_defers_staleness() {
        let mut rt = table();
        let now = Instant::now();

        rt.record_chain(B, vec![G1], now);
        rt.mark_forwarded(B, now + Duration::from_secs(40));

        assert!(rt.sweep_stale(now + Duration::from_secs(60)).is_empty());
        assert!(!rt.sweep_stale(now + Duration::from_secs(95)).is_empty());
    }

    #[test]
    fn test_request_dedup() {
        let mut rt = table();
        let now = Instant::now();

        assert!(rt.note_request(A, 7, now));
        assert!(!rt.note_request(A, 7, now));
        assert!(rt.note_request(A, 8, now));
        assert!(rt.note_request(B, 7, now));
    }

    #[test]
    fn test_dump_records() {
        let mut rt = table();
        let now = Instant::now();

        rt.insert_neighbor(A, now);
        rt.record_chain(B, vec![G1], now);

        let dump = rt.dump_records();

        assert_eq!(dump.len(), 2);
        assert!(dump.iter().any(|line| line.contains("direct")));
    }

    struct RecordingStore {
        persisted: std::rc::Rc<std::cell::RefCell<Vec<NodeId>>>,
    }

    impl RouteStore for RecordingStore {
        fn persist(&mut self, dest: NodeId, _chains: &[GatewayChain]) {
            self.persisted.borrow_mut().push(dest);
        }

        fn remove(&mut self, _dest: NodeId) {}
    }

    #[test]
    fn test_store_notified_on_changes() {
        let persisted = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let store = RecordingStore {
            persisted: persisted.clone(),
        };

        let mut rt = RoutingTable::with_store(Duration::from_secs(50), Box::new(store));
        rt.record_chain(B, vec![G1], Instant::now());

        assert_eq!(&*persisted.borrow(), &vec![B]);
    }
}
