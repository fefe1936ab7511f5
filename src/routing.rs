//! K-bucket routing table.
//!
//! 256 buckets, one per bit of XOR distance from the local id. Each bucket
//! holds up to 8 peers ordered least-recently-seen first, plus a replacement
//! cache that backfills evictions. Peers with 3 consecutive failures are
//! dropped.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::metric::{self, Distance};
use crate::node::{NodeId, Peer};

const K: usize = 8;
const NUM_BUCKETS: usize = 256;
const MAX_FAILURES: u8 = 3;
const GOOD_FOR: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
struct Entry {
    peer: Peer,
    last_seen: Instant,
    failures: u8,
}

impl Entry {
    fn new(peer: Peer) -> Self {
        Self {
            peer,
            last_seen: Instant::now(),
            failures: 0,
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failures = 0;
    }

    fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    fn is_good(&self) -> bool {
        self.failures == 0 && self.last_seen.elapsed() < GOOD_FOR
    }

    fn is_bad(&self) -> bool {
        self.failures >= MAX_FAILURES
    }
}

#[derive(Debug)]
struct Bucket {
    entries: VecDeque<Entry>,
    replacement_cache: VecDeque<Entry>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(K),
            replacement_cache: VecDeque::with_capacity(K),
        }
    }

    fn add(&mut self, peer: Peer) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.peer.id == peer.id) {
            let mut existing = self.entries.remove(pos).unwrap();
            existing.touch();
            existing.peer = peer;
            self.entries.push_back(existing);
            return true;
        }

        if self.entries.len() < K {
            self.entries.push_back(Entry::new(peer));
            return true;
        }

        if self.replacement_cache.len() < K {
            self.replacement_cache.push_back(Entry::new(peer));
        }

        false
    }

    fn remove(&mut self, id: &NodeId) -> Option<Entry> {
        if let Some(pos) = self.entries.iter().position(|e| &e.peer.id == id) {
            let removed = self.entries.remove(pos);

            if let Some(replacement) = self.replacement_cache.pop_front() {
                self.entries.push_back(replacement);
            }

            return removed;
        }

        None
    }

    fn get_mut(&mut self, id: &NodeId) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| &e.peer.id == id)
    }

    fn oldest(&self) -> Option<&Entry> {
        self.entries.front()
    }

    fn good_peers(&self) -> impl Iterator<Item = &Peer> {
        self.entries
            .iter()
            .filter(|e| e.is_good())
            .map(|e| &e.peer)
    }
}

/// The local peer's view of the network, keyed by XOR distance.
pub struct RoutingTable {
    id: NodeId,
    buckets: Vec<RwLock<Bucket>>,
}

impl RoutingTable {
    pub fn new(id: NodeId) -> Self {
        let buckets = (0..NUM_BUCKETS)
            .map(|_| RwLock::new(Bucket::new()))
            .collect();

        Self { id, buckets }
    }

    /// The local node's identity.
    pub fn node_id(&self) -> NodeId {
        self.id
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        let dist = metric::distance(&self.id, id);
        (dist.leading_zeros() as usize).min(NUM_BUCKETS - 1)
    }

    /// Records a peer. The local id is never stored; a known id refreshes
    /// its entry (and adopts the peer's current endpoint).
    pub fn add(&self, peer: Peer) {
        if peer.id == self.id {
            return;
        }

        let mut bucket = self.buckets[self.bucket_index(&peer.id)].write();
        bucket.add(peer);
    }

    pub fn remove(&self, id: &NodeId) {
        let mut bucket = self.buckets[self.bucket_index(id)].write();
        bucket.remove(id);
    }

    /// Counts a query failure against a peer, evicting it after the third.
    pub fn mark_failed(&self, id: &NodeId) {
        let mut bucket = self.buckets[self.bucket_index(id)].write();

        if let Some(entry) = bucket.get_mut(id) {
            entry.fail();

            if entry.is_bad() {
                bucket.remove(id);
            }
        }
    }

    pub fn mark_seen(&self, id: &NodeId) {
        let mut bucket = self.buckets[self.bucket_index(id)].write();

        if let Some(entry) = bucket.get_mut(id) {
            entry.touch();
        }
    }

    /// Up to `k` good peers closest to `target`, XOR ascending.
    pub fn closest_to(&self, target: &NodeId, k: usize) -> Vec<Peer> {
        let mut ranked: Vec<(Distance, Peer)> = Vec::new();

        for bucket in &self.buckets {
            let bucket = bucket.read();
            for peer in bucket.good_peers() {
                ranked.push((metric::distance(&peer.id, target), *peer));
            }
        }

        ranked.sort_by(|a, b| a.0.cmp(&b.0));
        ranked.truncate(k);
        ranked.into_iter().map(|(_, peer)| peer).collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices of buckets whose oldest entry has not been seen recently;
    /// candidates for a refresh lookup.
    pub fn stale_buckets(&self) -> Vec<usize> {
        let mut stale = Vec::new();

        for (i, bucket) in self.buckets.iter().enumerate() {
            let bucket = bucket.read();
            if let Some(oldest) = bucket.oldest() {
                if oldest.last_seen.elapsed() > GOOD_FOR {
                    stale.push(i);
                }
            }
        }

        stale
    }

    /// A random id inside the given bucket's distance range, used as the
    /// target of a refresh lookup.
    pub fn random_id_in_bucket(&self, bucket_idx: usize) -> NodeId {
        if bucket_idx >= NUM_BUCKETS {
            return NodeId::generate();
        }

        let mut id = self.id.0;
        let byte_idx = bucket_idx / 8;
        let bit_idx = 7 - (bucket_idx % 8);

        id[byte_idx] ^= 1 << bit_idx;

        if bit_idx > 0 {
            let random_byte: u8 = rand::random();
            let keep_mask = !((1u8 << bit_idx) - 1);
            let random_mask = (1u8 << bit_idx) - 1;
            id[byte_idx] = (id[byte_idx] & keep_mask) | (random_byte & random_mask);
        }

        for byte in id.iter_mut().skip(byte_idx + 1) {
            *byte = rand::random();
        }

        NodeId(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ID_LEN;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn peer_with_id(id: NodeId) -> Peer {
        Peer::new(
            id,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6881),
        )
    }

    fn id(n: u8) -> NodeId {
        let mut bytes = [0u8; ID_LEN];
        bytes[ID_LEN - 1] = n;
        NodeId(bytes)
    }

    #[test]
    fn test_add_and_count() {
        let table = RoutingTable::new(NodeId::generate());

        for _ in 0..10 {
            table.add(peer_with_id(NodeId::generate()));
        }

        assert!(table.len() > 0);
    }

    #[test]
    fn test_never_stores_self() {
        let our_id = NodeId::generate();
        let table = RoutingTable::new(our_id);

        table.add(peer_with_id(our_id));
        assert!(table.is_empty());
    }

    #[test]
    fn test_closest_to_orders_by_distance() {
        let table = RoutingTable::new(NodeId([0xFF; ID_LEN]));

        for n in 1..=20u8 {
            table.add(peer_with_id(id(n)));
        }

        let closest = table.closest_to(&id(0), 8);
        assert_eq!(closest.len(), 8);
        for pair in closest.windows(2) {
            let a = metric::distance(&pair[0].id, &id(0));
            let b = metric::distance(&pair[1].id, &id(0));
            assert!(a < b);
        }
        assert_eq!(closest[0].id, id(1));
    }

    #[test]
    fn test_mark_failed_evicts_after_three() {
        let table = RoutingTable::new(NodeId::generate());
        let peer = peer_with_id(NodeId::generate());
        table.add(peer);

        table.mark_failed(&peer.id);
        table.mark_failed(&peer.id);
        assert_eq!(table.len(), 1);

        table.mark_failed(&peer.id);
        assert!(table.is_empty());
    }

    #[test]
    fn test_failed_peers_are_not_closest_candidates() {
        let table = RoutingTable::new(NodeId([0xFF; ID_LEN]));
        table.add(peer_with_id(id(1)));
        table.add(peer_with_id(id(2)));

        table.mark_failed(&id(1));
        let closest = table.closest_to(&id(0), 8);
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].id, id(2));
    }

    #[test]
    fn test_readd_refreshes_endpoint() {
        let table = RoutingTable::new(NodeId::generate());
        let id = NodeId::generate();
        table.add(peer_with_id(id));

        let moved = Peer::new(
            id,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)), 9999),
        );
        table.add(moved);

        assert_eq!(table.len(), 1);
        let found = table.closest_to(&id, 1);
        assert_eq!(found[0].addr, moved.addr);
    }

    #[test]
    fn test_random_id_in_bucket_lands_in_bucket() {
        let table = RoutingTable::new(NodeId::generate());

        for bucket_idx in [0usize, 7, 100, 255] {
            let id = table.random_id_in_bucket(bucket_idx);
            assert_eq!(table.bucket_index(&id), bucket_idx);
        }
    }
}
