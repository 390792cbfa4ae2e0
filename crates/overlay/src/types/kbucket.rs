use std::{
    collections::HashMap,
    sync::Arc,
    time::Instant,
};

use discv5::enr::NodeId;
use itertools::Itertools;
use parking_lot::RwLock;
use portal_api::types::{
    distance::{Distance, Metric, XorMetric},
    enr::Enr,
};
use rand::seq::IteratorRandom;
use tracing::debug;

use super::node::Node;

/// The replication factor K: maximum live entries per bucket.
pub const MAX_NODES_PER_BUCKET: usize = 16;

/// Maximum entries in a bucket's replacement list.
pub const MAX_REPLACEMENTS_PER_BUCKET: usize = 10;

/// Consecutive request failures after which a live entry is evicted.
pub const MAX_INCIDENT_FAILURES: usize = 4;

/// The number of buckets in the routing table.
pub const NUM_BUCKETS: usize = 256;

/// A live or replacement slot in a bucket.
#[derive(Clone, Debug)]
pub struct BucketEntry {
    pub node: Node,
    pub added_at: Instant,
    pub last_seen: Instant,
    pub fails: usize,
}

impl BucketEntry {
    fn new(node: Node, now: Instant) -> Self {
        Self {
            node,
            added_at: now,
            last_seen: now,
            fails: 0,
        }
    }
}

/// One k-bucket.
///
/// `live` is ordered least-recently-seen first; `replacements` most-recently-seen first. A
/// NodeId never appears in both lists at once.
#[derive(Default)]
struct Bucket {
    live: Vec<BucketEntry>,
    replacements: Vec<BucketEntry>,
}

impl Bucket {
    fn position_live(&self, node_id: NodeId) -> Option<usize> {
        self.live
            .iter()
            .position(|entry| entry.node.enr.node_id() == node_id)
    }

    fn position_replacement(&self, node_id: NodeId) -> Option<usize> {
        self.replacements
            .iter()
            .position(|entry| entry.node.enr.node_id() == node_id)
    }
}

/// The outcome of offering a peer to the routing table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The peer occupies a new live slot.
    Inserted,
    /// The peer already occupied a live slot, which was refreshed.
    Updated,
    /// The bucket is full; the peer sits in the replacement list.
    Replacement,
    /// The peer is the local node and is never tracked.
    SelfEntry,
}

/// The outcome of recording a request failure against a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The failure counter was incremented, the entry stays.
    Retained { fails: usize },
    /// The entry was evicted; the head of the replacement list was promoted, if present.
    Evicted { promoted: Option<NodeId> },
    /// The peer is not tracked in the table.
    Absent,
}

/// Node ids inserted by a batch of discovered ENRs.
#[derive(Default)]
pub struct DiscoveredNodesUpdateResult {
    pub inserted_nodes: Vec<NodeId>,
}

/// A 256-bucket Kademlia routing table keyed by XOR distance from the local node id.
///
/// Entries are values; callers receive `Node` snapshots, never references into the arena.
pub struct RoutingTable {
    local_node_id: NodeId,
    buckets: Box<[Bucket; NUM_BUCKETS]>,
}

impl RoutingTable {
    pub fn new(local_node_id: NodeId) -> Self {
        Self {
            local_node_id,
            buckets: Box::new(std::array::from_fn(|_| Bucket::default())),
        }
    }

    /// Returns the bucket index for a node, or `None` for the local node itself.
    fn bucket_index(&self, node_id: NodeId) -> Option<usize> {
        XorMetric::distance(&self.local_node_id.raw(), &node_id.raw())
            .log2()
            .map(|log2| log2 - 1)
    }

    /// Records direct evidence of a peer's liveness.
    ///
    /// A known live entry is refreshed and moved to the most-recently-seen end; a new peer takes
    /// a free live slot, or a replacement slot when the bucket is full. The replacement list
    /// keeps at most `MAX_REPLACEMENTS_PER_BUCKET` entries, dropping its least-recently-seen
    /// tail.
    pub fn seen(&mut self, enr: Enr, data_radius: Option<Distance>) -> InsertOutcome {
        let node_id = enr.node_id();
        let Some(bucket_index) = self.bucket_index(node_id) else {
            return InsertOutcome::SelfEntry;
        };
        let now = Instant::now();
        let bucket = &mut self.buckets[bucket_index];

        if let Some(position) = bucket.position_live(node_id) {
            let mut entry = bucket.live.remove(position);
            refresh_entry(&mut entry, enr, data_radius, now);
            bucket.live.push(entry);
            return InsertOutcome::Updated;
        }

        if bucket.live.len() < MAX_NODES_PER_BUCKET {
            let mut entry = match bucket.position_replacement(node_id) {
                Some(position) => bucket.replacements.remove(position),
                None => BucketEntry::new(Node::new(enr.clone(), Distance::MAX), now),
            };
            refresh_entry(&mut entry, enr, data_radius, now);
            bucket.live.push(entry);
            return InsertOutcome::Inserted;
        }

        // Full bucket: hold the peer in the replacement list, most-recently-seen first.
        let mut entry = match bucket.position_replacement(node_id) {
            Some(position) => bucket.replacements.remove(position),
            None => BucketEntry::new(Node::new(enr.clone(), Distance::MAX), now),
        };
        refresh_entry(&mut entry, enr, data_radius, now);
        bucket.replacements.insert(0, entry);
        bucket.replacements.truncate(MAX_REPLACEMENTS_PER_BUCKET);
        InsertOutcome::Replacement
    }

    /// Inserts or updates ENRs learned indirectly (from NODES or CONTENT responses).
    ///
    /// An existing entry is updated only when the discovered record is strictly newer; its
    /// liveness timestamp is left alone, because nothing was observed from the peer itself. New
    /// peers enter at the least-recently-seen end so revalidation reaches them promptly.
    pub fn insert_or_update_discovered_nodes(
        &mut self,
        enrs: impl IntoIterator<Item = Enr>,
    ) -> DiscoveredNodesUpdateResult {
        let mut result = DiscoveredNodesUpdateResult::default();
        let now = Instant::now();

        for enr in enrs {
            let node_id = enr.node_id();
            let Some(bucket_index) = self.bucket_index(node_id) else {
                continue;
            };
            let bucket = &mut self.buckets[bucket_index];

            if let Some(position) = bucket.position_live(node_id) {
                let entry = &mut bucket.live[position];
                if entry.node.enr.seq() < enr.seq() {
                    entry.node.set_enr(enr);
                }
            } else if let Some(position) = bucket.position_replacement(node_id) {
                let entry = &mut bucket.replacements[position];
                if entry.node.enr.seq() < enr.seq() {
                    entry.node.set_enr(enr);
                }
            } else if bucket.live.len() < MAX_NODES_PER_BUCKET {
                debug!(inserted = %node_id, "Discovered node inserted into routing table");
                bucket
                    .live
                    .insert(0, BucketEntry::new(Node::new(enr, Distance::MAX), now));
                result.inserted_nodes.push(node_id);
            } else if bucket.replacements.len() < MAX_REPLACEMENTS_PER_BUCKET {
                bucket
                    .replacements
                    .push(BucketEntry::new(Node::new(enr, Distance::MAX), now));
            }
        }

        result
    }

    /// Records a request failure against a peer. The entry is evicted after
    /// `MAX_INCIDENT_FAILURES` consecutive failures, and the most-recently-seen replacement is
    /// promoted into the freed slot.
    pub fn record_failure(&mut self, node_id: NodeId) -> FailureOutcome {
        let Some(bucket_index) = self.bucket_index(node_id) else {
            return FailureOutcome::Absent;
        };
        let bucket = &mut self.buckets[bucket_index];

        if let Some(position) = bucket.position_replacement(node_id) {
            bucket.replacements.remove(position);
            return FailureOutcome::Evicted { promoted: None };
        }

        let Some(position) = bucket.position_live(node_id) else {
            return FailureOutcome::Absent;
        };

        let entry = &mut bucket.live[position];
        entry.fails += 1;
        if entry.fails < MAX_INCIDENT_FAILURES {
            return FailureOutcome::Retained { fails: entry.fails };
        }

        bucket.live.remove(position);
        let promoted = if bucket.replacements.is_empty() {
            None
        } else {
            let mut promoted = bucket.replacements.remove(0);
            promoted.fails = 0;
            let promoted_id = promoted.node.enr.node_id();
            bucket.live.push(promoted);
            Some(promoted_id)
        };
        debug!(evicted = %node_id, promoted = ?promoted, "Evicted unresponsive node");
        FailureOutcome::Evicted { promoted }
    }

    /// Removes a node from the routing table. Returns `true` if the node existed.
    pub fn remove(&mut self, node_id: NodeId) -> bool {
        let Some(bucket_index) = self.bucket_index(node_id) else {
            return false;
        };
        let bucket = &mut self.buckets[bucket_index];
        if let Some(position) = bucket.position_live(node_id) {
            bucket.live.remove(position);
            return true;
        }
        if let Some(position) = bucket.position_replacement(node_id) {
            bucket.replacements.remove(position);
            return true;
        }
        false
    }

    /// Returns the live entry for a node, if present.
    pub fn entry(&self, node_id: NodeId) -> Option<Node> {
        let bucket_index = self.bucket_index(node_id)?;
        let bucket = &self.buckets[bucket_index];
        bucket
            .position_live(node_id)
            .map(|position| bucket.live[position].node.clone())
    }

    /// Updates the stored radius of a live entry.
    pub fn update_radius(&mut self, node_id: NodeId, data_radius: Distance) -> bool {
        let Some(bucket_index) = self.bucket_index(node_id) else {
            return false;
        };
        let bucket = &mut self.buckets[bucket_index];
        match bucket.position_live(node_id) {
            Some(position) => {
                bucket.live[position].node.set_data_radius(data_radius);
                true
            }
            None => false,
        }
    }

    /// Picks the least-recently-seen live entry of a random non-empty bucket for liveness
    /// revalidation.
    pub fn revalidation_candidate(&self) -> Option<Node> {
        self.buckets
            .iter()
            .filter(|bucket| !bucket.live.is_empty())
            .choose(&mut rand::rng())
            .and_then(|bucket| {
                bucket
                    .live
                    .iter()
                    .min_by_key(|entry| entry.last_seen)
                    .map(|entry| entry.node.clone())
            })
    }

    /// Returns up to `limit` live nodes with the smallest XOR distance to `target`. Entries are
    /// sorted by non-decreasing distance; equal distances cannot occur for distinct node ids,
    /// so the secondary node-id ordering never reorders real entries.
    pub fn closest_to(&self, target: &[u8; 32], limit: usize) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.live.iter())
            .sorted_by_cached_key(|entry| {
                let node_id = entry.node.enr.node_id().raw();
                (XorMetric::distance(target, &node_id), node_id)
            })
            .take(limit)
            .map(|entry| entry.node.clone())
            .collect()
    }

    /// Returns up to `limit` live nodes whose log2-distance to the local node is in
    /// `log2_distances`. Distance 0 (the local node) is the caller's concern.
    pub fn nodes_by_distances(&self, log2_distances: &[u16], limit: usize) -> Vec<Enr> {
        let mut result = vec![];
        for log2_distance in log2_distances.iter().sorted().dedup() {
            if !(1..=256u16).contains(log2_distance) {
                continue;
            }
            let bucket = &self.buckets[*log2_distance as usize - 1];
            for entry in &bucket.live {
                result.push(entry.node.enr());
                if result.len() >= limit {
                    return result;
                }
            }
        }
        result
    }

    /// Returns all live nodes whose advertised radius covers `content_id`.
    pub fn interested_in(&self, content_id: &[u8; 32]) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.live.iter())
            .filter(|entry| {
                let node_id = entry.node.enr.node_id().raw();
                XorMetric::distance(content_id, &node_id) <= entry.node.data_radius
            })
            .map(|entry| entry.node.clone())
            .collect()
    }

    /// Indices of buckets holding at least one live entry.
    pub fn occupied_buckets(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.live.is_empty())
            .map(|(index, _)| index)
            .collect()
    }

    /// The number of live entries across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.live.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns all live ENRs. Should be used only if all ENRs are desired.
    pub fn enrs(&self) -> Vec<Enr> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.live.iter())
            .map(|entry| entry.node.enr())
            .collect()
    }
}

fn refresh_entry(entry: &mut BucketEntry, enr: Enr, data_radius: Option<Distance>, now: Instant) {
    if entry.node.enr.seq() < enr.seq() {
        entry.node.set_enr(enr);
    }
    if let Some(radius) = data_radius {
        entry.node.set_data_radius(radius);
    }
    entry.last_seen = now;
    entry.fails = 0;
}

/// The routing table behind a lock that is safe for async usage.
///
/// Every function holds the lock only for the duration of the function, and no other blocking
/// calls are made during that time. In particular, no lock is ever held across a network round
/// trip.
#[derive(Clone)]
pub struct SharedRoutingTable {
    table: Arc<RwLock<RoutingTable>>,
}

impl SharedRoutingTable {
    pub fn new(local_node_id: NodeId) -> Self {
        Self {
            table: Arc::new(RwLock::new(RoutingTable::new(local_node_id))),
        }
    }

    pub fn seen(&self, enr: Enr, data_radius: Option<Distance>) -> InsertOutcome {
        self.table.write().seen(enr, data_radius)
    }

    pub fn insert_or_update_discovered_nodes(
        &self,
        enrs: impl IntoIterator<Item = Enr>,
    ) -> DiscoveredNodesUpdateResult {
        self.table.write().insert_or_update_discovered_nodes(enrs)
    }

    pub fn record_failure(&self, node_id: NodeId) -> FailureOutcome {
        self.table.write().record_failure(node_id)
    }

    pub fn remove(&self, node_id: NodeId) -> bool {
        self.table.write().remove(node_id)
    }

    pub fn entry(&self, node_id: NodeId) -> Option<Node> {
        self.table.read().entry(node_id)
    }

    pub fn update_radius(&self, node_id: NodeId, data_radius: Distance) -> bool {
        self.table.write().update_radius(node_id, data_radius)
    }

    pub fn revalidation_candidate(&self) -> Option<Node> {
        self.table.read().revalidation_candidate()
    }

    /// Returns up to `limit` node snapshots closest to the given node id.
    pub fn closest_to_node_id(&self, target: NodeId, limit: usize) -> Vec<Node> {
        self.table.read().closest_to(&target.raw(), limit)
    }

    /// Returns up to `limit` node snapshots closest to the given content id.
    pub fn closest_to_content_id(&self, content_id: &[u8; 32], limit: usize) -> Vec<Node> {
        self.table.read().closest_to(content_id, limit)
    }

    pub fn nodes_by_distances(&self, log2_distances: &[u16], limit: usize) -> Vec<Enr> {
        self.table.read().nodes_by_distances(log2_distances, limit)
    }

    pub fn interested_in(&self, content_id: &[u8; 32]) -> Vec<Node> {
        self.table.read().interested_in(content_id)
    }

    /// For each content id, all nodes that are interested in it. The keys of the resulting map
    /// always contain all `content_ids`, with an empty value when nobody is interested.
    pub fn batch_interested_in(
        &self,
        content_ids: &[&[u8; 32]],
    ) -> HashMap<[u8; 32], Vec<Node>> {
        let table = self.table.read();
        content_ids
            .iter()
            .map(|content_id| (**content_id, table.interested_in(content_id)))
            .collect()
    }

    pub fn occupied_buckets(&self) -> Vec<usize> {
        self.table.read().occupied_buckets()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    pub fn enrs(&self) -> Vec<Enr> {
        self.table.read().enrs()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use discv5::enr::CombinedKey;
    use portal_api::generate_random_remote_enr;
    use test_log::test;

    use super::*;

    fn create_table() -> (Enr, RoutingTable) {
        let (_, local_enr) = generate_random_remote_enr();
        let table = RoutingTable::new(local_enr.node_id());
        (local_enr, table)
    }

    fn generate_enr_at_log2_distance(node_id: impl AsRef<[u8]>, log2_distance: usize) -> Enr {
        generate_enr_with_key_at_log2_distance(node_id, log2_distance).1
    }

    fn generate_enr_with_key_at_log2_distance(
        node_id: impl AsRef<[u8]>,
        log2_distance: usize,
    ) -> (CombinedKey, Enr) {
        if !(250..=256).contains(&log2_distance) {
            panic!("log2_distance not in [250, 256] range");
        }
        let node_id = NodeId::parse(node_id.as_ref()).expect("Expected valid node id");
        loop {
            let (sk, enr) = generate_random_remote_enr();
            let distance = XorMetric::distance(&node_id.raw(), &enr.node_id().raw());
            if distance.log2() == Some(log2_distance) {
                return (sk, enr);
            }
        }
    }

    mod insert {
        use super::*;
        use super::test;

        #[test]
        fn simple() {
            let (_local_enr, mut table) = create_table();

            let (_, enr) = generate_random_remote_enr();
            assert_eq!(table.seen(enr.clone(), None), InsertOutcome::Inserted);
            assert!(table.entry(enr.node_id()).is_some());

            // A second observation refreshes, it does not duplicate.
            assert_eq!(table.seen(enr.clone(), None), InsertOutcome::Updated);
            assert_eq!(table.len(), 1);
        }

        #[test]
        fn own_node_id_is_never_tracked() {
            let (local_enr, mut table) = create_table();
            assert_eq!(table.seen(local_enr.clone(), None), InsertOutcome::SelfEntry);
            assert!(table.entry(local_enr.node_id()).is_none());
        }

        #[test]
        fn radius_is_recorded() {
            let (_local_enr, mut table) = create_table();
            let (_, enr) = generate_random_remote_enr();

            table.seen(enr.clone(), Some(Distance::ZERO));
            assert_eq!(
                table.entry(enr.node_id()).unwrap().data_radius(),
                Distance::ZERO
            );
        }
    }

    mod full_bucket {
        use super::*;
        use super::test;

        // Fills one bucket to K entries and returns the table plus the entries in insertion
        // order.
        fn filled_bucket() -> (Enr, RoutingTable, Vec<Enr>) {
            let (local_enr, mut table) = create_table();
            let local_node_id = local_enr.node_id();

            let bucket_peers: Vec<Enr> = (0..MAX_NODES_PER_BUCKET)
                .map(|_| generate_enr_at_log2_distance(local_node_id, 256))
                .collect();
            for enr in &bucket_peers {
                assert_eq!(table.seen(enr.clone(), None), InsertOutcome::Inserted);
            }
            (local_enr, table, bucket_peers)
        }

        #[test]
        fn overflow_lands_in_replacement_list() {
            let (local_enr, mut table, _) = filled_bucket();

            let extra = generate_enr_at_log2_distance(local_enr.node_id(), 256);
            assert_eq!(table.seen(extra.clone(), None), InsertOutcome::Replacement);

            // Not a live entry, and live count is still K.
            assert!(table.entry(extra.node_id()).is_none());
            assert_eq!(table.len(), MAX_NODES_PER_BUCKET);
        }

        #[test]
        fn eviction_promotes_replacement_head() {
            let (local_enr, mut table, bucket_peers) = filled_bucket();

            let extra = generate_enr_at_log2_distance(local_enr.node_id(), 256);
            table.seen(extra.clone(), None);

            // Four consecutive failures evict the first peer and promote the replacement.
            let first = bucket_peers[0].node_id();
            for fails in 1..MAX_INCIDENT_FAILURES {
                assert_eq!(
                    table.record_failure(first),
                    FailureOutcome::Retained { fails }
                );
            }
            assert_eq!(
                table.record_failure(first),
                FailureOutcome::Evicted {
                    promoted: Some(extra.node_id())
                }
            );

            assert!(table.entry(first).is_none());
            assert!(table.entry(extra.node_id()).is_some());
            assert_eq!(table.len(), MAX_NODES_PER_BUCKET);
        }

        #[test]
        fn a_success_resets_the_failure_counter() {
            let (_local_enr, mut table, bucket_peers) = filled_bucket();

            let first = bucket_peers[0].clone();
            for _ in 0..MAX_INCIDENT_FAILURES - 1 {
                table.record_failure(first.node_id());
            }
            table.seen(first.clone(), None);
            assert_eq!(
                table.record_failure(first.node_id()),
                FailureOutcome::Retained { fails: 1 }
            );
        }

        #[test]
        fn replacement_list_is_bounded() {
            let (local_enr, mut table, _) = filled_bucket();

            for _ in 0..MAX_REPLACEMENTS_PER_BUCKET + 3 {
                let extra = generate_enr_at_log2_distance(local_enr.node_id(), 256);
                assert_eq!(table.seen(extra, None), InsertOutcome::Replacement);
            }
            let bucket = &table.buckets[255];
            assert_eq!(bucket.replacements.len(), MAX_REPLACEMENTS_PER_BUCKET);
            assert_eq!(bucket.live.len(), MAX_NODES_PER_BUCKET);
        }

        #[test]
        fn no_node_id_is_duplicated_across_lists() {
            let (local_enr, mut table, bucket_peers) = filled_bucket();

            // Observing a live peer again must not clone it into the replacements.
            table.seen(bucket_peers[3].clone(), None);
            let extra = generate_enr_at_log2_distance(local_enr.node_id(), 256);
            table.seen(extra.clone(), None);
            table.seen(extra.clone(), None);

            let bucket = &table.buckets[255];
            let mut all_ids: Vec<NodeId> = bucket
                .live
                .iter()
                .chain(bucket.replacements.iter())
                .map(|entry| entry.node.enr.node_id())
                .collect();
            let total = all_ids.len();
            all_ids.sort_by_key(|id| id.raw());
            all_ids.dedup();
            assert_eq!(all_ids.len(), total);
        }
    }

    mod closest {
        use super::*;
        use super::test;

        #[test]
        fn sorted_by_distance_to_target() {
            let (_local_enr, mut table) = create_table();
            let target = NodeId::random();

            for _ in 0..20 {
                let (_, enr) = generate_random_remote_enr();
                table.seen(enr, None);
            }

            let closest = table.closest_to(&target.raw(), 10);
            assert_eq!(closest.len(), 10);
            let distances: Vec<Distance> = closest
                .iter()
                .map(|node| XorMetric::distance(&target.raw(), &node.enr.node_id().raw()))
                .collect();
            assert!(distances.windows(2).all(|pair| pair[0] <= pair[1]));
        }

        #[test]
        fn closer_entries_win() {
            let (_local_enr, mut table) = create_table();
            let target = NodeId::random();

            let closer: Vec<Enr> = (0..3)
                .map(|_| generate_enr_at_log2_distance(target, 255))
                .collect();
            let farther: Vec<Enr> = (0..3)
                .map(|_| generate_enr_at_log2_distance(target, 256))
                .collect();
            for enr in closer.iter().chain(farther.iter()) {
                table.seen(enr.clone(), None);
            }

            let closest = table.closest_to(&target.raw(), 3);
            for node in closest {
                assert!(closer.contains(&node.enr));
            }
        }
    }

    mod nodes_by_distances {
        use super::*;
        use super::test;

        #[test]
        fn filters_by_bucket_and_caps_at_limit() {
            let (local_enr, mut table) = create_table();
            let local_node_id = local_enr.node_id();

            let at_255: Vec<Enr> = (0..4)
                .map(|_| generate_enr_at_log2_distance(local_node_id, 255))
                .collect();
            let at_256: Vec<Enr> = (0..4)
                .map(|_| generate_enr_at_log2_distance(local_node_id, 256))
                .collect();
            for enr in at_255.iter().chain(at_256.iter()) {
                table.seen(enr.clone(), None);
            }

            let found = table.nodes_by_distances(&[255], 10);
            assert_eq!(found.len(), 4);
            for enr in &found {
                assert!(at_255.contains(enr));
            }

            // Closer distances are served first regardless of argument order.
            let found = table.nodes_by_distances(&[256, 255], 4);
            for enr in &found {
                assert!(at_255.contains(enr));
            }

            // Out-of-range distances are ignored.
            assert!(table.nodes_by_distances(&[257, 1000], 10).is_empty());
        }
    }

    mod discovered {
        use super::*;
        use super::test;

        #[test]
        fn new_nodes_are_reported_and_queued_least_recently_seen() {
            let (_local_enr, mut table) = create_table();
            let (_, enr) = generate_random_remote_enr();

            let result = table.insert_or_update_discovered_nodes([enr.clone()]);
            assert_eq!(result.inserted_nodes, vec![enr.node_id()]);
            assert!(table.entry(enr.node_id()).is_some());

            // A rediscovery of the same record reports nothing.
            let result = table.insert_or_update_discovered_nodes([enr]);
            assert!(result.inserted_nodes.is_empty());
        }

        #[test]
        fn only_newer_records_update_entries() {
            let (_local_enr, mut table) = create_table();
            let (sk, old_enr) = generate_random_remote_enr();
            let mut new_enr = old_enr.clone();
            new_enr.set_udp4(9000, &sk).unwrap();
            assert!(new_enr.seq() > old_enr.seq());

            table.seen(new_enr.clone(), None);
            table.insert_or_update_discovered_nodes([old_enr]);
            assert_eq!(table.entry(new_enr.node_id()).unwrap().enr, new_enr);
        }

        #[test]
        fn interested_respects_radius() {
            let (_local_enr, mut table) = create_table();
            let content_id = NodeId::random().raw();

            let (_, interested) = generate_random_remote_enr();
            table.seen(interested.clone(), Some(Distance::MAX));

            let (_, uninterested) = generate_random_remote_enr();
            table.seen(uninterested.clone(), Some(Distance::ZERO));

            let nodes = table.interested_in(&content_id);
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0].enr, interested);
        }
    }
}
