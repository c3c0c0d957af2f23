//! Kademlia routing tree: an ordered partition of the key space into buckets.

use std::time::Duration;

use tracing::{debug, trace};

use crate::common::{by_distance, Bucket, Id, Node, ID_BITS};
use crate::{Error, Result};

/// K = the default maximum size of a k-bucket.
pub const DEFAULT_K: usize = 20;
/// Depth below which any full bucket may split, even far from our own Id.
pub const DEFAULT_SPLIT_DEPTH_LIMIT: u8 = 5;
/// Errors a node may accumulate before it is evicted.
pub const DEFAULT_ERROR_THRESHOLD: u32 = 5;
/// Buckets without a lookup for this long are refreshed.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy)]
/// Parameters shaping a [RoutingTree].
pub struct RoutingSettings {
    /// Bucket capacity and the size of closest nodes results.
    ///
    /// Defaults to [DEFAULT_K]
    pub k: usize,
    /// Number of errors after which a node is evicted.
    ///
    /// Defaults to [DEFAULT_ERROR_THRESHOLD]
    pub error_threshold: u32,
    /// Buckets shallower than this may split even if they don't contain the
    /// local node.
    ///
    /// Defaults to [DEFAULT_SPLIT_DEPTH_LIMIT]
    pub split_depth_limit: u8,
    /// Width of the key space in bits.
    ///
    /// Defaults to [ID_BITS]
    pub key_space_bits: u8,
    /// Buckets without a lookup for this long are due for a refresh.
    ///
    /// Defaults to [DEFAULT_REFRESH_INTERVAL]
    pub refresh_interval: Duration,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            split_depth_limit: DEFAULT_SPLIT_DEPTH_LIMIT,
            key_space_bits: ID_BITS,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
/// Kademlia routing tree.
///
/// Buckets are sorted by their `range_min` and always partition
/// `[0, 2^key_space_bits)` without gaps or overlaps.
pub struct RoutingTree {
    local: Node,
    settings: RoutingSettings,
    buckets: Vec<Bucket>,
}

impl RoutingTree {
    /// Create a new [RoutingTree] with a single bucket, containing only the local node.
    pub fn new(local: Node, settings: RoutingSettings) -> Result<Self> {
        let bits = settings.key_space_bits;

        if bits == 0 || bits > ID_BITS {
            return Err(Error::InvalidKeySpace(bits));
        }

        let last = Id::MIN.with_trailing_ones(ID_BITS - bits);
        let root = Bucket::new(Id::MIN, last, bits, settings.k, settings.error_threshold)?;

        let mut tree = RoutingTree {
            local: local.clone(),
            settings,
            buckets: vec![root],
        };

        tree.add_node(local)?;

        Ok(tree)
    }

    // === Getters ===

    /// Returns the [Id] of this node, where distances are measured from.
    pub fn id(&self) -> &Id {
        &self.local.id
    }

    pub fn local(&self) -> &Node {
        &self.local
    }

    pub fn settings(&self) -> &RoutingSettings {
        &self.settings
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Iterate over every node in the tree, the local node included.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.iter().flat_map(|bucket| bucket.iter())
    }

    /// Return the number of nodes in this routing tree, the local node included.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    pub fn get(&self, id: &Id) -> Option<&Node> {
        self.bucket_for(id).and_then(|bucket| bucket.get(id))
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.get(id).is_some()
    }

    /// Index of the bucket whose range contains `id`.
    ///
    /// Ids outside the key space map to the last bucket.
    pub fn bucket_index(&self, id: &Id) -> usize {
        let index = self
            .buckets
            .partition_point(|bucket| bucket.range_last() < id);

        index.min(self.buckets.len() - 1)
    }

    // === Public Methods ===

    /// Attempts to add a node to this routing tree.
    ///
    /// Returns `Ok(None)` if the node was added (or refreshed). If its bucket
    /// is full and can't be split, the node is not added, and the least
    /// recently seen node of that bucket is returned as a replace candidate;
    /// the caller should probe it and call [Self::replace_stale_node] if it
    /// doesn't respond.
    pub fn add_node(&mut self, node: Node) -> Result<Option<Node>> {
        self.insert(node, true)
    }

    /// Add a node learned from another node's reply.
    ///
    /// Unlike [Self::add_node], a node already in the tree keeps its
    /// address, last seen time and error count.
    pub fn add_heard_node(&mut self, node: Node) -> Result<Option<Node>> {
        self.insert(node, false)
    }

    fn insert(&mut self, node: Node, observed: bool) -> Result<Option<Node>> {
        let bits = self.settings.key_space_bits;

        if !node.id.fits(bits) {
            return Err(Error::InvalidNodeId(node.id, bits));
        }

        // Every split increases the depth by one, so there are at most
        // `bits` splits before the insert succeeds or gives up.
        for _ in 0..=bits {
            let index = self.bucket_index(&node.id);

            match self.buckets[index].add_node(node.clone(), observed) {
                Ok(()) => return Ok(None),
                Err(Error::BucketFull) => {
                    if self.can_split(index) {
                        self.split_bucket(index)?;
                    } else {
                        let candidate = self.buckets[index].least_recently_seen().cloned();
                        trace!(id = ?node.id, ?candidate, "Bucket full");

                        return Ok(candidate);
                    }
                }
                Err(error) => return Err(error),
            }
        }

        Ok(self.buckets[self.bucket_index(&node.id)]
            .least_recently_seen()
            .cloned())
    }

    /// Remove a stale node and add a new one in its place.
    pub fn replace_stale_node(&mut self, remove: &Id, new: Node) -> Result<Option<Node>> {
        self.remove(remove);
        self.add_node(new)
    }

    /// Remove a node from this routing tree.
    pub fn remove(&mut self, id: &Id) -> Option<Node> {
        let index = self.bucket_index(id);

        self.buckets[index].remove(id)
    }

    /// Return up to `k` nodes closest to the target, sorted by XOR distance,
    /// excluding the local node.
    ///
    /// Starts from the target's bucket and expands to neighbouring buckets,
    /// alternating lower and higher, until `k` nodes are collected.
    pub fn find_closest_nodes(&self, target: &Id) -> Vec<Node> {
        let k = self.settings.k;
        let index = self.bucket_index(target);

        let mut nodes: Vec<Node> = Vec::with_capacity(k * 2);
        self.collect_bucket(index, &mut nodes);

        let mut lower = index.checked_sub(1);
        let mut higher = index + 1;

        while nodes.len() < k {
            let mut expanded = false;

            if let Some(i) = lower {
                self.collect_bucket(i, &mut nodes);
                lower = i.checked_sub(1);
                expanded = true;
            }

            if higher < self.buckets.len() {
                self.collect_bucket(higher, &mut nodes);
                higher += 1;
                expanded = true;
            }

            if !expanded {
                break;
            }
        }

        nodes.sort_by(by_distance(target));
        nodes.truncate(k);

        nodes
    }

    /// One random node from every bucket due for a refresh (or every
    /// bucket, if `force` is set). Empty buckets contribute nothing.
    pub fn fetch_refresh_nodes(&self, force: bool) -> Vec<Node> {
        let interval = self.settings.refresh_interval;

        self.buckets
            .iter()
            .filter(|bucket| force || bucket.needs_refresh(interval))
            .filter_map(|bucket| bucket.random_node(&self.local.id).cloned())
            .collect()
    }

    /// Record a lookup in the bucket covering `id`.
    pub fn performed_lookup(&mut self, id: &Id) {
        let index = self.bucket_index(id);

        self.buckets[index].performed_lookup();
    }

    /// Count a failed contact against a node. Returns true if it got evicted.
    pub fn error_node(&mut self, id: &Id) -> bool {
        let index = self.bucket_index(id);
        let evicted = self.buckets[index].error_node(id);

        if evicted {
            debug!(?id, "Evicted unresponsive node");
        }

        evicted
    }

    // === Private Methods ===

    fn bucket_for(&self, id: &Id) -> Option<&Bucket> {
        self.buckets
            .get(self.bucket_index(id))
            .filter(|bucket| bucket.covers(id))
    }

    /// Home bucket is always splittable, other buckets only up to the split depth limit.
    fn can_split(&self, index: usize) -> bool {
        let bucket = &self.buckets[index];

        bucket.midpoint().is_some()
            && (bucket.covers(&self.local.id)
                || bucket.depth() < self.settings.split_depth_limit)
    }

    /// Split a bucket in two halves, moving the upper half's nodes to a new
    /// bucket inserted right after it.
    fn split_bucket(&mut self, index: usize) -> Result<()> {
        let bucket = &mut self.buckets[index];

        let midpoint = bucket.midpoint().ok_or(Error::BucketRangeInvalid {
            min: *bucket.range_min(),
            last: *bucket.range_last(),
        })?;
        let last = *bucket.range_last();

        let evicted = bucket.update_range(midpoint)?;

        let mut upper = Bucket::new(
            midpoint,
            last,
            self.settings.key_space_bits,
            self.settings.k,
            self.settings.error_threshold,
        )?;

        for node in evicted {
            upper.add_node(node, false)?;
        }

        trace!(?midpoint, depth = upper.depth(), "Split bucket");

        self.buckets.insert(index + 1, upper);

        Ok(())
    }

    fn collect_bucket(&self, index: usize, nodes: &mut Vec<Node>) {
        nodes.extend(
            self.buckets[index]
                .iter()
                .filter(|node| !node.same_node(&self.local))
                .cloned(),
        );
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::net::SocketAddrV4;

    use super::*;

    fn node(id: u64) -> Node {
        Node::new(Id::from(id), SocketAddrV4::new([127, 0, 0, 1].into(), id as u16))
    }

    fn small_settings() -> RoutingSettings {
        RoutingSettings {
            k: 2,
            error_threshold: 5,
            split_depth_limit: 5,
            key_space_bits: 8,
            ..Default::default()
        }
    }

    fn as_u64(id: &Id) -> u64 {
        u64::from_be_bytes(id.0[12..].try_into().unwrap())
    }

    fn assert_partitioned(tree: &RoutingTree) {
        let buckets = tree.buckets();

        assert_eq!(buckets[0].range_min(), &Id::MIN);

        for pair in buckets.windows(2) {
            assert_eq!(pair[0].range_end(), Some(*pair[1].range_min()));
        }

        let bits = tree.settings().key_space_bits;
        let last = buckets.last().unwrap().range_last();
        assert_eq!(*last, Id::MIN.with_trailing_ones(ID_BITS - bits));

        for bucket in buckets {
            for node in bucket.iter() {
                assert!(bucket.covers(&node.id));
            }
        }
    }

    #[test]
    fn create() {
        let tree = RoutingTree::new(node(100), small_settings()).unwrap();

        assert_eq!(tree.buckets().len(), 1);
        assert_eq!(tree.size(), 1);
        assert!(tree.contains(&Id::from(100_u64)));
        assert_partitioned(&tree);
    }

    #[test]
    fn invalid_settings_and_ids() {
        assert!(matches!(
            RoutingTree::new(
                node(100),
                RoutingSettings {
                    key_space_bits: 0,
                    ..Default::default()
                }
            ),
            Err(Error::InvalidKeySpace(0))
        ));
        assert!(matches!(
            RoutingTree::new(node(300), small_settings()),
            Err(Error::InvalidNodeId(_, 8))
        ));

        let mut tree = RoutingTree::new(node(100), small_settings()).unwrap();
        assert!(matches!(
            tree.add_node(node(256)),
            Err(Error::InvalidNodeId(_, 8))
        ));
    }

    #[test]
    fn split_bucket_scenario() {
        let mut tree = RoutingTree::new(node(100), small_settings()).unwrap();

        for id in [0, 25, 30, 50, 200, 255, 230] {
            assert!(tree.add_node(node(id)).unwrap().is_none());
            assert_partitioned(&tree);
        }

        let expected = [
            (0, 16, vec![0]),
            (16, 32, vec![25, 30]),
            (32, 64, vec![50]),
            (64, 128, vec![100]),
            (128, 192, vec![]),
            (192, 224, vec![200]),
            (224, 256, vec![255, 230]),
        ];

        assert_eq!(tree.buckets().len(), expected.len());

        for (bucket, (min, end, ids)) in tree.buckets().iter().zip(expected) {
            assert_eq!(as_u64(bucket.range_min()), min);
            assert_eq!(as_u64(&bucket.range_end().unwrap()), end);
            assert_eq!(bucket.iter().map(|n| as_u64(&n.id)).collect::<Vec<_>>(), ids);
        }
    }

    #[test]
    fn full_bucket_returns_replace_candidate() {
        let mut tree = RoutingTree::new(
            node(100),
            RoutingSettings {
                split_depth_limit: 1,
                ..small_settings()
            },
        )
        .unwrap();

        tree.add_node(node(200)).unwrap();
        tree.add_node(node(210)).unwrap();

        // [128, 256) has depth 1, which is not below the limit.
        let candidate = tree.add_node(node(220)).unwrap();

        assert_eq!(candidate.unwrap().id, Id::from(200_u64));
        assert!(!tree.contains(&Id::from(220_u64)));

        let bucket = &tree.buckets()[tree.bucket_index(&Id::from(220_u64))];
        assert_eq!(bucket.len(), 2);
        assert_partitioned(&tree);

        // Re-adding refreshes the candidate, the next one becomes least recently seen.
        tree.add_node(node(200)).unwrap();
        let candidate = tree.add_node(node(220)).unwrap();
        assert_eq!(candidate.unwrap().id, Id::from(210_u64));
    }

    #[test]
    fn replace_stale_node() {
        let mut tree = RoutingTree::new(
            node(100),
            RoutingSettings {
                split_depth_limit: 1,
                ..small_settings()
            },
        )
        .unwrap();

        tree.add_node(node(200)).unwrap();
        tree.add_node(node(210)).unwrap();

        let candidate = tree.add_node(node(220)).unwrap().unwrap();
        assert!(tree
            .replace_stale_node(&candidate.id, node(220))
            .unwrap()
            .is_none());

        assert!(!tree.contains(&Id::from(200_u64)));
        assert!(tree.contains(&Id::from(220_u64)));
        assert!(tree.contains(&Id::from(210_u64)));
    }

    #[test]
    fn split_keeps_every_node() {
        let mut tree = RoutingTree::new(
            Node::new(Id::random(), SocketAddrV4::new(0.into(), 0)),
            RoutingSettings {
                k: 4,
                ..Default::default()
            },
        )
        .unwrap();

        let mut added = HashSet::new();
        added.insert(*tree.id());

        for _ in 0..500 {
            let node = Node::random();
            if tree.add_node(node.clone()).unwrap().is_none() {
                added.insert(node.id);
            }
            assert_partitioned(&tree);
        }

        let present: HashSet<Id> = tree.nodes().map(|n| n.id).collect();
        assert_eq!(present, added);
        assert_eq!(tree.size(), added.len());
        assert!(tree.buckets().iter().all(|b| b.len() <= 4));
    }

    #[test]
    fn find_closest_nodes_sorted_by_distance() {
        let mut tree = RoutingTree::new(
            node(100),
            RoutingSettings {
                k: 4,
                key_space_bits: 8,
                ..Default::default()
            },
        )
        .unwrap();

        for id in [0, 25, 30, 50, 99, 101, 200, 255, 230, 131] {
            tree.add_node(node(id)).unwrap();
        }

        let target = Id::from(97_u64);
        let closest = tree.find_closest_nodes(&target);

        assert_eq!(closest.len(), 4);
        assert!(closest.iter().all(|n| n.id != Id::from(100_u64)));

        for pair in closest.windows(2) {
            assert!(pair[0].distance(&target) <= pair[1].distance(&target));
        }

        assert_eq!(closest[0].id, Id::from(99_u64));
    }

    #[test]
    fn find_closest_excludes_local_node() {
        let mut tree = RoutingTree::new(node(100), small_settings()).unwrap();

        assert!(tree.find_closest_nodes(&Id::from(100_u64)).is_empty());

        tree.add_node(node(101)).unwrap();
        let closest = tree.find_closest_nodes(&Id::from(100_u64));

        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].id, Id::from(101_u64));
    }

    #[test]
    fn find_closest_collects_neighbouring_buckets() {
        let mut tree = RoutingTree::new(node(100), small_settings()).unwrap();

        for id in [0, 25, 30, 50, 200, 255, 230] {
            tree.add_node(node(id)).unwrap();
        }

        // Target's bucket [128, 192) is empty.
        let closest = tree.find_closest_nodes(&Id::from(150_u64));

        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0].id, Id::from(200_u64));
    }

    #[test]
    fn error_node_evicts_after_threshold() {
        let mut tree = RoutingTree::new(node(100), small_settings()).unwrap();
        tree.add_node(node(25)).unwrap();

        for _ in 0..5 {
            assert!(!tree.error_node(&Id::from(25_u64)));
        }
        assert!(tree.contains(&Id::from(25_u64)));

        assert!(tree.error_node(&Id::from(25_u64)));
        assert!(!tree.contains(&Id::from(25_u64)));
    }

    #[test]
    fn readding_resets_errors() {
        let mut tree = RoutingTree::new(node(100), small_settings()).unwrap();
        tree.add_node(node(25)).unwrap();

        for _ in 0..5 {
            tree.error_node(&Id::from(25_u64));
        }

        tree.add_node(node(25)).unwrap();
        assert_eq!(tree.get(&Id::from(25_u64)).unwrap().errors(), 0);
        assert!(!tree.error_node(&Id::from(25_u64)));
    }

    #[test]
    fn heard_nodes_dont_overwrite_contacts() {
        let mut tree = RoutingTree::new(node(100), small_settings()).unwrap();
        tree.add_node(node(25)).unwrap();
        tree.error_node(&Id::from(25_u64));

        let rumour = Node::new(Id::from(25_u64), SocketAddrV4::new([10, 0, 0, 1].into(), 9999));
        assert!(tree.add_heard_node(rumour).unwrap().is_none());

        let contact = tree.get(&Id::from(25_u64)).unwrap();
        assert_eq!(contact.address().port(), 25);
        assert_eq!(contact.errors(), 1);

        // Unknown nodes are still added.
        assert!(tree.add_heard_node(node(30)).unwrap().is_none());
        assert!(tree.contains(&Id::from(30_u64)));
    }

    #[test]
    fn fetch_refresh_nodes() {
        let mut tree = RoutingTree::new(node(100), small_settings()).unwrap();

        for id in [0, 25, 30, 50, 200, 255, 230] {
            tree.add_node(node(id)).unwrap();
        }

        // Fresh buckets don't need a refresh.
        assert!(tree.fetch_refresh_nodes(false).is_empty());

        // Forced: one per non-empty bucket, never the local node.
        let nodes = tree.fetch_refresh_nodes(true);
        assert_eq!(nodes.len(), 5);
        assert!(nodes.iter().all(|n| n.id != Id::from(100_u64)));

        let mut stale = RoutingTree::new(
            node(100),
            RoutingSettings {
                refresh_interval: Duration::ZERO,
                ..small_settings()
            },
        )
        .unwrap();
        stale.add_node(node(0)).unwrap();
        std::thread::sleep(Duration::from_millis(2));

        let nodes = stale.fetch_refresh_nodes(false);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, Id::MIN);
    }
}
