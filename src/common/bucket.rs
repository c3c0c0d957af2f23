//! Kbuckets
use std::{
    slice::Iter,
    time::{Duration, Instant},
};

use rand::seq::IteratorRandom;

use crate::common::{Id, Node, ID_BITS};
use crate::{Error, Result};

/// Kbuckets are similar to LRU caches that keep the nodes of one contiguous
/// range of the key space, ordered from least to most recently seen.
#[derive(Debug, Clone)]
pub struct Bucket {
    range_min: Id,
    /// Inclusive upper bound, so the whole 160 bit space is representable.
    range_last: Id,
    key_space_bits: u8,
    /// K (as in k-bucket) is the maximum number of nodes in a k-bucket.
    k: usize,
    /// Errors a node may accumulate before it is evicted.
    error_threshold: u32,
    /// Nodes in the k-bucket, sorted by the least recently seen.
    nodes: Vec<Node>,
    /// Last time a lookup was performed in this bucket's range.
    last_lookup: Instant,
}

impl Bucket {
    /// Create a bucket covering `[range_min, range_last]`.
    pub fn new(
        range_min: Id,
        range_last: Id,
        key_space_bits: u8,
        k: usize,
        error_threshold: u32,
    ) -> Result<Self> {
        if range_min > range_last || !range_last.fits(key_space_bits) {
            return Err(Error::BucketRangeInvalid {
                min: range_min,
                last: range_last,
            });
        }

        Ok(Bucket {
            range_min,
            range_last,
            key_space_bits,
            k,
            error_threshold,
            nodes: Vec::with_capacity(k),
            last_lookup: Instant::now(),
        })
    }

    // === Getters ===

    pub fn range_min(&self) -> &Id {
        &self.range_min
    }

    /// The last Id inside this bucket's range.
    pub fn range_last(&self) -> &Id {
        &self.range_last
    }

    /// Exclusive upper bound of the range, None if it is `2^160`.
    pub fn range_end(&self) -> Option<Id> {
        self.range_last.checked_increment()
    }

    pub fn last_lookup(&self) -> Instant {
        self.last_lookup
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn iter(&self) -> Iter<'_, Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.k
    }

    /// Returns true if `id` falls inside this bucket's range.
    pub fn covers(&self, id: &Id) -> bool {
        &self.range_min <= id && id <= &self.range_last
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: &Id) -> Option<&Node> {
        self.position(id).map(|index| &self.nodes[index])
    }

    /// Depth of this bucket in the routing trie: the number of leading bits
    /// (within the key space) shared by every Id in its range.
    pub fn depth(&self) -> u8 {
        let offset = ID_BITS - self.key_space_bits;

        self.range_min
            .common_prefix_len(&self.range_last)
            .saturating_sub(offset)
    }

    /// First Id of the upper half of this bucket, None if it can't be split.
    pub fn midpoint(&self) -> Option<Id> {
        let depth = self.depth();

        if depth >= self.key_space_bits {
            return None;
        }

        let offset = ID_BITS - self.key_space_bits;
        let midpoint = self.range_min.with_bit(offset + depth);

        if midpoint > self.range_min && midpoint <= self.range_last {
            Some(midpoint)
        } else {
            None
        }
    }

    /// Least recently seen node, the first candidate for replacement.
    pub fn least_recently_seen(&self) -> Option<&Node> {
        self.nodes.first()
    }

    /// Uniformly random node of this bucket other than `excluding`.
    pub fn random_node(&self, excluding: &Id) -> Option<&Node> {
        self.nodes
            .iter()
            .filter(|node| &node.id != excluding)
            .choose(&mut rand::thread_rng())
    }

    /// Returns true if no lookup was performed in this range for `interval`.
    pub fn needs_refresh(&self, interval: Duration) -> bool {
        self.last_lookup.elapsed() > interval
    }

    // === Public Methods ===

    /// Add a node, or refresh it if it is already present.
    ///
    /// With `update_seen`, the node is marked as seen, and an existing entry
    /// adopts the incoming address and moves to the most recently seen end.
    /// Without it, an existing entry is left untouched.
    pub fn add_node(&mut self, mut node: Node, update_seen: bool) -> Result<()> {
        if !self.covers(&node.id) {
            return Err(Error::BucketRangeMismatch {
                id: node.id,
                min: self.range_min,
                last: self.range_last,
            });
        }

        if let Some(index) = self.position(&node.id) {
            if update_seen {
                let mut existing = self.nodes.remove(index);
                existing.address = node.address;
                existing.seen();

                self.nodes.push(existing);
            }
        } else if self.nodes.len() < self.k {
            if update_seen {
                node.seen();
            }

            self.nodes.push(node);
        } else {
            return Err(Error::BucketFull);
        }

        Ok(())
    }

    /// Shrink the range to `[range_min, new_end)` and return the evicted
    /// nodes in recency order.
    pub fn update_range(&mut self, new_end: Id) -> Result<Vec<Node>> {
        let new_last = match new_end.checked_decrement() {
            Some(last) if last >= self.range_min && last <= self.range_last => last,
            _ => {
                return Err(Error::BucketRangeInvalid {
                    min: self.range_min,
                    last: new_end,
                })
            }
        };

        self.range_last = new_last;

        let (kept, evicted): (Vec<Node>, Vec<Node>) = self
            .nodes
            .drain(..)
            .partition(|node| node.id <= new_last);
        self.nodes = kept;

        Ok(evicted)
    }

    pub fn remove(&mut self, id: &Id) -> Option<Node> {
        self.position(id).map(|index| self.nodes.remove(index))
    }

    /// Count an error against a node, evicting it once it exceeds the
    /// error threshold. Returns true if the node was evicted.
    pub fn error_node(&mut self, id: &Id) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };

        if self.nodes[index].error() > self.error_threshold {
            self.nodes.remove(index);
            return true;
        }

        false
    }

    /// Record that a lookup was performed in this bucket's range.
    pub fn performed_lookup(&mut self) {
        self.last_lookup = Instant::now();
    }

    // === Private Methods ===

    fn position(&self, id: &Id) -> Option<usize> {
        self.nodes.iter().position(|node| &node.id == id)
    }
}
