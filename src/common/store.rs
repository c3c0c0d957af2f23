//! Storage of values published with STORE queries.

use std::fmt::Debug;
use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;
use sha1_smol::Sha1;

use crate::common::Id;

/// Default capacity of [MemoryStore].
pub const MAX_VALUES: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(n) => n,
    None => unreachable!(),
};

/// Key-value storage for a peer, indexed by key hash.
pub trait DataStore: Send + Debug {
    fn store(&mut self, key: Bytes, key_hash: Id, value: Bytes);

    fn retrieve(&mut self, key_hash: &Id) -> Option<Bytes>;

    fn remove(&mut self, key_hash: &Id) -> Option<Bytes>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
/// An LRU bounded in-memory [DataStore].
pub struct MemoryStore {
    values: LruCache<Id, (Bytes, Bytes)>,
}

impl MemoryStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            values: LruCache::new(capacity),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MAX_VALUES)
    }
}

impl DataStore for MemoryStore {
    fn store(&mut self, key: Bytes, key_hash: Id, value: Bytes) {
        self.values.put(key_hash, (key, value));
    }

    fn retrieve(&mut self, key_hash: &Id) -> Option<Bytes> {
        self.values.get(key_hash).map(|(_, value)| value.clone())
    }

    fn remove(&mut self, key_hash: &Id) -> Option<Bytes> {
        self.values.pop(key_hash).map(|(_, value)| value)
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}

/// Hash a key into the `key_space_bits` wide key space: SHA-1 of the key,
/// with the bits above the key space cleared.
pub fn hash_key(key: &[u8], key_space_bits: u8) -> Id {
    let mut hasher = Sha1::new();
    hasher.update(key);

    Id(hasher.digest().bytes()).truncate(key_space_bits)
}
