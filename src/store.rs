//! Lock-striped map from key to the latest accepted version of its value.
//!
//! The control plane is the only writer. The dataplane reads. Each key hashes to one shard and
//! only that shard's lock is taken, so a burst of updates to unrelated keys never serialises
//! lookups elsewhere.

use std::collections::hash_map::{DefaultHasher, Entry as MapEntry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};

use crate::policy::{PolicyKey, PolicyValue};
use crate::util::is_pow_of_two;

pub const DEFAULT_SHARDS: usize = 64;

/// Result of [`VersionedStore::apply`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    Accepted,
    /// The stored version is equal or newer. Nothing changed.
    Stale,
}

#[derive(Debug)]
struct Entry<V> {
    version: u64,
    value: Arc<V>,
}

pub struct VersionedStore<K, V> {
    shards: Vec<RwLock<HashMap<K, Entry<V>>>>,
    mask: usize,
}

pub type PolicyStore = VersionedStore<PolicyKey, PolicyValue>;

impl<K: Hash + Eq, V> VersionedStore<K, V> {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// `shards` is rounded up to a power of two.
    pub fn with_shards(shards: usize) -> Self {
        let count = if is_pow_of_two(shards as u64) {
            shards
        } else {
            shards.max(1).next_power_of_two()
        };

        let mut v = Vec::with_capacity(count);
        for _ in 0..count {
            v.push(RwLock::new(HashMap::new()));
        }

        VersionedStore {
            shards: v,
            mask: count - 1,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard(&self, key: &K) -> &RwLock<HashMap<K, Entry<V>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & self.mask]
    }

    /// Point-in-time snapshot of a key's version and value.
    #[inline]
    pub fn get(&self, key: &K) -> Option<(u64, Arc<V>)> {
        // A poisoned shard still only holds whole entries: inserts replace an Entry in one move.
        let guard = self.shard(key).read().unwrap_or_else(PoisonError::into_inner);
        guard.get(key).map(|e| (e.version, e.value.clone()))
    }

    pub fn version(&self, key: &K) -> Option<u64> {
        let guard = self.shard(key).read().unwrap_or_else(PoisonError::into_inner);
        guard.get(key).map(|e| e.version)
    }

    /// Store `value` under `key` if `version` is newer than what is stored. Absent keys count
    /// as version 0.
    pub fn apply(&self, key: K, version: u64, value: V) -> Applied {
        self.apply_shared(key, version, Arc::new(value))
    }

    pub fn apply_shared(&self, key: K, version: u64, value: Arc<V>) -> Applied {
        if version == 0 {
            return Applied::Stale;
        }

        let mut guard = self.shard(&key).write().unwrap_or_else(PoisonError::into_inner);
        match guard.entry(key) {
            MapEntry::Occupied(mut o) => {
                if version <= o.get().version {
                    return Applied::Stale;
                }
                o.insert(Entry { version, value });
            }
            MapEntry::Vacant(v) => {
                v.insert(Entry { version, value });
            }
        }

        Applied::Accepted
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Hash + Eq, V> Default for VersionedStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_count_rounds_up() {
        let s: VersionedStore<u32, u32> = VersionedStore::with_shards(48);
        assert_eq!(s.shard_count(), 64);
        let s: VersionedStore<u32, u32> = VersionedStore::with_shards(0);
        assert_eq!(s.shard_count(), 1);
        let s: VersionedStore<u32, u32> = VersionedStore::with_shards(16);
        assert_eq!(s.shard_count(), 16);
    }

    #[test]
    fn first_write_accepted() {
        let s = VersionedStore::new();
        assert_eq!(s.get(&"a"), None);
        assert_eq!(s.apply("a", 1, 10), Applied::Accepted);
        assert_eq!(s.get(&"a").map(|(v, x)| (v, *x)), Some((1, 10)));
    }

    #[test]
    fn version_zero_is_stale() {
        let s = VersionedStore::new();
        assert_eq!(s.apply("a", 0, 10), Applied::Stale);
        assert!(s.is_empty());
    }

    #[test]
    fn duplicate_is_stale_and_unchanged() {
        let s = VersionedStore::new();
        assert_eq!(s.apply("k", 5, "first"), Applied::Accepted);
        assert_eq!(s.apply("k", 5, "first"), Applied::Stale);
        assert_eq!(s.apply("k", 5, "other"), Applied::Stale);
        assert_eq!(s.get(&"k").map(|(v, x)| (v, *x)), Some((5, "first")));
    }

    #[test]
    fn older_version_ignored() {
        let s = VersionedStore::new();
        s.apply(1u32, 3, 'a');
        assert_eq!(s.apply(1u32, 2, 'b'), Applied::Stale);
        assert_eq!(s.apply(1u32, 4, 'c'), Applied::Accepted);
        assert_eq!(s.version(&1), Some(4));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn snapshot_outlives_replacement() {
        let s = VersionedStore::new();
        s.apply("k", 1, String::from("old"));
        let (_, snap) = s.get(&"k").unwrap();
        s.apply("k", 2, String::from("new"));
        assert_eq!(snap.as_str(), "old");
        assert_eq!(s.get(&"k").unwrap().1.as_str(), "new");
    }
}
