//! # Sharded Table
//!
//! A hash map split into independently locked shards.
//!
//! Both registries (mappings and tasks) sit on a [`ShardedTable`]. A key is
//! hashed once to pick its shard; every operation on that key happens with
//! only that shard's lock held, so unrelated handles never contend. Callers
//! must never hold two shard guards at once.

use core::hash::{BuildHasher, Hash};

use hashbrown::hash_map::DefaultHashBuilder;
use hashbrown::HashMap;
use spin::{Mutex, MutexGuard};

/// Guard over one shard
pub type ShardGuard<'a, K, V> = MutexGuard<'a, HashMap<K, V>>;

/// Hash map split into `N` independently locked shards
pub struct ShardedTable<K, V> {
    shards: Box<[Mutex<HashMap<K, V>>]>,
    hasher: DefaultHashBuilder,
}

impl<K: Hash + Eq, V> ShardedTable<K, V> {
    /// Create a table with `count` shards (at least one)
    pub fn new(count: usize) -> Self {
        let shards = (0..count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            hasher: DefaultHashBuilder::default(),
        }
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard a key lives in
    pub fn shard_index(&self, key: &K) -> usize {
        (self.hasher.hash_one(key) % self.shards.len() as u64) as usize
    }

    /// Lock the shard owning `key`
    pub fn lock(&self, key: &K) -> ShardGuard<'_, K, V> {
        self.shards[self.shard_index(key)].lock()
    }

    /// Visit every shard in index order, one lock at a time
    pub fn for_each_shard(&self, mut f: impl FnMut(usize, &HashMap<K, V>)) {
        for (index, shard) in self.shards.iter().enumerate() {
            let guard = shard.lock();
            f(index, &guard);
        }
    }

    /// Total number of entries
    ///
    /// Shards are counted one after another, so the result is only exact
    /// when the table is quiescent.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Whether every shard is empty
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.lock().is_empty())
    }
}

impl<K, V> core::fmt::Debug for ShardedTable<K, V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShardedTable")
            .field("shards", &self.shards.len())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
