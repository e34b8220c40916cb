//! Bounded LRU cache of clean blocks
//!
//! Maps block ids to reference-counted block payloads. Values are
//! `Bytes`, so a reader holds a cheap clone and never blocks an
//! evictor. The cache only ever holds clean blocks: the block map
//! removes an entry the moment the block is dirtied, making the write
//! buffer the sole source of truth for dirty data.

use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

/// Bounded block cache with least-recently-used eviction
pub struct BlockCache {
    inner: Mutex<LruCache<u64, Bytes>>,
}

impl BlockCache {
    /// Create a cache holding up to `capacity` blocks (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("clamped to >= 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Create a cache sized from a byte budget
    pub fn with_byte_budget(cache_bytes: u64, block_size: u64) -> Self {
        let entries = if block_size == 0 { 1 } else { cache_bytes / block_size };
        Self::new(entries as usize)
    }

    /// Look up a block, refreshing its recency
    pub fn get(&self, id: u64) -> Option<Bytes> {
        self.inner.lock().get(&id).cloned()
    }

    /// Insert a block, returning the evicted entry if the cache was full
    pub fn insert(&self, id: u64, block: Bytes) -> Option<(u64, Bytes)> {
        self.inner.lock().push(id, block)
    }

    /// Drop a block from the cache
    pub fn remove(&self, id: u64) {
        self.inner.lock().pop(&id);
    }

    /// Whether a block is cached, without touching recency
    pub fn contains(&self, id: u64) -> bool {
        self.inner.lock().peek(&id).is_some()
    }

    /// Number of cached blocks
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Maximum number of cached blocks
    pub fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(fill: u8) -> Bytes {
        Bytes::from(vec![fill; 8])
    }

    #[test]
    fn lookup_hits_and_misses() {
        let cache = BlockCache::new(2);
        assert!(cache.get(1).is_none());

        cache.insert(1, block(0xA));
        assert_eq!(cache.get(1).unwrap(), block(0xA));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let cache = BlockCache::new(2);
        cache.insert(1, block(1));
        cache.insert(2, block(2));

        // Touch 1 so 2 becomes the eviction candidate.
        cache.get(1);
        let evicted = cache.insert(3, block(3));

        assert_eq!(evicted.map(|(id, _)| id), Some(2));
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
    }

    #[test]
    fn remove_drops_the_entry() {
        let cache = BlockCache::new(2);
        cache.insert(7, block(7));
        cache.remove(7);
        assert!(cache.is_empty());
        // Removing an absent id is a no-op.
        cache.remove(7);
    }

    #[test]
    fn byte_budget_rounds_down_to_entries() {
        let cache = BlockCache::with_byte_budget(100, 30);
        assert_eq!(cache.capacity(), 3);

        // A budget below one block still yields a usable cache.
        let tiny = BlockCache::with_byte_budget(10, 30);
        assert_eq!(tiny.capacity(), 1);
    }

    #[test]
    fn reinsert_replaces_without_eviction() {
        let cache = BlockCache::new(2);
        cache.insert(1, block(1));
        let replaced = cache.insert(1, block(9));

        assert_eq!(replaced.map(|(id, _)| id), Some(1));
        assert_eq!(cache.get(1).unwrap(), block(9));
        assert_eq!(cache.len(), 1);
    }
}
