//! Byte-range block map
//!
//! Translates byte-granular reads and writes into fixed-size block
//! operations against a [`BlockProvider`], absorbing provider latency
//! behind an LRU cache and a write-coalescing buffer.
//!
//! Read path: write buffer, then cache, then provider (fetched blocks
//! are cached). Write path: read-modify-write per spanned block; the
//! merged block is parked in the write buffer and the id is removed
//! from the cache, so a block id is never clean and dirty at once.
//! Dirty blocks drain to the provider when the buffer grows past
//! `max_write_queue`, on an explicit `sync`, or when the background
//! ticker finds the buffer stale.
//!
//! One async mutex serializes whole data-path calls; inside a call,
//! provider fetches and uploads fan out as spawned tasks bounded by
//! semaphores. The lock is held for the full duration of each call,
//! including any flush it triggers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, trace, warn};

use nimbus_store::BlockProvider;

use crate::buffer::WriteBuffer;
use crate::cache::BlockCache;
use crate::config::BlockMapConfig;
use crate::error::{BlockError, BlockResult};

/// Block map over a provider, cache and write buffer
pub struct BlockMap {
    provider: Arc<dyn BlockProvider>,
    cache: BlockCache,
    block_size: u64,
    block_count: u64,
    size: u64,
    max_write_queue: usize,
    sync_interval: Duration,
    read_permits: Arc<Semaphore>,
    write_permits: Arc<Semaphore>,
    state: Mutex<IoState>,
}

/// Mutable state guarded by the I/O lock
struct IoState {
    buffer: WriteBuffer,
    last_flush: Instant,
}

/// One block's slice of a byte-range request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    /// Spanned block
    block_id: u64,
    /// Offset of the slice within the block
    block_off: usize,
    /// Length of the slice
    len: usize,
    /// Offset of the slice within the request buffer
    start: usize,
}

/// Result of one flush upload task
enum UploadOutcome {
    Uploaded,
    Skipped,
}

/// A wrong-length block means a broken provider or a corrupted
/// store; the block map's invariants are not recoverable in place.
fn enforce_block_length(id: u64, block: &Bytes, block_size: usize) {
    if block.len() != block_size {
        error!(
            block = id,
            actual = block.len(),
            expected = block_size,
            "provider returned a wrong-length block, aborting"
        );
        std::process::abort();
    }
}

/// Split a byte range into per-block segments, walked left to right
fn split_range(off: u64, len: usize, block_size: u64) -> Vec<Segment> {
    let end = off + len as u64;
    let mut segments = Vec::new();
    let mut p = off;
    while p < end {
        let block_id = p / block_size;
        let block_off = (p - block_id * block_size) as usize;
        let span = (block_size - block_off as u64).min(end - p) as usize;
        segments.push(Segment {
            block_id,
            block_off,
            len: span,
            start: (p - off) as usize,
        });
        p += span as u64;
    }
    segments
}

impl BlockMap {
    /// Create a block map over `provider` with the given cache and geometry
    pub fn new(
        provider: Arc<dyn BlockProvider>,
        cache: BlockCache,
        config: BlockMapConfig,
    ) -> BlockResult<Self> {
        config.validate()?;
        let size = config.device_size()?;
        debug!(
            block_size = config.block_size,
            block_count = config.block_count,
            size,
            "created block map"
        );

        Ok(Self {
            provider,
            cache,
            block_size: config.block_size,
            block_count: config.block_count,
            size,
            max_write_queue: config.max_write_queue,
            sync_interval: config.sync_interval,
            read_permits: Arc::new(Semaphore::new(config.concurrent_reads)),
            write_permits: Arc::new(Semaphore::new(config.concurrent_writes)),
            state: Mutex::new(IoState {
                buffer: WriteBuffer::new(),
                last_flush: Instant::now(),
            }),
        })
    }

    /// Device size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes per block
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Number of blocks in the device
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Background flush period
    pub fn sync_interval(&self) -> Duration {
        self.sync_interval
    }

    /// Number of dirty blocks awaiting upload
    pub async fn dirty_blocks(&self) -> usize {
        self.state.lock().await.buffer.len()
    }

    /// Whether a block id is dirty
    pub async fn is_dirty(&self, id: u64) -> bool {
        self.state.lock().await.buffer.contains(id)
    }

    /// Whether a block id holds a clean cache entry
    pub fn is_cached(&self, id: u64) -> bool {
        self.cache.contains(id)
    }

    fn check_bounds(&self, off: u64, len: u64) -> BlockResult<()> {
        let out_of_bounds = || BlockError::OutOfBounds {
            offset: off,
            length: len,
            size: self.size,
        };
        let end = off.checked_add(len).ok_or_else(out_of_bounds)?;
        if end > self.size {
            return Err(out_of_bounds());
        }
        Ok(())
    }

    /// Fetch blocks from the provider, at most `permits` in flight.
    /// Each element pairs a caller-chosen index with a block id; the
    /// result pairs the same index with the fetched payload.
    async fn fetch_blocks(
        &self,
        ids: Vec<(usize, u64)>,
        permits: &Arc<Semaphore>,
    ) -> BlockResult<Vec<(usize, Bytes)>> {
        let mut handles = Vec::with_capacity(ids.len());
        for (idx, id) in ids {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| BlockError::Worker("fan-out semaphore closed".to_string()))?;
            let provider = Arc::clone(&self.provider);
            let block_size = self.block_size as usize;

            handles.push((
                idx,
                tokio::spawn(async move {
                    let result = provider.read_block(id).await;
                    drop(permit);

                    let block = result.map_err(BlockError::from)?;
                    enforce_block_length(id, &block, block_size);
                    Ok::<Bytes, BlockError>(block)
                }),
            ));
        }

        let mut fetched = Vec::with_capacity(handles.len());
        for (idx, handle) in handles {
            let block = handle
                .await
                .map_err(|e| BlockError::Worker(e.to_string()))??;
            fetched.push((idx, block));
        }
        Ok(fetched)
    }

    /// Read `dst.len()` bytes starting at byte offset `off`
    ///
    /// On success `dst` is fully populated. Blocks are resolved from
    /// the write buffer first (a client always observes its own
    /// unflushed writes), then the cache, then the provider.
    pub async fn read_at(&self, dst: &mut [u8], off: u64) -> BlockResult<usize> {
        self.check_bounds(off, dst.len() as u64)?;
        if dst.is_empty() {
            return Ok(0);
        }

        let state = self.state.lock().await;
        trace!(off, len = dst.len(), "read_at");

        let segments = split_range(off, dst.len(), self.block_size);
        let mut misses = Vec::new();
        for (idx, seg) in segments.iter().enumerate() {
            let block = if let Some(block) = state.buffer.get(seg.block_id) {
                Some(block.clone())
            } else {
                self.cache.get(seg.block_id)
            };
            match block {
                Some(block) => {
                    dst[seg.start..seg.start + seg.len]
                        .copy_from_slice(&block[seg.block_off..seg.block_off + seg.len]);
                }
                None => misses.push((idx, seg.block_id)),
            }
        }

        for (idx, block) in self.fetch_blocks(misses, &self.read_permits).await? {
            let seg = segments[idx];
            self.cache.insert(seg.block_id, block.clone());
            dst[seg.start..seg.start + seg.len]
                .copy_from_slice(&block[seg.block_off..seg.block_off + seg.len]);
        }

        Ok(dst.len())
    }

    /// Write `src` at byte offset `off`
    ///
    /// Each spanned block is read-modify-written: the current payload
    /// comes from the buffer, the cache or the provider, the new bytes
    /// are spliced in at the intra-block offset, and the merged block
    /// is parked in the write buffer while the cache entry is dropped.
    /// Blocks covered end to end skip the base fetch. If the buffer
    /// grows past `max_write_queue`, the call flushes before
    /// returning.
    pub async fn write_at(&self, src: &[u8], off: u64) -> BlockResult<usize> {
        self.check_bounds(off, src.len() as u64)?;
        if src.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.lock().await;
        trace!(off, len = src.len(), "write_at");

        let block_size = self.block_size as usize;
        let segments = split_range(off, src.len(), self.block_size);

        let mut bases: Vec<Option<Bytes>> = vec![None; segments.len()];
        let mut misses = Vec::new();
        for (idx, seg) in segments.iter().enumerate() {
            if seg.len == block_size {
                continue;
            }
            if let Some(block) = state.buffer.get(seg.block_id) {
                bases[idx] = Some(block.clone());
            } else if let Some(block) = self.cache.get(seg.block_id) {
                bases[idx] = Some(block);
            } else {
                misses.push((idx, seg.block_id));
            }
        }
        for (idx, block) in self.fetch_blocks(misses, &self.write_permits).await? {
            bases[idx] = Some(block);
        }

        for (idx, seg) in segments.iter().enumerate() {
            // A fresh buffer per merge keeps published payloads immutable.
            let mut block = match bases[idx].take() {
                Some(base) => BytesMut::from(&base[..]),
                None => BytesMut::zeroed(block_size),
            };
            block[seg.block_off..seg.block_off + seg.len]
                .copy_from_slice(&src[seg.start..seg.start + seg.len]);

            state.buffer.insert(seg.block_id, block.freeze());
            self.cache.remove(seg.block_id);
        }

        if state.buffer.len() > self.max_write_queue {
            debug!(
                dirty = state.buffer.len(),
                threshold = self.max_write_queue,
                "write queue over threshold"
            );
            self.flush_locked(&mut state).await?;
        }

        Ok(src.len())
    }

    /// Upload every dirty block, then record the flush time
    ///
    /// Serializes with in-flight reads and writes; all acknowledged
    /// writes are in the provider when this returns.
    pub async fn sync(&self) -> BlockResult<()> {
        let mut state = self.state.lock().await;
        debug!(dirty = state.buffer.len(), "sync");
        self.flush_locked(&mut state).await
    }

    /// Flush if the buffer is non-empty and stale
    ///
    /// Called periodically by the server's background ticker.
    pub async fn sync_if_timeout(&self) -> BlockResult<()> {
        let mut state = self.state.lock().await;
        if state.last_flush.elapsed() > self.sync_interval && !state.buffer.is_empty() {
            debug!(dirty = state.buffer.len(), "periodic flush");
            self.flush_locked(&mut state).await
        } else {
            Ok(())
        }
    }

    /// Drain the write buffer with bounded upload parallelism.
    ///
    /// A block id stays in the buffer until its upload succeeds. The
    /// first failure marks the flush aborted: uploads that have not
    /// started yet are skipped, everything not uploaded stays buffered
    /// for the next sync, and the error propagates.
    async fn flush_locked(&self, state: &mut IoState) -> BlockResult<()> {
        if state.buffer.is_empty() {
            state.last_flush = Instant::now();
            return Ok(());
        }

        let entries = state.buffer.snapshot();
        debug!(dirty = entries.len(), "flushing write buffer");

        let aborted = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(entries.len());
        for (id, block) in entries {
            let permit = self
                .write_permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| BlockError::Worker("flush semaphore closed".to_string()))?;
            let provider = Arc::clone(&self.provider);
            let aborted = Arc::clone(&aborted);

            handles.push((
                id,
                tokio::spawn(async move {
                    if aborted.load(Ordering::SeqCst) {
                        drop(permit);
                        return Ok(UploadOutcome::Skipped);
                    }
                    let result = provider.write_block(id, block).await;
                    drop(permit);

                    match result {
                        Ok(()) => Ok(UploadOutcome::Uploaded),
                        Err(e) => {
                            aborted.store(true, Ordering::SeqCst);
                            Err(BlockError::from(e))
                        }
                    }
                }),
            ));
        }

        let mut first_error = None;
        for (id, handle) in handles {
            match handle.await {
                Ok(Ok(UploadOutcome::Uploaded)) => {
                    state.buffer.remove(id);
                }
                Ok(Ok(UploadOutcome::Skipped)) => {}
                Ok(Err(e)) => {
                    warn!(block = id, error = %e, "block upload failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(BlockError::Worker(e.to_string()));
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        state.last_flush = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_store::MemoryProvider;

    const BLOCK_SIZE: u64 = 16;

    fn test_map(block_count: u64) -> BlockMap {
        let provider = Arc::new(MemoryProvider::new(BLOCK_SIZE as usize));
        let config = BlockMapConfig::new(BLOCK_SIZE * block_count, BLOCK_SIZE);
        BlockMap::new(provider, BlockCache::new(2), config).unwrap()
    }

    #[test]
    fn range_splits_at_block_boundaries() {
        // Head partial, one interior, tail partial.
        let segments = split_range(10, 30, 16);
        assert_eq!(
            segments,
            vec![
                Segment { block_id: 0, block_off: 10, len: 6, start: 0 },
                Segment { block_id: 1, block_off: 0, len: 16, start: 6 },
                Segment { block_id: 2, block_off: 0, len: 8, start: 22 },
            ]
        );
    }

    #[test]
    fn aligned_range_is_one_full_segment() {
        let segments = split_range(32, 16, 16);
        assert_eq!(
            segments,
            vec![Segment { block_id: 2, block_off: 0, len: 16, start: 0 }]
        );
    }

    #[test]
    fn sub_block_range_stays_in_one_block() {
        let segments = split_range(3, 5, 16);
        assert_eq!(
            segments,
            vec![Segment { block_id: 0, block_off: 3, len: 5, start: 0 }]
        );
    }

    #[tokio::test]
    async fn out_of_range_requests_are_rejected() {
        let map = test_map(4);
        let mut dst = vec![0u8; 8];

        assert!(matches!(
            map.read_at(&mut dst, 60).await,
            Err(BlockError::OutOfBounds { .. })
        ));
        assert!(matches!(
            map.write_at(&dst, u64::MAX).await,
            Err(BlockError::OutOfBounds { .. })
        ));
        // The last valid range is fine.
        map.read_at(&mut dst, 56).await.unwrap();
    }

    #[tokio::test]
    async fn empty_requests_are_no_ops() {
        let map = test_map(4);
        assert_eq!(map.read_at(&mut [], 0).await.unwrap(), 0);
        assert_eq!(map.write_at(&[], 64).await.unwrap(), 0);
        assert_eq!(map.dirty_blocks().await, 0);
    }

    #[tokio::test]
    async fn reads_populate_the_cache() {
        let map = test_map(4);
        let mut dst = vec![0u8; 16];
        map.read_at(&mut dst, 0).await.unwrap();

        assert!(map.is_cached(0));
        assert!(!map.is_dirty(0).await);
    }

    #[tokio::test]
    async fn writes_dirty_the_block_and_drop_the_cache_entry() {
        let map = test_map(4);
        let mut dst = vec![0u8; 16];
        map.read_at(&mut dst, 0).await.unwrap();
        assert!(map.is_cached(0));

        map.write_at(b"abc", 4).await.unwrap();
        assert!(map.is_dirty(0).await);
        assert!(!map.is_cached(0));
    }

    #[test]
    fn exact_length_blocks_pass_the_invariant_check() {
        let block = Bytes::from(vec![0u8; BLOCK_SIZE as usize]);
        enforce_block_length(0, &block, BLOCK_SIZE as usize);
        // A wrong-length block would have aborted the process; the
        // provider suites cover torn objects at the store boundary.
    }
}
