//! In-memory storage provider
//!
//! Holds blocks in a concurrent map. Backs the block-map test suites
//! and is handy for benchmarking the data path without touching a
//! real store. Operation counters let tests assert how many provider
//! calls an access pattern produced.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::provider::{BlockProvider, zero_block};
use crate::{Error, Result};

/// Map-backed block provider
pub struct MemoryProvider {
    blocks: DashMap<u64, Bytes>,
    block_size: usize,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryProvider {
    /// Create an empty provider
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: DashMap::new(),
            block_size,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of blocks that have been persisted
    pub fn stored_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Whether a block id has been persisted
    pub fn contains(&self, id: u64) -> bool {
        self.blocks.contains_key(&id)
    }

    /// Total `read_block` calls served
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Total `write_block` calls served
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BlockProvider for MemoryProvider {
    async fn read_block(&self, id: u64) -> Result<Bytes> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        match self.blocks.get(&id) {
            Some(block) => Ok(block.clone()),
            None => Ok(zero_block(self.block_size)),
        }
    }

    async fn write_block(&self, id: u64, block: Bytes) -> Result<()> {
        if block.len() != self.block_size {
            return Err(Error::BlockLength {
                id,
                actual: block.len(),
                expected: self.block_size,
            });
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.blocks.insert(id, block);
        Ok(())
    }
}
