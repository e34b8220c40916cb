//! Device adapter
//!
//! Thin byte-level facade over [`BlockMap`], shaped for the NBD
//! connection handler. The adapter owns the block map by shared
//! reference and delegates; the block map knows nothing about the
//! device or the protocol above it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::blockmap::BlockMap;
use crate::error::BlockResult;

/// Byte-level I/O surface consumed by the NBD transmission loop
#[async_trait]
pub trait DeviceIo: Send + Sync + 'static {
    /// Device size in bytes
    fn size(&self) -> u64;

    /// Read `length` bytes at `offset`; the result is fully populated
    async fn read(&self, offset: u64, length: u32) -> BlockResult<Bytes>;

    /// Persist `data` at `offset` (possibly only to the write buffer)
    async fn write(&self, offset: u64, data: &[u8]) -> BlockResult<()>;

    /// Push all acknowledged writes to the provider
    async fn flush(&self) -> BlockResult<()>;
}

/// Virtual block device backed by a [`BlockMap`]
pub struct BlockDevice {
    map: Arc<BlockMap>,
}

impl BlockDevice {
    /// Wrap a block map
    pub fn new(map: Arc<BlockMap>) -> Self {
        Self { map }
    }

    /// The underlying block map
    pub fn block_map(&self) -> &Arc<BlockMap> {
        &self.map
    }

    /// Flush if the write buffer is stale; driven by the server ticker
    pub async fn sync_if_timeout(&self) -> BlockResult<()> {
        self.map.sync_if_timeout().await
    }
}

#[async_trait]
impl DeviceIo for BlockDevice {
    fn size(&self) -> u64 {
        self.map.size()
    }

    async fn read(&self, offset: u64, length: u32) -> BlockResult<Bytes> {
        let mut buf = vec![0u8; length as usize];
        self.map.read_at(&mut buf, offset).await?;
        Ok(Bytes::from(buf))
    }

    async fn write(&self, offset: u64, data: &[u8]) -> BlockResult<()> {
        self.map.write_at(data, offset).await?;
        Ok(())
    }

    async fn flush(&self) -> BlockResult<()> {
        self.map.sync().await
    }
}
