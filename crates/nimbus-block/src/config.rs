//! Block map and server configuration

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BlockError, BlockResult};

/// Default block size: 4 MiB
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Default cache budget: 128 MiB
pub const DEFAULT_CACHE_BYTES: u64 = 128 * 1024 * 1024;

/// Block map configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMapConfig {
    /// Bytes per block
    pub block_size: u64,
    /// Number of blocks in the device
    pub block_count: u64,
    /// Dirty-block threshold that triggers a synchronous flush
    pub max_write_queue: usize,
    /// Bound on read-path provider fan-out
    pub concurrent_reads: usize,
    /// Bound on write-path and flush provider fan-out
    pub concurrent_writes: usize,
    /// Background flush period
    pub sync_interval: Duration,
}

impl Default for BlockMapConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            block_count: 0,
            max_write_queue: 16,
            concurrent_reads: 4,
            concurrent_writes: 4,
            sync_interval: Duration::from_secs(5),
        }
    }
}

impl BlockMapConfig {
    /// Configuration for a device of `size` bytes with the given block size
    pub fn new(size: u64, block_size: u64) -> Self {
        Self {
            block_size,
            block_count: if block_size == 0 { 0 } else { size / block_size },
            ..Default::default()
        }
    }

    /// Set the flush threshold
    pub fn max_write_queue(mut self, blocks: usize) -> Self {
        self.max_write_queue = blocks;
        self
    }

    /// Set the read fan-out bound
    pub fn concurrent_reads(mut self, tasks: usize) -> Self {
        self.concurrent_reads = tasks;
        self
    }

    /// Set the write fan-out bound
    pub fn concurrent_writes(mut self, tasks: usize) -> Self {
        self.concurrent_writes = tasks;
        self
    }

    /// Set the background flush period
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Device size in bytes
    pub fn device_size(&self) -> BlockResult<u64> {
        self.block_size
            .checked_mul(self.block_count)
            .ok_or_else(|| {
                BlockError::Geometry(format!(
                    "{} x {} blocks overflows",
                    self.block_size, self.block_count
                ))
            })
    }

    /// Reject geometries the block map cannot serve
    pub fn validate(&self) -> BlockResult<()> {
        if self.block_size == 0 {
            return Err(BlockError::Geometry("block size must be non-zero".into()));
        }
        if self.block_count == 0 {
            return Err(BlockError::Geometry("device has no blocks".into()));
        }
        if self.concurrent_reads == 0 || self.concurrent_writes == 0 {
            return Err(BlockError::Geometry("fan-out bounds must be non-zero".into()));
        }
        self.device_size().map(|_| ())
    }
}

/// NBD server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbdServerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Export name announced to clients
    pub export: String,
}

impl Default for NbdServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:10809".parse().unwrap(),
            export: "nimbus".to_string(),
        }
    }
}

impl NbdServerConfig {
    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the export name
    pub fn export(mut self, name: impl Into<String>) -> Self {
        self.export = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_split_into_blocks() {
        let config = BlockMapConfig::new(64, 16);
        assert_eq!(config.block_count, 4);
        assert_eq!(config.device_size().unwrap(), 64);
        config.validate().unwrap();
    }

    #[test]
    fn builders_override_defaults() {
        let config = BlockMapConfig::new(1024, 256)
            .max_write_queue(2)
            .concurrent_reads(8)
            .sync_interval(Duration::from_secs(1));

        assert_eq!(config.max_write_queue, 2);
        assert_eq!(config.concurrent_reads, 8);
        assert_eq!(config.concurrent_writes, 4);
        assert_eq!(config.sync_interval, Duration::from_secs(1));
    }

    #[test]
    fn degenerate_geometries_are_rejected() {
        assert!(BlockMapConfig::new(0, 16).validate().is_err());
        assert!(BlockMapConfig::new(64, 0).validate().is_err());

        let overflowing = BlockMapConfig {
            block_size: u64::MAX,
            block_count: 2,
            ..Default::default()
        };
        assert!(overflowing.device_size().is_err());
    }

    #[test]
    fn server_config_builders() {
        let config = NbdServerConfig::default()
            .bind("0.0.0.0:12000".parse().unwrap())
            .export("disk0");
        assert_eq!(config.bind_addr.port(), 12000);
        assert_eq!(config.export, "disk0");
    }
}
