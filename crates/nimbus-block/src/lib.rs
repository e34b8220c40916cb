//! # nimbus-block: remote storage as a local block device
//!
//! Serves a virtual disk over the NBD protocol, backed by any
//! `nimbus-store` provider. The interesting part is the block map:
//! byte-range requests on one side, a fixed-block-size object store on
//! the other, with an LRU cache and a write-coalescing buffer in
//! between so the kernel never waits on the backend more than it has
//! to.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐
//! │ NBD client │  (kernel nbd-client / qemu-nbd)
//! └─────┬──────┘
//!       │ NBD protocol
//! ┌─────▼──────┐
//! │ NbdServer  │  negotiation, transmission loop, sync ticker
//! └─────┬──────┘
//! ┌─────▼──────┐
//! │BlockDevice │  byte-level read / write / flush
//! └─────┬──────┘
//! ┌─────▼──────┐     ┌────────────┐  ┌─────────────┐
//! │  BlockMap  │────▶│ BlockCache │  │ WriteBuffer │
//! └─────┬──────┘     └────────────┘  └─────────────┘
//!       │ read_block / write_block
//! ┌─────▼────────┐
//! │ nimbus-store │  local dir, Dropbox, memory
//! └──────────────┘
//! ```

#![warn(missing_docs)]

pub mod blockmap;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod nbd;
pub mod server;

pub use blockmap::BlockMap;
pub use buffer::WriteBuffer;
pub use cache::BlockCache;
pub use config::{BlockMapConfig, DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_BYTES, NbdServerConfig};
pub use device::{BlockDevice, DeviceIo};
pub use error::{BlockError, BlockResult, NbdErrno};
pub use nbd::{ExportInfo, NbdConnection};
pub use server::NbdServer;
