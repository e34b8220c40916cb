//! Block provider contract
//!
//! The two-call interface every backend implements. Blocks are
//! addressed by a non-negative integer id and are always exactly
//! `block_size` bytes long; a provider that cannot find an object for
//! an id returns a zero-filled block instead of an error.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::Result;

/// Storage backend for fixed-size blocks
///
/// The block map issues at most one call per `(id, operation)` at a
/// time, but calls for distinct ids may arrive from distinct
/// concurrent tasks. Retrying transport failures is the provider's
/// business; `write_block` must therefore be idempotent.
#[async_trait]
pub trait BlockProvider: Send + Sync + 'static {
    /// Fetch one block. Absent objects read as all zeros.
    async fn read_block(&self, id: u64) -> Result<Bytes>;

    /// Persist one block, overwriting any previous contents.
    async fn write_block(&self, id: u64, block: Bytes) -> Result<()>;
}

/// Object name for a block id, shared by all flat-namespace providers
pub fn block_object_name(id: u64) -> String {
    format!("{}.block", id)
}

/// A zero-filled block of the given size
pub fn zero_block(block_size: usize) -> Bytes {
    BytesMut::zeroed(block_size).freeze()
}
