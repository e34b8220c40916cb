//! Local directory storage provider
//!
//! Stores each block as an independent file named `<id>.block` in a
//! flat directory:
//!
//! ```text
//! folder/
//! ├── 0.block
//! ├── 1.block
//! └── 17.block
//! ```
//!
//! There is no index file; the device geometry is carried by process
//! configuration. Useful as a loopback-style backend and as the
//! on-disk reference for what remote providers persist.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::provider::{BlockProvider, block_object_name, zero_block};
use crate::{Error, Result};

/// Filesystem-backed block provider
pub struct LocalProvider {
    folder: PathBuf,
    block_size: usize,
}

impl LocalProvider {
    /// Open a provider rooted at `folder`, creating the directory if needed
    pub async fn open(folder: impl Into<PathBuf>, block_size: usize) -> Result<Self> {
        let folder = folder.into();
        fs::create_dir_all(&folder).await?;
        debug!(folder = %folder.display(), block_size, "opened local block store");
        Ok(Self { folder, block_size })
    }

    /// Path of the file backing a block id
    fn block_path(&self, id: u64) -> PathBuf {
        self.folder.join(block_object_name(id))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlockProvider for LocalProvider {
    async fn read_block(&self, id: u64) -> Result<Bytes> {
        let path = self.block_path(id);
        trace!(block = id, path = %path.display(), "reading block file");

        match fs::read(&path).await {
            Ok(data) if data.len() == self.block_size => Ok(Bytes::from(data)),
            Ok(data) => Err(Error::BlockLength {
                id,
                actual: data.len(),
                expected: self.block_size,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(zero_block(self.block_size))
            }
            Err(e) => Err(e.into()),
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

        let path = self.block_path(id);
        trace!(block = id, path = %path.display(), "writing block file");
        Self::ensure_parent(&path).await?;

        // Write to a temp file, then rename, so readers never observe
        // a partially written block.
        let temp = path.with_extension("tmp");
        let mut file = fs::File::create(&temp).await?;
        file.write_all(&block).await?;
        file.sync_all().await?;
        fs::rename(&temp, &path).await?;
        Ok(())
    }
}
