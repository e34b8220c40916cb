//! Write-coalescing buffer
//!
//! Holds the full payload of every dirty block until a flush uploads
//! it. A block id is present iff the block is dirty; repeated writes
//! to the same block replace the entry, so any number of overlapping
//! writes costs exactly one upload at the next flush. The buffer is
//! only ever touched under the block map's I/O lock.

use std::collections::HashMap;

use bytes::Bytes;

/// Dirty-block buffer keyed by block id
#[derive(Debug, Default)]
pub struct WriteBuffer {
    blocks: HashMap<u64, Bytes>,
}

impl WriteBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a dirty block, replacing any previous payload for the id
    pub fn insert(&mut self, id: u64, block: Bytes) {
        self.blocks.insert(id, block);
    }

    /// Payload of a dirty block, if the id is dirty
    pub fn get(&self, id: u64) -> Option<&Bytes> {
        self.blocks.get(&id)
    }

    /// Drop a block after its upload succeeded
    pub fn remove(&mut self, id: u64) -> Option<Bytes> {
        self.blocks.remove(&id)
    }

    /// Whether a block id is dirty
    pub fn contains(&self, id: u64) -> bool {
        self.blocks.contains_key(&id)
    }

    /// Number of dirty blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether no blocks are dirty
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Snapshot of all dirty blocks, in no particular order
    pub fn snapshot(&self) -> Vec<(u64, Bytes)> {
        self.blocks
            .iter()
            .map(|(&id, block)| (id, block.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_write_replaces_earlier() {
        let mut buffer = WriteBuffer::new();
        buffer.insert(0, Bytes::from_static(b"old"));
        buffer.insert(0, Bytes::from_static(b"new"));

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get(0).unwrap(), &Bytes::from_static(b"new"));
    }

    #[test]
    fn remove_marks_clean() {
        let mut buffer = WriteBuffer::new();
        buffer.insert(3, Bytes::from_static(b"dirty"));
        assert!(buffer.contains(3));

        assert_eq!(buffer.remove(3), Some(Bytes::from_static(b"dirty")));
        assert!(!buffer.contains(3));
        assert!(buffer.is_empty());
    }

    #[test]
    fn snapshot_covers_every_entry() {
        let mut buffer = WriteBuffer::new();
        buffer.insert(1, Bytes::from_static(b"a"));
        buffer.insert(2, Bytes::from_static(b"b"));

        let mut ids: Vec<u64> = buffer.snapshot().into_iter().map(|(id, _)| id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        // Snapshotting does not drain the buffer.
        assert_eq!(buffer.len(), 2);
    }
}
