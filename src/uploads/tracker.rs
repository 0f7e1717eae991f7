use std::collections::HashMap;
use std::sync::Arc;

use md5::{Digest, Md5};
use tokio::sync::{Mutex, RwLock};

/// Packed bitset of arrived block numbers. Blocks are 1-based on the wire;
/// bit 0 is block 1.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSet {
    bits: Vec<u8>,
    num_blocks: u64,
}

impl BlockSet {
    pub fn new(num_blocks: u64) -> Self {
        let num_bytes = num_blocks.div_ceil(8) as usize;
        BlockSet {
            bits: vec![0; num_bytes],
            num_blocks,
        }
    }

    /// Rebuild a bitset from its persisted bytes. Extra trailing bytes are
    /// tolerated, missing ones are zero-filled.
    pub fn from_bytes(bytes: &[u8], num_blocks: u64) -> Self {
        let mut set = BlockSet::new(num_blocks);
        let take = set.bits.len().min(bytes.len());
        set.bits[..take].copy_from_slice(&bytes[..take]);
        set
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.clone()
    }

    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    pub fn is_set(&self, block: u64) -> bool {
        if block == 0 || block > self.num_blocks {
            return false;
        }
        let idx = (block - 1) as usize;
        self.bits[idx / 8] & (1 << (idx % 8)) != 0
    }

    pub fn set(&mut self, block: u64) {
        if block == 0 || block > self.num_blocks {
            return;
        }
        let idx = (block - 1) as usize;
        self.bits[idx / 8] |= 1 << (idx % 8);
    }

    /// Smallest unset block number, or None when every block has arrived.
    pub fn first_unset(&self) -> Option<u64> {
        (1..=self.num_blocks).find(|&block| !self.is_set(block))
    }

    pub fn all_set(&self) -> bool {
        self.first_unset().is_none()
    }

    pub fn none_set(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }
}

/// Volatile companion of a persistent upload request: the arrived-block
/// bitset plus the rolling checksum state.
#[derive(Debug)]
pub struct TrackerEntry {
    blocks: BlockSet,
    hasher: Md5,
    server_restarted: bool,
}

impl TrackerEntry {
    fn new(blocks: BlockSet, server_restarted: bool) -> Self {
        TrackerEntry {
            blocks,
            hasher: Md5::new(),
            server_restarted,
        }
    }

    pub fn is_block_set(&self, block: u64) -> bool {
        self.blocks.is_set(block)
    }

    pub fn set_block(&mut self, block: u64) {
        self.blocks.set(block);
    }

    /// Advance the rolling checksum. Only meaningful while blocks are
    /// applied in increasing order from block 1; after a restart the
    /// state is unrecoverable and the assembler hashes the file instead.
    pub fn add_to_hash(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn done(&self) -> bool {
        self.blocks.all_set()
    }

    /// Hex digest of the rolling checksum so far.
    pub fn hash(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    pub fn server_restarted(&self) -> bool {
        self.server_restarted
    }

    pub fn blocks(&self) -> &BlockSet {
        &self.blocks
    }
}

/// Process-wide tracker of in-flight uploads.
///
/// The map is behind a reader/writer lock; each entry carries its own
/// mutex so writes for one upload serialize without blocking other
/// uploads.
#[derive(Debug, Default)]
pub struct BlockTracker {
    entries: RwLock<HashMap<String, Arc<Mutex<TrackerEntry>>>>,
}

impl BlockTracker {
    pub fn new() -> Self {
        BlockTracker {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    /// Install an entry for an upload if none exists, and return it. Used
    /// on create and when re-materializing after a restart.
    pub async fn load(
        &self,
        id: &str,
        arrived: BlockSet,
        server_restarted: bool,
    ) -> Arc<Mutex<TrackerEntry>> {
        let mut entries = self.entries.write().await;
        entries
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TrackerEntry::new(arrived, server_restarted))))
            .clone()
    }

    /// The entry for an upload, if one is live in this process.
    pub async fn entry(&self, id: &str) -> Option<Arc<Mutex<TrackerEntry>>> {
        self.entries.read().await.get(id).cloned()
    }

    pub async fn clear(&self, id: &str) {
        self.entries.write().await.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_blockset_reports_first_unset_one() {
        let set = BlockSet::new(4);
        assert!(set.none_set());
        assert_eq!(set.first_unset(), Some(1));
        assert!(!set.all_set());
    }

    #[test]
    fn first_unset_skips_leading_arrived_blocks() {
        let mut set = BlockSet::new(5);
        set.set(1);
        set.set(2);
        assert_eq!(set.first_unset(), Some(3));

        set.set(3);
        set.set(4);
        set.set(5);
        assert!(set.all_set());
        assert_eq!(set.first_unset(), None);
    }

    #[test]
    fn gaps_are_found_before_the_tail() {
        let mut set = BlockSet::new(9);
        set.set(1);
        set.set(3);
        set.set(9);
        assert_eq!(set.first_unset(), Some(2));
    }

    #[test]
    fn bytes_roundtrip_preserves_arrived_blocks() {
        let mut set = BlockSet::new(12);
        set.set(1);
        set.set(8);
        set.set(9);
        set.set(12);

        let restored = BlockSet::from_bytes(&set.to_bytes(), 12);
        assert_eq!(restored, set);
        assert!(restored.is_set(8));
        assert!(!restored.is_set(2));
    }

    #[test]
    fn out_of_range_blocks_are_ignored() {
        let mut set = BlockSet::new(3);
        set.set(0);
        set.set(4);
        assert!(set.none_set());
        assert!(!set.is_set(0));
        assert!(!set.is_set(4));
    }

    #[test]
    fn zero_block_set_is_trivially_complete() {
        let set = BlockSet::new(0);
        assert!(set.all_set());
        assert_eq!(set.first_unset(), None);
    }

    #[tokio::test]
    async fn rolling_hash_matches_whole_payload_digest() {
        let tracker = BlockTracker::new();
        let entry = tracker.load("u1", BlockSet::new(2), false).await;

        {
            let mut entry = entry.lock().await;
            entry.add_to_hash(b"ab");
            entry.set_block(1);
            entry.add_to_hash(b"cd");
            entry.set_block(2);
            assert!(entry.done());

            let expected = hex::encode(Md5::digest(b"abcd"));
            assert_eq!(entry.hash(), expected);
        }
    }

    #[tokio::test]
    async fn load_is_idempotent_per_id() {
        let tracker = BlockTracker::new();
        let first = tracker.load("u1", BlockSet::new(4), false).await;
        first.lock().await.set_block(1);

        // A second load must hand back the same entry, not a fresh one.
        let second = tracker.load("u1", BlockSet::new(4), false).await;
        assert!(second.lock().await.is_block_set(1));

        tracker.clear("u1").await;
        assert!(!tracker.exists("u1").await);
    }
}
