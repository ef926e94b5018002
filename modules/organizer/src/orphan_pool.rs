//! Bounded pool of blocks not yet connected to the accepted chain.
//!
//! Entries reference each other only through the previous-block hash in
//! their headers. When full, the oldest surviving entry is evicted whatever
//! its position in any chain, which bounds memory under orphan flooding.
//! Missing or duplicate keys are never errors: membership is racy by nature.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use keel_common::BlockHash;
use tracing::debug;

use crate::block_record::{BlockPlacement, BlockRecordPtr};

pub const DEFAULT_ORPHAN_POOL_CAPACITY: usize = 512;

struct PoolEntry {
    /// Position in arrival order, unique for the life of the pool.
    sequence: u64,
    record: BlockRecordPtr,
}

pub struct OrphanPool {
    capacity: usize,
    /// Records keyed by block hash.
    entries: HashMap<BlockHash, PoolEntry>,
    /// Sequence to hash; always the same set as `entries`.
    arrival_order: BTreeMap<u64, BlockHash>,
    /// Parent hash to pooled child hashes, oldest first. The parent itself
    /// need not be pooled.
    children: HashMap<BlockHash, Vec<BlockHash>>,
    next_sequence: u64,
}

impl Default for OrphanPool {
    fn default() -> Self {
        Self::new(DEFAULT_ORPHAN_POOL_CAPACITY)
    }
}

impl OrphanPool {
    /// Create a pool holding at most `capacity` blocks (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            arrival_order: BTreeMap::new(),
            children: HashMap::new(),
            next_sequence: 0,
        }
    }

    /// Insert a record, evicting the oldest entries while at capacity.
    /// A record whose hash is already present is ignored.
    pub fn add(&mut self, record: BlockRecordPtr) {
        let hash = record.hash();
        if self.entries.contains_key(&hash) {
            return;
        }

        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.arrival_order.values().next().copied() else {
                break;
            };
            if self.remove(&oldest).is_some() {
                debug!(hash = %oldest, "Evicted orphan block at capacity");
            }
        }

        record.set_placement(BlockPlacement::Orphan);
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        self.children.entry(record.previous_hash()).or_default().push(hash);
        self.arrival_order.insert(sequence, hash);
        self.entries.insert(hash, PoolEntry { sequence, record });
    }

    /// Remove a record by hash, returning it if it was present.
    pub fn remove(&mut self, hash: &BlockHash) -> Option<BlockRecordPtr> {
        let entry = self.entries.remove(hash)?;
        self.arrival_order.remove(&entry.sequence);

        let parent = entry.record.previous_hash();
        if let Some(siblings) = self.children.get_mut(&parent) {
            siblings.retain(|sibling| sibling != hash);
            if siblings.is_empty() {
                self.children.remove(&parent);
            }
        }
        Some(entry.record)
    }

    pub fn get(&self, hash: &BlockHash) -> Option<BlockRecordPtr> {
        self.entries.get(hash).map(|entry| entry.record.clone())
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ancestor run ending at `end`, oldest first.
    ///
    /// Walks parent hashes backwards while the parent is in the pool. The
    /// result always ends with `end` itself, so a block with no buffered
    /// ancestors traces to a single element. Never mutates the pool.
    pub fn trace(&self, end: &BlockRecordPtr) -> Vec<BlockRecordPtr> {
        let mut chain = vec![end.clone()];
        let mut seen = HashSet::from([end.hash()]);

        let mut parent_hash = end.previous_hash();
        while let Some(parent) = self.entries.get(&parent_hash) {
            if !seen.insert(parent_hash) {
                break;
            }
            parent_hash = parent.record.previous_hash();
            chain.push(parent.record.clone());
        }

        chain.reverse();
        chain
    }

    /// Entries not yet processed, oldest first.
    pub fn unprocessed(&self) -> Vec<BlockRecordPtr> {
        self.arrival_order
            .values()
            .filter_map(|hash| self.get(hash))
            .filter(|record| !record.is_processed())
            .collect()
    }

    /// Direct children of `hash` in the pool, oldest first.
    pub fn children(&self, hash: &BlockHash) -> Vec<BlockRecordPtr> {
        self.children.get(hash).into_iter().flatten().filter_map(|kid| self.get(kid)).collect()
    }

    /// Leaves of the in-pool subtree rooted at `hash`, oldest first.
    ///
    /// A pooled block without buffered children is its own tip. Returns
    /// nothing if `hash` is not in the pool.
    pub fn descendant_tips(&self, hash: &BlockHash) -> Vec<BlockRecordPtr> {
        if !self.contains(hash) {
            return Vec::new();
        }

        let mut subtree = HashSet::new();
        let mut tips: Vec<&PoolEntry> = Vec::new();
        let mut pending = vec![*hash];
        while let Some(current) = pending.pop() {
            if !subtree.insert(current) {
                continue;
            }
            match self.children.get(&current) {
                Some(kids) => pending.extend(kids.iter().copied()),
                None => tips.extend(self.entries.get(&current)),
            }
        }

        tips.sort_by_key(|entry| entry.sequence);
        tips.into_iter().map(|entry| entry.record.clone()).collect()
    }

    /// Remove every in-pool descendant of `hash` (not `hash` itself),
    /// returning the removed records parents first.
    pub fn remove_descendants(&mut self, hash: &BlockHash) -> Vec<BlockRecordPtr> {
        let mut removed = Vec::new();

        // Breadth first, so parents come before children
        let mut pending = VecDeque::from([*hash]);
        while let Some(current) = pending.pop_front() {
            let kids = self.children.get(&current).cloned().unwrap_or_default();
            for kid in kids {
                if let Some(record) = self.remove(&kid) {
                    removed.push(record);
                    pending.push_back(kid);
                }
            }
        }

        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_record::BlockRecord;
    use keel_common::Block;

    /// A block whose parent is `parent`, made unique by `nonce`.
    fn child_of(parent: BlockHash, nonce: u32) -> BlockRecordPtr {
        let mut block = Block::genesis(0, 0x207f_ffff, nonce);
        block.header.previous_block_hash = parent;
        BlockRecord::shared(block)
    }

    /// A chain of `n` records, the first attaching to `root`.
    fn chain_from(root: BlockHash, n: usize, seed: u32) -> Vec<BlockRecordPtr> {
        let mut chain: Vec<BlockRecordPtr> = Vec::new();
        let mut parent = root;
        for i in 0..n {
            let record = child_of(parent, seed + i as u32);
            parent = record.hash();
            chain.push(record);
        }
        chain
    }

    fn unrelated(nonce: u32) -> BlockRecordPtr {
        child_of(BlockHash::new([nonce as u8; 32]), nonce)
    }

    fn hashes(records: &[BlockRecordPtr]) -> Vec<BlockHash> {
        records.iter().map(|r| r.hash()).collect()
    }

    #[test]
    fn capacity_two_evicts_the_oldest() {
        let mut pool = OrphanPool::new(2);
        let (a, b, c) = (unrelated(1), unrelated(2), unrelated(3));
        pool.add(a.clone());
        pool.add(b.clone());
        pool.add(c.clone());

        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&a.hash()));
        assert!(pool.contains(&b.hash()));
        assert!(pool.contains(&c.hash()));
    }

    #[test]
    fn never_exceeds_capacity_and_keeps_most_recent() {
        let mut pool = OrphanPool::new(5);
        let records: Vec<_> = (0..23).map(unrelated).collect();
        for record in &records {
            pool.add(record.clone());
            assert!(pool.len() <= 5);
        }

        assert_eq!(hashes(&pool.unprocessed()), hashes(&records[18..]));
    }

    #[test]
    fn zero_capacity_holds_one() {
        let mut pool = OrphanPool::new(0);
        pool.add(unrelated(1));
        pool.add(unrelated(2));
        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn duplicate_add_is_a_no_op() {
        let mut pool = OrphanPool::new(2);
        let a = unrelated(1);
        let b = unrelated(2);
        pool.add(a.clone());
        pool.add(b.clone());
        pool.add(BlockRecord::shared(a.block().clone()));

        assert_eq!(pool.len(), 2);
        assert!(pool.contains(&b.hash()));
    }

    #[test]
    fn add_places_record_as_orphan() {
        let mut pool = OrphanPool::new(4);
        let a = unrelated(1);
        pool.add(a.clone());
        assert_eq!(a.placement(), BlockPlacement::Orphan);
    }

    #[test]
    fn remove_is_silent_when_absent() {
        let mut pool = OrphanPool::new(4);
        let a = unrelated(1);
        assert!(pool.remove(&a.hash()).is_none());

        pool.add(a.clone());
        assert!(pool.remove(&a.hash()).is_some());
        assert!(pool.is_empty());
    }

    #[test]
    fn removed_then_readded_entry_counts_as_newest() {
        let mut pool = OrphanPool::new(2);
        let (a, b, c) = (unrelated(1), unrelated(2), unrelated(3));
        pool.add(a.clone());
        pool.add(b.clone());
        pool.remove(&a.hash());
        pool.add(a.clone());
        pool.add(c.clone());

        // b is now the oldest
        assert!(!pool.contains(&b.hash()));
        assert!(pool.contains(&a.hash()));
        assert!(pool.contains(&c.hash()));
    }

    #[test]
    fn trace_in_parent_first_order() {
        let mut pool = OrphanPool::new(16);
        let chain = chain_from(BlockHash::new([9; 32]), 5, 100);
        for record in &chain {
            pool.add(record.clone());
        }

        let traced = pool.trace(&chain[4]);
        assert_eq!(hashes(&traced), hashes(&chain));
    }

    #[test]
    fn trace_in_reverse_insertion_order() {
        let mut pool = OrphanPool::new(16);
        let chain = chain_from(BlockHash::new([9; 32]), 5, 100);
        for record in chain.iter().rev() {
            pool.add(record.clone());
        }

        assert_eq!(hashes(&pool.trace(&chain[4])), hashes(&chain));
        assert_eq!(hashes(&pool.trace(&chain[2])), hashes(&chain[..3]));
    }

    #[test]
    fn trace_stops_at_gap() {
        let mut pool = OrphanPool::new(16);
        let chain = chain_from(BlockHash::new([9; 32]), 4, 100);
        pool.add(chain[0].clone());
        pool.add(chain[2].clone());
        pool.add(chain[3].clone());

        assert_eq!(hashes(&pool.trace(&chain[3])), hashes(&chain[2..]));
        assert_eq!(hashes(&pool.trace(&chain[0])), hashes(&chain[..1]));
    }

    #[test]
    fn unprocessed_skips_processed_entries() {
        let mut pool = OrphanPool::new(8);
        let (a, b, c) = (unrelated(1), unrelated(2), unrelated(3));
        pool.add(a.clone());
        pool.add(b.clone());
        pool.add(c.clone());
        b.mark_processed();

        assert_eq!(hashes(&pool.unprocessed()), vec![a.hash(), c.hash()]);
    }

    #[test]
    fn descendant_tips_finds_every_branch_leaf() {
        let mut pool = OrphanPool::new(16);
        let trunk = chain_from(BlockHash::new([9; 32]), 2, 100);
        let left = chain_from(trunk[1].hash(), 2, 200);
        let right = chain_from(trunk[1].hash(), 1, 300);
        for record in trunk.iter().chain(&left).chain(&right) {
            pool.add(record.clone());
        }

        let tips = pool.descendant_tips(&trunk[0].hash());
        assert_eq!(hashes(&tips), vec![left[1].hash(), right[0].hash()]);

        assert_eq!(hashes(&pool.descendant_tips(&left[1].hash())), vec![left[1].hash()]);
        assert!(pool.descendant_tips(&BlockHash::default()).is_empty());
        assert_eq!(hashes(&pool.children(&trunk[1].hash())), vec![left[0].hash(), right[0].hash()]);
    }

    #[test]
    fn remove_descendants_takes_whole_subtree() {
        let mut pool = OrphanPool::new(16);
        let trunk = chain_from(BlockHash::new([9; 32]), 3, 100);
        let branch = chain_from(trunk[0].hash(), 2, 200);
        let other = unrelated(7);
        for record in trunk.iter().chain(&branch) {
            pool.add(record.clone());
        }
        pool.add(other.clone());

        let removed = pool.remove_descendants(&trunk[0].hash());
        assert_eq!(removed.len(), 4);
        assert_eq!(removed[0].previous_hash(), trunk[0].hash());
        assert!(pool.contains(&trunk[0].hash()));
        assert!(pool.contains(&other.hash()));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn child_links_follow_eviction_and_removal() {
        let mut pool = OrphanPool::new(3);
        let root = BlockHash::new([9; 32]);
        let chain = chain_from(root, 3, 100);
        let sibling = child_of(chain[0].hash(), 200);
        for record in &chain {
            pool.add(record.clone());
        }
        assert_eq!(hashes(&pool.children(&root)), vec![chain[0].hash()]);

        // Evicts chain[0], whose own children stay indexed under its hash
        pool.add(sibling.clone());
        assert!(pool.children(&root).is_empty());
        assert_eq!(
            hashes(&pool.children(&chain[0].hash())),
            vec![chain[1].hash(), sibling.hash()]
        );

        pool.remove(&chain[2].hash());
        assert_eq!(hashes(&pool.descendant_tips(&chain[1].hash())), vec![chain[1].hash()]);
        assert_eq!(
            hashes(&pool.remove_descendants(&chain[0].hash())),
            vec![chain[1].hash(), sibling.hash()]
        );
        assert!(pool.is_empty());
    }
}
