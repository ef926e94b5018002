//! A wire block together with its organizer bookkeeping.

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use keel_common::{Block, BlockHash, Work};

/// Shared handle to a record. The pool, trace results and the chain store
/// may all hold the same record without copying the block.
pub type BlockRecordPtr = Arc<BlockRecord>;

/// Where a block currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPlacement {
    /// Not yet seen by the pool or the chain.
    Unplaced,
    /// Buffered in the orphan pool awaiting a connected, heavier chain.
    Orphan,
    /// Part of the accepted chain.
    MainChain { height: u64 },
    /// Failed verification; never re-enters the pipeline.
    Rejected,
}

/// Immutable block plus mutable processing metadata.
///
/// The hash is computed once at construction and is the record's sole
/// identity: equality and hashing ignore every other field.
pub struct BlockRecord {
    block: Arc<Block>,
    hash: BlockHash,
    work: Work,
    processed: AtomicBool,
    verified: AtomicBool,
    placement: Mutex<BlockPlacement>,
}

impl BlockRecord {
    pub fn new(block: Block) -> Self {
        Self::from_arc(Arc::new(block))
    }

    /// Create a record ready to be shared.
    pub fn shared(block: Block) -> BlockRecordPtr {
        Arc::new(Self::new(block))
    }

    /// Create a fresh record over an existing block body. Used when a
    /// displaced block re-enters the pool with clean metadata.
    pub fn from_arc(block: Arc<Block>) -> Self {
        let hash = block.hash();
        let work = block.work();
        Self {
            block,
            hash,
            work,
            processed: AtomicBool::new(false),
            verified: AtomicBool::new(false),
            placement: Mutex::new(BlockPlacement::Unplaced),
        }
    }

    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn previous_hash(&self) -> BlockHash {
        self.block.previous_hash()
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn block_ptr(&self) -> Arc<Block> {
        self.block.clone()
    }

    /// Proof-of-work of this block alone.
    pub fn work(&self) -> &Work {
        &self.work
    }

    /// Flag the record as processed. Never reset.
    pub fn mark_processed(&self) {
        self.processed.store(true, Ordering::Release);
    }

    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::Acquire)
    }

    /// Flag the record as having passed the verification hook.
    pub fn mark_verified(&self) {
        self.verified.store(true, Ordering::Release);
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::Acquire)
    }

    pub fn set_placement(&self, placement: BlockPlacement) {
        *self.placement.lock().unwrap_or_else(PoisonError::into_inner) = placement;
    }

    pub fn placement(&self) -> BlockPlacement {
        *self.placement.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for BlockRecord {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for BlockRecord {}

impl Hash for BlockRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Debug for BlockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRecord")
            .field("hash", &self.hash.to_string())
            .field("previous", &self.previous_hash().to_string())
            .field("processed", &self.is_processed())
            .field("verified", &self.is_verified())
            .field("placement", &self.placement())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(nonce: u32) -> Block {
        Block::genesis(0, 0x207f_ffff, nonce)
    }

    #[test]
    fn identity_is_the_block_hash() {
        let a = BlockRecord::new(block(1));
        let b = BlockRecord::new(block(1));
        let c = BlockRecord::new(block(2));

        assert_eq!(a.hash(), block(1).hash());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn metadata_changes_do_not_affect_identity() {
        let a = BlockRecord::new(block(1));
        let b = BlockRecord::new(block(1));
        a.mark_processed();
        a.mark_verified();
        a.set_placement(BlockPlacement::MainChain { height: 4 });

        assert_eq!(a, b);
        assert!(a.is_processed() && a.is_verified());
        assert!(!b.is_processed() && !b.is_verified());
        assert_eq!(a.placement(), BlockPlacement::MainChain { height: 4 });
        assert_eq!(b.placement(), BlockPlacement::Unplaced);
    }

    #[test]
    fn fresh_record_shares_block_body() {
        let original = BlockRecord::shared(block(3));
        original.mark_processed();

        let fresh = BlockRecord::from_arc(original.block_ptr());
        assert!(Arc::ptr_eq(&original.block_ptr(), &fresh.block_ptr()));
        assert!(!fresh.is_processed());
        assert_eq!(fresh.work(), &Work::from(2));
    }
}
