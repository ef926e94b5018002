use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use imbl::{HashMap, Vector};
use keel_common::{Block, BlockHash, Work};

use crate::block_record::{BlockPlacement, BlockRecord, BlockRecordPtr};

use super::ChainStore;

/// Snapshot of the accepted chain. Cloning is cheap, so writers build the
/// next snapshot aside and swap it in.
#[derive(Clone, Default)]
struct ChainState {
    blocks: Vector<BlockRecordPtr>,
    heights: HashMap<BlockHash, u64>,
}

impl ChainState {
    fn tip(&self) -> Option<u64> {
        (self.blocks.len() as u64).checked_sub(1)
    }

    fn hash_at(&self, height: u64) -> Option<BlockHash> {
        self.blocks.get(height as usize).map(|record| record.hash())
    }

    fn push(&mut self, block: BlockRecordPtr) -> Result<()> {
        let expected = self.tip().and_then(|tip| self.hash_at(tip)).unwrap_or_default();
        if block.previous_hash() != expected {
            bail!(
                "Block {} does not extend tip {expected} (parent {})",
                block.hash(),
                block.previous_hash()
            );
        }
        if self.heights.contains_key(&block.hash()) {
            bail!("Block {} is already in the chain", block.hash());
        }
        self.heights.insert(block.hash(), self.blocks.len() as u64);
        self.blocks.push_back(block);
        Ok(())
    }

    fn truncate_above(&mut self, height: u64) {
        let keep = (height as usize + 1).min(self.blocks.len());
        let removed = self.blocks.slice(keep..);
        for record in removed.iter() {
            self.heights.remove(&record.hash());
        }
    }
}

/// In-memory accepted chain on persistent collections.
pub struct MemoryChainStore {
    state: RwLock<ChainState>,
}

impl MemoryChainStore {
    /// Create a chain holding only `genesis`.
    pub fn new(genesis: Block) -> Self {
        let record = BlockRecord::shared(genesis);
        record.mark_processed();
        record.mark_verified();
        record.set_placement(BlockPlacement::MainChain { height: 0 });

        let mut state = ChainState::default();
        state.heights.insert(record.hash(), 0);
        state.blocks.push_back(record);

        Self {
            state: RwLock::new(state),
        }
    }

    fn snapshot(&self) -> Result<ChainState> {
        self.state
            .read()
            .map(|state| state.clone())
            .map_err(|_| anyhow!("Chain state lock poisoned"))
    }

    /// Apply `change` to a copy of the state and swap it in on success.
    fn update(&self, change: impl FnOnce(&mut ChainState) -> Result<()>) -> Result<()> {
        let mut guard = self.state.write().map_err(|_| anyhow!("Chain state lock poisoned"))?;
        let mut next = guard.clone();
        change(&mut next)?;
        *guard = next;
        Ok(())
    }
}

impl ChainStore for MemoryChainStore {
    fn find_index(&self, hash: &BlockHash) -> Result<Option<u64>> {
        Ok(self.snapshot()?.heights.get(hash).copied())
    }

    fn end_slice_difficulty(&self, from_height: u64) -> Result<Work> {
        Ok(self.end_slice(from_height)?.iter().map(|record| record.work().clone()).sum())
    }

    fn end_slice(&self, from_height: u64) -> Result<Vec<BlockRecordPtr>> {
        let state = self.snapshot()?;
        let start = (from_height as usize).saturating_add(1);
        Ok(state.blocks.iter().skip(start).cloned().collect())
    }

    fn add(&self, block: BlockRecordPtr) -> Result<()> {
        self.update(|state| state.push(block))
    }

    fn replace_tail(&self, from_height: u64, blocks: &[BlockRecordPtr]) -> Result<()> {
        self.update(|state| {
            match state.tip() {
                Some(tip) if from_height <= tip => {}
                tip => bail!("Cannot replace above height {from_height}, tip is {tip:?}"),
            }
            state.truncate_above(from_height);
            for block in blocks {
                state.push(block.clone())?;
            }
            Ok(())
        })
    }

    fn tip(&self) -> Result<Option<u64>> {
        Ok(self.snapshot()?.tip())
    }
}
