use std::{
    collections::HashSet,
    fs,
    path::PathBuf,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use anyhow::{anyhow, bail, Result};
use config::Config;
use fjall::{Database, Keyspace, OwnedWriteBatch};
use keel_common::{Block, BlockHash, Work};
use tracing::info;

use crate::block_record::{BlockPlacement, BlockRecord, BlockRecordPtr};

use super::ChainStore;

const DEFAULT_DATABASE_PATH: &str = "fjall-chain";
const DEFAULT_CLEAR_ON_START: bool = true;
const BLOCKS_KEYSPACE: &str = "blocks";
const BLOCK_HASHES_BY_HEIGHT_KEYSPACE: &str = "block-hashes-by-height";
const BLOCK_HEIGHTS_BY_HASH_KEYSPACE: &str = "block-heights-by-hash";
const CHAIN_WORK_BY_HEIGHT_KEYSPACE: &str = "chain-work-by-height";

/// Accepted chain persisted in fjall.
///
/// Each mutation is one committed write batch. The lock keeps readers from
/// interleaving their point lookups with a batch being applied.
pub struct FjallChainStore {
    database: Database,
    blocks: Keyspace,
    block_hashes_by_height: Keyspace,
    block_heights_by_hash: Keyspace,
    /// Cumulative work from genesis up to and including each height.
    chain_work_by_height: Keyspace,
    lock: RwLock<()>,
}

impl FjallChainStore {
    /// Open the database at `database-path`, seeding it with `genesis` if
    /// it is empty. An existing chain must start at the same genesis.
    pub fn new(config: Arc<Config>, genesis: Block) -> Result<Self> {
        let path =
            config.get_string("database-path").unwrap_or(DEFAULT_DATABASE_PATH.to_string());
        let clear = config.get_bool("clear-on-start").unwrap_or(DEFAULT_CLEAR_ON_START);
        let path = PathBuf::from(path);
        if clear && path.exists() {
            fs::remove_dir_all(&path)?;
        }

        let database = Database::builder(&path).open()?;
        let blocks = database.keyspace(BLOCKS_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let block_hashes_by_height = database.keyspace(
            BLOCK_HASHES_BY_HEIGHT_KEYSPACE,
            fjall::KeyspaceCreateOptions::default,
        )?;
        let block_heights_by_hash = database.keyspace(
            BLOCK_HEIGHTS_BY_HASH_KEYSPACE,
            fjall::KeyspaceCreateOptions::default,
        )?;
        let chain_work_by_height = database
            .keyspace(CHAIN_WORK_BY_HEIGHT_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;

        let store = Self {
            database,
            blocks,
            block_hashes_by_height,
            block_heights_by_hash,
            chain_work_by_height,
            lock: RwLock::new(()),
        };

        let genesis_hash = genesis.hash();
        match store.hash_at(0)? {
            None => {
                let mut batch = store.database.batch();
                store.insert(&mut batch, 0, &genesis, &genesis.work());
                batch.commit()?;
                info!(hash = %genesis_hash, "Seeded chain database with genesis");
            }
            Some(hash) if hash == genesis_hash => {
                info!(tip = ?store.read_tip()?, "Opened existing chain database");
            }
            Some(hash) => bail!("Chain database starts at {hash}, expected genesis {genesis_hash}"),
        }

        Ok(store)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.lock.read().map_err(|_| anyhow!("Chain store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        self.lock.write().map_err(|_| anyhow!("Chain store lock poisoned"))
    }

    fn insert(
        &self,
        batch: &mut OwnedWriteBatch,
        height: u64,
        block: &Block,
        chain_work: &Work,
    ) {
        let hash = block.hash();
        let encoded = minicbor::to_vec(block).expect("infallible");
        batch.insert(&self.blocks, *hash, encoded);
        batch.insert(&self.block_hashes_by_height, height.to_be_bytes(), *hash);
        batch.insert(&self.block_heights_by_hash, *hash, height.to_be_bytes());
        batch.insert(&self.chain_work_by_height, height.to_be_bytes(), chain_work.to_be_bytes());
    }

    fn chain_work_at(&self, height: u64) -> Result<Work> {
        let Some(bytes) = self.chain_work_by_height.get(height.to_be_bytes())? else {
            bail!("No chain work recorded at height {height}");
        };
        Ok(Work::from_be_bytes(&bytes))
    }

    fn hash_at(&self, height: u64) -> Result<Option<BlockHash>> {
        let Some(hash) = self.block_hashes_by_height.get(height.to_be_bytes())? else {
            return Ok(None);
        };
        Ok(Some(BlockHash::try_from(&hash[..])?))
    }

    fn block_by_hash(&self, hash: &BlockHash) -> Result<Block> {
        let Some(bytes) = self.blocks.get(hash.as_ref())? else {
            bail!("Block {hash} is indexed but not stored");
        };
        Ok(minicbor::decode(&bytes)?)
    }

    fn read_tip(&self) -> Result<Option<u64>> {
        let Some(res) = self.block_hashes_by_height.last_key_value() else {
            return Ok(None);
        };
        let key = res.key()?;
        Ok(Some(height_from_bytes(&key)?))
    }

    /// Hashes strictly above `from_height`, oldest first.
    fn hashes_above(&self, from_height: u64) -> Result<Vec<BlockHash>> {
        let start = from_height.saturating_add(1).to_be_bytes();
        let mut hashes = Vec::new();
        for res in self.block_hashes_by_height.range(start..) {
            let hash = res.value()?;
            hashes.push(BlockHash::try_from(&hash[..])?);
        }
        Ok(hashes)
    }

    /// Check that `blocks` form a chain hanging off the block at `height`.
    fn check_links(&self, height: u64, blocks: &[BlockRecordPtr]) -> Result<()> {
        let Some(mut expected) = self.hash_at(height)? else {
            bail!("No block at height {height}");
        };
        for block in blocks {
            if block.previous_hash() != expected {
                bail!(
                    "Block {} does not extend {expected} (parent {})",
                    block.hash(),
                    block.previous_hash()
                );
            }
            expected = block.hash();
        }
        Ok(())
    }
}

impl ChainStore for FjallChainStore {
    fn find_index(&self, hash: &BlockHash) -> Result<Option<u64>> {
        let _guard = self.read()?;
        let Some(height) = self.block_heights_by_hash.get(hash.as_ref())? else {
            return Ok(None);
        };
        Ok(Some(height_from_bytes(&height)?))
    }

    fn end_slice_difficulty(&self, from_height: u64) -> Result<Work> {
        let _guard = self.read()?;
        match self.read_tip()? {
            Some(tip) if from_height < tip => {
                Ok(self.chain_work_at(tip)?.saturating_sub(&self.chain_work_at(from_height)?))
            }
            _ => Ok(Work::zero()),
        }
    }

    fn end_slice(&self, from_height: u64) -> Result<Vec<BlockRecordPtr>> {
        let _guard = self.read()?;
        let mut records = Vec::new();
        for (offset, hash) in self.hashes_above(from_height)?.iter().enumerate() {
            let record = BlockRecord::shared(self.block_by_hash(hash)?);
            record.mark_processed();
            record.mark_verified();
            record.set_placement(BlockPlacement::MainChain {
                height: from_height + 1 + offset as u64,
            });
            records.push(record);
        }
        Ok(records)
    }

    fn add(&self, block: BlockRecordPtr) -> Result<()> {
        let _guard = self.write()?;
        let Some(tip) = self.read_tip()? else {
            bail!("Cannot append to an empty chain");
        };
        self.check_links(tip, std::slice::from_ref(&block))?;

        let chain_work = self.chain_work_at(tip)? + block.work().clone();
        let mut batch = self.database.batch();
        self.insert(&mut batch, tip + 1, block.block(), &chain_work);
        batch.commit()?;
        Ok(())
    }

    fn replace_tail(&self, from_height: u64, blocks: &[BlockRecordPtr]) -> Result<()> {
        let _guard = self.write()?;
        match self.read_tip()? {
            Some(tip) if from_height <= tip => {}
            tip => bail!("Cannot replace above height {from_height}, tip is {tip:?}"),
        }
        self.check_links(from_height, blocks)?;

        let incoming: HashSet<BlockHash> = blocks.iter().map(|block| block.hash()).collect();
        let new_tip = from_height + blocks.len() as u64;
        let mut batch = self.database.batch();
        for (offset, hash) in self.hashes_above(from_height)?.iter().enumerate() {
            // Heights up to the new tip are overwritten below
            let height = from_height + 1 + offset as u64;
            if height > new_tip {
                batch.remove(&self.block_hashes_by_height, height.to_be_bytes());
                batch.remove(&self.chain_work_by_height, height.to_be_bytes());
            }
            if !incoming.contains(hash) {
                batch.remove(&self.block_heights_by_hash, **hash);
                batch.remove(&self.blocks, **hash);
            }
        }

        let mut chain_work = self.chain_work_at(from_height)?;
        for (offset, block) in blocks.iter().enumerate() {
            chain_work += block.work().clone();
            self.insert(&mut batch, from_height + 1 + offset as u64, block.block(), &chain_work);
        }
        batch.commit()?;
        Ok(())
    }

    fn tip(&self) -> Result<Option<u64>> {
        let _guard = self.read()?;
        self.read_tip()
    }
}

fn height_from_bytes(bytes: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = bytes.try_into()?;
    Ok(u64::from_be_bytes(bytes))
}
