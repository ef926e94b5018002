use std::sync::Arc;

use anyhow::{bail, Result};
use config::Config;
use keel_common::{Block, BlockHash, Work};

use crate::block_record::BlockRecordPtr;

pub mod fjall;
pub mod memory;

const DEFAULT_STORE: &str = "memory";
const DEFAULT_GENESIS_TIMESTAMP: i64 = 1_231_006_505;
const DEFAULT_GENESIS_BITS: i64 = 0x207f_ffff;
const DEFAULT_GENESIS_NONCE: i64 = 2;

/// The accepted chain, addressed by height from genesis at 0.
///
/// Every mutation is atomic: a concurrent reader sees the chain either
/// before or after it, never part way through.
pub trait ChainStore: Send + Sync {
    /// Height of the block with this hash, if it is in the chain.
    fn find_index(&self, hash: &BlockHash) -> Result<Option<u64>>;

    /// Cumulative work of the blocks strictly above `from_height`.
    fn end_slice_difficulty(&self, from_height: u64) -> Result<Work>;

    /// Blocks strictly above `from_height`, oldest first.
    fn end_slice(&self, from_height: u64) -> Result<Vec<BlockRecordPtr>>;

    /// Append a block whose parent is the current tip.
    fn add(&self, block: BlockRecordPtr) -> Result<()>;

    /// Drop everything strictly above `from_height` and append `blocks`,
    /// as a single step.
    fn replace_tail(&self, from_height: u64, blocks: &[BlockRecordPtr]) -> Result<()>;

    /// Height of the tip, `None` if the chain is empty.
    fn tip(&self) -> Result<Option<u64>>;
}

/// Build the genesis block described by the `genesis-*` keys.
pub fn genesis_from_config(config: &Config) -> Block {
    let timestamp = config.get_int("genesis-timestamp").unwrap_or(DEFAULT_GENESIS_TIMESTAMP);
    let bits = config.get_int("genesis-bits").unwrap_or(DEFAULT_GENESIS_BITS);
    let nonce = config.get_int("genesis-nonce").unwrap_or(DEFAULT_GENESIS_NONCE);
    Block::genesis(timestamp as u32, bits as u32, nonce as u32)
}

/// Open the store selected by the `store` key, seeded with `genesis`.
pub fn from_config(config: Arc<Config>, genesis: Block) -> Result<Arc<dyn ChainStore>> {
    let store = config.get_string("store").unwrap_or(DEFAULT_STORE.to_string());
    match store.as_str() {
        "memory" => Ok(Arc::new(memory::MemoryChainStore::new(genesis))),
        "fjall" => Ok(Arc::new(fjall::FjallChainStore::new(config, genesis)?)),
        other => bail!("Unknown chain store '{other}'"),
    }
}
