// Keel common library - main library exports

pub mod block;
pub mod hash;
pub mod messages;

// Flattened re-exports
pub use self::block::{Block, BlockHeader, Work};
pub use self::hash::{BlockHash, Hash, MerkleRoot};
