//! Block storage and mempool interfaces consumed by consensus

use crate::error::StoreError;
use crate::types::{Block, BlockMeta, Commit, Part, PartSet, Tx};

/// Append-only block storage, indexed by height
pub trait BlockStore: Send + Sync {
    /// Height of the last saved block, 0 when empty
    fn height(&self) -> i64;

    fn load_block(&self, height: i64) -> Option<Block>;

    fn load_block_meta(&self, height: i64) -> Option<BlockMeta>;

    fn load_block_part(&self, height: i64, index: usize) -> Option<Part>;

    /// Commit for `height` as included in block `height + 1`
    fn load_block_commit(&self, height: i64) -> Option<Commit>;

    /// Commit we saw locally when finalizing `height`
    fn load_seen_commit(&self, height: i64) -> Option<Commit>;

    /// Save a block, its parts and the commit that justified it.
    /// The block's last commit becomes the block commit for the previous height.
    fn save_block(&self, block: &Block, parts: &PartSet, seen_commit: &Commit) -> Result<(), StoreError>;
}

/// Transaction pool feeding proposals
pub trait Mempool: Send + Sync {
    /// Up to `max` transactions for a new block
    fn reap(&self, max: usize) -> Vec<Tx>;

    /// Block reaping while a committed block is applied
    fn lock(&self);

    fn unlock(&self);

    /// Drop transactions committed at `height`
    fn update(&self, height: i64, txs: &[Tx]);
}
