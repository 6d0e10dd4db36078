use crate::{decode, height_key};
use bft_consensus::{Block, BlockId, BlockMeta, BlockStore, Commit, Part, PartSet, StoreError};
use parking_lot::Mutex;
use serde::Serialize;
use sled::{Db, Tree};
use std::sync::atomic::{AtomicI64, Ordering};

/// Block store on sled trees
pub struct SledBlockStore {
    blocks: Tree,
    metas: Tree,
    /// Keyed by height then part index
    parts: Tree,
    /// Commits included in the next block
    block_commits: Tree,
    /// Commits seen locally when finalizing
    seen_commits: Tree,
    height: AtomicI64,
    write_lock: Mutex<()>,
}

impl SledBlockStore {
    pub fn from_db(db: &Db) -> anyhow::Result<Self> {
        let blocks = db.open_tree("blocks")?;
        let height = match blocks.last()? {
            Some((key, _)) => {
                let arr: [u8; 8] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("Invalid block key length"))?;
                u64::from_be_bytes(arr) as i64
            }
            None => 0,
        };

        Ok(Self {
            blocks,
            metas: db.open_tree("block_metas")?,
            parts: db.open_tree("block_parts")?,
            block_commits: db.open_tree("block_commits")?,
            seen_commits: db.open_tree("seen_commits")?,
            height: AtomicI64::new(height),
            write_lock: Mutex::new(()),
        })
    }

    /// Open a standalone store at the given path
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let db = sled::open(&path)?;
        Self::from_db(&db)
    }

    pub fn stored_height(&self) -> i64 {
        self.height.load(Ordering::Acquire)
    }

    fn load<T: serde::de::DeserializeOwned>(&self, tree: &Tree, key: &[u8], what: &str) -> Option<T> {
        match decode(tree, key) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Failed to load {}: {}", what, e);
                None
            }
        }
    }

    fn try_save_block(&self, block: &Block, parts: &PartSet, seen_commit: &Commit) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock();
        let height = block.height();
        let expected = self.stored_height() + 1;
        if height != expected {
            anyhow::bail!("can only save contiguous blocks: wanted {}, got {}", expected, height);
        }
        if !parts.is_complete() {
            anyhow::bail!("can only save complete part sets");
        }

        let key = height_key(height);
        for index in 0..parts.total() {
            let part = parts
                .get_part(index as usize)
                .ok_or_else(|| anyhow::anyhow!("missing part {} of complete set", index))?;
            let mut part_key = key.to_vec();
            part_key.extend_from_slice(&index.to_be_bytes());
            self.parts.insert(part_key, encode(&part)?)?;
        }
        if height > 1 {
            self.block_commits
                .insert(height_key(height - 1), encode(&block.last_commit)?)?;
        }
        self.seen_commits.insert(key, encode(seen_commit)?)?;

        let meta = BlockMeta {
            block_id: BlockId::new(block.hash(), parts.header()),
            header: block.header.clone(),
        };
        self.metas.insert(key, encode(&meta)?)?;

        // the blocks tree decides the height on reopen, so it goes last
        self.blocks.insert(key, encode(block)?)?;
        self.blocks.flush()?;

        self.height.store(height, Ordering::Release);
        tracing::debug!("Saved block {} with {} parts", height, parts.total());
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

impl BlockStore for SledBlockStore {
    fn height(&self) -> i64 {
        self.stored_height()
    }

    fn load_block(&self, height: i64) -> Option<Block> {
        self.load(&self.blocks, &height_key(height), "block")
    }

    fn load_block_meta(&self, height: i64) -> Option<BlockMeta> {
        self.load(&self.metas, &height_key(height), "block meta")
    }

    fn load_block_part(&self, height: i64, index: usize) -> Option<Part> {
        let mut key = height_key(height).to_vec();
        key.extend_from_slice(&(index as u32).to_be_bytes());
        self.load(&self.parts, &key, "block part")
    }

    fn load_block_commit(&self, height: i64) -> Option<Commit> {
        self.load(&self.block_commits, &height_key(height), "block commit")
    }

    fn load_seen_commit(&self, height: i64) -> Option<Commit> {
        self.load(&self.seen_commits, &height_key(height), "seen commit")
    }

    fn save_block(&self, block: &Block, parts: &PartSet, seen_commit: &Commit) -> Result<(), StoreError> {
        self.try_save_block(block, parts, seen_commit)
            .map_err(|e| StoreError(e.to_string()))
    }
}
