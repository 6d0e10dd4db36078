//! Persistence for bft-consensus
//!
//! Uses the sled embedded database. Blocks, parts and commits live in one
//! tree per kind, keyed by big-endian height so iteration follows the chain.
//! The latest chain state is a single bincode record.

mod block_store;
mod state_store;

pub use block_store::SledBlockStore;
pub use state_store::SledStateStore;

use std::path::Path;
use std::sync::Arc;

/// Both stores over one sled database
pub struct NodeStorage {
    db: sled::Db,
    pub blocks: Arc<SledBlockStore>,
    pub state: Arc<SledStateStore>,
}

impl NodeStorage {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let db = sled::open(&path)?;
        let blocks = Arc::new(SledBlockStore::from_db(&db)?);
        let state = Arc::new(SledStateStore::from_db(&db)?);

        tracing::info!(
            "Opened node storage at {:?} (block height {})",
            path.as_ref(),
            blocks.stored_height()
        );

        Ok(Self { db, blocks, state })
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> anyhow::Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

pub(crate) fn height_key(height: i64) -> [u8; 8] {
    (height as u64).to_be_bytes()
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(tree: &sled::Tree, key: &[u8]) -> anyhow::Result<Option<T>> {
    match tree.get(key)? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}
