use crate::decode;
use bft_consensus::{State, StateStore, StoreError};
use sled::{Db, Tree};

const STATE_KEY: &[u8] = b"state";

/// Latest chain state, overwritten after every block
pub struct SledStateStore {
    tree: Tree,
}

impl SledStateStore {
    pub fn from_db(db: &Db) -> anyhow::Result<Self> {
        Ok(Self {
            tree: db.open_tree("state")?,
        })
    }

    pub fn open<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let db = sled::open(&path)?;
        Self::from_db(&db)
    }

    fn try_save(&self, state: &State) -> anyhow::Result<()> {
        let bytes = bincode::serialize(state)?;
        self.tree.insert(STATE_KEY, bytes)?;
        self.tree.flush()?;
        Ok(())
    }
}

impl StateStore for SledStateStore {
    fn save_state(&self, state: &State) -> Result<(), StoreError> {
        self.try_save(state).map_err(|e| StoreError(e.to_string()))
    }

    fn load_state(&self) -> Result<Option<State>, StoreError> {
        decode(&self.tree, STATE_KEY).map_err(|e| StoreError(e.to_string()))
    }
}
