//! Chain state: the result of applying every committed block so far

use crate::error::{StateError, StoreError};
use crate::store::Mempool;
use crate::types::block::txs_hash;
use crate::types::{Block, BlockId, PartSetHeader, ValidatorSet};
use serde::{Deserialize, Serialize};

/// What the application reports about itself at startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppInfo {
    pub last_block_height: i64,
    pub last_app_hash: Vec<u8>,
}

/// Application executing committed blocks
pub trait Application: Send + Sync {
    /// Execute and commit every tx of `block`, returning the new app hash
    fn execute_block(&self, block: &Block) -> Result<Vec<u8>, String>;

    fn info(&self) -> AppInfo;
}

/// Persistence for the latest chain state
pub trait StateStore: Send + Sync {
    fn save_state(&self, state: &State) -> Result<(), StoreError>;

    fn load_state(&self) -> Result<Option<State>, StoreError>;
}

/// State as of the last committed block.
/// Mutate only a copy while staging a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub chain_id: String,
    pub last_block_height: i64,
    pub last_block_id: BlockId,
    /// Unix millis of the last block
    pub last_block_time: i64,
    /// Validators for the next block
    pub validators: ValidatorSet,
    /// Validators that signed the last block
    pub last_validators: ValidatorSet,
    /// App hash after the last block
    pub app_hash: Vec<u8>,
}

impl State {
    /// State before the first block
    pub fn genesis(chain_id: &str, validators: ValidatorSet, app_hash: Vec<u8>) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            last_block_height: 0,
            last_block_id: BlockId::nil(),
            last_block_time: 0,
            validators,
            last_validators: ValidatorSet::new(Vec::new()),
            app_hash,
        }
    }

    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn last_block_height(&self) -> i64 {
        self.last_block_height
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// Check `block` can be the next block on top of this state
    pub fn validate_block(&self, block: &Block) -> Result<(), StateError> {
        let header = &block.header;
        if header.chain_id != self.chain_id {
            return Err(StateError::WrongChainId {
                expected: self.chain_id.clone(),
                got: header.chain_id.clone(),
            });
        }
        if header.height != self.last_block_height + 1 {
            return Err(StateError::WrongHeight {
                expected: self.last_block_height + 1,
                got: header.height,
            });
        }
        if header.last_block_id != self.last_block_id {
            return Err(StateError::WrongLastBlockId);
        }
        if header.num_txs != block.txs.len() as u64 || header.data_hash != txs_hash(&block.txs) {
            return Err(StateError::WrongData);
        }
        if header.last_commit_hash != block.last_commit.hash() {
            return Err(StateError::WrongLastCommitHash);
        }

        if header.height == 1 {
            if !block.last_commit.is_empty() {
                return Err(StateError::InvalidCommit("block at height 1 has last commit".to_string()));
            }
        } else {
            if block.last_commit.precommits.len() != self.last_validators.size() {
                return Err(StateError::InvalidCommit(format!(
                    "wrong size: expected {}, got {}",
                    self.last_validators.size(),
                    block.last_commit.precommits.len()
                )));
            }
            self.last_validators.verify_commit(
                &self.chain_id,
                &self.last_block_id,
                header.height - 1,
                &block.last_commit,
            )?;
        }

        if header.validators_hash != self.validators.hash() {
            return Err(StateError::WrongValidatorsHash);
        }
        if header.app_hash != self.app_hash {
            return Err(StateError::WrongAppHash);
        }
        Ok(())
    }

    /// Validate and execute `block`, update the mempool and advance the state
    pub fn apply_block(
        &mut self,
        app: &dyn Application,
        mempool: &dyn Mempool,
        block: &Block,
        parts_header: PartSetHeader,
    ) -> Result<(), StateError> {
        self.validate_block(block)?;

        let app_hash = app.execute_block(block).map_err(StateError::App)?;

        mempool.lock();
        mempool.update(block.height(), &block.txs);
        mempool.unlock();

        self.set_block_and_validators(block, parts_header, app_hash);
        Ok(())
    }

    /// Advance past `block` without executing it
    pub fn set_block_and_validators(&mut self, block: &Block, parts_header: PartSetHeader, app_hash: Vec<u8>) {
        self.last_block_height = block.height();
        self.last_block_id = BlockId::new(block.hash(), parts_header);
        self.last_block_time = block.header.time;
        self.last_validators = self.validators.clone();
        self.validators.increment_accum(1);
        self.app_hash = app_hash;
    }

    pub fn save(&self, store: &dyn StateStore) -> Result<(), StoreError> {
        store.save_state(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{KvApp, MemMempool};
    use crate::tests::support::{signers, validator_set, CHAIN_ID};
    use crate::types::Commit;

    fn genesis() -> State {
        let keys = signers(4);
        State::genesis(CHAIN_ID, validator_set(&keys, 10), Vec::new())
    }

    fn first_block(state: &State, txs: Vec<Vec<u8>>) -> Block {
        Block::make(
            CHAIN_ID,
            1,
            txs,
            Commit::default(),
            BlockId::nil(),
            state.validators.hash(),
            state.app_hash.clone(),
            state.validators.proposer().unwrap().address.clone(),
        )
    }

    #[test]
    fn test_validate_first_block() {
        let state = genesis();
        let block = first_block(&state, vec![b"tx".to_vec()]);
        assert!(state.validate_block(&block).is_ok());
    }

    #[test]
    fn test_validate_rejects_wrong_height_and_app_hash() {
        let state = genesis();
        let mut block = first_block(&state, vec![]);
        block.header.height = 2;
        assert!(matches!(state.validate_block(&block), Err(StateError::WrongHeight { .. })));

        let mut block = first_block(&state, vec![]);
        block.header.app_hash = vec![1];
        assert_eq!(state.validate_block(&block), Err(StateError::WrongAppHash));
    }

    #[test]
    fn test_validate_rejects_tampered_txs() {
        let state = genesis();
        let mut block = first_block(&state, vec![b"a".to_vec()]);
        block.txs.push(b"b".to_vec());
        assert_eq!(state.validate_block(&block), Err(StateError::WrongData));
    }

    #[test]
    fn test_apply_block_advances_state() {
        let mut state = genesis();
        let app = KvApp::new();
        let mempool = MemMempool::new();
        mempool.add_tx(b"k=v".to_vec());
        let block = first_block(&state, mempool.reap(10));
        let parts = block.make_part_set(1024);

        let proposer_before = state.validators.proposer().unwrap().address.clone();
        state.apply_block(&app, &mempool, &block, parts.header()).unwrap();

        assert_eq!(state.last_block_height, 1);
        assert_eq!(state.last_block_id.hash, block.hash());
        assert_eq!(state.app_hash, app.info().last_app_hash);
        assert_eq!(mempool.size(), 0);
        assert_ne!(state.validators.proposer().unwrap().address, proposer_before);
        assert_eq!(state.last_validators.hash(), state.validators.hash());
    }
}
