//! Crash recovery
//!
//! `catchup_replay` re-feeds the WAL tail of the current height through the
//! live handlers. `Handshaker` reconciles the block store, the saved chain
//! state and the application before consensus starts.

use crate::consensus_state::ConsensusState;
use crate::error::{HandshakeError, StateError, WalError};
use crate::state::{Application, State, StateStore};
use crate::store::{BlockStore, Mempool};
use crate::types::Block;
use crate::wal::{self, WalMessage};
use std::sync::Arc;

impl ConsensusState {
    /// Replay every WAL record written at `height`.
    /// Self messages produced during replay are queued as usual.
    pub fn catchup_replay(&self, height: i64) -> Result<(), WalError> {
        let mut m = self.machine();
        let path = match m.wal.as_ref() {
            Some(wal) => wal.path().to_path_buf(),
            None => return Ok(()),
        };

        if wal::contains_height(&path, height + 1)? {
            return Err(WalError::UnexpectedHeight(height + 1));
        }
        let lines = wal::lines_after_height(&path, height)?.ok_or(WalError::MissingHeight(height))?;

        tracing::info!("Catchup by replaying consensus messages at height {}", height);
        m.replay_mode = true;
        let mut result = Ok(());
        let mut replayed = 0usize;
        for line in &lines {
            let record = match wal::decode_line(line) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };
            match record.msg {
                // step records are reproduced by the transitions themselves
                WalMessage::RoundState(_) => {}
                WalMessage::MsgInfo(mi) => {
                    m.handle_msg(mi);
                    replayed += 1;
                }
                WalMessage::Timeout(ti) => {
                    m.handle_timeout(ti);
                    replayed += 1;
                }
            }
        }
        m.replay_mode = false;

        tracing::info!("Replay: done after {} records. Current: {}", replayed, m.rs.string_short());
        result
    }
}

/// Brings the application and the saved state level with the block store
pub struct Handshaker {
    state: State,
    state_store: Arc<dyn StateStore>,
    block_store: Arc<dyn BlockStore>,
    app: Arc<dyn Application>,
    mempool: Arc<dyn Mempool>,
    blocks_replayed: usize,
}

impl Handshaker {
    pub fn new(
        state: State,
        state_store: Arc<dyn StateStore>,
        block_store: Arc<dyn BlockStore>,
        app: Arc<dyn Application>,
        mempool: Arc<dyn Mempool>,
    ) -> Self {
        Self {
            state,
            state_store,
            block_store,
            app,
            mempool,
            blocks_replayed: 0,
        }
    }

    /// Blocks executed against the application by the last handshake
    pub fn blocks_replayed(&self) -> usize {
        self.blocks_replayed
    }

    /// Replay whatever the application or the state is missing and return
    /// the state consensus should start from
    pub fn handshake(&mut self) -> Result<State, HandshakeError> {
        let info = self.app.info();
        let app_height = info.last_block_height;
        let store_height = self.block_store.height();
        let state_height = self.state.last_block_height;

        tracing::info!(
            "Handshake: app height {}, store height {}, state height {}",
            app_height,
            store_height,
            state_height
        );

        if store_height == 0 {
            self.check_app_hash(&info.last_app_hash)?;
            return Ok(self.state.clone());
        }
        if store_height < app_height {
            return Err(HandshakeError::AppAhead {
                store: store_height,
                app: app_height,
            });
        }
        if store_height < state_height || store_height > state_height + 1 {
            return Err(HandshakeError::StateMismatch {
                store: store_height,
                state: state_height,
            });
        }

        if store_height == state_height {
            // state is saved; only the app may be behind
            if app_height < store_height {
                let app_hash = self.replay_on_app(app_height + 1, store_height)?;
                self.check_app_hash(&app_hash)?;
            } else {
                self.check_app_hash(&info.last_app_hash)?;
            }
            return Ok(self.state.clone());
        }

        // block saved, state not yet
        if app_height < state_height {
            let app_hash = self.replay_on_app(app_height + 1, state_height)?;
            self.check_app_hash(&app_hash)?;
            self.apply_stored_block(store_height)?;
        } else if app_height == state_height {
            tracing::info!("Replay last block using real app");
            self.apply_stored_block(store_height)?;
        } else {
            // the app executed the block, the state missed it
            tracing::info!("Replay last block with the app hash reported by the app");
            let (block, parts_header) = self.stored_block(store_height)?;
            self.state
                .set_block_and_validators(&block, parts_header, info.last_app_hash.clone());
            self.state.save(self.state_store.as_ref()).map_err(StateError::from)?;
        }
        Ok(self.state.clone())
    }

    fn stored_block(&self, height: i64) -> Result<(Block, crate::types::PartSetHeader), HandshakeError> {
        let block = self
            .block_store
            .load_block(height)
            .ok_or(HandshakeError::MissingBlock(height))?;
        let meta = self
            .block_store
            .load_block_meta(height)
            .ok_or(HandshakeError::MissingBlock(height))?;
        Ok((block, meta.block_id.parts_header))
    }

    /// Execute blocks `from..=to` on the app alone, returning its final hash
    fn replay_on_app(&mut self, from: i64, to: i64) -> Result<Vec<u8>, HandshakeError> {
        let mut app_hash = self.app.info().last_app_hash;
        for height in from..=to {
            tracing::info!("Applying block {} to the app", height);
            let block = self
                .block_store
                .load_block(height)
                .ok_or(HandshakeError::MissingBlock(height))?;
            app_hash = self.app.execute_block(&block).map_err(StateError::App)?;
            self.blocks_replayed += 1;
        }
        Ok(app_hash)
    }

    fn apply_stored_block(&mut self, height: i64) -> Result<(), HandshakeError> {
        let (block, parts_header) = self.stored_block(height)?;
        self.state
            .apply_block(self.app.as_ref(), self.mempool.as_ref(), &block, parts_header)?;
        self.blocks_replayed += 1;
        self.state.save(self.state_store.as_ref()).map_err(StateError::from)?;
        Ok(())
    }

    fn check_app_hash(&self, app_hash: &[u8]) -> Result<(), HandshakeError> {
        if self.state.app_hash != app_hash {
            return Err(HandshakeError::AppHashMismatch {
                height: self.state.last_block_height,
            });
        }
        Ok(())
    }
}
