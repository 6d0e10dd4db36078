//! In-memory collaborators: application, mempool, stores and a manual ticker.
//! Used by tests and by the devnet node.

use crate::error::StoreError;
use crate::state::{AppInfo, Application, State, StateStore};
use crate::store::{BlockStore, Mempool};
use crate::ticker::{TimeoutInfo, TimeoutTicker};
use crate::types::{Block, BlockId, BlockMeta, Commit, Part, PartSet, Tx};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};

/// Key/value application. Transactions are `key=value`; anything else is
/// stored under its own bytes. The app hash chains every executed block.
#[derive(Default)]
pub struct KvApp {
    inner: Mutex<KvInner>,
}

#[derive(Default)]
struct KvInner {
    store: BTreeMap<Vec<u8>, Vec<u8>>,
    height: i64,
    app_hash: Vec<u8>,
}

impl KvApp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.lock().store.get(key).cloned()
    }
}

impl Application for KvApp {
    fn execute_block(&self, block: &Block) -> Result<Vec<u8>, String> {
        let mut inner = self.inner.lock();
        if block.height() != inner.height + 1 {
            return Err(format!("expected block {}, got {}", inner.height + 1, block.height()));
        }

        let mut hasher = blake3::Hasher::new();
        hasher.update(&inner.app_hash);
        hasher.update(&block.height().to_le_bytes());
        for tx in &block.txs {
            hasher.update(tx);
            match tx.iter().position(|b| *b == b'=') {
                Some(i) => inner.store.insert(tx[..i].to_vec(), tx[i + 1..].to_vec()),
                None => inner.store.insert(tx.clone(), tx.clone()),
            };
        }

        inner.height = block.height();
        inner.app_hash = hasher.finalize().as_bytes().to_vec();
        tracing::debug!("KvApp executed block {} with {} txs", inner.height, block.txs.len());
        Ok(inner.app_hash.clone())
    }

    fn info(&self) -> AppInfo {
        let inner = self.inner.lock();
        AppInfo {
            last_block_height: inner.height,
            last_app_hash: inner.app_hash.clone(),
        }
    }
}

/// FIFO mempool. `reap` waits while the pool is locked for an update.
#[derive(Default)]
pub struct MemMempool {
    inner: Mutex<MempoolInner>,
    unlocked: Condvar,
}

#[derive(Default)]
struct MempoolInner {
    txs: Vec<Tx>,
    locked: bool,
}

impl MemMempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tx(&self, tx: Tx) {
        self.inner.lock().txs.push(tx);
    }

    pub fn size(&self) -> usize {
        self.inner.lock().txs.len()
    }
}

impl Mempool for MemMempool {
    fn reap(&self, max: usize) -> Vec<Tx> {
        let mut inner = self.inner.lock();
        while inner.locked {
            self.unlocked.wait(&mut inner);
        }
        inner.txs.iter().take(max).cloned().collect()
    }

    fn lock(&self) {
        self.inner.lock().locked = true;
    }

    fn unlock(&self) {
        self.inner.lock().locked = false;
        self.unlocked.notify_all();
    }

    fn update(&self, height: i64, txs: &[Tx]) {
        let mut inner = self.inner.lock();
        let before = inner.txs.len();
        inner.txs.retain(|tx| !txs.contains(tx));
        tracing::debug!("Mempool update at height {}: removed {} txs", height, before - inner.txs.len());
    }
}

struct StoredBlock {
    block: Block,
    meta: BlockMeta,
    parts: Vec<Part>,
    seen_commit: Commit,
}

/// Block store held in memory
#[derive(Default)]
pub struct MemBlockStore {
    inner: Mutex<MemBlockStoreInner>,
}

#[derive(Default)]
struct MemBlockStoreInner {
    blocks: BTreeMap<i64, StoredBlock>,
    block_commits: HashMap<i64, Commit>,
}

impl MemBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemBlockStore {
    fn height(&self) -> i64 {
        self.inner.lock().blocks.keys().next_back().copied().unwrap_or(0)
    }

    fn load_block(&self, height: i64) -> Option<Block> {
        self.inner.lock().blocks.get(&height).map(|b| b.block.clone())
    }

    fn load_block_meta(&self, height: i64) -> Option<BlockMeta> {
        self.inner.lock().blocks.get(&height).map(|b| b.meta.clone())
    }

    fn load_block_part(&self, height: i64, index: usize) -> Option<Part> {
        self.inner
            .lock()
            .blocks
            .get(&height)
            .and_then(|b| b.parts.get(index).cloned())
    }

    fn load_block_commit(&self, height: i64) -> Option<Commit> {
        self.inner.lock().block_commits.get(&height).cloned()
    }

    fn load_seen_commit(&self, height: i64) -> Option<Commit> {
        self.inner.lock().blocks.get(&height).map(|b| b.seen_commit.clone())
    }

    fn save_block(&self, block: &Block, parts: &PartSet, seen_commit: &Commit) -> Result<(), StoreError> {
        let height = block.height();
        let expected = self.height() + 1;
        if height != expected {
            return Err(StoreError(format!("can only save contiguous blocks: wanted {}, got {}", expected, height)));
        }
        if !parts.is_complete() {
            return Err(StoreError("can only save complete part sets".to_string()));
        }

        let parts_vec: Vec<Part> = (0..parts.total() as usize).filter_map(|i| parts.get_part(i)).collect();
        let meta = BlockMeta {
            block_id: BlockId::new(block.hash(), parts.header()),
            header: block.header.clone(),
        };

        let mut inner = self.inner.lock();
        if height > 1 {
            inner.block_commits.insert(height - 1, block.last_commit.clone());
        }
        inner.blocks.insert(
            height,
            StoredBlock {
                block: block.clone(),
                meta,
                parts: parts_vec,
                seen_commit: seen_commit.clone(),
            },
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct MemStateStore {
    state: Mutex<Option<State>>,
}

impl MemStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemStateStore {
    fn save_state(&self, state: &State) -> Result<(), StoreError> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }

    fn load_state(&self) -> Result<Option<State>, StoreError> {
        Ok(self.state.lock().clone())
    }
}

/// Ticker that never fires by itself. Scheduled timeouts are recorded and
/// delivered only through `fire`.
pub struct ManualTicker {
    scheduled: Mutex<Vec<TimeoutInfo>>,
    tock_tx: Sender<TimeoutInfo>,
    tock_rx: Receiver<TimeoutInfo>,
}

impl ManualTicker {
    pub fn new() -> Self {
        let (tock_tx, tock_rx) = unbounded();
        Self {
            scheduled: Mutex::new(Vec::new()),
            tock_tx,
            tock_rx,
        }
    }

    pub fn scheduled(&self) -> Vec<TimeoutInfo> {
        self.scheduled.lock().clone()
    }

    pub fn last_scheduled(&self) -> Option<TimeoutInfo> {
        self.scheduled.lock().last().cloned()
    }

    /// Deliver `ti` on the tock channel
    pub fn fire(&self, ti: TimeoutInfo) {
        let _ = self.tock_tx.send(ti);
    }
}

impl Default for ManualTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutTicker for ManualTicker {
    fn start(&self) {}

    fn stop(&self) {}

    fn chan(&self) -> Receiver<TimeoutInfo> {
        self.tock_rx.clone()
    }

    fn schedule_timeout(&self, ti: TimeoutInfo) {
        self.scheduled.lock().push(ti);
    }
}
