//! Shared fixtures: deterministic keys, signed votes and an in-process
//! network of state machines driven by hand

use crate::config::ConsensusConfig;
use crate::consensus_state::{Collaborators, ConsensusState};
use crate::messages::{MsgInfo, StateMessage};
use crate::mock::{KvApp, ManualTicker, MemBlockStore, MemMempool, MemStateStore};
use crate::round_state::RoundStep;
use crate::state::State;
use crate::ticker::TimeoutInfo;
use crate::types::{BlockId, LocalSigner, PartSetHeader, ValidatorSet, Vote, VoteType};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const CHAIN_ID: &str = "test-chain";

/// `n` signers with fixed seeds
pub fn signers(n: usize) -> Vec<LocalSigner> {
    (0..n).map(|i| LocalSigner::from_seed([i as u8 + 1; 32])).collect()
}

pub fn validator_set(keys: &[LocalSigner], power: i64) -> ValidatorSet {
    ValidatorSet::new(keys.iter().map(|k| k.validator(power)).collect())
}

/// Vote signed by `signer`, bypassing its double-sign guard
pub fn signed_vote(
    signer: &LocalSigner,
    set: &ValidatorSet,
    height: i64,
    round: i64,
    vote_type: VoteType,
    block_id: BlockId,
) -> Vote {
    use crate::types::PrivValidator;
    let address = signer.address();
    let index = set.get_by_address(&address).map(|(i, _)| i).unwrap_or(0);
    let mut vote = Vote {
        validator_address: address,
        validator_index: index as u32,
        height,
        round,
        vote_type,
        block_id,
        signature: Vec::new(),
    };
    vote.signature = signer.sign_unchecked(&vote.sign_bytes(CHAIN_ID));
    vote
}

/// Block id whose hash bytes are all `tag`
pub fn block_id(tag: u8) -> BlockId {
    BlockId::new(
        vec![tag; 32],
        PartSetHeader {
            total: 1,
            hash: vec![tag; 32],
        },
    )
}

pub fn test_config(wal_dir: &Path) -> ConsensusConfig {
    ConsensusConfig::default()
        .chain_id(CHAIN_ID)
        .wal_dir(wal_dir)
        .timeouts(100, 50, 0)
        .block_part_size(256)
}

pub fn genesis_state(keys: &[LocalSigner]) -> State {
    State::genesis(CHAIN_ID, validator_set(keys, 10), Vec::new())
}

/// One validator with in-memory collaborators and a manual ticker
pub struct TestNode {
    pub name: String,
    pub cs: ConsensusState,
    pub ticker: Arc<ManualTicker>,
    pub app: Arc<KvApp>,
    pub block_store: Arc<MemBlockStore>,
    pub state_store: Arc<MemStateStore>,
    pub mempool: Arc<MemMempool>,
    pub signer: Arc<LocalSigner>,
    /// Every signer of the network, by node index
    pub keys: Arc<Vec<LocalSigner>>,
    pub genesis: State,
    pub config: ConsensusConfig,
}

impl TestNode {
    /// `n` validators of equal power. WALs go under `wal_root/node<i>` but
    /// are only opened by `start` or `open_wal`.
    pub fn network(n: usize, wal_root: Option<&Path>) -> Vec<TestNode> {
        let keys = Arc::new(signers(n));
        let genesis = genesis_state(&keys);
        (0..n)
            .map(|i| {
                let dir = match wal_root {
                    Some(root) => root.join(format!("node{}", i)),
                    None => std::env::temp_dir().join(format!("bft-unused-wal-{}", i)),
                };
                TestNode::new(i, keys.clone(), genesis.clone(), test_config(&dir))
            })
            .collect()
    }

    pub fn new(index: usize, keys: Arc<Vec<LocalSigner>>, genesis: State, config: ConsensusConfig) -> Self {
        let node = Self::with_stores(
            index,
            keys,
            genesis.clone(),
            config,
            Arc::new(MemBlockStore::new()),
            Arc::new(MemStateStore::new()),
            Arc::new(KvApp::new()),
        );
        node.cs.set_priv_validator(node.signer.clone());
        node
    }

    /// Node over existing stores, starting from `state`, without a signer
    pub fn with_stores(
        index: usize,
        keys: Arc<Vec<LocalSigner>>,
        state: State,
        config: ConsensusConfig,
        block_store: Arc<MemBlockStore>,
        state_store: Arc<MemStateStore>,
        app: Arc<KvApp>,
    ) -> Self {
        let ticker = Arc::new(ManualTicker::new());
        let mempool = Arc::new(MemMempool::new());
        let cs = ConsensusState::new(
            config.clone(),
            state.clone(),
            Collaborators {
                app: app.clone(),
                block_store: block_store.clone(),
                mempool: mempool.clone(),
                state_store: state_store.clone(),
                ticker: ticker.clone(),
            },
        );
        Self {
            name: format!("node{}", index),
            cs,
            ticker,
            app,
            block_store,
            state_store,
            mempool,
            signer: Arc::new(LocalSigner::from_seed([index as u8 + 1; 32])),
            keys,
            genesis: state,
            config,
        }
    }

    /// Fire the NewHeight timeout for the node's current height
    pub fn start_round0(&self) {
        let height = self.cs.get_round_state().height;
        self.cs
            .fire_timeout(TimeoutInfo::new(Duration::ZERO, height, 0, RoundStep::NewHeight));
    }

    /// Fire a timeout for `step` at the node's current height and round
    pub fn fire(&self, step: RoundStep) {
        let rs = self.cs.get_round_state();
        self.cs.fire_timeout(TimeoutInfo::new(Duration::ZERO, rs.height, rs.round, step));
    }

    /// Deliver a message as if it came from peer `from`
    pub fn deliver(&self, mi: &MsgInfo, from: &str) {
        match &mi.msg {
            StateMessage::Proposal(p) => self.cs.set_proposal(p.clone(), from),
            StateMessage::BlockPart { height, round, part } => {
                self.cs.add_proposal_block_part(*height, *round, part.clone(), from)
            }
            StateMessage::Vote(v) => self.cs.add_vote(v.clone(), from),
        }
    }

    /// (height, round, step, locked block hash)
    pub fn hrs_locked(&self) -> (i64, i64, RoundStep, Option<Vec<u8>>) {
        let rs = self.cs.get_round_state();
        (rs.height, rs.round, rs.step, rs.locked_block_hash())
    }
}

/// Process queues on every online node and relay their own messages to the
/// other online nodes until nothing moves. `relay` can drop messages.
pub fn run_network_filtered(nodes: &[TestNode], offline: &[usize], relay: impl Fn(&MsgInfo) -> bool) {
    loop {
        let mut progressed = false;
        for (i, node) in nodes.iter().enumerate() {
            if offline.contains(&i) {
                continue;
            }
            for mi in node.cs.process_pending() {
                progressed = true;
                if !relay(&mi) {
                    continue;
                }
                for (j, other) in nodes.iter().enumerate() {
                    if j != i && !offline.contains(&j) {
                        other.deliver(&mi, &node.name);
                    }
                }
            }
        }
        if !progressed {
            return;
        }
    }
}

pub fn run_network(nodes: &[TestNode], offline: &[usize]) {
    run_network_filtered(nodes, offline, |_| true)
}

/// Index of the node proposing at round 0 of the genesis height
pub fn proposer_index(nodes: &[TestNode]) -> usize {
    let address = nodes[0]
        .genesis
        .validators
        .proposer()
        .map(|p| p.address.clone())
        .unwrap_or_default();
    nodes
        .iter()
        .position(|n| {
            use crate::types::PrivValidator;
            n.signer.address() == address
        })
        .unwrap_or(0)
}

pub fn is_precommit(mi: &MsgInfo) -> bool {
    matches!(&mi.msg, StateMessage::Vote(v) if v.vote_type == VoteType::Precommit)
}
