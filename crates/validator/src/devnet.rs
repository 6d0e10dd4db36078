//! In-process devnet
//!
//! Every validator gets its own sled database, WAL and reactor. Peers are
//! channel-backed: a send lands in the remote node's bounded inbox, which a
//! task feeds into that node's reactor. Links never block; when an inbox is
//! full the message is dropped and gossip sends it again on a later pass.

use crate::config::NodeConfig;
use bft_consensus::mock::{KvApp, MemMempool};
use bft_consensus::{
    Collaborators, ConsensusReactor, ConsensusState, Handshaker, LocalSigner, Peer, State, StateStore,
    ThreadTicker, ValidatorSet,
};
use bft_store::NodeStorage;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

struct Envelope {
    from: String,
    channel: u8,
    bytes: Vec<u8>,
}

/// Outbound side of a link to another devnet node
struct ChannelPeer {
    /// Remote node name
    key: String,
    /// Local node name, as the remote sees us
    from: String,
    inbox: mpsc::Sender<Envelope>,
    stopped: AtomicBool,
}

impl Peer for ChannelPeer {
    fn key(&self) -> &str {
        &self.key
    }

    fn send(&self, channel: u8, msg: Vec<u8>) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        let envelope = Envelope {
            from: self.from.clone(),
            channel,
            bytes: msg,
        };
        match self.inbox.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Link {} -> {} full, dropped message on channel {:#04x}", self.from, self.key, channel);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn try_send(&self, channel: u8, msg: Vec<u8>) -> bool {
        self.send(channel, msg)
    }

    fn stop_for_error(&self, reason: &str) {
        tracing::warn!("Stopping link {} -> {}: {}", self.from, self.key, reason);
        self.stopped.store(true, Ordering::Release);
    }
}

/// Deterministic devnet key for validator `index`
pub fn devnet_signer(index: usize) -> LocalSigner {
    LocalSigner::from_seed([index as u8 + 1; 32])
}

pub fn genesis_state(config: &NodeConfig) -> State {
    let validators = (0..config.validators)
        .map(|i| devnet_signer(i).validator(config.voting_power))
        .collect();
    State::genesis(&config.consensus.chain_id, ValidatorSet::new(validators), Vec::new())
}

/// One running validator
pub struct Node {
    pub name: String,
    pub reactor: ConsensusReactor,
    pub mempool: Arc<MemMempool>,
    storage: NodeStorage,
    inbox: mpsc::Sender<Envelope>,
    inbox_task: JoinHandle<()>,
}

impl Node {
    /// Open storage under `data_dir/node<index>`, reconcile it with a fresh
    /// app and start consensus
    pub fn start(index: usize, config: &NodeConfig, genesis: &State, data_dir: &Path) -> anyhow::Result<Self> {
        let name = format!("node{}", index);
        let home = data_dir.join(&name);
        let storage = NodeStorage::open(home.join("db"))?;

        let state = match storage.state.load_state()? {
            Some(state) => state,
            None => genesis.clone(),
        };

        // the kv app keeps nothing on disk, so the handshake replays the chain into it
        let app = Arc::new(KvApp::new());
        let mempool = Arc::new(MemMempool::new());
        let mut handshaker = Handshaker::new(
            state,
            storage.state.clone(),
            storage.blocks.clone(),
            app.clone(),
            mempool.clone(),
        );
        let state = handshaker.handshake()?;
        tracing::info!(
            "{}: handshake done at height {}, replayed {} blocks",
            name,
            state.last_block_height,
            handshaker.blocks_replayed()
        );

        let cs = ConsensusState::new(
            config.consensus.clone().wal_dir(home.join("cs.wal")),
            state,
            Collaborators {
                app,
                block_store: storage.blocks.clone(),
                mempool: mempool.clone(),
                state_store: storage.state.clone(),
                ticker: Arc::new(ThreadTicker::new()),
            },
        );
        cs.set_priv_validator(Arc::new(devnet_signer(index)));

        let reactor = ConsensusReactor::new(cs, false);
        reactor.start()?;

        let (inbox, mut rx) = mpsc::channel::<Envelope>(config.consensus.msg_queue_size.max(1));
        let inbox_reactor = reactor.clone();
        let inbox_task = tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                // peer messages may wait for room in the consensus queue
                tokio::task::block_in_place(|| inbox_reactor.receive(env.channel, &env.from, &env.bytes));
            }
        });

        Ok(Self {
            name,
            reactor,
            mempool,
            storage,
            inbox,
            inbox_task,
        })
    }

    pub fn consensus_state(&self) -> &ConsensusState {
        self.reactor.consensus_state()
    }

    fn link_to(&self, remote: &Node) -> Arc<dyn Peer> {
        Arc::new(ChannelPeer {
            key: remote.name.clone(),
            from: self.name.clone(),
            inbox: remote.inbox.clone(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn stop(self) {
        self.reactor.stop();
        self.inbox_task.abort();
        if let Err(e) = self.storage.flush() {
            tracing::error!("{}: failed to flush storage: {}", self.name, e);
        }
        tracing::info!("{} stopped", self.name);
    }
}

/// Connect every pair of nodes
pub fn connect(nodes: &[Node]) {
    for a in nodes {
        for b in nodes {
            if a.name != b.name {
                a.reactor.add_peer(a.link_to(b));
            }
        }
    }
    tracing::info!("Connected {} validators", nodes.len());
}

/// Start `config.validators` nodes under `data_dir` and connect them
pub fn launch(config: &NodeConfig, data_dir: &Path) -> anyhow::Result<Vec<Node>> {
    std::fs::create_dir_all(data_dir)?;
    let genesis = genesis_state(config);
    let nodes = (0..config.validators)
        .map(|i| Node::start(i, config, &genesis, data_dir))
        .collect::<anyhow::Result<Vec<_>>>()?;
    connect(&nodes);
    Ok(nodes)
}
