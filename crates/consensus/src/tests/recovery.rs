use super::support::*;
use crate::error::{HandshakeError, WalError};
use crate::mock::{KvApp, MemBlockStore, MemMempool, MemStateStore};
use crate::replay::Handshaker;
use crate::round_state::RoundStep;
use crate::state::{Application, State, StateStore};
use crate::store::BlockStore;
use crate::types::LocalSigner;
use std::sync::Arc;

fn committed_network(heights: i64) -> Vec<TestNode> {
    let nodes = TestNode::network(4, None);
    nodes[proposer_index(&nodes)].mempool.add_tx(b"x=1".to_vec());
    for _ in 0..heights {
        for node in &nodes {
            node.start_round0();
        }
        run_network(&nodes, &[]);
    }
    nodes
}

fn handshaker(node: &TestNode, state: State, state_store: Arc<MemStateStore>, app: Arc<KvApp>) -> Handshaker {
    Handshaker::new(
        state,
        state_store,
        node.block_store.clone(),
        app,
        Arc::new(MemMempool::new()),
    )
}

#[test]
fn test_wal_replay_restores_locked_round_state() {
    let dir = tempfile::tempdir().unwrap();
    let nodes = TestNode::network(4, Some(dir.path()));
    let index = (proposer_index(&nodes) + 1) % nodes.len();
    nodes[index].cs.open_wal().unwrap();

    for node in &nodes {
        node.start_round0();
    }
    run_network_filtered(&nodes, &[], |mi| !is_precommit(mi));
    let before = nodes[index].hrs_locked();
    assert_eq!(before.2, RoundStep::Precommit);
    assert!(before.3.is_some());

    // same WAL and key, nothing else survives the crash
    let crashed = &nodes[index];
    let restarted = TestNode::with_stores(
        index,
        crashed.keys.clone(),
        crashed.genesis.clone(),
        crashed.config.clone(),
        Arc::new(MemBlockStore::new()),
        Arc::new(MemStateStore::new()),
        Arc::new(KvApp::new()),
    );
    restarted
        .cs
        .set_priv_validator(Arc::new(LocalSigner::from_seed([index as u8 + 1; 32])));
    restarted.cs.open_wal().unwrap();
    restarted.cs.catchup_replay(1).unwrap();
    assert_eq!(restarted.hrs_locked(), before);

    // votes re-signed during replay are duplicates of the logged ones
    restarted.cs.process_pending();
    assert_eq!(restarted.hrs_locked(), before);
    let precommits = restarted.cs.get_round_state().votes.precommits(0).unwrap();
    assert_eq!(precommits.string_short(), crashed.cs.get_round_state().votes.precommits(0).unwrap().string_short());
}

#[test]
fn test_replay_without_height_marker() {
    let dir = tempfile::tempdir().unwrap();
    let nodes = TestNode::network(1, Some(dir.path()));
    nodes[0].cs.open_wal().unwrap();

    let err = nodes[0].cs.catchup_replay(2).unwrap_err();
    assert!(matches!(err, WalError::MissingHeight(2)));
}

#[test]
fn test_replay_rejects_finished_height() {
    let dir = tempfile::tempdir().unwrap();
    let nodes = TestNode::network(4, Some(dir.path()));
    for node in &nodes {
        node.cs.open_wal().unwrap();
        node.start_round0();
    }
    run_network(&nodes, &[]);
    assert_eq!(nodes[2].block_store.height(), 1);

    let err = nodes[2].cs.catchup_replay(1).unwrap_err();
    assert!(matches!(err, WalError::UnexpectedHeight(2)));
    // the new height is replayable
    nodes[2].cs.catchup_replay(2).unwrap();
    assert_eq!(nodes[2].cs.get_round_state().height, 2);
}

#[test]
fn test_replay_finds_height_in_rotated_head() {
    let dir = tempfile::tempdir().unwrap();
    let keys = Arc::new(signers(4));
    let genesis = genesis_state(&keys);
    let nodes: Vec<_> = (0..4)
        .map(|i| {
            let mut config = test_config(&dir.path().join(format!("node{}", i)));
            // rotate at every height
            config.wal_head_size_limit = 1;
            TestNode::new(i, keys.clone(), genesis.clone(), config)
        })
        .collect();
    for node in &nodes {
        node.cs.open_wal().unwrap();
    }
    for _ in 0..2 {
        for node in &nodes {
            node.start_round0();
        }
        run_network(&nodes, &[]);
    }
    assert_eq!(nodes[1].block_store.height(), 2);

    let head = nodes[1].config.wal_dir.join(crate::wal::WAL_FILE_NAME);
    assert_eq!(crate::wal::segments(&head).unwrap().len(), 2);
    assert!(matches!(nodes[1].cs.catchup_replay(2), Err(WalError::UnexpectedHeight(3))));
    nodes[1].cs.catchup_replay(3).unwrap();
    assert_eq!(nodes[1].cs.get_round_state().height, 3);
}

#[test]
fn test_replay_without_wal_is_noop() {
    let nodes = TestNode::network(1, None);
    nodes[0].cs.catchup_replay(1).unwrap();
    assert_eq!(nodes[0].hrs_locked(), (1, 0, RoundStep::NewHeight, None));
}

#[test]
fn test_handshake_fresh_chain() {
    let nodes = TestNode::network(4, None);
    let node = &nodes[0];
    let mut hs = handshaker(node, node.genesis.clone(), Arc::new(MemStateStore::new()), Arc::new(KvApp::new()));

    let state = hs.handshake().unwrap();
    assert_eq!(state, node.genesis);
    assert_eq!(hs.blocks_replayed(), 0);
}

#[test]
fn test_handshake_block_saved_before_state() {
    let nodes = committed_network(1);
    let node = &nodes[0];
    let committed = node.state_store.load_state().unwrap().unwrap();

    // crash after save_block: state is still genesis, app lost everything
    let state_store = Arc::new(MemStateStore::new());
    let app = Arc::new(KvApp::new());
    let mut hs = handshaker(node, node.genesis.clone(), state_store.clone(), app.clone());

    let state = hs.handshake().unwrap();
    assert_eq!(hs.blocks_replayed(), 1);
    assert_eq!(state, committed);
    assert_eq!(state.app_hash, node.app.info().last_app_hash);
    assert_eq!(app.get(b"x"), Some(b"1".to_vec()));
    assert_eq!(state_store.load_state().unwrap(), Some(state));
}

#[test]
fn test_handshake_app_already_executed_block() {
    let nodes = committed_network(1);
    let node = &nodes[0];
    let committed = node.state_store.load_state().unwrap().unwrap();

    let state_store = Arc::new(MemStateStore::new());
    let mut hs = handshaker(node, node.genesis.clone(), state_store.clone(), node.app.clone());

    let state = hs.handshake().unwrap();
    assert_eq!(hs.blocks_replayed(), 0);
    assert_eq!(state, committed);
    assert_eq!(state_store.load_state().unwrap(), Some(committed));
}

#[test]
fn test_handshake_replays_app_behind_saved_state() {
    let nodes = committed_network(2);
    let node = &nodes[1];
    let committed = node.state_store.load_state().unwrap().unwrap();

    let app = Arc::new(KvApp::new());
    let mut hs = handshaker(node, committed.clone(), Arc::new(MemStateStore::new()), app.clone());

    let state = hs.handshake().unwrap();
    assert_eq!(hs.blocks_replayed(), 2);
    assert_eq!(state, committed);
    assert_eq!(app.info(), node.app.info());
}

#[test]
fn test_handshake_app_behind_and_state_missing_last_block() {
    let nodes = committed_network(2);
    let node = &nodes[3];
    let committed = node.state_store.load_state().unwrap().unwrap();

    // state saved at height 1, block 2 stored, app at genesis
    let mut state_at_one = node.genesis.clone();
    let block = node.block_store.load_block(1).unwrap();
    let meta = node.block_store.load_block_meta(1).unwrap();
    state_at_one
        .apply_block(&KvApp::new(), &MemMempool::new(), &block, meta.block_id.parts_header)
        .unwrap();

    let app = Arc::new(KvApp::new());
    let mut hs = handshaker(node, state_at_one, Arc::new(MemStateStore::new()), app.clone());

    let state = hs.handshake().unwrap();
    assert_eq!(hs.blocks_replayed(), 2);
    assert_eq!(state, committed);
    assert_eq!(app.info().last_block_height, 2);
}

#[test]
fn test_handshake_state_too_far_ahead() {
    let nodes = committed_network(1);
    let node = &nodes[0];
    let mut state = node.genesis.clone();
    state.last_block_height = 3;

    let mut hs = handshaker(node, state, Arc::new(MemStateStore::new()), Arc::new(KvApp::new()));
    assert_eq!(hs.handshake().unwrap_err(), HandshakeError::StateMismatch { store: 1, state: 3 });
}

#[test]
fn test_handshake_app_ahead_of_store() {
    let nodes = committed_network(2);
    let node = &nodes[0];

    // a store that only kept block 1
    let block_store = Arc::new(MemBlockStore::new());
    let block = node.block_store.load_block(1).unwrap();
    let parts = block.make_part_set(node.config.block_part_size);
    block_store
        .save_block(&block, &parts, &node.block_store.load_seen_commit(1).unwrap())
        .unwrap();

    let mut hs = Handshaker::new(
        node.genesis.clone(),
        Arc::new(MemStateStore::new()),
        block_store,
        node.app.clone(),
        Arc::new(MemMempool::new()),
    );
    assert_eq!(hs.handshake().unwrap_err(), HandshakeError::AppAhead { store: 1, app: 2 });
}

#[test]
fn test_handshake_app_hash_mismatch() {
    let nodes = committed_network(1);
    let node = &nodes[0];
    let mut state = node.state_store.load_state().unwrap().unwrap();
    state.app_hash = vec![0xab; 32];

    let mut hs = handshaker(node, state, Arc::new(MemStateStore::new()), node.app.clone());
    assert_eq!(hs.handshake().unwrap_err(), HandshakeError::AppHashMismatch { height: 1 });
}
