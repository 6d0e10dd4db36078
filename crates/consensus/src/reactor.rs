//! Consensus reactor: gossip between the state machine and peers
//!
//! Every peer gets three tasks (data, votes, maj23 queries) that compare our
//! round state with what the peer reported and send whatever it is missing.
//! Inbound bytes are routed by channel through `receive`.

use crate::consensus_state::ConsensusState;
use crate::error::WalError;
use crate::events::ConsensusEvent;
use crate::messages::{
    BlockPartMessage, CommitStepMessage, ConsensusMessage, HasVoteMessage, NewRoundStepMessage, ProposalPolMessage,
    VoteSetBitsMessage, VoteSetMaj23Message,
};
use crate::peer_state::{PeerRoundState, PeerState};
use crate::round_state::{RoundState, RoundStep};
use crate::service::Lifecycle;
use crate::state::State;
use crate::types::{BitArray, Vote, VoteSetReader, VoteType};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub const STATE_CHANNEL: u8 = 0x20;
pub const DATA_CHANNEL: u8 = 0x21;
pub const VOTE_CHANNEL: u8 = 0x22;
pub const VOTE_SET_BITS_CHANNEL: u8 = 0x23;

/// Pause between gossip passes with nothing to send
pub const PEER_GOSSIP_SLEEP: Duration = Duration::from_millis(100);
/// Pause between maj23 announcements
pub const PEER_QUERY_MAJ23_SLEEP: Duration = Duration::from_secs(2);

/// A connected peer, as provided by the transport
pub trait Peer: Send + Sync {
    fn key(&self) -> &str;

    /// Queue `msg` on `channel`, waiting for room if the transport can.
    /// False if it was not queued; gossip sends it again later.
    fn send(&self, channel: u8, msg: Vec<u8>) -> bool;

    /// Queue `msg` only if there is room right now
    fn try_send(&self, channel: u8, msg: Vec<u8>) -> bool;

    /// Ask the transport to drop this peer
    fn stop_for_error(&self, reason: &str);
}

struct PeerEntry {
    peer: Arc<dyn Peer>,
    state: Arc<PeerState>,
    cancel: CancellationToken,
}

struct Inner {
    cs: ConsensusState,
    /// Part totals above this are rejected before anything is sized by them
    max_block_parts: u32,
    peers: DashMap<String, PeerEntry>,
    fast_sync: AtomicBool,
    lifecycle: Lifecycle,
}

#[derive(Clone)]
pub struct ConsensusReactor {
    inner: Arc<Inner>,
}

impl ConsensusReactor {
    pub fn new(cs: ConsensusState, fast_sync: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_block_parts: cs.max_block_parts(),
                cs,
                peers: DashMap::new(),
                fast_sync: AtomicBool::new(fast_sync),
                lifecycle: Lifecycle::new("ConsensusReactor"),
            }),
        }
    }

    /// Start the state machine unless fast syncing, and the event relay.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), WalError> {
        if !self.inner.lifecycle.start() {
            return Ok(());
        }
        tracing::info!("ConsensusReactor fast_sync: {}", self.fast_sync());
        if !self.fast_sync() {
            self.inner.cs.start()?;
        }

        let inner = self.inner.clone();
        let events = self.inner.cs.subscribe();
        let cancel = self.inner.lifecycle.cancel_token();
        tokio::spawn(async move { inner.relay_events(events, cancel).await });
        Ok(())
    }

    pub fn stop(&self) {
        if !self.inner.lifecycle.stop() {
            return;
        }
        self.inner.cs.stop();
        self.inner.peers.clear();
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.is_running()
    }

    pub fn fast_sync(&self) -> bool {
        self.inner.fast_sync.load(Ordering::SeqCst)
    }

    pub fn consensus_state(&self) -> &ConsensusState {
        &self.inner.cs
    }

    /// Leave fast sync: adopt `state` and start the state machine
    pub fn switch_to_consensus(&self, state: State) -> Result<(), WalError> {
        tracing::info!("SwitchToConsensus at height {}", state.last_block_height + 1);
        self.inner.cs.switch_to_state(state);
        self.inner.fast_sync.store(false, Ordering::SeqCst);
        self.inner.cs.start()
    }

    pub fn peer_state(&self, key: &str) -> Option<Arc<PeerState>> {
        self.inner.peers.get(key).map(|e| e.state.clone())
    }

    pub fn num_peers(&self) -> usize {
        self.inner.peers.len()
    }

    /// Track a new peer and start gossiping to it
    pub fn add_peer(&self, peer: Arc<dyn Peer>) {
        if !self.is_running() {
            return;
        }
        let key = peer.key().to_string();
        let state = Arc::new(PeerState::new(&key));
        let cancel = self.inner.lifecycle.cancel_token().child_token();

        let entry = PeerEntry {
            peer: peer.clone(),
            state: state.clone(),
            cancel: cancel.clone(),
        };
        if let Some(old) = self.inner.peers.insert(key.clone(), entry) {
            old.cancel.cancel();
        }

        let inner = self.inner.clone();
        let (p, s, c) = (peer.clone(), state.clone(), cancel.clone());
        tokio::spawn(async move { inner.gossip_data_routine(p, s, c).await });

        let inner = self.inner.clone();
        let (p, s, c) = (peer.clone(), state.clone(), cancel.clone());
        tokio::spawn(async move { inner.gossip_votes_routine(p, s, c).await });

        let inner = self.inner.clone();
        let (p, s, c) = (peer.clone(), state, cancel);
        tokio::spawn(async move { inner.query_maj23_routine(p, s, c).await });

        // the peer learns our step right away instead of at the next transition
        if !self.fast_sync() {
            self.inner.send_new_round_step(peer.as_ref());
        }
        tracing::debug!("Added peer {}", key);
    }

    pub fn remove_peer(&self, key: &str) {
        if let Some((_, entry)) = self.inner.peers.remove(key) {
            entry.cancel.cancel();
            tracing::debug!("Removed peer {}", key);
        }
    }

    /// Route an inbound message from `peer_key` on `channel`
    pub fn receive(&self, channel: u8, peer_key: &str, bytes: &[u8]) {
        if !self.is_running() {
            tracing::debug!("Receive: reactor not running, dropping message on channel {:#04x}", channel);
            return;
        }
        let (peer, ps) = match self.inner.peers.get(peer_key) {
            Some(e) => (e.peer.clone(), e.state.clone()),
            None => {
                tracing::debug!("Receive: unknown peer {}", peer_key);
                return;
            }
        };
        let msg = match ConsensusMessage::from_bytes(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Error decoding message from {} on channel {:#04x}: {}", peer_key, channel, e);
                self.drop_peer(peer.as_ref(), &e.to_string());
                return;
            }
        };
        if let Err(reason) = self.check_part_totals(&msg) {
            tracing::warn!("Invalid message from {} on channel {:#04x}: {}", peer_key, channel, reason);
            self.drop_peer(peer.as_ref(), &reason);
            return;
        }
        tracing::debug!("Receive on channel {:#04x} from {}: kind {:#04x}", channel, peer_key, msg.kind());

        let cs = &self.inner.cs;
        match (channel, msg) {
            (STATE_CHANNEL, ConsensusMessage::NewRoundStep(m)) => ps.apply_new_round_step_message(&m),
            (STATE_CHANNEL, ConsensusMessage::CommitStep(m)) => ps.apply_commit_step_message(&m),
            (STATE_CHANNEL, ConsensusMessage::HasVote(m)) => ps.apply_has_vote_message(&m),
            (STATE_CHANNEL, ConsensusMessage::VoteSetMaj23(m)) => self.inner.handle_maj23(peer.as_ref(), &m),

            (DATA_CHANNEL | VOTE_CHANNEL | VOTE_SET_BITS_CHANNEL, _) if self.fast_sync() => {
                tracing::debug!("Ignoring message from {} received during fast sync", peer_key);
            }

            (DATA_CHANNEL, ConsensusMessage::Proposal(proposal)) => {
                ps.set_has_proposal(&proposal);
                cs.set_proposal(proposal, peer_key);
            }
            (DATA_CHANNEL, ConsensusMessage::ProposalPol(m)) => ps.apply_proposal_pol_message(&m),
            (DATA_CHANNEL, ConsensusMessage::BlockPart(m)) => {
                ps.set_has_proposal_block_part(m.height, m.round, m.part.index as usize);
                cs.add_proposal_block_part(m.height, m.round, m.part, peer_key);
            }

            (VOTE_CHANNEL, ConsensusMessage::Vote(vote)) => {
                let rs = cs.get_round_state();
                ps.ensure_vote_bit_arrays(rs.height, rs.validators.size());
                if let Some(last_commit) = &rs.last_commit {
                    ps.ensure_vote_bit_arrays(rs.height - 1, last_commit.size());
                }
                ps.set_has_vote(&vote);
                cs.add_vote(vote, peer_key);
            }

            (VOTE_SET_BITS_CHANNEL, ConsensusMessage::VoteSetBits(m)) => {
                let rs = cs.get_round_state();
                let ours = if rs.height == m.height {
                    rs.votes
                        .vote_set(m.round, m.vote_type)
                        .and_then(|vs| vs.bit_array_by_block_id(&m.block_id))
                } else {
                    None
                };
                ps.apply_vote_set_bits_message(&m, ours.as_ref());
            }

            (channel, msg) => {
                tracing::warn!("Unexpected message kind {:#04x} on channel {:#04x}", msg.kind(), channel);
            }
        }
    }
}

impl ConsensusReactor {
    fn drop_peer(&self, peer: &dyn Peer, reason: &str) {
        peer.stop_for_error(reason);
        self.remove_peer(peer.key());
    }

    /// Part set headers and part bit arrays from peers must describe a block
    /// we could accept
    fn check_part_totals(&self, msg: &ConsensusMessage) -> Result<(), String> {
        let max = self.inner.max_block_parts;
        match msg {
            ConsensusMessage::Proposal(proposal) => proposal
                .block_parts_header
                .validate(max)
                .map_err(|e| e.to_string()),
            ConsensusMessage::CommitStep(m) => {
                m.block_parts_header.validate(max).map_err(|e| e.to_string())?;
                if m.block_parts.size() != m.block_parts_header.total as usize {
                    return Err(format!(
                        "Commit step has {} part bits for {} parts",
                        m.block_parts.size(),
                        m.block_parts_header.total
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn new_round_step_message(rs: &RoundState) -> NewRoundStepMessage {
    NewRoundStepMessage {
        height: rs.height,
        round: rs.round,
        step: rs.step,
        seconds_since_start_time: (Utc::now() - rs.start_time).num_seconds(),
        last_commit_round: rs.last_commit.as_ref().map(|lc| lc.round()).unwrap_or(-1),
    }
}

fn commit_step_message(rs: &RoundState) -> Option<CommitStepMessage> {
    if rs.step != RoundStep::Commit {
        return None;
    }
    let parts = rs.proposal_block_parts.as_ref()?;
    Some(CommitStepMessage {
        height: rs.height,
        block_parts_header: parts.header(),
        block_parts: parts.bit_array(),
    })
}

async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

impl Inner {
    fn broadcast(&self, channel: u8, msg: &ConsensusMessage) {
        let bytes = msg.to_bytes();
        for entry in self.peers.iter() {
            entry.peer.try_send(channel, bytes.clone());
        }
    }

    fn send_new_round_step(&self, peer: &dyn Peer) {
        let rs = self.cs.get_round_state();
        peer.send(STATE_CHANNEL, ConsensusMessage::NewRoundStep(new_round_step_message(&rs)).to_bytes());
        if let Some(commit_step) = commit_step_message(&rs) {
            peer.send(STATE_CHANNEL, ConsensusMessage::CommitStep(commit_step).to_bytes());
        }
    }

    async fn relay_events(self: Arc<Self>, mut events: broadcast::Receiver<ConsensusEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(ConsensusEvent::NewRoundStep(rs)) => {
                    self.broadcast(STATE_CHANNEL, &ConsensusMessage::NewRoundStep(new_round_step_message(&rs)));
                    if let Some(commit_step) = commit_step_message(&rs) {
                        self.broadcast(STATE_CHANNEL, &ConsensusMessage::CommitStep(commit_step));
                    }
                }
                Ok(ConsensusEvent::Vote(vote)) => {
                    let msg = HasVoteMessage {
                        height: vote.height,
                        round: vote.round,
                        vote_type: vote.vote_type,
                        index: vote.validator_index,
                    };
                    self.broadcast(STATE_CHANNEL, &ConsensusMessage::HasVote(msg));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Consensus reactor lagged {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Record the peer's maj23 claim and answer with the votes we hold for it
    fn handle_maj23(&self, peer: &dyn Peer, msg: &VoteSetMaj23Message) {
        let rs = self.cs.get_round_state();
        if rs.height != msg.height {
            return;
        }
        if let Err(e) = rs.votes.set_peer_maj23(msg.round, msg.vote_type, peer.key(), &msg.block_id) {
            tracing::warn!("Error setting maj23 from {}: {}", peer.key(), e);
            return;
        }
        let votes = rs
            .votes
            .vote_set(msg.round, msg.vote_type)
            .and_then(|vs| vs.bit_array_by_block_id(&msg.block_id))
            .unwrap_or_else(|| BitArray::new(rs.validators.size()));
        let reply = VoteSetBitsMessage {
            height: msg.height,
            round: msg.round,
            vote_type: msg.vote_type,
            block_id: msg.block_id.clone(),
            votes,
        };
        peer.try_send(VOTE_SET_BITS_CHANNEL, ConsensusMessage::VoteSetBits(reply).to_bytes());
    }

    async fn gossip_data_routine(self: Arc<Self>, peer: Arc<dyn Peer>, ps: Arc<PeerState>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                tracing::debug!("Stopping gossip_data_routine for {}", peer.key());
                return;
            }
            let rs = self.cs.get_round_state();
            let prs = ps.get_round_state();

            if self.send_proposal_part(peer.as_ref(), &ps, &rs, &prs) {
                continue;
            }

            if 0 < prs.height && prs.height < rs.height {
                if self.send_catchup_part(peer.as_ref(), &ps, &prs) {
                    continue;
                }
            } else if rs.height == prs.height && rs.round == prs.round && self.send_proposal(peer.as_ref(), &ps, &rs, &prs) {
                continue;
            }

            if !sleep_or_cancel(&cancel, PEER_GOSSIP_SLEEP).await {
                return;
            }
        }
    }

    /// A part of our proposal block the peer lacks, if it tracks the same block
    fn send_proposal_part(&self, peer: &dyn Peer, ps: &PeerState, rs: &RoundState, prs: &PeerRoundState) -> bool {
        let Some(parts) = &rs.proposal_block_parts else {
            return false;
        };
        if !parts.has_header(&prs.proposal_block_parts_header) {
            return false;
        }
        let peer_parts = prs
            .proposal_block_parts
            .clone()
            .unwrap_or_else(|| BitArray::new(parts.total() as usize));
        let Some(index) = parts.bit_array().sub(&peer_parts).pick_random() else {
            return false;
        };
        let Some(part) = parts.get_part(index) else {
            return false;
        };
        let msg = ConsensusMessage::BlockPart(BlockPartMessage {
            height: rs.height,
            round: rs.round,
            part,
        });
        if peer.send(DATA_CHANNEL, msg.to_bytes()) {
            ps.set_has_proposal_block_part(prs.height, prs.round, index);
        }
        true
    }

    /// A stored block part for a peer that is committing an older height
    fn send_catchup_part(&self, peer: &dyn Peer, ps: &PeerState, prs: &PeerRoundState) -> bool {
        let Some(peer_parts) = &prs.proposal_block_parts else {
            return false;
        };
        let Some(index) = peer_parts.not().pick_random() else {
            return false;
        };
        let block_store = self.cs.block_store();
        let Some(meta) = block_store.load_block_meta(prs.height) else {
            tracing::warn!("Peer {} at height {} but we have no block meta for it", peer.key(), prs.height);
            return false;
        };
        if meta.block_id.parts_header != prs.proposal_block_parts_header {
            tracing::debug!("Peer {} parts header mismatch at height {}", peer.key(), prs.height);
            return false;
        }
        let Some(part) = block_store.load_block_part(prs.height, index) else {
            return false;
        };
        let msg = ConsensusMessage::BlockPart(BlockPartMessage {
            height: prs.height,
            round: prs.round,
            part,
        });
        if peer.send(DATA_CHANNEL, msg.to_bytes()) {
            ps.set_has_proposal_block_part(prs.height, prs.round, index);
        }
        true
    }

    /// Our proposal, followed by its POL bits if it names a POL round
    fn send_proposal(&self, peer: &dyn Peer, ps: &PeerState, rs: &RoundState, prs: &PeerRoundState) -> bool {
        let Some(proposal) = &rs.proposal else {
            return false;
        };
        if prs.proposal {
            return false;
        }
        if peer.send(DATA_CHANNEL, ConsensusMessage::Proposal(proposal.clone()).to_bytes()) {
            ps.set_has_proposal(proposal);
        }
        if 0 <= proposal.pol_round {
            if let Some(pol) = rs.votes.prevotes(proposal.pol_round) {
                let msg = ConsensusMessage::ProposalPol(ProposalPolMessage {
                    height: rs.height,
                    proposal_pol_round: proposal.pol_round,
                    proposal_pol: pol.bit_array(),
                });
                peer.send(DATA_CHANNEL, msg.to_bytes());
            }
        }
        true
    }

    async fn gossip_votes_routine(self: Arc<Self>, peer: Arc<dyn Peer>, ps: Arc<PeerState>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                tracing::debug!("Stopping gossip_votes_routine for {}", peer.key());
                return;
            }
            let rs = self.cs.get_round_state();
            let prs = ps.get_round_state();

            if self.gossip_votes_once(peer.as_ref(), &ps, &rs, &prs) {
                continue;
            }
            if !sleep_or_cancel(&cancel, PEER_GOSSIP_SLEEP).await {
                return;
            }
        }
    }

    fn gossip_votes_once(&self, peer: &dyn Peer, ps: &PeerState, rs: &RoundState, prs: &PeerRoundState) -> bool {
        if rs.height == prs.height {
            if prs.step == RoundStep::NewHeight {
                if let Some(last_commit) = &rs.last_commit {
                    if pick_send_vote(peer, ps, last_commit.as_ref()) {
                        return true;
                    }
                }
            }
            if prs.round != -1 && prs.round <= rs.round {
                if prs.step <= RoundStep::Prevote {
                    if let Some(prevotes) = rs.votes.prevotes(prs.round) {
                        if pick_send_vote(peer, ps, prevotes.as_ref()) {
                            return true;
                        }
                    }
                }
                if prs.step <= RoundStep::Precommit {
                    if let Some(precommits) = rs.votes.precommits(prs.round) {
                        if pick_send_vote(peer, ps, precommits.as_ref()) {
                            return true;
                        }
                    }
                }
            }
            if prs.proposal_pol_round != -1 {
                if let Some(pol) = rs.votes.prevotes(prs.proposal_pol_round) {
                    if pick_send_vote(peer, ps, pol.as_ref()) {
                        return true;
                    }
                }
            }
        }

        // one height behind: our last commit
        if prs.height != 0 && rs.height == prs.height + 1 {
            if let Some(last_commit) = &rs.last_commit {
                if pick_send_vote(peer, ps, last_commit.as_ref()) {
                    return true;
                }
            }
        }

        // further behind: the stored commit for its height
        if prs.height != 0 && rs.height >= prs.height + 2 {
            if let Some(commit) = self.cs.block_store().load_block_commit(prs.height) {
                if pick_send_vote(peer, ps, &commit) {
                    return true;
                }
            }
        }
        false
    }

    async fn query_maj23_routine(self: Arc<Self>, peer: Arc<dyn Peer>, ps: Arc<PeerState>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                tracing::debug!("Stopping query_maj23_routine for {}", peer.key());
                return;
            }

            let rs = self.cs.get_round_state();
            let prs = ps.get_round_state();
            if rs.height == prs.height {
                let mut claims = vec![(prs.round, VoteType::Prevote), (prs.round, VoteType::Precommit)];
                if prs.proposal_pol_round >= 0 {
                    claims.push((prs.proposal_pol_round, VoteType::Prevote));
                }
                for (round, vote_type) in claims {
                    let maj23 = rs.votes.vote_set(round, vote_type).and_then(|vs| vs.two_thirds_majority());
                    if let Some(block_id) = maj23 {
                        let msg = VoteSetMaj23Message {
                            height: prs.height,
                            round,
                            vote_type,
                            block_id,
                        };
                        peer.try_send(STATE_CHANNEL, ConsensusMessage::VoteSetMaj23(msg).to_bytes());
                        if !sleep_or_cancel(&cancel, PEER_QUERY_MAJ23_SLEEP).await {
                            return;
                        }
                    }
                }
            }

            // the peer is catching up on a height we have a commit for
            let prs = ps.get_round_state();
            if prs.catchup_commit_round != -1 && 0 < prs.height && prs.height <= self.cs.block_store().height() {
                if let Some(commit) = self.cs.load_commit(prs.height) {
                    let msg = VoteSetMaj23Message {
                        height: prs.height,
                        round: commit.round(),
                        vote_type: VoteType::Precommit,
                        block_id: commit.block_id.clone(),
                    };
                    peer.try_send(STATE_CHANNEL, ConsensusMessage::VoteSetMaj23(msg).to_bytes());
                    if !sleep_or_cancel(&cancel, PEER_QUERY_MAJ23_SLEEP).await {
                        return;
                    }
                }
            }

            if !sleep_or_cancel(&cancel, PEER_QUERY_MAJ23_SLEEP).await {
                return;
            }
        }
    }
}

/// Send one vote the peer lacks. True if a vote was sent.
fn pick_send_vote(peer: &dyn Peer, ps: &PeerState, votes: &dyn VoteSetReader) -> bool {
    let Some(vote) = ps.pick_vote_to_send(votes) else {
        return false;
    };
    send_vote(peer, ps, vote)
}

fn send_vote(peer: &dyn Peer, ps: &PeerState, vote: Vote) -> bool {
    tracing::trace!("Sending vote {} to {}", vote, peer.key());
    if peer.send(VOTE_CHANNEL, ConsensusMessage::Vote(vote.clone()).to_bytes()) {
        ps.set_has_vote(&vote);
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::{block_id, signed_vote, TestNode};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingPeer {
        key: String,
        sent: Mutex<Vec<(u8, Vec<u8>)>>,
        stopped: Mutex<Option<String>>,
    }

    impl RecordingPeer {
        fn new(key: &str) -> Arc<Self> {
            Arc::new(Self {
                key: key.to_string(),
                ..Default::default()
            })
        }

        fn messages(&self, channel: u8) -> Vec<ConsensusMessage> {
            self.sent
                .lock()
                .iter()
                .filter(|(ch, _)| *ch == channel)
                .filter_map(|(_, bytes)| ConsensusMessage::from_bytes(bytes).ok())
                .collect()
        }
    }

    impl Peer for RecordingPeer {
        fn key(&self) -> &str {
            &self.key
        }

        fn send(&self, channel: u8, msg: Vec<u8>) -> bool {
            self.sent.lock().push((channel, msg));
            true
        }

        fn try_send(&self, channel: u8, msg: Vec<u8>) -> bool {
            self.send(channel, msg)
        }

        fn stop_for_error(&self, reason: &str) {
            *self.stopped.lock() = Some(reason.to_string());
        }
    }

    fn started_reactor(dir: &std::path::Path) -> (TestNode, ConsensusReactor) {
        let nodes = TestNode::network(4, Some(dir));
        let node = nodes.into_iter().next().unwrap();
        let reactor = ConsensusReactor::new(node.cs.clone(), false);
        reactor.start().unwrap();
        (node, reactor)
    }

    #[tokio::test]
    async fn test_add_peer_announces_round_step() {
        let dir = tempfile::tempdir().unwrap();
        let (_node, reactor) = started_reactor(dir.path());
        let peer = RecordingPeer::new("p1");
        reactor.add_peer(peer.clone());

        let steps = peer.messages(STATE_CHANNEL);
        assert!(matches!(steps.first(), Some(ConsensusMessage::NewRoundStep(m)) if m.height == 1));
        assert_eq!(reactor.num_peers(), 1);
        reactor.stop();
    }

    #[tokio::test]
    async fn test_receive_updates_peer_state() {
        let dir = tempfile::tempdir().unwrap();
        let (_node, reactor) = started_reactor(dir.path());
        reactor.add_peer(RecordingPeer::new("p1"));

        let msg = ConsensusMessage::NewRoundStep(NewRoundStepMessage {
            height: 1,
            round: 0,
            step: RoundStep::Prevote,
            seconds_since_start_time: 1,
            last_commit_round: -1,
        });
        reactor.receive(STATE_CHANNEL, "p1", &msg.to_bytes());

        let prs = reactor.peer_state("p1").unwrap().get_round_state();
        assert_eq!((prs.height, prs.round, prs.step), (1, 0, RoundStep::Prevote));
        reactor.stop();
    }

    #[tokio::test]
    async fn test_vote_routed_to_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let (node, reactor) = started_reactor(dir.path());
        let mut events = node.cs.subscribe();
        reactor.add_peer(RecordingPeer::new("p1"));

        let vote = signed_vote(&node.keys[1], &node.genesis.validators, 1, 0, VoteType::Prevote, block_id(7));
        reactor.receive(VOTE_CHANNEL, "p1", &ConsensusMessage::Vote(vote.clone()).to_bytes());

        let got = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(ConsensusEvent::Vote(v)) = events.recv().await {
                    return v;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(got, vote);

        let bits = reactor.peer_state("p1").unwrap().get_vote_bit_array(1, 0, VoteType::Prevote);
        assert_eq!(bits, None, "peer has not reported height 1 yet");
        reactor.stop();
    }

    #[tokio::test]
    async fn test_maj23_answered_with_vote_set_bits() {
        let dir = tempfile::tempdir().unwrap();
        let (node, reactor) = started_reactor(dir.path());
        let peer = RecordingPeer::new("p1");
        reactor.add_peer(peer.clone());

        let msg = ConsensusMessage::VoteSetMaj23(VoteSetMaj23Message {
            height: 1,
            round: 0,
            vote_type: VoteType::Prevote,
            block_id: block_id(3),
        });
        reactor.receive(STATE_CHANNEL, "p1", &msg.to_bytes());

        let replies = peer.messages(VOTE_SET_BITS_CHANNEL);
        match replies.as_slice() {
            [ConsensusMessage::VoteSetBits(bits)] => {
                assert_eq!(bits.block_id, block_id(3));
                assert_eq!(bits.votes.size(), node.keys.len());
                assert!(bits.votes.is_empty());
            }
            other => panic!("unexpected replies {:?}", other),
        }
        reactor.stop();
    }

    #[tokio::test]
    async fn test_garbage_stops_peer() {
        let dir = tempfile::tempdir().unwrap();
        let (_node, reactor) = started_reactor(dir.path());
        let peer = RecordingPeer::new("p1");
        reactor.add_peer(peer.clone());

        reactor.receive(DATA_CHANNEL, "p1", &[0xff, 0x00, 0x01]);
        assert!(peer.stopped.lock().is_some());
        assert_eq!(reactor.num_peers(), 0);
        reactor.stop();
    }

    #[tokio::test]
    async fn test_oversized_part_totals_stop_peer() {
        use crate::tests::support::CHAIN_ID;
        use crate::types::{BlockId, PartSetHeader, PrivValidator, Proposal};

        let dir = tempfile::tempdir().unwrap();
        let (node, reactor) = started_reactor(dir.path());
        let proposer = node.genesis.validators.proposer().unwrap().address.clone();
        let key = node.keys.iter().find(|k| k.address() == proposer).unwrap();

        let peer = RecordingPeer::new("p1");
        reactor.add_peer(peer.clone());
        let header = PartSetHeader {
            total: u32::MAX,
            hash: vec![1; 32],
        };
        let mut proposal = Proposal::new(1, 0, header, -1, BlockId::nil());
        proposal.signature = key.sign_unchecked(&proposal.sign_bytes(CHAIN_ID));
        reactor.receive(DATA_CHANNEL, "p1", &ConsensusMessage::Proposal(proposal).to_bytes());
        assert!(peer.stopped.lock().is_some());
        assert_eq!(reactor.num_peers(), 0);
        assert!(node.cs.get_round_state().proposal.is_none());

        // commit step bits must match the announced part count
        let peer = RecordingPeer::new("p2");
        reactor.add_peer(peer.clone());
        let msg = ConsensusMessage::CommitStep(CommitStepMessage {
            height: 1,
            block_parts_header: PartSetHeader {
                total: 3,
                hash: vec![2; 32],
            },
            block_parts: BitArray::new(10),
        });
        reactor.receive(STATE_CHANNEL, "p2", &msg.to_bytes());
        assert!(peer.stopped.lock().is_some());
        assert_eq!(reactor.num_peers(), 0);
        reactor.stop();
    }

    #[tokio::test]
    async fn test_commit_step_accepted_within_limits() {
        let dir = tempfile::tempdir().unwrap();
        let (_node, reactor) = started_reactor(dir.path());
        let peer = RecordingPeer::new("p1");
        reactor.add_peer(peer.clone());
        let step = ConsensusMessage::NewRoundStep(NewRoundStepMessage {
            height: 1,
            round: 0,
            step: RoundStep::Commit,
            seconds_since_start_time: 1,
            last_commit_round: -1,
        });
        reactor.receive(STATE_CHANNEL, "p1", &step.to_bytes());

        let msg = ConsensusMessage::CommitStep(CommitStepMessage {
            height: 1,
            block_parts_header: crate::types::PartSetHeader {
                total: 3,
                hash: vec![2; 32],
            },
            block_parts: BitArray::new(3),
        });
        reactor.receive(STATE_CHANNEL, "p1", &msg.to_bytes());
        assert!(peer.stopped.lock().is_none());
        let prs = reactor.peer_state("p1").unwrap().get_round_state();
        assert_eq!(prs.proposal_block_parts.map(|b| b.size()), Some(3));
        reactor.stop();
    }

    #[tokio::test]
    async fn test_fast_sync_ignores_data() {
        let nodes = TestNode::network(4, None);
        let node = &nodes[0];
        let reactor = ConsensusReactor::new(node.cs.clone(), true);
        reactor.start().unwrap();
        reactor.add_peer(RecordingPeer::new("p1"));

        let vote = signed_vote(&node.keys[1], &node.genesis.validators, 1, 0, VoteType::Prevote, block_id(7));
        reactor.receive(VOTE_CHANNEL, "p1", &ConsensusMessage::Vote(vote).to_bytes());
        assert!(node.cs.process_pending().is_empty());
        assert!(node.cs.get_round_state().votes.prevotes(0).unwrap().bit_array().is_empty());
        reactor.stop();
    }
}
