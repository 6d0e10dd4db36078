//! The consensus state machine
//!
//! All mutation happens on one processing thread, which drains the
//! self-originated queue, the peer queue and the timeout channel in a
//! `select!`. Every input is written to the WAL before it is handled.
//! Everything else either enqueues a message or reads a `RoundState`
//! snapshot.
//!
//! Each `enter_*` transition re-checks (height, round, step) and silently
//! ignores requests that are no longer current. Broken invariants are fatal.

use crate::config::{ConsensusConfig, TimeoutParams};
use crate::error::{ConsensusError, VoteError, WalError};
use crate::events::{ConsensusEvent, EventBus, NewRoundHook};
use crate::fatal;
use crate::height_vote_set::HeightVoteSet;
use crate::messages::{MsgInfo, StateMessage};
use crate::round_state::{RoundState, RoundStep};
use crate::state::{Application, State, StateStore};
use crate::store::{BlockStore, Mempool};
use crate::ticker::{TimeoutInfo, TimeoutTicker};
use crate::types::{
    BadVoteCollector, BadVoteEvidence, Block, BlockId, Commit, LoggingCollector, Part, PartSet, PartSetHeader,
    PrivValidator, Proposal, Validator, Vote, VoteSet, VoteSetReader, VoteType,
};
use crate::wal::{self, Wal, WalMessage};
use chrono::Utc;
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::broadcast;

/// External collaborators of the state machine
pub struct Collaborators {
    pub app: Arc<dyn Application>,
    pub block_store: Arc<dyn BlockStore>,
    pub mempool: Arc<dyn Mempool>,
    pub state_store: Arc<dyn StateStore>,
    pub ticker: Arc<dyn TimeoutTicker>,
}

/// Handle to a consensus state machine. Cheap to clone.
#[derive(Clone)]
pub struct ConsensusState {
    shared: Arc<Shared>,
}

struct Shared {
    machine: Mutex<Machine>,
    internal_rx: Receiver<MsgInfo>,
    internal_tx: Sender<MsgInfo>,
    peer_rx: Receiver<MsgInfo>,
    peer_tx: Sender<MsgInfo>,
    ticker: Arc<dyn TimeoutTicker>,
    block_store: Arc<dyn BlockStore>,
    events: EventBus,
    lifecycle: crate::service::Lifecycle,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConsensusState {
    /// Build a state machine at the height after `state`'s last block
    pub fn new(config: ConsensusConfig, state: State, deps: Collaborators) -> Self {
        let (internal_tx, internal_rx) = bounded(config.msg_queue_size);
        let (peer_tx, peer_rx) = bounded(config.msg_queue_size);
        let events = EventBus::default();

        let mut machine = Machine {
            timeouts: config.timeout_params(),
            config,
            rs: blank_round_state(&state),
            state: state.clone(),
            priv_validator: None,
            app: deps.app,
            block_store: deps.block_store.clone(),
            mempool: deps.mempool,
            state_store: deps.state_store,
            ticker: deps.ticker.clone(),
            internal_tx: internal_tx.clone(),
            events: events.clone(),
            wal: None,
            replay_mode: false,
            bad_votes: Arc::new(LoggingCollector),
            new_round_hook: None,
        };
        machine.update_to_state(state.clone());
        machine.reconstruct_last_commit(&state);

        Self {
            shared: Arc::new(Shared {
                machine: Mutex::new(machine),
                internal_rx,
                internal_tx,
                peer_rx,
                peer_tx,
                ticker: deps.ticker,
                block_store: deps.block_store,
                events,
                lifecycle: crate::service::Lifecycle::new("ConsensusState"),
                handle: Mutex::new(None),
            }),
        }
    }

    pub fn set_priv_validator(&self, priv_validator: Arc<dyn PrivValidator>) {
        self.shared.machine.lock().priv_validator = Some(priv_validator);
    }

    pub fn set_bad_vote_collector(&self, collector: Arc<dyn BadVoteCollector>) {
        self.shared.machine.lock().bad_votes = collector;
    }

    pub fn set_new_round_hook(&self, hook: NewRoundHook) {
        self.shared.machine.lock().new_round_hook = Some(hook);
    }

    /// Subscribe to state machine events
    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.shared.events.subscribe()
    }

    /// Snapshot of the current round state
    pub fn get_round_state(&self) -> RoundState {
        self.shared.machine.lock().rs.clone()
    }

    /// Copy of the chain state consensus is building on
    pub fn get_state(&self) -> State {
        self.shared.machine.lock().state.copy()
    }

    /// Last committed height and the validators for the current height
    pub fn get_validators(&self) -> (i64, Vec<Validator>) {
        let m = self.shared.machine.lock();
        (m.state.last_block_height, m.rs.validators.validators().to_vec())
    }

    /// Upper bound on the part count of a valid block
    pub fn max_block_parts(&self) -> u32 {
        self.shared.machine.lock().config.max_block_parts()
    }

    pub fn block_store(&self) -> Arc<dyn BlockStore> {
        self.shared.block_store.clone()
    }

    /// Seen commit for the store tip, the canonical block commit below it
    pub fn load_commit(&self, height: i64) -> Option<Commit> {
        let _guard = self.shared.machine.lock();
        if height == self.shared.block_store.height() {
            return self.shared.block_store.load_seen_commit(height);
        }
        self.shared.block_store.load_block_commit(height)
    }

    /// Open the WAL configured in `wal_dir` unless one is already open
    pub fn open_wal(&self) -> Result<(), WalError> {
        let mut m = self.shared.machine.lock();
        if m.wal.is_none() {
            let wal = Wal::open_with_limits(
                &m.config.wal_dir,
                m.config.wal_light,
                m.config.wal_head_size_limit,
                m.config.wal_total_size_limit,
            )?;
            m.wal = Some(wal);
        }
        Ok(())
    }

    /// Open the WAL, replay the current height and start processing
    pub fn start(&self) -> Result<(), WalError> {
        if !self.shared.lifecycle.start() {
            return Ok(());
        }
        self.open_wal()?;

        let height = {
            let mut m = self.shared.machine.lock();
            m.ensure_height_marker()?;
            m.rs.height
        };

        self.shared.ticker.start();

        if let Err(e) = self.catchup_replay(height) {
            tracing::error!("Error on catchup replay: {}", e);
        }

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("consensus".to_string())
            .spawn(move || receive_routine(shared))?;
        *self.shared.handle.lock() = Some(handle);

        self.shared.machine.lock().schedule_round0();
        Ok(())
    }

    /// Stop the ticker and the processing thread
    pub fn stop(&self) {
        if !self.shared.lifecycle.stop() {
            return;
        }
        self.shared.ticker.stop();
        if let Some(handle) = self.shared.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Consensus thread panicked");
            }
        }
    }

    /// Block until the processing thread has exited
    pub fn wait(&self) {
        self.shared.lifecycle.wait();
    }

    pub fn is_running(&self) -> bool {
        self.shared.lifecycle.is_running()
    }

    /// Move onto a state produced outside consensus, e.g. by block sync
    pub fn switch_to_state(&self, state: State) {
        let mut m = self.shared.machine.lock();
        m.update_to_state(state.clone());
        m.reconstruct_last_commit(&state);
    }

    pub fn add_vote(&self, vote: Vote, peer_key: &str) {
        self.enqueue(MsgInfo::new(StateMessage::Vote(vote), peer_key));
    }

    pub fn set_proposal(&self, proposal: Proposal, peer_key: &str) {
        self.enqueue(MsgInfo::new(StateMessage::Proposal(proposal), peer_key));
    }

    pub fn add_proposal_block_part(&self, height: i64, round: i64, part: Part, peer_key: &str) {
        self.enqueue(MsgInfo::new(StateMessage::BlockPart { height, round, part }, peer_key));
    }

    /// Enqueue a proposal followed by every part of its block
    pub fn set_proposal_and_block(&self, proposal: Proposal, parts: &PartSet, peer_key: &str) {
        let (height, round) = (proposal.height, proposal.round);
        self.set_proposal(proposal, peer_key);
        for i in 0..parts.total() as usize {
            if let Some(part) = parts.get_part(i) {
                self.add_proposal_block_part(height, round, part, peer_key);
            }
        }
    }

    /// Self messages go to the internal queue, peer messages block on the peer queue
    fn enqueue(&self, mi: MsgInfo) {
        if mi.is_internal() {
            send_internal(&self.shared.internal_tx, mi);
        } else if self.shared.peer_tx.send(mi).is_err() {
            tracing::warn!("Peer message queue closed");
        }
    }

    pub(crate) fn machine(&self) -> MutexGuard<'_, Machine> {
        self.shared.machine.lock()
    }

    /// Drain both queues through the normal processing path.
    /// Returns the self-originated messages so callers can relay them.
    #[cfg(test)]
    pub(crate) fn process_pending(&self) -> Vec<MsgInfo> {
        let mut own = Vec::new();
        loop {
            if let Ok(mi) = self.shared.internal_rx.try_recv() {
                own.push(mi.clone());
                self.shared.process_msg(mi);
                continue;
            }
            if let Ok(mi) = self.shared.peer_rx.try_recv() {
                self.shared.process_msg(mi);
                continue;
            }
            return own;
        }
    }

    #[cfg(test)]
    pub(crate) fn fire_timeout(&self, ti: TimeoutInfo) {
        self.shared.process_timeout(ti);
    }
}

impl Shared {
    fn process_msg(&self, mi: MsgInfo) {
        let mut m = self.machine.lock();
        m.save_wal(WalMessage::MsgInfo(mi.clone()));
        m.handle_msg(mi);
    }

    fn process_timeout(&self, ti: TimeoutInfo) {
        let mut m = self.machine.lock();
        m.save_wal(WalMessage::Timeout(ti.clone()));
        m.handle_timeout(ti);
    }
}

fn receive_routine(shared: Arc<Shared>) {
    let tock = shared.ticker.chan();
    let quit = shared.lifecycle.quit();
    loop {
        select! {
            recv(shared.internal_rx) -> mi => {
                if let Ok(mi) = mi {
                    shared.process_msg(mi);
                }
            }
            recv(shared.peer_rx) -> mi => {
                if let Ok(mi) = mi {
                    shared.process_msg(mi);
                }
            }
            recv(tock) -> ti => {
                if let Ok(ti) = ti {
                    shared.process_timeout(ti);
                }
            }
            recv(quit) -> _ => break,
        }
    }

    // self messages still queued were signed but never logged; the signer
    // remembers what it signed, so they are safe to drop
    if let Some(wal) = shared.machine.lock().wal.as_mut() {
        wal.stop();
    }
    shared.lifecycle.mark_done();
}

/// Send on the self queue. When it is full, a helper thread finishes the
/// send, so self messages can be processed out of order.
fn send_internal(tx: &Sender<MsgInfo>, mi: MsgInfo) {
    match tx.try_send(mi) {
        Ok(()) => {}
        Err(TrySendError::Full(mi)) => {
            tracing::warn!("Internal msg queue is full. Using a thread");
            let tx = tx.clone();
            std::thread::spawn(move || {
                let _ = tx.send(mi);
            });
        }
        Err(TrySendError::Disconnected(_)) => tracing::warn!("Internal msg queue closed"),
    }
}

/// Separate a conflict from other vote errors, keeping whether the vote counted
fn split_conflict(result: Result<bool, VoteError>) -> Result<(bool, Option<VoteError>), VoteError> {
    match result {
        Ok(added) => Ok((added, None)),
        Err(e @ VoteError::ConflictingVotes { .. }) => {
            let added = matches!(e, VoteError::ConflictingVotes { added: true, .. });
            Ok((added, Some(e)))
        }
        Err(e) => Err(e),
    }
}

fn blank_round_state(state: &State) -> RoundState {
    let validators = Arc::new(state.validators.clone());
    RoundState {
        height: 0,
        round: 0,
        step: RoundStep::NewHeight,
        start_time: Utc::now(),
        commit_time: None,
        validators: validators.clone(),
        proposal: None,
        proposal_block: None,
        proposal_block_parts: None,
        locked_round: 0,
        locked_block: None,
        locked_block_parts: None,
        votes: Arc::new(HeightVoteSet::new(&state.chain_id, 0, validators)),
        commit_round: -1,
        last_commit: None,
        last_validators: Arc::new(state.last_validators.clone()),
    }
}

/// State owned by the processing thread
pub(crate) struct Machine {
    config: ConsensusConfig,
    timeouts: TimeoutParams,
    pub(crate) rs: RoundState,
    state: State,
    priv_validator: Option<Arc<dyn PrivValidator>>,
    app: Arc<dyn Application>,
    block_store: Arc<dyn BlockStore>,
    mempool: Arc<dyn Mempool>,
    state_store: Arc<dyn StateStore>,
    ticker: Arc<dyn TimeoutTicker>,
    internal_tx: Sender<MsgInfo>,
    events: EventBus,
    pub(crate) wal: Option<Wal>,
    /// Set while re-feeding the WAL; silences signing errors
    pub(crate) replay_mode: bool,
    bad_votes: Arc<dyn BadVoteCollector>,
    new_round_hook: Option<NewRoundHook>,
}

impl Machine {
    pub(crate) fn save_wal(&mut self, msg: WalMessage) {
        if let Some(wal) = self.wal.as_mut() {
            wal.save(msg);
        }
    }

    /// Write a NewHeight record if the WAL has no marker for this height
    fn ensure_height_marker(&mut self) -> Result<(), WalError> {
        let missing = match &self.wal {
            Some(wal) => !wal::contains_height(wal.path(), self.rs.height)?,
            None => false,
        };
        if missing && self.rs.step == RoundStep::NewHeight {
            tracing::warn!("Height {} not found in WAL. Writing new height", self.rs.height);
            let event = self.rs.event();
            self.save_wal(WalMessage::RoundState(event));
        }
        Ok(())
    }

    fn publish(&self, event: ConsensusEvent) {
        self.events.publish(event);
    }

    fn update_round_step(&mut self, round: i64, step: RoundStep) {
        self.rs.round = round;
        self.rs.step = step;
    }

    fn new_step(&mut self) {
        let event = self.rs.event();
        self.save_wal(WalMessage::RoundState(event));
        self.publish(ConsensusEvent::NewRoundStep(Arc::new(self.rs.clone())));
    }

    fn schedule_timeout(&self, duration: Duration, height: i64, round: i64, step: RoundStep) {
        self.ticker.schedule_timeout(TimeoutInfo::new(duration, height, round, step));
    }

    /// Round 0 of the current height starts at `start_time`
    pub(crate) fn schedule_round0(&self) {
        let sleep = (self.rs.start_time - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.schedule_timeout(sleep, self.rs.height, 0, RoundStep::NewHeight);
    }

    fn send_internal(&self, mi: MsgInfo) {
        send_internal(&self.internal_tx, mi);
    }

    fn unlock(&mut self) {
        self.rs.locked_round = 0;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
    }

    fn is_stale(&self, height: i64, round: i64, step: RoundStep) -> bool {
        self.rs.height != height || round < self.rs.round || (self.rs.round == round && step <= self.rs.step)
    }

    fn proposal_parts_header(&self) -> PartSetHeader {
        self.rs
            .proposal_block_parts
            .as_ref()
            .map(|p| p.header())
            .unwrap_or_default()
    }

    fn proposal_parts_match(&self, header: &PartSetHeader) -> bool {
        self.rs
            .proposal_block_parts
            .as_ref()
            .map(|p| p.has_header(header))
            .unwrap_or(false)
    }

    fn proposal_block_hashes_to(&self, hash: &[u8]) -> bool {
        self.rs
            .proposal_block
            .as_ref()
            .map(|b| b.hashes_to(hash))
            .unwrap_or(false)
    }

    /// Reset the round state for the height after `state`'s last block
    fn update_to_state(&mut self, state: State) {
        if self.rs.commit_round > -1 && 0 < self.rs.height && self.rs.height != state.last_block_height {
            fatal!(
                "update_to_state() expected state height of {} but found {}",
                self.rs.height,
                state.last_block_height
            );
        }
        if self.rs.height > 0 && self.state.last_block_height + 1 != self.rs.height {
            fatal!(
                "Inconsistent state height {} vs round state height {}",
                self.state.last_block_height + 1,
                self.rs.height
            );
        }
        // Happens when the reactor switches over to a state we already have
        if self.rs.height > 0 && state.last_block_height <= self.state.last_block_height {
            tracing::debug!(
                "Ignoring update_to_state(): new height {} <= old height {}",
                state.last_block_height + 1,
                self.state.last_block_height + 1
            );
            return;
        }

        let last_precommits = if self.rs.commit_round > -1 {
            match self.rs.votes.precommits(self.rs.commit_round) {
                Some(vs) if vs.has_two_thirds_majority() => Some(vs),
                _ => fatal!("update_to_state() called but last precommit round didn't have +2/3"),
            }
        } else {
            None
        };

        let height = state.last_block_height + 1;
        let validators = Arc::new(state.validators.clone());

        self.rs.height = height;
        self.update_round_step(0, RoundStep::NewHeight);
        self.rs.start_time = match self.rs.commit_time {
            None => self.timeouts.commit(Utc::now()),
            Some(t) => self.timeouts.commit(t),
        };
        self.rs.validators = validators.clone();
        self.rs.proposal = None;
        self.rs.proposal_block = None;
        self.rs.proposal_block_parts = None;
        self.unlock();
        self.rs.votes = Arc::new(HeightVoteSet::new(&state.chain_id, height, validators));
        self.rs.commit_round = -1;
        self.rs.last_commit = last_precommits;
        self.rs.last_validators = Arc::new(state.last_validators.clone());

        self.state = state;
        self.new_step();
    }

    /// Rebuild the last commit from the seen commit saved with the block
    fn reconstruct_last_commit(&mut self, state: &State) {
        let height = state.last_block_height;
        if height == 0 {
            return;
        }
        let seen = match self.block_store.load_seen_commit(height) {
            Some(c) => c,
            None => fatal!("Failed to reconstruct last commit: no seen commit for height {}", height),
        };
        let last_precommits = VoteSet::new(
            &state.chain_id,
            height,
            seen.round(),
            VoteType::Precommit,
            Arc::new(state.last_validators.clone()),
        );
        for precommit in seen.precommits.iter().flatten() {
            match last_precommits.add_vote(precommit) {
                Ok(true) => {}
                Ok(false) => fatal!("Failed to reconstruct last commit: duplicate {}", precommit),
                Err(e) => fatal!("Failed to reconstruct last commit: {}", e),
            }
        }
        if !last_precommits.has_two_thirds_majority() {
            fatal!("Failed to reconstruct last commit: does not have +2/3 majority");
        }
        self.rs.last_commit = Some(Arc::new(last_precommits));
    }

    pub(crate) fn handle_msg(&mut self, mi: MsgInfo) {
        let MsgInfo { msg, peer_key } = mi;
        let result = match msg {
            StateMessage::Proposal(proposal) => self.set_proposal(proposal),
            StateMessage::BlockPart { height, round, part } => {
                match self.add_proposal_block_part(height, part, !peer_key.is_empty()) {
                    // parts for another round may belong to a block we reuse
                    Err(_) if round != self.rs.round => Ok(()),
                    other => other.map(|_| ()),
                }
            }
            StateMessage::Vote(vote) => {
                let result = self.try_add_vote(&vote, &peer_key);
                self.report_bad_vote(&vote, &peer_key, &result);
                result
            }
        };
        match result {
            Ok(()) => {}
            Err(ConsensusError::VoteHeightMismatch) => {
                tracing::debug!("Ignored vote for another height from peer {:?}", peer_key)
            }
            Err(e) => tracing::warn!("Error with msg from peer {:?}: {}", peer_key, e),
        }
    }

    fn report_bad_vote(&self, vote: &Vote, peer_key: &str, result: &Result<(), ConsensusError>) {
        if peer_key.is_empty() {
            return;
        }
        let expected = match result {
            Err(ConsensusError::AddingVote) => None,
            Err(ConsensusError::Vote(VoteError::ConflictingVotes { vote_a, .. })) => Some((**vote_a).clone()),
            _ => return,
        };
        self.bad_votes.report_bad_vote(BadVoteEvidence {
            peer_key: peer_key.to_string(),
            vote_type: vote.vote_type,
            height: self.rs.height,
            round: self.rs.round,
            got: vote.clone(),
            expected,
        });
    }

    pub(crate) fn handle_timeout(&mut self, ti: TimeoutInfo) {
        tracing::debug!("Received tock {}", ti);
        let rs = &self.rs;
        if ti.height != rs.height || ti.round < rs.round || (ti.round == rs.round && ti.step < rs.step) {
            tracing::debug!("Ignoring tock because we're ahead: {}/{}/{}", rs.height, rs.round, rs.step);
            return;
        }

        match ti.step {
            RoundStep::NewHeight => self.enter_new_round(ti.height, 0),
            RoundStep::Propose => {
                self.publish(ConsensusEvent::TimeoutPropose(self.rs.event()));
                self.enter_prevote(ti.height, ti.round);
            }
            RoundStep::PrevoteWait => {
                self.publish(ConsensusEvent::TimeoutWait(self.rs.event()));
                self.enter_precommit(ti.height, ti.round);
            }
            RoundStep::PrecommitWait => {
                self.publish(ConsensusEvent::TimeoutWait(self.rs.event()));
                self.enter_new_round(ti.height, ti.round + 1);
            }
            other => fatal!("Invalid timeout step: {}", other),
        }
    }

    // Enter: +2/3 precommits for nil at (height, round-1)
    // Enter: PrecommitWait timeout at (height, round-1)
    // Enter: start_time of the height
    fn enter_new_round(&mut self, height: i64, round: i64) {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && rs.step != RoundStep::NewHeight) {
            tracing::debug!(
                "enter_new_round({}/{}): Invalid args. Current step: {}/{}/{}",
                height, round, rs.height, rs.round, rs.step
            );
            return;
        }
        let now = Utc::now();
        if rs.start_time > now {
            tracing::warn!("enter_new_round({}/{}) before start time {}", height, round, rs.start_time);
        }
        tracing::info!(
            "enter_new_round({}/{}). Current: {}/{}/{}",
            height, round, rs.height, rs.round, rs.step
        );

        if self.rs.round < round {
            let mut validators = (*self.rs.validators).clone();
            validators.increment_accum(round - self.rs.round);
            self.rs.validators = Arc::new(validators);
        }

        // no new_step for NewRound, but the event below needs the step
        self.update_round_step(round, RoundStep::NewRound);
        if round != 0 {
            // round 0 keeps a proposal that arrived during NewHeight
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }
        // track round+1 too so votes can skip us ahead
        self.rs.votes.set_round(round + 1);

        let event = self.rs.event();
        self.publish(ConsensusEvent::NewRound(event.clone()));
        if let Some(hook) = &self.new_round_hook {
            hook.round_trip(event);
        }

        self.enter_propose(height, round);
    }

    // Enter: from NewRound(height, round)
    fn enter_propose(&mut self, height: i64, round: i64) {
        if self.is_stale(height, round, RoundStep::Propose) {
            tracing::debug!(
                "enter_propose({}/{}): Invalid args. Current step: {}/{}/{}",
                height, round, self.rs.height, self.rs.round, self.rs.step
            );
            return;
        }
        tracing::info!(
            "enter_propose({}/{}). Current: {}/{}/{}",
            height, round, self.rs.height, self.rs.round, self.rs.step
        );

        // prevote nil if the proposal does not arrive in time
        self.schedule_timeout(self.timeouts.propose(round), height, round, RoundStep::Propose);

        if let Some(pv) = self.priv_validator.clone() {
            let address = pv.address();
            let is_proposer = self
                .rs
                .validators
                .proposer()
                .map(|p| p.address == address)
                .unwrap_or(false);
            if is_proposer {
                tracing::info!("enter_propose: Our turn to propose");
                self.decide_proposal(pv.as_ref(), height, round);
            } else {
                tracing::debug!("enter_propose: Not our turn to propose");
            }
        }

        self.update_round_step(round, RoundStep::Propose);
        self.new_step();

        // otherwise prevote happens once the last part arrives, or on timeout
        if self.is_proposal_complete() {
            self.enter_prevote(height, self.rs.round);
        }
    }

    fn decide_proposal(&mut self, pv: &dyn PrivValidator, height: i64, round: i64) {
        let (block, parts) = match (&self.rs.locked_block, &self.rs.locked_block_parts) {
            (Some(block), Some(parts)) => (block.clone(), parts.clone()),
            _ => match self.create_proposal_block(pv) {
                Some(bp) => bp,
                None => return,
            },
        };

        let (pol_round, pol_block_id) = self.rs.votes.pol_info();
        let mut proposal = Proposal::new(height, round, parts.header(), pol_round, pol_block_id);
        if let Err(e) = pv.sign_proposal(&self.state.chain_id, &mut proposal) {
            if !self.replay_mode {
                tracing::warn!("enter_propose: Error signing proposal {}/{}: {}", height, round, e);
            }
            return;
        }

        // proposal and parts come back through the queue like any peer's
        self.send_internal(MsgInfo::new(StateMessage::Proposal(proposal.clone()), ""));
        for i in 0..parts.total() as usize {
            if let Some(part) = parts.get_part(i) {
                let msg = StateMessage::BlockPart {
                    height: self.rs.height,
                    round: self.rs.round,
                    part,
                };
                self.send_internal(MsgInfo::new(msg, ""));
            }
        }
        tracing::info!(
            "Signed proposal {} for block {} with {} txs",
            proposal,
            crate::types::block::short_hex(&block.hash()),
            block.txs.len()
        );
    }

    fn create_proposal_block(&self, pv: &dyn PrivValidator) -> Option<(Arc<Block>, Arc<PartSet>)> {
        let commit = if self.rs.height == 1 {
            Commit::default()
        } else {
            match self.rs.last_commit.as_ref().and_then(|lc| lc.make_commit()) {
                Some(commit) => commit,
                None => {
                    tracing::error!("enter_propose: Cannot propose anything: No commit for the previous block");
                    return None;
                }
            }
        };

        let txs = self.mempool.reap(self.config.block_size);
        let block = Block::make(
            &self.state.chain_id,
            self.rs.height,
            txs,
            commit,
            self.state.last_block_id.clone(),
            self.state.validators.hash(),
            self.state.app_hash.clone(),
            pv.address(),
        );
        let parts = block.make_part_set(self.config.block_part_size);
        Some((Arc::new(block), Arc::new(parts)))
    }

    /// Proposal and block present, plus the POL prevotes if it names one
    fn is_proposal_complete(&self) -> bool {
        let (Some(proposal), Some(_)) = (&self.rs.proposal, &self.rs.proposal_block) else {
            return false;
        };
        if proposal.pol_round < 0 {
            return true;
        }
        self.rs
            .votes
            .prevotes(proposal.pol_round)
            .map(|vs| vs.has_two_thirds_majority())
            .unwrap_or(false)
    }

    // Enter: proposal complete, or Propose timeout
    // Enter: any +2/3 prevotes for a future round
    fn enter_prevote(&mut self, height: i64, round: i64) {
        if self.is_stale(height, round, RoundStep::Prevote) {
            tracing::debug!(
                "enter_prevote({}/{}): Invalid args. Current step: {}/{}/{}",
                height, round, self.rs.height, self.rs.round, self.rs.step
            );
            return;
        }
        if self.is_proposal_complete() {
            self.publish(ConsensusEvent::CompleteProposal(self.rs.event()));
        }
        tracing::info!(
            "enter_prevote({}/{}). Current: {}/{}/{}",
            height, round, self.rs.height, self.rs.round, self.rs.step
        );

        self.do_prevote(height, round);

        self.update_round_step(round, RoundStep::Prevote);
        self.new_step();
    }

    fn do_prevote(&mut self, height: i64, round: i64) {
        let prevoted = if let Some(locked) = self.rs.locked_block.clone() {
            tracing::debug!("enter_prevote: Block was locked");
            let header = self
                .rs
                .locked_block_parts
                .as_ref()
                .map(|p| p.header())
                .unwrap_or_default();
            self.sign_add_vote(VoteType::Prevote, locked.hash(), header);
            Some(locked)
        } else {
            match self.rs.proposal_block.clone() {
                None => {
                    tracing::warn!("enter_prevote: ProposalBlock is nil");
                    self.sign_add_vote(VoteType::Prevote, Vec::new(), PartSetHeader::default());
                    None
                }
                Some(block) => match self.state.validate_block(&block) {
                    Err(e) => {
                        tracing::warn!("enter_prevote: ProposalBlock is invalid: {}", e);
                        self.sign_add_vote(VoteType::Prevote, Vec::new(), PartSetHeader::default());
                        None
                    }
                    Ok(()) => {
                        let header = self.proposal_parts_header();
                        self.sign_add_vote(VoteType::Prevote, block.hash(), header);
                        Some(block)
                    }
                },
            }
        };
        self.publish(ConsensusEvent::PrevoteHook {
            height,
            round,
            block: prevoted,
        });
    }

    // Enter: any +2/3 prevotes at next round
    fn enter_prevote_wait(&mut self, height: i64, round: i64) {
        if self.is_stale(height, round, RoundStep::PrevoteWait) {
            tracing::debug!(
                "enter_prevote_wait({}/{}): Invalid args. Current step: {}/{}/{}",
                height, round, self.rs.height, self.rs.round, self.rs.step
            );
            return;
        }
        let any = self
            .rs
            .votes
            .prevotes(round)
            .map(|vs| vs.has_two_thirds_any())
            .unwrap_or(false);
        if !any {
            fatal!("enter_prevote_wait({}/{}), but prevotes does not have any +2/3 votes", height, round);
        }
        tracing::info!(
            "enter_prevote_wait({}/{}). Current: {}/{}/{}",
            height, round, self.rs.height, self.rs.round, self.rs.step
        );

        self.schedule_timeout(self.timeouts.prevote(round), height, round, RoundStep::PrevoteWait);

        self.update_round_step(round, RoundStep::PrevoteWait);
        self.new_step();
    }

    // Enter: +2/3 prevotes for a block or nil
    // Enter: PrevoteWait timeout
    // Enter: any +2/3 precommits for the round
    // Lock/unlock per the polka, then precommit the locked block or nil
    fn enter_precommit(&mut self, height: i64, round: i64) {
        if self.is_stale(height, round, RoundStep::Precommit) {
            tracing::debug!(
                "enter_precommit({}/{}): Invalid args. Current step: {}/{}/{}",
                height, round, self.rs.height, self.rs.round, self.rs.step
            );
            return;
        }
        tracing::info!(
            "enter_precommit({}/{}). Current: {}/{}/{}",
            height, round, self.rs.height, self.rs.round, self.rs.step
        );

        let precommitted = self.do_precommit(round);

        self.update_round_step(round, RoundStep::Precommit);
        self.new_step();
        self.publish(ConsensusEvent::PrecommitHook {
            height,
            round,
            block: precommitted,
        });
    }

    fn do_precommit(&mut self, round: i64) -> Option<Arc<Block>> {
        let polka = self.rs.votes.prevotes(round).and_then(|vs| vs.two_thirds_majority());
        let block_id = match polka {
            Some(block_id) => block_id,
            None => {
                if self.rs.locked_block.is_some() {
                    tracing::info!("enter_precommit: No +2/3 prevotes while we're locked. Precommitting nil");
                } else {
                    tracing::info!("enter_precommit: No +2/3 prevotes. Precommitting nil");
                }
                self.sign_add_vote(VoteType::Precommit, Vec::new(), PartSetHeader::default());
                return None;
            }
        };

        self.publish(ConsensusEvent::Polka(self.rs.event()));

        let (pol_round, _) = self.rs.votes.pol_info();
        if pol_round < round {
            fatal!("This POL round should be {} but got {}", round, pol_round);
        }

        if block_id.is_nil() {
            if self.rs.locked_block.is_none() {
                tracing::info!("enter_precommit: +2/3 prevoted for nil");
            } else {
                tracing::info!("enter_precommit: +2/3 prevoted for nil. Unlocking");
                self.unlock();
                self.publish(ConsensusEvent::Unlock(self.rs.event()));
            }
            self.sign_add_vote(VoteType::Precommit, Vec::new(), PartSetHeader::default());
            return None;
        }

        if let Some(locked) = self.rs.locked_block.clone() {
            if locked.hashes_to(&block_id.hash) {
                tracing::info!("enter_precommit: +2/3 prevoted locked block. Relocking");
                self.rs.locked_round = round;
                self.publish(ConsensusEvent::Relock(self.rs.event()));
                self.sign_add_vote(VoteType::Precommit, block_id.hash, block_id.parts_header);
                return Some(locked);
            }
        }

        if let Some(block) = self.rs.proposal_block.clone() {
            if block.hashes_to(&block_id.hash) {
                if let Err(e) = self.state.validate_block(&block) {
                    fatal!("enter_precommit: +2/3 prevoted for an invalid block: {}", e);
                }
                tracing::info!("enter_precommit: +2/3 prevoted proposal block. Locking {}", block_id);
                self.rs.locked_round = round;
                self.rs.locked_block = Some(block.clone());
                self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
                self.publish(ConsensusEvent::Lock(self.rs.event()));
                self.sign_add_vote(VoteType::Precommit, block_id.hash, block_id.parts_header);
                return Some(block);
            }
        }

        // polka for a block we don't have: unlock, fetch it, precommit nil
        tracing::info!("enter_precommit: +2/3 prevotes for a block we don't have. Precommitting nil");
        self.unlock();
        if !self.proposal_parts_match(&block_id.parts_header) {
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = Some(Arc::new(PartSet::from_header(&block_id.parts_header)));
        }
        self.publish(ConsensusEvent::Unlock(self.rs.event()));
        self.sign_add_vote(VoteType::Precommit, Vec::new(), PartSetHeader::default());
        None
    }

    // Enter: any +2/3 precommits for the round
    fn enter_precommit_wait(&mut self, height: i64, round: i64) {
        if self.is_stale(height, round, RoundStep::PrecommitWait) {
            tracing::debug!(
                "enter_precommit_wait({}/{}): Invalid args. Current step: {}/{}/{}",
                height, round, self.rs.height, self.rs.round, self.rs.step
            );
            return;
        }
        let any = self
            .rs
            .votes
            .precommits(round)
            .map(|vs| vs.has_two_thirds_any())
            .unwrap_or(false);
        if !any {
            fatal!("enter_precommit_wait({}/{}), but precommits does not have any +2/3 votes", height, round);
        }
        tracing::info!(
            "enter_precommit_wait({}/{}). Current: {}/{}/{}",
            height, round, self.rs.height, self.rs.round, self.rs.step
        );

        self.schedule_timeout(self.timeouts.precommit(round), height, round, RoundStep::PrecommitWait);

        self.update_round_step(round, RoundStep::PrecommitWait);
        self.new_step();
    }

    // Enter: +2/3 precommits for a block
    fn enter_commit(&mut self, height: i64, commit_round: i64) {
        if self.rs.height != height || RoundStep::Commit <= self.rs.step {
            tracing::debug!(
                "enter_commit({}/{}): Invalid args. Current step: {}/{}/{}",
                height, commit_round, self.rs.height, self.rs.round, self.rs.step
            );
            return;
        }
        tracing::info!(
            "enter_commit({}/{}). Current: {}/{}/{}",
            height, commit_round, self.rs.height, self.rs.round, self.rs.step
        );

        let block_id = match self.rs.votes.precommits(commit_round).and_then(|vs| vs.two_thirds_majority()) {
            Some(block_id) => block_id,
            None => fatal!("enter_commit() expects +2/3 precommits"),
        };

        // the locked block is the committed one, or it no longer matters
        if let Some(locked) = self.rs.locked_block.clone() {
            if locked.hashes_to(&block_id.hash) {
                self.rs.proposal_block = Some(locked);
                self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
            }
        }

        if !self.proposal_block_hashes_to(&block_id.hash) && !self.proposal_parts_match(&block_id.parts_header) {
            tracing::info!("enter_commit: Commit is for a block we don't know about. Waiting for its parts");
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = Some(Arc::new(PartSet::from_header(&block_id.parts_header)));
        }

        // round stays put; commit_round names the deciding precommits
        let round = self.rs.round;
        self.update_round_step(round, RoundStep::Commit);
        self.rs.commit_round = commit_round;
        self.rs.commit_time = Some(Utc::now());
        self.new_step();

        self.try_finalize_commit(height);
    }

    fn try_finalize_commit(&mut self, height: i64) {
        if self.rs.height != height {
            fatal!("try_finalize_commit() height {} vs current {}", height, self.rs.height);
        }
        let block_id = self
            .rs
            .votes
            .precommits(self.rs.commit_round)
            .and_then(|vs| vs.two_thirds_majority());
        let block_id = match block_id {
            Some(block_id) if !block_id.is_nil() => block_id,
            _ => {
                tracing::error!("Attempt to finalize failed. There was no +2/3 majority, or +2/3 was for nil");
                return;
            }
        };
        if !self.proposal_block_hashes_to(&block_id.hash) {
            tracing::info!("Attempt to finalize failed. We don't have the commit block {}", block_id);
            return;
        }
        self.finalize_commit(height);
    }

    // Save the block, apply it and move to the next height
    fn finalize_commit(&mut self, height: i64) {
        if self.rs.height != height || self.rs.step != RoundStep::Commit {
            tracing::debug!(
                "finalize_commit({}): Invalid args. Current step: {}/{}/{}",
                height, self.rs.height, self.rs.round, self.rs.step
            );
            return;
        }

        let precommits = match self.rs.votes.precommits(self.rs.commit_round) {
            Some(vs) => vs,
            None => fatal!("Cannot finalize commit: no precommits for commit round {}", self.rs.commit_round),
        };
        let block_id = match precommits.two_thirds_majority() {
            Some(block_id) => block_id,
            None => fatal!("Cannot finalize commit: commit does not have two thirds majority"),
        };
        let (block, parts) = match (self.rs.proposal_block.clone(), self.rs.proposal_block_parts.clone()) {
            (Some(block), Some(parts)) => (block, parts),
            _ => fatal!("Cannot finalize commit without the proposal block"),
        };
        if !parts.has_header(&block_id.parts_header) {
            fatal!("Expected proposal block parts header to be commit header");
        }
        if !block.hashes_to(&block_id.hash) {
            fatal!("Cannot finalize commit: proposal block does not hash to commit hash");
        }
        if let Err(e) = self.state.validate_block(&block) {
            fatal!("+2/3 committed an invalid block: {}", e);
        }

        tracing::info!(
            "Finalizing commit of block {} at height {} with {} txs",
            crate::types::block::short_hex(&block.hash()),
            block.height(),
            block.txs.len()
        );

        if self.block_store.height() < block.height() {
            // the seen commit is our local justification and may differ
            // from the last commit included in the next block
            let seen_commit = match precommits.make_commit() {
                Some(commit) => commit,
                None => fatal!("Cannot make commit from precommits with +2/3"),
            };
            if let Err(e) = self.block_store.save_block(&block, &parts, &seen_commit) {
                fatal!("Failed to save block {}: {}", block.height(), e);
            }
        } else {
            // replay after the block was saved but before the state was
            tracing::info!("Calling finalize_commit on already stored block {}", block.height());
        }

        let mut state_copy = self.state.copy();
        if let Err(e) = state_copy.apply_block(self.app.as_ref(), self.mempool.as_ref(), &block, parts.header()) {
            tracing::error!("Error on apply_block. Did the application crash? Please restart: {}", e);
            return;
        }

        self.publish(ConsensusEvent::NewBlock(block.clone()));
        self.publish(ConsensusEvent::NewBlockHeader(block.header.clone()));

        if let Err(e) = state_copy.save(self.state_store.as_ref()) {
            fatal!("Failed to save state at height {}: {}", state_copy.last_block_height, e);
        }

        self.update_to_state(state_copy);
        self.schedule_round0();
    }

    fn set_proposal(&mut self, proposal: Proposal) -> Result<(), ConsensusError> {
        if self.rs.proposal.is_some() {
            return Ok(());
        }
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            return Ok(());
        }
        if RoundStep::Commit <= self.rs.step {
            return Ok(());
        }

        proposal
            .block_parts_header
            .validate(self.config.max_block_parts())?;

        // -1, or in [0, round)
        if proposal.pol_round != -1 && (proposal.pol_round < 0 || proposal.round <= proposal.pol_round) {
            return Err(ConsensusError::InvalidProposalPolRound);
        }

        let sign_bytes = proposal.sign_bytes(&self.state.chain_id);
        let valid = self
            .rs
            .validators
            .proposer()
            .map(|p| p.verify(&sign_bytes, &proposal.signature))
            .unwrap_or(false);
        if !valid {
            return Err(ConsensusError::InvalidProposalSignature);
        }

        tracing::info!("Received proposal {}", proposal);
        self.rs.proposal_block_parts = Some(Arc::new(PartSet::from_header(&proposal.block_parts_header)));
        self.rs.proposal = Some(proposal);
        Ok(())
    }

    /// Returns whether the part was new
    fn add_proposal_block_part(&mut self, height: i64, part: Part, verify: bool) -> Result<bool, ConsensusError> {
        // parts may be reused across rounds, so only the height must match
        if self.rs.height != height {
            return Ok(false);
        }
        let parts = match self.rs.proposal_block_parts.clone() {
            Some(parts) => parts,
            None => return Ok(false),
        };

        let added = parts.add_part(part, verify)?;
        if !added || !parts.is_complete() {
            return Ok(added);
        }

        let block = parts.assemble_block()?;
        tracing::info!(
            "Received complete proposal block {} at height {}",
            crate::types::block::short_hex(&block.hash()),
            block.height()
        );
        // can complete before the proposal for a future round arrives
        self.rs.proposal_block = Some(Arc::new(block));

        if self.rs.step == RoundStep::Propose && self.is_proposal_complete() {
            self.enter_prevote(height, self.rs.round);
        } else if self.rs.step == RoundStep::Commit {
            self.try_finalize_commit(height);
        }
        Ok(true)
    }

    fn try_add_vote(&mut self, vote: &Vote, peer_key: &str) -> Result<(), ConsensusError> {
        match self.add_vote(vote, peer_key) {
            Ok(_) => Ok(()),
            Err(ConsensusError::VoteHeightMismatch) => Err(ConsensusError::VoteHeightMismatch),
            Err(e @ ConsensusError::Vote(VoteError::ConflictingVotes { .. })) => {
                if peer_key.is_empty() {
                    tracing::warn!(
                        "Found conflicting vote from ourselves at {}/{} {}. Did you reset a validator?",
                        vote.height,
                        vote.round,
                        vote.vote_type
                    );
                } else {
                    tracing::warn!("Found conflicting vote from peer {}: {}", peer_key, e);
                }
                Err(e)
            }
            Err(e) => {
                tracing::warn!("Error attempting to add vote {}: {}", vote, e);
                Err(ConsensusError::AddingVote)
            }
        }
    }

    fn add_vote(&mut self, vote: &Vote, peer_key: &str) -> Result<bool, ConsensusError> {
        // precommit stragglers for the previous height, while waiting out timeout_commit
        if vote.height + 1 == self.rs.height {
            if !(self.rs.step == RoundStep::NewHeight && vote.vote_type == VoteType::Precommit) {
                return Err(ConsensusError::VoteHeightMismatch);
            }
            let last_commit = match self.rs.last_commit.clone() {
                Some(lc) => lc,
                None => return Ok(false),
            };
            let (added, conflict) = split_conflict(last_commit.add_vote(vote))?;
            if added {
                tracing::info!("Added to last precommits: {}", last_commit.string_short());
                self.publish(ConsensusEvent::Vote(vote.clone()));
                if self.timeouts.skip_timeout_commit && last_commit.has_all() {
                    self.enter_new_round(self.rs.height, 0);
                }
            }
            return match conflict {
                Some(e) => Err(e.into()),
                None => Ok(added),
            };
        }

        if vote.height != self.rs.height {
            tracing::debug!("Vote ignored and not added: vote height {} vs {}", vote.height, self.rs.height);
            return Err(ConsensusError::VoteHeightMismatch);
        }

        let height = self.rs.height;
        let (added, conflict) = split_conflict(self.rs.votes.add_vote(vote, peer_key))?;
        if added {
            self.publish(ConsensusEvent::Vote(vote.clone()));
            match vote.vote_type {
                VoteType::Prevote => self.on_prevote_added(height, vote.round),
                VoteType::Precommit => self.on_precommit_added(height, vote.round),
            }
        }
        // a conflicting vote counted for a peer-claimed block still moves us first
        match conflict {
            Some(e) => Err(e.into()),
            None => Ok(added),
        }
    }

    fn on_prevote_added(&mut self, height: i64, vote_round: i64) {
        let prevotes = match self.rs.votes.prevotes(vote_round) {
            Some(vs) => vs,
            None => return,
        };
        tracing::info!("Added to prevotes: {}", prevotes.string_short());

        // a later polka for another block releases our lock
        if let Some(locked) = self.rs.locked_block.clone() {
            if self.rs.locked_round < vote_round && vote_round <= self.rs.round {
                if let Some(block_id) = prevotes.two_thirds_majority() {
                    if !locked.hashes_to(&block_id.hash) {
                        tracing::info!(
                            "Unlocking because of POL: locked round {}, POL round {}",
                            self.rs.locked_round,
                            vote_round
                        );
                        self.unlock();
                        self.publish(ConsensusEvent::Unlock(self.rs.event()));
                    }
                }
            }
        }

        if self.rs.round <= vote_round && prevotes.has_two_thirds_any() {
            // skip ahead to the vote's round if needed
            self.enter_new_round(height, vote_round);
            if prevotes.has_two_thirds_majority() {
                self.enter_precommit(height, vote_round);
            } else {
                self.enter_prevote(height, vote_round);
                self.enter_prevote_wait(height, vote_round);
            }
            return;
        }

        let pol_round = self.rs.proposal.as_ref().map(|p| p.pol_round).unwrap_or(-1);
        if 0 <= pol_round && pol_round == vote_round && self.is_proposal_complete() {
            let round = self.rs.round;
            self.enter_prevote(height, round);
        }
    }

    fn on_precommit_added(&mut self, height: i64, vote_round: i64) {
        let precommits = match self.rs.votes.precommits(vote_round) {
            Some(vs) => vs,
            None => return,
        };
        tracing::info!("Added to precommits: {}", precommits.string_short());

        match precommits.two_thirds_majority() {
            Some(block_id) if block_id.is_nil() => self.enter_new_round(height, vote_round + 1),
            Some(_) => {
                self.enter_new_round(height, vote_round);
                self.enter_precommit(height, vote_round);
                self.enter_commit(height, vote_round);
                if self.timeouts.skip_timeout_commit && precommits.has_all() {
                    self.enter_new_round(self.rs.height, 0);
                }
            }
            None if self.rs.round <= vote_round && precommits.has_two_thirds_any() => {
                self.enter_new_round(height, vote_round);
                self.enter_precommit(height, vote_round);
                self.enter_precommit_wait(height, vote_round);
            }
            None => {}
        }
    }

    /// Sign a vote for the current round and queue it to ourselves.
    /// Does nothing without a signer or outside the validator set.
    fn sign_add_vote(&mut self, vote_type: VoteType, hash: Vec<u8>, header: PartSetHeader) -> Option<Vote> {
        let pv = self.priv_validator.clone()?;
        let address = pv.address();
        let (index, _) = self.rs.validators.get_by_address(&address)?;

        let mut vote = Vote {
            validator_address: address,
            validator_index: index as u32,
            height: self.rs.height,
            round: self.rs.round,
            vote_type,
            block_id: BlockId::new(hash, header),
            signature: Vec::new(),
        };
        match pv.sign_vote(&self.state.chain_id, &mut vote) {
            Ok(()) => {
                tracing::info!("Signed and pushed vote {}", vote);
                self.send_internal(MsgInfo::new(StateMessage::Vote(vote.clone()), ""));
                Some(vote)
            }
            Err(e) => {
                if !self.replay_mode {
                    tracing::error!("Error signing vote {}: {}", vote, e);
                }
                None
            }
        }
    }
}
