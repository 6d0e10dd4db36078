//! What we know about a peer's round state
//!
//! Only fed by what the peer reports or what we sent it. Used to avoid
//! redundant gossip, never to decide anything locally.

use crate::messages::{CommitStepMessage, HasVoteMessage, NewRoundStepMessage, ProposalPolMessage, VoteSetBitsMessage};
use crate::round_state::{compare_hrs, RoundStep};
use crate::types::{BitArray, PartSetHeader, Proposal, Vote, VoteSetReader, VoteType};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone)]
pub struct PeerRoundState {
    pub height: i64,
    pub round: i64,
    pub step: RoundStep,
    /// Estimated start of round 0 at this height
    pub start_time: DateTime<Utc>,
    pub proposal: bool,
    pub proposal_block_parts_header: PartSetHeader,
    pub proposal_block_parts: Option<BitArray>,
    /// Proposal's POL round, -1 if none
    pub proposal_pol_round: i64,
    /// Nil until a ProposalPol message arrives
    pub proposal_pol: Option<BitArray>,
    pub prevotes: Option<BitArray>,
    pub precommits: Option<BitArray>,
    /// Round of the commit for the previous height
    pub last_commit_round: i64,
    pub last_commit: Option<BitArray>,
    /// Round we believe the peer has commit precommits for, -1 if none
    pub catchup_commit_round: i64,
    pub catchup_commit: Option<BitArray>,
}

impl Default for PeerRoundState {
    fn default() -> Self {
        Self {
            height: 0,
            round: -1,
            step: RoundStep::NewHeight,
            start_time: Utc::now(),
            proposal: false,
            proposal_block_parts_header: PartSetHeader::default(),
            proposal_block_parts: None,
            proposal_pol_round: -1,
            proposal_pol: None,
            prevotes: None,
            precommits: None,
            last_commit_round: -1,
            last_commit: None,
            catchup_commit_round: -1,
            catchup_commit: None,
        }
    }
}

impl PeerRoundState {
    fn vote_bit_array(&mut self, height: i64, round: i64, vote_type: VoteType) -> Option<&mut BitArray> {
        if self.height == height {
            if self.round == round {
                return match vote_type {
                    VoteType::Prevote => self.prevotes.as_mut(),
                    VoteType::Precommit => self.precommits.as_mut(),
                };
            }
            if self.catchup_commit_round == round {
                return match vote_type {
                    VoteType::Prevote => None,
                    VoteType::Precommit => self.catchup_commit.as_mut(),
                };
            }
            if self.proposal_pol_round == round {
                return match vote_type {
                    VoteType::Prevote => self.proposal_pol.as_mut(),
                    VoteType::Precommit => None,
                };
            }
            return None;
        }
        if self.height == height + 1 && self.last_commit_round == round && vote_type == VoteType::Precommit {
            return self.last_commit.as_mut();
        }
        None
    }

    fn ensure_catchup_commit_round(&mut self, height: i64, round: i64, num_validators: usize) {
        if self.height != height || self.catchup_commit_round == round {
            return;
        }
        self.catchup_commit_round = round;
        self.catchup_commit = if round == self.round {
            self.precommits.clone()
        } else {
            Some(BitArray::new(num_validators))
        };
    }

    fn ensure_vote_bit_arrays(&mut self, height: i64, num_validators: usize) {
        if self.height == height {
            for bits in [
                &mut self.prevotes,
                &mut self.precommits,
                &mut self.catchup_commit,
                &mut self.proposal_pol,
            ] {
                bits.get_or_insert_with(|| BitArray::new(num_validators));
            }
        } else if self.height == height + 1 {
            self.last_commit.get_or_insert_with(|| BitArray::new(num_validators));
        }
    }

    fn set_has_vote(&mut self, height: i64, round: i64, vote_type: VoteType, index: usize) {
        if let Some(bits) = self.vote_bit_array(height, round, vote_type) {
            bits.set_index(index, true);
        }
    }
}

/// Thread-safe peer round state, shared by the peer's gossip tasks
pub struct PeerState {
    key: String,
    prs: Mutex<PeerRoundState>,
}

impl PeerState {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            prs: Mutex::new(PeerRoundState::default()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Snapshot of the peer's round state
    pub fn get_round_state(&self) -> PeerRoundState {
        self.prs.lock().clone()
    }

    pub fn set_has_proposal(&self, proposal: &Proposal) {
        let mut prs = self.prs.lock();
        if prs.height != proposal.height || prs.round != proposal.round || prs.proposal {
            return;
        }
        prs.proposal = true;
        prs.proposal_block_parts_header = proposal.block_parts_header.clone();
        prs.proposal_block_parts = Some(BitArray::new(proposal.block_parts_header.total as usize));
        prs.proposal_pol_round = proposal.pol_round;
        prs.proposal_pol = None;
    }

    pub fn set_has_proposal_block_part(&self, height: i64, round: i64, index: usize) {
        let mut prs = self.prs.lock();
        if prs.height != height || prs.round != round {
            return;
        }
        if let Some(bits) = prs.proposal_block_parts.as_mut() {
            bits.set_index(index, true);
        }
    }

    /// A vote from `votes` the peer does not have yet, picked at random.
    /// Call `set_has_vote` once it was actually sent.
    pub fn pick_vote_to_send(&self, votes: &dyn VoteSetReader) -> Option<Vote> {
        let size = votes.size();
        if size == 0 {
            return None;
        }
        let (height, round, vote_type) = (votes.height(), votes.round(), votes.vote_type());

        let mut prs = self.prs.lock();
        if votes.is_commit() {
            prs.ensure_catchup_commit_round(height, round, size);
        }
        prs.ensure_vote_bit_arrays(height, size);
        let peer_votes = prs.vote_bit_array(height, round, vote_type)?;
        let index = votes.bit_array().sub(peer_votes).pick_random()?;
        votes.get_by_index(index)
    }

    pub fn get_vote_bit_array(&self, height: i64, round: i64, vote_type: VoteType) -> Option<BitArray> {
        self.prs.lock().vote_bit_array(height, round, vote_type).map(|b| b.clone())
    }

    pub fn ensure_vote_bit_arrays(&self, height: i64, num_validators: usize) {
        self.prs.lock().ensure_vote_bit_arrays(height, num_validators);
    }

    pub fn set_has_vote(&self, vote: &Vote) {
        let mut prs = self.prs.lock();
        prs.set_has_vote(vote.height, vote.round, vote.vote_type, vote.validator_index as usize);
    }

    pub fn apply_new_round_step_message(&self, msg: &NewRoundStepMessage) {
        let mut prs = self.prs.lock();
        if compare_hrs(msg.height, msg.round, msg.step, prs.height, prs.round, prs.step) != Ordering::Greater {
            return;
        }

        let (ps_height, ps_round) = (prs.height, prs.round);
        let ps_catchup_commit_round = prs.catchup_commit_round;
        let ps_catchup_commit = prs.catchup_commit.clone();

        prs.height = msg.height;
        prs.round = msg.round;
        prs.step = msg.step;
        prs.start_time = Utc::now() - chrono::Duration::seconds(msg.seconds_since_start_time);

        if ps_height != msg.height || ps_round != msg.round {
            prs.proposal = false;
            prs.proposal_block_parts_header = PartSetHeader::default();
            prs.proposal_block_parts = None;
            prs.proposal_pol_round = -1;
            prs.proposal_pol = None;
            // sized lazily once we know the validator count
            prs.prevotes = None;
            prs.precommits = None;
        }
        if ps_height == msg.height && ps_round != msg.round && msg.round == ps_catchup_commit_round {
            // the peer reached the round we were sending commit votes for
            prs.precommits = ps_catchup_commit;
        }
        if ps_height != msg.height {
            prs.last_commit = if ps_height + 1 == msg.height && ps_round == msg.last_commit_round {
                prs.precommits.take()
            } else {
                None
            };
            prs.last_commit_round = msg.last_commit_round;
            prs.catchup_commit_round = -1;
            prs.catchup_commit = None;
        }
    }

    pub fn apply_commit_step_message(&self, msg: &CommitStepMessage) {
        let mut prs = self.prs.lock();
        if prs.height != msg.height {
            return;
        }
        prs.proposal_block_parts_header = msg.block_parts_header.clone();
        prs.proposal_block_parts = Some(msg.block_parts.clone());
    }

    pub fn apply_proposal_pol_message(&self, msg: &ProposalPolMessage) {
        let mut prs = self.prs.lock();
        if prs.height != msg.height || prs.proposal_pol_round != msg.proposal_pol_round {
            return;
        }
        prs.proposal_pol = Some(msg.proposal_pol.clone());
    }

    pub fn apply_has_vote_message(&self, msg: &HasVoteMessage) {
        let mut prs = self.prs.lock();
        if prs.height != msg.height {
            return;
        }
        prs.set_has_vote(msg.height, msg.round, msg.vote_type, msg.index as usize);
    }

    /// Merge the peer's claimed votes. Bits we hold ourselves are replaced by
    /// the peer's answer, bits we lack are kept as they were.
    pub fn apply_vote_set_bits_message(&self, msg: &VoteSetBitsMessage, our_votes: Option<&BitArray>) {
        let mut prs = self.prs.lock();
        if let Some(votes) = prs.vote_bit_array(msg.height, msg.round, msg.vote_type) {
            let has_votes = match our_votes {
                None => msg.votes.clone(),
                Some(ours) => votes.sub(ours).or(&msg.votes),
            };
            votes.update(&has_votes);
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prs = self.prs.lock();
        write!(f, "PeerState{{{} {}/{}/{}}}", self.key, prs.height, prs.round, prs.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::{block_id, signed_vote, signers, validator_set, CHAIN_ID};
    use crate::types::VoteSet;
    use std::sync::Arc;

    fn step_msg(height: i64, round: i64, step: RoundStep, last_commit_round: i64) -> NewRoundStepMessage {
        NewRoundStepMessage {
            height,
            round,
            step,
            seconds_since_start_time: 0,
            last_commit_round,
        }
    }

    #[test]
    fn test_new_round_step_ignores_regressions() {
        let ps = PeerState::new("p");
        ps.apply_new_round_step_message(&step_msg(2, 1, RoundStep::Prevote, 0));
        ps.apply_new_round_step_message(&step_msg(2, 0, RoundStep::Commit, 0));
        let prs = ps.get_round_state();
        assert_eq!((prs.height, prs.round, prs.step), (2, 1, RoundStep::Prevote));
    }

    #[test]
    fn test_proposal_reset_on_new_round() {
        let ps = PeerState::new("p");
        ps.apply_new_round_step_message(&step_msg(1, 0, RoundStep::Propose, -1));
        let header = PartSetHeader { total: 3, hash: vec![1; 32] };
        ps.set_has_proposal(&Proposal::new(1, 0, header, -1, Default::default()));
        ps.set_has_proposal_block_part(1, 0, 2);

        let prs = ps.get_round_state();
        assert!(prs.proposal);
        assert_eq!(prs.proposal_block_parts.unwrap().true_indices(), vec![2]);

        ps.apply_new_round_step_message(&step_msg(1, 1, RoundStep::NewRound, -1));
        let prs = ps.get_round_state();
        assert!(!prs.proposal);
        assert!(prs.proposal_block_parts.is_none());
        assert_eq!(prs.proposal_pol_round, -1);
    }

    #[test]
    fn test_pick_vote_skips_votes_peer_has() {
        let keys = signers(4);
        let set = Arc::new(validator_set(&keys, 1));
        let votes = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Prevote, set.clone());
        for key in keys.iter().take(2) {
            votes.add_vote(&signed_vote(key, &set, 1, 0, VoteType::Prevote, block_id(1))).unwrap();
        }

        let ps = PeerState::new("p");
        ps.apply_new_round_step_message(&step_msg(1, 0, RoundStep::Prevote, -1));

        let mut sent = Vec::new();
        while let Some(vote) = ps.pick_vote_to_send(&votes) {
            ps.set_has_vote(&vote);
            sent.push(vote.validator_index);
        }
        sent.sort();
        assert_eq!(sent, vec![0, 1]);
    }

    #[test]
    fn test_precommits_shift_to_last_commit() {
        let ps = PeerState::new("p");
        ps.apply_new_round_step_message(&step_msg(1, 2, RoundStep::Precommit, -1));
        ps.ensure_vote_bit_arrays(1, 4);
        ps.apply_has_vote_message(&HasVoteMessage {
            height: 1,
            round: 2,
            vote_type: VoteType::Precommit,
            index: 3,
        });

        ps.apply_new_round_step_message(&step_msg(2, 0, RoundStep::NewHeight, 2));
        let bits = ps.get_vote_bit_array(1, 2, VoteType::Precommit).unwrap();
        assert_eq!(bits.true_indices(), vec![3]);
        assert!(ps.get_vote_bit_array(2, 0, VoteType::Prevote).is_none());
    }

    #[test]
    fn test_vote_set_bits_keeps_votes_we_lack() {
        let ps = PeerState::new("p");
        ps.apply_new_round_step_message(&step_msg(1, 0, RoundStep::Prevote, -1));
        ps.ensure_vote_bit_arrays(1, 4);
        ps.apply_has_vote_message(&HasVoteMessage {
            height: 1,
            round: 0,
            vote_type: VoteType::Prevote,
            index: 0,
        });

        let mut ours = BitArray::new(4);
        ours.set_index(0, true);
        ours.set_index(1, true);
        let mut claimed = BitArray::new(4);
        claimed.set_index(1, true);

        let msg = VoteSetBitsMessage {
            height: 1,
            round: 0,
            vote_type: VoteType::Prevote,
            block_id: block_id(1),
            votes: claimed,
        };
        ps.apply_vote_set_bits_message(&msg, Some(&ours));
        assert_eq!(ps.get_vote_bit_array(1, 0, VoteType::Prevote).unwrap().true_indices(), vec![1]);
    }
}
