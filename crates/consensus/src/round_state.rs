//! Round state of the consensus state machine

use crate::height_vote_set::HeightVoteSet;
use crate::types::{Block, PartSet, Proposal, ValidatorSet, VoteSet};
use borsh::{BorshDeserialize, BorshSerialize};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Steps of a round, in the order they are entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum RoundStep {
    /// Round 0 has not started yet
    NewHeight,
    NewRound,
    Propose,
    Prevote,
    /// Waiting for prevotes after +2/3 of any kind
    PrevoteWait,
    Precommit,
    /// Waiting for precommits after +2/3 of any kind
    PrecommitWait,
    Commit,
}

impl fmt::Display for RoundStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundStep::NewHeight => "NewHeight",
            RoundStep::NewRound => "NewRound",
            RoundStep::Propose => "Propose",
            RoundStep::Prevote => "Prevote",
            RoundStep::PrevoteWait => "PrevoteWait",
            RoundStep::Precommit => "Precommit",
            RoundStep::PrecommitWait => "PrecommitWait",
            RoundStep::Commit => "Commit",
        };
        write!(f, "{}", name)
    }
}

/// Lightweight (height, round, step) record used by events and the WAL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStateEvent {
    pub height: i64,
    pub round: i64,
    pub step: RoundStep,
}

/// Full round state.
/// Clones are snapshots: scalar fields are copied and the heavy fields are
/// shared behind `Arc`.
#[derive(Clone)]
pub struct RoundState {
    pub height: i64,
    pub round: i64,
    pub step: RoundStep,
    pub start_time: DateTime<Utc>,
    /// Set when +2/3 precommits for a block are seen
    pub commit_time: Option<DateTime<Utc>>,
    pub validators: Arc<ValidatorSet>,
    pub proposal: Option<Proposal>,
    pub proposal_block: Option<Arc<Block>>,
    pub proposal_block_parts: Option<Arc<PartSet>>,
    pub locked_round: i64,
    pub locked_block: Option<Arc<Block>>,
    pub locked_block_parts: Option<Arc<PartSet>>,
    pub votes: Arc<HeightVoteSet>,
    pub commit_round: i64,
    /// Precommits for the previous height
    pub last_commit: Option<Arc<VoteSet>>,
    pub last_validators: Arc<ValidatorSet>,
}

impl RoundState {
    pub fn event(&self) -> RoundStateEvent {
        RoundStateEvent {
            height: self.height,
            round: self.round,
            step: self.step,
        }
    }

    pub fn locked_block_hash(&self) -> Option<Vec<u8>> {
        self.locked_block.as_ref().map(|b| b.hash())
    }

    pub fn string_short(&self) -> String {
        format!(
            "RoundState{{H:{} R:{} S:{} ST:{}}}",
            self.height,
            self.round,
            self.step,
            self.start_time.format("%H:%M:%S%.3f")
        )
    }
}

impl fmt::Debug for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundState")
            .field("height", &self.height)
            .field("round", &self.round)
            .field("step", &self.step)
            .field("proposal", &self.proposal.as_ref().map(|p| p.to_string()))
            .field("locked_round", &self.locked_round)
            .field("locked_block", &self.locked_block_hash().map(|h| crate::types::block::short_hex(&h)))
            .field("commit_round", &self.commit_round)
            .field("votes", &self.votes)
            .finish()
    }
}

/// Lexicographic comparison of (height, round, step)
pub fn compare_hrs(h1: i64, r1: i64, s1: RoundStep, h2: i64, r2: i64, s2: RoundStep) -> std::cmp::Ordering {
    (h1, r1, s1).cmp(&(h2, r2, s2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_steps_are_ordered() {
        assert!(RoundStep::NewHeight < RoundStep::NewRound);
        assert!(RoundStep::Prevote < RoundStep::PrevoteWait);
        assert!(RoundStep::PrecommitWait < RoundStep::Commit);
    }

    #[test]
    fn test_compare_hrs() {
        use RoundStep::*;
        assert_eq!(compare_hrs(1, 0, Commit, 2, 0, NewHeight), Ordering::Less);
        assert_eq!(compare_hrs(2, 1, Propose, 2, 0, Commit), Ordering::Greater);
        assert_eq!(compare_hrs(2, 1, Propose, 2, 1, Propose), Ordering::Equal);
    }
}
