//! Prevotes and precommits for every round of one height
//!
//! Rounds up to the current round + 1 are always tracked. Votes for any
//! other round create it on demand, but each peer may only introduce two
//! such catch-up rounds.

use crate::error::VoteError;
use crate::fatal;
use crate::types::{BlockId, ValidatorSet, Vote, VoteSet, VoteType};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Catch-up rounds a single peer may introduce per height
pub const MAX_PEER_CATCHUP_ROUNDS: usize = 2;

#[derive(Clone)]
struct RoundVoteSet {
    prevotes: Arc<VoteSet>,
    precommits: Arc<VoteSet>,
}

struct Inner {
    height: i64,
    val_set: Arc<ValidatorSet>,
    round: i64,
    round_vote_sets: HashMap<i64, RoundVoteSet>,
    peer_catchup_rounds: HashMap<String, Vec<i64>>,
}

pub struct HeightVoteSet {
    chain_id: String,
    inner: Mutex<Inner>,
}

impl HeightVoteSet {
    pub fn new(chain_id: &str, height: i64, val_set: Arc<ValidatorSet>) -> Self {
        let hvs = Self {
            chain_id: chain_id.to_string(),
            inner: Mutex::new(Inner {
                height,
                val_set: val_set.clone(),
                round: 0,
                round_vote_sets: HashMap::new(),
                peer_catchup_rounds: HashMap::new(),
            }),
        };
        hvs.reset(height, val_set);
        hvs
    }

    pub fn reset(&self, height: i64, val_set: Arc<ValidatorSet>) {
        let mut inner = self.inner.lock();
        inner.height = height;
        inner.val_set = val_set;
        inner.round_vote_sets = HashMap::new();
        inner.peer_catchup_rounds = HashMap::new();
        self.add_round(&mut inner, 0);
        inner.round = 0;
    }

    pub fn height(&self) -> i64 {
        self.inner.lock().height
    }

    pub fn round(&self) -> i64 {
        self.inner.lock().round
    }

    /// Track every round up to `round`
    pub fn set_round(&self, round: i64) {
        let mut inner = self.inner.lock();
        if inner.round != 0 && round < inner.round + 1 {
            fatal!("set_round() must increment round: {} -> {}", inner.round, round);
        }
        for r in (inner.round + 1)..=round {
            // may exist already as a peer catch-up round
            if inner.round_vote_sets.contains_key(&r) {
                continue;
            }
            self.add_round(&mut inner, r);
        }
        inner.round = round;
    }

    fn add_round(&self, inner: &mut Inner, round: i64) {
        if inner.round_vote_sets.contains_key(&round) {
            fatal!("add_round() for an existing round {}", round);
        }
        let prevotes = VoteSet::new(&self.chain_id, inner.height, round, VoteType::Prevote, inner.val_set.clone());
        let precommits = VoteSet::new(&self.chain_id, inner.height, round, VoteType::Precommit, inner.val_set.clone());
        inner.round_vote_sets.insert(
            round,
            RoundVoteSet {
                prevotes: Arc::new(prevotes),
                precommits: Arc::new(precommits),
            },
        );
    }

    /// Add a vote; duplicates return `Ok(false)`.
    /// `peer_key` is empty for our own votes.
    pub fn add_vote(&self, vote: &Vote, peer_key: &str) -> Result<bool, VoteError> {
        let vote_set = {
            let mut inner = self.inner.lock();
            match Self::get_vote_set(&inner, vote.round, vote.vote_type) {
                Some(vs) => vs,
                None => {
                    let rounds = inner.peer_catchup_rounds.entry(peer_key.to_string()).or_default();
                    if rounds.len() >= MAX_PEER_CATCHUP_ROUNDS {
                        return Err(VoteError::UnwantedRound {
                            peer: peer_key.to_string(),
                            round: vote.round,
                        });
                    }
                    rounds.push(vote.round);
                    self.add_round(&mut inner, vote.round);
                    match Self::get_vote_set(&inner, vote.round, vote.vote_type) {
                        Some(vs) => vs,
                        None => fatal!("round {} missing right after add_round", vote.round),
                    }
                }
            }
        };
        vote_set.add_vote(vote)
    }

    pub fn prevotes(&self, round: i64) -> Option<Arc<VoteSet>> {
        Self::get_vote_set(&self.inner.lock(), round, VoteType::Prevote)
    }

    pub fn precommits(&self, round: i64) -> Option<Arc<VoteSet>> {
        Self::get_vote_set(&self.inner.lock(), round, VoteType::Precommit)
    }

    pub fn vote_set(&self, round: i64, vote_type: VoteType) -> Option<Arc<VoteSet>> {
        Self::get_vote_set(&self.inner.lock(), round, vote_type)
    }

    /// Last round with +2/3 prevotes for a block or nil, `-1` if none
    pub fn pol_info(&self) -> (i64, BlockId) {
        let inner = self.inner.lock();
        for r in (0..=inner.round).rev() {
            if let Some(rvs) = inner.round_vote_sets.get(&r) {
                if let Some(block_id) = rvs.prevotes.two_thirds_majority() {
                    return (r, block_id);
                }
            }
        }
        (-1, BlockId::nil())
    }

    /// Forward a peer's +2/3 claim to the matching vote set
    pub fn set_peer_maj23(&self, round: i64, vote_type: VoteType, peer_key: &str, block_id: &BlockId) -> Result<(), VoteError> {
        match self.vote_set(round, vote_type) {
            Some(vs) => vs.set_peer_maj23(peer_key, block_id),
            None => Ok(()),
        }
    }

    fn get_vote_set(inner: &Inner, round: i64, vote_type: VoteType) -> Option<Arc<VoteSet>> {
        inner.round_vote_sets.get(&round).map(|rvs| match vote_type {
            VoteType::Prevote => rvs.prevotes.clone(),
            VoteType::Precommit => rvs.precommits.clone(),
        })
    }

    pub fn string_short(&self) -> String {
        let inner = self.inner.lock();
        let mut rounds: Vec<_> = inner.round_vote_sets.keys().copied().collect();
        rounds.sort_unstable();
        let sets: Vec<String> = rounds
            .iter()
            .filter_map(|r| inner.round_vote_sets.get(r))
            .flat_map(|rvs| [rvs.prevotes.string_short(), rvs.precommits.string_short()])
            .collect();
        format!("HeightVoteSet{{H:{} R:0~{} {}}}", inner.height, inner.round, sets.join(" "))
    }
}

impl std::fmt::Debug for HeightVoteSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.string_short())
    }
}
