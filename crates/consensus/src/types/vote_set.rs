//! Votes for a single height, round and vote type
//!
//! Tracks cumulative voting power per block and overall. A block reaches a
//! majority only with strictly more than 2/3 of total power. Conflicting
//! votes are rejected unless a peer has claimed a majority for the block
//! they vote for, in which case they are still tallied under that block.

use crate::error::VoteError;
use crate::types::bit_array::BitArray;
use crate::types::block::{BlockId, Commit};
use crate::types::validator::ValidatorSet;
use crate::types::vote::{Vote, VoteType};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Read access shared by vote sets and stored commits, used by gossip
pub trait VoteSetReader {
    fn height(&self) -> i64;
    fn round(&self) -> i64;
    fn vote_type(&self) -> VoteType;
    fn size(&self) -> usize;
    fn bit_array(&self) -> BitArray;
    fn get_by_index(&self, index: usize) -> Option<Vote>;
    fn is_commit(&self) -> bool;
}

struct BlockVotes {
    peer_maj23: bool,
    bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: i64,
}

impl BlockVotes {
    fn new(peer_maj23: bool, size: usize) -> Self {
        Self {
            peer_maj23,
            bit_array: BitArray::new(size),
            votes: vec![None; size],
            sum: 0,
        }
    }

    fn add_verified_vote(&mut self, vote: Vote, voting_power: i64) {
        let idx = vote.validator_index as usize;
        if self.votes[idx].is_none() {
            self.bit_array.set_index(idx, true);
            self.votes[idx] = Some(vote);
            self.sum += voting_power;
        }
    }

    fn get_by_index(&self, idx: usize) -> Option<&Vote> {
        self.votes.get(idx).and_then(|v| v.as_ref())
    }
}

struct VoteSetInner {
    votes_bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: i64,
    maj23: Option<BlockId>,
    votes_by_block: HashMap<BlockId, BlockVotes>,
    peer_maj23s: HashMap<String, BlockId>,
}

impl VoteSetInner {
    fn get_vote(&self, idx: usize, block_id: &BlockId) -> Option<&Vote> {
        if let Some(existing) = self.votes[idx].as_ref() {
            if &existing.block_id == block_id {
                return Some(existing);
            }
        }
        self.votes_by_block
            .get(block_id)
            .and_then(|bv| bv.get_by_index(idx))
    }

    /// Returns whether the vote was added and the vote it conflicts with
    fn add_verified_vote(&mut self, vote: Vote, voting_power: i64, quorum: i64) -> (bool, Option<Vote>) {
        let idx = vote.validator_index as usize;
        let mut conflicting = None;

        match self.votes[idx].as_ref() {
            Some(existing) => {
                conflicting = Some(existing.clone());
                // Replace the vote if it is for the majority block
                if self.maj23.as_ref() == Some(&vote.block_id) {
                    self.votes[idx] = Some(vote.clone());
                    self.votes_bit_array.set_index(idx, true);
                }
            }
            None => {
                self.votes[idx] = Some(vote.clone());
                self.votes_bit_array.set_index(idx, true);
                self.sum += voting_power;
            }
        }

        if conflicting.is_some() {
            // Only blocks a peer claimed +2/3 for take conflicting votes
            let peer_claimed = self
                .votes_by_block
                .get(&vote.block_id)
                .map(|bv| bv.peer_maj23)
                .unwrap_or(false);
            if !peer_claimed {
                return (false, conflicting);
            }
        }

        let size = self.votes.len();
        let block_votes = self
            .votes_by_block
            .entry(vote.block_id.clone())
            .or_insert_with(|| BlockVotes::new(false, size));

        let orig_sum = block_votes.sum;
        let block_id = vote.block_id.clone();
        block_votes.add_verified_vote(vote, voting_power);

        // Only the first block to cross the quorum counts
        if orig_sum < quorum && quorum <= block_votes.sum && self.maj23.is_none() {
            let majority_votes: Vec<(usize, Vote)> = block_votes
                .votes
                .iter()
                .enumerate()
                .filter_map(|(i, v)| v.clone().map(|v| (i, v)))
                .collect();
            self.maj23 = Some(block_id);
            for (i, v) in majority_votes {
                self.votes[i] = Some(v);
            }
        }

        (true, conflicting)
    }
}

/// Votes for one (height, round, type)
pub struct VoteSet {
    chain_id: String,
    height: i64,
    round: i64,
    vote_type: VoteType,
    val_set: Arc<ValidatorSet>,
    inner: Mutex<VoteSetInner>,
}

impl VoteSet {
    pub fn new(chain_id: &str, height: i64, round: i64, vote_type: VoteType, val_set: Arc<ValidatorSet>) -> Self {
        let size = val_set.size();
        Self {
            chain_id: chain_id.to_string(),
            height,
            round,
            vote_type,
            val_set,
            inner: Mutex::new(VoteSetInner {
                votes_bit_array: BitArray::new(size),
                votes: vec![None; size],
                sum: 0,
                maj23: None,
                votes_by_block: HashMap::new(),
                peer_maj23s: HashMap::new(),
            }),
        }
    }

    fn quorum(&self) -> i64 {
        self.val_set.total_voting_power() * 2 / 3 + 1
    }

    /// Add a signed vote.
    /// Duplicates return `Ok(false)`; a second, different vote from the same
    /// validator returns `VoteError::ConflictingVotes` carrying both, and
    /// whether the second one was counted anyway.
    pub fn add_vote(&self, vote: &Vote) -> Result<bool, VoteError> {
        if vote.height != self.height || vote.round != self.round || vote.vote_type != self.vote_type {
            return Err(VoteError::UnexpectedStep {
                expected_height: self.height,
                expected_round: self.round,
                expected_type: self.vote_type,
                height: vote.height,
                round: vote.round,
                vote_type: vote.vote_type,
            });
        }

        let idx = vote.validator_index;
        let val = self
            .val_set
            .get_by_index(idx as usize)
            .ok_or(VoteError::InvalidValidatorIndex(idx))?;
        if val.address != vote.validator_address {
            return Err(VoteError::InvalidValidatorAddress);
        }

        let mut inner = self.inner.lock();

        if let Some(existing) = inner.get_vote(idx as usize, &vote.block_id) {
            if existing.signature == vote.signature {
                return Ok(false);
            }
            return Err(VoteError::NonDeterministicSignature);
        }

        if !val.verify(&vote.sign_bytes(&self.chain_id), &vote.signature) {
            return Err(VoteError::InvalidSignature);
        }

        let (added, conflicting) = inner.add_verified_vote(vote.clone(), val.voting_power, self.quorum());
        if let Some(existing) = conflicting {
            return Err(VoteError::ConflictingVotes {
                vote_a: Box::new(existing),
                vote_b: Box::new(vote.clone()),
                added,
            });
        }
        Ok(added)
    }

    /// Record a peer's claim that `block_id` has +2/3.
    /// Votes for it are then tallied even if they conflict.
    pub fn set_peer_maj23(&self, peer_key: &str, block_id: &BlockId) -> Result<(), VoteError> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.peer_maj23s.get(peer_key) {
            if existing == block_id {
                return Ok(());
            }
            return Err(VoteError::ConflictingPeerMaj23(peer_key.to_string()));
        }
        inner.peer_maj23s.insert(peer_key.to_string(), block_id.clone());

        let size = self.val_set.size();
        inner
            .votes_by_block
            .entry(block_id.clone())
            .and_modify(|bv| bv.peer_maj23 = true)
            .or_insert_with(|| BlockVotes::new(true, size));
        Ok(())
    }

    pub fn bit_array_by_block_id(&self, block_id: &BlockId) -> Option<BitArray> {
        self.inner
            .lock()
            .votes_by_block
            .get(block_id)
            .map(|bv| bv.bit_array.clone())
    }

    pub fn get_by_address(&self, address: &[u8]) -> Option<Vote> {
        let (idx, _) = self.val_set.get_by_address(address)?;
        self.inner.lock().votes[idx].clone()
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        self.inner.lock().maj23.is_some()
    }

    /// The block with +2/3, if any. A nil block id means +2/3 for nil.
    pub fn two_thirds_majority(&self) -> Option<BlockId> {
        self.inner.lock().maj23.clone()
    }

    pub fn has_two_thirds_any(&self) -> bool {
        self.inner.lock().sum > self.val_set.total_voting_power() * 2 / 3
    }

    pub fn has_all(&self) -> bool {
        self.inner.lock().sum == self.val_set.total_voting_power()
    }

    /// Commit made of the precommits for the majority block
    pub fn make_commit(&self) -> Option<Commit> {
        if self.vote_type != VoteType::Precommit {
            return None;
        }
        let inner = self.inner.lock();
        let maj23 = inner.maj23.clone()?;
        let votes = inner.votes_by_block.get(&maj23)?.votes.clone();
        Some(Commit::new(maj23, votes))
    }

    pub fn string_short(&self) -> String {
        let inner = self.inner.lock();
        format!(
            "VoteSet{{H:{} R:{} T:{} +2/3:{} {} peers:{}}}",
            self.height,
            self.round,
            self.vote_type,
            inner
                .maj23
                .as_ref()
                .map(|b| b.to_string())
                .unwrap_or_else(|| "-".to_string()),
            inner.votes_bit_array,
            inner.peer_maj23s.len()
        )
    }
}

impl VoteSetReader for VoteSet {
    fn height(&self) -> i64 {
        self.height
    }

    fn round(&self) -> i64 {
        self.round
    }

    fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    fn size(&self) -> usize {
        self.val_set.size()
    }

    fn bit_array(&self) -> BitArray {
        self.inner.lock().votes_bit_array.clone()
    }

    fn get_by_index(&self, index: usize) -> Option<Vote> {
        self.inner.lock().votes.get(index).cloned().flatten()
    }

    fn is_commit(&self) -> bool {
        self.vote_type == VoteType::Precommit && self.has_two_thirds_majority()
    }
}

impl std::fmt::Debug for VoteSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.string_short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::{block_id, signed_vote, signers, validator_set, CHAIN_ID};
    use crate::types::validator::Validator;

    fn prevotes(set: &Arc<ValidatorSet>) -> VoteSet {
        VoteSet::new(CHAIN_ID, 1, 0, VoteType::Prevote, set.clone())
    }

    #[test]
    fn test_exactly_two_thirds_is_not_majority() {
        let keys = signers(3);
        let set = Arc::new(validator_set(&keys, 1));
        let vs = prevotes(&set);
        let b = block_id(1);

        for key in keys.iter().take(2) {
            assert!(vs.add_vote(&signed_vote(key, &set, 1, 0, VoteType::Prevote, b.clone())).unwrap());
        }
        // 2 of 3 is exactly 2/3
        assert!(!vs.has_two_thirds_majority());
        assert!(!vs.has_two_thirds_any());

        vs.add_vote(&signed_vote(&keys[2], &set, 1, 0, VoteType::Prevote, b.clone())).unwrap();
        assert_eq!(vs.two_thirds_majority(), Some(b));
        assert!(vs.has_all());
    }

    #[test]
    fn test_majority_is_by_power_not_count() {
        let keys = signers(4);
        let vals: Vec<Validator> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| k.validator(if i == 0 { 10 } else { 1 }))
            .collect();
        let set = Arc::new(ValidatorSet::new(vals));
        let vs = prevotes(&set);
        let b = block_id(2);

        // power 10 of 13 is more than 2/3
        vs.add_vote(&signed_vote(&keys[0], &set, 1, 0, VoteType::Prevote, b.clone())).unwrap();
        assert_eq!(vs.two_thirds_majority(), Some(b));
    }

    #[test]
    fn test_two_thirds_any_without_majority() {
        let keys = signers(4);
        let set = Arc::new(validator_set(&keys, 1));
        let vs = prevotes(&set);

        vs.add_vote(&signed_vote(&keys[0], &set, 1, 0, VoteType::Prevote, block_id(1))).unwrap();
        vs.add_vote(&signed_vote(&keys[1], &set, 1, 0, VoteType::Prevote, block_id(2))).unwrap();
        vs.add_vote(&signed_vote(&keys[2], &set, 1, 0, VoteType::Prevote, BlockId::nil())).unwrap();
        assert!(vs.has_two_thirds_any());
        assert!(!vs.has_two_thirds_majority());
        assert!(!vs.has_all());
    }

    #[test]
    fn test_nil_majority() {
        let keys = signers(4);
        let set = Arc::new(validator_set(&keys, 1));
        let vs = prevotes(&set);
        for key in keys.iter().take(3) {
            vs.add_vote(&signed_vote(key, &set, 1, 0, VoteType::Prevote, BlockId::nil())).unwrap();
        }
        let maj = vs.two_thirds_majority().unwrap();
        assert!(maj.is_nil());
    }

    #[test]
    fn test_duplicate_vote_not_added() {
        let keys = signers(4);
        let set = Arc::new(validator_set(&keys, 1));
        let vs = prevotes(&set);
        let vote = signed_vote(&keys[0], &set, 1, 0, VoteType::Prevote, block_id(1));
        assert!(vs.add_vote(&vote).unwrap());
        assert!(!vs.add_vote(&vote).unwrap());
    }

    #[test]
    fn test_conflicting_precommit_carries_both_votes() {
        let keys = signers(4);
        let set = Arc::new(validator_set(&keys, 1));
        let vs = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Precommit, set.clone());

        let first = signed_vote(&keys[1], &set, 1, 0, VoteType::Precommit, block_id(1));
        let second = signed_vote(&keys[1], &set, 1, 0, VoteType::Precommit, block_id(2));
        assert!(vs.add_vote(&first).unwrap());

        match vs.add_vote(&second) {
            Err(VoteError::ConflictingVotes { vote_a, vote_b, added }) => {
                assert_eq!(*vote_a, first);
                assert_eq!(*vote_b, second);
                assert!(!added);
            }
            other => panic!("expected conflicting votes, got {:?}", other),
        }
        // the original vote stays in place
        assert_eq!(vs.get_by_address(&first.validator_address), Some(first));
    }

    #[test]
    fn test_conflicting_vote_tallied_for_peer_claimed_block() {
        let keys = signers(4);
        let set = Arc::new(validator_set(&keys, 1));
        let vs = prevotes(&set);
        let a = block_id(1);
        let b = block_id(2);

        vs.add_vote(&signed_vote(&keys[0], &set, 1, 0, VoteType::Prevote, a)).unwrap();
        vs.set_peer_maj23("peer", &b).unwrap();
        let conflicting = signed_vote(&keys[0], &set, 1, 0, VoteType::Prevote, b.clone());
        assert!(matches!(
            vs.add_vote(&conflicting),
            Err(VoteError::ConflictingVotes { added: true, .. })
        ));
        assert_eq!(vs.bit_array_by_block_id(&b).unwrap().count(), 1);
    }

    #[test]
    fn test_conflicting_peer_maj23_claim() {
        let keys = signers(4);
        let set = Arc::new(validator_set(&keys, 1));
        let vs = prevotes(&set);
        vs.set_peer_maj23("peer", &block_id(1)).unwrap();
        vs.set_peer_maj23("peer", &block_id(1)).unwrap();
        assert!(matches!(
            vs.set_peer_maj23("peer", &block_id(2)),
            Err(VoteError::ConflictingPeerMaj23(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_step_and_bad_signature() {
        let keys = signers(4);
        let set = Arc::new(validator_set(&keys, 1));
        let vs = prevotes(&set);

        let wrong_round = signed_vote(&keys[0], &set, 1, 1, VoteType::Prevote, block_id(1));
        assert!(matches!(vs.add_vote(&wrong_round), Err(VoteError::UnexpectedStep { .. })));

        let mut forged = signed_vote(&keys[0], &set, 1, 0, VoteType::Prevote, block_id(1));
        forged.signature[0] ^= 0xff;
        assert_eq!(vs.add_vote(&forged), Err(VoteError::InvalidSignature));

        let mut bad_index = signed_vote(&keys[0], &set, 1, 0, VoteType::Prevote, block_id(1));
        bad_index.validator_index = 9;
        assert_eq!(vs.add_vote(&bad_index), Err(VoteError::InvalidValidatorIndex(9)));
    }

    #[test]
    fn test_make_commit_contains_only_majority_votes() {
        let keys = signers(4);
        let set = Arc::new(validator_set(&keys, 1));
        let vs = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Precommit, set.clone());
        let b = block_id(7);
        for key in keys.iter().take(3) {
            vs.add_vote(&signed_vote(key, &set, 1, 0, VoteType::Precommit, b.clone())).unwrap();
        }
        vs.add_vote(&signed_vote(&keys[3], &set, 1, 0, VoteType::Precommit, BlockId::nil())).unwrap();

        let commit = vs.make_commit().unwrap();
        assert_eq!(commit.block_id, b);
        assert_eq!(commit.precommits.iter().flatten().count(), 3);
        assert!(set.verify_commit(CHAIN_ID, &b, 1, &commit).is_ok());
        assert!(vs.is_commit());
    }
}
