//! Validators and validator sets with proposer rotation

use crate::error::StateError;
use crate::types::block::{BlockId, Commit};
use crate::types::part_set::simple_hash_from_hashes;
use crate::types::vote::VoteType;
use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Address derived from an ed25519 public key
pub fn address_from_pub_key(pub_key: &[u8; 32]) -> Vec<u8> {
    blake3::hash(pub_key).as_bytes()[..20].to_vec()
}

/// Check an ed25519 signature over `msg`
pub fn verify_signature(pub_key: &[u8; 32], msg: &[u8], signature: &[u8]) -> bool {
    let key = match VerifyingKey::from_bytes(pub_key) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let sig = match Signature::from_slice(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    key.verify(msg, &sig).is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Validator {
    pub address: Vec<u8>,
    pub pub_key: [u8; 32],
    pub voting_power: i64,
    /// Proposer priority accumulator
    pub accum: i64,
}

impl Validator {
    pub fn new(pub_key: [u8; 32], voting_power: i64) -> Self {
        Self {
            address: address_from_pub_key(&pub_key),
            pub_key,
            voting_power,
            accum: 0,
        }
    }

    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> bool {
        verify_signature(&self.pub_key, msg, signature)
    }

    /// Higher accum wins, ties go to the lower address
    fn compare_accum(&self, other: &Validator) -> Ordering {
        self.accum
            .cmp(&other.accum)
            .then_with(|| other.address.cmp(&self.address))
    }

    fn hash(&self) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.address);
        hasher.update(&self.pub_key);
        hasher.update(&self.voting_power.to_le_bytes());
        hasher.finalize().as_bytes().to_vec()
    }
}

/// Validators sorted by address
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    proposer: Option<Validator>,
    total_voting_power: i64,
}

impl ValidatorSet {
    /// Build a set and pick the first proposer
    pub fn new(mut validators: Vec<Validator>) -> Self {
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        let total_voting_power = validators.iter().map(|v| v.voting_power).sum();
        let mut set = Self {
            validators,
            proposer: None,
            total_voting_power,
        };
        if !set.validators.is_empty() {
            set.increment_accum(1);
        }
        set
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn total_voting_power(&self) -> i64 {
        self.total_voting_power
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    pub fn get_by_address(&self, address: &[u8]) -> Option<(usize, &Validator)> {
        self.validators
            .binary_search_by(|v| v.address.as_slice().cmp(address))
            .ok()
            .map(|i| (i, &self.validators[i]))
    }

    pub fn has_address(&self, address: &[u8]) -> bool {
        self.get_by_address(address).is_some()
    }

    /// Current proposer, recomputed from the accumulators if unset
    pub fn proposer(&self) -> Option<&Validator> {
        match &self.proposer {
            Some(p) => Some(p),
            None => self
                .validators
                .iter()
                .max_by(|a, b| a.compare_accum(b)),
        }
    }

    /// Advance proposer rotation by `times` steps.
    /// Each step adds voting power to every accum, picks the highest
    /// accum as proposer and charges it the total power.
    pub fn increment_accum(&mut self, times: i64) {
        for _ in 0..times {
            for v in self.validators.iter_mut() {
                v.accum += v.voting_power;
            }
            let total = self.total_voting_power;
            if let Some(mostest) = self.validators.iter_mut().max_by(|a, b| a.compare_accum(b)) {
                self.proposer = Some(mostest.clone());
                mostest.accum -= total;
            }
        }
    }

    pub fn hash(&self) -> Vec<u8> {
        let hashes: Vec<Vec<u8>> = self.validators.iter().map(|v| v.hash()).collect();
        simple_hash_from_hashes(&hashes)
    }

    /// Check that `commit` carries +2/3 signed precommits for `block_id` at `height`
    pub fn verify_commit(&self, chain_id: &str, block_id: &BlockId, height: i64, commit: &Commit) -> Result<(), StateError> {
        if self.size() != commit.precommits.len() {
            return Err(StateError::InvalidCommit(format!(
                "wrong set size: {} vs {}",
                self.size(),
                commit.precommits.len()
            )));
        }
        let round = commit
            .precommits
            .iter()
            .flatten()
            .next()
            .map(|v| v.round)
            .unwrap_or(0);

        let mut tallied = 0i64;
        for (idx, precommit) in commit.precommits.iter().enumerate() {
            let precommit = match precommit {
                Some(p) => p,
                None => continue,
            };
            if precommit.height != height {
                return Err(StateError::InvalidCommit(format!("invalid height {}", precommit.height)));
            }
            if precommit.round != round {
                return Err(StateError::InvalidCommit(format!("invalid round {}", precommit.round)));
            }
            if precommit.vote_type != VoteType::Precommit {
                return Err(StateError::InvalidCommit(format!("invalid type at index {}", idx)));
            }
            let val = &self.validators[idx];
            if !val.verify(&precommit.sign_bytes(chain_id), &precommit.signature) {
                return Err(StateError::InvalidCommit(format!("invalid signature at index {}", idx)));
            }
            if &precommit.block_id != block_id {
                continue;
            }
            tallied += val.voting_power;
        }

        if tallied > self.total_voting_power * 2 / 3 {
            Ok(())
        } else {
            Err(StateError::InvalidCommit(format!(
                "insufficient voting power: got {}, needed more than {}",
                tallied,
                self.total_voting_power * 2 / 3
            )))
        }
    }
}
