//! Votes and proposals

use crate::types::block::{BlockId, PartSetHeader};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two voting phases of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => write!(f, "Prevote"),
            VoteType::Precommit => write!(f, "Precommit"),
        }
    }
}

#[derive(BorshSerialize)]
struct VoteSignBytes<'a> {
    chain_id: &'a str,
    height: i64,
    round: i64,
    vote_type: VoteType,
    block_id: &'a BlockId,
}

/// A signed prevote or precommit
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Vote {
    pub validator_address: Vec<u8>,
    pub validator_index: u32,
    pub height: i64,
    pub round: i64,
    pub vote_type: VoteType,
    pub block_id: BlockId,
    pub signature: Vec<u8>,
}

impl Vote {
    /// Bytes covered by the signature
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        borsh::to_vec(&VoteSignBytes {
            chain_id,
            height: self.height,
            round: self.round,
            vote_type: self.vote_type,
            block_id: &self.block_id,
        })
        .expect("Vote sign bytes serialization should not fail")
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vote{{{}:{} {}/{:02}/{} {}}}",
            self.validator_index,
            crate::types::block::short_hex(&self.validator_address),
            self.height,
            self.round,
            self.vote_type,
            self.block_id
        )
    }
}

#[derive(BorshSerialize)]
struct ProposalSignBytes<'a> {
    chain_id: &'a str,
    height: i64,
    round: i64,
    block_parts_header: &'a PartSetHeader,
    pol_round: i64,
    pol_block_id: &'a BlockId,
}

/// A proposer's signed announcement of the block for a round
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Proposal {
    pub height: i64,
    pub round: i64,
    pub block_parts_header: PartSetHeader,
    /// -1 if there is no proof-of-lock round
    pub pol_round: i64,
    pub pol_block_id: BlockId,
    pub signature: Vec<u8>,
}

impl Proposal {
    pub fn new(height: i64, round: i64, block_parts_header: PartSetHeader, pol_round: i64, pol_block_id: BlockId) -> Self {
        Self {
            height,
            round,
            block_parts_header,
            pol_round,
            pol_block_id,
            signature: Vec::new(),
        }
    }

    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        borsh::to_vec(&ProposalSignBytes {
            chain_id,
            height: self.height,
            round: self.round,
            block_parts_header: &self.block_parts_header,
            pol_round: self.pol_round,
            pol_block_id: &self.pol_block_id,
        })
        .expect("Proposal sign bytes serialization should not fail")
    }
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Proposal{{{}/{} {}:{} ({},{})}}",
            self.height,
            self.round,
            self.block_parts_header.total,
            crate::types::block::short_hex(&self.block_parts_header.hash),
            self.pol_round,
            self.pol_block_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(round: i64) -> Vote {
        Vote {
            validator_address: vec![1; 20],
            validator_index: 0,
            height: 1,
            round,
            vote_type: VoteType::Prevote,
            block_id: BlockId::nil(),
            signature: Vec::new(),
        }
    }

    #[test]
    fn test_sign_bytes_exclude_signature() {
        let mut a = vote(0);
        let b = vote(0);
        a.signature = vec![1, 2, 3];
        assert_eq!(a.sign_bytes("chain"), b.sign_bytes("chain"));
    }

    #[test]
    fn test_sign_bytes_bind_chain_and_round() {
        assert_ne!(vote(0).sign_bytes("a"), vote(0).sign_bytes("b"));
        assert_ne!(vote(0).sign_bytes("a"), vote(1).sign_bytes("a"));
    }

    #[test]
    fn test_vote_type_order() {
        assert!(VoteType::Prevote < VoteType::Precommit);
    }
}
