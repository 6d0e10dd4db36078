//! Blocks, block identifiers and commits

use crate::error::PartSetError;
use crate::types::bit_array::BitArray;
use crate::types::part_set::{simple_hash_from_hashes, PartSet};
use crate::types::vote::{Vote, VoteType};
use crate::types::vote_set::VoteSetReader;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque application transaction
pub type Tx = Vec<u8>;

/// Header of a block's part set: number of parts and their merkle root
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: Vec<u8>,
}

impl PartSetHeader {
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash.is_empty()
    }

    /// Check an announced part count before sizing anything by it
    pub fn validate(&self, max_parts: u32) -> Result<(), PartSetError> {
        if self.total == 0 || self.total > max_parts {
            return Err(PartSetError::InvalidTotal {
                total: self.total,
                max: max_parts,
            });
        }
        Ok(())
    }
}

/// Identifies a block by header hash and part set header.
/// An empty hash is a vote for nil.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct BlockId {
    pub hash: Vec<u8>,
    pub parts_header: PartSetHeader,
}

impl BlockId {
    pub fn new(hash: Vec<u8>, parts_header: PartSetHeader) -> Self {
        Self { hash, parts_header }
    }

    pub fn nil() -> Self {
        Self::default()
    }

    pub fn is_nil(&self) -> bool {
        self.hash.is_empty()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            return write!(f, "<nil>");
        }
        write!(f, "{}:{}", short_hex(&self.hash), self.parts_header.total)
    }
}

/// Short hex prefix used in logs
pub fn short_hex(bytes: &[u8]) -> String {
    bytes.iter().take(6).map(|b| format!("{:02X}", b)).collect()
}

/// Block header
#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Header {
    pub chain_id: String,
    pub height: i64,
    /// Unix millis
    pub time: i64,
    pub num_txs: u64,
    pub last_block_id: BlockId,
    pub last_commit_hash: Vec<u8>,
    pub data_hash: Vec<u8>,
    pub validators_hash: Vec<u8>,
    /// App hash after executing the previous block
    pub app_hash: Vec<u8>,
    pub proposer_address: Vec<u8>,
}

impl Header {
    pub fn hash(&self) -> Vec<u8> {
        let bytes = borsh::to_vec(self).expect("Header serialization should not fail");
        blake3::hash(&bytes).as_bytes().to_vec()
    }
}

/// A full block
#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub txs: Vec<Tx>,
    pub last_commit: Commit,
}

impl Block {
    /// Assemble a block for `height` on top of the previous block
    #[allow(clippy::too_many_arguments)]
    pub fn make(
        chain_id: &str,
        height: i64,
        txs: Vec<Tx>,
        last_commit: Commit,
        last_block_id: BlockId,
        validators_hash: Vec<u8>,
        app_hash: Vec<u8>,
        proposer_address: Vec<u8>,
    ) -> Self {
        let header = Header {
            chain_id: chain_id.to_string(),
            height,
            time: chrono::Utc::now().timestamp_millis(),
            num_txs: txs.len() as u64,
            last_block_id,
            last_commit_hash: last_commit.hash(),
            data_hash: txs_hash(&txs),
            validators_hash,
            app_hash,
            proposer_address,
        };
        Self {
            header,
            txs,
            last_commit,
        }
    }

    /// Hash of the header, which commits to txs and last commit
    pub fn hash(&self) -> Vec<u8> {
        self.header.hash()
    }

    pub fn hashes_to(&self, hash: &[u8]) -> bool {
        !hash.is_empty() && self.hash() == hash
    }

    pub fn height(&self) -> i64 {
        self.header.height
    }

    /// Split the serialized block into parts of `part_size` bytes
    pub fn make_part_set(&self, part_size: usize) -> PartSet {
        PartSet::from_data(&self.to_bytes(), part_size)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("Block serialization should not fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

/// Merkle root over the hashes of `txs`
pub fn txs_hash(txs: &[Tx]) -> Vec<u8> {
    let hashes: Vec<Vec<u8>> = txs
        .iter()
        .map(|tx| blake3::hash(tx).as_bytes().to_vec())
        .collect();
    simple_hash_from_hashes(&hashes)
}

/// Block metadata kept alongside stored blocks
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct BlockMeta {
    pub block_id: BlockId,
    pub header: Header,
}

/// +2/3 precommits for a block, indexed by validator
#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Commit {
    pub block_id: BlockId,
    pub precommits: Vec<Option<Vote>>,
}

impl Commit {
    pub fn new(block_id: BlockId, precommits: Vec<Option<Vote>>) -> Self {
        Self {
            block_id,
            precommits,
        }
    }

    fn first_precommit(&self) -> Option<&Vote> {
        self.precommits.iter().flatten().next()
    }

    pub fn hash(&self) -> Vec<u8> {
        let hashes: Vec<Vec<u8>> = self
            .precommits
            .iter()
            .map(|p| {
                let bytes = borsh::to_vec(p).expect("Vote serialization should not fail");
                blake3::hash(&bytes).as_bytes().to_vec()
            })
            .collect();
        simple_hash_from_hashes(&hashes)
    }

    pub fn is_empty(&self) -> bool {
        self.precommits.is_empty()
    }
}

impl VoteSetReader for Commit {
    fn height(&self) -> i64 {
        self.first_precommit().map(|v| v.height).unwrap_or(0)
    }

    fn round(&self) -> i64 {
        self.first_precommit().map(|v| v.round).unwrap_or(-1)
    }

    fn vote_type(&self) -> VoteType {
        VoteType::Precommit
    }

    fn size(&self) -> usize {
        self.precommits.len()
    }

    fn bit_array(&self) -> BitArray {
        let mut ba = BitArray::new(self.precommits.len());
        for (i, p) in self.precommits.iter().enumerate() {
            ba.set_index(i, p.is_some());
        }
        ba
    }

    fn get_by_index(&self, index: usize) -> Option<Vote> {
        self.precommits.get(index).cloned().flatten()
    }

    fn is_commit(&self) -> bool {
        !self.precommits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nil_block_id() {
        assert!(BlockId::nil().is_nil());
        assert_eq!(BlockId::nil().to_string(), "<nil>");
    }

    #[test]
    fn test_block_hash_changes_with_txs() {
        let a = Block::make("test", 1, vec![b"a".to_vec()], Commit::default(), BlockId::nil(), vec![], vec![], vec![]);
        let mut b = a.clone();
        b.txs.push(b"b".to_vec());
        b.header.data_hash = txs_hash(&b.txs);
        assert_ne!(a.hash(), b.hash());
        assert!(a.hashes_to(&a.hash()));
        assert!(!a.hashes_to(&[]));
    }

    #[test]
    fn test_block_bytes_roundtrip_through_parts() {
        let block = Block::make("test", 3, vec![vec![7u8; 300]], Commit::default(), BlockId::nil(), vec![1], vec![2], vec![3]);
        let parts = block.make_part_set(64);
        assert!(parts.total() > 1);
        let assembled = parts.assemble_block().unwrap();
        assert_eq!(assembled, block);
    }
}
