//! Block part sets with merkle proofs
//!
//! A serialized block is split into fixed-size parts. The part set header
//! carries the merkle root so parts received from peers can be verified
//! one by one before the whole block is available.

use crate::error::PartSetError;
use crate::types::bit_array::BitArray;
use crate::types::block::{Block, PartSetHeader};
use borsh::{BorshDeserialize, BorshSerialize};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

fn leaf_hash(data: &[u8]) -> Vec<u8> {
    blake3::hash(data).as_bytes().to_vec()
}

fn inner_hash(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().as_bytes().to_vec()
}

/// Merkle root of `hashes`, splitting at `(n + 1) / 2`
pub fn simple_hash_from_hashes(hashes: &[Vec<u8>]) -> Vec<u8> {
    match hashes.len() {
        0 => Vec::new(),
        1 => hashes[0].clone(),
        n => {
            let k = (n + 1) / 2;
            inner_hash(
                &simple_hash_from_hashes(&hashes[..k]),
                &simple_hash_from_hashes(&hashes[k..]),
            )
        }
    }
}

/// Root plus the aunts of every leaf, ordered from leaf to root
fn proofs_from_hashes(hashes: &[Vec<u8>]) -> (Vec<u8>, Vec<Vec<Vec<u8>>>) {
    match hashes.len() {
        0 => (Vec::new(), Vec::new()),
        1 => (hashes[0].clone(), vec![Vec::new()]),
        n => {
            let k = (n + 1) / 2;
            let (left_root, mut left) = proofs_from_hashes(&hashes[..k]);
            let (right_root, mut right) = proofs_from_hashes(&hashes[k..]);
            for aunts in left.iter_mut() {
                aunts.push(right_root.clone());
            }
            for aunts in right.iter_mut() {
                aunts.push(left_root.clone());
            }
            left.extend(right);
            (inner_hash(&left_root, &right_root), left)
        }
    }
}

fn compute_hash_from_aunts(index: usize, total: usize, leaf: &[u8], aunts: &[Vec<u8>]) -> Option<Vec<u8>> {
    if index >= total {
        return None;
    }
    match total {
        0 => None,
        1 => aunts.is_empty().then(|| leaf.to_vec()),
        _ => {
            let (last, rest) = aunts.split_last()?;
            let k = (total + 1) / 2;
            if index < k {
                let left = compute_hash_from_aunts(index, k, leaf, rest)?;
                Some(inner_hash(&left, last))
            } else {
                let right = compute_hash_from_aunts(index - k, total - k, leaf, rest)?;
                Some(inner_hash(last, &right))
            }
        }
    }
}

/// One chunk of a serialized block
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Part {
    pub index: u32,
    pub bytes: Vec<u8>,
    /// Merkle aunts from leaf to root
    pub proof: Vec<Vec<u8>>,
}

impl Part {
    pub fn hash(&self) -> Vec<u8> {
        leaf_hash(&self.bytes)
    }
}

struct PartSetInner {
    parts: Vec<Option<Part>>,
    parts_bit_array: BitArray,
    count: u32,
}

/// A possibly incomplete set of block parts.
/// Shared between the state machine and gossip, so it locks internally.
pub struct PartSet {
    total: u32,
    hash: Vec<u8>,
    inner: Mutex<PartSetInner>,
}

impl PartSet {
    /// Split `data` into a complete part set
    pub fn from_data(data: &[u8], part_size: usize) -> Self {
        let part_size = part_size.max(1);
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(part_size).collect()
        };
        let hashes: Vec<Vec<u8>> = chunks.iter().map(|c| leaf_hash(c)).collect();
        let (root, proofs) = proofs_from_hashes(&hashes);

        let total = chunks.len();
        let mut bit_array = BitArray::new(total);
        let parts = chunks
            .into_iter()
            .zip(proofs)
            .enumerate()
            .map(|(i, (bytes, proof))| {
                bit_array.set_index(i, true);
                Some(Part {
                    index: i as u32,
                    bytes: bytes.to_vec(),
                    proof,
                })
            })
            .collect();

        Self {
            total: total as u32,
            hash: root,
            inner: Mutex::new(PartSetInner {
                parts,
                parts_bit_array: bit_array,
                count: total as u32,
            }),
        }
    }

    /// Empty part set waiting for parts that match `header`
    pub fn from_header(header: &PartSetHeader) -> Self {
        let total = header.total as usize;
        Self {
            total: header.total,
            hash: header.hash.clone(),
            inner: Mutex::new(PartSetInner {
                parts: vec![None; total],
                parts_bit_array: BitArray::new(total),
                count: 0,
            }),
        }
    }

    pub fn header(&self) -> PartSetHeader {
        PartSetHeader {
            total: self.total,
            hash: self.hash.clone(),
        }
    }

    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        self.total == header.total && self.hash == header.hash
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn count(&self) -> u32 {
        self.inner.lock().count
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.total
    }

    pub fn bit_array(&self) -> BitArray {
        self.inner.lock().parts_bit_array.clone()
    }

    pub fn get_part(&self, index: usize) -> Option<Part> {
        self.inner.lock().parts.get(index).cloned().flatten()
    }

    /// Add a part, checking its merkle proof when `verify` is set.
    /// Returns false for a part we already hold.
    pub fn add_part(&self, part: Part, verify: bool) -> Result<bool, PartSetError> {
        let index = part.index as usize;
        if index >= self.total as usize {
            return Err(PartSetError::UnexpectedIndex(part.index));
        }

        let mut inner = self.inner.lock();
        if inner.parts[index].is_some() {
            return Ok(false);
        }

        if verify {
            let root = compute_hash_from_aunts(index, self.total as usize, &part.hash(), &part.proof);
            if root.as_deref() != Some(self.hash.as_slice()) {
                return Err(PartSetError::InvalidProof(part.index));
            }
        }

        inner.parts[index] = Some(part);
        inner.parts_bit_array.set_index(index, true);
        inner.count += 1;
        Ok(true)
    }

    /// Concatenate all parts and decode the block
    pub fn assemble_block(&self) -> Result<Block, PartSetError> {
        let inner = self.inner.lock();
        if inner.count != self.total {
            return Err(PartSetError::Incomplete {
                count: inner.count,
                total: self.total,
            });
        }
        let mut data = Vec::new();
        for part in inner.parts.iter().flatten() {
            data.extend_from_slice(&part.bytes);
        }
        Block::from_bytes(&data).map_err(|e| PartSetError::Decode(e.to_string()))
    }
}

impl std::fmt::Debug for PartSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PartSet{{{}/{} {}}}", self.count(), self.total, self.bit_array())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merkle_proofs_verify_every_leaf() {
        for n in 1..9usize {
            let hashes: Vec<Vec<u8>> = (0..n).map(|i| leaf_hash(&[i as u8])).collect();
            let (root, proofs) = proofs_from_hashes(&hashes);
            assert_eq!(root, simple_hash_from_hashes(&hashes));
            for (i, aunts) in proofs.iter().enumerate() {
                assert_eq!(compute_hash_from_aunts(i, n, &hashes[i], aunts), Some(root.clone()));
            }
        }
    }

    #[test]
    fn test_add_parts_from_header() {
        let data: Vec<u8> = (0..200u8).collect();
        let full = PartSet::from_data(&data, 50);
        assert_eq!(full.total(), 4);
        assert!(full.is_complete());

        let partial = PartSet::from_header(&full.header());
        assert!(partial.has_header(&full.header()));
        for i in (0..4).rev() {
            let added = partial.add_part(full.get_part(i).unwrap(), true).unwrap();
            assert!(added);
        }
        assert!(partial.is_complete());
        assert!(!partial.add_part(full.get_part(0).unwrap(), true).unwrap());
    }

    #[test]
    fn test_tampered_part_rejected() {
        let full = PartSet::from_data(&[9u8; 120], 40);
        let partial = PartSet::from_header(&full.header());
        let mut part = full.get_part(1).unwrap();
        part.bytes[0] ^= 0xff;
        assert!(matches!(partial.add_part(part.clone(), true), Err(PartSetError::InvalidProof(1))));
        // unverified parts are accepted as-is
        assert!(partial.add_part(part, false).unwrap());
    }

    #[test]
    fn test_out_of_range_index() {
        let full = PartSet::from_data(&[1u8; 10], 40);
        let partial = PartSet::from_header(&full.header());
        let mut part = full.get_part(0).unwrap();
        part.index = 5;
        assert!(matches!(partial.add_part(part, true), Err(PartSetError::UnexpectedIndex(5))));
    }
}
