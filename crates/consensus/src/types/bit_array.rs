//! Fixed-size bit array used for vote and block-part bookkeeping

use borsh::{BorshDeserialize, BorshSerialize};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A bit array backed by 64-bit words.
/// Always holds exactly `ceil(bits / 64)` words, decoding included.
#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, Serialize, Deserialize)]
#[serde(try_from = "RawBitArray")]
pub struct BitArray {
    bits: usize,
    elems: Vec<u64>,
}

/// Decoded form, unchecked
#[derive(BorshDeserialize, Deserialize)]
struct RawBitArray {
    bits: usize,
    elems: Vec<u64>,
}

impl TryFrom<RawBitArray> for BitArray {
    type Error = String;

    fn try_from(raw: RawBitArray) -> Result<Self, Self::Error> {
        let words = raw.bits.div_ceil(64);
        if raw.elems.len() != words {
            return Err(format!(
                "bit array of {} bits needs {} words, got {}",
                raw.bits,
                words,
                raw.elems.len()
            ));
        }
        let mut ba = BitArray {
            bits: raw.bits,
            elems: raw.elems,
        };
        ba.clear_tail();
        Ok(ba)
    }
}

impl BorshDeserialize for BitArray {
    fn deserialize_reader<R: borsh::io::Read>(reader: &mut R) -> borsh::io::Result<Self> {
        let raw = RawBitArray::deserialize_reader(reader)?;
        BitArray::try_from(raw).map_err(|e| borsh::io::Error::new(borsh::io::ErrorKind::InvalidData, e))
    }
}

impl BitArray {
    /// Create an all-zero bit array with `bits` slots
    pub fn new(bits: usize) -> Self {
        Self {
            bits,
            elems: vec![0u64; bits.div_ceil(64)],
        }
    }

    pub fn size(&self) -> usize {
        self.bits
    }

    pub fn get_index(&self, i: usize) -> bool {
        if i >= self.bits {
            return false;
        }
        self.elems[i / 64] & (1u64 << (i % 64)) != 0
    }

    /// Set bit `i`, returns false when `i` is out of range
    pub fn set_index(&mut self, i: usize, v: bool) -> bool {
        if i >= self.bits {
            return false;
        }
        if v {
            self.elems[i / 64] |= 1u64 << (i % 64);
        } else {
            self.elems[i / 64] &= !(1u64 << (i % 64));
        }
        true
    }

    /// Union; the result is as large as the larger operand
    pub fn or(&self, other: &BitArray) -> BitArray {
        let mut c = BitArray::new(self.bits.max(other.bits));
        for (i, e) in c.elems.iter_mut().enumerate() {
            *e = self.elems.get(i).copied().unwrap_or(0) | other.elems.get(i).copied().unwrap_or(0);
        }
        c
    }

    /// Bits set in `self` and not in `other`
    pub fn sub(&self, other: &BitArray) -> BitArray {
        let mut c = self.clone();
        for (i, e) in c.elems.iter_mut().enumerate() {
            *e &= !other.elems.get(i).copied().unwrap_or(0);
        }
        c.clear_tail();
        c
    }

    pub fn not(&self) -> BitArray {
        let mut c = self.clone();
        for e in c.elems.iter_mut() {
            *e = !*e;
        }
        c.clear_tail();
        c
    }

    pub fn is_empty(&self) -> bool {
        self.elems.iter().all(|e| *e == 0)
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.bits
    }

    pub fn count(&self) -> usize {
        self.elems.iter().map(|e| e.count_ones() as usize).sum()
    }

    /// Indices of the set bits, in ascending order
    pub fn true_indices(&self) -> Vec<usize> {
        (0..self.bits).filter(|i| self.get_index(*i)).collect()
    }

    /// Pick a uniformly random set bit
    pub fn pick_random(&self) -> Option<usize> {
        let set = self.true_indices();
        if set.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..set.len());
        Some(set[idx])
    }

    /// Overwrite our bits with `other`'s, keeping our size
    pub fn update(&mut self, other: &BitArray) {
        for (i, e) in self.elems.iter_mut().enumerate() {
            *e = other.elems.get(i).copied().unwrap_or(0);
        }
        self.clear_tail();
    }

    fn clear_tail(&mut self) {
        let rem = self.bits % 64;
        if rem != 0 {
            if let Some(last) = self.elems.last_mut() {
                *last &= (1u64 << rem) - 1;
            }
        }
    }
}

impl fmt::Display for BitArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: String = (0..self.bits)
            .map(|i| if self.get_index(i) { 'x' } else { '_' })
            .collect();
        write!(f, "BA{{{}:{}}}", self.bits, s)
    }
}
