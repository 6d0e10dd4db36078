//! Consensus configuration and timeout parameters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Capacity of the self and peer message queues
pub const MSG_QUEUE_SIZE: usize = 1000;

/// Largest serialized block, in bytes (21MB)
pub const MAX_BLOCK_SIZE: usize = 22020096;

/// Configuration for a consensus node. All timeouts in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub chain_id: String,
    /// Wait this long for a proposal
    pub timeout_propose: u64,
    pub timeout_propose_delta: u64,
    /// After any +2/3 prevotes, wait this long for stragglers
    pub timeout_prevote: u64,
    pub timeout_prevote_delta: u64,
    /// After any +2/3 precommits, wait this long for stragglers
    pub timeout_precommit: u64,
    pub timeout_precommit_delta: u64,
    /// After a commit, wait this long before starting the next height
    pub timeout_commit: u64,
    /// Start the next height as soon as all precommits are in
    pub skip_timeout_commit: bool,
    /// Max transactions reaped into a block
    pub block_size: usize,
    /// Size of each block part in bytes
    pub block_part_size: usize,
    /// Largest serialized block in bytes. Bounds the part count peers may announce.
    pub max_block_size: usize,
    /// Directory holding the write-ahead log
    pub wal_dir: PathBuf,
    /// Only log our own messages, steps and timeouts
    pub wal_light: bool,
    /// Rotate the WAL head at the next height once it is this large
    pub wal_head_size_limit: u64,
    /// Drop the oldest WAL segments beyond this many bytes
    pub wal_total_size_limit: u64,
    pub msg_queue_size: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            chain_id: "bft-devnet".to_string(),
            timeout_propose: 3000,
            timeout_propose_delta: 500,
            timeout_prevote: 1000,
            timeout_prevote_delta: 500,
            timeout_precommit: 1000,
            timeout_precommit_delta: 500,
            timeout_commit: 1000,
            skip_timeout_commit: false,
            block_size: 5000,
            block_part_size: 65536,
            max_block_size: MAX_BLOCK_SIZE,
            wal_dir: PathBuf::from("./data/cs.wal"),
            wal_light: false,
            wal_head_size_limit: crate::wal::WAL_HEAD_SIZE_LIMIT,
            wal_total_size_limit: crate::wal::WAL_TOTAL_SIZE_LIMIT,
            msg_queue_size: MSG_QUEUE_SIZE,
        }
    }
}

impl ConsensusConfig {
    pub fn chain_id(mut self, chain_id: impl Into<String>) -> Self {
        self.chain_id = chain_id.into();
        self
    }

    pub fn wal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.wal_dir = dir.into();
        self
    }

    pub fn wal_light(mut self, light: bool) -> Self {
        self.wal_light = light;
        self
    }

    /// Set every step timeout at once, with deltas of half the base
    pub fn timeouts(mut self, propose: u64, vote: u64, commit: u64) -> Self {
        self.timeout_propose = propose;
        self.timeout_propose_delta = propose / 2;
        self.timeout_prevote = vote;
        self.timeout_prevote_delta = vote / 2;
        self.timeout_precommit = vote;
        self.timeout_precommit_delta = vote / 2;
        self.timeout_commit = commit;
        self
    }

    pub fn skip_timeout_commit(mut self, skip: bool) -> Self {
        self.skip_timeout_commit = skip;
        self
    }

    pub fn block_part_size(mut self, size: usize) -> Self {
        self.block_part_size = size;
        self
    }

    pub fn max_block_size(mut self, size: usize) -> Self {
        self.max_block_size = size;
        self
    }

    pub fn msg_queue_size(mut self, size: usize) -> Self {
        self.msg_queue_size = size;
        self
    }

    /// Most parts a block of at most `max_block_size` bytes splits into
    pub fn max_block_parts(&self) -> u32 {
        let part = self.block_part_size.max(1);
        let parts = (self.max_block_size + part - 1) / part;
        parts.min(u32::MAX as usize) as u32
    }

    pub fn timeout_params(&self) -> TimeoutParams {
        TimeoutParams {
            propose0: self.timeout_propose,
            propose_delta: self.timeout_propose_delta,
            prevote0: self.timeout_prevote,
            prevote_delta: self.timeout_prevote_delta,
            precommit0: self.timeout_precommit,
            precommit_delta: self.timeout_precommit_delta,
            commit0: self.timeout_commit,
            skip_timeout_commit: self.skip_timeout_commit,
        }
    }
}

/// Timeouts and per-round deltas for each step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutParams {
    pub propose0: u64,
    pub propose_delta: u64,
    pub prevote0: u64,
    pub prevote_delta: u64,
    pub precommit0: u64,
    pub precommit_delta: u64,
    pub commit0: u64,
    pub skip_timeout_commit: bool,
}

fn round_timeout(base: u64, delta: u64, round: i64) -> Duration {
    Duration::from_millis(base + delta * round.max(0) as u64)
}

impl TimeoutParams {
    pub fn propose(&self, round: i64) -> Duration {
        round_timeout(self.propose0, self.propose_delta, round)
    }

    pub fn prevote(&self, round: i64) -> Duration {
        round_timeout(self.prevote0, self.prevote_delta, round)
    }

    pub fn precommit(&self, round: i64) -> Duration {
        round_timeout(self.precommit0, self.precommit_delta, round)
    }

    /// When the next height should start, given the commit time
    pub fn commit(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        t + chrono::Duration::milliseconds(self.commit0 as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_grow_with_round() {
        let params = ConsensusConfig::default().timeout_params();
        assert_eq!(params.propose(0), Duration::from_millis(3000));
        assert_eq!(params.propose(2), Duration::from_millis(4000));
        assert_eq!(params.prevote(1), Duration::from_millis(1500));
        assert_eq!(params.precommit(3), Duration::from_millis(2500));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg: ConsensusConfig = serde_json::from_str(r#"{"chain_id":"x","wal_light":true}"#).unwrap();
        assert_eq!(cfg.chain_id, "x");
        assert!(cfg.wal_light);
        assert_eq!(cfg.timeout_commit, 1000);
        assert_eq!(cfg.msg_queue_size, MSG_QUEUE_SIZE);
    }

    #[test]
    fn test_builder_setters() {
        let cfg = ConsensusConfig::default()
            .chain_id("test")
            .wal_dir("/tmp/wal")
            .timeouts(100, 40, 0)
            .skip_timeout_commit(true);
        assert_eq!(cfg.chain_id, "test");
        assert_eq!(cfg.wal_dir, PathBuf::from("/tmp/wal"));
        assert_eq!(cfg.timeout_params().propose(1), Duration::from_millis(150));
        assert_eq!(cfg.timeout_params().precommit(0), Duration::from_millis(40));
        assert!(cfg.timeout_params().skip_timeout_commit);
    }

    #[test]
    fn test_max_block_parts_rounds_up() {
        assert_eq!(ConsensusConfig::default().max_block_parts(), 336);
        let cfg = ConsensusConfig::default().block_part_size(1000).max_block_size(2500);
        assert_eq!(cfg.max_block_parts(), 3);
    }
}
