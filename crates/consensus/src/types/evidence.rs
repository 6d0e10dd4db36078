//! Byzantine vote evidence and the collector it is handed to

use crate::types::vote::{Vote, VoteType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A misbehaving vote observed from a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadVoteEvidence {
    /// Key of the peer that relayed the vote
    pub peer_key: String,
    pub vote_type: VoteType,
    pub height: i64,
    pub round: i64,
    pub got: Vote,
    /// The vote `got` conflicts with, if any
    pub expected: Option<Vote>,
}

/// Receives evidence of bad votes
pub trait BadVoteCollector: Send + Sync {
    fn report_bad_vote(&self, evidence: BadVoteEvidence);
}

/// Collector that only logs
#[derive(Debug, Default)]
pub struct LoggingCollector;

impl BadVoteCollector for LoggingCollector {
    fn report_bad_vote(&self, evidence: BadVoteEvidence) {
        tracing::warn!(
            "Bad vote from peer {} at {}/{}: {} (expected {:?})",
            evidence.peer_key,
            evidence.height,
            evidence.round,
            evidence.got,
            evidence.expected.as_ref().map(|v| v.to_string())
        );
    }
}

/// Collector that keeps every report in memory
#[derive(Debug, Default)]
pub struct MemoryCollector {
    reports: Mutex<Vec<BadVoteEvidence>>,
}

impl MemoryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<BadVoteEvidence> {
        self.reports.lock().clone()
    }
}

impl BadVoteCollector for MemoryCollector {
    fn report_bad_vote(&self, evidence: BadVoteEvidence) {
        self.reports.lock().push(evidence);
    }
}
