//! Error types for the consensus engine

use crate::types::vote::{Vote, VoteType};
use thiserror::Error;

/// Errors returned when adding votes to a vote set
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoteError {
    #[error("Invalid validator index {0}")]
    InvalidValidatorIndex(u32),

    #[error("Invalid validator address")]
    InvalidValidatorAddress,

    #[error("Unexpected step: expected {expected_height}/{expected_round}/{expected_type}, got {height}/{round}/{vote_type}")]
    UnexpectedStep {
        expected_height: i64,
        expected_round: i64,
        expected_type: VoteType,
        height: i64,
        round: i64,
        vote_type: VoteType,
    },

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Non-deterministic signature")]
    NonDeterministicSignature,

    /// `added` is set when the second vote was still tallied because a peer
    /// claimed +2/3 for its block
    #[error("Conflicting votes: {vote_a} vs {vote_b}")]
    ConflictingVotes {
        vote_a: Box<Vote>,
        vote_b: Box<Vote>,
        added: bool,
    },

    #[error("Peer {peer} giving votes from unwanted round {round}")]
    UnwantedRound { peer: String, round: i64 },

    #[error("Conflicting maj23 claim from peer {0}")]
    ConflictingPeerMaj23(String),
}

/// Errors from block part sets
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartSetError {
    #[error("Unexpected part index {0}")]
    UnexpectedIndex(u32),

    #[error("Invalid part count {total}, max {max}")]
    InvalidTotal { total: u32, max: u32 },

    #[error("Invalid merkle proof for part {0}")]
    InvalidProof(u32),

    #[error("Part set incomplete: {count}/{total}")]
    Incomplete { count: u32, total: u32 },

    #[error("Failed to decode block: {0}")]
    Decode(String),
}

/// Errors from block validation and execution
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Wrong chain id: expected {expected}, got {got}")]
    WrongChainId { expected: String, got: String },

    #[error("Wrong block height: expected {expected}, got {got}")]
    WrongHeight { expected: i64, got: i64 },

    #[error("Wrong last block id")]
    WrongLastBlockId,

    #[error("Wrong validators hash")]
    WrongValidatorsHash,

    #[error("Wrong app hash")]
    WrongAppHash,

    #[error("Wrong data hash or tx count")]
    WrongData,

    #[error("Wrong last commit hash")]
    WrongLastCommitHash,

    #[error("Invalid commit: {0}")]
    InvalidCommit(String),

    #[error("Application error: {0}")]
    App(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from block or state storage backends
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Storage error: {0}")]
pub struct StoreError(pub String);

/// Errors from the signing capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignError {
    #[error("Height/round/step regression at {height}/{round}/{step}")]
    Regression { height: i64, round: i64, step: u8 },

    #[error("Conflicting data at {height}/{round}/{step}")]
    Conflict { height: i64, round: i64, step: u8 },
}

/// Errors from the write-ahead log
#[derive(Error, Debug)]
pub enum WalError {
    #[error("WAL io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAL encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WAL should not contain height {0}")]
    UnexpectedHeight(i64),

    #[error("WAL does not contain height {0}")]
    MissingHeight(i64),
}

/// Errors decoding wire messages
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message too large: {0} bytes")]
    TooLarge(usize),

    #[error("Unknown message type {0:#04x}")]
    UnknownType(u8),

    #[error("Empty message")]
    Empty,

    #[error("Decode error: {0}")]
    Decode(#[from] borsh::io::Error),
}

/// Errors surfaced by the state machine while handling a message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Error invalid proposal signature")]
    InvalidProposalSignature,

    #[error("Error invalid proposal POL round")]
    InvalidProposalPolRound,

    #[error("Error adding vote")]
    AddingVote,

    #[error("Error vote height mismatch")]
    VoteHeightMismatch,

    #[error(transparent)]
    Vote(#[from] VoteError),

    #[error(transparent)]
    PartSet(#[from] PartSetError),
}

/// Errors from the startup handshake with the application
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Block store height {store} is below app height {app}")]
    AppAhead { store: i64, app: i64 },

    #[error("State height {state} inconsistent with block store height {store}")]
    StateMismatch { store: i64, state: i64 },

    #[error("App hash mismatch at height {height}")]
    AppHashMismatch { height: i64 },

    #[error("Missing block {0} in store")]
    MissingBlock(i64),

    #[error(transparent)]
    State(#[from] StateError),
}
