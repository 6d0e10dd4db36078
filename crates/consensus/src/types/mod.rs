//! Core data types: blocks, parts, validators, votes

pub mod bit_array;
pub mod block;
pub mod evidence;
pub mod part_set;
pub mod priv_validator;
pub mod validator;
pub mod vote;
pub mod vote_set;

pub use bit_array::BitArray;
pub use block::{Block, BlockId, BlockMeta, Commit, Header, PartSetHeader, Tx};
pub use evidence::{BadVoteCollector, BadVoteEvidence, LoggingCollector, MemoryCollector};
pub use part_set::{Part, PartSet};
pub use priv_validator::{LocalSigner, PrivValidator};
pub use validator::{Validator, ValidatorSet};
pub use vote::{Proposal, Vote, VoteType};
pub use vote_set::{VoteSet, VoteSetReader};
