//! Consensus messages: queue items for the state machine and the
//! `{type, payload}` wire envelope used between peers

use crate::error::CodecError;
use crate::round_state::RoundStep;
use crate::types::{BitArray, BlockId, Part, PartSetHeader, Proposal, Vote, VoteType};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// Largest message accepted from a peer
pub const MAX_MSG_SIZE: usize = 1024 * 1024;

/// A message that can change consensus state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StateMessage {
    Proposal(Proposal),
    BlockPart { height: i64, round: i64, part: Part },
    Vote(Vote),
}

/// A state message plus the peer it came from, empty for ourselves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgInfo {
    pub msg: StateMessage,
    pub peer_key: String,
}

impl MsgInfo {
    pub fn new(msg: StateMessage, peer_key: &str) -> Self {
        Self {
            msg,
            peer_key: peer_key.to_string(),
        }
    }

    pub fn is_internal(&self) -> bool {
        self.peer_key.is_empty()
    }
}

/// Announces a peer's height, round and step
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NewRoundStepMessage {
    pub height: i64,
    pub round: i64,
    pub step: RoundStep,
    pub seconds_since_start_time: i64,
    pub last_commit_round: i64,
}

/// Sent on entering Commit so peers can send the committed block's parts
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CommitStepMessage {
    pub height: i64,
    pub block_parts_header: PartSetHeader,
    pub block_parts: BitArray,
}

/// Which validators prevoted in the proposal's POL round
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ProposalPolMessage {
    pub height: i64,
    pub proposal_pol_round: i64,
    pub proposal_pol: BitArray,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockPartMessage {
    pub height: i64,
    pub round: i64,
    pub part: Part,
}

/// Tells peers we hold a vote so they stop sending it
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct HasVoteMessage {
    pub height: i64,
    pub round: i64,
    pub vote_type: VoteType,
    pub index: u32,
}

/// Claims +2/3 for a block in a vote set
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VoteSetMaj23Message {
    pub height: i64,
    pub round: i64,
    pub vote_type: VoteType,
    pub block_id: BlockId,
}

/// Reply to a maj23 claim: the votes we hold for that block
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VoteSetBitsMessage {
    pub height: i64,
    pub round: i64,
    pub vote_type: VoteType,
    pub block_id: BlockId,
    pub votes: BitArray,
}

/// Every message exchanged by the consensus reactor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusMessage {
    NewRoundStep(NewRoundStepMessage),
    CommitStep(CommitStepMessage),
    Proposal(Proposal),
    ProposalPol(ProposalPolMessage),
    BlockPart(BlockPartMessage),
    Vote(Vote),
    HasVote(HasVoteMessage),
    VoteSetMaj23(VoteSetMaj23Message),
    VoteSetBits(VoteSetBitsMessage),
}

const MSG_NEW_ROUND_STEP: u8 = 0x01;
const MSG_COMMIT_STEP: u8 = 0x02;
const MSG_PROPOSAL: u8 = 0x11;
const MSG_PROPOSAL_POL: u8 = 0x12;
const MSG_BLOCK_PART: u8 = 0x13;
const MSG_VOTE: u8 = 0x14;
const MSG_HAS_VOTE: u8 = 0x15;
const MSG_VOTE_SET_MAJ23: u8 = 0x16;
const MSG_VOTE_SET_BITS: u8 = 0x17;

#[derive(BorshSerialize, BorshDeserialize)]
struct Envelope {
    kind: u8,
    payload: Vec<u8>,
}

fn payload<T: BorshSerialize>(value: &T) -> Vec<u8> {
    borsh::to_vec(value).expect("ConsensusMessage serialization should not fail")
}

impl ConsensusMessage {
    pub fn kind(&self) -> u8 {
        match self {
            ConsensusMessage::NewRoundStep(_) => MSG_NEW_ROUND_STEP,
            ConsensusMessage::CommitStep(_) => MSG_COMMIT_STEP,
            ConsensusMessage::Proposal(_) => MSG_PROPOSAL,
            ConsensusMessage::ProposalPol(_) => MSG_PROPOSAL_POL,
            ConsensusMessage::BlockPart(_) => MSG_BLOCK_PART,
            ConsensusMessage::Vote(_) => MSG_VOTE,
            ConsensusMessage::HasVote(_) => MSG_HAS_VOTE,
            ConsensusMessage::VoteSetMaj23(_) => MSG_VOTE_SET_MAJ23,
            ConsensusMessage::VoteSetBits(_) => MSG_VOTE_SET_BITS,
        }
    }

    /// Serialize into the wire envelope
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = match self {
            ConsensusMessage::NewRoundStep(m) => payload(m),
            ConsensusMessage::CommitStep(m) => payload(m),
            ConsensusMessage::Proposal(m) => payload(m),
            ConsensusMessage::ProposalPol(m) => payload(m),
            ConsensusMessage::BlockPart(m) => payload(m),
            ConsensusMessage::Vote(m) => payload(m),
            ConsensusMessage::HasVote(m) => payload(m),
            ConsensusMessage::VoteSetMaj23(m) => payload(m),
            ConsensusMessage::VoteSetBits(m) => payload(m),
        };
        payload_envelope(self.kind(), payload)
    }

    /// Parse a wire envelope, rejecting oversized input
    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        if data.is_empty() {
            return Err(CodecError::Empty);
        }
        if data.len() > MAX_MSG_SIZE {
            return Err(CodecError::TooLarge(data.len()));
        }
        let envelope: Envelope = borsh::from_slice(data)?;
        let p = envelope.payload.as_slice();
        let msg = match envelope.kind {
            MSG_NEW_ROUND_STEP => ConsensusMessage::NewRoundStep(borsh::from_slice(p)?),
            MSG_COMMIT_STEP => ConsensusMessage::CommitStep(borsh::from_slice(p)?),
            MSG_PROPOSAL => ConsensusMessage::Proposal(borsh::from_slice(p)?),
            MSG_PROPOSAL_POL => ConsensusMessage::ProposalPol(borsh::from_slice(p)?),
            MSG_BLOCK_PART => ConsensusMessage::BlockPart(borsh::from_slice(p)?),
            MSG_VOTE => ConsensusMessage::Vote(borsh::from_slice(p)?),
            MSG_HAS_VOTE => ConsensusMessage::HasVote(borsh::from_slice(p)?),
            MSG_VOTE_SET_MAJ23 => ConsensusMessage::VoteSetMaj23(borsh::from_slice(p)?),
            MSG_VOTE_SET_BITS => ConsensusMessage::VoteSetBits(borsh::from_slice(p)?),
            other => return Err(CodecError::UnknownType(other)),
        };
        Ok(msg)
    }
}

fn payload_envelope(kind: u8, payload: Vec<u8>) -> Vec<u8> {
    borsh::to_vec(&Envelope { kind, payload }).expect("Envelope serialization should not fail")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_carries_kind() {
        let msg = ConsensusMessage::HasVote(HasVoteMessage {
            height: 4,
            round: 1,
            vote_type: VoteType::Precommit,
            index: 2,
        });
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], MSG_HAS_VOTE);
        assert_eq!(ConsensusMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_unknown_and_oversized() {
        let bytes = payload_envelope(0x7f, vec![]);
        assert!(matches!(ConsensusMessage::from_bytes(&bytes), Err(CodecError::UnknownType(0x7f))));
        assert!(matches!(ConsensusMessage::from_bytes(&[]), Err(CodecError::Empty)));
        let huge = vec![0u8; MAX_MSG_SIZE + 1];
        assert!(matches!(ConsensusMessage::from_bytes(&huge), Err(CodecError::TooLarge(_))));
    }

    #[test]
    fn test_decode_rejects_mismatched_payload() {
        let bytes = payload_envelope(MSG_VOTE, vec![1, 2, 3]);
        assert!(matches!(ConsensusMessage::from_bytes(&bytes), Err(CodecError::Decode(_))));
    }

    /// Same layout as a bit array, without the word count check
    #[derive(BorshSerialize)]
    struct LooseBits {
        bits: u64,
        elems: Vec<u64>,
    }

    #[test]
    fn test_decode_rejects_bit_array_without_words() {
        #[derive(BorshSerialize)]
        struct LooseCommitStep {
            height: i64,
            block_parts_header: PartSetHeader,
            block_parts: LooseBits,
        }
        #[derive(BorshSerialize)]
        struct LooseProposalPol {
            height: i64,
            proposal_pol_round: i64,
            proposal_pol: LooseBits,
        }

        let commit_step = LooseCommitStep {
            height: 1,
            block_parts_header: PartSetHeader {
                total: 10,
                hash: vec![1; 32],
            },
            block_parts: LooseBits { bits: 10, elems: vec![] },
        };
        let bytes = payload_envelope(MSG_COMMIT_STEP, borsh::to_vec(&commit_step).unwrap());
        assert!(matches!(ConsensusMessage::from_bytes(&bytes), Err(CodecError::Decode(_))));

        let pol = LooseProposalPol {
            height: 1,
            proposal_pol_round: 0,
            proposal_pol: LooseBits {
                bits: 4,
                elems: vec![0, 0, 0],
            },
        };
        let bytes = payload_envelope(MSG_PROPOSAL_POL, borsh::to_vec(&pol).unwrap());
        assert!(matches!(ConsensusMessage::from_bytes(&bytes), Err(CodecError::Decode(_))));

        // well-formed arrays still decode
        let pol = LooseProposalPol {
            height: 1,
            proposal_pol_round: 0,
            proposal_pol: LooseBits {
                bits: 4,
                elems: vec![0b1010],
            },
        };
        let bytes = payload_envelope(MSG_PROPOSAL_POL, borsh::to_vec(&pol).unwrap());
        match ConsensusMessage::from_bytes(&bytes).unwrap() {
            ConsensusMessage::ProposalPol(m) => assert_eq!(m.proposal_pol.true_indices(), vec![1, 3]),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_msg_info_json_is_tagged() {
        let mi = MsgInfo::new(
            StateMessage::BlockPart {
                height: 1,
                round: 0,
                part: Part {
                    index: 0,
                    bytes: vec![1],
                    proof: vec![],
                },
            },
            "peer",
        );
        let json = serde_json::to_value(&mi).unwrap();
        assert_eq!(json["msg"]["type"], "block_part");
        assert!(!mi.is_internal());
    }
}
