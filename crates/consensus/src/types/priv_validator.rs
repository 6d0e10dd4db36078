//! Signing capability for votes and proposals

use crate::error::SignError;
use crate::types::validator::{address_from_pub_key, Validator};
use crate::types::vote::{Proposal, Vote, VoteType};
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::Mutex;

/// Anything that can sign on behalf of a validator
pub trait PrivValidator: Send + Sync {
    fn address(&self) -> Vec<u8>;

    fn pub_key(&self) -> [u8; 32];

    /// Fill in `vote.signature`
    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> Result<(), SignError>;

    /// Fill in `proposal.signature`
    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignError>;
}

const STEP_PROPOSE: u8 = 1;
const STEP_PREVOTE: u8 = 2;
const STEP_PRECOMMIT: u8 = 3;

fn vote_step(vote_type: VoteType) -> u8 {
    match vote_type {
        VoteType::Prevote => STEP_PREVOTE,
        VoteType::Precommit => STEP_PRECOMMIT,
    }
}

#[derive(Default)]
struct LastSigned {
    height: i64,
    round: i64,
    step: u8,
    sign_bytes: Vec<u8>,
    signature: Vec<u8>,
}

/// In-process ed25519 signer that refuses to sign conflicting data
/// for a height/round/step it already signed.
pub struct LocalSigner {
    key: SigningKey,
    address: Vec<u8>,
    last: Mutex<LastSigned>,
}

impl LocalSigner {
    pub fn new(key: SigningKey) -> Self {
        let address = address_from_pub_key(&key.verifying_key().to_bytes());
        Self {
            key,
            address,
            last: Mutex::new(LastSigned::default()),
        }
    }

    /// Deterministic signer, used by tests and devnets
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(&seed))
    }

    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut rand::rngs::OsRng))
    }

    /// Validator entry for this key
    pub fn validator(&self, voting_power: i64) -> Validator {
        Validator::new(self.pub_key(), voting_power)
    }

    #[cfg(test)]
    pub(crate) fn sign_unchecked(&self, msg: &[u8]) -> Vec<u8> {
        self.key.sign(msg).to_bytes().to_vec()
    }

    fn sign_checked(&self, height: i64, round: i64, step: u8, sign_bytes: Vec<u8>) -> Result<Vec<u8>, SignError> {
        let mut last = self.last.lock();
        let hrs = (height, round, step);
        let last_hrs = (last.height, last.round, last.step);

        if hrs < last_hrs {
            return Err(SignError::Regression { height, round, step });
        }
        if hrs == last_hrs && last.step != 0 {
            if last.sign_bytes == sign_bytes {
                return Ok(last.signature.clone());
            }
            return Err(SignError::Conflict { height, round, step });
        }

        let signature = self.key.sign(&sign_bytes).to_bytes().to_vec();
        *last = LastSigned {
            height,
            round,
            step,
            sign_bytes,
            signature: signature.clone(),
        };
        Ok(signature)
    }
}

impl PrivValidator for LocalSigner {
    fn address(&self) -> Vec<u8> {
        self.address.clone()
    }

    fn pub_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> Result<(), SignError> {
        let sign_bytes = vote.sign_bytes(chain_id);
        vote.signature = self.sign_checked(vote.height, vote.round, vote_step(vote.vote_type), sign_bytes)?;
        Ok(())
    }

    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignError> {
        let sign_bytes = proposal.sign_bytes(chain_id);
        proposal.signature = self.sign_checked(proposal.height, proposal.round, STEP_PROPOSE, sign_bytes)?;
        Ok(())
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocalSigner{{{}}}", crate::types::block::short_hex(&self.address))
    }
}
