//! BFT Consensus - round-based Byzantine agreement with crash recovery
//!
//! Architecture:
//! - `ConsensusState` runs propose/prevote/precommit/commit on one thread
//! - Every input is written to the WAL before it is handled
//! - `ConsensusReactor` gossips proposals, parts and votes to peers
//! - `Handshaker` replays stored blocks into the app after a crash

/// Log at error level, then panic. For broken invariants only.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        tracing::error!("{}", msg);
        panic!("{}", msg)
    }};
}

pub mod config;
pub mod consensus_state;
pub mod error;
pub mod events;
pub mod height_vote_set;
pub mod messages;
pub mod mock;
pub mod peer_state;
pub mod reactor;
pub mod replay;
pub mod round_state;
pub mod service;
pub mod state;
pub mod store;
pub mod ticker;
pub mod types;
pub mod wal;

#[cfg(test)]
mod tests;

pub use config::{ConsensusConfig, TimeoutParams};
pub use consensus_state::{Collaborators, ConsensusState};
pub use error::{ConsensusError, HandshakeError, StateError, StoreError, VoteError, WalError};
pub use events::{new_round_hook, ConsensusEvent, EventBus, NewRoundHook, NewRoundHookHandle};
pub use height_vote_set::HeightVoteSet;
pub use messages::{ConsensusMessage, MsgInfo, StateMessage};
pub use peer_state::{PeerRoundState, PeerState};
pub use reactor::{ConsensusReactor, Peer};
pub use replay::Handshaker;
pub use round_state::{RoundState, RoundStateEvent, RoundStep};
pub use state::{AppInfo, Application, State, StateStore};
pub use store::{BlockStore, Mempool};
pub use ticker::{ThreadTicker, TimeoutInfo, TimeoutTicker};
pub use types::*;
pub use wal::Wal;
