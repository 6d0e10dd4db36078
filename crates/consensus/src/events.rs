//! Events fired by the state machine and the hooks plugins attach to

use crate::round_state::{RoundState, RoundStateEvent};
use crate::types::{Block, Header, Vote};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Buffered events per subscriber before it starts lagging
pub const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// Every step transition, with a snapshot of the round state
    NewRoundStep(Arc<RoundState>),
    NewRound(RoundStateEvent),
    CompleteProposal(RoundStateEvent),
    Polka(RoundStateEvent),
    Lock(RoundStateEvent),
    Relock(RoundStateEvent),
    Unlock(RoundStateEvent),
    TimeoutPropose(RoundStateEvent),
    TimeoutWait(RoundStateEvent),
    /// A vote was added to our vote sets
    Vote(Vote),
    NewBlock(Arc<Block>),
    NewBlockHeader(Header),
    /// We prevoted; `block` is None for nil
    PrevoteHook {
        height: i64,
        round: i64,
        block: Option<Arc<Block>>,
    },
    /// We precommitted; `block` is None for nil
    PrecommitHook {
        height: i64,
        round: i64,
        block: Option<Arc<Block>>,
    },
}

impl ConsensusEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConsensusEvent::NewRoundStep(_) => "NewRoundStep",
            ConsensusEvent::NewRound(_) => "NewRound",
            ConsensusEvent::CompleteProposal(_) => "CompleteProposal",
            ConsensusEvent::Polka(_) => "Polka",
            ConsensusEvent::Lock(_) => "Lock",
            ConsensusEvent::Relock(_) => "Relock",
            ConsensusEvent::Unlock(_) => "Unlock",
            ConsensusEvent::TimeoutPropose(_) => "TimeoutPropose",
            ConsensusEvent::TimeoutWait(_) => "TimeoutWait",
            ConsensusEvent::Vote(_) => "Vote",
            ConsensusEvent::NewBlock(_) => "NewBlock",
            ConsensusEvent::NewBlockHeader(_) => "NewBlockHeader",
            ConsensusEvent::PrevoteHook { .. } => "PrevoteHook",
            ConsensusEvent::PrecommitHook { .. } => "PrecommitHook",
        }
    }
}

/// Fan-out of consensus events to any number of subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConsensusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers. Without subscribers the event is dropped.
    pub fn publish(&self, event: ConsensusEvent) {
        tracing::trace!("Firing event {}", event.name());
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}

/// State machine side of the new-round hook.
/// `round_trip` blocks until the plugin answers or drops its handle.
pub struct NewRoundHook {
    requests: Sender<RoundStateEvent>,
    responses: Receiver<()>,
}

/// Plugin side of the new-round hook
pub struct NewRoundHookHandle {
    pub requests: Receiver<RoundStateEvent>,
    responses: Sender<()>,
}

pub fn new_round_hook() -> (NewRoundHook, NewRoundHookHandle) {
    let (req_tx, req_rx) = bounded(1);
    let (resp_tx, resp_rx) = bounded(1);
    (
        NewRoundHook {
            requests: req_tx,
            responses: resp_rx,
        },
        NewRoundHookHandle {
            requests: req_rx,
            responses: resp_tx,
        },
    )
}

impl NewRoundHook {
    pub fn round_trip(&self, event: RoundStateEvent) {
        if self.requests.send(event).is_err() {
            return;
        }
        if self.responses.recv().is_err() {
            tracing::warn!("New round hook dropped without answering");
        }
    }
}

impl NewRoundHookHandle {
    /// Let the state machine continue into Propose
    pub fn respond(&self) {
        let _ = self.responses.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round_state::RoundStep;

    fn rse(round: i64) -> RoundStateEvent {
        RoundStateEvent {
            height: 1,
            round,
            step: RoundStep::NewRound,
        }
    }

    #[test]
    fn test_bus_fans_out() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(ConsensusEvent::Polka(rse(0)));
        assert_eq!(a.try_recv().unwrap().name(), "Polka");
        assert_eq!(b.try_recv().unwrap().name(), "Polka");
    }

    #[test]
    fn test_new_round_hook_blocks_until_answer() {
        let (hook, handle) = new_round_hook();
        let plugin = std::thread::spawn(move || {
            let ev = handle.requests.recv().unwrap();
            handle.respond();
            ev.round
        });
        hook.round_trip(rse(3));
        assert_eq!(plugin.join().unwrap(), 3);
    }

    #[test]
    fn test_new_round_hook_survives_dropped_plugin() {
        let (hook, handle) = new_round_hook();
        drop(handle);
        hook.round_trip(rse(0));
    }
}
