//! Timeout ticker
//!
//! Owns at most one pending timeout. A newly scheduled timeout replaces the
//! pending one only if it is for a later height/round/step. Fired timeouts
//! are delivered on `chan()` and may be stale by the time they are read.

use crate::round_state::RoundStep;
use crate::service::Lifecycle;
use crossbeam_channel::{after, bounded, never, select, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::thread::JoinHandle;
use std::time::Duration;

const TICK_TOCK_BUFFER_SIZE: usize = 10;

/// A timeout for a height/round/step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: i64,
    pub round: i64,
    pub step: RoundStep,
}

impl TimeoutInfo {
    pub fn new(duration: Duration, height: i64, round: i64, step: RoundStep) -> Self {
        Self {
            duration,
            height,
            round,
            step,
        }
    }

    /// Whether `self` should not replace the pending `current`
    fn is_stale_against(&self, current: &TimeoutInfo) -> bool {
        if self.height != current.height {
            return self.height < current.height;
        }
        if self.round != current.round {
            return self.round < current.round;
        }
        // NewHeight timeouts can always be rescheduled
        current.step > RoundStep::NewHeight && self.step <= current.step
    }
}

impl std::fmt::Display for TimeoutInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ; {}/{} {}", self.duration, self.height, self.round, self.step)
    }
}

/// Schedules timeouts for the state machine
pub trait TimeoutTicker: Send + Sync {
    fn start(&self);

    fn stop(&self);

    /// Channel fired timeouts are delivered on
    fn chan(&self) -> Receiver<TimeoutInfo>;

    fn schedule_timeout(&self, ti: TimeoutInfo);
}

/// Ticker backed by a dedicated thread
pub struct ThreadTicker {
    tick_tx: Sender<TimeoutInfo>,
    tick_rx: Receiver<TimeoutInfo>,
    tock_tx: Sender<TimeoutInfo>,
    tock_rx: Receiver<TimeoutInfo>,
    lifecycle: Lifecycle,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadTicker {
    pub fn new() -> Self {
        let (tick_tx, tick_rx) = bounded(TICK_TOCK_BUFFER_SIZE);
        let (tock_tx, tock_rx) = bounded(TICK_TOCK_BUFFER_SIZE);
        Self {
            tick_tx,
            tick_rx,
            tock_tx,
            tock_rx,
            lifecycle: Lifecycle::new("TimeoutTicker"),
            handle: Mutex::new(None),
        }
    }
}

impl Default for ThreadTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutTicker for ThreadTicker {
    fn start(&self) {
        if !self.lifecycle.start() {
            return;
        }
        let tick_rx = self.tick_rx.clone();
        let tock_tx = self.tock_tx.clone();
        let quit = self.lifecycle.quit();
        let handle = std::thread::Builder::new()
            .name("timeout-ticker".to_string())
            .spawn(move || timeout_routine(tick_rx, tock_tx, quit));
        match handle {
            Ok(h) => *self.handle.lock() = Some(h),
            Err(e) => tracing::error!("Failed to spawn timeout ticker: {}", e),
        }
    }

    fn stop(&self) {
        if self.lifecycle.stop() {
            if let Some(h) = self.handle.lock().take() {
                let _ = h.join();
            }
        }
    }

    fn chan(&self) -> Receiver<TimeoutInfo> {
        self.tock_rx.clone()
    }

    fn schedule_timeout(&self, ti: TimeoutInfo) {
        if let Err(e) = self.tick_tx.send(ti) {
            tracing::warn!("Timeout ticker gone, dropping timeout {}", e.0);
        }
    }
}

fn timeout_routine(tick_rx: Receiver<TimeoutInfo>, tock_tx: Sender<TimeoutInfo>, quit: Receiver<()>) {
    let mut current: Option<TimeoutInfo> = None;
    let mut timer = never();

    loop {
        select! {
            recv(tick_rx) -> msg => {
                let new_ti = match msg {
                    Ok(ti) => ti,
                    Err(_) => return,
                };
                tracing::trace!("Received tick {}", new_ti);
                if let Some(cur) = &current {
                    if new_ti.is_stale_against(cur) {
                        continue;
                    }
                }
                timer = after(new_ti.duration);
                tracing::debug!("Scheduled timeout {}", new_ti);
                current = Some(new_ti);
            }
            recv(timer) -> _ => {
                timer = never();
                if let Some(ti) = current.clone() {
                    tracing::debug!("Timed out {}", ti);
                    // deliver off-thread so a full tock channel never blocks scheduling
                    let tx = tock_tx.clone();
                    std::thread::spawn(move || {
                        let _ = tx.send(ti);
                    });
                }
            }
            recv(quit) -> _ => return,
        }
    }
}
