//! Start/stop lifecycle shared by the long-running services

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Start/stop bookkeeping plus the quit and done signals of a service.
///
/// Quit is signalled by dropping the quit sender, so every clone of
/// `quit()` observes a disconnect in `select!`. Async tasks watch
/// `cancel_token()` instead.
pub struct Lifecycle {
    name: &'static str,
    started: AtomicBool,
    stopped: AtomicBool,
    quit_tx: Mutex<Option<Sender<()>>>,
    quit_rx: Receiver<()>,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    cancel: CancellationToken,
}

impl Lifecycle {
    pub fn new(name: &'static str) -> Self {
        let (quit_tx, quit_rx) = bounded(0);
        let (done_tx, done_rx) = bounded(0);
        Self {
            name,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            quit_tx: Mutex::new(Some(quit_tx)),
            quit_rx,
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            cancel: CancellationToken::new(),
        }
    }

    /// Returns false if already started or stopped
    pub fn start(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            tracing::warn!("Not starting {}: already stopped", self.name);
            return false;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("Not starting {}: already started", self.name);
            return false;
        }
        tracing::info!("Starting {}", self.name);
        true
    }

    /// Signal quit. Returns false if already stopped.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::info!("Stopping {}", self.name);
        self.quit_tx.lock().take();
        self.cancel.cancel();
        true
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    /// Receiver that disconnects once `stop` is called
    pub fn quit(&self) -> Receiver<()> {
        self.quit_rx.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Called by the service's routine when it has finished
    pub fn mark_done(&self) {
        self.done_tx.lock().take();
    }

    /// Block until the routine calls `mark_done`
    pub fn wait(&self) {
        let _ = self.done_rx.recv();
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Lifecycle{{{} running:{}}}", self.name, self.is_running())
    }
}
