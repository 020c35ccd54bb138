//! # Liveness and Wakeup Signals
//!
//! [`Latch`] is a one-shot, monotonic "it's over" flag that any number of
//! threads can block on inside a `select!`: firing it drops the only sender of
//! a channel, so every receiver observes disconnection at once.
//!
//! [`ReadySignal`] is a bounded queue of wakeup hints. A hint carries no data;
//! if the queue is full a wakeup is already pending and the new one is
//! dropped.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

// ─── Latch ──────────────────────────────────────────────────────────────────

pub(crate) struct Latch {
    fired: AtomicBool,
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Latch {
            fired: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// Fire the latch. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Receiver that becomes ready (disconnected) once the latch fires.
    pub fn watch(&self) -> &Receiver<()> {
        &self.rx
    }
}

// ─── Ready Signal ───────────────────────────────────────────────────────────

pub(crate) struct ReadySignal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl ReadySignal {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        ReadySignal { tx, rx }
    }

    /// Post a wakeup hint without blocking.
    pub fn notify(&self) {
        // Full: a wakeup is already pending.
        let _ = self.tx.try_send(());
    }

    pub fn waiter(&self) -> &Receiver<()> {
        &self.rx
    }
}
