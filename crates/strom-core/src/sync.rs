//! # Synchronization Primitives
//!
//! Single-waiter parking for registry entries.
//!
//! Every mapping and every task owns one [`WaitSlot`]. A thread that has to
//! block (teardown waiting for the last user, a caller waiting for task
//! completion) installs a [`Waiter`] while holding the entry's shard lock,
//! drops the lock, then parks on the matching [`ParkToken`]. Whoever brings
//! the entry to its terminal state takes the waiter out of the slot under
//! the same lock and wakes it.
//!
//! ```text
//!   waiter thread                         waking thread
//!   ─────────────                         ─────────────
//!   lock shard
//!   slot.install(waiter) ──► displaced?
//!   unlock shard
//!   token.park() ◄───────────────────── lock shard
//!        │                               w = slot.take()
//!        │                               unlock shard
//!        └──── woken ◄────────────────── w.wake()
//!   displaced.wake()
//! ```
//!
//! The slot holds one waiter. A second waiter displaces the first; the
//! displaced waiter is handed back to the newcomer, which wakes it once it
//! has been woken itself, so nobody sleeps forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

// =============================================================================
// WAITER / PARK TOKEN
// =============================================================================

/// Wake-up half of a parked thread
#[derive(Debug)]
pub struct Waiter {
    thread: Thread,
    woken: Arc<AtomicBool>,
}

/// Sleeping half of a parked thread
#[derive(Debug)]
pub struct ParkToken {
    woken: Arc<AtomicBool>,
}

/// Create a waiter/token pair bound to the current thread
pub fn current_waiter() -> (Waiter, ParkToken) {
    let woken = Arc::new(AtomicBool::new(false));
    (
        Waiter {
            thread: thread::current(),
            woken: woken.clone(),
        },
        ParkToken { woken },
    )
}

impl Waiter {
    /// Wake the parked thread
    pub fn wake(self) {
        self.woken.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

impl ParkToken {
    /// Block until the matching waiter is woken
    ///
    /// Wakes that happen before this call are not lost.
    pub fn park(self) {
        while !self.woken.load(Ordering::Acquire) {
            thread::park();
        }
    }

    /// Whether the matching waiter has already been woken
    pub fn is_woken(&self) -> bool {
        self.woken.load(Ordering::Acquire)
    }
}

/// Park on `token`, then pass the wake-up on to a displaced waiter
pub fn park_and_forward(token: ParkToken, displaced: Option<Waiter>) {
    token.park();
    if let Some(previous) = displaced {
        previous.wake();
    }
}

// =============================================================================
// WAIT SLOT
// =============================================================================

/// At most one parked waiter
#[derive(Debug, Default)]
pub struct WaitSlot {
    waiter: Option<Waiter>,
}

impl WaitSlot {
    /// Create an empty slot
    pub const fn new() -> Self {
        Self { waiter: None }
    }

    /// Install a waiter, returning the one it displaced
    pub fn install(&mut self, waiter: Waiter) -> Option<Waiter> {
        self.waiter.replace(waiter)
    }

    /// Remove the waiter, if any
    pub fn take(&mut self) -> Option<Waiter> {
        self.waiter.take()
    }

    /// Whether a waiter is installed
    pub fn is_occupied(&self) -> bool {
        self.waiter.is_some()
    }
}

// =============================================================================
// TESTS
// =============================================================================
