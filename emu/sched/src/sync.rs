//! Guest synchronisation primitives.

use std::collections::VecDeque;

use crate::thread::ThreadId;

/// A recursive mutex with a FIFO wait queue.
///
/// Keyed by the guest address of the guest-side critical-section object;
/// the host keeps the real state here and never interprets the guest
/// bytes. Ownership is handed directly to the queue head on release — a
/// woken waiter never races for the lock.
#[derive(Debug, Default)]
pub struct CriticalSection {
    /// Current owner, `None` when free.
    pub owner: Option<ThreadId>,
    /// Recursive acquisition depth. Invariant: `depth > 0 ⇔ owner.is_some()`.
    pub recursion: u32,
    /// Threads queued for ownership, FIFO.
    pub waiters: VecDeque<ThreadId>,
    /// Number of times a thread found the section taken.
    pub contention: u32,
}

/// A binary event, manual- or auto-reset, with a FIFO of waiters.
///
/// Invariant for auto-reset events: `signaled` and a non-empty waiter
/// queue never coexist — a signal arriving with waiters present is
/// consumed on the spot.
#[derive(Debug)]
pub struct Event {
    /// `true`: signal persists until reset. `false`: a signal wakes (or is
    /// consumed by) exactly one waiter.
    pub manual_reset: bool,
    /// Current signal state.
    pub signaled: bool,
    /// Threads blocked on this event, FIFO.
    pub waiters: VecDeque<ThreadId>,
    /// Number of waits that had to block.
    pub contention: u32,
}

impl Event {
    pub(crate) fn new(manual_reset: bool, initial: bool) -> Self {
        Self {
            manual_reset,
            signaled: initial,
            waiters: VecDeque::new(),
            contention: 0,
        }
    }
}
