//! The scheduler proper: ring, context switching, runnability.

use std::collections::HashMap;

use log::{debug, trace};
use muon_core::GuestAddr;
use muon_cpu::CpuRegs;
use muon_mm::{MemError, MemProt, MemoryManager};

use crate::sync::{CriticalSection, Event};
use crate::thread::{EventWait, Thread, ThreadId, DEFAULT_STACK_SIZE};
use crate::{BlockedOn, Millis};

/// Owns every guest thread and the guest-visible synchronisation objects.
///
/// The ring is a `Vec` in creation order with a `current` cursor;
/// [`switch`](Self::switch) advances the cursor one slot and loads that
/// thread's context. Threads are never destroyed — the process tears down
/// as a whole.
#[derive(Debug, Default)]
pub struct Scheduler {
    threads: Vec<Thread>,
    current: usize,
    next_id: u32,
    yielding: bool,
    /// Critical sections keyed by the guest address of the guest object.
    cs_table: HashMap<u32, CriticalSection>,
    /// Events keyed by handle.
    events: HashMap<u32, Event>,
    next_event_handle: u32,
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Threads
    // -----------------------------------------------------------------------

    /// Creates a thread with its own stack mapping. The first thread
    /// created is the main thread (id 0) and becomes current.
    ///
    /// A zero `stack_size` selects [`DEFAULT_STACK_SIZE`].
    ///
    /// # Errors
    ///
    /// Propagates stack allocation failure from the memory manager.
    pub fn spawn(
        &mut self,
        mm: &mut MemoryManager,
        entry: GuestAddr,
        arg: u32,
        priority: u8,
        stack_size: u32,
    ) -> Result<ThreadId, MemError> {
        let stack_size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };
        let stack_base = mm.static_alloc_anywhere(stack_size, MemProt::READ | MemProt::WRITE)?;

        let id = ThreadId(self.next_id);
        self.next_id += 1;
        debug!("spawn {id}: entry={entry} arg={arg:#x} priority={priority} stack={stack_base}");
        self.threads
            .push(Thread::new(id, entry, arg, priority, stack_base, stack_size));
        Ok(id)
    }

    /// Number of threads in the ring.
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Returns `true` if no thread exists yet.
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// The current thread.
    pub fn current(&self) -> &Thread {
        &self.threads[self.current]
    }

    /// Id of the current thread.
    pub fn current_id(&self) -> ThreadId {
        self.threads[self.current].id
    }

    /// Looks up a thread by id.
    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.iter().find(|t| t.id == id)
    }

    fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|t| t.id == id)
    }

    /// Loads the current thread's context into the core.
    pub fn load_current(&self, cpu: &mut dyn CpuRegs) {
        self.threads[self.current].load_state(cpu);
    }

    /// Saves the core into the current thread's context.
    ///
    /// Call only from inside an engine hook or between `start` calls; the
    /// saved pc encodes the live Thumb state in bit 0.
    pub fn save_current(&mut self, cpu: &mut dyn CpuRegs) {
        self.threads[self.current].save_state(cpu);
    }

    /// Advances the ring cursor to the next thread and loads its state.
    /// Returns the new current id.
    pub fn switch(&mut self, cpu: &mut dyn CpuRegs) -> ThreadId {
        if self.threads.len() > 1 {
            self.current = (self.current + 1) % self.threads.len();
            self.threads[self.current].load_state(cpu);
            trace!("switch -> {}", self.threads[self.current].id);
        }
        self.threads[self.current].id
    }

    /// Changes a thread's priority. Returns `false` for an unknown id.
    pub fn set_priority(&mut self, id: ThreadId, priority: u8) -> bool {
        match self.thread_mut(id) {
            Some(t) => {
                t.priority = priority;
                true
            }
            None => false,
        }
    }

    /// Puts the current thread to sleep for `ms` milliseconds.
    pub fn sleep_current(&mut self, now: Millis, ms: u32) {
        self.threads[self.current].sleeping_until = Some(now + Millis::from(ms));
    }

    /// Increments a thread's suspension counter.
    pub fn suspend(&mut self, id: ThreadId) -> bool {
        match self.thread_mut(id) {
            Some(t) => {
                t.suspend_count += 1;
                true
            }
            None => false,
        }
    }

    /// Decrements a thread's suspension counter; the thread becomes
    /// runnable again when it reaches zero. Pending waits are untouched.
    pub fn resume(&mut self, id: ThreadId) -> bool {
        match self.thread_mut(id) {
            Some(t) => {
                t.suspend_count = t.suspend_count.saturating_sub(1);
                true
            }
            None => false,
        }
    }

    /// Asks for a reschedule at the next block boundary.
    pub fn yield_current(&mut self) {
        self.yielding = true;
    }

    /// Consumes the pending yield request, if any.
    pub fn take_yield(&mut self) -> bool {
        core::mem::replace(&mut self.yielding, false)
    }

    // -----------------------------------------------------------------------
    // Runnability
    // -----------------------------------------------------------------------

    /// The runnability predicate, re-evaluated at every block boundary.
    ///
    /// Returns `None` when the current thread may run, clearing any
    /// condition that has just resolved (sleep expiry, granted critical
    /// section, signalled or timed-out event). Returns the blocking reason
    /// otherwise.
    pub fn can_run_current(&mut self, now: Millis) -> Option<BlockedOn> {
        let idx = self.current;

        if self.threads[idx].suspend_count > 0 {
            return Some(BlockedOn::Suspended);
        }

        if let Some(until) = self.threads[idx].sleeping_until {
            if until > now {
                return Some(BlockedOn::Sleeping);
            }
            self.threads[idx].sleeping_until = None;
        }

        if let Some(addr) = self.threads[idx].requested_cs {
            let me = self.threads[idx].id;
            let granted = self
                .cs_table
                .get(&addr.as_u32())
                .is_some_and(|cs| cs.owner == Some(me));
            if !granted {
                return Some(BlockedOn::CriticalSection);
            }
            // Leave handed us the section; complete the transfer.
            self.threads[idx].requested_cs = None;
            self.threads[idx].owned_cs.insert(addr.as_u32(), 1);
        }

        if let Some(wait) = self.threads[idx].waiting_event {
            let me = self.threads[idx].id;
            match self.events.get_mut(&wait.handle) {
                Some(ev) => {
                    if ev.signaled {
                        ev.waiters.retain(|&t| t != me);
                        if !ev.manual_reset {
                            ev.signaled = false;
                        }
                        self.threads[idx].waiting_event = None;
                    } else if wait.deadline.is_some_and(|d| now >= d) {
                        // Timed out.
                        ev.waiters.retain(|&t| t != me);
                        self.threads[idx].waiting_event = None;
                    } else {
                        return Some(BlockedOn::Event);
                    }
                }
                // The event vanished; don't wedge the thread.
                None => self.threads[idx].waiting_event = None,
            }
        }

        None
    }

    // -----------------------------------------------------------------------
    // Critical sections
    // -----------------------------------------------------------------------

    /// (Re-)initialises the critical section at `addr`.
    pub fn cs_init(&mut self, addr: GuestAddr) {
        self.cs_table
            .insert(addr.as_u32(), CriticalSection::default());
    }

    /// Acquires the critical section at `addr` for the current thread, or
    /// queues it FIFO. Never blocks the host; a queued thread fails the
    /// runnability predicate until ownership is handed over.
    pub fn cs_enter(&mut self, addr: GuestAddr) {
        let idx = self.current;
        let me = self.threads[idx].id;
        let key = addr.as_u32();
        let cs = self.cs_table.entry(key).or_default();

        if cs.owner == Some(me) {
            // Recursive re-entry.
            cs.recursion += 1;
            *self.threads[idx].owned_cs.entry(key).or_insert(0) += 1;
        } else if cs.owner.is_none() && cs.waiters.is_empty() {
            // Fast path: free and uncontended.
            cs.owner = Some(me);
            cs.recursion = 1;
            self.threads[idx].owned_cs.insert(key, 1);
        } else if self.threads[idx].requested_cs == Some(addr) {
            // Already queued; keep waiting.
        } else {
            cs.waiters.push_back(me);
            cs.contention += 1;
            self.threads[idx].requested_cs = Some(addr);
        }
    }

    /// Releases one level of the critical section at `addr`. When the
    /// current thread's depth reaches zero, ownership transfers directly
    /// to the queue head (if any) — no thundering herd.
    pub fn cs_leave(&mut self, addr: GuestAddr) {
        let idx = self.current;
        let key = addr.as_u32();

        let Some(depth) = self.threads[idx].owned_cs.get_mut(&key) else {
            // Release by a non-owner; guest bug, ignore.
            debug!("{} left critical section {addr} it does not own", self.threads[idx].id);
            return;
        };
        *depth -= 1;
        let released = *depth == 0;
        if released {
            self.threads[idx].owned_cs.remove(&key);
        }

        let Some(cs) = self.cs_table.get_mut(&key) else {
            return;
        };
        if cs.recursion > 0 {
            cs.recursion -= 1;
        }
        if !released {
            return;
        }

        if let Some(next) = cs.waiters.pop_front() {
            if cs.contention > 0 {
                cs.contention -= 1;
            }
            // Direct handoff; the waiter observes ownership in can_run.
            cs.owner = Some(next);
            cs.recursion = 1;
        } else {
            cs.owner = None;
            cs.recursion = 0;
        }
    }

    /// Read access to a critical section's state.
    pub fn cs(&self, addr: GuestAddr) -> Option<&CriticalSection> {
        self.cs_table.get(&addr.as_u32())
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Creates an event and returns its non-zero handle.
    pub fn event_create(&mut self, manual_reset: bool, initial: bool) -> u32 {
        self.next_event_handle += 1;
        let handle = self.next_event_handle;
        self.events.insert(handle, Event::new(manual_reset, initial));
        handle
    }

    /// Signals an event. Manual-reset: latch the signal and release every
    /// waiter. Auto-reset: wake exactly the queue head, consuming the
    /// signal; latch only if nobody waits. Returns `false` for a bad
    /// handle.
    pub fn event_set(&mut self, handle: u32) -> bool {
        let Some(ev) = self.events.get_mut(&handle) else {
            return false;
        };
        if ev.manual_reset {
            ev.signaled = true;
            let woken: Vec<ThreadId> = ev.waiters.drain(..).collect();
            ev.contention = ev.contention.saturating_sub(woken.len() as u32);
            for id in woken {
                self.clear_event_wait(id);
            }
        } else if let Some(next) = ev.waiters.pop_front() {
            ev.contention = ev.contention.saturating_sub(1);
            self.clear_event_wait(next);
        } else {
            ev.signaled = true;
        }
        true
    }

    /// Clears an event's signal; waiters are unaffected.
    pub fn event_reset(&mut self, handle: u32) -> bool {
        match self.events.get_mut(&handle) {
            Some(ev) => {
                ev.signaled = false;
                true
            }
            None => false,
        }
    }

    /// Waits on an event from the current thread.
    ///
    /// Already-signalled events return immediately (auto-reset consumes
    /// the signal). `timeout_ms == 0` polls; negative waits forever. An
    /// un-signalled wait queues the thread FIFO and records the deadline —
    /// the caller is expected to return to the guest, which then parks at
    /// the next block boundary.
    pub fn event_wait(&mut self, handle: u32, timeout_ms: i32, now: Millis) -> bool {
        let idx = self.current;
        let me = self.threads[idx].id;

        // Repeated wait on the same event is idempotent.
        if self.threads[idx]
            .waiting_event
            .is_some_and(|w| w.handle == handle)
        {
            return true;
        }

        let Some(ev) = self.events.get_mut(&handle) else {
            return false;
        };
        if ev.signaled {
            if !ev.manual_reset {
                ev.signaled = false;
            }
            return true;
        }
        if timeout_ms == 0 {
            // Poll only.
            return true;
        }

        ev.waiters.push_back(me);
        ev.contention += 1;
        self.threads[idx].waiting_event = Some(EventWait {
            handle,
            deadline: (timeout_ms > 0).then(|| now + timeout_ms as Millis),
        });
        true
    }

    /// Read access to an event's state.
    pub fn event(&self, handle: u32) -> Option<&Event> {
        self.events.get(&handle)
    }

    fn clear_event_wait(&mut self, id: ThreadId) {
        if let Some(t) = self.thread_mut(id) {
            t.waiting_event = None;
        }
    }
}
