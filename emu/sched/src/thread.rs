//! Guest threads.

use std::collections::HashMap;

use core::fmt;

use muon_core::GuestAddr;
use muon_cpu::{CpuContext, CpuRegs, Reg};

use crate::Millis;

/// Reserved, never-mapped address used as the link register of fresh
/// threads. A jump there means the thread's entry function returned.
pub const THREAD_EXIT: GuestAddr = GuestAddr::new(0xFFF0_0000);

/// Default guest stack size when the creator passes zero.
pub const DEFAULT_STACK_SIZE: u32 = 0x2000;

/// Default thread priority.
pub const THREAD_PRIORITY_NORMAL: u8 = 100;

/// Time quantum of the main thread, in milliseconds.
const MAIN_QUANTUM: Millis = 4000;

/// Quantum base for non-main threads; the priority is subtracted.
const QUANTUM_BASE: Millis = 400;

/// Monotonic thread identifier. Id 0 is the main thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread {}", self.0)
    }
}

/// An event wait in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EventWait {
    /// Handle of the awaited event.
    pub handle: u32,
    /// Absolute timeout, `None` for an infinite wait.
    pub deadline: Option<Millis>,
}

/// One guest thread: saved core context plus scheduling state.
#[derive(Debug)]
pub struct Thread {
    pub(crate) id: ThreadId,
    /// Saved register file + Thumb state.
    pub(crate) ctx: CpuContext,
    /// Fresh threads start from their initial register values and have no
    /// earlier engine context to restore.
    pub(crate) is_new: bool,
    pub(crate) priority: u8,
    pub(crate) stack_base: GuestAddr,
    pub(crate) stack_size: u32,
    /// Nested suspension counter; runnable only at zero.
    pub(crate) suspend_count: u32,
    /// Absolute wake time while sleeping.
    pub(crate) sleeping_until: Option<Millis>,
    /// In-progress event wait.
    pub(crate) waiting_event: Option<EventWait>,
    /// Critical section this thread is queued on (by guest address).
    pub(crate) requested_cs: Option<GuestAddr>,
    /// Owned critical sections with per-thread recursion depth.
    pub(crate) owned_cs: HashMap<u32, u32>,
}

impl Thread {
    pub(crate) fn new(
        id: ThreadId,
        entry: GuestAddr,
        arg: u32,
        priority: u8,
        stack_base: GuestAddr,
        stack_size: u32,
    ) -> Self {
        let mut ctx = CpuContext::zeroed();
        ctx.file[Reg::R0.index()] = arg;
        ctx.file[Reg::Sp.index()] = (stack_base + stack_size).as_u32();
        ctx.file[Reg::Lr.index()] = THREAD_EXIT.as_u32();
        ctx.file[Reg::Pc.index()] = entry.code_base().as_u32();
        ctx.thumb = entry.is_thumb();
        Self {
            id,
            ctx,
            is_new: true,
            priority,
            stack_base,
            stack_size,
            suspend_count: 0,
            sleeping_until: None,
            waiting_event: None,
            requested_cs: None,
            owned_cs: HashMap::new(),
        }
    }

    /// Thread id.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Current priority (0–255; lower priorities earn longer quanta).
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Base of this thread's stack mapping.
    pub fn stack_base(&self) -> GuestAddr {
        self.stack_base
    }

    /// Size of this thread's stack mapping.
    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    /// The pc (with Thumb bit) to pass to the engine when resuming.
    pub fn resume_pc(&self) -> GuestAddr {
        GuestAddr::new(self.ctx.resume_pc())
    }

    /// Time quantum: the main thread gets a long slice, others shrink with
    /// rising priority value.
    pub fn quantum(&self) -> Millis {
        if self.id.0 == 0 {
            MAIN_QUANTUM
        } else {
            QUANTUM_BASE - Millis::from(self.priority).min(QUANTUM_BASE - 1)
        }
    }

    /// Writes this thread's context into the core.
    pub(crate) fn load_state(&self, cpu: &mut dyn CpuRegs) {
        self.ctx.restore(cpu);
    }

    /// Captures the core into this thread's context. The saved pc encodes
    /// the current Thumb state in bit 0 so a later `start` re-enters the
    /// right mode.
    pub(crate) fn save_state(&mut self, cpu: &mut dyn CpuRegs) {
        self.ctx = CpuContext::save(cpu);
        self.is_new = false;
    }
}
