//! Syscall numbering, handler signature, and the default dispatch table.
//!
//! Handlers receive the kernel, a register view, and a snapshot of the
//! AAPCS argument registers. They read further arguments from the guest
//! stack and dereference guest pointers through the memory manager — never
//! raw host pointers — and return the `u32` the dispatcher places in `r0`.

mod io;
mod memory;
mod sync;
mod thread;
mod ui;

use std::collections::BTreeMap;

use muon_core::GuestAddr;
use muon_cpu::CpuRegs;
use muon_mm::MemError;

use crate::Kernel;

/// Syscall numbers (the 20-bit SVC immediates).
pub mod nr {
    /// Create a thread: r0 = entry, r1 = arg, r2 = priority, r3 = stack size.
    pub const CREATE_THREAD: u32 = 0x010;
    /// Set a thread's priority: r0 = thread id, r1 = priority.
    pub const SET_THREAD_PRIORITY: u32 = 0x011;
    /// Sleep the calling thread: r0 = milliseconds.
    pub const SLEEP: u32 = 0x012;
    /// Suspend a thread: r0 = thread id.
    pub const SUSPEND_THREAD: u32 = 0x013;
    /// Resume a thread: r0 = thread id.
    pub const RESUME_THREAD: u32 = 0x014;
    /// Yield the rest of the quantum.
    pub const YIELD: u32 = 0x015;

    /// Initialise a critical section: r0 = guest CS address.
    pub const CS_INIT: u32 = 0x020;
    /// Enter a critical section: r0 = guest CS address.
    pub const CS_ENTER: u32 = 0x021;
    /// Leave a critical section: r0 = guest CS address.
    pub const CS_LEAVE: u32 = 0x022;

    /// Create an event: r0 = manual-reset flag, r1 = initial state.
    pub const EVENT_CREATE: u32 = 0x030;
    /// Signal an event: r0 = handle.
    pub const EVENT_SET: u32 = 0x031;
    /// Clear an event: r0 = handle.
    pub const EVENT_RESET: u32 = 0x032;
    /// Wait for an event: r0 = handle, r1 = timeout ms (signed; <0 forever).
    pub const EVENT_WAIT: u32 = 0x033;

    /// Heap allocate: r0 = size.
    pub const MALLOC: u32 = 0x040;
    /// Zeroed array allocate: r0 = count, r1 = element size.
    pub const CALLOC: u32 = 0x041;
    /// Resize an allocation: r0 = address, r1 = new size.
    pub const REALLOC: u32 = 0x042;
    /// Release an allocation: r0 = address.
    pub const FREE: u32 = 0x043;

    /// Dequeue one UI event into the buffer at r0.
    pub const GET_EVENT: u32 = 0x050;
    /// Milliseconds since emulator start.
    pub const GET_SYS_TIME: u32 = 0x051;
    /// Log the NUL-terminated string at r0.
    pub const DBG_MSG: u32 = 0x052;

    /// Switch the LCD on.
    pub const LCD_ON: u32 = 0x060;
    /// Address of the active-LCD pointer cell.
    pub const GET_ACTIVE_LCD: u32 = 0x061;
}

/// Snapshot of the argument registers at SVC entry.
#[derive(Debug, Clone, Copy)]
pub struct SyscallArgs {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r4: u32,
    /// Guest sp at SVC entry (pointing at the trampoline's saved frame).
    pub sp: u32,
}

impl SyscallArgs {
    /// Reads the `i`-th stack-passed argument (beyond r0–r3), skipping the
    /// trampoline's two saved words.
    pub fn stack_arg(&self, kernel: &Kernel, i: u32) -> Result<u32, MemError> {
        kernel.mem.read_u32(GuestAddr::new(self.sp) + 8 + i * 4)
    }
}

/// A syscall handler.
pub type SyscallFn = fn(&mut Kernel, &mut dyn CpuRegs, &SyscallArgs) -> u32;

/// Builds the default handler table.
pub(crate) fn default_table() -> BTreeMap<u32, SyscallFn> {
    let entries: &[(u32, SyscallFn)] = &[
        (nr::CREATE_THREAD, thread::sys_create_thread),
        (nr::SET_THREAD_PRIORITY, thread::sys_set_thread_priority),
        (nr::SLEEP, thread::sys_sleep),
        (nr::SUSPEND_THREAD, thread::sys_suspend_thread),
        (nr::RESUME_THREAD, thread::sys_resume_thread),
        (nr::YIELD, thread::sys_yield),
        (nr::CS_INIT, sync::sys_cs_init),
        (nr::CS_ENTER, sync::sys_cs_enter),
        (nr::CS_LEAVE, sync::sys_cs_leave),
        (nr::EVENT_CREATE, sync::sys_event_create),
        (nr::EVENT_SET, sync::sys_event_set),
        (nr::EVENT_RESET, sync::sys_event_reset),
        (nr::EVENT_WAIT, sync::sys_event_wait),
        (nr::MALLOC, memory::sys_malloc),
        (nr::CALLOC, memory::sys_calloc),
        (nr::REALLOC, memory::sys_realloc),
        (nr::FREE, memory::sys_free),
        (nr::GET_EVENT, ui::sys_get_event),
        (nr::GET_SYS_TIME, io::sys_get_sys_time),
        (nr::DBG_MSG, io::sys_dbg_msg),
        (nr::LCD_ON, ui::sys_lcd_on),
        (nr::GET_ACTIVE_LCD, ui::sys_get_active_lcd),
    ];
    entries.iter().copied().collect()
}
