//! The emulated Prime OS kernel.
//!
//! [`Kernel`] aggregates everything the guest can see — memory manager,
//! scheduler, loaded modules, the LCD handler and the input queue — and
//! implements the engine's [`Machine`](muon_cpu::Machine) seam: guest
//! memory access, the block-boundary hook that drives time slicing, the
//! SVC dispatcher, and the fault report path. [`Runtime`] pairs a kernel
//! with a CPU engine and runs the outer execute/switch loop.

mod fault;
mod input;
mod lcd;
mod machine;
mod runtime;
mod svc;
pub mod syscalls;
mod time;

use std::collections::BTreeMap;

use log::debug;
use muon_core::GuestAddr;
use muon_loader::ModuleRegistry;
use muon_mm::MemoryManager;
use muon_sched::{Millis, Scheduler};

pub use input::{InputQueue, InputSender, TouchPhase, UiEvent};
pub use lcd::{LCD_HEIGHT, LCD_REGISTER_BASE, LCD_REGISTER_SIZE, LCD_WIDTH};
pub use runtime::{Runtime, RuntimeError, RuntimeOptions};
pub use syscalls::{nr, SyscallArgs, SyscallFn};
pub use time::Clock;

use lcd::Lcd;

/// Main-thread stack size.
pub const MAIN_STACK_SIZE: u32 = 0x1_0000;

/// Give up after this many consecutive faults at one pc — the guest is
/// wedged and advance-and-continue will not save it.
const MAX_FAULT_STORM: u32 = 64;

/// The emulated machine minus its CPU core.
pub struct Kernel {
    /// Guest address space.
    pub mem: MemoryManager,
    /// Guest threads and synchronisation objects.
    pub sched: Scheduler,
    /// Loaded guest images.
    pub modules: ModuleRegistry,
    /// Host-side input events awaiting `GetEvent`.
    pub input: InputQueue,
    clock: Clock,
    svc_table: BTreeMap<u32, SyscallFn>,
    lcd: Option<Lcd>,
    /// Start of the current thread's time slice.
    slice_start: Millis,
    exit_requested: bool,
    /// Fault-storm detection: last faulting pc and its repeat count.
    last_fault_pc: u32,
    fault_streak: u32,
    /// Set whenever the guest makes forward progress during a `start`;
    /// lets the outer loop idle politely when every thread is parked.
    progressed: bool,
}

impl Kernel {
    /// Creates a kernel with the given time source and the default
    /// syscall table.
    pub fn new(clock: Clock) -> Self {
        Self {
            mem: MemoryManager::new(),
            sched: Scheduler::new(),
            modules: ModuleRegistry::new(),
            input: InputQueue::new(),
            clock,
            svc_table: syscalls::default_table(),
            lcd: None,
            slice_start: 0,
            exit_requested: false,
            last_fault_pc: 0,
            fault_streak: 0,
            progressed: false,
        }
    }

    /// Milliseconds on the emulator clock.
    pub fn now_ms(&self) -> Millis {
        self.clock.now_ms()
    }

    /// Mutable access to the clock (manual clocks only advance this way).
    pub fn clock_mut(&mut self) -> &mut Clock {
        &mut self.clock
    }

    /// Registers (or replaces) a syscall handler.
    pub fn register_syscall(&mut self, id: u32, handler: SyscallFn) {
        debug!("register syscall {id:#07x}");
        self.svc_table.insert(id, handler);
    }

    /// True once the guest asked to end emulation (main thread returned).
    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }

    pub(crate) fn request_exit(&mut self) {
        self.exit_requested = true;
    }

    /// Marks the start of a fresh time slice.
    pub(crate) fn begin_slice(&mut self) {
        self.slice_start = self.clock.now_ms();
    }

    pub(crate) fn take_progress(&mut self) -> bool {
        core::mem::replace(&mut self.progressed, false)
    }

    /// The guest framebuffer, if the guest switched its LCD on: 320×240
    /// RGB555 pixels, row-major. Host front-ends read it through here.
    pub fn lcd_framebuffer(&self) -> Option<&[u8]> {
        let lcd = self.lcd.as_ref()?;
        self.mem
            .host_slice(lcd.framebuffer(), lcd::LCD_FRAMEBUFFER_BYTES)
            .ok()
    }

    /// The LCD handler, created on first use by the LCD syscalls.
    pub(crate) fn lcd_handle(&mut self) -> Result<GuestAddr, muon_mm::MemError> {
        match self.lcd {
            Some(ref lcd) => Ok(lcd.pointer_cell()),
            None => {
                let lcd = Lcd::init(&mut self.mem)?;
                let cell = lcd.pointer_cell();
                self.lcd = Some(lcd);
                Ok(cell)
            }
        }
    }
}
