//! The machine seam: guest memory plus hook callbacks.

use core::fmt;

use muon_core::GuestAddr;

use crate::regs::CpuRegs;

/// What a memory access was doing when it faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Fetch,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Fetch => write!(f, "fetch"),
        }
    }
}

/// An unmapped or otherwise failed guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFault {
    /// The faulting guest address.
    pub addr: GuestAddr,
    /// Access direction.
    pub kind: AccessKind,
    /// Access width in bytes.
    pub size: u32,
}

impl fmt::Display for MemFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-byte {} fault at {}", self.size, self.kind, self.addr)
    }
}

/// Hook verdict: keep executing or unwind out of `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// Continue with the next instruction.
    Continue,
    /// Stop the current `start` call; the outer loop decides what's next.
    Stop,
}

/// Why `start` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A hook returned [`HookAction::Stop`].
    HookStop,
    /// An instruction fetch faulted and the fault hook stopped execution.
    FetchFault(MemFault),
}

/// Everything the engine needs from the rest of the emulated machine.
///
/// One implementation exists per runtime; it owns the memory manager and
/// the scheduler, so hook bodies can reach all guest state. All methods are
/// called synchronously from [`CpuEngine::start`](crate::CpuEngine::start)
/// on the emulator thread.
pub trait Machine {
    /// Reads `buf.len()` bytes of guest memory at `addr`.
    fn mem_read(&mut self, addr: GuestAddr, buf: &mut [u8]) -> Result<(), MemFault>;

    /// Writes `data` to guest memory at `addr`.
    fn mem_write(&mut self, addr: GuestAddr, data: &[u8]) -> Result<(), MemFault>;

    /// Translation-block boundary hook, invoked before an instruction is
    /// fetched. The scheduler's quantum/runnability checks live here.
    fn on_block(&mut self, cpu: &mut dyn CpuRegs) -> HookAction;

    /// SVC hook. At invocation, pc has advanced past the SVC instruction
    /// (mirroring hardware), so the immediate is readable at `pc - 4` (ARM)
    /// or `pc - 2` (Thumb).
    fn on_svc(&mut self, cpu: &mut dyn CpuRegs) -> HookAction;

    /// Data-access or fetch fault hook. Returning
    /// [`HookAction::Continue`] resumes after the faulted instruction
    /// (advance-and-continue policy); [`HookAction::Stop`] unwinds.
    fn on_fault(&mut self, cpu: &mut dyn CpuRegs, fault: MemFault) -> HookAction;
}
