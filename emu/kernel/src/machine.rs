//! The kernel's implementation of the engine [`Machine`] seam.

use log::{error, info};
use muon_core::GuestAddr;
use muon_cpu::{AccessKind, CpuRegs, HookAction, Machine, MemFault, Reg};
use muon_mm::MemProt;
use muon_sched::THREAD_EXIT;

use crate::svc::dispatch_svc;
use crate::{fault, Kernel, MAX_FAULT_STORM};

impl Machine for Kernel {
    fn mem_read(&mut self, addr: GuestAddr, buf: &mut [u8]) -> Result<(), MemFault> {
        self.mem.read_bytes(addr, buf).map_err(|_| MemFault {
            addr,
            kind: AccessKind::Read,
            size: buf.len() as u32,
        })
    }

    /// Guest stores honour the block protection; host-side writes through
    /// the memory manager do not.
    fn mem_write(&mut self, addr: GuestAddr, data: &[u8]) -> Result<(), MemFault> {
        let fault = MemFault {
            addr,
            kind: AccessKind::Write,
            size: data.len() as u32,
        };
        if !self
            .mem
            .prot_at(addr)
            .is_some_and(|p| p.contains(MemProt::WRITE))
        {
            return Err(fault);
        }
        self.mem.write_bytes(addr, data).map_err(|_| fault)
    }

    /// End-of-quantum, yield and runnability checks, plus the thread-exit
    /// sentinel. Stopping here hands control back to the outer loop for a
    /// ring switch.
    fn on_block(&mut self, cpu: &mut dyn CpuRegs) -> HookAction {
        if cpu.get(Reg::Pc) == THREAD_EXIT.as_u32() {
            return self.thread_returned(cpu);
        }

        let now = self.clock.now_ms();
        let yielded = self.sched.take_yield();
        let blocked = self.sched.can_run_current(now).is_some();
        let expired = now.saturating_sub(self.slice_start) >= self.sched.current().quantum();

        if yielded || blocked || expired {
            self.sched.save_current(cpu);
            HookAction::Stop
        } else {
            self.progressed = true;
            HookAction::Continue
        }
    }

    fn on_svc(&mut self, cpu: &mut dyn CpuRegs) -> HookAction {
        self.progressed = true;
        self.fault_streak = 0;
        dispatch_svc(self, cpu);
        if self.exit_requested {
            HookAction::Stop
        } else {
            HookAction::Continue
        }
    }

    /// Advance-and-continue: report the fault and keep going, unless the
    /// guest is stuck re-faulting at one pc.
    fn on_fault(&mut self, cpu: &mut dyn CpuRegs, fault: MemFault) -> HookAction {
        let pc = cpu.get(Reg::Pc);
        if fault.addr == THREAD_EXIT || pc == THREAD_EXIT.as_u32() {
            // Engines that fault on the sentinel fetch before the block
            // hook sees it land here.
            return self.thread_returned(cpu);
        }

        fault::report(self, cpu, &fault);

        if pc == self.last_fault_pc {
            self.fault_streak += 1;
        } else {
            self.last_fault_pc = pc;
            self.fault_streak = 1;
        }
        if self.fault_streak >= MAX_FAULT_STORM {
            error!("guest wedged: {} consecutive faults at {pc:#010x}", self.fault_streak);
            self.request_exit();
            return HookAction::Stop;
        }
        HookAction::Continue
    }
}

impl Kernel {
    /// A thread's entry function returned to the exit sentinel. Main
    /// thread: end emulation. Others: park the thread forever (threads
    /// are never destroyed).
    fn thread_returned(&mut self, cpu: &mut dyn CpuRegs) -> HookAction {
        let id = self.sched.current_id();
        if id.0 == 0 {
            info!("main thread returned; ending emulation");
            self.request_exit();
        } else {
            info!("{id} returned; parking it");
            self.sched.suspend(id);
            self.sched.save_current(cpu);
        }
        HookAction::Stop
    }
}
