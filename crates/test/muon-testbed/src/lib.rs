//! Scriptable CPU engine for unit tests.
//!
//! [`TestCpu`] is a plain register file implementing the `muon-cpu` traits.
//! Tests queue a sequence of [`ScriptEvent`]s; `start` replays them against
//! the machine's hooks, which exercises scheduler and dispatcher logic
//! without a real core.

use std::collections::VecDeque;

use muon_core::GuestAddr;
use muon_cpu::{CpuEngine, CpuRegs, HookAction, Machine, MemFault, Reg, StopReason};

/// One scripted occurrence during a `start` call.
#[derive(Debug, Clone, Copy)]
pub enum ScriptEvent {
    /// A translation-block boundary.
    Block,
    /// An SVC trap (the test sets up pc/sp/registers beforehand).
    Svc,
    /// A memory fault.
    Fault(MemFault),
}

/// A fake engine: sixteen registers, a Thumb flag, and a replay script.
#[derive(Debug, Default)]
pub struct TestCpu {
    /// r0..r12, sp, lr, pc.
    pub file: [u32; 16],
    /// Current Thumb state.
    pub thumb: bool,
    script: VecDeque<ScriptEvent>,
    /// Number of `start` calls made.
    pub starts: u32,
}

impl TestCpu {
    /// Creates an engine with zeroed registers and an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an event for the next `start` call.
    pub fn push_event(&mut self, ev: ScriptEvent) {
        self.script.push_back(ev);
    }

    /// Convenience: read a register without the trait in scope.
    pub fn reg(&self, reg: Reg) -> u32 {
        self.file[reg.index()]
    }

    /// Convenience: write a register without the trait in scope.
    pub fn set_reg(&mut self, reg: Reg, value: u32) {
        self.file[reg.index()] = value;
    }
}

impl CpuRegs for TestCpu {
    fn get(&mut self, reg: Reg) -> u32 {
        self.file[reg.index()]
    }

    fn set(&mut self, reg: Reg, value: u32) {
        self.file[reg.index()] = value;
    }

    fn is_thumb(&mut self) -> bool {
        self.thumb
    }
}

impl CpuEngine for TestCpu {
    fn start(&mut self, pc: GuestAddr, machine: &mut dyn Machine) -> StopReason {
        self.starts += 1;
        self.thumb = pc.is_thumb();
        self.file[Reg::Pc.index()] = pc.code_base().as_u32();

        while let Some(ev) = self.script.pop_front() {
            let action = match ev {
                ScriptEvent::Block => machine.on_block(self),
                ScriptEvent::Svc => machine.on_svc(self),
                ScriptEvent::Fault(fault) => machine.on_fault(self, fault),
            };
            if action == HookAction::Stop {
                return StopReason::HookStop;
            }
        }
        StopReason::HookStop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingMachine {
        blocks: u32,
        svcs: u32,
        stop_after_blocks: u32,
    }

    impl Machine for CountingMachine {
        fn mem_read(&mut self, addr: GuestAddr, _buf: &mut [u8]) -> Result<(), MemFault> {
            Err(MemFault {
                addr,
                kind: muon_cpu::AccessKind::Read,
                size: 1,
            })
        }

        fn mem_write(&mut self, addr: GuestAddr, data: &[u8]) -> Result<(), MemFault> {
            let _ = data;
            Err(MemFault {
                addr,
                kind: muon_cpu::AccessKind::Write,
                size: 1,
            })
        }

        fn on_block(&mut self, _cpu: &mut dyn CpuRegs) -> HookAction {
            self.blocks += 1;
            if self.blocks >= self.stop_after_blocks {
                HookAction::Stop
            } else {
                HookAction::Continue
            }
        }

        fn on_svc(&mut self, _cpu: &mut dyn CpuRegs) -> HookAction {
            self.svcs += 1;
            HookAction::Continue
        }

        fn on_fault(&mut self, _cpu: &mut dyn CpuRegs, _fault: MemFault) -> HookAction {
            HookAction::Stop
        }
    }

    #[test]
    fn replays_script_until_stop() {
        let mut cpu = TestCpu::new();
        cpu.push_event(ScriptEvent::Block);
        cpu.push_event(ScriptEvent::Svc);
        cpu.push_event(ScriptEvent::Block);
        cpu.push_event(ScriptEvent::Svc); // never reached

        let mut m = CountingMachine {
            blocks: 0,
            svcs: 0,
            stop_after_blocks: 2,
        };
        let reason = cpu.start(GuestAddr::new(0x1000), &mut m);
        assert_eq!(reason, StopReason::HookStop);
        assert_eq!(m.blocks, 2);
        assert_eq!(m.svcs, 1);
    }

    #[test]
    fn entry_pc_thumb_bit() {
        let mut cpu = TestCpu::new();
        let mut m = CountingMachine {
            blocks: 0,
            svcs: 0,
            stop_after_blocks: 1,
        };
        cpu.start(GuestAddr::new(0x8001), &mut m);
        assert!(cpu.thumb);
        assert_eq!(cpu.reg(Reg::Pc), 0x8000);
    }
}
