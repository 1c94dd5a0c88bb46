//! CPU engine backend over the `arm7tdmi-rs` interpreter.
//!
//! The interpreter expects infallible memory, so guest accesses go through
//! an adapter that satisfies every access and records the first failure as
//! a [`MemFault`] delivered after the instruction — the same arrangement
//! the core expects from a real bus. SVCs are intercepted *before*
//! execution: the fetched word is decoded, pc is advanced past it, and the
//! machine's SVC hook runs with the dispatcher-visible state (immediate at
//! `pc − 4`/`pc − 2`).
//!
//! With an interpreter a "translation block" is a single instruction, so
//! the block hook fires per instruction; the hook body is expected to be
//! cheap when nothing is due.

use arm7tdmi_rs::{reg, Cpu, Memory as ArmMemory};
use muon_core::GuestAddr;
use muon_cpu::{AccessKind, CpuEngine, CpuRegs, HookAction, Machine, MemFault, Reg, StopReason};

/// CPSR T (Thumb state) bit.
const CPSR_T: u32 = 1 << 5;

/// CPSR user-mode bits.
const CPSR_USER: u32 = 0x10;

/// The engine: one ARM7TDMI core in user mode.
pub struct CoreEngine {
    cpu: Cpu,
}

/// Maps a [`Reg`] to the interpreter's register numbering without pinning
/// the constants' integer type.
macro_rules! arm_reg {
    ($r:expr) => {
        match $r {
            Reg::R0 => 0,
            Reg::R1 => 1,
            Reg::R2 => 2,
            Reg::R3 => 3,
            Reg::R4 => 4,
            Reg::R5 => 5,
            Reg::R6 => 6,
            Reg::R7 => 7,
            Reg::R8 => 8,
            Reg::R9 => 9,
            Reg::R10 => 10,
            Reg::R11 => 11,
            Reg::R12 => 12,
            Reg::Sp => reg::SP,
            Reg::Lr => reg::LR,
            Reg::Pc => reg::PC,
        }
    };
}

impl CoreEngine {
    /// Creates a core in ARM-state user mode.
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(&[(0, reg::CPSR, CPSR_USER)]),
        }
    }

    fn cpsr(&self) -> u32 {
        let bank = self.cpu.get_mode().reg_bank();
        self.cpu.reg_get(bank, reg::CPSR)
    }

    fn set_cpsr(&mut self, value: u32) {
        let bank = self.cpu.get_mode().reg_bank();
        self.cpu.reg_set(bank, reg::CPSR, value);
    }

    /// Applies the interworking entry convention: bit 0 of `pc` selects
    /// Thumb, the architectural pc gets the stripped value.
    fn enter_at(&mut self, pc: GuestAddr) {
        let cpsr = self.cpsr();
        let cpsr = if pc.is_thumb() {
            cpsr | CPSR_T
        } else {
            cpsr & !CPSR_T
        };
        self.set_cpsr(cpsr);
        self.set(Reg::Pc, pc.code_base().as_u32());
    }
}

impl Default for CoreEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuRegs for CoreEngine {
    fn get(&mut self, r: Reg) -> u32 {
        let bank = self.cpu.get_mode().reg_bank();
        self.cpu.reg_get(bank, arm_reg!(r))
    }

    fn set(&mut self, r: Reg, value: u32) {
        let bank = self.cpu.get_mode().reg_bank();
        self.cpu.reg_set(bank, arm_reg!(r), value);
    }

    fn is_thumb(&mut self) -> bool {
        self.cpsr() & CPSR_T != 0
    }
}

/// ARM-state SVC: condition field not 0b1111 and bits 27..24 = 0b1111.
fn is_arm_svc(insn: u32) -> bool {
    (insn >> 28) != 0xF && (insn >> 24) & 0x0F == 0x0F
}

/// Thumb-state SVC: `1101 1111 imm8`.
fn is_thumb_svc(insn: u16) -> bool {
    insn & 0xFF00 == 0xDF00
}

impl CpuEngine for CoreEngine {
    fn start(&mut self, pc: GuestAddr, machine: &mut dyn Machine) -> StopReason {
        self.enter_at(pc);

        loop {
            if machine.on_block(self) == HookAction::Stop {
                return StopReason::HookStop;
            }

            let thumb = self.is_thumb();
            let cur_pc = self.get(Reg::Pc);
            let width: u32 = if thumb { 2 } else { 4 };

            // Peek the next instruction: catches fetch faults and SVCs
            // before the core touches them.
            let mut raw = [0u8; 4];
            let fetch = machine.mem_read(GuestAddr::new(cur_pc), &mut raw[..width as usize]);
            match fetch {
                Err(e) => {
                    let fault = MemFault {
                        addr: e.addr,
                        kind: AccessKind::Fetch,
                        size: width,
                    };
                    if machine.on_fault(self, fault) == HookAction::Stop {
                        return StopReason::FetchFault(fault);
                    }
                    // Advance-and-continue.
                    self.set(Reg::Pc, cur_pc.wrapping_add(width));
                    continue;
                }
                Ok(()) => {
                    let svc = if thumb {
                        is_thumb_svc(u16::from_le_bytes([raw[0], raw[1]]))
                    } else {
                        is_arm_svc(u32::from_le_bytes(raw))
                    };
                    if svc {
                        // Mirror hardware: the hook sees pc past the SVC.
                        self.set(Reg::Pc, cur_pc.wrapping_add(width));
                        if machine.on_svc(self) == HookAction::Stop {
                            return StopReason::HookStop;
                        }
                        continue;
                    }
                }
            }

            // Execute one instruction through the fault-recording bus.
            let mut bus = BusAdapter::new(machine);
            self.cpu.cycle(&mut bus);
            let fault = bus.take_fault();

            if let Some(fault) = fault {
                if machine.on_fault(self, fault) == HookAction::Stop {
                    return StopReason::HookStop;
                }
            }
        }
    }
}

/// Adapts the fallible [`Machine`] bus to the core's infallible memory
/// interface. A failing access "succeeds" (reads as zero, writes vanish)
/// and the first fault is kept for delivery after the cycle.
struct BusAdapter<'a> {
    machine: &'a mut dyn Machine,
    fault: Option<MemFault>,
}

impl<'a> BusAdapter<'a> {
    fn new(machine: &'a mut dyn Machine) -> Self {
        Self {
            machine,
            fault: None,
        }
    }

    fn take_fault(&mut self) -> Option<MemFault> {
        self.fault.take()
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) {
        if let Err(fault) = self.machine.mem_read(GuestAddr::new(addr), buf) {
            self.fault.get_or_insert(fault);
            buf.fill(0);
        }
    }

    fn write(&mut self, addr: u32, data: &[u8]) {
        if let Err(fault) = self.machine.mem_write(GuestAddr::new(addr), data) {
            self.fault.get_or_insert(fault);
        }
    }
}

impl ArmMemory for BusAdapter<'_> {
    fn r8(&mut self, addr: u32) -> u8 {
        let mut b = [0u8; 1];
        self.read(addr, &mut b);
        b[0]
    }

    fn r16(&mut self, addr: u32) -> u16 {
        let mut b = [0u8; 2];
        self.read(addr, &mut b);
        u16::from_le_bytes(b)
    }

    fn r32(&mut self, addr: u32) -> u32 {
        let mut b = [0u8; 4];
        self.read(addr, &mut b);
        u32::from_le_bytes(b)
    }

    fn w8(&mut self, addr: u32, val: u8) {
        self.write(addr, &[val]);
    }

    fn w16(&mut self, addr: u32, val: u16) {
        self.write(addr, &val.to_le_bytes());
    }

    fn w32(&mut self, addr: u32, val: u32) {
        self.write(addr, &val.to_le_bytes());
    }
}
