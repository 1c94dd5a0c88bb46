//! The SVC dispatcher.
//!
//! Runs inside the engine's SVC hook. The guest-side trampoline pushes lr
//! (plus one scratch word) and issues `SVC #id`; by hook time pc has moved
//! past the instruction, so the immediate is read back from `pc − 4` (ARM,
//! low 20 bits) or `pc − 2` (Thumb, low 8 bits). The handler's return
//! value lands in r0, the two-word trampoline frame is popped, and pc is
//! redirected to the saved lr.

use log::{trace, warn};
use muon_core::GuestAddr;
use muon_cpu::{CpuRegs, Reg};

use crate::syscalls::SyscallArgs;
use crate::Kernel;

/// Bytes the trampoline pushed before the SVC (saved lr + scratch).
const TRAMPOLINE_FRAME: u32 = 8;

pub(crate) fn dispatch_svc(kernel: &mut Kernel, cpu: &mut dyn CpuRegs) {
    let pc = cpu.get(Reg::Pc);
    let sp = cpu.get(Reg::Sp);

    // Decode the immediate from the trapping instruction.
    let id = if cpu.is_thumb() {
        kernel
            .mem
            .read_u16(GuestAddr::new(pc) - 2)
            .map(|insn| u32::from(insn & 0x00FF))
    } else {
        kernel
            .mem
            .read_u32(GuestAddr::new(pc) - 4)
            .map(|insn| insn & 0x000F_FFFF)
    };
    let id = match id {
        Ok(id) => id,
        Err(e) => {
            warn!("svc dispatch: cannot read trapping instruction at {pc:#010x}: {e}");
            return;
        }
    };

    // The trampoline stored the caller's lr at [sp].
    let lr = match kernel.mem.read_u32(GuestAddr::new(sp)) {
        Ok(lr) => lr,
        Err(e) => {
            warn!("svc {id:#07x}: cannot read saved lr at sp {sp:#010x}: {e}");
            return;
        }
    };

    let args = SyscallArgs {
        r0: cpu.get(Reg::R0),
        r1: cpu.get(Reg::R1),
        r2: cpu.get(Reg::R2),
        r3: cpu.get(Reg::R3),
        r4: cpu.get(Reg::R4),
        sp,
    };
    trace!(
        "svc {id:#07x} r0={:#x} r1={:#x} r2={:#x} r3={:#x} caller={:#010x}",
        args.r0,
        args.r1,
        args.r2,
        args.r3,
        lr
    );

    let ret = match kernel.svc_table.get(&id).copied() {
        Some(handler) => handler(kernel, cpu, &args),
        None => {
            warn!("unhandled svc {id:#07x} (caller {:#010x})", lr);
            0
        }
    };

    cpu.set(Reg::R0, ret);
    cpu.set(Reg::Sp, sp.wrapping_add(TRAMPOLINE_FRAME));
    cpu.set(Reg::Pc, lr & !1);
}
