//! Guest fault reporting.
//!
//! Dumps the register file, a hex window of code around pc, and a
//! best-effort walk of the AAPCS r11 frame chain. Purely a debugging aid:
//! code built without frame pointers yields only the innermost frames.

use log::error;
use muon_core::GuestAddr;
use muon_cpu::{CpuRegs, MemFault, Reg};

use crate::Kernel;

/// Bytes of code shown before pc.
const WINDOW_BEFORE: u32 = 32;

/// Bytes of code shown after pc.
const WINDOW_AFTER: u32 = 64;

/// Maximum frames printed from the r11 chain.
const MAX_FRAMES: u32 = 16;

/// Prints the full fault report for the current thread.
pub(crate) fn report(kernel: &Kernel, cpu: &mut dyn CpuRegs, fault: &MemFault) {
    let file = cpu.get_file();
    let thumb = cpu.is_thumb();
    let pc = file[Reg::Pc.index()];

    error!("guest fault: {fault} on {}", kernel.sched.current_id());
    for (row, chunk) in file.chunks(4).enumerate() {
        let names: String = chunk
            .iter()
            .enumerate()
            .map(|(col, v)| {
                let reg = Reg::FILE[row * 4 + col];
                format!("{reg:>3}={v:08x}  ")
            })
            .collect();
        error!("  {}", names.trim_end());
    }

    dump_code_window(kernel, pc, thumb);
    dump_frame_chain(kernel, file[Reg::R11.index()]);
}

/// Hex dump of the instructions around pc, width-matched to the current
/// mode, with a marker on the faulting instruction.
fn dump_code_window(kernel: &Kernel, pc: u32, thumb: bool) {
    let width: u32 = if thumb { 2 } else { 4 };
    let start = pc.saturating_sub(WINDOW_BEFORE) & !(width - 1);
    let end = pc.saturating_add(WINDOW_AFTER);

    error!("  code around pc ({}):", if thumb { "thumb" } else { "arm" });
    let mut at = start;
    while at < end {
        let marker = if at == pc & !(width - 1) { "->" } else { "  " };
        let word = if thumb {
            kernel.mem.read_u16(GuestAddr::new(at)).map(|w| format!("{w:04x}"))
        } else {
            kernel.mem.read_u32(GuestAddr::new(at)).map(|w| format!("{w:08x}"))
        };
        match word {
            Ok(w) => error!("  {marker} {at:#010x}: {w}"),
            Err(_) => error!("  {marker} {at:#010x}: <unmapped>"),
        }
        at += width;
    }
}

/// Walks `[fp] = saved lr`, `[fp - 4] = caller fp` up the stack.
fn dump_frame_chain(kernel: &Kernel, mut fp: u32) {
    error!("  call frames (via r11):");
    for depth in 0..MAX_FRAMES {
        if fp == 0 || fp % 4 != 0 {
            break;
        }
        let Ok(lr) = kernel.mem.read_u32(GuestAddr::new(fp)) else {
            break;
        };
        let Ok(next) = kernel.mem.read_u32(GuestAddr::new(fp) - 4) else {
            break;
        };
        error!("    #{depth}: lr={lr:#010x} fp={fp:#010x}");
        // Frames live at increasing addresses; anything else is garbage.
        if next <= fp {
            break;
        }
        fp = next;
    }
}
