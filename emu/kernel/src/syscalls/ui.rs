//! UI syscalls: input events and the LCD.

use log::warn;
use muon_core::GuestAddr;
use muon_cpu::CpuRegs;

use super::SyscallArgs;
use crate::Kernel;

/// `get_event(buf)` — dequeues one pending input event into the guest
/// event structure at r0. Returns 1 if an event was delivered, 0 if the
/// queue was empty or the buffer pointer is bad.
pub(super) fn sys_get_event(kernel: &mut Kernel, _cpu: &mut dyn CpuRegs, args: &SyscallArgs) -> u32 {
    if args.r0 == 0 {
        return 0;
    }
    let Some(event) = kernel.input.try_pop() else {
        return 0;
    };
    match event.write_guest(&mut kernel.mem, GuestAddr::new(args.r0)) {
        Ok(()) => 1,
        Err(e) => {
            warn!("get_event: cannot write event to {:#010x}: {e}", args.r0);
            0
        }
    }
}

/// `lcd_on()` — makes sure the LCD structures exist. Returns 1 when the
/// display is up.
pub(super) fn sys_lcd_on(kernel: &mut Kernel, _cpu: &mut dyn CpuRegs, _args: &SyscallArgs) -> u32 {
    match kernel.lcd_handle() {
        Ok(_) => 1,
        Err(e) => {
            warn!("lcd_on failed: {e}");
            0
        }
    }
}

/// `get_active_lcd()` — address of the pointer cell naming the active LCD
/// descriptor.
pub(super) fn sys_get_active_lcd(
    kernel: &mut Kernel,
    _cpu: &mut dyn CpuRegs,
    _args: &SyscallArgs,
) -> u32 {
    match kernel.lcd_handle() {
        Ok(cell) => cell.as_u32(),
        Err(e) => {
            warn!("get_active_lcd failed: {e}");
            0
        }
    }
}
