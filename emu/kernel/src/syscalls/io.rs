//! Debug and time syscalls.

use log::info;
use muon_core::GuestAddr;
use muon_cpu::CpuRegs;

use super::SyscallArgs;
use crate::Kernel;

/// Longest debug message the guest may log at once.
const MAX_DBG_MSG: u32 = 1024;

/// `dbg_msg(str)` — logs the guest's NUL-terminated message.
pub(super) fn sys_dbg_msg(kernel: &mut Kernel, _cpu: &mut dyn CpuRegs, args: &SyscallArgs) -> u32 {
    match kernel.mem.read_cstr(GuestAddr::new(args.r0), MAX_DBG_MSG) {
        Ok(msg) => info!("[guest] {msg}"),
        Err(_) => info!("[guest] <bad message pointer {:#010x}>", args.r0),
    }
    0
}

/// `get_sys_time()` — milliseconds since emulator start.
pub(super) fn sys_get_sys_time(
    kernel: &mut Kernel,
    _cpu: &mut dyn CpuRegs,
    _args: &SyscallArgs,
) -> u32 {
    kernel.now_ms() as u32
}
