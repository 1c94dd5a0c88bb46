//! Thread syscalls.

use log::warn;
use muon_core::GuestAddr;
use muon_cpu::CpuRegs;
use muon_sched::ThreadId;

use super::SyscallArgs;
use crate::Kernel;

/// `create_thread(entry, arg, priority, stack_size)` — returns the new
/// thread id, or `u32::MAX` on failure.
pub(super) fn sys_create_thread(
    kernel: &mut Kernel,
    _cpu: &mut dyn CpuRegs,
    args: &SyscallArgs,
) -> u32 {
    let entry = GuestAddr::new(args.r0);
    let priority = args.r2.min(255) as u8;
    match kernel
        .sched
        .spawn(&mut kernel.mem, entry, args.r1, priority, args.r3)
    {
        Ok(ThreadId(id)) => id,
        Err(e) => {
            warn!("create_thread({entry}) failed: {e}");
            u32::MAX
        }
    }
}

/// `set_thread_priority(id, priority)` — 1 on success, 0 for a bad id.
pub(super) fn sys_set_thread_priority(
    kernel: &mut Kernel,
    _cpu: &mut dyn CpuRegs,
    args: &SyscallArgs,
) -> u32 {
    u32::from(
        kernel
            .sched
            .set_priority(ThreadId(args.r0), args.r1.min(255) as u8),
    )
}

/// `sleep(ms)` — parks the caller; the block hook reschedules.
pub(super) fn sys_sleep(kernel: &mut Kernel, _cpu: &mut dyn CpuRegs, args: &SyscallArgs) -> u32 {
    let now = kernel.now_ms();
    kernel.sched.sleep_current(now, args.r0);
    0
}

/// `suspend_thread(id)`.
pub(super) fn sys_suspend_thread(
    kernel: &mut Kernel,
    _cpu: &mut dyn CpuRegs,
    args: &SyscallArgs,
) -> u32 {
    u32::from(kernel.sched.suspend(ThreadId(args.r0)))
}

/// `resume_thread(id)`.
pub(super) fn sys_resume_thread(
    kernel: &mut Kernel,
    _cpu: &mut dyn CpuRegs,
    args: &SyscallArgs,
) -> u32 {
    u32::from(kernel.sched.resume(ThreadId(args.r0)))
}

/// `yield()` — give up the rest of the quantum.
pub(super) fn sys_yield(kernel: &mut Kernel, _cpu: &mut dyn CpuRegs, _args: &SyscallArgs) -> u32 {
    kernel.sched.yield_current();
    0
}
