//! Critical-section and event syscalls.

use muon_core::GuestAddr;
use muon_cpu::CpuRegs;

use super::SyscallArgs;
use crate::Kernel;

/// `cs_init(cs)` — r0 is the guest address of the critical-section object.
pub(super) fn sys_cs_init(kernel: &mut Kernel, _cpu: &mut dyn CpuRegs, args: &SyscallArgs) -> u32 {
    kernel.sched.cs_init(GuestAddr::new(args.r0));
    0
}

/// `cs_enter(cs)` — acquires or queues; a queued caller parks at the next
/// block boundary.
pub(super) fn sys_cs_enter(kernel: &mut Kernel, _cpu: &mut dyn CpuRegs, args: &SyscallArgs) -> u32 {
    kernel.sched.cs_enter(GuestAddr::new(args.r0));
    0
}

/// `cs_leave(cs)`.
pub(super) fn sys_cs_leave(kernel: &mut Kernel, _cpu: &mut dyn CpuRegs, args: &SyscallArgs) -> u32 {
    kernel.sched.cs_leave(GuestAddr::new(args.r0));
    0
}

/// `event_create(manual_reset, initial)` — returns the handle.
pub(super) fn sys_event_create(
    kernel: &mut Kernel,
    _cpu: &mut dyn CpuRegs,
    args: &SyscallArgs,
) -> u32 {
    kernel.sched.event_create(args.r0 != 0, args.r1 != 0)
}

/// `event_set(handle)`.
pub(super) fn sys_event_set(kernel: &mut Kernel, _cpu: &mut dyn CpuRegs, args: &SyscallArgs) -> u32 {
    u32::from(kernel.sched.event_set(args.r0))
}

/// `event_reset(handle)`.
pub(super) fn sys_event_reset(
    kernel: &mut Kernel,
    _cpu: &mut dyn CpuRegs,
    args: &SyscallArgs,
) -> u32 {
    u32::from(kernel.sched.event_reset(args.r0))
}

/// `event_wait(handle, timeout_ms)` — timeout is signed: zero polls,
/// negative waits forever. An un-signalled wait queues the caller; the
/// block hook parks it.
pub(super) fn sys_event_wait(
    kernel: &mut Kernel,
    _cpu: &mut dyn CpuRegs,
    args: &SyscallArgs,
) -> u32 {
    let now = kernel.now_ms();
    u32::from(kernel.sched.event_wait(args.r0, args.r1 as i32, now))
}
