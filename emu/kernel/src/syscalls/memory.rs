//! Heap syscalls.

use log::{error, warn};
use muon_core::GuestAddr;
use muon_cpu::CpuRegs;
use muon_mm::MemError;

use super::SyscallArgs;
use crate::Kernel;

/// Heap-cookie damage means the allocator's metadata can no longer be
/// trusted; there is no safe recovery. Print and abort.
fn heap_fatal(kernel: &Kernel, addr: GuestAddr) -> ! {
    error!(
        "FATAL: heap cookie damaged around {addr} ({}); aborting",
        kernel.sched.current_id()
    );
    std::process::abort();
}

/// `malloc(size)` — returns the allocation or guest null.
pub(super) fn sys_malloc(kernel: &mut Kernel, _cpu: &mut dyn CpuRegs, args: &SyscallArgs) -> u32 {
    match kernel.mem.heap_alloc(args.r0) {
        Ok(addr) => addr.as_u32(),
        Err(e) => {
            warn!("malloc({:#x}) failed: {e}", args.r0);
            0
        }
    }
}

/// `calloc(count, size)` — zeroed array allocation.
pub(super) fn sys_calloc(kernel: &mut Kernel, _cpu: &mut dyn CpuRegs, args: &SyscallArgs) -> u32 {
    let Some(total) = args.r0.checked_mul(args.r1) else {
        warn!("calloc({:#x}, {:#x}) overflows", args.r0, args.r1);
        return 0;
    };
    match kernel.mem.heap_alloc(total) {
        Ok(addr) => {
            if !addr.is_null() {
                // The heap recycles memory; calloc must hand back zeroes.
                if let Ok(buf) = kernel.mem.host_slice_mut(addr, total) {
                    buf.fill(0);
                }
            }
            addr.as_u32()
        }
        Err(e) => {
            warn!("calloc({:#x}, {:#x}) failed: {e}", args.r0, args.r1);
            0
        }
    }
}

/// `realloc(addr, new_size)`.
pub(super) fn sys_realloc(kernel: &mut Kernel, _cpu: &mut dyn CpuRegs, args: &SyscallArgs) -> u32 {
    let addr = GuestAddr::new(args.r0);
    match kernel.mem.heap_realloc(addr, args.r1) {
        Ok(new_addr) => new_addr.as_u32(),
        Err(MemError::HeapCorrupted { addr }) => heap_fatal(kernel, addr),
        Err(e) => {
            warn!("realloc({addr}, {:#x}) failed: {e}", args.r1);
            0
        }
    }
}

/// `free(addr)`.
pub(super) fn sys_free(kernel: &mut Kernel, _cpu: &mut dyn CpuRegs, args: &SyscallArgs) -> u32 {
    let addr = GuestAddr::new(args.r0);
    match kernel.mem.heap_free(addr) {
        Ok(()) => 0,
        Err(MemError::HeapCorrupted { addr }) => heap_fatal(kernel, addr),
        Err(e) => {
            warn!("free({addr}) failed: {e}");
            0
        }
    }
}
