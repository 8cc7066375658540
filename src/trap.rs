//! Trap dispatch. In this embodiment syscalls are direct method calls and
//! device interrupts are out of scope, so what remains is the page-fault
//! path: user-memory accesses that the installed page table cannot satisfy
//! land here and are resolved, in order, by swap-in, copy-on-write, or
//! on-demand stack growth; anything else kills the process.

use core::sync::atomic::Ordering;

use crate::param::{PGSIZE, USTACK_MAXPAGES};
use crate::proc::KernelCtx;
use crate::vm::{pgrounddown, PageFault, VR_USTACK};

/// Returns whether `addr` names a copy-on-write page of the faulting
/// process.
fn validate_cow(ctx: &KernelCtx<'_>, addr: usize) -> bool {
    let vs = ctx.proc().vspace.lock();
    let r = match vs.va2region(addr) {
        Some(r) => r,
        None => return false,
    };
    match vs.region(r).vpage(addr) {
        Some(vpi) => vpi.used && vpi.copy_on_write,
        None => false,
    }
}

/// Resolve a page fault, or mark the process killed and return Err.
///
/// The caller retries the faulting access after Ok; a fault resolved by
/// swap-in may legitimately fault again (e.g. a swapped-out COW page) and
/// take the next branch on the retry.
pub fn handle_page_fault(ctx: &KernelCtx<'_>, fault: PageFault) -> Result<(), ()> {
    let kernel = ctx.kernel();
    kernel.num_page_faults.fetch_add(1, Ordering::Relaxed);
    let addr = fault.addr;

    // A swapped-out page: bring it back in.
    let swapped = {
        let vs = ctx.proc().vspace.lock();
        vs.va2region(addr)
            .and_then(|r| vs.region(r).vpage(addr).copied())
            .filter(|vpi| vpi.used && !vpi.present)
            .and_then(|vpi| vpi.on_disk)
    };
    if let Some(slot) = swapped {
        if kernel.swap_in(slot, pgrounddown(addr)).is_err() {
            panic!("swap in failed");
        }
        return Ok(());
    }

    // A write to a copy-on-write page: clone or claim it.
    if validate_cow(ctx, addr) && fault.write {
        if kernel.vspace_copy_on_write(ctx, addr).is_ok() {
            return Ok(());
        }
        panic!("err in vspace_copy_on_write");
    }

    // Just below the live stack: grow it on demand.
    let in_stack_window = {
        let vs = ctx.proc().vspace.lock();
        let stack = vs.region(VR_USTACK);
        addr >= stack.va_base - USTACK_MAXPAGES * PGSIZE && addr < stack.va_base - stack.size
    };
    if in_stack_window && kernel.grow_user_stack_ondemand(ctx, addr).is_ok() {
        return Ok(());
    }

    // Assume process misbehaved.
    ctx.proc().set_killed();
    Err(())
}
