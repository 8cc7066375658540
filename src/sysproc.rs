//! Process system calls.

use core::sync::atomic::Ordering;

use crate::proc::{KernelCtx, Pid, UserProgram};
use crate::vm::{pgroundup, VmFlags, VR_HEAP};

/// The system accounting record user space reads through `sysinfo`.
#[derive(Copy, Clone, Debug, Default)]
pub struct SysInfo {
    pub pages_in_use: usize,
    pub pages_in_swap: usize,
    pub free_pages: usize,
    pub num_disk_reads: usize,
    pub num_page_faults: usize,
}

impl KernelCtx<'_> {
    /// Create a child running `prog` with a copy-on-write image of this
    /// process and duplicates of its open files. Returns the child's pid;
    /// the child's fork "returns" 0 in its trap frame.
    pub fn sys_fork(&self, prog: UserProgram) -> Result<Pid, ()> {
        self.kernel().fork(self, prog)
    }

    /// Exit the current process; it stays a zombie until waited for.
    pub fn sys_exit(&self) {
        self.kernel().exit(self)
    }

    /// Wait for a child to exit; returns its pid, or Err with no children.
    pub fn sys_wait(&self) -> Result<Pid, ()> {
        self.kernel().wait(self)
    }

    pub fn sys_kill(&self, pid: Pid) -> Result<(), ()> {
        self.kernel().kill(pid)
    }

    /// Grow the heap by `n` bytes (page-rounded); returns the previous
    /// break. `sbrk(0)` reads the break.
    pub fn sys_sbrk(&self, n: usize) -> Result<usize, ()> {
        let prev_brk = {
            let vs = self.proc().vspace.lock();
            let heap = vs.region(VR_HEAP);
            heap.va_base + heap.size
        };
        if n == 0 {
            return Ok(prev_brk);
        }
        let rounded = pgroundup(n);
        let ppns = self.kernel().alloc_upages(prev_brk, rounded)?;
        let mut cm = self.kernel().kmem().coremap();
        let mut vs = self.proc().vspace.lock();
        let added = vs.addmap(
            &mut cm,
            VR_HEAP,
            prev_brk,
            rounded,
            &ppns,
            VmFlags::VPI_PRESENT | VmFlags::VPI_WRITABLE,
        );
        vs.region_mut(VR_HEAP).size += added;
        vs.invalidate();
        Ok(prev_brk)
    }

    /// Give up the CPU for one scheduling round.
    pub fn sys_yield(&self) {
        self.kernel().procs().yield_cpu(self.slot());
    }

    pub fn sys_sysinfo(&self) -> SysInfo {
        let kernel = self.kernel();
        let (pages_in_use, pages_in_swap, free_pages) = {
            let cm = kernel.kmem().coremap();
            (cm.pages_in_use, cm.pages_in_swap, cm.free_pages)
        };
        SysInfo {
            pages_in_use,
            pages_in_swap,
            free_pages,
            num_disk_reads: kernel.fs().disk().num_reads(),
            num_page_faults: kernel.num_page_faults.load(Ordering::Relaxed),
        }
    }
}
