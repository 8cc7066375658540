use crate::kernel::Kernel;
use crate::proc::{Pid, Proc};

/// A handle naming the kernel and the process a piece of kernel code runs
/// on behalf of. Every syscall-layer operation hangs off one of these, so
/// tests can drive any process explicitly instead of relying on an ambient
/// "current process".
#[derive(Clone, Copy)]
pub struct KernelCtx<'a> {
    kernel: &'a Kernel,
    slot: usize,
    pid: Pid,
}

impl<'a> KernelCtx<'a> {
    pub(crate) fn new(kernel: &'a Kernel, slot: usize) -> Self {
        let pid = kernel.procs().pid_of(slot);
        Self { kernel, slot, pid }
    }

    pub fn kernel(&self) -> &'a Kernel {
        self.kernel
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn proc(&self) -> &'a Proc {
        self.kernel.procs().proc(self.slot)
    }

    /// Whether this process has been killed.
    pub fn killed(&self) -> bool {
        self.proc().killed()
    }
}
