use crate::kernel::Kernel;
use crate::lock::Waitable;
use crate::proc::KernelCtx;

/// A rendezvous point for `sleep`/`wakeup`. The channel carries no data;
/// its *address* is the token processes sleep on.
pub struct WaitChannel {
    /// Required to make this type non-zero-sized. If it were zero-sized,
    /// multiple wait channels may have the same address, spuriously waking
    /// up more threads.
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    /// The opaque key processes record while sleeping on this channel.
    pub fn token(&self) -> usize {
        self as *const WaitChannel as usize
    }

    /// Atomically release the lock behind `lk` and sleep on this channel.
    /// Reacquires the lock when awakened.
    ///
    /// The process-table lock is taken before the raw lock is released, so a
    /// concurrent `wakeup` cannot slip between the release and the state
    /// change (wakeup runs with the process-table lock held).
    pub fn sleep<W: Waitable>(&self, lk: &mut W, ctx: &KernelCtx<'_>) {
        ctx.kernel().procs().sleep(self.token(), lk, ctx.slot());
    }

    /// Wake up all processes sleeping on this channel.
    /// Must be called without holding any spin lock ordered after the
    /// process table.
    pub fn wakeup(&self, kernel: &Kernel) {
        kernel.procs().wakeup(self.token());
    }
}
