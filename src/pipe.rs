//! Pipes: unidirectional single-page byte channels.
//!
//! The buffer is not a ring: `read_off` chases `write_off` toward the end
//! of the page, and when the reader fully drains it while the writer is
//! still open, both offsets reset to the start. `size_left` is the room
//! left for the writer; writers sleep at zero until a full drain resets
//! the buffer, readers sleep while it is empty. Both ends rendezvous on
//! one channel.

use std::sync::Arc;

use crate::fcntl::FcntlFlags;
use crate::file::FileType;
use crate::kernel::Kernel;
use crate::lock::SpinLock;
use crate::param::PGSIZE;
use crate::proc::{KernelCtx, WaitChannel};

/// One page, minus the header bookkeeping that shares it.
pub const PIPESIZE: usize = PGSIZE - 64;

struct PipeInner {
    buff: Box<[u8; PIPESIZE]>,
    read_off: usize,
    write_off: usize,
    /// Invariant: `size_left == PIPESIZE - write_off`.
    size_left: usize,
    /// Read descriptors still open.
    read_ref_ct: u32,
    /// Write descriptors still open.
    write_ref_ct: u32,
}

pub struct Pipe {
    inner: SpinLock<PipeInner>,
    /// Readers and writers both sleep here.
    chan: WaitChannel,
}

impl Pipe {
    fn new() -> Self {
        Self {
            inner: SpinLock::new(
                "pipe",
                PipeInner {
                    buff: Box::new([0; PIPESIZE]),
                    read_off: 0,
                    write_off: 0,
                    size_left: PIPESIZE,
                    read_ref_ct: 1,
                    write_ref_ct: 1,
                },
            ),
            chan: WaitChannel::new(),
        }
    }

    /// Read up to `dst.len()` bytes. Returns 0 at end of file (empty pipe,
    /// no writer); sleeps while the pipe is empty and a writer remains.
    pub fn read(&self, ctx: &KernelCtx<'_>, dst: &mut [u8]) -> Result<usize, ()> {
        let mut inner = self.inner.lock();
        loop {
            if ctx.killed() {
                return Err(());
            }
            let available = inner.write_off - inner.read_off;
            if available == 0 {
                if inner.write_ref_ct == 0 {
                    return Ok(0);
                }
                self.chan.sleep(&mut inner, ctx);
                continue;
            }
            let n = dst.len().min(available);
            let start = inner.read_off;
            dst[..n].copy_from_slice(&inner.buff[start..start + n]);
            inner.read_off += n;
            // Fully drained with the writer still open: rewind so the
            // writer gets the whole page back.
            if inner.read_off == inner.write_off && inner.write_ref_ct > 0 {
                inner.read_off = 0;
                inner.write_off = 0;
                inner.size_left = PIPESIZE;
            }
            self.chan.wakeup(ctx.kernel());
            return Ok(n);
        }
    }

    /// Write up to `src.len()` bytes; may write fewer if the page fills.
    /// Fails on a broken pipe (no reader); sleeps while the page is full.
    pub fn write(&self, ctx: &KernelCtx<'_>, src: &[u8]) -> Result<usize, ()> {
        let mut inner = self.inner.lock();
        loop {
            if inner.read_ref_ct == 0 || ctx.killed() {
                return Err(());
            }
            if inner.size_left == 0 {
                self.chan.sleep(&mut inner, ctx);
                continue;
            }
            let n = src.len().min(inner.size_left);
            let start = inner.write_off;
            inner.buff[start..start + n].copy_from_slice(&src[..n]);
            inner.write_off += n;
            inner.size_left -= n;
            self.chan.wakeup(ctx.kernel());
            return Ok(n);
        }
    }

    /// Drop one end. Readers waiting on a vanished writer (and vice versa)
    /// are woken to observe it.
    pub(crate) fn close_side(&self, kernel: &Kernel, writable: bool) {
        let mut inner = self.inner.lock();
        if writable {
            inner.write_ref_ct -= 1;
        } else {
            inner.read_ref_ct -= 1;
        }
        drop(inner);
        self.chan.wakeup(kernel);
    }

    pub(crate) fn dup_side(&self, writable: bool) {
        let mut inner = self.inner.lock();
        if writable {
            inner.write_ref_ct += 1;
        } else {
            inner.read_ref_ct += 1;
        }
    }

    #[cfg(test)]
    fn offsets(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock();
        (inner.read_off, inner.write_off, inner.size_left)
    }
}

impl KernelCtx<'_> {
    /// Create a pipe; returns `(read_fd, write_fd)`.
    pub fn pipe_open(&self) -> Result<(usize, usize), ()> {
        let kernel = self.kernel();
        let pipe = Arc::new(Pipe::new());

        let r_idx = kernel.ftable().alloc(
            FileType::Pipe {
                pipe: Arc::clone(&pipe),
            },
            FcntlFlags::O_RDONLY,
        )?;
        let r_idx = scopeguard::guard(r_idx, |idx| kernel.ftable().close(kernel, idx));
        let w_idx = kernel.ftable().alloc(
            FileType::Pipe {
                pipe: Arc::clone(&pipe),
            },
            FcntlFlags::O_WRONLY,
        )?;
        let w_idx = scopeguard::guard(w_idx, |idx| kernel.ftable().close(kernel, idx));

        let read_fd = self.fdalloc(*r_idx)?;
        let read_fd = scopeguard::guard(read_fd, |fd| {
            let _ = self.proc().data.lock().open_files[fd].take();
        });
        let write_fd = self.fdalloc(*w_idx)?;

        // Both descriptors are installed; defuse the cleanups.
        let read_fd = scopeguard::ScopeGuard::into_inner(read_fd);
        let _ = scopeguard::ScopeGuard::into_inner(r_idx);
        let _ = scopeguard::ScopeGuard::into_inner(w_idx);
        Ok((read_fd, write_fd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_resets_offsets_while_writer_open() {
        let pipe = Pipe::new();
        {
            let mut inner = pipe.inner.lock();
            inner.buff[..5].copy_from_slice(b"hello");
            inner.write_off = 5;
            inner.size_left = PIPESIZE - 5;
        }
        {
            let mut inner = pipe.inner.lock();
            // Simulate the reader's copy without a process context.
            let mut dst = [0u8; 5];
            let n = 5.min(inner.write_off - inner.read_off);
            dst[..n].copy_from_slice(&inner.buff[..n]);
            inner.read_off += n;
            if inner.read_off == inner.write_off && inner.write_ref_ct > 0 {
                inner.read_off = 0;
                inner.write_off = 0;
                inner.size_left = PIPESIZE;
            }
            assert_eq!(&dst, b"hello");
        }
        assert_eq!(pipe.offsets(), (0, 0, PIPESIZE));
    }
}
