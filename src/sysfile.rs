//! File-system system calls. Mostly argument checking, since we don't
//! trust user code, and calls into file.rs and fs/.

use crate::fcntl::FcntlFlags;
use crate::fs::{Path, Stat};
use crate::proc::KernelCtx;

impl KernelCtx<'_> {
    /// Open `path` with `mode` and return the smallest free descriptor.
    /// `O_CREATE` creates the file first if it is absent.
    pub fn sys_open(&self, path: &str, mode: FcntlFlags) -> Result<usize, ()> {
        if mode.contains(FcntlFlags::O_CREATE) {
            self.kernel().fs().file_create(*self, Path::new(path))?;
        }
        self.file_open(path, mode & !FcntlFlags::O_CREATE)
    }

    /// Close the passed-in file descriptor.
    pub fn sys_close(&self, fd: usize) -> Result<(), ()> {
        self.file_close(fd)
    }

    /// Duplicate `fd` onto the smallest free descriptor.
    pub fn sys_dup(&self, fd: usize) -> Result<usize, ()> {
        self.file_dup(fd)
    }

    /// Read up to `dst.len()` bytes from `fd` into a kernel buffer.
    pub fn sys_read(&self, fd: usize, dst: &mut [u8]) -> Result<usize, ()> {
        self.file_read(fd, dst)
    }

    /// Write `src` to `fd` from a kernel buffer.
    pub fn sys_write(&self, fd: usize, src: &[u8]) -> Result<usize, ()> {
        self.file_write(fd, src)
    }

    /// Read from `fd` into this process's memory at `va`.
    pub fn sys_read_user(&self, fd: usize, va: usize, n: usize) -> Result<usize, ()> {
        let mut buf = vec![0u8; n];
        let read = self.file_read(fd, &mut buf)?;
        self.copy_out(va, &buf[..read])?;
        Ok(read)
    }

    /// Write to `fd` from this process's memory at `va`.
    pub fn sys_write_user(&self, fd: usize, va: usize, n: usize) -> Result<usize, ()> {
        let mut buf = vec![0u8; n];
        self.copy_in(va, &mut buf)?;
        self.file_write(fd, &buf)
    }

    /// Populate a stat record for `fd`.
    pub fn sys_fstat(&self, fd: usize) -> Result<Stat, ()> {
        self.file_stat(fd)
    }

    /// Create a pipe; returns `(read_fd, write_fd)`.
    pub fn sys_pipe(&self) -> Result<(usize, usize), ()> {
        self.pipe_open()
    }

    /// Remove the regular file at `path`.
    pub fn sys_delete(&self, path: &str) -> Result<(), ()> {
        self.kernel().fs().file_delete(*self, Path::new(path))
    }
}
