//! File descriptors and the global file table.
//!
//! A per-process descriptor is an index into the global `FTable`, whose
//! slots (`Finfo`) carry a reference count, the access mode, the I/O
//! offset, and the open object itself: an inode, a device inode, or one
//! end of a pipe. The tagged enum replaces the classic pointer-encoded
//! union dispatched on a type field.

use std::sync::Arc;

use array_macro::array;

use crate::fcntl::FcntlFlags;
use crate::fs::{InodeRef, Stat};
use crate::kernel::Kernel;
use crate::lock::SpinLock;
use crate::param::{NFILE, NOFILE};
use crate::pipe::Pipe;
use crate::proc::KernelCtx;

#[derive(Clone)]
pub enum FileType {
    Inode { ip: InodeRef },
    Device { ip: InodeRef, devid: i16 },
    Pipe { pipe: Arc<Pipe> },
}

/// One open file. `ref_ct == 0` iff the slot is free; descriptors from any
/// process sharing the slot each contribute one reference.
pub struct Finfo {
    pub ref_ct: u32,
    /// I/O position. Reserved for pipes.
    pub offset: u32,
    pub access: FcntlFlags,
    pub typ: FileType,
}

/// Map device id to device functions.
#[derive(Copy, Clone)]
pub struct Devsw {
    pub read: Option<fn(&KernelCtx<'_>, &mut [u8]) -> Result<usize, ()>>,
    pub write: Option<fn(&KernelCtx<'_>, &[u8]) -> Result<usize, ()>>,
}

pub struct FTable {
    ctl: SpinLock<Box<[Option<Finfo>; NFILE]>>,
}

impl FTable {
    pub(crate) fn new() -> Self {
        Self {
            ctl: SpinLock::new("ftable", Box::new(array![_ => None; NFILE])),
        }
    }

    /// Allocate a file table slot.
    pub(crate) fn alloc(&self, typ: FileType, access: FcntlFlags) -> Result<usize, ()> {
        let mut ctl = self.ctl.lock();
        for (i, slot) in ctl.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Finfo {
                    ref_ct: 1,
                    offset: 0,
                    access,
                    typ,
                });
                return Ok(i);
            }
        }
        Err(())
    }

    /// Take one more reference on a slot; pipes also count the shared end.
    pub(crate) fn dup(&self, idx: usize) {
        let mut ctl = self.ctl.lock();
        let f = ctl[idx].as_mut().expect("ftable dup: free slot");
        f.ref_ct += 1;
        if let FileType::Pipe { pipe } = &f.typ {
            pipe.dup_side(f.access.writable());
        }
    }

    /// Drop one reference; the last one releases the open object. The
    /// inode release happens after the table lock is dropped (the icache
    /// lock is ordered before the file table's).
    pub(crate) fn close(&self, kernel: &Kernel, idx: usize) {
        let last = {
            let mut ctl = self.ctl.lock();
            let f = ctl[idx].as_mut().expect("ftable close: free slot");
            f.ref_ct -= 1;
            if f.ref_ct == 0 {
                ctl[idx].take()
            } else {
                // A surviving slot still gives up this descriptor's pipe
                // end.
                if let FileType::Pipe { pipe } = &f.typ {
                    let pipe = Arc::clone(pipe);
                    let writable = f.access.writable();
                    drop(ctl);
                    pipe.close_side(kernel, writable);
                }
                return;
            }
        };
        if let Some(f) = last {
            match f.typ {
                FileType::Inode { ip } | FileType::Device { ip, .. } => {
                    kernel.fs().irelease(ip);
                }
                FileType::Pipe { pipe } => {
                    pipe.close_side(kernel, f.access.writable());
                    // The pipe's page goes away with its last Arc.
                }
            }
        }
    }

    /// Snapshot a slot's object and offset for an I/O operation.
    fn get(&self, idx: usize) -> (FileType, FcntlFlags, u32) {
        let ctl = self.ctl.lock();
        let f = ctl[idx].as_ref().expect("ftable get: free slot");
        (f.typ.clone(), f.access, f.offset)
    }

    fn advance_offset(&self, idx: usize, n: u32) {
        let mut ctl = self.ctl.lock();
        if let Some(f) = ctl[idx].as_mut() {
            f.offset = f.offset.wrapping_add(n);
        }
    }
}

impl KernelCtx<'_> {
    /// The smallest free file descriptor of the current process, reserved
    /// for `idx`.
    pub(crate) fn fdalloc(&self, idx: usize) -> Result<usize, ()> {
        let mut data = self.proc().data.lock();
        for fd in 0..NOFILE {
            if data.open_files[fd].is_none() {
                data.open_files[fd] = Some(idx);
                return Ok(fd);
            }
        }
        Err(())
    }

    pub(crate) fn fd_lookup(&self, fd: usize) -> Result<usize, ()> {
        if fd >= NOFILE {
            return Err(());
        }
        self.proc().data.lock().open_files[fd].ok_or(())
    }

    /// Open the file at `path` with the given mode and return the smallest
    /// free descriptor.
    pub fn file_open(&self, path: &str, mode: FcntlFlags) -> Result<usize, ()> {
        let kernel = self.kernel();
        let fs = kernel.fs();
        let ip = fs.namei(*self, crate::fs::Path::new(path))?;

        let (typ, writable_object) = {
            let guard = fs.locki(ip, *self);
            match guard.typ {
                crate::fs::InodeType::Device => {
                    let devid = guard.devid;
                    (FileType::Device { ip, devid }, true)
                }
                crate::fs::InodeType::File => (FileType::Inode { ip }, true),
                // Directories are read-only through the fd layer.
                crate::fs::InodeType::Dir => (FileType::Inode { ip }, false),
                crate::fs::InodeType::None => {
                    drop(guard);
                    fs.irelease(ip);
                    return Err(());
                }
            }
        };
        if mode.writable() && !writable_object {
            fs.irelease(ip);
            return Err(());
        }

        let idx = match kernel.ftable().alloc(typ, mode) {
            Ok(idx) => idx,
            Err(()) => {
                fs.irelease(ip);
                return Err(());
            }
        };
        match self.fdalloc(idx) {
            Ok(fd) => Ok(fd),
            Err(()) => {
                kernel.ftable().close(kernel, idx);
                Err(())
            }
        }
    }

    /// Close the given descriptor.
    pub fn file_close(&self, fd: usize) -> Result<(), ()> {
        let idx = {
            let mut data = self.proc().data.lock();
            if fd >= NOFILE {
                return Err(());
            }
            data.open_files[fd].take().ok_or(())?
        };
        self.kernel().ftable().close(self.kernel(), idx);
        Ok(())
    }

    /// Duplicate `fd` into the smallest free descriptor.
    pub fn file_dup(&self, fd: usize) -> Result<usize, ()> {
        let idx = self.fd_lookup(fd)?;
        let new_fd = self.fdalloc(idx)?;
        self.kernel().ftable().dup(idx);
        Ok(new_fd)
    }

    /// Read up to `dst.len()` bytes from `fd`. Regular files advance the
    /// shared offset by the bytes read.
    pub fn file_read(&self, fd: usize, dst: &mut [u8]) -> Result<usize, ()> {
        let idx = self.fd_lookup(fd)?;
        let (typ, access, offset) = self.kernel().ftable().get(idx);
        if !access.readable() {
            return Err(());
        }
        match typ {
            FileType::Inode { ip } => {
                let n = self.kernel().fs().concurrent_readi(*self, ip, dst, offset)?;
                self.kernel().ftable().advance_offset(idx, n as u32);
                Ok(n)
            }
            FileType::Device { devid, .. } => {
                let dev = self.kernel().devsw(devid).ok_or(())?;
                let read = dev.read.ok_or(())?;
                read(self, dst)
            }
            FileType::Pipe { pipe } => pipe.read(self, dst),
        }
    }

    /// Write `src` to `fd`. Regular files go through the log in chunks
    /// small enough that one chunk's transaction fits the record table.
    pub fn file_write(&self, fd: usize, src: &[u8]) -> Result<usize, ()> {
        let idx = self.fd_lookup(fd)?;
        let (typ, access, offset) = self.kernel().ftable().get(idx);
        if !access.writable() {
            return Err(());
        }
        match typ {
            FileType::Inode { ip } => {
                // Writing past max_size is fatal inside writei; the fd
                // layer clamps so user writes surface a short count or an
                // error instead.
                let max_size = self.kernel().fs().locki(ip, *self).max_size;
                let writable_len = (max_size.saturating_sub(offset) as usize).min(src.len());
                if writable_len == 0 && !src.is_empty() {
                    return Err(());
                }
                let src = &src[..writable_len];

                // Write a few blocks at a time to avoid exceeding the
                // maximum log transaction size: the data blocks plus the
                // dinode update and slop must fit in LOGSIZE records.
                let max = (crate::param::MAXOPBLOCKS - 2) * crate::param::BSIZE;
                let mut written = 0;
                while written < src.len() {
                    let end = (written + max).min(src.len());
                    let off = offset + written as u32;
                    let n = self.kernel().fs().concurrent_writei(
                        *self,
                        ip,
                        &src[written..end],
                        off,
                    )?;
                    written += n;
                    if n == 0 {
                        break;
                    }
                }
                self.kernel().ftable().advance_offset(idx, written as u32);
                if written == 0 && !src.is_empty() {
                    Err(())
                } else {
                    Ok(written)
                }
            }
            FileType::Device { devid, .. } => {
                let dev = self.kernel().devsw(devid).ok_or(())?;
                let write = dev.write.ok_or(())?;
                write(self, src)
            }
            FileType::Pipe { pipe } => pipe.write(self, src),
        }
    }

    /// Get metadata about `fd`; pipes have none.
    pub fn file_stat(&self, fd: usize) -> Result<Stat, ()> {
        let idx = self.fd_lookup(fd)?;
        let (typ, _, _) = self.kernel().ftable().get(idx);
        match typ {
            FileType::Inode { ip } | FileType::Device { ip, .. } => {
                Ok(self.kernel().fs().concurrent_stati(*self, ip))
            }
            FileType::Pipe { .. } => Err(()),
        }
    }
}
