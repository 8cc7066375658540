//! Inodes.
//!
//! An inode describes a single unnamed file. The inode disk structure
//! holds metadata: the file's type, its size, and the extent of blocks
//! holding the file's content.
//!
//! The inodes themselves are contained in a file known as the inodefile.
//! This allows the number of inodes to grow dynamically by appending to
//! the end of the inode file. The inodefile has an inum of 0 and starts
//! at sb.inodestart.
//!
//! The kernel keeps a cache of in-use inodes in memory to provide a place
//! for synchronizing access to inodes used by multiple processes. The
//! cached inodes include book-keeping information that is not stored on
//! disk: the reference count and the valid flag.
//!
//! Clients use `iget` to find the slot for an inum, `lock` (`locki`) to
//! populate it from disk and get exclusive access, and `irelease` to drop
//! an in-memory reference, freeing the slot for reuse once the count
//! reaches zero.
//!
//! Lock discipline: the icache spin lock protects slot identity and
//! reference counts; each slot's sleep lock protects everything else. The
//! sleep lock of a file is acquired before the inodefile's, and a
//! transaction (`Tx`) is begun before any inode sleep lock is taken.

use core::mem;

use array_macro::array;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::fs::stat::{Stat, T_DEV, T_DIR, T_FILE};
use crate::fs::{FileSystem, Tx};
use crate::lock::{SleepLock, SleepLockGuard, SpinLock};
use crate::param::{BSIZE, NINODE, ROOTDEV};
use crate::proc::KernelCtx;

/// inode file inum
pub const INODEFILEINO: u32 = 0;
/// root i-number
pub const ROOTINO: u32 = 1;

/// A file's data occupies `nblocks` contiguous disk blocks starting at
/// `startblkno`.
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct Extent {
    pub startblkno: u32,
    pub nblocks: u32,
}

/// On-disk inode structure, packed so disk inodes fit contiguously.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct Dinode {
    /// File type
    pub typ: i16,

    /// Device number (T_DEV only)
    pub devid: i16,

    /// Size of file (bytes)
    pub size: u32,

    pub max_size: u32,

    /// Data blocks of file on disk
    pub data: Extent,

    pub pad: [u32; 11],
}

const_assert_eq!(mem::size_of::<Dinode>(), 64);

impl Dinode {
    pub const fn zero() -> Self {
        Self {
            typ: 0,
            devid: 0,
            size: 0,
            max_size: 0,
            data: Extent {
                startblkno: 0,
                nblocks: 0,
            },
            pad: [0; 11],
        }
    }
}

/// Byte offset of an inode in the inodefile.
pub const fn inodeoff(inum: u32) -> u32 {
    inum * mem::size_of::<Dinode>() as u32
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InodeType {
    None,
    Dir,
    File,
    Device,
}

impl InodeType {
    /// An unknown on-disk type is corruption, which is fatal.
    pub fn from_disk(typ: i16) -> Self {
        match typ {
            0 => InodeType::None,
            T_DIR => InodeType::Dir,
            T_FILE => InodeType::File,
            T_DEV => InodeType::Device,
            _ => panic!("inode: unknown type {}", typ),
        }
    }

    pub fn to_disk(self) -> i16 {
        match self {
            InodeType::None => 0,
            InodeType::Dir => T_DIR,
            InodeType::File => T_FILE,
            InodeType::Device => T_DEV,
        }
    }
}

/// In-memory copy of an inode's disk fields, plus the valid flag.
pub struct InodeInner {
    /// Has the dinode been read from disk?
    pub valid: bool,
    pub typ: InodeType,
    pub devid: i16,
    pub size: u32,
    pub max_size: u32,
    pub data: Extent,
}

impl InodeInner {
    const fn empty() -> Self {
        Self {
            valid: false,
            typ: InodeType::None,
            devid: 0,
            size: 0,
            max_size: 0,
            data: Extent {
                startblkno: 0,
                nblocks: 0,
            },
        }
    }
}

/// Identity and reference count of a cache slot. Guarded by `Itable::ctl`.
#[derive(Copy, Clone)]
struct IcacheEntry {
    dev: u32,
    inum: u32,
    refc: u32,
}

pub struct Itable {
    ctl: SpinLock<[IcacheEntry; NINODE]>,
    slots: Box<[SleepLock<InodeInner>; NINODE]>,
    /// The inodefile itself; pinned at boot and never recycled.
    inodefile: SleepLock<InodeInner>,
}

/// A reference-counted handle to an inode cache slot. The slot cannot be
/// recycled while a handle exists; drop the handle with
/// `FileSystem::irelease`.
#[derive(Copy, Clone)]
pub struct InodeRef {
    pub(crate) slot: usize,
    pub dev: u32,
    pub inum: u32,
}

impl Itable {
    pub(crate) fn new() -> Self {
        Self {
            ctl: SpinLock::new(
                "icache",
                [IcacheEntry {
                    dev: 0,
                    inum: 0,
                    refc: 0,
                }; NINODE],
            ),
            slots: Box::new(array![_ => SleepLock::new("inode", InodeInner::empty()); NINODE]),
            inodefile: SleepLock::new("inodefile", InodeInner::empty()),
        }
    }

    /// Find the inodefile on the disk and load it into memory.
    /// Called once at boot, before anything else touches the cache.
    pub(crate) fn init_inodefile(&mut self, disk: &dyn crate::disk::Disk, inodestart: u32) {
        let mut buf = [0u8; BSIZE];
        disk.read(inodestart, &mut buf);
        let mut di = Dinode::zero();
        di.as_bytes_mut()
            .copy_from_slice(&buf[..mem::size_of::<Dinode>()]);

        let inner = self.inodefile.get_mut();
        inner.valid = true;
        inner.typ = InodeType::from_disk(di.typ);
        inner.devid = di.devid;
        inner.size = di.size;
        inner.max_size = di.data.nblocks * BSIZE as u32;
        inner.data = di.data;
    }

    /// Find the inode with number `inum` on device `dev` and return an
    /// in-memory reference to it. Does not read the inode from disk.
    pub(crate) fn iget(&self, dev: u32, inum: u32) -> InodeRef {
        let mut ctl = self.ctl.lock();

        // Is the inode already cached?
        let mut empty = None;
        for (i, e) in ctl.iter_mut().enumerate() {
            if e.refc > 0 && e.dev == dev && e.inum == inum {
                e.refc += 1;
                return InodeRef { slot: i, dev, inum };
            }
            if empty.is_none() && e.refc == 0 {
                empty = Some(i);
            }
        }

        // Recycle an inode cache entry.
        let slot = empty.expect("iget: no inodes");
        ctl[slot] = IcacheEntry {
            dev,
            inum,
            refc: 1,
        };
        // SAFETY: refc was 0, so no guard exists and none can be taken
        // before the new identity is published under ctl.
        unsafe { (*self.slots[slot].get_mut_raw()).valid = false };
        InodeRef { slot, dev, inum }
    }

    /// Increment the reference count for `ip`.
    /// Returns a second handle to enable the `ip = idup(ip1)` idiom.
    pub(crate) fn idup(&self, ip: InodeRef) -> InodeRef {
        let mut ctl = self.ctl.lock();
        ctl[ip.slot].refc += 1;
        ip
    }

    /// Drop a reference to an in-memory inode. If that was the last
    /// reference, the cache entry can be recycled.
    pub(crate) fn irelease(&self, ip: InodeRef) {
        let mut ctl = self.ctl.lock();
        if ctl[ip.slot].refc == 1 {
            // SAFETY: this was the only reference, so no guard exists.
            unsafe {
                let inner = &mut *self.slots[ip.slot].get_mut_raw();
                inner.typ = InodeType::None;
                inner.valid = false;
            }
        }
        ctl[ip.slot].refc -= 1;
    }

    /// Whether any in-memory reference to `(dev, inum)` exists.
    pub(crate) fn busy(&self, dev: u32, inum: u32) -> bool {
        let ctl = self.ctl.lock();
        ctl.iter()
            .any(|e| e.refc > 0 && e.dev == dev && e.inum == inum)
    }
}

/// A locked inode: the slot's sleep lock is held and the disk fields are
/// valid. Obtained from `FileSystem::locki` or `lock_inodefile`.
pub struct InodeGuard<'s> {
    pub dev: u32,
    pub inum: u32,
    pub(crate) fs: &'s FileSystem,
    pub(crate) ctx: KernelCtx<'s>,
    pub(crate) inner: SleepLockGuard<'s, InodeInner>,
}

impl core::ops::Deref for InodeGuard<'_> {
    type Target = InodeInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl core::ops::DerefMut for InodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl FileSystem {
    /// Lock the given inode, reading it from disk if necessary.
    pub fn locki<'s>(&'s self, ip: InodeRef, ctx: KernelCtx<'s>) -> InodeGuard<'s> {
        let inner = self.itable.slots[ip.slot].lock(ctx);
        let mut guard = InodeGuard {
            dev: ip.dev,
            inum: ip.inum,
            fs: self,
            ctx,
            inner,
        };
        if !guard.valid {
            let dip = {
                let mut inodefile = self.lock_inodefile(ctx);
                self.read_dinode(&mut inodefile, ip.inum)
            };
            guard.typ = InodeType::from_disk(dip.typ);
            guard.devid = dip.devid;
            guard.size = dip.size;
            guard.max_size = dip.max_size;
            guard.data = dip.data;
            guard.valid = true;
            if guard.typ == InodeType::None {
                panic!("iget: no type");
            }
        }
        guard
    }

    /// Lock the inodefile. Acquired after any regular inode lock a caller
    /// holds, never before.
    pub fn lock_inodefile<'s>(&'s self, ctx: KernelCtx<'s>) -> InodeGuard<'s> {
        let inner = self.itable.inodefile.lock(ctx);
        InodeGuard {
            dev: ROOTDEV,
            inum: INODEFILEINO,
            fs: self,
            ctx,
            inner,
        }
    }

    /// Read the dinode with the passed inum out of the inodefile.
    pub(crate) fn read_dinode(&self, inodefile: &mut InodeGuard<'_>, inum: u32) -> Dinode {
        let mut dip = Dinode::zero();
        let n = inodefile
            .readi(dip.as_bytes_mut(), inodeoff(inum))
            .expect("read_dinode");
        assert_eq!(n, mem::size_of::<Dinode>(), "read_dinode");
        dip.max_size = dip.data.nblocks * BSIZE as u32;
        dip
    }

    /// Write the dinode with the passed inum into the inodefile, through
    /// the log.
    pub(crate) fn write_dinode(
        &self,
        inodefile: &mut InodeGuard<'_>,
        tx: &mut Tx<'_>,
        inum: u32,
        dip: &Dinode,
    ) {
        let n = inodefile
            .writei(dip.as_bytes(), inodeoff(inum), tx)
            .expect("write_dinode");
        assert_eq!(n, mem::size_of::<Dinode>(), "write_dinode");
    }

    /// Threadsafe readi.
    pub fn concurrent_readi(
        &self,
        ctx: KernelCtx<'_>,
        ip: InodeRef,
        dst: &mut [u8],
        off: u32,
    ) -> Result<usize, ()> {
        let mut guard = self.locki(ip, ctx);
        guard.readi(dst, off)
    }

    /// Threadsafe writei. The whole operation is one transaction: the data
    /// blocks and the updated dinode commit together when the transaction
    /// drops.
    pub fn concurrent_writei(
        &self,
        ctx: KernelCtx<'_>,
        ip: InodeRef,
        src: &[u8],
        off: u32,
    ) -> Result<usize, ()> {
        let mut tx = self.begin_tx(ctx);
        let mut guard = self.locki(ip, ctx);
        let n = guard.writei(src, off, &mut tx)?;
        let dip = guard.to_dinode();
        let inum = guard.inum;
        let is_dev = guard.typ == InodeType::Device;
        drop(guard);
        if !is_dev {
            let mut inodefile = self.lock_inodefile(ctx);
            self.write_dinode(&mut inodefile, &mut tx, inum, &dip);
        }
        Ok(n)
    }

    /// Threadsafe stati.
    pub fn concurrent_stati(&self, ctx: KernelCtx<'_>, ip: InodeRef) -> Stat {
        self.locki(ip, ctx).stati()
    }

    pub(crate) fn iget(&self, dev: u32, inum: u32) -> InodeRef {
        self.itable.iget(dev, inum)
    }

    pub(crate) fn idup(&self, ip: InodeRef) -> InodeRef {
        self.itable.idup(ip)
    }

    pub fn irelease(&self, ip: InodeRef) {
        self.itable.irelease(ip)
    }
}

impl InodeGuard<'_> {
    /// Read data from the inode into `dst`, starting at byte `off`.
    /// Returns the number of bytes read. Device inodes dispatch to the
    /// device switch.
    pub fn readi(&mut self, dst: &mut [u8], off: u32) -> Result<usize, ()> {
        if self.typ == InodeType::Device {
            let dev = self.ctx.kernel().devsw(self.devid).ok_or(())?;
            let read = dev.read.ok_or(())?;
            return read(&self.ctx, dst);
        }

        let n = dst.len() as u32;
        if off > self.size || off.checked_add(n).is_none() {
            return Err(());
        }
        let n = n.min(self.size - off);

        let mut tot: u32 = 0;
        while tot < n {
            let cur = off + tot;
            let bp = self.fs.bcache.bread(
                self.dev,
                self.data.startblkno + cur / BSIZE as u32,
                self.ctx,
            );
            let boff = (cur % BSIZE as u32) as usize;
            let m = (n - tot).min(BSIZE as u32 - boff as u32) as usize;
            dst[tot as usize..tot as usize + m].copy_from_slice(&bp.data()[boff..boff + m]);
            tot += m as u32;
        }
        Ok(n as usize)
    }

    /// Write data to the inode through the log, starting at byte `off`.
    /// Grows `size` up to `max_size`; writing past `max_size` is a
    /// programming error and fatal. The caller owns the enclosing
    /// transaction and persists the dinode afterwards.
    pub fn writei(&mut self, src: &[u8], off: u32, tx: &mut Tx<'_>) -> Result<usize, ()> {
        if self.typ == InodeType::Device {
            let dev = self.ctx.kernel().devsw(self.devid).ok_or(())?;
            let write = dev.write.ok_or(())?;
            return write(&self.ctx, src);
        }

        let n = src.len() as u32;
        let new_size = match off.checked_add(n) {
            Some(s) => s,
            None => return Err(()),
        };
        if new_size > self.max_size {
            panic!("writei: exceeding max size");
        }

        let mut tot: u32 = 0;
        while tot < n {
            let cur = off + tot;
            let mut bp = self.fs.bcache.bread(
                self.dev,
                self.data.startblkno + cur / BSIZE as u32,
                self.ctx,
            );
            let boff = (cur % BSIZE as u32) as usize;
            let m = (n - tot).min(BSIZE as u32 - boff as u32) as usize;
            bp.data_mut()[boff..boff + m].copy_from_slice(&src[tot as usize..tot as usize + m]);
            tx.write(&mut bp);
            tot += m as u32;
        }

        if new_size > self.size {
            self.size = new_size;
        }
        Ok(n as usize)
    }

    /// Copy stat information from the inode.
    pub fn stati(&self) -> Stat {
        Stat {
            dev: self.dev,
            ino: self.inum,
            typ: self.typ.to_disk(),
            size: self.size,
        }
    }

    /// The on-disk rendering of the current in-memory fields.
    pub fn to_dinode(&self) -> Dinode {
        Dinode {
            typ: self.typ.to_disk(),
            devid: self.devid,
            size: self.size,
            max_size: self.max_size,
            data: self.data,
            pad: [0; 11],
        }
    }
}
