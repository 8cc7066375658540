//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk block contents. Caching
//! disk blocks in memory reduces the number of disk reads and also provides
//! a synchronization point for disk blocks used by multiple processes.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call bread.
//! * After changing buffer data, call bwrite to write it to disk.
//! * Dropping the buffer releases it.
//! * Only one process at a time can use a buffer, so do not keep them
//!   longer than necessary.
//!
//! The control plane (which block a slot caches, reference counts, LRU
//! ticks) sits behind a spin lock; each slot's data sits behind its own
//! sleep lock, held for the duration of a `Buf`.

use std::sync::Arc;

use array_macro::array;

use crate::disk::Disk;
use crate::lock::{SleepLock, SleepLockGuard, SpinLock};
use crate::param::{BSIZE, NBUF};
use crate::proc::KernelCtx;

/// Data in a buffer may be viewed as 4-byte-aligned records (dinodes, log
/// records), so the byte array carries that alignment.
#[repr(align(4))]
pub struct BufData {
    pub inner: [u8; BSIZE],
}

pub struct BufInner {
    /// Has data been read from disk?
    valid: bool,
    data: BufData,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: false,
            data: BufData { inner: [0; BSIZE] },
        }
    }
}

/// Control-plane state of one cache slot. Guarded by `Bcache::ctl`.
#[derive(Copy, Clone)]
struct BufMeta {
    dev: u32,
    blockno: u32,
    refcnt: u32,
    /// Tick of the last release, for LRU recycling.
    lru: u64,
}

struct BcacheCtl {
    meta: [BufMeta; NBUF],
    ticks: u64,
}

pub struct Bcache {
    disk: Arc<dyn Disk>,
    ctl: SpinLock<BcacheCtl>,
    entries: Box<[SleepLock<BufInner>; NBUF]>,
}

/// A locked buffer: the slot's sleep lock is held and the cached identity
/// `(dev, blockno)` is pinned by the reference count. Dropping the `Buf`
/// releases both.
pub struct Buf<'s> {
    cache: &'s Bcache,
    slot: usize,
    pub blockno: u32,
    /// Present until drop; the sleep lock is released before the slot's
    /// reference count is given back, so a recycler never sees a live
    /// guard on a zero-reference slot.
    guard: Option<SleepLockGuard<'s, BufInner>>,
}

impl Bcache {
    pub(crate) fn new(disk: Arc<dyn Disk>) -> Self {
        Self {
            disk,
            ctl: SpinLock::new(
                "bcache",
                BcacheCtl {
                    // `u32::MAX` marks a slot that has never cached a block.
                    meta: [BufMeta {
                        dev: u32::MAX,
                        blockno: 0,
                        refcnt: 0,
                        lru: 0,
                    }; NBUF],
                    ticks: 0,
                },
            ),
            entries: Box::new(array![_ => SleepLock::new("buffer", BufInner::new()); NBUF]),
        }
    }

    /// Look through the cache for block `blockno` on device `dev`; allocate
    /// the least-recently-used free slot if not cached.
    fn bget<'s>(&'s self, dev: u32, blockno: u32, ctx: KernelCtx<'s>) -> Buf<'s> {
        let slot = {
            let mut ctl = self.ctl.lock();

            // Is the block already cached?
            let mut found = None;
            for (i, m) in ctl.meta.iter().enumerate() {
                if m.dev == dev && m.blockno == blockno {
                    found = Some(i);
                    break;
                }
            }
            match found {
                Some(i) => {
                    ctl.meta[i].refcnt += 1;
                    i
                }
                None => {
                    // Recycle the least recently used unreferenced buffer.
                    let mut victim = None;
                    for (i, m) in ctl.meta.iter().enumerate() {
                        if m.refcnt == 0 && victim.map_or(true, |(_, lru)| m.lru < lru) {
                            victim = Some((i, m.lru));
                        }
                    }
                    let (i, _) = victim.expect("bget: no buffers");
                    ctl.meta[i] = BufMeta {
                        dev,
                        blockno,
                        refcnt: 1,
                        lru: 0,
                    };
                    // SAFETY: refcnt was 0, so no one holds or can be
                    // acquiring this slot's sleep lock with the old
                    // identity; the new identity is published under ctl.
                    unsafe { (*self.entries[i].get_mut_raw()).valid = false };
                    i
                }
            }
        };

        let guard = self.entries[slot].lock(ctx);
        Buf {
            cache: self,
            slot,
            blockno,
            guard: Some(guard),
        }
    }

    /// Return a locked buf with the contents of the indicated block.
    pub fn bread<'s>(&'s self, dev: u32, blockno: u32, ctx: KernelCtx<'s>) -> Buf<'s> {
        let mut b = self.bget(dev, blockno, ctx);
        let inner = b.inner_mut();
        if !inner.valid {
            self.disk.read(blockno, &mut inner.data.inner);
            inner.valid = true;
        }
        b
    }
}

impl Buf<'_> {
    fn inner(&self) -> &BufInner {
        self.guard.as_ref().expect("buf")
    }

    fn inner_mut(&mut self) -> &mut BufInner {
        self.guard.as_mut().expect("buf")
    }

    pub fn data(&self) -> &[u8; BSIZE] {
        &self.inner().data.inner
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.inner_mut().data.inner
    }

    /// Write the buffer's contents to disk. Caller still holds the buffer.
    pub fn bwrite(&mut self) {
        let blockno = self.blockno;
        self.cache.disk.write(blockno, &self.inner().data.inner);
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        // Release the slot's sleep lock first, then give the reference
        // back under the control lock.
        let _ = self.guard.take();
        let mut ctl = self.cache.ctl.lock();
        ctl.ticks += 1;
        let ticks = ctl.ticks;
        let m = &mut ctl.meta[self.slot];
        m.refcnt -= 1;
        m.lru = ticks;
    }
}
