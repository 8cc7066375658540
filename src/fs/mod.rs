//! File system implementation. Five layers:
//!   + Blocks: extent allocator for raw disk blocks.
//!   + Log: crash recovery for multi-step updates.
//!   + Files: inode allocator, reading, writing, metadata.
//!   + Directories: inode with special contents (list of other inodes!)
//!   + Names: paths like /console for convenient naming.
//!
//! This module contains the low-level file system manipulation routines.
//! The (higher-level) system call implementations are in sysfile.rs.

use std::sync::Arc;

use itertools::Itertools;
use spin::Once;
use zerocopy::AsBytes;

use crate::bio::Bcache;
use crate::disk::Disk;
use crate::lock::SleepLock;
use crate::param::{BSIZE, DEFAULTBLK, ROOTDEV};
use crate::proc::KernelCtx;

mod inode;
mod log;
mod path;
mod stat;
mod superblock;

pub use inode::{
    inodeoff, Dinode, Extent, InodeGuard, InodeRef, InodeType, Itable, INODEFILEINO, ROOTINO,
};
pub use log::{log_check, Log, Tx};
pub use path::{Dirent, FileName, Path, DIRENT_SIZE, DIRSIZ};
pub use stat::{Stat, T_DEV, T_DIR, T_FILE};
pub use superblock::{Superblock, BPB};

/// There should be one superblock per disk device, but we run with only
/// one device.
pub struct FileSystem {
    disk: Arc<dyn Disk>,
    pub(crate) bcache: Bcache,
    superblock: Once<Superblock>,
    log: SleepLock<Log>,
    pub(crate) itable: Itable,
}

impl FileSystem {
    /// Mount the device: read the superblock, replay the log, and pin the
    /// inodefile. Runs single-threaded at boot, before any process exists,
    /// so it reads the disk directly.
    pub(crate) fn new(disk: Arc<dyn Disk>) -> Self {
        let sb = Superblock::read(&*disk);
        crate::kprintln!(
            "sb: size {} nblocks {} bmap start {} inodestart {}",
            sb.size,
            sb.nblocks,
            sb.bmapstart,
            sb.inodestart
        );

        log_check(&*disk, &sb);

        let mut itable = Itable::new();
        itable.init_inodefile(&*disk, sb.inodestart);

        let superblock = Once::new();
        let _ = superblock.call_once(|| sb);
        Self {
            bcache: Bcache::new(Arc::clone(&disk)),
            log: SleepLock::new("log", Log::new(ROOTDEV, sb.logstart)),
            itable,
            superblock,
            disk,
        }
    }

    pub fn sb(&self) -> &Superblock {
        self.superblock.get().expect("fs: no superblock")
    }

    pub(crate) fn disk(&self) -> &dyn Disk {
        &*self.disk
    }

    /// First block of the swap region, directly behind the image.
    pub(crate) fn swapstart(&self) -> u32 {
        self.sb().size
    }

    /// Open a transaction. Every file system mutation happens inside one;
    /// it commits and installs when dropped. The log sleep lock is taken
    /// before any inode sleep lock.
    pub fn begin_tx<'s>(&'s self, ctx: KernelCtx<'s>) -> Tx<'s> {
        Tx {
            fs: self,
            ctx,
            log: self.log.lock(ctx),
        }
    }

    /// Scan the free bitmap for a run of `DEFAULTBLK` consecutive free
    /// blocks. A candidate run must be described entirely by one bitmap
    /// block and must not reach past the image.
    pub(crate) fn find_free_extent_block(&self, ctx: KernelCtx<'_>) -> Option<u32> {
        let sb = self.sb();
        for bblk in sb.bmapstart..sb.logstart {
            let base = (bblk - sb.bmapstart) * BPB;
            let bp = self.bcache.bread(ROOTDEV, bblk, ctx);
            let data = bp.data();
            let bit_used = |i: u32| data[(i / 8) as usize] & (1 << (i % 8)) != 0;

            for (used, mut run) in &(0..BPB).group_by(|&i| bit_used(i)) {
                if used {
                    continue;
                }
                let start = run.next().expect("find_free_extent_block: empty run");
                let len = 1 + run.count() as u32;
                if len >= DEFAULTBLK && base + start + DEFAULTBLK <= sb.size {
                    return Some(base + start);
                }
            }
        }
        None
    }

    /// Set or clear the bitmap bit of `blk`. Panics if the bit is already
    /// in the requested state. The update goes through the log.
    pub(crate) fn update_bit_map(&self, tx: &mut Tx<'_>, ctx: KernelCtx<'_>, blk: u32, used: bool) {
        let sb = self.sb();
        let mut bp = self.bcache.bread(ROOTDEV, sb.bblock(blk), ctx);
        let bit = blk % BPB;
        let byte = (bit / 8) as usize;
        let mask = 1u8 << (bit % 8);
        let was_used = bp.data()[byte] & mask != 0;
        assert_ne!(was_used, used, "update_bit_map: bit already {}", used);
        bp.data_mut()[byte] ^= mask;
        tx.write(&mut bp);
    }

    /// Create the regular file at `path` with a `DEFAULTBLK`-block extent.
    /// Succeeds trivially if the file already exists; fails when the disk
    /// or the inodefile is full.
    ///
    /// Lock order inside the transaction: parent directory, then the
    /// inodefile (the same order `locki`'s on-demand dinode load uses).
    pub fn file_create(&self, ctx: KernelCtx<'_>, path: &Path) -> Result<(), ()> {
        if let Ok(ip) = self.namei(ctx, path) {
            self.irelease(ip);
            return Ok(());
        }
        let (parent, name) = self.nameiparent(ctx, path)?;

        let mut tx = self.begin_tx(ctx);
        let mut dir = self.locki(parent, ctx);
        let mut inodefile = self.lock_inodefile(ctx);

        // Find the smallest free inum; past the end means the inodefile
        // grows by one dinode.
        let ninodes = inodefile.size / inodeoff(1);
        let mut inum = ninodes;
        for i in ROOTINO + 1..ninodes {
            if self.read_dinode(&mut inodefile, i).typ == 0 {
                inum = i;
                break;
            }
        }
        let off = inodeoff(inum);
        if off >= inodefile.size {
            if off + inodeoff(1) > inodefile.max_size {
                // Inode table is full.
                drop(inodefile);
                drop(dir);
                self.irelease(parent);
                return Err(());
            }
            self.write_dinode(&mut inodefile, &mut tx, inum, &Dinode::zero());
        }

        let start = match self.find_free_extent_block(ctx) {
            Some(start) => start,
            None => {
                drop(inodefile);
                drop(dir);
                self.irelease(parent);
                return Err(());
            }
        };

        let mut dip = Dinode::zero();
        dip.typ = T_FILE;
        dip.devid = ROOTDEV as i16;
        dip.size = 0;
        dip.max_size = DEFAULTBLK * BSIZE as u32;
        dip.data = Extent {
            startblkno: start,
            nblocks: DEFAULTBLK,
        };
        self.write_dinode(&mut inodefile, &mut tx, inum, &dip);

        // The inodefile's own dinode records its (possibly grown) size.
        let dip0 = inodefile.to_dinode();
        self.write_dinode(&mut inodefile, &mut tx, INODEFILEINO, &dip0);

        for i in 0..DEFAULTBLK {
            self.update_bit_map(&mut tx, ctx, start + i, true);
        }

        // Connect to the parent directory: the dirent slot of a file is
        // indexed by its inum.
        let mut de = Dirent::zero();
        de.inum = inum as u16;
        de.set_name(name);
        dir.writei(de.as_bytes(), inum * DIRENT_SIZE as u32, &mut tx)
            .expect("file_create: dirent");
        let dir_dip = dir.to_dinode();
        let dir_inum = dir.inum;
        self.write_dinode(&mut inodefile, &mut tx, dir_inum, &dir_dip);

        drop(inodefile);
        drop(dir);
        self.irelease(parent);
        Ok(())
    }

    /// Delete the regular file at `path`: free its extent in the bitmap,
    /// clear its dirent and dinode, and shrink the inodefile if this was
    /// the last inum. Fails on directories, devices, and files that are
    /// still referenced in memory.
    pub fn file_delete(&self, ctx: KernelCtx<'_>, path: &Path) -> Result<(), ()> {
        let (parent, name) = self.nameiparent(ctx, path)?;
        let (ip, dirent_off) = {
            let mut dir = self.locki(parent, ctx);
            match self.dirlookup(&mut dir, name) {
                Ok(found) => found,
                Err(()) => {
                    drop(dir);
                    self.irelease(parent);
                    return Err(());
                }
            }
        };

        let (dev, inum) = (ip.dev, ip.inum);
        let typ = self.locki(ip, ctx).typ;
        self.irelease(ip);
        if typ != InodeType::File {
            self.irelease(parent);
            return Err(());
        }
        // Still open somewhere: refuse.
        if self.itable.busy(dev, inum) {
            self.irelease(parent);
            return Err(());
        }

        let mut tx = self.begin_tx(ctx);
        let mut dir = self.locki(parent, ctx);
        let mut inodefile = self.lock_inodefile(ctx);

        let dip = self.read_dinode(&mut inodefile, inum);
        if dip.typ != T_FILE {
            // Lost a race with another delete.
            drop(inodefile);
            drop(dir);
            self.irelease(parent);
            return Err(());
        }

        for i in 0..dip.data.nblocks {
            self.update_bit_map(&mut tx, ctx, dip.data.startblkno + i, false);
        }

        // Zero the dirent.
        dir.writei(Dirent::zero().as_bytes(), dirent_off, &mut tx)
            .expect("file_delete: dirent");
        let dir_dip = dir.to_dinode();
        let dir_inum = dir.inum;
        self.write_dinode(&mut inodefile, &mut tx, dir_inum, &dir_dip);

        // Zero the dinode; drop the inodefile's tail if this was the last
        // inum.
        self.write_dinode(&mut inodefile, &mut tx, inum, &Dinode::zero());
        if inodeoff(inum + 1) == inodefile.size {
            inodefile.size -= inodeoff(1);
            let dip0 = inodefile.to_dinode();
            self.write_dinode(&mut inodefile, &mut tx, INODEFILEINO, &dip0);
        }

        drop(inodefile);
        drop(dir);
        self.irelease(parent);
        Ok(())
    }
}
