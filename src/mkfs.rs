//! mkfs: build an initial file system image on a RAM disk.
//!
//! Disk layout:
//! [ boot block | super block | free bit map | log |
//!                                       inode file | data blocks | swap ]
//!
//! The inodefile's first dinode describes the inodefile itself; the root
//! directory is inum 1 and `/console` is inum 2. Every seeded file gets a
//! `DEFAULTBLK`-block extent and a dirent at slot `inum` of the root
//! directory.

use std::sync::Arc;

use zerocopy::AsBytes;

use crate::disk::{Disk, RamDisk};
use crate::fs::{
    inodeoff, Dinode, Dirent, Extent, FileName, Superblock, BPB, DIRENT_SIZE, INODEFILEINO,
    ROOTINO, T_DEV, T_DIR, T_FILE,
};
use crate::param::{
    BLKS_PER_PAGE, BSIZE, CONSOLE, DEFAULTBLK, FSSIZE, LOGSIZE, ROOTDEV, SWAPSIZE_PAGES,
};

/// Blocks reserved for the inodefile's extent (so 24 * 512 / 64 inodes).
pub const NINODEFILEBLKS: u32 = DEFAULTBLK;

/// Inum of the console device file.
pub const CONSOLEINO: u32 = 2;

pub struct FsImage {
    disk: Arc<RamDisk>,
    sb: Superblock,
    next_inum: u32,
    next_free_block: u32,
}

impl FsImage {
    pub fn new() -> Self {
        let nbitmap = (FSSIZE as u32 + BPB - 1) / BPB;
        let bmapstart = 2;
        let logstart = bmapstart + nbitmap;
        let inodestart = logstart + 1 + LOGSIZE as u32;
        let rootstart = inodestart + NINODEFILEBLKS;
        let first_free = rootstart + DEFAULTBLK;
        let sb = Superblock {
            size: FSSIZE as u32,
            nblocks: FSSIZE as u32 - first_free,
            logstart,
            bmapstart,
            inodestart,
        };

        let disk = Arc::new(RamDisk::new(FSSIZE + SWAPSIZE_PAGES * BLKS_PER_PAGE));
        sb.write(&*disk);

        let mut img = Self {
            disk,
            sb,
            next_inum: CONSOLEINO + 1,
            next_free_block: first_free,
        };

        // The inodefile holds its own dinode, the root's, and the
        // console's.
        let mut di = Dinode::zero();
        di.typ = T_FILE;
        di.devid = ROOTDEV as i16;
        di.size = inodeoff(CONSOLEINO + 1);
        di.max_size = NINODEFILEBLKS * BSIZE as u32;
        di.data = Extent {
            startblkno: inodestart,
            nblocks: NINODEFILEBLKS,
        };
        img.winode(INODEFILEINO, &di);

        let mut di = Dinode::zero();
        di.typ = T_DIR;
        di.devid = ROOTDEV as i16;
        di.size = (CONSOLEINO + 1) * DIRENT_SIZE as u32;
        di.max_size = DEFAULTBLK * BSIZE as u32;
        di.data = Extent {
            startblkno: rootstart,
            nblocks: DEFAULTBLK,
        };
        img.winode(ROOTINO, &di);

        let mut di = Dinode::zero();
        di.typ = T_DEV;
        di.devid = CONSOLE as i16;
        img.winode(CONSOLEINO, &di);
        img.wdirent(CONSOLEINO, "console");

        // Everything up to the first free data block is taken.
        img.mark_used(0, first_free);
        img
    }

    /// Seed a regular file into the root directory.
    pub fn file(mut self, name: &str, contents: &[u8]) -> Self {
        assert!(contents.len() <= (DEFAULTBLK as usize) * BSIZE, "mkfs: file too big");
        let inum = self.next_inum;
        self.next_inum += 1;
        let start = self.next_free_block;
        self.next_free_block += DEFAULTBLK;
        assert!(
            self.next_free_block <= self.sb.size,
            "mkfs: image out of data blocks"
        );

        // Data blocks.
        let mut buf = [0u8; BSIZE];
        for (i, chunk) in contents.chunks(BSIZE).enumerate() {
            buf.fill(0);
            buf[..chunk.len()].copy_from_slice(chunk);
            self.disk.write(start + i as u32, &buf);
        }

        let mut di = Dinode::zero();
        di.typ = T_FILE;
        di.devid = ROOTDEV as i16;
        di.size = contents.len() as u32;
        di.max_size = DEFAULTBLK * BSIZE as u32;
        di.data = Extent {
            startblkno: start,
            nblocks: DEFAULTBLK,
        };
        self.winode(inum, &di);
        self.wdirent(inum, name);
        self.mark_used(start, start + DEFAULTBLK);

        // The inodefile and the root directory both cover the new inum
        // now.
        let mut di0 = self.rinode(INODEFILEINO);
        di0.size = di0.size.max(inodeoff(inum + 1));
        self.winode(INODEFILEINO, &di0);
        let mut di1 = self.rinode(ROOTINO);
        di1.size = di1.size.max((inum + 1) * DIRENT_SIZE as u32);
        self.winode(ROOTINO, &di1);
        self
    }

    pub fn build(self) -> Arc<RamDisk> {
        self.disk
    }

    fn winode(&mut self, inum: u32, di: &Dinode) {
        let off = inodeoff(inum);
        let bn = self.sb.inodestart + off / BSIZE as u32;
        let boff = (off % BSIZE as u32) as usize;
        let mut buf = [0u8; BSIZE];
        self.disk.read(bn, &mut buf);
        buf[boff..boff + 64].copy_from_slice(di.as_bytes());
        self.disk.write(bn, &buf);
    }

    fn rinode(&self, inum: u32) -> Dinode {
        let off = inodeoff(inum);
        let bn = self.sb.inodestart + off / BSIZE as u32;
        let boff = (off % BSIZE as u32) as usize;
        let mut buf = [0u8; BSIZE];
        self.disk.read(bn, &mut buf);
        let mut di = Dinode::zero();
        di.as_bytes_mut().copy_from_slice(&buf[boff..boff + 64]);
        di
    }

    /// Write a dirent into root slot `inum`.
    fn wdirent(&mut self, inum: u32, name: &str) {
        let root = self.rinode(ROOTINO);
        let off = inum * DIRENT_SIZE as u32;
        let bn = root.data.startblkno + off / BSIZE as u32;
        let boff = (off % BSIZE as u32) as usize;
        let mut de = Dirent::zero();
        de.inum = inum as u16;
        de.set_name(FileName::from_bytes(name.as_bytes()));
        let mut buf = [0u8; BSIZE];
        self.disk.read(bn, &mut buf);
        buf[boff..boff + DIRENT_SIZE].copy_from_slice(de.as_bytes());
        self.disk.write(bn, &buf);
    }

    /// Mark blocks `[from, to)` used in the free bitmap.
    fn mark_used(&mut self, from: u32, to: u32) {
        for b in from..to {
            let bn = self.sb.bblock(b);
            let bit = b % BPB;
            let mut buf = [0u8; BSIZE];
            self.disk.read(bn, &mut buf);
            buf[(bit / 8) as usize] |= 1 << (bit % 8);
            self.disk.write(bn, &buf);
        }
    }
}

impl Default for FsImage {
    fn default() -> Self {
        Self::new()
    }
}
