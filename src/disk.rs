//! The disk interface. Device drivers are external collaborators; this is
//! the contract the file system and the swap engine program against. The
//! in-memory implementation stands in for the driver and keeps the I/O
//! counters user space reads through `sysinfo`.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::param::BSIZE;

pub trait Disk: Send + Sync {
    /// Read block `blockno` into `buf`.
    fn read(&self, blockno: u32, buf: &mut [u8; BSIZE]);

    /// Write `buf` to block `blockno`. The write is durable when this
    /// returns; the log relies on that ordering.
    fn write(&self, blockno: u32, buf: &[u8; BSIZE]);

    fn nblocks(&self) -> u32;

    fn num_reads(&self) -> usize;

    fn num_writes(&self) -> usize;
}

/// A RAM-backed disk image.
pub struct RamDisk {
    blocks: Mutex<Vec<[u8; BSIZE]>>,
    nread: AtomicUsize,
    nwrite: AtomicUsize,
}

impl RamDisk {
    pub fn new(nblocks: usize) -> Self {
        Self {
            blocks: Mutex::new(vec![[0; BSIZE]; nblocks]),
            nread: AtomicUsize::new(0),
            nwrite: AtomicUsize::new(0),
        }
    }

    /// A point-in-time copy of the image, e.g. the state a crash would
    /// leave behind.
    pub fn snapshot(&self) -> RamDisk {
        let blocks = self.blocks.lock().unwrap().clone();
        Self {
            blocks: Mutex::new(blocks),
            nread: AtomicUsize::new(0),
            nwrite: AtomicUsize::new(0),
        }
    }
}

impl Disk for RamDisk {
    fn read(&self, blockno: u32, buf: &mut [u8; BSIZE]) {
        let blocks = self.blocks.lock().unwrap();
        *buf = blocks[blockno as usize];
        self.nread.fetch_add(1, Ordering::Relaxed);
    }

    fn write(&self, blockno: u32, buf: &[u8; BSIZE]) {
        let mut blocks = self.blocks.lock().unwrap();
        blocks[blockno as usize] = *buf;
        self.nwrite.fetch_add(1, Ordering::Relaxed);
    }

    fn nblocks(&self) -> u32 {
        self.blocks.lock().unwrap().len() as u32
    }

    fn num_reads(&self) -> usize {
        self.nread.load(Ordering::Relaxed)
    }

    fn num_writes(&self) -> usize {
        self.nwrite.load(Ordering::Relaxed)
    }
}
