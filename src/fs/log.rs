//! The write-ahead redo log.
//!
//! Block `logstart` holds a table of `LOGSIZE` 64-byte records; the
//! `LOGSIZE` blocks behind it shadow the data of in-flight updates. A
//! durable update is first copied to its shadow block and stamped dirty,
//! then committed (one table write flips the commit bits), then installed
//! at its home location, then cleared. Crashes between any two steps leave
//! the log replayable: `log_check` at boot installs every committed dirty
//! record and stops at the first uncommitted one.
//!
//! Mutation is single-writer: a `Tx` holds the log sleep lock from
//! `FileSystem::begin_tx` until it drops, which is when the transaction
//! commits and is copied home.

use core::mem;

use static_assertions::{const_assert, const_assert_eq};
use zerocopy::{AsBytes, FromBytes};

use crate::disk::Disk;
use crate::fs::{FileSystem, Superblock};
use crate::param::{BSIZE, LOGSIZE};
use crate::proc::KernelCtx;

/// One log record. `inum`, `offset`, `blk_write`, and `new_size` carry
/// inode-update metadata in the on-disk format; they are reserved and not
/// consulted by replay, which needs only the flags and block numbers.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct LogNode {
    /// Ready to start copying?
    commit_flag: u8,
    /// Finished writing to the log?
    dirty_flag: u8,
    pad0: [u8; 2],
    /// Shadow data block inside the log region.
    data_blk: u32,
    /// Home location the shadow is installed to.
    target_blk: u32,
    inum: u32,
    offset: u32,
    blk_write: u32,
    new_size: u32,
    pad: [u32; 9],
}

const_assert_eq!(mem::size_of::<LogNode>(), 64);
// The whole record table fits in the block at `logstart`.
const_assert!(LOGSIZE * mem::size_of::<LogNode>() <= BSIZE);

impl LogNode {
    const fn zero() -> Self {
        Self {
            commit_flag: 0,
            dirty_flag: 0,
            pad0: [0; 2],
            data_blk: 0,
            target_blk: 0,
            inum: 0,
            offset: 0,
            blk_write: 0,
            new_size: 0,
            pad: [0; 9],
        }
    }
}

pub struct Log {
    dev: u32,
    start: u32,
    records: [LogNode; LOGSIZE],
}

impl Log {
    pub(crate) fn new(dev: u32, start: u32) -> Self {
        Self {
            dev,
            start,
            records: [LogNode::zero(); LOGSIZE],
        }
    }
}

fn serialize_records(records: &[LogNode; LOGSIZE]) -> [u8; BSIZE] {
    let mut buf = [0u8; BSIZE];
    for (i, rec) in records.iter().enumerate() {
        buf[i * 64..(i + 1) * 64].copy_from_slice(rec.as_bytes());
    }
    buf
}

fn deserialize_records(buf: &[u8; BSIZE]) -> [LogNode; LOGSIZE] {
    let mut records = [LogNode::zero(); LOGSIZE];
    for (i, rec) in records.iter_mut().enumerate() {
        rec.as_bytes_mut().copy_from_slice(&buf[i * 64..(i + 1) * 64]);
    }
    records
}

/// Boot-time recovery, before anything is cached: install every committed
/// dirty record, stop at the first uncommitted one, then clear the table.
pub fn log_check(disk: &dyn Disk, sb: &Superblock) {
    let mut table = [0u8; BSIZE];
    disk.read(sb.logstart, &mut table);
    let records = deserialize_records(&table);

    let mut block = [0u8; BSIZE];
    for rec in records.iter() {
        if rec.commit_flag == 0 {
            // Nothing past this point was committed; pre-commit records
            // are discarded by the clear below.
            break;
        }
        if rec.dirty_flag == 0 {
            continue;
        }
        // Complete the copy to the home location.
        disk.read(rec.data_blk, &mut block);
        disk.write(rec.target_blk, &block);
    }

    // Clear the log.
    let cleared = serialize_records(&[LogNode::zero(); LOGSIZE]);
    disk.write(sb.logstart, &cleared);
}

/// An open transaction. Holds the log sleep lock, serializing all file
/// system mutation; dropping it commits and installs the records.
pub struct Tx<'s> {
    pub(crate) fs: &'s FileSystem,
    pub(crate) ctx: KernelCtx<'s>,
    pub(crate) log: crate::lock::SleepLockGuard<'s, Log>,
}

impl Tx<'_> {
    fn write_table(&mut self) {
        let buf = serialize_records(&self.log.records);
        let mut b = self
            .fs
            .bcache
            .bread(self.log.dev, self.log.start, self.ctx);
        b.data_mut().copy_from_slice(&buf);
        b.bwrite();
    }

    /// Record an updated buffer: copy its bytes into a log shadow block and
    /// stamp the record dirty. The home location is not touched until the
    /// transaction commits. A block already recorded in this transaction is
    /// absorbed into its existing slot.
    pub(crate) fn write(&mut self, buf: &mut crate::bio::Buf<'_>) {
        let target = buf.blockno;
        let mut idx = None;
        for (i, rec) in self.log.records.iter().enumerate() {
            if rec.dirty_flag != 0 && rec.target_blk == target {
                // Log absorption.
                idx = Some(i);
                break;
            }
        }
        let idx = match idx {
            Some(i) => i,
            None => {
                let free = self
                    .log
                    .records
                    .iter()
                    .position(|r| r.dirty_flag == 0)
                    .expect("log: too big a transaction");
                free
            }
        };

        let data_blk = self.log.start + 1 + idx as u32;
        {
            let mut shadow = self.fs.bcache.bread(self.log.dev, data_blk, self.ctx);
            shadow.data_mut().copy_from_slice(buf.data());
            shadow.bwrite();
        }

        let rec = &mut self.log.records[idx];
        rec.dirty_flag = 1;
        rec.commit_flag = 0;
        rec.data_blk = data_blk;
        rec.target_blk = target;
        self.write_table();
    }

    /// Flip the commit bit on every dirty record with a single table write.
    /// This is the point after which the transaction survives a crash.
    fn commit(&mut self) {
        for rec in self.log.records.iter_mut() {
            if rec.dirty_flag != 0 {
                rec.commit_flag = 1;
            }
        }
        self.write_table();
    }

    /// Install every committed record at its home location, then clear the
    /// flags and rewrite the table.
    fn copy_to_disk(&mut self) {
        for i in 0..LOGSIZE {
            let rec = self.log.records[i];
            if rec.commit_flag == 0 || rec.dirty_flag == 0 {
                continue;
            }
            let dev = self.log.dev;
            let shadow = self.fs.bcache.bread(dev, rec.data_blk, self.ctx);
            let mut home = self.fs.bcache.bread(dev, rec.target_blk, self.ctx);
            home.data_mut().copy_from_slice(shadow.data());
            home.bwrite();
        }
        self.log.records = [LogNode::zero(); LOGSIZE];
        self.write_table();
    }

    /// How many record slots this transaction has dirtied.
    pub(crate) fn slots_used(&self) -> usize {
        self.log.records.iter().filter(|r| r.dirty_flag != 0).count()
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        // A transaction unwound by a panic is a crash, not a commit: its
        // uncommitted records are discarded by recovery.
        if std::thread::panicking() {
            self.log.records = [LogNode::zero(); LOGSIZE];
            return;
        }
        if self.log.records.iter().any(|r| r.dirty_flag != 0) {
            self.commit();
            self.copy_to_disk();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::FSSIZE;

    fn scratch_disk() -> crate::disk::RamDisk {
        crate::disk::RamDisk::new(FSSIZE)
    }

    #[test]
    fn records_round_trip_through_the_table_block() {
        let mut records = [LogNode::zero(); LOGSIZE];
        records[0].dirty_flag = 1;
        records[0].data_blk = 7;
        records[0].target_blk = 99;
        records[1].dirty_flag = 1;
        records[1].commit_flag = 1;
        records[1].target_blk = 123;
        let buf = serialize_records(&records);
        let back = deserialize_records(&buf);
        assert_eq!(back[0].target_blk, 99);
        assert_eq!(back[1].commit_flag, 1);
        assert_eq!(back[2].dirty_flag, 0);
    }

    #[test]
    fn replay_installs_committed_records_and_clears() {
        use crate::disk::Disk;
        let disk = scratch_disk();
        let sb = Superblock {
            size: FSSIZE as u32,
            nblocks: 0,
            logstart: 2,
            bmapstart: 0,
            inodestart: 11,
        };

        // A committed record whose home write never happened.
        let mut records = [LogNode::zero(); LOGSIZE];
        records[0].dirty_flag = 1;
        records[0].commit_flag = 1;
        records[0].data_blk = 3;
        records[0].target_blk = 100;
        disk.write(2, &serialize_records(&records));
        let shadow = [0xabu8; BSIZE];
        disk.write(3, &shadow);

        log_check(&disk, &sb);

        let mut home = [0u8; BSIZE];
        disk.read(100, &mut home);
        assert_eq!(home, shadow);

        // The table is cleared afterwards.
        let mut table = [0u8; BSIZE];
        disk.read(2, &mut table);
        assert!(deserialize_records(&table)
            .iter()
            .all(|r| r.dirty_flag == 0 && r.commit_flag == 0));
    }

    #[test]
    fn replay_stops_at_first_uncommitted_record() {
        use crate::disk::Disk;
        let disk = scratch_disk();
        let sb = Superblock {
            size: FSSIZE as u32,
            nblocks: 0,
            logstart: 2,
            bmapstart: 0,
            inodestart: 11,
        };

        // Dirty but never committed: the crash hit before log_commit.
        let mut records = [LogNode::zero(); LOGSIZE];
        records[0].dirty_flag = 1;
        records[0].commit_flag = 0;
        records[0].data_blk = 3;
        records[0].target_blk = 100;
        disk.write(2, &serialize_records(&records));
        disk.write(3, &[0xcdu8; BSIZE]);

        log_check(&disk, &sb);

        // The home block was not touched: pre-transaction state.
        let mut home = [0u8; BSIZE];
        disk.read(100, &mut home);
        assert_eq!(home, [0u8; BSIZE]);
    }
}
