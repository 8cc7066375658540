use core::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::disk::Disk;
use crate::param::BSIZE;

/// Disk layout:
/// [ boot block | super block | free bit map | log |
///                                       inode file | data blocks | swap ]
///
/// mkfs computes the super block and builds an initial file system. The
/// super block describes the disk layout:
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct Superblock {
    /// Size of file system image (blocks)
    pub size: u32,

    /// Number of data blocks
    pub nblocks: u32,

    /// Block number of first log block
    pub logstart: u32,

    /// Block number of first free map block
    pub bmapstart: u32,

    /// Block number of the start of inode file
    pub inodestart: u32,
}

const_assert!(mem::size_of::<Superblock>() <= BSIZE);

/// Bitmap bits per block
pub const BPB: u32 = (BSIZE * 8) as u32;

impl Superblock {
    /// Read the super block.
    pub(crate) fn read(disk: &dyn Disk) -> Self {
        let mut buf = [0u8; BSIZE];
        disk.read(1, &mut buf);
        let mut sb = Superblock {
            size: 0,
            nblocks: 0,
            logstart: 0,
            bmapstart: 0,
            inodestart: 0,
        };
        sb.as_bytes_mut()
            .copy_from_slice(&buf[..mem::size_of::<Superblock>()]);
        sb
    }

    pub(crate) fn write(&self, disk: &dyn Disk) {
        let mut buf = [0u8; BSIZE];
        buf[..mem::size_of::<Superblock>()].copy_from_slice(self.as_bytes());
        disk.write(1, &buf);
    }

    /// Block of free map containing the bit for block b.
    pub const fn bblock(&self, b: u32) -> u32 {
        b / BPB + self.bmapstart
    }
}
