/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs the scheduler keeps running at once.
pub const NCPU: usize = 4;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active i-nodes.
pub const NINODE: usize = 50;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Device number of file system root disk.
pub const ROOTDEV: u32 = 1;

/// Console device id in devsw.
pub const CONSOLE: u16 = 1;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Block Size.
pub const BSIZE: usize = 512;

/// Blocks reserved for every extent file at creation.
pub const DEFAULTBLK: u32 = 24;

/// Records in the on-disk log table (the table fits in one block).
pub const LOGSIZE: usize = 8;

/// Max # of blocks any FS op writes.
pub const MAXOPBLOCKS: usize = 6;

/// Size of disk block cache.
pub const NBUF: usize = 16;

/// Maximum file path name.
pub const MAXPATH: usize = 128;

/// Maximum length of process name.
pub const MAXPROCNAME: usize = 16;

/// Bytes per page.
pub const PGSIZE: usize = 4096;

/// Disk blocks per page.
pub const BLKS_PER_PAGE: usize = PGSIZE / BSIZE;

/// Physical pages handed to the page allocator unless the builder overrides it.
pub const NPHYSPAGE: usize = 192;

/// One-page slots in the on-disk swap region.
pub const SWAPSIZE_PAGES: usize = 128;

/// Blocks in the file system image (the swap region sits behind them).
pub const FSSIZE: usize = 4000;

/// Top of the user stack region.
pub const SZ_2G: usize = 1 << 31;

/// On-demand growth cap for the user stack, in pages.
pub const USTACK_MAXPAGES: usize = 10;

/// Base virtual address user program images are loaded at.
pub const CODE_BASE: usize = 0x10000;
