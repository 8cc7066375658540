//! hx6: a hosted rework of a Unix V6-lineage teaching kernel.
//!
//! The four load-bearing subsystems — the crash-safe extent file system
//! (bitmap allocator, inodefile, write-ahead log), the file/descriptor
//! layer with pipes, the coremap page allocator with a random-eviction
//! swap engine, and the process table with copy-on-write fork and
//! sleep/wakeup scheduling — run as a library against a RAM disk, with
//! processes carried by host threads. Device drivers, boot, and the trap
//! entry stubs are external collaborators represented by their interfaces
//! (`disk::Disk`, `exec::ProgramLoader`, the devsw table).
//!
//! Construction starts at `kernel::KernelBuilder`; `mkfs::FsImage` builds
//! an initial disk image.

#![allow(dead_code)]

pub mod bio;
pub mod console;
pub mod disk;
pub mod exec;
pub mod fcntl;
pub mod file;
pub mod fs;
pub mod kalloc;
pub mod kernel;
pub mod lock;
pub mod mkfs;
pub mod param;
pub mod pipe;
pub mod proc;
mod syscall;
mod sysfile;
pub mod sysproc;
pub mod trap;
pub mod vm;

pub use disk::{Disk, RamDisk};
pub use fcntl::FcntlFlags;
pub use fs::Stat;
pub use kernel::{Kernel, KernelBuilder};
pub use mkfs::FsImage;
pub use proc::{KernelCtx, Pid, ProcState, UserProgram};
pub use sysproc::SysInfo;
