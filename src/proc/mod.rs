//! Processes: per-process state, the process table, and the scheduler.

use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;

use crate::lock::SpinLock;
use crate::param::{MAXPROCNAME, NOFILE};
use crate::vm::Vspace;

mod kernel_ctx;
mod procs;
mod wait_channel;

pub use kernel_ctx::*;
pub use procs::*;
pub use wait_channel::*;

pub type Pid = i32;

/// The simulation's stand-in for a user-mode instruction stream: the body a
/// forked process runs, driving syscalls through its `KernelCtx`.
pub type UserProgram = Box<dyn for<'a> FnOnce(&KernelCtx<'a>) + Send + 'static>;

#[allow(non_camel_case_types)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ProcState {
    UNUSED,
    EMBRYO,
    SLEEPING,
    RUNNABLE,
    RUNNING,
    ZOMBIE,
}

impl ProcState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcState::UNUSED => "unused",
            ProcState::EMBRYO => "embryo",
            ProcState::SLEEPING => "sleep ",
            ProcState::RUNNABLE => "runble",
            ProcState::RUNNING => "run   ",
            ProcState::ZOMBIE => "zombie",
        }
    }
}

/// Saved user-visible registers. The simulation has no user instruction
/// stream, but `fork` and `exec` still maintain the register contract
/// (`rax` cleared in the child, `rdi`/`rsi`/`rsp` set up for `main`).
#[derive(Copy, Clone, Default)]
pub struct TrapFrame {
    pub rip: u64,
    pub rsp: u64,
    pub rax: u64,
    pub rdi: u64,
    pub rsi: u64,
}

/// Per-process private data. Only the owning process mutates it, but the
/// spin lock makes the cross-process touch points (`fork` reading the
/// parent, `wait` reaping a zombie) sound.
pub struct ProcData {
    /// Physical page backing the kernel stack, if allocated.
    pub kstack: Option<u32>,

    /// Trap frame for the current "user" state.
    pub tf: TrapFrame,

    /// Open files: indices into the global file table.
    pub open_files: [Option<usize>; NOFILE],

    /// Process name (debugging).
    pub name: [u8; MAXPROCNAME],
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: None,
            tf: TrapFrame {
                rip: 0,
                rsp: 0,
                rax: 0,
                rdi: 0,
                rsi: 0,
            },
            open_files: [None; NOFILE],
            name: [0; MAXPROCNAME],
        }
    }

    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let n = bytes.len().min(MAXPROCNAME - 1);
        self.name[..n].copy_from_slice(&bytes[..n]);
        self.name[n] = 0;
    }
}

/// Per-process state outside the process-table lock. Scheduling state
/// (`ProcState`, pid, channel, parent) lives *inside* the table; see
/// `procs.rs`.
pub struct Proc {
    /// If true, the process has been killed and should exit at the next
    /// chance it observes the flag.
    pub killed: AtomicBool,

    /// Waitchannel saying a child proc is dead.
    pub child_waitchannel: WaitChannel,

    pub data: SpinLock<ProcData>,

    pub vspace: SpinLock<Vspace>,

    /// Set once `exit` has run, so the process thread does not exit twice.
    pub(crate) exited: AtomicBool,
}

impl Proc {
    fn new() -> Self {
        Self {
            killed: AtomicBool::new(false),
            child_waitchannel: WaitChannel::new(),
            data: SpinLock::new("proc", ProcData::new()),
            vspace: SpinLock::new("vspace", Vspace::new()),
            exited: AtomicBool::new(false),
        }
    }

    pub(crate) fn pool() -> Box<[Proc; crate::param::NPROC]> {
        Box::new(array![_ => Proc::new(); crate::param::NPROC])
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Kill the process; it observes the flag at its next sleep or syscall.
    pub fn set_killed(&self) {
        self.killed.store(true, Ordering::Release);
    }
}
