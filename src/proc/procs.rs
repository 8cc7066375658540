//! The process table and the scheduler.
//!
//! Scheduling state (`ProcState`, pid, sleep channel, parent link) lives in
//! a single table behind one lock, exactly as in the classic design: any
//! state transition and any `sleep`/`wakeup` rendezvous happens under it, so
//! wakeups cannot be lost. Execution itself is carried by one host thread
//! per process; the scheduler is a turnstile that keeps at most `NCPU`
//! processes `RUNNING` and parks everyone else on a per-slot gate.

use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use array_macro::array;

use super::{KernelCtx, Pid, Proc, ProcState, UserProgram};
use crate::kalloc::Coremap;
use crate::kernel::Kernel;
use crate::lock::Waitable;
use crate::param::{NCPU, NPROC};

pub(crate) const NO_PARENT: usize = usize::MAX;

/// Per-process scheduling state. Protected by `Procs::lock`.
#[derive(Copy, Clone)]
struct ProcShared {
    state: ProcState,
    pid: Pid,
    /// If non-zero, sleeping on the channel with this token.
    chan: usize,
    /// Slot index of the parent, or `NO_PARENT`.
    parent: usize,
}

struct Ptable {
    table: [ProcShared; NPROC],
    nextpid: Pid,
    /// Number of slots currently `RUNNING`; capped at `NCPU`.
    nrunning: usize,
    /// Round-robin scan position.
    cursor: usize,
}

pub struct Procs {
    lock: Mutex<Ptable>,
    /// One gate per slot; a parked process thread waits here until the
    /// scheduler flips its state to `RUNNING`.
    gates: Box<[Condvar; NPROC]>,
    pool: Box<[Proc; NPROC]>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    init_slot: AtomicUsize,
}

impl Procs {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(Ptable {
                table: [ProcShared {
                    state: ProcState::UNUSED,
                    pid: 0,
                    chan: 0,
                    parent: NO_PARENT,
                }; NPROC],
                nextpid: 1,
                nrunning: 0,
                cursor: 0,
            }),
            gates: Box::new(array![_ => Condvar::new(); NPROC]),
            pool: Proc::pool(),
            threads: Mutex::new(Vec::new()),
            init_slot: AtomicUsize::new(NO_PARENT),
        }
    }

    fn ptable(&self) -> MutexGuard<'_, Ptable> {
        // A panicking process is a kernel panic; the table is still usable
        // for diagnostics, so ignore poisoning.
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn proc(&self, slot: usize) -> &Proc {
        &self.pool[slot]
    }

    pub(crate) fn init_slot(&self) -> usize {
        self.init_slot.load(Ordering::Acquire)
    }

    pub fn pid_of(&self, slot: usize) -> Pid {
        self.ptable().table[slot].pid
    }

    pub fn state_of(&self, slot: usize) -> ProcState {
        self.ptable().table[slot].state
    }

    /// Hand free CPUs to `RUNNABLE` processes, round robin.
    fn promote(&self, inner: &mut Ptable) {
        while inner.nrunning < NCPU {
            let mut found = None;
            for i in 0..NPROC {
                let idx = (inner.cursor + i) % NPROC;
                if inner.table[idx].state == ProcState::RUNNABLE {
                    found = Some(idx);
                    break;
                }
            }
            let idx = match found {
                Some(idx) => idx,
                None => break,
            };
            inner.table[idx].state = ProcState::RUNNING;
            inner.nrunning += 1;
            inner.cursor = (idx + 1) % NPROC;
            self.gates[idx].notify_all();
        }
    }

    /// Park until the scheduler runs this slot.
    pub(crate) fn wait_until_running(&self, slot: usize) {
        let mut inner = self.ptable();
        while inner.table[slot].state != ProcState::RUNNING {
            inner = self.gates[slot]
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Atomically release the lock behind `lk` and sleep on `chan`;
    /// reacquire when awakened. The ptable lock is taken first so a
    /// concurrent `wakeup` cannot miss the state change.
    pub(crate) fn sleep(&self, chan: usize, lk: &mut dyn Waitable, slot: usize) {
        let mut inner = self.ptable();
        // SAFETY: paired with `raw_acquire` below; the guarded data is not
        // touched until then.
        unsafe { lk.raw_release() };

        // Go to sleep.
        inner.table[slot].chan = chan;
        inner.table[slot].state = ProcState::SLEEPING;
        inner.nrunning -= 1;
        self.promote(&mut inner);
        while inner.table[slot].state != ProcState::RUNNING {
            inner = self.gates[slot]
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }

        // Tidy up.
        inner.table[slot].chan = 0;
        drop(inner);

        // Reacquire original lock.
        // SAFETY: paired with the `raw_release` above.
        unsafe { lk.raw_acquire() };
    }

    /// Wake up all processes sleeping on `chan`.
    pub fn wakeup(&self, chan: usize) {
        let mut inner = self.ptable();
        self.wakeup1(&mut inner, chan);
        self.promote(&mut inner);
    }

    /// The ptable lock must be held.
    fn wakeup1(&self, inner: &mut Ptable, chan: usize) {
        for p in inner.table.iter_mut() {
            if p.state == ProcState::SLEEPING && p.chan == chan {
                p.state = ProcState::RUNNABLE;
            }
        }
    }

    /// Give up the CPU for one scheduling round.
    pub fn yield_cpu(&self, slot: usize) {
        let mut inner = self.ptable();
        inner.table[slot].state = ProcState::RUNNABLE;
        inner.nrunning -= 1;
        self.promote(&mut inner);
        while inner.table[slot].state != ProcState::RUNNING {
            inner = self.gates[slot]
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Apply a swap transition to every address space mapping the page.
    ///
    /// `to_mem == false`: every `vpage_info` with `present == 1` and a
    /// matching `ppn` moves to `on_disk == swap_slot`, dropping one coremap
    /// reference each and taking one swap-slot reference each.
    /// `to_mem == true`: the reverse, re-pointing every `vpage_info` with
    /// `on_disk == swap_slot` at the fresh page.
    ///
    /// Caller holds the kmem lock (`cm`); the ptable lock and each vspace
    /// lock are taken here, in hierarchy order.
    pub(crate) fn update_vspace(&self, cm: &mut Coremap, swap_slot: u32, to_mem: bool, ppn: u32) {
        let inner = self.ptable();
        for (slot, p) in inner.table.iter().enumerate() {
            if p.state == ProcState::UNUSED {
                continue;
            }
            let mut vs = self.pool[slot].vspace.lock();
            if to_mem {
                vs.swap_in_page(cm, swap_slot, ppn);
            } else {
                vs.swap_out_page(cm, swap_slot, ppn);
            }
        }
    }

    pub(crate) fn push_thread(&self, handle: JoinHandle<()>) {
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Join every process thread spawned so far (including ones spawned
    /// while joining). A panicking process is a kernel panic: the first
    /// payload is re-raised here so the failure is not swallowed.
    pub fn join_all(&self) {
        let mut panic = None;
        loop {
            let drained: Vec<_> = {
                let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
                mem::take(&mut *threads)
            };
            if drained.is_empty() {
                break;
            }
            for t in drained {
                if let Err(payload) = t.join() {
                    panic.get_or_insert(payload);
                }
            }
        }
        if let Some(payload) = panic {
            std::panic::resume_unwind(payload);
        }
    }
}

impl Kernel {
    /// Look in the process table for an UNUSED proc. If found, change state
    /// to EMBRYO and initialize state required to run in the kernel.
    pub(crate) fn allocproc(&self) -> Result<usize, ()> {
        let procs = self.procs();
        let slot = {
            let mut inner = procs.ptable();
            let slot = (0..NPROC)
                .find(|&i| inner.table[i].state == ProcState::UNUSED)
                .ok_or(())?;
            inner.table[slot].state = ProcState::EMBRYO;
            inner.table[slot].pid = inner.nextpid;
            inner.table[slot].chan = 0;
            inner.table[slot].parent = NO_PARENT;
            inner.nextpid += 1;
            slot
        };

        let p = procs.proc(slot);
        p.killed.store(false, Ordering::Release);
        p.exited.store(false, Ordering::Release);

        // Allocate kernel stack.
        let kstack = match self.kalloc() {
            Some(ppn) => ppn,
            None => {
                procs.ptable().table[slot].state = ProcState::UNUSED;
                return Err(());
            }
        };

        let mut data = p.data.lock();
        data.kstack = Some(kstack);
        data.tf = Default::default();
        data.open_files = [None; crate::param::NOFILE];
        data.name = [0; crate::param::MAXPROCNAME];
        Ok(slot)
    }

    /// Create a new process copying the caller. The child runs `prog` on
    /// its own thread once the scheduler picks it; it sees the parent's
    /// memory through copy-on-write mappings and shares its open files.
    pub fn fork(&self, ctx: &KernelCtx<'_>, prog: UserProgram) -> Result<Pid, ()> {
        let procs = self.procs();
        let child = self.allocproc()?;

        // Duplicate user memory, copy-on-write.
        {
            let mut cm = self.kmem().coremap();
            let mut parent_vs = procs.proc(ctx.slot()).vspace.lock();
            let mut child_vs = procs.proc(child).vspace.lock();
            child_vs.copy_from(&mut parent_vs, &mut cm);
        }

        // Duplicate trap frame and name; the child's fork "returns" 0.
        {
            let parent_data = procs.proc(ctx.slot()).data.lock();
            let mut child_data = procs.proc(child).data.lock();
            child_data.tf = parent_data.tf;
            child_data.tf.rax = 0;
            child_data.name = parent_data.name;

            // Duplicate all the open files, including the pipe-side
            // reference counts.
            child_data.open_files = parent_data.open_files;
            for file in child_data.open_files.iter().flatten() {
                self.ftable().dup(*file);
            }
        }

        let pid = {
            let mut inner = procs.ptable();
            inner.table[child].parent = ctx.slot();
            inner.table[child].state = ProcState::RUNNABLE;
            self.procs().promote(&mut inner);
            inner.table[child].pid
        };

        self.spawn_proc(child, prog);
        Ok(pid)
    }

    /// Exit the current process. An exited process remains a zombie until
    /// its parent calls `wait` to find out it exited.
    pub fn exit(&self, ctx: &KernelCtx<'_>) {
        let procs = self.procs();
        let p = ctx.proc();
        if p.exited.swap(true, Ordering::AcqRel) {
            return;
        }

        // Close all open files.
        let open: Vec<usize> = {
            let mut data = p.data.lock();
            data.open_files.iter_mut().filter_map(|f| f.take()).collect()
        };
        for file in open {
            self.ftable().close(self, file);
        }

        let mut inner = procs.ptable();
        let me = ctx.slot();
        let init = procs.init_slot();

        // Pass abandoned children to init.
        for i in 0..NPROC {
            if inner.table[i].parent == me && inner.table[i].state != ProcState::UNUSED {
                inner.table[i].parent = init;
                if init != NO_PARENT {
                    procs.wakeup1(&mut inner, procs.proc(init).child_waitchannel.token());
                }
            }
        }

        // Parent might be sleeping in wait().
        let parent = inner.table[me].parent;
        if parent != NO_PARENT {
            procs.wakeup1(&mut inner, procs.proc(parent).child_waitchannel.token());
        }

        inner.table[me].state = ProcState::ZOMBIE;
        inner.table[me].chan = 0;
        inner.nrunning -= 1;
        procs.promote(&mut inner);
        // The process thread returns from here and ends; the zombie slot is
        // reaped by wait().
    }

    /// Wait for a child process to exit and return its pid.
    /// Return Err if this process has no children.
    pub fn wait(&self, ctx: &KernelCtx<'_>) -> Result<Pid, ()> {
        let procs = self.procs();
        let me = ctx.slot();
        let mut inner = procs.ptable();
        loop {
            // Scan through the table looking for exited children.
            let mut havekids = false;
            let mut zombie = None;
            for i in 0..NPROC {
                if inner.table[i].parent == me && inner.table[i].state != ProcState::UNUSED {
                    havekids = true;
                    if inner.table[i].state == ProcState::ZOMBIE {
                        zombie = Some(i);
                        break;
                    }
                }
            }

            if let Some(z) = zombie {
                let pid = inner.table[z].pid;
                // Pull the dead child's resources out while the slot is
                // still ours, then free them after dropping the table lock
                // (freeing takes the kmem lock).
                let kstack = procs.proc(z).data.lock().kstack.take();
                let vs = mem::replace(&mut *procs.proc(z).vspace.lock(), crate::vm::Vspace::new());
                inner.table[z].state = ProcState::UNUSED;
                inner.table[z].pid = 0;
                inner.table[z].parent = NO_PARENT;
                drop(inner);

                let mut cm = self.kmem().coremap();
                if let Some(ppn) = kstack {
                    cm.kfree(ppn);
                }
                vs.free(&mut cm);
                return Ok(pid);
            }

            if !havekids {
                return Err(());
            }

            // Wait for children to exit.
            let chan = procs.proc(me).child_waitchannel.token();
            inner.table[me].chan = chan;
            inner.table[me].state = ProcState::SLEEPING;
            inner.nrunning -= 1;
            procs.promote(&mut inner);
            while inner.table[me].state != ProcState::RUNNING {
                inner = procs.gates[me]
                    .wait(inner)
                    .unwrap_or_else(|e| e.into_inner());
            }
            inner.table[me].chan = 0;
        }
    }

    /// Kill the process with the given pid. The victim won't exit until it
    /// next observes the flag (sleep loops and syscall returns check it).
    pub fn kill(&self, pid: Pid) -> Result<(), ()> {
        let procs = self.procs();
        let mut inner = procs.ptable();
        for i in 0..NPROC {
            if inner.table[i].pid == pid && inner.table[i].state != ProcState::UNUSED {
                procs.proc(i).set_killed();
                // Wake process from sleep if necessary.
                if inner.table[i].state == ProcState::SLEEPING {
                    inner.table[i].state = ProcState::RUNNABLE;
                    procs.promote(&mut inner);
                }
                return Ok(());
            }
        }
        Err(())
    }

    fn spawn_proc(&self, slot: usize, prog: UserProgram) {
        let kernel = self.arc();
        let handle = std::thread::Builder::new()
            .name(format!("proc-{}", slot))
            .spawn(move || {
                let ctx = KernelCtx::new(&kernel, slot);
                kernel.procs().wait_until_running(slot);
                let result =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| prog(&ctx)));
                // "Return to user space" of a finished program is exit;
                // a panicked one still exits so its parent's wait() and
                // the scheduler stay coherent, then the panic continues.
                kernel.exit(&ctx);
                if let Err(payload) = result {
                    std::panic::resume_unwind(payload);
                }
            })
            .expect("spawn_proc");
        self.procs().push_thread(handle);
    }

    /// Set up the first process and run `f` as its program. Returns after
    /// every process thread has finished.
    pub fn run_init<F>(&self, f: F)
    where
        F: FnOnce(&KernelCtx<'_>) + Send + 'static,
    {
        let procs = self.procs();
        let slot = self.allocproc().expect("run_init: allocproc");
        procs.init_slot.store(slot, Ordering::Release);
        procs.proc(slot).data.lock().set_name("initcode");
        {
            let mut inner = procs.ptable();
            inner.table[slot].state = ProcState::RUNNABLE;
            procs.promote(&mut inner);
        }
        self.spawn_proc(slot, Box::new(f));
        procs.join_all();
    }
}
