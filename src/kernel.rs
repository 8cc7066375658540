//! The kernel aggregate: every subsystem singleton, built in one place
//! with explicit initialization ordering (memory, processes, file-system
//! recovery, devices). Tests construct their own instance and inject the
//! disk, the physical page count, and the program loader.

use core::sync::atomic::AtomicUsize;
use std::sync::{Arc, Weak};

use crate::console::{consoleread, consolewrite, Console};
use crate::disk::Disk;
use crate::exec::{FlatBinaryLoader, ProgramLoader};
use crate::file::{Devsw, FTable};
use crate::fs::FileSystem;
use crate::kalloc::Kmem;
use crate::param::{CONSOLE, NDEV, NPHYSPAGE};
use crate::proc::Procs;

pub struct KernelBuilder {
    disk: Option<Arc<dyn Disk>>,
    nphyspage: usize,
    loader: Box<dyn ProgramLoader + Send + Sync>,
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self {
            disk: None,
            nphyspage: NPHYSPAGE,
            loader: Box::new(FlatBinaryLoader),
        }
    }

    pub fn disk(mut self, disk: Arc<dyn Disk>) -> Self {
        self.disk = Some(disk);
        self
    }

    /// Size the physical page pool; small pools force the swap engine.
    pub fn phys_pages(mut self, npages: usize) -> Self {
        self.nphyspage = npages;
        self
    }

    pub fn loader(mut self, loader: Box<dyn ProgramLoader + Send + Sync>) -> Self {
        self.loader = loader;
        self
    }

    /// Boot: initialize memory and the process table, then mount the file
    /// system (replaying the log) and wire up the device switch.
    pub fn build(self) -> Arc<Kernel> {
        let nphyspage = self.nphyspage;
        let loader = self.loader;
        let disk = self.disk.expect("KernelBuilder: no disk");
        let mut devsw = [Devsw {
            read: None,
            write: None,
        }; NDEV];
        devsw[CONSOLE as usize] = Devsw {
            read: Some(consoleread),
            write: Some(consolewrite),
        };

        Arc::new_cyclic(|me| Kernel {
            self_ref: me.clone(),
            kmem: Kmem::new(nphyspage),
            procs: Procs::new(),
            ftable: FTable::new(),
            console: Console::new(),
            devsw,
            loader,
            num_page_faults: AtomicUsize::new(0),
            fs: FileSystem::new(disk),
        })
    }
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Kernel {
    self_ref: Weak<Kernel>,
    kmem: Kmem,
    procs: Procs,
    ftable: FTable,
    console: Console,
    devsw: [Devsw; NDEV],
    loader: Box<dyn ProgramLoader + Send + Sync>,
    pub(crate) num_page_faults: AtomicUsize,
    fs: FileSystem,
}

impl Kernel {
    /// Boot a kernel on `disk` with the default configuration.
    pub fn new(disk: Arc<dyn Disk>) -> Arc<Kernel> {
        KernelBuilder::new().disk(disk).build()
    }

    /// An owning handle to this kernel, for process threads.
    pub(crate) fn arc(&self) -> Arc<Kernel> {
        self.self_ref.upgrade().expect("kernel: gone")
    }

    pub fn kmem(&self) -> &Kmem {
        &self.kmem
    }

    pub fn procs(&self) -> &Procs {
        &self.procs
    }

    pub fn ftable(&self) -> &FTable {
        &self.ftable
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub(crate) fn loader(&self) -> &(dyn ProgramLoader + Send + Sync) {
        &*self.loader
    }

    /// The device functions for `devid`, if a device is registered there.
    pub fn devsw(&self, devid: i16) -> Option<&Devsw> {
        if devid < 0 || devid as usize >= NDEV {
            return None;
        }
        let d = &self.devsw[devid as usize];
        if d.read.is_none() && d.write.is_none() {
            None
        } else {
            Some(d)
        }
    }
}
