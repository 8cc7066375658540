//! Virtual memory: per-process address spaces.
//!
//! A `Vspace` is an ordered set of regions (code and heap grow up, the user
//! stack grows down from `SZ_2G`) of per-page `VPageInfo` records, plus the
//! installed page table. User copies consult *only* installed page-table
//! entries, so a stale table after a mapping change is a real bug — exactly
//! the discipline `vspaceinvalidate` exists to enforce. A failed lookup or
//! permission check surfaces as a `PageFault` routed through the trap
//! dispatcher (swap-in, copy-on-write, stack growth, or kill).

use itertools::izip;

use crate::kalloc::{Coremap, Ppn};
use crate::kernel::Kernel;
use crate::param::{CODE_BASE, PGSIZE, SZ_2G, USTACK_MAXPAGES};
use crate::proc::KernelCtx;
use crate::trap;
use std::collections::BTreeMap;

pub const fn pgroundup(x: usize) -> usize {
    (x + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pgrounddown(x: usize) -> usize {
    x & !(PGSIZE - 1)
}

bitflags::bitflags! {
    /// Mapping flags for `vregionaddmap`.
    pub struct VmFlags: u8 {
        const VPI_PRESENT = 1;
        const VPI_WRITABLE = 2;
    }
}

/// Per-virtual-page bookkeeping. When `used`, the page is either `present`
/// in a physical page (`ppn`) or `on_disk` in a swap slot, never both.
#[derive(Copy, Clone, Default)]
pub struct VPageInfo {
    pub used: bool,
    pub present: bool,
    pub writable: bool,
    pub copy_on_write: bool,
    pub on_disk: Option<u32>,
    pub ppn: Ppn,
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub enum GrowthDir {
    Up,
    Down,
}

pub const VR_CODE: usize = 0;
pub const VR_HEAP: usize = 1;
pub const VR_USTACK: usize = 2;
pub const NREGIONS: usize = 3;

pub struct VRegion {
    pub va_base: usize,
    pub size: usize,
    dir: GrowthDir,
    pages: Vec<VPageInfo>,
}

impl VRegion {
    fn new(va_base: usize, dir: GrowthDir) -> Self {
        Self {
            va_base,
            size: 0,
            dir,
            pages: Vec::new(),
        }
    }

    pub fn dir(&self) -> GrowthDir {
        self.dir
    }

    /// Whether `va` falls inside the mapped extent of the region.
    pub fn contains(&self, va: usize) -> bool {
        match self.dir {
            GrowthDir::Up => va >= self.va_base && va < self.va_base + self.size,
            GrowthDir::Down => va < self.va_base && va >= self.va_base - self.size,
        }
    }

    /// Index of the page covering `va`.
    fn page_index(&self, va: usize) -> Option<usize> {
        if !self.contains(va) {
            return None;
        }
        let idx = match self.dir {
            GrowthDir::Up => (va - self.va_base) / PGSIZE,
            GrowthDir::Down => (self.va_base - 1 - va) / PGSIZE,
        };
        if idx < self.pages.len() {
            Some(idx)
        } else {
            None
        }
    }

    /// Base virtual address of page `idx`.
    fn page_va(&self, idx: usize) -> usize {
        match self.dir {
            GrowthDir::Up => self.va_base + idx * PGSIZE,
            GrowthDir::Down => self.va_base - (idx + 1) * PGSIZE,
        }
    }

    pub fn vpage(&self, va: usize) -> Option<&VPageInfo> {
        self.page_index(va).map(move |i| &self.pages[i])
    }

    pub fn vpage_mut(&mut self, va: usize) -> Option<&mut VPageInfo> {
        match self.page_index(va) {
            Some(i) => Some(&mut self.pages[i]),
            None => None,
        }
    }

    fn ensure_pages(&mut self, idx: usize) {
        if idx >= self.pages.len() {
            self.pages.resize(idx + 1, VPageInfo::default());
        }
    }
}

#[derive(Copy, Clone)]
struct Pte {
    ppn: Ppn,
    writable: bool,
}

/// The installed translation state. Real hardware walks a radix tree; the
/// exact format is implementation-defined, and here it is a sorted map from
/// virtual page number to entry.
struct PageTable {
    map: BTreeMap<usize, Pte>,
}

impl PageTable {
    fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    fn resolve(&self, vpn: usize) -> Option<Pte> {
        self.map.get(&vpn).copied()
    }

    fn set(&mut self, vpn: usize, pte: Pte) {
        let _ = self.map.insert(vpn, pte);
    }

    fn clear(&mut self) {
        self.map.clear();
    }

    fn remove(&mut self, vpn: usize) {
        let _ = self.map.remove(&vpn);
    }
}

/// A process's address space.
pub struct Vspace {
    regions: [VRegion; NREGIONS],
    pgtbl: PageTable,
}

/// A user-memory access the page table could not satisfy; routed through
/// the trap dispatcher.
#[derive(Copy, Clone, Debug)]
pub struct PageFault {
    pub addr: usize,
    pub write: bool,
}

impl Vspace {
    pub fn new() -> Self {
        Self {
            regions: [
                VRegion::new(CODE_BASE, GrowthDir::Up),
                VRegion::new(CODE_BASE, GrowthDir::Up),
                VRegion::new(SZ_2G, GrowthDir::Down),
            ],
            pgtbl: PageTable::new(),
        }
    }

    pub fn region(&self, idx: usize) -> &VRegion {
        &self.regions[idx]
    }

    pub fn region_mut(&mut self, idx: usize) -> &mut VRegion {
        &mut self.regions[idx]
    }

    /// The region whose mapped extent covers `va`.
    pub fn va2region(&self, va: usize) -> Option<usize> {
        (0..NREGIONS).find(|&i| self.regions[i].contains(va))
    }

    /// Rebuild the installed page table from the region tables. Must be
    /// called after any mapping change; translations not reinstalled here
    /// do not exist as far as user copies are concerned.
    pub fn invalidate(&mut self) {
        self.pgtbl.clear();
        for r in self.regions.iter() {
            for (idx, vpi) in r.pages.iter().enumerate() {
                if vpi.used && vpi.present {
                    self.pgtbl.set(
                        r.page_va(idx) / PGSIZE,
                        Pte {
                            ppn: vpi.ppn,
                            writable: vpi.writable,
                        },
                    );
                }
            }
        }
    }

    /// Installing an address space (re)loads its translations; in this
    /// embodiment that is a rebuild.
    pub fn install(&mut self) {
        self.invalidate();
    }

    /// Drop a single translation without touching the rest of the table.
    pub fn mark_not_present(&mut self, va: usize) {
        self.pgtbl.remove(va / PGSIZE);
    }

    /// Install pre-allocated pages as mappings of region `r` covering
    /// `[pgrounddown(va), pgroundup(va + len))`. `ppns` must hold one page
    /// per covered page (`Kernel::alloc_upages` sizes it). Returns the
    /// number of bytes of new mappings; the caller grows `region.size`
    /// itself. Pages are allocated before any lock is taken and installed
    /// here under the kmem lock, so eviction never races a half-built
    /// mapping.
    pub(crate) fn addmap(
        &mut self,
        cm: &mut Coremap,
        r: usize,
        va: usize,
        len: usize,
        ppns: &[Ppn],
        flags: VmFlags,
    ) -> usize {
        if len == 0 {
            return 0;
        }
        let start = pgrounddown(va);
        let end = pgroundup(va + len);
        for (page_va, &ppn) in izip!(num_iter::range_step(start, end, PGSIZE), ppns.iter()) {
            cm.mark_user_mem(ppn, page_va);
            let region = &mut self.regions[r];
            let idx = match region.dir {
                GrowthDir::Up => (page_va - region.va_base) / PGSIZE,
                GrowthDir::Down => (region.va_base - 1 - page_va) / PGSIZE,
            };
            region.ensure_pages(idx);
            let vpi = &mut region.pages[idx];
            assert!(!vpi.used, "addmap: page already mapped");
            *vpi = VPageInfo {
                used: true,
                present: flags.contains(VmFlags::VPI_PRESENT),
                writable: flags.contains(VmFlags::VPI_WRITABLE),
                copy_on_write: false,
                on_disk: None,
                ppn,
            };
        }
        end - start
    }

    /// Duplicate `src` into `self` for fork, copy-on-write: both sides lose
    /// write permission on present pages and gain the COW mark; physical
    /// pages and swap slots pick up one reference per new mapping.
    pub fn copy_from(&mut self, src: &mut Vspace, cm: &mut Coremap) {
        for (dst_r, src_r) in izip!(self.regions.iter_mut(), src.regions.iter_mut()) {
            dst_r.va_base = src_r.va_base;
            dst_r.size = src_r.size;
            dst_r.dir = src_r.dir;
            dst_r.pages.clear();
            for vpi in src_r.pages.iter_mut() {
                if vpi.used {
                    if vpi.present {
                        vpi.writable = false;
                        vpi.copy_on_write = true;
                        cm.increment_pp_ref_ct(vpi.ppn);
                    } else if let Some(slot) = vpi.on_disk {
                        vpi.copy_on_write = true;
                        vpi.writable = false;
                        cm.swap_ref(slot, 1);
                    }
                }
                dst_r.pages.push(*vpi);
            }
        }
        src.invalidate();
        self.invalidate();
    }

    /// Move every mapping of physical page `ppn` out to swap slot `slot`.
    pub(crate) fn swap_out_page(&mut self, cm: &mut Coremap, slot: u32, ppn: Ppn) {
        for r in 0..NREGIONS {
            for idx in 0..self.regions[r].pages.len() {
                let va = self.regions[r].page_va(idx);
                let vpi = &mut self.regions[r].pages[idx];
                if vpi.used && vpi.present && vpi.ppn == ppn {
                    vpi.present = false;
                    vpi.on_disk = Some(slot);
                    vpi.ppn = 0;
                    cm.dec_ref(ppn);
                    cm.swap_ref(slot, 1);
                    self.pgtbl.remove(va / PGSIZE);
                }
            }
        }
    }

    /// Re-point every mapping of swap slot `slot` at the fresh page `ppn`.
    pub(crate) fn swap_in_page(&mut self, cm: &mut Coremap, slot: u32, ppn: Ppn) {
        for r in 0..NREGIONS {
            for idx in 0..self.regions[r].pages.len() {
                let va = self.regions[r].page_va(idx);
                let vpi = &mut self.regions[r].pages[idx];
                if vpi.used && !vpi.present && vpi.on_disk == Some(slot) {
                    vpi.on_disk = None;
                    vpi.present = true;
                    vpi.ppn = ppn;
                    cm.increment_pp_ref_ct(ppn);
                    cm.swap_ref(slot, -1);
                    self.pgtbl.set(
                        va / PGSIZE,
                        Pte {
                            ppn,
                            writable: vpi.writable,
                        },
                    );
                }
            }
        }
    }

    /// Release every page and swap reference this address space holds.
    pub(crate) fn free(mut self, cm: &mut Coremap) {
        for r in self.regions.iter_mut() {
            for vpi in r.pages.drain(..) {
                if !vpi.used {
                    continue;
                }
                if vpi.present {
                    cm.kfree(vpi.ppn);
                } else if let Some(slot) = vpi.on_disk {
                    cm.swap_ref(slot, -1);
                }
            }
            r.size = 0;
        }
        self.pgtbl.clear();
    }

    /// Copy `src` into user memory at `va` through the installed page
    /// table. Stops at the first untranslatable or read-only page.
    pub fn try_copy_out(&self, cm: &mut Coremap, va: usize, src: &[u8]) -> Result<(), PageFault> {
        let mut off = 0;
        while off < src.len() {
            let addr = va + off;
            let n = (PGSIZE - addr % PGSIZE).min(src.len() - off);
            let pte = self.pgtbl.resolve(addr / PGSIZE).ok_or(PageFault {
                addr,
                write: true,
            })?;
            if !pte.writable {
                return Err(PageFault { addr, write: true });
            }
            let page = cm.page_mut(pte.ppn);
            page[addr % PGSIZE..addr % PGSIZE + n].copy_from_slice(&src[off..off + n]);
            off += n;
        }
        Ok(())
    }

    /// Copy user memory at `va` into `dst` through the installed page table.
    pub fn try_copy_in(&self, cm: &Coremap, va: usize, dst: &mut [u8]) -> Result<(), PageFault> {
        let mut off = 0;
        while off < dst.len() {
            let addr = va + off;
            let n = (PGSIZE - addr % PGSIZE).min(dst.len() - off);
            let pte = self.pgtbl.resolve(addr / PGSIZE).ok_or(PageFault {
                addr,
                write: false,
            })?;
            let page = cm.page(pte.ppn);
            dst[off..off + n].copy_from_slice(&page[addr % PGSIZE..addr % PGSIZE + n]);
            off += n;
        }
        Ok(())
    }
}

impl Kernel {
    /// Allocate the pages needed to map `len` bytes starting at `va`,
    /// evicting as necessary. On partial failure everything is given back.
    pub(crate) fn alloc_upages(&self, va: usize, len: usize) -> Result<Vec<Ppn>, ()> {
        let n = (pgroundup(va + len) - pgrounddown(va)) / PGSIZE;
        let mut ppns = Vec::with_capacity(n);
        for _ in 0..n {
            match self.kalloc() {
                Some(ppn) => ppns.push(ppn),
                None => {
                    let mut cm = self.kmem().coremap();
                    for ppn in ppns {
                        cm.kfree(ppn);
                    }
                    return Err(());
                }
            }
        }
        Ok(ppns)
    }

    /// Service a write fault on a copy-on-write page: clone the page if it
    /// is still shared, or flip it writable in place if this process holds
    /// the last reference.
    pub(crate) fn vspace_copy_on_write(&self, ctx: &KernelCtx<'_>, addr: usize) -> Result<(), ()> {
        // A clone target is allocated up front so the mapping update is
        // atomic under the kmem lock; eviction can run during kalloc, so
        // the vpage is re-checked afterwards.
        let spare = self.kalloc().ok_or(())?;

        let mut cm = self.kmem().coremap();
        let mut vs = ctx.proc().vspace.lock();
        let r = match vs.va2region(addr) {
            Some(r) => r,
            None => {
                cm.kfree(spare);
                return Err(());
            }
        };
        let page_va = pgrounddown(addr);
        let vpi = match vs.regions[r].vpage_mut(addr) {
            Some(vpi) => vpi,
            None => {
                cm.kfree(spare);
                return Err(());
            }
        };
        if !vpi.used || !vpi.copy_on_write {
            cm.kfree(spare);
            return Err(());
        }
        if !vpi.present {
            // Evicted while we allocated; the retried access will swap it
            // back in first.
            cm.kfree(spare);
            return Ok(());
        }

        let old = vpi.ppn;
        if cm.cow_copy_out_page(old, vpi) {
            // Still shared: our reference moved off the old page; copy its
            // bytes into the private one.
            cm.copy_page(old, spare);
            cm.mark_user_mem(spare, page_va);
            vpi.ppn = spare;
            vpi.writable = true;
            vpi.copy_on_write = false;
        } else {
            // Exclusive: granted in place.
            cm.kfree(spare);
        }
        vs.invalidate();
        Ok(())
    }

    /// Grow the user stack to cover a fault at `addr`, up to the cap.
    pub(crate) fn grow_user_stack_ondemand(
        &self,
        ctx: &KernelCtx<'_>,
        addr: usize,
    ) -> Result<(), ()> {
        // Only the owner grows its stack, so the bounds read here stay
        // valid while the pages are allocated below.
        let (prev_limit, n) = {
            let vs = ctx.proc().vspace.lock();
            let stack = vs.region(VR_USTACK);
            let prev_limit = stack.va_base - stack.size;
            let n = pgroundup(prev_limit - addr);
            if stack.size + n > USTACK_MAXPAGES * PGSIZE {
                return Err(());
            }
            (prev_limit, n)
        };
        let ppns = self.alloc_upages(prev_limit - n, n)?;
        let mut cm = self.kmem().coremap();
        let mut vs = ctx.proc().vspace.lock();
        let added = vs.addmap(
            &mut cm,
            VR_USTACK,
            prev_limit - n,
            n,
            &ppns,
            VmFlags::VPI_PRESENT | VmFlags::VPI_WRITABLE,
        );
        vs.regions[VR_USTACK].size += added;
        vs.invalidate();
        Ok(())
    }
}

impl KernelCtx<'_> {
    /// Copy bytes into this process's memory, resolving faults (swap-in,
    /// COW, stack growth) along the way.
    pub fn copy_out(&self, va: usize, src: &[u8]) -> Result<(), ()> {
        loop {
            let fault = {
                let mut cm = self.kernel().kmem().coremap();
                let vs = self.proc().vspace.lock();
                match vs.try_copy_out(&mut cm, va, src) {
                    Ok(()) => return Ok(()),
                    Err(f) => f,
                }
            };
            trap::handle_page_fault(self, fault)?;
        }
    }

    /// Copy bytes out of this process's memory, resolving faults.
    pub fn copy_in(&self, va: usize, dst: &mut [u8]) -> Result<(), ()> {
        loop {
            let fault = {
                let cm = self.kernel().kmem().coremap();
                let vs = self.proc().vspace.lock();
                match vs.try_copy_in(&cm, va, dst) {
                    Ok(()) => return Ok(()),
                    Err(f) => f,
                }
            };
            trap::handle_page_fault(self, fault)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_indexing_up_and_down() {
        let mut up = VRegion::new(0x10000, GrowthDir::Up);
        up.size = 2 * PGSIZE;
        up.ensure_pages(1);
        assert_eq!(up.page_index(0x10000), Some(0));
        assert_eq!(up.page_index(0x10000 + PGSIZE), Some(1));
        assert_eq!(up.page_index(0x10000 + 2 * PGSIZE), None);
        assert_eq!(up.page_va(1), 0x10000 + PGSIZE);

        let mut down = VRegion::new(SZ_2G, GrowthDir::Down);
        down.size = 2 * PGSIZE;
        down.ensure_pages(1);
        assert_eq!(down.page_index(SZ_2G - 1), Some(0));
        assert_eq!(down.page_index(SZ_2G - PGSIZE), Some(0));
        assert_eq!(down.page_index(SZ_2G - PGSIZE - 1), Some(1));
        assert_eq!(down.page_va(0), SZ_2G - PGSIZE);
        assert_eq!(down.page_va(1), SZ_2G - 2 * PGSIZE);
        assert!(!down.contains(SZ_2G));
    }

    #[test]
    fn page_table_only_serves_installed_entries() {
        let mut vs = Vspace::new();
        let r = vs.region_mut(VR_CODE);
        r.ensure_pages(0);
        r.pages[0] = VPageInfo {
            used: true,
            present: true,
            writable: true,
            copy_on_write: false,
            on_disk: None,
            ppn: 7,
        };
        r.size = PGSIZE;
        // Not installed yet: no translation.
        assert!(vs.pgtbl.resolve(CODE_BASE / PGSIZE).is_none());
        vs.invalidate();
        assert_eq!(vs.pgtbl.resolve(CODE_BASE / PGSIZE).unwrap().ppn, 7);
        vs.mark_not_present(CODE_BASE);
        assert!(vs.pgtbl.resolve(CODE_BASE / PGSIZE).is_none());
    }
}
