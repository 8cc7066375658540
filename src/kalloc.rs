//! Physical memory allocator, for user process pages, kernel stacks, and
//! the swap engine. Allocates whole 4096-byte pages tracked by the coremap:
//! one entry per page with an availability bit, a user flag, the mapping
//! virtual address, and a reference count (shared > 1 under copy-on-write).
//!
//! When no page is free, `Kernel::kalloc` evicts a random user page to the
//! on-disk swap region and retries. Eviction is deliberately random, not
//! LRU; the generator is a bare LCG seeded at boot.

use crate::lock::{SpinLock, SpinLockGuard};
use crate::param::{BLKS_PER_PAGE, BSIZE, PGSIZE, SWAPSIZE_PAGES};
use crate::vm::VPageInfo;

pub type Ppn = u32;

pub(crate) struct CoreMapEntry {
    pub available: bool,
    pub user: bool,
    pub ref_ct: u32,
    pub va: usize,
}

pub(crate) struct SwapStat {
    pub used: bool,
    /// Distinct `vpage_info`s referencing this slot.
    pub ref_ct: u32,
}

pub struct Coremap {
    entries: Vec<CoreMapEntry>,
    pages: Vec<Box<[u8; PGSIZE]>>,
    swap: Vec<SwapStat>,
    pub(crate) free_pages: usize,
    pub(crate) pages_in_use: usize,
    pub(crate) pages_in_swap: usize,
    rand_next: u64,
}

impl Coremap {
    fn new(npages: usize) -> Self {
        let mut entries = Vec::with_capacity(npages);
        let mut pages = Vec::with_capacity(npages);
        for _ in num_iter::range_step(0usize, npages * PGSIZE, PGSIZE) {
            entries.push(CoreMapEntry {
                available: true,
                user: false,
                ref_ct: 0,
                va: 0,
            });
            pages.push(Box::new([0u8; PGSIZE]));
        }
        let mut swap = Vec::with_capacity(SWAPSIZE_PAGES);
        swap.resize_with(SWAPSIZE_PAGES, || SwapStat {
            used: false,
            ref_ct: 0,
        });
        Self {
            entries,
            pages,
            swap,
            free_pages: npages,
            pages_in_use: 0,
            pages_in_swap: 0,
            rand_next: 1,
        }
    }

    pub(crate) fn npages(&self) -> usize {
        self.entries.len()
    }

    /// First-fit allocation; the caller falls back to `swap_out` on None.
    pub(crate) fn kalloc_raw(&mut self) -> Option<Ppn> {
        for (i, e) in self.entries.iter_mut().enumerate() {
            if e.available {
                e.available = false;
                e.ref_ct = 1;
                self.pages_in_use += 1;
                self.free_pages -= 1;
                self.pages[i].fill(0);
                return Some(i as Ppn);
            }
        }
        None
    }

    /// Drop one reference to the page; the last reference frees it.
    pub(crate) fn kfree(&mut self, ppn: Ppn) {
        let e = &mut self.entries[ppn as usize];
        assert!(!e.available, "kfree");
        if e.ref_ct > 1 {
            e.ref_ct -= 1;
            return;
        }
        e.ref_ct = 0;
        e.available = true;
        e.user = false;
        e.va = 0;
        self.pages_in_use -= 1;
        self.free_pages += 1;
        // Fill with junk to catch dangling refs.
        self.pages[ppn as usize].fill(2);
    }

    /// Record that the page is user-owned and which user VA maps it, so the
    /// evictor can find and unmap it.
    pub(crate) fn mark_user_mem(&mut self, ppn: Ppn, va: usize) {
        let e = &mut self.entries[ppn as usize];
        e.user = true;
        e.va = va;
    }

    pub(crate) fn increment_pp_ref_ct(&mut self, ppn: Ppn) {
        self.entries[ppn as usize].ref_ct += 1;
    }

    /// Drop one reference without freeing; the swap engine uses this while
    /// it is still responsible for the page.
    pub(crate) fn dec_ref(&mut self, ppn: Ppn) {
        self.entries[ppn as usize].ref_ct -= 1;
    }

    pub(crate) fn ref_ct(&self, ppn: Ppn) -> u32 {
        self.entries[ppn as usize].ref_ct
    }

    /// Copy-on-write fault bookkeeping: if the page is still shared, drop
    /// our reference and tell the caller to copy; otherwise grant the page
    /// exclusively, flipping the vpage writable and out of COW mode.
    pub(crate) fn cow_copy_out_page(&mut self, ppn: Ppn, vpi: &mut VPageInfo) -> bool {
        let e = &mut self.entries[ppn as usize];
        if e.ref_ct > 1 {
            e.ref_ct -= 1;
            true
        } else {
            vpi.writable = true;
            vpi.copy_on_write = false;
            false
        }
    }

    pub(crate) fn page(&self, ppn: Ppn) -> &[u8; PGSIZE] {
        &self.pages[ppn as usize]
    }

    pub(crate) fn page_mut(&mut self, ppn: Ppn) -> &mut [u8; PGSIZE] {
        &mut self.pages[ppn as usize]
    }

    pub(crate) fn copy_page(&mut self, src: Ppn, dst: Ppn) {
        let bytes = *self.pages[src as usize];
        *self.pages[dst as usize] = bytes;
    }

    /// Returns random integer from [0, limit).
    fn rand(&mut self, limit: usize) -> usize {
        self.rand_next = self
            .rand_next
            .wrapping_mul(1103515245)
            .wrapping_add(12345);
        ((self.rand_next / 65536) as usize) % limit
    }

    /// Pick a random evictable user page.
    fn random_user_page(&mut self) -> Ppn {
        let npages = self.entries.len();
        for _ in 0..100 {
            let i = self.rand(npages);
            let e = &self.entries[i];
            if e.user && !e.available && e.ref_ct > 0 {
                return i as Ppn;
            }
        }
        panic!("Tried 100 random indices for random user page, all failed");
    }

    /// Take or drop one `vpage_info` reference on a swap slot; the slot is
    /// reclaimed when its reference count reaches zero.
    pub(crate) fn swap_ref(&mut self, slot: u32, delta: i32) {
        let s = &mut self.swap[slot as usize];
        if delta > 0 {
            s.ref_ct += delta as u32;
        } else {
            s.ref_ct -= (-delta) as u32;
            if s.ref_ct == 0 {
                s.used = false;
                self.pages_in_swap -= 1;
            }
        }
    }

    pub(crate) fn swap_used(&self, slot: u32) -> bool {
        self.swap[slot as usize].used
    }

    pub(crate) fn swap_ref_ct(&self, slot: u32) -> u32 {
        self.swap[slot as usize].ref_ct
    }

    fn alloc_swap_slot(&mut self) -> u32 {
        for (i, s) in self.swap.iter_mut().enumerate() {
            if !s.used {
                s.used = true;
                s.ref_ct = 0;
                self.pages_in_swap += 1;
                return i as u32;
            }
        }
        panic!("swap_out: SWAP REGION FULL");
    }

    /// Release an evicted page whose mappings have all moved to a swap slot.
    fn release_evicted(&mut self, ppn: Ppn) {
        let e = &mut self.entries[ppn as usize];
        assert_eq!(e.ref_ct, 0, "release_evicted");
        e.available = true;
        e.user = false;
        e.va = 0;
        self.pages_in_use -= 1;
        self.free_pages += 1;
        self.pages[ppn as usize].fill(2);
    }
}

pub struct Kmem {
    ctl: SpinLock<Coremap>,
}

impl Kmem {
    pub(crate) fn new(npages: usize) -> Self {
        Self {
            ctl: SpinLock::new("kmem", Coremap::new(npages)),
        }
    }

    pub(crate) fn coremap(&self) -> SpinLockGuard<'_, Coremap> {
        self.ctl.lock()
    }
}

use crate::kernel::Kernel;

impl Kernel {
    /// Allocate one physical page. When memory is exhausted, evict a random
    /// user page to the swap region and retry; None only if eviction fails.
    pub(crate) fn kalloc(&self) -> Option<Ppn> {
        loop {
            if let Some(ppn) = self.kmem().coremap().kalloc_raw() {
                return Some(ppn);
            }
            if !self.swap_out() {
                return None;
            }
        }
    }

    pub(crate) fn kfree(&self, ppn: Ppn) {
        self.kmem().coremap().kfree(ppn);
    }

    /// Evict one random user page to a free swap slot, updating every
    /// address space that maps it before the page is reused.
    ///
    /// Swap I/O goes straight to the disk, bypassing the buffer cache and
    /// the log: slots are single-owner while I/O is in flight and carry no
    /// crash-safety contract, so no sleep lock is needed under the kmem
    /// spin lock.
    fn swap_out(&self) -> bool {
        let mut cm = self.kmem().coremap();
        let slot = cm.alloc_swap_slot();

        // A candidate may be user-marked but reachable from no process yet
        // (an address space still being assembled by exec); its references
        // don't drain, so pick another page.
        let mut tries = 0;
        let ppn = loop {
            let candidate = cm.random_user_page();
            self.procs().update_vspace(&mut cm, slot, false, candidate);
            if cm.ref_ct(candidate) == 0 {
                break candidate;
            }
            tries += 1;
            if tries >= 100 {
                panic!("swap_out: no evictable user page");
            }
        };

        self.swap_write(&mut cm, slot, ppn);
        cm.release_evicted(ppn);
        true
    }

    /// Service a fault on a swapped-out page: allocate a fresh page, read
    /// the slot back, and re-point every mapping at the new page. The slot
    /// itself is reclaimed once its last reference is dropped.
    pub(crate) fn swap_in(&self, slot: u32, va: usize) -> Result<(), ()> {
        let ppn = self.kalloc().ok_or(())?;

        let mut cm = self.kmem().coremap();
        // Mappings re-add their references below.
        cm.entries[ppn as usize].ref_ct = 0;
        cm.mark_user_mem(ppn, va);

        self.swap_read(&mut cm, slot, ppn);
        self.procs().update_vspace(&mut cm, slot, true, ppn);

        if cm.ref_ct(ppn) == 0 {
            // The slot no longer backed any mapping; give the page back.
            cm.entries[ppn as usize].ref_ct = 1;
            cm.kfree(ppn);
            return Err(());
        }
        Ok(())
    }

    fn swap_write(&self, cm: &mut Coremap, slot: u32, ppn: Ppn) {
        let disk = self.fs().disk();
        let base = self.fs().swapstart() + slot * BLKS_PER_PAGE as u32;
        let page = cm.page(ppn);
        let mut buf = [0u8; BSIZE];
        for i in 0..BLKS_PER_PAGE {
            buf.copy_from_slice(&page[i * BSIZE..(i + 1) * BSIZE]);
            disk.write(base + i as u32, &buf);
        }
    }

    fn swap_read(&self, cm: &mut Coremap, slot: u32, ppn: Ppn) {
        let disk = self.fs().disk();
        let base = self.fs().swapstart() + slot * BLKS_PER_PAGE as u32;
        let mut buf = [0u8; BSIZE];
        for i in 0..BLKS_PER_PAGE {
            disk.read(base + i as u32, &mut buf);
            cm.page_mut(ppn)[i * BSIZE..(i + 1) * BSIZE].copy_from_slice(&buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_recycles_pages() {
        let mut cm = Coremap::new(4);
        let a = cm.kalloc_raw().unwrap();
        let b = cm.kalloc_raw().unwrap();
        assert_ne!(a, b);
        assert_eq!(cm.free_pages, 2);
        cm.kfree(a);
        assert_eq!(cm.free_pages, 3);
        // Freed page is junk-filled to catch dangling references.
        assert!(cm.page(a).iter().all(|&b| b == 2));
        let c = cm.kalloc_raw().unwrap();
        assert_eq!(c, a);
        // Fresh allocation is zeroed.
        assert!(cm.page(c).iter().all(|&b| b == 0));
    }

    #[test]
    fn shared_pages_free_by_refcount() {
        let mut cm = Coremap::new(2);
        let a = cm.kalloc_raw().unwrap();
        cm.increment_pp_ref_ct(a);
        cm.kfree(a);
        assert_eq!(cm.ref_ct(a), 1);
        assert_eq!(cm.pages_in_use, 1);
        cm.kfree(a);
        assert_eq!(cm.free_pages, 2);
    }

    #[test]
    fn swap_slots_reclaim_at_zero() {
        let mut cm = Coremap::new(1);
        let s = cm.alloc_swap_slot();
        cm.swap_ref(s, 2);
        assert!(cm.swap_used(s));
        cm.swap_ref(s, -1);
        assert!(cm.swap_used(s));
        cm.swap_ref(s, -1);
        assert!(!cm.swap_used(s));
        assert_eq!(cm.pages_in_swap, 0);
    }
}
