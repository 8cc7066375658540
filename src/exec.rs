//! exec: replace the calling process's address space with a fresh one
//! built from a program file, and set up the register contract for its
//! `main(argc, argv)`.
//!
//! The new space is assembled off to the side and swapped in atomically;
//! any failure discards it and leaves the caller unperturbed. The program
//! format itself is behind the `ProgramLoader` contract — the default
//! loader maps the file as a flat image at `CODE_BASE`.

use core::mem;

use arrayvec::ArrayVec;

use crate::fs::{InodeRef, Path};
use crate::param::{CODE_BASE, MAXARG, PGSIZE, SZ_2G};
use crate::proc::KernelCtx;
use crate::vm::{pgroundup, VmFlags, Vspace, VR_CODE, VR_HEAP, VR_USTACK};

pub trait ProgramLoader: Send + Sync {
    /// Load the program image behind `ip` into `vs`'s code region and
    /// return the entry point.
    fn load(&self, ctx: &KernelCtx<'_>, vs: &mut Vspace, ip: InodeRef) -> Result<u64, ()>;
}

/// Loads the whole file as one flat, writable image at `CODE_BASE`.
pub struct FlatBinaryLoader;

impl ProgramLoader for FlatBinaryLoader {
    fn load(&self, ctx: &KernelCtx<'_>, vs: &mut Vspace, ip: InodeRef) -> Result<u64, ()> {
        let kernel = ctx.kernel();
        let fs = kernel.fs();
        let size = fs.locki(ip, *ctx).size as usize;
        if size == 0 {
            return Err(());
        }

        let ppns = kernel.alloc_upages(CODE_BASE, size)?;
        {
            let mut cm = kernel.kmem().coremap();
            let added = vs.addmap(
                &mut cm,
                VR_CODE,
                CODE_BASE,
                size,
                &ppns,
                VmFlags::VPI_PRESENT | VmFlags::VPI_WRITABLE,
            );
            vs.region_mut(VR_CODE).size = added;
        }
        vs.invalidate();

        let mut image = vec![0u8; size];
        let n = fs.concurrent_readi(*ctx, ip, &mut image, 0)?;
        if n != size {
            return Err(());
        }
        let mut cm = kernel.kmem().coremap();
        vs.try_copy_out(&mut cm, CODE_BASE, &image).map_err(|_| ())?;
        Ok(CODE_BASE as u64)
    }
}

/// Copy bytes into a not-yet-installed address space.
fn write_to(ctx: &KernelCtx<'_>, vs: &Vspace, va: usize, bytes: &[u8]) -> Result<(), ()> {
    let mut cm = ctx.kernel().kmem().coremap();
    vs.try_copy_out(&mut cm, va, bytes).map_err(|_| ())
}

impl KernelCtx<'_> {
    pub fn exec(&self, path: &str, argv: &[&str]) -> Result<(), ()> {
        if argv.len() > MAXARG {
            return Err(());
        }
        let kernel = self.kernel();
        let fs = kernel.fs();

        let ip = fs.namei(*self, Path::new(path))?;
        let ip = scopeguard::guard(ip, |ip| fs.irelease(ip));

        // Build the new space off to the side; if anything goes wrong it
        // is torn down wholesale.
        let vs = Vspace::new();
        let mut vs = scopeguard::guard(vs, |vs| {
            let mut cm = kernel.kmem().coremap();
            vs.free(&mut cm);
        });

        // Load the program.
        let entry = kernel.loader().load(self, &mut vs, *ip)?;

        // The heap starts above the loaded image.
        let code_top = CODE_BASE + vs.region(VR_CODE).size;
        vs.region_mut(VR_HEAP).va_base = pgroundup(code_top);

        // Initialize the user stack.
        let ppns = kernel.alloc_upages(SZ_2G - PGSIZE, PGSIZE)?;
        {
            let mut cm = kernel.kmem().coremap();
            let added = vs.addmap(
                &mut cm,
                VR_USTACK,
                SZ_2G - PGSIZE,
                PGSIZE,
                &ppns,
                VmFlags::VPI_PRESENT | VmFlags::VPI_WRITABLE,
            );
            vs.region_mut(VR_USTACK).size = added;
        }
        vs.invalidate();

        // Copy the argument strings onto the new stack, highest first,
        // keeping pointer-size alignment as the address walks down.
        let mut addr = SZ_2G;
        let mut ptrs = ArrayVec::<u64, { MAXARG + 1 }>::new();
        for arg in argv.iter().rev() {
            let bytes = arg.as_bytes();
            addr -= bytes.len() + 1;
            addr &= !(mem::size_of::<usize>() - 1);
            write_to(self, &vs, addr, bytes)?;
            write_to(self, &vs, addr + bytes.len(), &[0])?;
            ptrs.push(addr as u64);
        }
        ptrs.reverse();
        ptrs.push(0);

        // Copy over the argv array itself.
        let mut table = Vec::with_capacity(ptrs.len() * 8);
        for p in ptrs.iter() {
            table.extend_from_slice(&p.to_le_bytes());
        }
        addr -= table.len();
        addr &= !(mem::size_of::<usize>() - 1);
        write_to(self, &vs, addr, &table)?;
        let argv_addr = addr;

        // Commit: registers for main, the process name, then the address
        // space swap. Nothing past this point can fail.
        let argc = argv.len() as u64;
        {
            let mut data = self.proc().data.lock();
            data.tf.rip = entry;
            data.tf.rdi = argc;
            data.tf.rsi = argv_addr as u64;
            data.tf.rsp = (argv_addr - mem::size_of::<usize>()) as u64;
            data.tf.rax = 0;
            let name = path.rsplit('/').find(|s| !s.is_empty()).unwrap_or(path);
            data.set_name(name);
        }

        let new_vs = scopeguard::ScopeGuard::into_inner(vs);
        let old_vs = {
            let mut cur = self.proc().vspace.lock();
            mem::replace(&mut *cur, new_vs)
        };
        let mut cm = kernel.kmem().coremap();
        old_vs.free(&mut cm);
        Ok(())
    }
}
