//! Validated user copy-in primitives: the boundary where raw user
//! addresses become kernel values. Everything here resolves faults through
//! the normal page-fault path and rejects out-of-range or oversized input.

use crate::param::{MAXARG, MAXPATH};
use crate::proc::KernelCtx;

impl KernelCtx<'_> {
    /// Fetch a pointer-sized word from user memory.
    pub fn fetch_usize(&self, va: usize) -> Result<usize, ()> {
        let mut bytes = [0u8; core::mem::size_of::<usize>()];
        self.copy_in(va, &mut bytes)?;
        Ok(usize::from_le_bytes(bytes))
    }

    /// Fetch a NUL-terminated string of at most `max` bytes from user
    /// memory.
    pub fn fetch_str(&self, va: usize, max: usize) -> Result<String, ()> {
        let mut out = Vec::new();
        let mut b = [0u8; 1];
        loop {
            if out.len() > max {
                return Err(());
            }
            self.copy_in(va + out.len(), &mut b)?;
            if b[0] == 0 {
                break;
            }
            out.push(b[0]);
        }
        String::from_utf8(out).map_err(|_| ())
    }

    /// `exec` with the path and argv array living in user memory, as the
    /// syscall boundary sees them: a pointer to a NUL-terminated path and
    /// a NULL-terminated vector of string pointers.
    pub fn sys_exec_user(&self, path_va: usize, argv_va: usize) -> Result<(), ()> {
        let path = self.fetch_str(path_va, MAXPATH)?;
        let mut args = Vec::new();
        loop {
            if args.len() > MAXARG {
                return Err(());
            }
            let p = self.fetch_usize(argv_va + args.len() * core::mem::size_of::<usize>())?;
            if p == 0 {
                break;
            }
            args.push(self.fetch_str(p, MAXPATH)?);
        }
        let refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.exec(&path, &refs)
    }
}
