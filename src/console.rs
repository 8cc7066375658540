//! Console device, wired through devsw entry `CONSOLE`.
//!
//! Input arrives from the host through `Console::put_input` and is parked
//! in a ring; readers sleep until a line (or any bytes, here) shows up.
//! Output accumulates in a host-visible buffer. Kernel diagnostics go
//! through the spin-locked `Printer` via `kprintln!`.

use core::fmt::{self, Write};

use crate::kernel::Kernel;
use crate::lock::{SleepableLock, SpinLock};
use crate::proc::KernelCtx;

const INPUT_BUF: usize = 128;

struct ConsInput {
    buf: [u8; INPUT_BUF],
    /// Read index.
    r: usize,
    /// Write index.
    w: usize,
}

pub struct Console {
    input: SleepableLock<ConsInput>,
    output: SpinLock<Vec<u8>>,
}

impl Console {
    pub(crate) fn new() -> Self {
        Self {
            input: SleepableLock::new("cons", ConsInput {
                buf: [0; INPUT_BUF],
                r: 0,
                w: 0,
            }),
            output: SpinLock::new("consout", Vec::new()),
        }
    }

    /// Feed bytes to the console, as a UART interrupt handler would, and
    /// wake any sleeping reader.
    pub fn put_input(&self, kernel: &Kernel, bytes: &[u8]) {
        let mut input = self.input.lock();
        for &b in bytes {
            if input.w - input.r < INPUT_BUF {
                let w = input.w;
                input.buf[w % INPUT_BUF] = b;
                input.w += 1;
            }
        }
        input.wakeup(kernel);
    }

    pub(crate) fn read(&self, ctx: &KernelCtx<'_>, dst: &mut [u8]) -> Result<usize, ()> {
        let mut input = self.input.lock();
        while input.r == input.w {
            if ctx.killed() {
                return Err(());
            }
            input.sleep(ctx);
        }
        let mut n = 0;
        while n < dst.len() && input.r < input.w {
            let r = input.r;
            dst[n] = input.buf[r % INPUT_BUF];
            input.r += 1;
            n += 1;
        }
        Ok(n)
    }

    pub(crate) fn write(&self, _ctx: &KernelCtx<'_>, src: &[u8]) -> Result<usize, ()> {
        self.output.lock().extend_from_slice(src);
        Ok(src.len())
    }

    /// Drain everything written to the console so far.
    pub fn take_output(&self) -> Vec<u8> {
        core::mem::take(&mut *self.output.lock())
    }
}

/// Device-switch entry points.
pub(crate) fn consoleread(ctx: &KernelCtx<'_>, dst: &mut [u8]) -> Result<usize, ()> {
    ctx.kernel().console().read(ctx, dst)
}

pub(crate) fn consolewrite(ctx: &KernelCtx<'_>, src: &[u8]) -> Result<usize, ()> {
    ctx.kernel().console().write(ctx, src)
}

/// Serializes kernel diagnostics.
pub struct Printer;

static PRINTER: SpinLock<Printer> = SpinLock::new("pr", Printer);

impl Printer {
    fn print(&mut self, args: fmt::Arguments<'_>) {
        struct Stderr;
        impl Write for Stderr {
            fn write_str(&mut self, s: &str) -> fmt::Result {
                eprint!("{}", s);
                Ok(())
            }
        }
        let _ = Stderr.write_fmt(args);
        eprintln!();
    }
}

#[doc(hidden)]
pub fn _kprint(args: fmt::Arguments<'_>) {
    PRINTER.lock().print(args);
}

/// Kernel console diagnostics, serialized through the printer lock.
#[macro_export]
macro_rules! kprintln {
    ($($arg:tt)*) => {
        $crate::console::_kprint(format_args!($($arg)*))
    };
}
