//! # QEMU Debug Console
//!
//! Kernel log output through QEMU's debug port (`0x402`), visible on the host
//! with `-debugcon stdio` or `-debugcon file:debug.log`.
//!
//! * [`QemuLogger`]: a `log::Log` backend, so the memory core's `info!`,
//!   `warn!` and friends end up on the console once it is installed.
//! * [`qemu_trace!`]: raw formatted output that bypasses `log`, for the
//!   moments before a logger exists.
//! * [`format_record`]: the `[LEVEL] target: message` line format, shared
//!   with host-side log capture in tests.
//!
//! With the `enabled` feature off (or on a non-x86 host) every write is a
//! no-op.
//!
//! ```rust,ignore
//! use kernel_qemu::QemuLogger;
//! use log::LevelFilter;
//!
//! static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);
//! LOGGER.install().ok();
//! log::info!("paging enabled");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

use core::fmt;

pub use logger::QemuLogger;

/// Writes `record` as a single `[LEVEL] target: message` line.
///
/// # Errors
/// Whatever `out` reports.
pub fn format_record(out: &mut impl fmt::Write, record: &log::Record) -> fmt::Result {
    writeln!(out, "[{}] {}: {}", record.level(), record.target(), record.args())
}

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// The port number for QEMU's debug port.
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    const QEMU_DEBUG_PORT: u16 = 0x402;

    /// Write a single byte to QEMU's debug port.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        unsafe {
            outb(QEMU_DEBUG_PORT, c);
        }
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
        let _ = c;
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    #[allow(clippy::inline_always)]
    #[inline(always)]
    unsafe fn outb(port: u16, val: u8) {
        unsafe {
            core::arch::asm!(
            "out dx, al",
            in("dx") port,
            in("al") val,
            options(nomem, nostack, preserves_flags)
            );
        }
    }

    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                dbg_putc(b);
            }
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best effort; the port cannot report failure.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, _s: &str) -> fmt::Result {
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub const fn qemu_write(_: fmt::Arguments) {}
}

/// Formatted output straight to the debug port, without `log`.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{Level, Record};

    #[test]
    fn records_are_one_line() {
        let mut out = String::new();
        format_record(
            &mut out,
            &Record::builder()
                .level(Level::Warn)
                .target("kernel_alloc::heap")
                .args(format_args!("{} is not the start of a live block", 0xD000_0040u32))
                .build(),
        )
        .unwrap();
        assert_eq!(out, "[WARN] kernel_alloc::heap: 3489660992 is not the start of a live block\n");
    }
}
