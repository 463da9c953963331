//! # Simulated i386 Machine
//!
//! Host-side stand-in for the processor the memory core runs on, for tests.
//!
//! * [`SimulatedMachine`] implements [`kernel_vmem::Mmu`] over a page-aligned
//!   buffer of "physical" RAM. With CR0.PG set every access goes through a
//!   software two-level page walk and a TLB that only `invalidate_page` or a
//!   CR3 load flush, so a forgotten `invlpg` shows up as a stale read.
//! * [`E820Builder`] produces the firmware table blob the loader would hand
//!   over.
//! * [`LogCapture`] collects `log` output per test thread, formatted the way
//!   the QEMU debug-port logger prints it.

#![allow(unsafe_code)]

mod e820;
mod logging;
mod machine;

pub use e820::{E820Builder, kind};
pub use logging::LogCapture;
pub use machine::{MmuStats, SimulatedMachine};
