//! # Virtual Memory Support
//!
//! i386 two-level paging structures and the seams the memory core is built on.
//!
//! ## What you get
//! - [`PageEntryBits`]: the 32-bit entry format shared by PDEs and PTEs.
//! - [`PageDirectory`] / [`PageTable`] with typed [`DirIndex`] / [`TableIndex`].
//! - [`FrameAlloc`]: where page-table frames come from.
//! - [`Mmu`]: control registers, TLB maintenance and memory access.
//! - `BareMetalMmu` (x86 targets only): the real processor.
//!
//! ## Virtual Address → Physical Address Walk
//!
//! ```text
//!  CR3 → PD[va >> 22] → PT[(va >> 12) & 0x3FF] → frame | (va & 0xFFF)
//! ```
//!
//! | Level | Table name | Entry name | Description |
//! |:------|:------------|:-----------|:-------------|
//! | 1 | **PD** (Page Directory) | **PDE** | Referenced by CR3; each entry covers 4 MiB and points to a PT. |
//! | 2 | **PT** (Page Table) | **PTE** | Each entry maps a 4 KiB physical page. |
//!
//! The `US` and `RW` bits are checked at both levels; the effective
//! permission is the intersection.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

#[cfg(target_arch = "x86")]
mod bare_metal;
mod mmu;
mod page_entry_bits;
pub mod page_table;

use kernel_memory_addresses::{PhysicalPage, Size4K};

#[cfg(target_arch = "x86")]
pub use crate::bare_metal::BareMetalMmu;
pub use crate::mmu::Mmu;
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::pd::{DirIndex, PageDirectory, PdEntry, PdEntryKind};
pub use crate::page_table::pt::{PageTable, PtEntry, TableIndex};
pub use crate::page_table::{ENTRIES_PER_TABLE, TABLE_SPAN, directory_slot_base, split_indices};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Minimal frame allocator used to obtain **physical** 4 KiB frames
/// for page tables and mapped pages.
///
/// The implementation decides where frames come from (early bump region,
/// bitmap, ...). Returns `None` on out-of-memory.
pub trait FrameAlloc {
    /// Allocate one 4 KiB *physical* frame.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k) that was never
    /// put to use. Allocators without a free path ignore it.
    fn free_4k(&mut self, _frame: PhysicalPage<Size4K>) {}
}

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(0x12345, 16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two. Operands are widened to `u64`, so
/// any 32-bit address plus a 32-bit alignment cannot overflow.
///
/// ```rust
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// assert_eq!(align_up(0xFFFF_FFFF, 4096), 0x1_0000_0000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingAlloc {
        next: u32,
        end: u32,
    }

    impl FrameAlloc for CountingAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
            if self.next >= self.end {
                return None;
            }
            let page = PhysicalPage::from_frame_number(self.next);
            self.next += 1;
            Some(page)
        }
    }

    #[test]
    fn frame_alloc_yields_aligned_frames_until_exhausted() {
        let mut alloc = CountingAlloc { next: 0x100, end: 0x102 };
        let a = alloc.alloc_4k().expect("first");
        let b = alloc.alloc_4k().expect("second");
        assert!(a.base().is_aligned::<Size4K>());
        assert_eq!(b.base().as_u32() - a.base().as_u32(), 4096);
        assert!(alloc.alloc_4k().is_none());
    }

    #[test]
    fn align_helpers() {
        assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0, 0x1000), 0);
    }
}
