//! # i386 Page Directory
//!
//! - [`DirIndex`]: index type for VA bits `[31:22]`.
//! - [`PdEntry`]: a PD entry (PDE). Only table-pointing entries (`PS=0`) are
//!   created here; a large-page PDE is reported but never followed.
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 PDEs, referenced by CR3.

use core::ops::Range;

use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

use crate::PageEntryBits;
use crate::page_table::ENTRIES_PER_TABLE;

/// Index into the Page Directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DirIndex(u16);

/// A single Page Directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

/// What a PDE refers to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PdEntryKind {
    /// Not present.
    Absent,
    /// Points to a page table.
    Table(PhysicalPage<Size4K>, PageEntryBits),
    /// A 4 MiB leaf (`PS=1`).
    Large(PageEntryBits),
}

/// The Page Directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageDirectory>() == 4096);

impl DirIndex {
    /// Build an index from a virtual address (extracts bits `[31:22]`).
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(va.directory_index())
    }

    /// Construct from a raw `u16`.
    ///
    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 1024);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl PdEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn kind(self) -> PdEntryKind {
        if !self.0.present() {
            PdEntryKind::Absent
        } else if self.0.large_page() {
            PdEntryKind::Large(self.0)
        } else {
            PdEntryKind::Table(PhysicalPage::from_addr(self.0.physical_address()), self.0)
        }
    }

    /// The page table this entry points at, if it points at one.
    #[inline]
    #[must_use]
    pub const fn table(self) -> Option<PhysicalPage<Size4K>> {
        match self.kind() {
            PdEntryKind::Table(page, _) => Some(page),
            _ => None,
        }
    }

    /// Create a non-leaf PDE pointing at a page table (`PS=0`, `present=1`).
    #[inline]
    #[must_use]
    pub const fn make_table(table: PhysicalPage<Size4K>, mut flags: PageEntryBits) -> Self {
        flags.set_large_page(false);
        flags.set_present(true);
        flags.set_physical_address(table.base());
        Self(flags)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(v: u32) -> Self {
        Self(PageEntryBits::from_bits(v))
    }
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: DirIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: DirIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    #[must_use]
    pub const fn index_of(va: VirtualAddress) -> DirIndex {
        DirIndex::from(va)
    }

    pub fn clear(&mut self) {
        self.entries.fill(PdEntry::zero());
    }

    /// Copies the slots in `range` verbatim from `source`. The copied entries
    /// keep pointing at the same page tables.
    pub fn share_slots_from(&mut self, source: &Self, range: Range<usize>) {
        self.entries[range.clone()].copy_from_slice(&source.entries[range]);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn pde_points_to_table() {
        let pt = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x0040_1000));
        let e = PdEntry::make_table(pt, PageEntryBits::new_kernel_rw().with_large_page(true));
        assert_eq!(e.table(), Some(pt));
        assert!(matches!(e.kind(), PdEntryKind::Table(_, f) if f.writable() && !f.large_page()));
    }

    #[test]
    fn large_pde_is_not_followed() {
        let e = PdEntry::from_raw(0x0040_0083);
        assert!(matches!(e.kind(), PdEntryKind::Large(_)));
        assert_eq!(e.table(), None);
    }

    #[test]
    fn shared_slots_alias_the_same_tables() {
        let mut kernel = PageDirectory::zeroed();
        let pt = PhysicalPage::<Size4K>::from_frame_number(0x123);
        kernel.set(DirIndex::new(0x300), PdEntry::make_table(pt, PageEntryBits::new_kernel_rw()));
        kernel.set(DirIndex::new(0x001), PdEntry::make_table(pt, PageEntryBits::new_kernel_rw()));

        let mut user = PageDirectory::zeroed();
        user.share_slots_from(&kernel, 0x300..1024);
        assert_eq!(user.get(DirIndex::new(0x300)), kernel.get(DirIndex::new(0x300)));
        assert!(!user.get(DirIndex::new(0x001)).is_present());
    }
}
