//! # Two-Level Page Tables
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! A [`PageDirectory`](pd::PageDirectory) holds 1024 [`PdEntry`](pd::PdEntry)
//! values, each pointing at a [`PageTable`](pt::PageTable) of 1024
//! [`PtEntry`](pt::PtEntry) values that map 4 KiB pages. One directory entry
//! therefore spans 4 MiB of virtual space.

pub mod pd;
pub mod pt;

use kernel_memory_addresses::VirtualAddress;

use crate::page_table::pd::DirIndex;
use crate::page_table::pt::TableIndex;

/// Entries per directory and per table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Virtual span covered by one directory entry (4 MiB).
pub const TABLE_SPAN: u32 = 4 * 1024 * 1024;

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (DirIndex, TableIndex) {
    (DirIndex::from(va), TableIndex::from(va))
}

/// First virtual address mapped by directory slot `index`.
#[inline]
#[must_use]
pub const fn directory_slot_base(index: DirIndex) -> VirtualAddress {
    VirtualAddress::new((index.as_usize() as u32) << 22)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_ok() {
        let va = VirtualAddress::new(0xC03F_F123);
        let (d, t) = split_indices(va);
        assert_eq!(d.as_usize(), 0x300);
        assert_eq!(t.as_usize(), 0x3FF);
        assert_eq!(directory_slot_base(d), VirtualAddress::new(0xC000_0000));
    }
}
