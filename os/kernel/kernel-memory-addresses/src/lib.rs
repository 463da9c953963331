//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for 32-bit memory addresses and page bases used by
//! the paging and memory management code.
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 32-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//! | [`MemoryAddressOffset<S>`] | [`S: PageSize`](PageSize) | An offset within a page of size `S`. |
//!
//! These are then wrapped to distinguish between virtual and physical spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical memory or MMIO regions. |
//!
//! ## Page Sizes
//!
//! Classic (non-PAE) i386 paging knows two granularities:
//!
//! - [`Size4K`]: 4 KiB pages, the unit of every mapping made here
//! - [`Size4M`]: the 4 MiB span covered by one page-directory entry
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xD000_1234);
//! assert_eq!(va.page::<Size4K>().base().as_u32(), 0xD000_1000);
//! assert_eq!(va.offset::<Size4K>().as_u32(), 0x234);
//! assert_eq!(va.align_down::<Size4M>().as_u32(), 0xD000_0000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod memory_address;
mod memory_address_offset;
mod memory_page;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use memory_address::MemoryAddress;
pub use memory_address_offset::MemoryAddressOffset;
pub use memory_page::MemoryPage;
pub use page_size::{PageSize, Size4K, Size4M};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_plus_offset_rebuilds_the_address() {
        let pa = PhysicalAddress::new(0x1234_5678);
        let frame = pa.page::<Size4K>();
        assert_eq!(frame.base().as_u32(), 0x1234_5000);
        assert_eq!(pa.offset::<Size4K>().as_u32(), 0x678);
        assert_eq!(frame.join(pa.offset::<Size4K>()), pa);
    }

    #[test]
    fn large_page_offsets() {
        let va = VirtualAddress::new(0xC04A_BCDE);
        assert_eq!(va.page::<Size4M>().base().as_u32(), 0xC040_0000);
        assert_eq!(va.offset::<Size4M>().as_u32(), 0x000A_BCDE);
    }

    #[test]
    fn align_up_saturates_at_top() {
        let a = MemoryAddress::new(0x1001);
        assert_eq!(a.align_up::<Size4K>(), Some(MemoryAddress::new(0x2000)));
        assert_eq!(MemoryAddress::new(0x2000).align_up::<Size4K>(), Some(MemoryAddress::new(0x2000)));
        assert_eq!(MemoryAddress::new(0xFFFF_F001).align_up::<Size4K>(), None);
    }

    #[test]
    fn directory_and_table_indices() {
        let scratch = VirtualAddress::new(0xFFC0_0000);
        assert_eq!(scratch.directory_index(), 1023);
        assert_eq!(scratch.table_index(), 0);

        let va = VirtualAddress::new(0x0040_3000);
        assert_eq!(va.directory_index(), 1);
        assert_eq!(va.table_index(), 3);
    }

    #[test]
    fn frame_numbers() {
        let pp = PhysicalAddress::new(0x0010_0FFF).page::<Size4K>();
        assert_eq!(pp.frame_number(), 0x100);
        assert_eq!(PhysicalPage::<Size4K>::from_frame_number(0x100), pp);
    }

    #[test]
    fn aligned_conversions() {
        assert!(PhysicalPage::<Size4K>::try_from(PhysicalAddress::new(0x3000)).is_ok());
        assert_eq!(
            PhysicalPage::<Size4K>::try_from(PhysicalAddress::new(0x3004)),
            Err(PhysicalAddress::new(0x3004))
        );
        assert!(VirtualPage::<Size4K>::try_from(VirtualAddress::new(0xD000_0000)).is_ok());
    }

    #[test]
    fn next_page_stops_at_top() {
        let last = VirtualAddress::new(0xFFFF_F000).page::<Size4K>();
        assert_eq!(last.checked_next(), None);
        let p = VirtualAddress::new(0x1000).page::<Size4K>();
        assert_eq!(p.checked_next().map(VirtualPage::base), Some(VirtualAddress::new(0x2000)));
    }
}
