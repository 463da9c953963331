//! # Scratch Mapping
//!
//! A single virtual page near the top of the address space whose page-table
//! entry is repointed on demand. Once paging is on this is the only way to
//! touch a physical frame that has no permanent mapping, such as a freshly
//! allocated page table.
//!
//! The slot is single-occupancy. Mapping a new frame while another is still
//! exposed replaces it (last writer wins) and logs a warning; any reference
//! obtained through the earlier mapping now reads the new frame. Internal
//! users go through [`ScratchMapper::with_page`], which maps, runs a closure
//! and unmaps, so they cannot nest.
//!
//! The scratch page table itself comes from the early bump region and is
//! reached through the identity window.

use crate::bootmem::{BumpError, EarlyBumpAllocator};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{DirIndex, Mmu, PageDirectory, PageEntryBits, PageTable, PdEntry, PtEntry, TableIndex};
use log::{trace, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ScratchError {
    #[error("scratch page table at {0} is outside the identity window")]
    TableOutsideIdentityWindow(PhysicalAddress),
    #[error("scratch page table allocation failed: {0}")]
    Bump(#[from] BumpError),
}

/// The one-page window onto arbitrary physical frames.
#[derive(Debug)]
pub struct ScratchMapper {
    va: VirtualAddress,
    table: PhysicalPage<Size4K>,
    current: Option<PhysicalPage<Size4K>>,
    overwrites: usize,
}

impl ScratchMapper {
    /// Allocates the scratch page table and hooks it into `kernel_directory`.
    ///
    /// # Safety
    /// `kernel_directory` must be a valid directory reachable at its physical
    /// address, and everything below `identity_limit` must be reachable at its
    /// physical address through `mmu` (paging off, or identity-mapped).
    ///
    /// # Errors
    /// The bump allocator is exhausted or returns a table above `identity_limit`.
    pub unsafe fn init<M: Mmu>(
        mmu: &mut M,
        kernel_directory: PhysicalPage<Size4K>,
        bump: &mut EarlyBumpAllocator,
        va: VirtualAddress,
        identity_limit: u32,
    ) -> Result<Self, ScratchError> {
        let table = bump.alloc_page()?;
        if table.base().as_u64() + 4096 > u64::from(identity_limit) {
            return Err(ScratchError::TableOutsideIdentityWindow(table.base()));
        }

        unsafe {
            identity::<PageTable, M>(mmu, table).clear();
            let pd = identity::<PageDirectory, M>(mmu, kernel_directory);
            pd.set(
                DirIndex::from(va),
                PdEntry::make_table(table, PageEntryBits::new_kernel_rw()),
            );
        }

        Ok(Self {
            va: va.align_down::<Size4K>(),
            table,
            current: None,
            overwrites: 0,
        })
    }

    /// Exposes the frame containing `pa` at the scratch address and returns
    /// that address.
    ///
    /// Replaces any frame still mapped; see the module documentation.
    pub fn map<M: Mmu>(&mut self, mmu: &mut M, pa: PhysicalAddress) -> VirtualAddress {
        let frame = PhysicalPage::<Size4K>::from_addr(pa);
        if let Some(previous) = self.current
            && previous != frame
        {
            self.overwrites += 1;
            warn!("scratch slot still held {previous}, now replaced by {frame}");
        }

        let entry = PtEntry::make_4k(frame, PageEntryBits::new_kernel_rw());
        unsafe { identity::<PageTable, M>(mmu, self.table) }.set(TableIndex::from(self.va), entry);
        mmu.invalidate_page(self.va);
        self.current = Some(frame);
        trace!("scratch -> {frame}");
        self.va
    }

    /// Clears the scratch entry and drops its translation.
    pub fn unmap<M: Mmu>(&mut self, mmu: &mut M) {
        unsafe { identity::<PageTable, M>(mmu, self.table) }
            .set(TableIndex::from(self.va), PtEntry::zero());
        mmu.invalidate_page(self.va);
        self.current = None;
    }

    /// Maps `frame`, hands its contents to `f` as a `T`, and unmaps again.
    ///
    /// `T` must fit in one page and every bit pattern must be a valid `T`
    /// (page tables, directories, byte arrays).
    ///
    /// Only meaningful while paging is enabled.
    pub fn with_page<M, T, R>(
        &mut self,
        mmu: &mut M,
        frame: PhysicalPage<Size4K>,
        f: impl FnOnce(&mut T) -> R,
    ) -> R
    where
        M: Mmu,
    {
        const { assert!(size_of::<T>() <= 4096) };
        let va = self.map(mmu, frame.base());
        let result = f(unsafe { mmu.view_mut::<T>(va) });
        self.unmap(mmu);
        result
    }

    #[must_use]
    pub const fn virtual_address(&self) -> VirtualAddress {
        self.va
    }

    /// The physical page of the scratch page table.
    #[must_use]
    pub const fn table(&self) -> PhysicalPage<Size4K> {
        self.table
    }

    /// The frame currently exposed, if any.
    #[must_use]
    pub const fn current(&self) -> Option<PhysicalPage<Size4K>> {
        self.current
    }

    /// How many times a live mapping was replaced without an unmap.
    #[must_use]
    pub const fn overwrite_count(&self) -> usize {
        self.overwrites
    }
}

/// Views a low frame through its identity address.
///
/// # Safety
/// `frame` must lie inside the identity window and hold a valid `T`.
pub(crate) unsafe fn identity<'a, T, M: Mmu>(mmu: &mut M, frame: PhysicalPage<Size4K>) -> &'a mut T {
    unsafe { mmu.view_mut::<T>(VirtualAddress::new(frame.base().as_u32())) }
}
