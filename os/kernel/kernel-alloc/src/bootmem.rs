//! # Early Bump Allocator
//!
//! Hands out physical memory from a fixed window placed right after the kernel
//! image, before anything else can allocate. The frame bitmap, the bootstrap
//! page directory and tables, and the scratch page table all come from here.
//!
//! Allocation only ever advances a cursor. There is no per-block free; once
//! the frame allocator has taken over, boot marks `[kernel start, current_end)`
//! as used and [freezes](EarlyBumpAllocator::freeze) this allocator.

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{FrameAlloc, Mmu, align_down, align_up};
use log::{debug, warn};

/// Highest page-aligned physical address the allocator can describe.
const PHYS_LIMIT: u64 = 0x1_0000_0000;
const PAGE: u64 = 4096;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BumpError {
    #[error("early allocator used before init")]
    Uninitialized,
    #[error("early allocator is frozen; allocate from the frame allocator instead")]
    Frozen,
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(u32),
    #[error("zero-sized early allocation")]
    ZeroSize,
    #[error("early region [{start:#x}, {end:#x}) is empty after page alignment")]
    EmptyRegion { start: u64, end: u64 },
    #[error("early region exhausted: {requested} bytes requested, {remaining} remaining")]
    OutOfMemory { requested: u64, remaining: u64 },
    #[error("early allocation size overflows")]
    Overflow,
}

/// Linear allocator over `[region_start, region_max)`.
#[derive(Debug)]
pub struct EarlyBumpAllocator {
    region_start: u64,
    region_max: u64,
    cursor: u64,
    initialized: bool,
    frozen: bool,
}

impl EarlyBumpAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            region_start: 0,
            region_max: 0,
            cursor: 0,
            initialized: false,
            frozen: false,
        }
    }

    /// Sets the window to `[align_up(start), align_down(start + size))`.
    ///
    /// # Errors
    /// The aligned window is empty; the allocator stays uninitialized.
    pub fn init(&mut self, start: PhysicalAddress, size: u32) -> Result<(), BumpError> {
        let begin = align_up(start.as_u64(), PAGE);
        let end = align_down((start.as_u64() + u64::from(size)).min(PHYS_LIMIT), PAGE);
        if begin >= end {
            *self = Self::new();
            return Err(BumpError::EmptyRegion { start: begin, end });
        }

        self.region_start = begin;
        self.region_max = end;
        self.cursor = begin;
        self.initialized = true;
        self.frozen = false;
        debug!("early allocator: [{begin:#010x}, {end:#010x})");
        Ok(())
    }

    /// Returns `size` bytes aligned to `align`.
    ///
    /// A failed call leaves the cursor where it was.
    ///
    /// # Errors
    /// Not initialized or frozen, a zero size, a non-power-of-two alignment,
    /// or not enough room left in the window.
    pub fn alloc(&mut self, size: u32, align: u32) -> Result<PhysicalAddress, BumpError> {
        if !self.initialized {
            return Err(BumpError::Uninitialized);
        }
        if self.frozen {
            return Err(BumpError::Frozen);
        }
        if !align.is_power_of_two() {
            return Err(BumpError::InvalidAlignment(align));
        }
        if size == 0 {
            return Err(BumpError::ZeroSize);
        }

        let start = align_up(self.cursor, u64::from(align));
        let end = start + u64::from(size);
        if end > self.region_max {
            return Err(BumpError::OutOfMemory {
                requested: u64::from(size),
                remaining: self.remaining(),
            });
        }

        self.cursor = end;
        #[allow(clippy::cast_possible_truncation)]
        let start = PhysicalAddress::new(start as u32);
        Ok(start)
    }

    /// One zeroed-by-caller, page-aligned 4 KiB frame.
    ///
    /// # Errors
    /// See [`EarlyBumpAllocator::alloc`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn alloc_page(&mut self) -> Result<PhysicalPage<Size4K>, BumpError> {
        self.alloc(PAGE as u32, PAGE as u32).map(PhysicalPage::from_addr)
    }

    /// Allocates `count * size` bytes and zero-fills them.
    ///
    /// # Safety
    /// Paging must still be off (or the result identity-mapped), since the
    /// memory is written through `mmu` at its physical address.
    ///
    /// # Errors
    /// See [`EarlyBumpAllocator::alloc`]; the product must fit in 32 bits.
    pub unsafe fn calloc<M: Mmu>(
        &mut self,
        mmu: &mut M,
        count: u32,
        size: u32,
        align: u32,
    ) -> Result<PhysicalAddress, BumpError> {
        let total = count.checked_mul(size).ok_or(BumpError::Overflow)?;
        let pa = self.alloc(total, align)?;
        unsafe { mmu.fill_bytes(VirtualAddress::new(pa.as_u32()), 0, total as usize) };
        Ok(pa)
    }

    /// Early allocations are never returned individually.
    pub const fn free(&mut self, _pa: PhysicalAddress) {}

    /// Rewinds to the start of the window.
    ///
    /// Only valid while nothing handed out so far is still referenced.
    ///
    /// # Errors
    /// The allocator is frozen.
    pub fn reset(&mut self) -> Result<(), BumpError> {
        if self.frozen {
            return Err(BumpError::Frozen);
        }
        self.cursor = self.region_start;
        Ok(())
    }

    /// Rejects every later allocation. Called once the frame allocator owns
    /// physical memory.
    pub fn freeze(&mut self) {
        if !self.frozen {
            debug!(
                "early allocator frozen after {} KiB",
                self.used().div_ceil(1024)
            );
        }
        self.frozen = true;
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    #[must_use]
    pub const fn region_start(&self) -> u64 {
        self.region_start
    }

    /// First byte past the last allocation.
    #[must_use]
    pub const fn current_end(&self) -> u64 {
        self.cursor
    }

    #[must_use]
    pub const fn used(&self) -> u64 {
        self.cursor - self.region_start
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.region_max - self.region_start
    }

    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.region_max - self.cursor
    }
}

impl Default for EarlyBumpAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAlloc for EarlyBumpAllocator {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        match self.alloc_page() {
            Ok(page) => Some(page),
            Err(e) => {
                warn!("early frame allocation failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> EarlyBumpAllocator {
        let mut bump = EarlyBumpAllocator::new();
        bump.init(PhysicalAddress::new(0x0020_0123), 0x10_0000).unwrap();
        bump
    }

    #[test]
    fn init_aligns_the_window_inwards() {
        let bump = window();
        assert_eq!(bump.region_start(), 0x0020_1000);
        assert_eq!(bump.current_end(), 0x0020_1000);
        assert_eq!(bump.total(), 0x0030_0000 - 0x0020_1000);
    }

    #[test]
    fn empty_window_is_rejected() {
        let mut bump = EarlyBumpAllocator::new();
        let err = bump.init(PhysicalAddress::new(0x1001), 0x800).unwrap_err();
        assert!(matches!(err, BumpError::EmptyRegion { .. }));
        assert!(!bump.is_initialized());
        assert_eq!(bump.alloc(16, 16), Err(BumpError::Uninitialized));
    }

    #[test]
    fn allocations_are_monotonic_and_aligned() {
        let mut bump = window();
        let mut prev_end = 0u64;
        for (size, align) in [(1, 1), (24, 8), (4096, 4096), (3, 64), (100, 2), (8192, 4096)] {
            let pa = bump.alloc(size, align).unwrap();
            assert!(pa.as_u64() >= prev_end);
            assert_eq!(pa.as_u32() % align, 0);
            prev_end = pa.as_u64() + u64::from(size);
            assert_eq!(bump.current_end(), prev_end);
        }
    }

    #[test]
    fn exhaustion_leaves_cursor_unchanged() {
        let mut bump = window();
        bump.alloc(0x1000, 0x1000).unwrap();
        let before = bump.current_end();
        let err = bump.alloc(0x20_0000, 16).unwrap_err();
        assert_eq!(
            err,
            BumpError::OutOfMemory {
                requested: 0x20_0000,
                remaining: bump.remaining()
            }
        );
        assert_eq!(bump.current_end(), before);
    }

    #[test]
    fn rejects_bad_arguments() {
        let mut bump = window();
        assert_eq!(bump.alloc(16, 3), Err(BumpError::InvalidAlignment(3)));
        assert_eq!(bump.alloc(16, 0), Err(BumpError::InvalidAlignment(0)));
        assert_eq!(bump.alloc(0, 16), Err(BumpError::ZeroSize));
    }

    #[test]
    fn freeze_and_reset() {
        let mut bump = window();
        bump.alloc(64, 16).unwrap();
        bump.reset().unwrap();
        assert_eq!(bump.used(), 0);
        bump.alloc(64, 16).unwrap();
        bump.freeze();
        assert_eq!(bump.alloc(64, 16), Err(BumpError::Frozen));
        assert_eq!(bump.reset(), Err(BumpError::Frozen));
        assert!(bump.alloc_4k().is_none());
        assert_eq!(bump.used(), 64);
    }

    #[test]
    fn frames_are_page_aligned() {
        let mut bump = window();
        bump.alloc(5, 1).unwrap();
        let frame = bump.alloc_4k().unwrap();
        assert_eq!(frame.base().as_u32(), 0x0020_2000);
    }
}
