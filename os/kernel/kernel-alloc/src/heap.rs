//! # Kernel Heap
//!
//! A first-fit allocator over a fixed virtual region, tracked in 16-byte
//! units:
//!
//! ```text
//! region_start                                                   region_end
//! | bitmap (1 bit/unit) | lengths (u32/unit) | data ........ data_end ... data_max |
//!                                            ^ data_start
//! ```
//!
//! A unit's bit is set iff it belongs to a live block. The length table holds
//! each block's size in units at the block's first unit and zero everywhere
//! else, so `free` needs nothing but the pointer.
//!
//! Only `[region_start, data_end)` is backed by memory. When a request does not
//! fit, the heap grows `data_end` towards `data_max` page by page through its
//! [`HeapBackend`].
//!
//! The heap never dereferences its own addresses; every load and store goes
//! through the backend, which is what lets the same code run against the
//! paging layer and against a flat buffer in tests.

use kernel_info::memory::{HEAP_ALIGNMENT, HEAP_UNIT};
use kernel_memory_addresses::{Size4K, VirtualAddress, VirtualPage};
use kernel_vmem::{align_down, align_up};
use log::{debug, info, warn};

use crate::vmm::VmmError;

pub const UNIT: u32 = HEAP_UNIT;
const PAGE: u32 = 4096;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("heap exhausted: {requested} bytes cannot be satisfied below the heap maximum")]
    OutOfMemory { requested: usize },
    #[error("invalid heap request: {0}")]
    InvalidArgument(&'static str),
    #[error("allocation size overflows")]
    Overflow,
    #[error("{0} is outside the heap data area or not unit-aligned")]
    InvalidPointer(VirtualAddress),
    #[error("{0} is not the start of a live heap block")]
    Corruption(VirtualAddress),
    #[error("heap region is too small to hold its own metadata")]
    RegionTooSmall,
    #[error("no physical frame left to back the heap")]
    OutOfFrames,
    #[error("failed to map heap page: {0}")]
    Backing(#[from] VmmError),
}

/// Memory the heap lives in.
///
/// The heap guarantees it only touches `[region_start, data_end)` and only
/// after the pages have been backed, which is the contract implementations
/// rely on for their `unsafe` accessors.
pub trait HeapBackend {
    /// # Safety
    /// `va..va + dst.len()` is backed heap memory.
    unsafe fn read(&mut self, va: VirtualAddress, dst: &mut [u8]);

    /// # Safety
    /// `va..va + src.len()` is backed heap memory.
    unsafe fn write(&mut self, va: VirtualAddress, src: &[u8]);

    /// # Safety
    /// `va..va + len` is backed heap memory.
    unsafe fn fill(&mut self, va: VirtualAddress, value: u8, len: usize);

    /// # Safety
    /// Both ranges are backed heap memory and do not overlap.
    unsafe fn copy(&mut self, dst: VirtualAddress, src: VirtualAddress, len: usize);

    /// Maps a fresh zeroed frame at `page`.
    ///
    /// # Errors
    /// No frame is available or the mapping cannot be installed. Nothing is
    /// left allocated on failure.
    fn back_page(&mut self, page: VirtualPage<Size4K>) -> Result<(), HeapError>;

    /// # Safety
    /// See [`HeapBackend::read`].
    unsafe fn read_u32(&mut self, va: VirtualAddress) -> u32 {
        let mut buf = [0u8; 4];
        unsafe { self.read(va, &mut buf) };
        u32::from_le_bytes(buf)
    }

    /// # Safety
    /// See [`HeapBackend::write`].
    unsafe fn write_u32(&mut self, va: VirtualAddress, value: u32) {
        unsafe { self.write(va, &value.to_le_bytes()) };
    }
}

/// Where the heap's tables and data sit inside its region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HeapLayout {
    /// Unit-aligned start of the region; the bitmap begins here.
    pub region_start: VirtualAddress,
    pub region_end: u64,
    pub lengths: VirtualAddress,
    pub data_start: VirtualAddress,
    /// Units the tables can describe.
    pub max_units: u32,
    /// Data bytes backed by `init`.
    pub initial_bytes: u32,
}

impl HeapLayout {
    /// Finds the largest unit count whose tables and data both fit in the
    /// region, halving from `region / UNIT` until they do.
    ///
    /// `initial_size` is rounded up to whole pages and clamped to the data
    /// maximum; zero means "everything".
    ///
    /// # Errors
    /// The region runs past the 4 GiB address space, or cannot hold a single
    /// unit plus its metadata.
    #[allow(clippy::cast_possible_truncation)]
    pub fn compute(
        region_start: VirtualAddress,
        region_size: u32,
        initial_size: u32,
    ) -> Result<Self, HeapError> {
        let unit = u64::from(UNIT);
        let start = align_up(region_start.as_u64(), unit);
        let end = region_start.as_u64() + u64::from(region_size);
        if end > 1 << 32 {
            return Err(HeapError::InvalidArgument("heap region runs past 4 GiB"));
        }
        if start >= end {
            return Err(HeapError::RegionTooSmall);
        }

        let region = end - start;
        let mut units = region / unit;
        loop {
            if units == 0 {
                return Err(HeapError::RegionTooSmall);
            }
            let meta = Self::metadata_bytes(units);
            if meta < region && (region - meta) / unit >= units {
                break;
            }
            units /= 2;
        }

        let bitmap_bytes = 4 * units.div_ceil(32);
        let max_bytes = units * unit;
        let initial = match align_up(u64::from(initial_size), u64::from(PAGE)) {
            0 => max_bytes,
            rounded => rounded.min(max_bytes),
        };

        Ok(Self {
            region_start: VirtualAddress::new(start as u32),
            region_end: end,
            lengths: VirtualAddress::new((start + bitmap_bytes) as u32),
            data_start: VirtualAddress::new((start + Self::metadata_bytes(units)) as u32),
            max_units: units as u32,
            initial_bytes: initial as u32,
        })
    }

    /// Bitmap plus length table for `units`, rounded up to a whole unit.
    #[must_use]
    pub const fn metadata_bytes(units: u64) -> u64 {
        align_up(4 * units.div_ceil(32) + 4 * units, UNIT as u64)
    }

    #[must_use]
    pub const fn bitmap(&self) -> VirtualAddress {
        self.region_start
    }

    #[must_use]
    pub const fn max_bytes(&self) -> u32 {
        self.max_units * UNIT
    }

    /// End of the data the tables can describe.
    #[must_use]
    pub const fn data_max(&self) -> u64 {
        self.data_start.as_u64() + self.max_bytes() as u64
    }

    /// First page boundary past the initially backed data.
    #[must_use]
    pub const fn initial_mapped_end(&self) -> u64 {
        align_up(
            self.data_start.as_u64() + self.initial_bytes as u64,
            PAGE as u64,
        )
    }
}

/// First-fit unit allocator; see the module documentation.
#[derive(Debug)]
pub struct KernelHeap {
    layout: HeapLayout,
    data_bytes: u32,
    mapped_end: u64,
    free_units: u32,
    corruptions: usize,
}

impl KernelHeap {
    /// Lays out the region, backs the metadata and the initial data pages,
    /// and clears the tables.
    ///
    /// # Errors
    /// The region is too small, or backing a page fails.
    pub fn init<B: HeapBackend>(
        backend: &mut B,
        region_start: VirtualAddress,
        region_size: u32,
        initial_size: u32,
    ) -> Result<Self, HeapError> {
        let layout = HeapLayout::compute(region_start, region_size, initial_size)?;
        Self::with_layout(backend, layout)
    }

    /// As [`KernelHeap::init`], for a precomputed layout.
    ///
    /// # Errors
    /// Backing a page fails.
    pub fn with_layout<B: HeapBackend>(
        backend: &mut B,
        layout: HeapLayout,
    ) -> Result<Self, HeapError> {
        let mut heap = Self {
            layout,
            data_bytes: 0,
            mapped_end: align_down(layout.region_start.as_u64(), u64::from(PAGE)),
            free_units: 0,
            corruptions: 0,
        };
        heap.back_until(backend, layout.initial_mapped_end())?;

        let metadata = layout.data_start.as_usize() - layout.region_start.as_usize();
        unsafe { backend.fill(layout.region_start, 0, metadata) };

        heap.data_bytes = layout.initial_bytes;
        heap.free_units = layout.initial_bytes / UNIT;
        info!(
            "heap: data at {} ({} KiB backed, {} KiB max, {} bytes of metadata)",
            layout.data_start,
            layout.initial_bytes / 1024,
            layout.max_bytes() / 1024,
            metadata
        );
        Ok(heap)
    }

    fn back_until<B: HeapBackend>(&mut self, backend: &mut B, end: u64) -> Result<(), HeapError> {
        while self.mapped_end < end {
            #[allow(clippy::cast_possible_truncation)]
            let page = VirtualPage::containing_address(VirtualAddress::new(self.mapped_end as u32));
            backend.back_page(page)?;
            self.mapped_end += u64::from(PAGE);
        }
        Ok(())
    }

    /// Grows the backed data by at least `bytes_needed`, in whole pages.
    ///
    /// Pages backed before a failure stay backed and are reused by the next
    /// attempt.
    ///
    /// # Errors
    /// The result would pass `data_max`, or backing a page fails.
    pub fn expand<B: HeapBackend>(&mut self, backend: &mut B, bytes_needed: u32) -> Result<(), HeapError> {
        let max = u64::from(self.layout.max_bytes());
        let required = u64::from(self.data_bytes) + u64::from(bytes_needed);
        if required > max {
            return Err(HeapError::OutOfMemory {
                requested: bytes_needed as usize,
            });
        }

        let new_bytes = align_up(required, u64::from(PAGE)).min(max);
        self.back_until(
            backend,
            align_up(self.layout.data_start.as_u64() + new_bytes, u64::from(PAGE)),
        )?;

        #[allow(clippy::cast_possible_truncation)]
        let new_bytes = new_bytes as u32;
        self.free_units += (new_bytes - self.data_bytes) / UNIT;
        self.data_bytes = new_bytes;
        debug!("heap grew to {} KiB", self.data_bytes / 1024);
        Ok(())
    }

    /// Finds `units` free units starting at an `align`-aligned address,
    /// growing the heap if allowed and needed.
    ///
    /// # Errors
    /// Zero units, a non-power-of-two alignment, or no room even after
    /// growing to the maximum.
    pub fn alloc_aligned<B: HeapBackend>(
        &mut self,
        backend: &mut B,
        units: u32,
        align: u32,
        can_expand: bool,
    ) -> Result<VirtualAddress, HeapError> {
        if units == 0 {
            return Err(HeapError::InvalidArgument("zero-sized allocation"));
        }
        if !align.is_power_of_two() {
            return Err(HeapError::InvalidArgument("alignment is not a power of two"));
        }
        let align = align.max(UNIT);
        let requested = units as usize * UNIT as usize;
        if units > self.layout.max_units {
            return Err(HeapError::OutOfMemory { requested });
        }

        loop {
            if units <= self.total_units()
                && units <= self.free_units
                && let Some(first) = self.find_run(backend, units, align)
            {
                self.claim(backend, first, units);
                return Ok(self.unit_address(first));
            }

            if !can_expand {
                return Err(HeapError::OutOfMemory { requested });
            }
            self.expand(backend, units * UNIT)?;
        }
    }

    fn find_run<B: HeapBackend>(&self, backend: &mut B, units: u32, align: u32) -> Option<u32> {
        let total = self.total_units();
        let mut i = 0;
        while i + units <= total {
            let misalign = self.unit_address(i).as_u32() % align;
            if misalign != 0 {
                i += (align - misalign) / UNIT;
                continue;
            }
            if self.bitmap_word(backend, i / 32) == u32::MAX {
                i = (i / 32 + 1) * 32;
                continue;
            }
            match self.first_used(backend, i, units) {
                None => return Some(i),
                Some(used) => i = used + 1,
            }
        }
        None
    }

    /// First used unit in `[start, start + len)`.
    fn first_used<B: HeapBackend>(&self, backend: &mut B, start: u32, len: u32) -> Option<u32> {
        let end = start + len;
        let mut unit = start;
        while unit < end {
            let word_base = unit / 32 * 32;
            let stop = (word_base + 32).min(end);
            let hits = self.bitmap_word(backend, unit / 32) & bit_range(unit - word_base, stop - word_base);
            if hits != 0 {
                return Some(word_base + hits.trailing_zeros());
            }
            unit = stop;
        }
        None
    }

    fn set_units<B: HeapBackend>(&self, backend: &mut B, start: u32, len: u32, used: bool) {
        let end = start + len;
        let mut unit = start;
        while unit < end {
            let word_base = unit / 32 * 32;
            let stop = (word_base + 32).min(end);
            let mask = bit_range(unit - word_base, stop - word_base);
            let va = self.layout.bitmap() + unit / 32 * 4;
            unsafe {
                let word = backend.read_u32(va);
                backend.write_u32(va, if used { word | mask } else { word & !mask });
            }
            unit = stop;
        }
    }

    fn bitmap_word<B: HeapBackend>(&self, backend: &mut B, word: u32) -> u32 {
        unsafe { backend.read_u32(self.layout.bitmap() + word * 4) }
    }

    fn is_unit_used<B: HeapBackend>(&self, backend: &mut B, unit: u32) -> bool {
        self.bitmap_word(backend, unit / 32) & (1 << (unit % 32)) != 0
    }

    fn length_of<B: HeapBackend>(&self, backend: &mut B, unit: u32) -> u32 {
        unsafe { backend.read_u32(self.layout.lengths + unit * 4) }
    }

    fn set_length<B: HeapBackend>(&self, backend: &mut B, unit: u32, units: u32) {
        unsafe { backend.write_u32(self.layout.lengths + unit * 4, units) };
    }

    fn claim<B: HeapBackend>(&mut self, backend: &mut B, first: u32, units: u32) {
        self.set_units(backend, first, units, true);
        self.set_length(backend, first, units);
        self.free_units -= units;
    }

    const fn unit_address(&self, unit: u32) -> VirtualAddress {
        VirtualAddress::new(self.layout.data_start.as_u32() + unit * UNIT)
    }

    fn unit_of(&self, ptr: VirtualAddress) -> Result<u32, HeapError> {
        let start = self.layout.data_start.as_u32();
        let offset = ptr.as_u32().wrapping_sub(start);
        if ptr.as_u32() < start || offset >= self.data_bytes || offset % UNIT != 0 {
            return Err(HeapError::InvalidPointer(ptr));
        }
        Ok(offset / UNIT)
    }

    /// `(first unit, length in units)` of the live block starting at `ptr`.
    fn lookup<B: HeapBackend>(&self, backend: &mut B, ptr: VirtualAddress) -> Result<(u32, u32), HeapError> {
        let unit = self.unit_of(ptr)?;
        let units = self.length_of(backend, unit);
        if units == 0 || !self.is_unit_used(backend, unit) {
            return Err(HeapError::Corruption(ptr));
        }
        Ok((unit, units))
    }

    fn live_block<B: HeapBackend>(&mut self, backend: &mut B, ptr: VirtualAddress) -> Result<(u32, u32), HeapError> {
        self.lookup(backend, ptr).inspect_err(|e| {
            if let HeapError::Corruption(ptr) = e {
                self.corruptions += 1;
                warn!("heap: {ptr} is not the start of a live block");
            }
        })
    }

    fn units_for(size: usize) -> Result<u32, HeapError> {
        if size == 0 {
            return Err(HeapError::InvalidArgument("zero-sized allocation"));
        }
        u32::try_from(size.div_ceil(UNIT as usize)).map_err(|_| HeapError::OutOfMemory { requested: size })
    }

    /// # Errors
    /// See [`KernelHeap::alloc_aligned`].
    pub fn malloc<B: HeapBackend>(&mut self, backend: &mut B, size: usize) -> Result<VirtualAddress, HeapError> {
        self.alloc_aligned(backend, Self::units_for(size)?, HEAP_ALIGNMENT, true)
    }

    /// # Errors
    /// See [`KernelHeap::alloc_aligned`].
    pub fn malloc_aligned<B: HeapBackend>(
        &mut self,
        backend: &mut B,
        size: usize,
        align: u32,
    ) -> Result<VirtualAddress, HeapError> {
        self.alloc_aligned(backend, Self::units_for(size)?, align, true)
    }

    /// Allocates `count * size` zeroed bytes.
    ///
    /// # Errors
    /// The product overflows, or see [`KernelHeap::alloc_aligned`].
    pub fn calloc<B: HeapBackend>(
        &mut self,
        backend: &mut B,
        count: usize,
        size: usize,
    ) -> Result<VirtualAddress, HeapError> {
        let total = count.checked_mul(size).ok_or(HeapError::Overflow)?;
        let ptr = self.malloc(backend, total)?;
        unsafe { backend.fill(ptr, 0, total) };
        Ok(ptr)
    }

    /// # Errors
    /// See [`KernelHeap::alloc_aligned`].
    pub fn zalloc<B: HeapBackend>(&mut self, backend: &mut B, size: usize) -> Result<VirtualAddress, HeapError> {
        self.calloc(backend, 1, size)
    }

    /// One page-aligned page.
    ///
    /// # Errors
    /// See [`KernelHeap::alloc_aligned`].
    pub fn page_alloc<B: HeapBackend>(&mut self, backend: &mut B) -> Result<VirtualAddress, HeapError> {
        self.malloc_aligned(backend, PAGE as usize, PAGE)
    }

    /// `count` contiguous page-aligned pages.
    ///
    /// # Errors
    /// `count` is zero or overflows, or see [`KernelHeap::alloc_aligned`].
    pub fn pages_alloc<B: HeapBackend>(&mut self, backend: &mut B, count: usize) -> Result<VirtualAddress, HeapError> {
        let bytes = count.checked_mul(PAGE as usize).ok_or(HeapError::Overflow)?;
        self.malloc_aligned(backend, bytes, PAGE)
    }

    /// Releases the block starting at `ptr`.
    ///
    /// # Errors
    /// `ptr` is outside the data area or misaligned (`InvalidPointer`), or does
    /// not start a live block (`Corruption`, also counted and logged). The
    /// tables are untouched in both cases.
    pub fn free<B: HeapBackend>(&mut self, backend: &mut B, ptr: VirtualAddress) -> Result<(), HeapError> {
        let (first, units) = self.live_block(backend, ptr)?;
        self.set_units(backend, first, units, false);
        self.set_length(backend, first, 0);
        self.free_units += units;
        Ok(())
    }

    /// Resizes the block at `ptr`. `None` allocates; a zero size frees and
    /// returns `None`.
    ///
    /// Shrinking and growing into free neighbours keep the address. Otherwise
    /// the contents move to a new block and the old one is freed; if that
    /// allocation fails the old block is left as it was.
    ///
    /// # Errors
    /// As for [`KernelHeap::malloc`] and [`KernelHeap::free`].
    pub fn realloc<B: HeapBackend>(
        &mut self,
        backend: &mut B,
        ptr: Option<VirtualAddress>,
        new_size: usize,
    ) -> Result<Option<VirtualAddress>, HeapError> {
        let Some(ptr) = ptr else {
            return self.malloc(backend, new_size).map(Some);
        };
        if new_size == 0 {
            self.free(backend, ptr)?;
            return Ok(None);
        }

        let (first, old_units) = self.live_block(backend, ptr)?;
        let new_units = Self::units_for(new_size)?;

        if new_units <= old_units {
            let tail = old_units - new_units;
            if tail > 0 {
                self.set_units(backend, first + new_units, tail, false);
                self.set_length(backend, first, new_units);
                self.free_units += tail;
            }
            return Ok(Some(ptr));
        }

        let extra = new_units - old_units;
        if first + new_units <= self.total_units()
            && self.first_used(backend, first + old_units, extra).is_none()
        {
            self.set_units(backend, first + old_units, extra, true);
            self.set_length(backend, first, new_units);
            self.free_units -= extra;
            return Ok(Some(ptr));
        }

        let moved = self.malloc(backend, new_size)?;
        unsafe { backend.copy(moved, ptr, (old_units * UNIT) as usize) };
        self.free(backend, ptr)?;
        Ok(Some(moved))
    }

    /// Usable size of the block at `ptr`, in bytes.
    ///
    /// # Errors
    /// `ptr` does not start a live block.
    pub fn block_size<B: HeapBackend>(&self, backend: &mut B, ptr: VirtualAddress) -> Result<usize, HeapError> {
        let (_, units) = self.lookup(backend, ptr)?;
        Ok(units as usize * UNIT as usize)
    }

    /// Logs every live block.
    pub fn log_blocks<B: HeapBackend>(&self, backend: &mut B) {
        let total = self.total_units();
        let mut unit = 0;
        let mut blocks = 0usize;
        while unit < total {
            let units = self.length_of(backend, unit);
            if units == 0 {
                unit += 1;
                continue;
            }
            debug!(
                "heap block #{blocks}: unit {unit}, {units} units at {}",
                self.unit_address(unit)
            );
            blocks += 1;
            unit += units;
        }
        debug!(
            "heap: {blocks} live blocks, {} of {} bytes free",
            self.free_bytes(),
            self.total_bytes()
        );
    }

    /// Set bits in the backed part of the bitmap. Equals
    /// `total_units() - free_units()`.
    pub fn count_used_units<B: HeapBackend>(&self, backend: &mut B) -> u32 {
        let total = self.total_units();
        let mut used = 0;
        let mut unit = 0;
        while unit < total {
            let stop = (unit + 32).min(total);
            used += (self.bitmap_word(backend, unit / 32) & bit_range(0, stop - unit)).count_ones();
            unit = stop;
        }
        used
    }

    #[must_use]
    pub const fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    #[must_use]
    pub const fn data_start(&self) -> VirtualAddress {
        self.layout.data_start
    }

    #[must_use]
    pub const fn data_end(&self) -> u64 {
        self.layout.data_start.as_u64() + self.data_bytes as u64
    }

    #[must_use]
    pub const fn total_units(&self) -> u32 {
        self.data_bytes / UNIT
    }

    #[must_use]
    pub const fn free_units(&self) -> u32 {
        self.free_units
    }

    #[must_use]
    pub const fn total_bytes(&self) -> usize {
        self.data_bytes as usize
    }

    #[must_use]
    pub const fn free_bytes(&self) -> usize {
        self.free_units as usize * UNIT as usize
    }

    #[must_use]
    pub const fn used_bytes(&self) -> usize {
        self.total_bytes() - self.free_bytes()
    }

    #[must_use]
    pub const fn corruption_count(&self) -> usize {
        self.corruptions
    }
}

/// Bits `[lo, hi)` of a word, `hi <= 32`.
const fn bit_range(lo: u32, hi: u32) -> u32 {
    let upper = if hi >= 32 { u32::MAX } else { (1 << hi) - 1 };
    upper & !((1 << lo) - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    /// Flat byte buffer standing in for the heap's virtual region. Touching a
    /// page that was never backed panics.
    struct FlatBackend {
        base: u32,
        bytes: Vec<u8>,
        backed: BTreeSet<u32>,
        frames_left: usize,
    }

    impl FlatBackend {
        fn new(base: u32, size: u32, frames: usize) -> Self {
            Self {
                base,
                bytes: vec![0xAA; size as usize + PAGE as usize],
                backed: BTreeSet::new(),
                frames_left: frames,
            }
        }

        fn range(&self, va: VirtualAddress, len: usize) -> core::ops::Range<usize> {
            let start = (va.as_u32() - self.base) as usize;
            let mut page = va.as_u32() & !(PAGE - 1);
            while u64::from(page) < va.as_u64() + len as u64 {
                assert!(self.backed.contains(&page), "heap touched unbacked page {page:#x}");
                page += PAGE;
            }
            start..start + len
        }
    }

    impl HeapBackend for FlatBackend {
        unsafe fn read(&mut self, va: VirtualAddress, dst: &mut [u8]) {
            let r = self.range(va, dst.len());
            dst.copy_from_slice(&self.bytes[r]);
        }

        unsafe fn write(&mut self, va: VirtualAddress, src: &[u8]) {
            let r = self.range(va, src.len());
            self.bytes[r].copy_from_slice(src);
        }

        unsafe fn fill(&mut self, va: VirtualAddress, value: u8, len: usize) {
            let r = self.range(va, len);
            self.bytes[r].fill(value);
        }

        unsafe fn copy(&mut self, dst: VirtualAddress, src: VirtualAddress, len: usize) {
            let s = self.range(src, len);
            let d = self.range(dst, len);
            self.bytes.copy_within(s, d.start);
        }

        fn back_page(&mut self, page: VirtualPage<Size4K>) -> Result<(), HeapError> {
            if self.frames_left == 0 {
                return Err(HeapError::OutOfFrames);
            }
            self.frames_left -= 1;
            let base = page.base().as_u32();
            assert!(self.backed.insert(base), "page {base:#x} backed twice");
            let start = (base - self.base) as usize;
            self.bytes[start..start + PAGE as usize].fill(0);
            Ok(())
        }
    }

    const BASE: u32 = 0xD000_0000;

    fn heap(region: u32, initial: u32) -> (FlatBackend, KernelHeap) {
        let mut backend = FlatBackend::new(BASE, region, usize::MAX);
        let heap = KernelHeap::init(&mut backend, VirtualAddress::new(BASE), region, initial).unwrap();
        (backend, heap)
    }

    fn write_pattern(b: &mut FlatBackend, ptr: VirtualAddress, len: usize, seed: u8) {
        let data: Vec<u8> = (0..len).map(|i| seed.wrapping_add(i as u8)).collect();
        unsafe { b.write(ptr, &data) };
    }

    fn read_back(b: &mut FlatBackend, ptr: VirtualAddress, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        unsafe { b.read(ptr, &mut out) };
        out
    }

    #[test]
    fn layout_fits_metadata_and_data() {
        let layout = HeapLayout::compute(VirtualAddress::new(BASE + 3), 1 << 20, 64 << 10).unwrap();
        assert_eq!(layout.region_start.as_u32(), BASE + 16);
        let meta = HeapLayout::metadata_bytes(u64::from(layout.max_units));
        assert_eq!(layout.data_start.as_u64(), layout.region_start.as_u64() + meta);
        assert!(layout.data_max() <= layout.region_end);
        assert_eq!(layout.lengths.as_u32(), layout.region_start.as_u32() + 4 * layout.max_units.div_ceil(32));
        assert_eq!(layout.initial_bytes, 64 << 10);
        assert!(layout.data_start.as_u32() % UNIT == 0);
    }

    #[test]
    fn initial_size_is_rounded_and_clamped() {
        let l = HeapLayout::compute(VirtualAddress::new(BASE), 1 << 20, 1).unwrap();
        assert_eq!(l.initial_bytes, PAGE);
        let l = HeapLayout::compute(VirtualAddress::new(BASE), 1 << 20, 0).unwrap();
        assert_eq!(l.initial_bytes, l.max_bytes());
        let l = HeapLayout::compute(VirtualAddress::new(BASE), 1 << 20, 8 << 20).unwrap();
        assert_eq!(l.initial_bytes, l.max_bytes());
    }

    #[test]
    fn tiny_regions_are_rejected() {
        assert_eq!(
            HeapLayout::compute(VirtualAddress::new(BASE + 1), 8, 0),
            Err(HeapError::RegionTooSmall)
        );
        assert_eq!(
            HeapLayout::compute(VirtualAddress::new(BASE), 16, 0),
            Err(HeapError::RegionTooSmall)
        );
        assert!(HeapLayout::compute(VirtualAddress::new(BASE), 64, 0).is_ok());
    }

    #[test]
    fn regions_past_the_address_space_are_rejected() {
        assert!(matches!(
            HeapLayout::compute(VirtualAddress::new(0xFFF0_0000), 2 << 20, 0),
            Err(HeapError::InvalidArgument(_))
        ));
        let top = HeapLayout::compute(VirtualAddress::new(0xFFF0_0000), 1 << 20, 0).unwrap();
        assert_eq!(top.region_end, 1 << 32);
        assert!(top.data_max() <= 1 << 32);
    }

    #[test]
    fn malloc_free_malloc_returns_the_same_block() {
        let (mut b, mut h) = heap(1 << 20, 64 << 10);
        let a = h.malloc(&mut b, 100).unwrap();
        h.free(&mut b, a).unwrap();
        assert_eq!(h.malloc(&mut b, 100).unwrap(), a);
        assert_eq!(h.block_size(&mut b, a).unwrap(), 112);
    }

    #[test]
    fn pattern_survives() {
        let (mut b, mut h) = heap(1 << 20, 64 << 10);
        let p = h.malloc(&mut b, 300).unwrap();
        let q = h.malloc(&mut b, 50).unwrap();
        write_pattern(&mut b, p, 300, 7);
        write_pattern(&mut b, q, 50, 99);
        let expected: Vec<u8> = (0..300).map(|i| 7u8.wrapping_add(i as u8)).collect();
        assert_eq!(read_back(&mut b, p, 300), expected);
    }

    #[test]
    fn live_blocks_never_overlap() {
        let (mut b, mut h) = heap(1 << 20, 64 << 10);
        let mut rng = 0x2545_F491_4F6C_DD1Du64;
        let mut next = || {
            rng ^= rng << 13;
            rng ^= rng >> 7;
            rng ^= rng << 17;
            rng
        };

        let mut live: Vec<(u64, u64)> = Vec::new();
        for _ in 0..400 {
            if !live.is_empty() && next() % 3 == 0 {
                let (ptr, _) = live.swap_remove((next() % live.len() as u64) as usize);
                h.free(&mut b, VirtualAddress::new(ptr as u32)).unwrap();
            } else {
                let size = (next() % 700 + 1) as usize;
                let ptr = h.malloc(&mut b, size).unwrap();
                live.push((ptr.as_u64(), size as u64));
            }
        }

        live.sort_unstable();
        for pair in live.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0, "{pair:x?} overlap");
        }
        assert_eq!(h.count_used_units(&mut b), h.total_units() - h.free_units());
    }

    #[test]
    fn alignment_is_honoured() {
        let (mut b, mut h) = heap(1 << 20, 64 << 10);
        h.malloc(&mut b, 1).unwrap();
        for align in [16, 64, 256, 4096] {
            let p = h.malloc_aligned(&mut b, 24, align).unwrap();
            assert_eq!(p.as_u32() % align, 0);
        }
        let page = h.page_alloc(&mut b).unwrap();
        assert_eq!(page.as_u32() % PAGE, 0);
        assert_eq!(h.block_size(&mut b, page).unwrap(), PAGE as usize);
        assert_eq!(
            h.malloc_aligned(&mut b, 8, 24),
            Err(HeapError::InvalidArgument("alignment is not a power of two"))
        );
    }

    #[test]
    fn realloc_shrinks_in_place_and_keeps_prefix() {
        let (mut b, mut h) = heap(1 << 20, 64 << 10);
        let p = h.malloc(&mut b, 256).unwrap();
        write_pattern(&mut b, p, 256, 1);
        let free_before = h.free_units();
        let q = h.realloc(&mut b, Some(p), 40).unwrap();
        assert_eq!(q, Some(p));
        assert_eq!(read_back(&mut b, p, 40), (0..40).map(|i| 1 + i as u8).collect::<Vec<_>>());
        assert_eq!(h.free_units(), free_before + 13);
        assert_eq!(h.block_size(&mut b, p).unwrap(), 48);
    }

    #[test]
    fn realloc_grows_in_place_then_moves() {
        let (mut b, mut h) = heap(1 << 20, 64 << 10);
        let p = h.malloc(&mut b, 32).unwrap();
        write_pattern(&mut b, p, 32, 3);
        assert_eq!(h.realloc(&mut b, Some(p), 64).unwrap(), Some(p));

        let fence = h.malloc(&mut b, 16).unwrap();
        let moved = h.realloc(&mut b, Some(p), 200).unwrap().unwrap();
        assert_ne!(moved, p);
        assert!(moved > fence);
        assert_eq!(read_back(&mut b, moved, 32), (0..32).map(|i| 3 + i as u8).collect::<Vec<_>>());
        assert_eq!(h.free(&mut b, p), Err(HeapError::Corruption(p)));
    }

    #[test]
    fn realloc_edge_cases() {
        let (mut b, mut h) = heap(1 << 20, 64 << 10);
        let p = h.realloc(&mut b, None, 10).unwrap().unwrap();
        assert_eq!(h.realloc(&mut b, Some(p), 0).unwrap(), None);
        assert_eq!(h.free_bytes(), h.total_bytes());
    }

    #[test]
    fn bad_frees_are_rejected_and_counted() {
        let (mut b, mut h) = heap(1 << 20, 64 << 10);
        let p = h.malloc(&mut b, 64).unwrap();
        let inside = p + 16;
        assert_eq!(h.free(&mut b, inside), Err(HeapError::Corruption(inside)));
        assert_eq!(h.free(&mut b, p + 3), Err(HeapError::InvalidPointer(p + 3)));
        let outside = VirtualAddress::new(0x1000);
        assert_eq!(h.free(&mut b, outside), Err(HeapError::InvalidPointer(outside)));
        h.free(&mut b, p).unwrap();
        assert_eq!(h.free(&mut b, p), Err(HeapError::Corruption(p)));
        assert_eq!(h.corruption_count(), 2);
        assert_eq!(h.free_bytes(), h.total_bytes());
    }

    #[test]
    fn calloc_zeroes_and_checks_overflow() {
        let (mut b, mut h) = heap(1 << 20, 64 << 10);
        let p = h.malloc(&mut b, 64).unwrap();
        write_pattern(&mut b, p, 64, 0xF0);
        h.free(&mut b, p).unwrap();
        let z = h.calloc(&mut b, 4, 16).unwrap();
        assert_eq!(z, p);
        assert!(read_back(&mut b, z, 64).iter().all(|&x| x == 0));
        assert_eq!(h.calloc(&mut b, usize::MAX, 2), Err(HeapError::Overflow));
        assert_eq!(h.zalloc(&mut b, 0), Err(HeapError::InvalidArgument("zero-sized allocation")));
    }

    #[test]
    fn expansion_runs_up_to_data_max() {
        let (mut b, mut h) = heap(1 << 20, 64 << 10);
        let initial = h.total_bytes();
        assert_eq!(initial, 64 << 10);

        let block = 4096;
        let mut count = 0;
        while h.free_bytes() >= block {
            h.malloc(&mut b, block).unwrap();
            count += 1;
        }
        assert_eq!(count, initial / block);
        assert_eq!(h.total_bytes(), initial);

        let grown = h.malloc(&mut b, block).unwrap();
        assert!(h.total_bytes() > initial);
        assert_eq!(grown.as_u64(), h.data_start().as_u64() + initial as u64);

        loop {
            match h.malloc(&mut b, block) {
                Ok(_) => {}
                Err(e) => {
                    assert!(matches!(e, HeapError::OutOfMemory { .. }));
                    break;
                }
            }
        }
        assert!(h.data_end() <= h.layout().data_max());
        assert!(h.layout().data_max() - h.data_end() < block as u64);
        assert_eq!(h.count_used_units(&mut b), h.total_units() - h.free_units());
    }

    #[test]
    fn failed_backing_is_retried_later() {
        let layout = HeapLayout::compute(VirtualAddress::new(BASE), 1 << 20, 64 << 10).unwrap();
        let pages = ((layout.initial_mapped_end() - u64::from(BASE)) / u64::from(PAGE)) as usize;
        let mut b = FlatBackend::new(BASE, 1 << 20, pages);
        let mut h = KernelHeap::with_layout(&mut b, layout).unwrap();
        assert_eq!(b.frames_left, 0);

        let before = h.total_bytes();
        assert_eq!(h.malloc(&mut b, 128 << 10), Err(HeapError::OutOfFrames));
        assert_eq!(h.total_bytes(), before);

        // Partial progress: three more pages get backed, then the budget runs out again.
        b.frames_left = 3;
        assert_eq!(h.malloc(&mut b, 128 << 10), Err(HeapError::OutOfFrames));
        assert_eq!(h.total_bytes(), before);

        // The backend panics if a page is backed twice.
        b.frames_left = usize::MAX;
        h.malloc(&mut b, 128 << 10).unwrap();
        assert!(h.total_bytes() >= before + (128 << 10));
    }

    #[test]
    fn no_expansion_when_disabled() {
        let (mut b, mut h) = heap(1 << 20, 4096);
        assert!(matches!(
            h.alloc_aligned(&mut b, 1024, 16, false),
            Err(HeapError::OutOfMemory { .. })
        ));
        assert!(h.alloc_aligned(&mut b, 1024, 16, true).is_ok());
    }

    #[test]
    fn bit_ranges() {
        assert_eq!(bit_range(0, 32), u32::MAX);
        assert_eq!(bit_range(4, 8), 0xF0);
        assert_eq!(bit_range(31, 32), 0x8000_0000);
        assert_eq!(bit_range(3, 3), 0);
    }
}
