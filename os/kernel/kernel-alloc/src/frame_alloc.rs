//! # Physical Frame Allocator
//!
//! One bit per 4 KiB frame; `1` means the frame cannot be handed out (used,
//! reserved, or past the end of memory) and `0` means it is free.
//!
//! Initialization is deny-by-default: every bit starts set, usable e820
//! extents are cleared, and then non-usable extents, frame 0, and the caller's
//! reservations are set again. An incomplete memory map therefore leaves
//! memory unused rather than handing out something firmware owns.
//!
//! The bitmap storage is borrowed; boot carves it out of the early bump
//! region and lists it among the reservations.

use crate::e820::PhysicalMemoryMap;
use core::ops::Range;
use kernel_info::memory::MAX_PHYSICAL_BYTES;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::FrameAlloc;
use log::{info, warn};

pub const FRAME_SIZE: u32 = 4096;

/// Frames needed to describe the whole 32-bit physical space.
#[allow(clippy::cast_possible_truncation)]
pub const MAX_FRAMES: usize = (MAX_PHYSICAL_BYTES / FRAME_SIZE as u64) as usize;

const WORD_BITS: usize = u32::BITS as usize;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("frame bitmap needs {needed} words but only {provided} were provided")]
    BitmapTooSmall { needed: usize, provided: usize },
    #[error("{0} is not frame-aligned")]
    Misaligned(PhysicalAddress),
    #[error("{0} lies in frame 0, which is never handed out")]
    ReservedFrame(PhysicalAddress),
    #[error("{0} is beyond the last tracked frame")]
    OutOfRange(PhysicalAddress),
    #[error("{0} was freed while already free")]
    DoubleFree(PhysicalAddress),
}

/// Bitmap allocator for single physical frames.
pub struct FrameBitmapAllocator<'a> {
    bitmap: &'a mut [u32],
    total_frames: usize,
    free_frames: usize,
    double_frees: usize,
}

impl<'a> FrameBitmapAllocator<'a> {
    /// Frames covering `phys_mem_size` bytes, capped at [`MAX_FRAMES`].
    #[must_use]
    pub fn frames_for(phys_mem_size: u64) -> usize {
        usize::try_from(phys_mem_size.div_ceil(u64::from(FRAME_SIZE)))
            .unwrap_or(MAX_FRAMES)
            .min(MAX_FRAMES)
    }

    #[must_use]
    pub fn bitmap_words_for(phys_mem_size: u64) -> usize {
        Self::frames_for(phys_mem_size).div_ceil(WORD_BITS)
    }

    /// Bytes of bitmap storage [`FrameBitmapAllocator::init`] needs.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn bitmap_bytes_for(phys_mem_size: u64) -> u32 {
        // At most MAX_FRAMES / 8 = 128 KiB.
        (Self::bitmap_words_for(phys_mem_size) * size_of::<u32>()) as u32
    }

    /// Builds the bitmap over `storage` and reconciles it with `map`.
    ///
    /// Every range in `reserved` is marked used after the map has been applied,
    /// so it wins over any usable extent it overlaps.
    ///
    /// # Errors
    /// `storage` is shorter than [`FrameBitmapAllocator::bitmap_words_for`].
    pub fn init(
        storage: &'a mut [u32],
        phys_mem_size: u64,
        map: &PhysicalMemoryMap,
        reserved: &[Range<u64>],
    ) -> Result<Self, FrameError> {
        if phys_mem_size > MAX_PHYSICAL_BYTES {
            warn!(
                "physical memory of {phys_mem_size:#x} bytes exceeds the trackable {MAX_PHYSICAL_BYTES:#x}"
            );
        }

        let total_frames = Self::frames_for(phys_mem_size);
        let needed = Self::bitmap_words_for(phys_mem_size);
        if storage.len() < needed {
            return Err(FrameError::BitmapTooSmall {
                needed,
                provided: storage.len(),
            });
        }

        let (bitmap, _) = storage.split_at_mut(needed);
        bitmap.fill(u32::MAX);

        let mut frames = Self {
            bitmap,
            total_frames,
            free_frames: 0,
            double_frees: 0,
        };
        frames.reconcile(map, reserved);
        frames.free_frames = frames.count_free_frames();

        info!(
            "frames: {} tracked, {} free ({} KiB)",
            frames.total_frames,
            frames.free_frames,
            frames.free_memory_bytes() / 1024
        );
        Ok(frames)
    }

    fn reconcile(&mut self, map: &PhysicalMemoryMap, reserved: &[Range<u64>]) {
        let frame = u64::from(FRAME_SIZE);

        // Only frames lying wholly inside a usable extent become free.
        for extent in map.iter().filter(|e| e.is_usable()) {
            let first = extent.base.div_ceil(frame);
            let end = extent.end() / frame;
            for idx in first..end.min(self.total_frames as u64) {
                #[allow(clippy::cast_possible_truncation)]
                self.set_free(idx as usize);
            }
        }

        for extent in map.iter().filter(|e| !e.is_usable()) {
            self.mark_region_used(extent.base, extent.length);
        }

        self.set_used(0);

        for range in reserved {
            self.mark_region_used(range.start, range.end.saturating_sub(range.start));
        }
    }

    /// First free frame, lowest address first.
    pub fn alloc_frame(&mut self) -> Option<PhysicalPage<Size4K>> {
        if self.free_frames == 0 {
            return None;
        }

        let (word, bits) = self
            .bitmap
            .iter()
            .enumerate()
            .find(|(_, bits)| **bits != u32::MAX)?;
        let idx = word * WORD_BITS + (!*bits).trailing_zeros() as usize;
        if idx >= self.total_frames {
            return None;
        }

        self.set_used(idx);
        #[allow(clippy::cast_possible_truncation)]
        let frame = PhysicalPage::from_frame_number(idx as u32);
        Some(frame)
    }

    /// Returns a frame to the pool.
    ///
    /// # Errors
    /// `pa` is misaligned, frame 0, out of range, or already free. A double
    /// free is also counted and logged. The bitmap is left untouched in every
    /// error case.
    pub fn free_frame(&mut self, pa: PhysicalAddress) -> Result<(), FrameError> {
        if !pa.is_aligned::<Size4K>() {
            return Err(FrameError::Misaligned(pa));
        }

        let idx = Self::index_of(pa);
        if idx == 0 {
            return Err(FrameError::ReservedFrame(pa));
        }
        if idx >= self.total_frames {
            return Err(FrameError::OutOfRange(pa));
        }
        if !self.is_used(idx) {
            self.double_frees += 1;
            warn!("double free of frame {pa}");
            return Err(FrameError::DoubleFree(pa));
        }

        self.set_free(idx);
        Ok(())
    }

    /// Sets every frame touched by `[base, base + length)`, clamped to the
    /// tracked range.
    pub fn mark_region_used(&mut self, base: u64, length: u64) {
        if let Some(frames) = self.frame_span(base, length) {
            for idx in frames {
                self.set_used(idx);
            }
        }
    }

    /// Clears every frame touched by `[base, base + length)`, clamped to the
    /// tracked range. Frame 0 stays used.
    pub fn mark_region_free(&mut self, base: u64, length: u64) {
        if let Some(frames) = self.frame_span(base, length) {
            for idx in frames.filter(|&idx| idx != 0) {
                self.set_free(idx);
            }
        }
    }

    fn frame_span(&self, base: u64, length: u64) -> Option<Range<usize>> {
        if length == 0 || self.total_frames == 0 {
            return None;
        }
        let frame = u64::from(FRAME_SIZE);
        let first = base / frame;
        let last = (base.saturating_add(length - 1) / frame).min(self.total_frames as u64 - 1);
        if first > last {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let span = first as usize..last as usize + 1;
        Some(span)
    }

    /// Whether frame `idx` is unavailable. Anything past the end counts as used.
    #[must_use]
    pub fn is_used(&self, idx: usize) -> bool {
        if idx >= self.total_frames {
            return true;
        }
        self.bitmap[idx / WORD_BITS] & (1 << (idx % WORD_BITS)) != 0
    }

    /// Marks frame `idx` used, keeping the free counter in step.
    pub fn set_used(&mut self, idx: usize) {
        if !self.is_used(idx) {
            self.bitmap[idx / WORD_BITS] |= 1 << (idx % WORD_BITS);
            self.free_frames -= 1;
        }
    }

    /// Marks frame `idx` free, keeping the free counter in step.
    pub fn set_free(&mut self, idx: usize) {
        if idx < self.total_frames && self.is_used(idx) {
            self.bitmap[idx / WORD_BITS] &= !(1 << (idx % WORD_BITS));
            self.free_frames += 1;
        }
    }

    #[must_use]
    pub fn is_frame_used(&self, pa: PhysicalAddress) -> bool {
        self.is_used(Self::index_of(pa))
    }

    const fn index_of(pa: PhysicalAddress) -> usize {
        pa.as_usize() / FRAME_SIZE as usize
    }

    #[must_use]
    pub const fn free_frame_count(&self) -> usize {
        self.free_frames
    }

    #[must_use]
    pub const fn free_memory_bytes(&self) -> u64 {
        self.free_frames as u64 * FRAME_SIZE as u64
    }

    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.total_frames
    }

    #[must_use]
    pub const fn double_free_count(&self) -> usize {
        self.double_frees
    }

    /// Recounts the zero bits in `[0, total_frames)`. Always equals
    /// [`FrameBitmapAllocator::free_frame_count`].
    #[must_use]
    pub fn count_free_frames(&self) -> usize {
        let mut free = 0;
        for (word, bits) in self.bitmap.iter().enumerate() {
            let valid = self.total_frames.saturating_sub(word * WORD_BITS).min(WORD_BITS);
            let mask = if valid == WORD_BITS {
                u32::MAX
            } else {
                (1u32 << valid) - 1
            };
            free += (!*bits & mask).count_ones() as usize;
        }
        free
    }

    /// Whether every bit past the last frame is still set.
    #[must_use]
    pub fn tail_bits_set(&self) -> bool {
        let valid = self.total_frames % WORD_BITS;
        match self.bitmap.last() {
            Some(last) if valid != 0 => last >> valid == u32::MAX >> valid,
            _ => true,
        }
    }
}

impl FrameAlloc for FrameBitmapAllocator<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc_frame()
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        if let Err(e) = self.free_frame(frame.base()) {
            warn!("could not return {frame}: {e}");
        }
    }
}
