//! # Memory Bring-Up
//!
//! [`MemoryManager::boot`] runs the one valid order:
//!
//! 1. collect the e820 map
//! 2. open the early bump window after the kernel image
//! 3. carve the frame bitmap from it and seed it from the map
//! 4. build the kernel directory and enable paging
//! 5. hand everything the bump window gave out to the frame bitmap, freeze it
//! 6. lay out the kernel heap and back its first pages
//!
//! Each step consumes what the previous one produced, so the order is visible
//! in the signatures rather than in a comment.
//!
//! Afterwards the [`MemoryManager`] owns every layer and is the surface the
//! rest of the kernel allocates through.

use crate::bootmem::{BumpError, EarlyBumpAllocator};
use crate::e820::{E820Table, MemoryMapError, PhysicalMemoryMap};
use crate::frame_alloc::{FrameBitmapAllocator, FrameError};
use crate::heap::{HeapBackend, HeapError, HeapLayout, KernelHeap};
use crate::vmm::{Active, Directory, PageTableManager, PagingConfig, VmmError};
use kernel_info::boot::KernelImage;
use kernel_info::memory::{
    EARLY_REGION_BYTES, IDENTITY_WINDOW_BYTES, KHEAP_BASE, KHEAP_INITIAL_BYTES, KHEAP_REGION_BYTES,
    SCRATCH_VA,
};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_vmem::{Mmu, PageEntryBits};
use log::{error, info, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootError {
    #[error("memory map: {0}")]
    MemoryMap(#[from] MemoryMapError),
    #[error("the memory map has no usable extent")]
    NoUsableMemory,
    #[error("early region: {0}")]
    Bump(#[from] BumpError),
    #[error("early allocation at {0} is outside the identity window")]
    EarlyRegionOutsideIdentityWindow(PhysicalAddress),
    #[error("frame allocator: {0}")]
    Frames(#[from] FrameError),
    #[error("paging: {0}")]
    Paging(#[from] VmmError),
    #[error("heap: {0}")]
    Heap(#[from] HeapError),
}

/// Layout knobs for [`MemoryManager::boot`]. [`MemoryConfig::new`] fills in
/// the `kernel_info::memory` defaults.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryConfig {
    pub kernel: KernelImage,
    pub early_region_bytes: u32,
    pub identity_limit: u32,
    pub scratch_va: VirtualAddress,
    pub heap_base: VirtualAddress,
    pub heap_region_bytes: u32,
    pub heap_initial_bytes: u32,
}

impl MemoryConfig {
    #[must_use]
    pub const fn new(kernel: KernelImage) -> Self {
        Self {
            kernel,
            early_region_bytes: EARLY_REGION_BYTES,
            identity_limit: IDENTITY_WINDOW_BYTES,
            scratch_va: VirtualAddress::new(SCRATCH_VA),
            heap_base: VirtualAddress::new(KHEAP_BASE),
            heap_region_bytes: KHEAP_REGION_BYTES,
            heap_initial_bytes: KHEAP_INITIAL_BYTES,
        }
    }

    #[must_use]
    pub const fn with_early_region_bytes(mut self, bytes: u32) -> Self {
        self.early_region_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_identity_limit(mut self, bytes: u32) -> Self {
        self.identity_limit = bytes;
        self
    }

    #[must_use]
    pub const fn with_scratch_va(mut self, va: VirtualAddress) -> Self {
        self.scratch_va = va;
        self
    }

    #[must_use]
    pub const fn with_heap(mut self, base: VirtualAddress, region_bytes: u32, initial_bytes: u32) -> Self {
        self.heap_base = base;
        self.heap_region_bytes = region_bytes;
        self.heap_initial_bytes = initial_bytes;
        self
    }

    #[must_use]
    pub const fn paging(&self) -> PagingConfig {
        PagingConfig {
            identity_limit: self.identity_limit,
            kernel: self.kernel,
            scratch_va: self.scratch_va,
        }
    }
}

/// The heap's view of kernel memory: heap addresses are read and written
/// through the MMU, and new heap pages get a fresh frame mapped into the
/// kernel directory.
pub struct KernelSpace<'a, M: Mmu> {
    pub paging: &'a mut PageTableManager<M, Active>,
    pub frames: &'a mut FrameBitmapAllocator<'static>,
}

impl<M: Mmu> HeapBackend for KernelSpace<'_, M> {
    unsafe fn read(&mut self, va: VirtualAddress, dst: &mut [u8]) {
        unsafe { self.paging.mmu_mut().read_bytes(va, dst) };
    }

    unsafe fn write(&mut self, va: VirtualAddress, src: &[u8]) {
        unsafe { self.paging.mmu_mut().write_bytes(va, src) };
    }

    unsafe fn fill(&mut self, va: VirtualAddress, value: u8, len: usize) {
        unsafe { self.paging.mmu_mut().fill_bytes(va, value, len) };
    }

    unsafe fn copy(&mut self, dst: VirtualAddress, src: VirtualAddress, len: usize) {
        unsafe { self.paging.mmu_mut().copy_bytes(dst, src, len) };
    }

    fn back_page(&mut self, page: VirtualPage<Size4K>) -> Result<(), HeapError> {
        let frame = self.frames.alloc_frame().ok_or(HeapError::OutOfFrames)?;
        self.paging.zero_frame(frame);
        let kernel = self.paging.kernel_directory();
        let mapped = self.paging.map(
            kernel,
            page.base(),
            frame.base(),
            PageEntryBits::new_kernel_rw(),
            &mut *self.frames,
        );
        if let Err(e) = mapped {
            if let Err(free) = self.frames.free_frame(frame.base()) {
                warn!("could not return {frame} after a failed heap mapping: {free}");
            }
            return Err(e.into());
        }
        Ok(())
    }
}

/// Every memory layer, after boot.
pub struct MemoryManager<M: Mmu> {
    config: MemoryConfig,
    memory_map: PhysicalMemoryMap,
    bump: EarlyBumpAllocator,
    frames: FrameBitmapAllocator<'static>,
    paging: PageTableManager<M, Active>,
    heap: KernelHeap,
}

impl<M: Mmu> MemoryManager<M> {
    /// Brings up physical, virtual and heap memory on a machine that is
    /// still running with paging off.
    ///
    /// # Safety
    /// `mmu` must be the machine the kernel runs on, with paging disabled,
    /// `config.kernel` loaded where it says, and the early region after it
    /// free RAM below `config.identity_limit`. Nothing else may touch the
    /// frames, tables or heap region handed to the manager.
    ///
    /// # Errors
    /// Any layer fails to initialize. See [`MemoryManager::boot_or_halt`]
    /// for the fatal wrapper.
    pub unsafe fn boot(mut mmu: M, table: &E820Table<'_>, config: MemoryConfig) -> Result<Self, BootError> {
        let memory_map = PhysicalMemoryMap::collect(table);
        memory_map.log_regions();
        let phys_mem_size = memory_map.highest_usable_end();
        if phys_mem_size == 0 {
            return Err(BootError::NoUsableMemory);
        }

        let mut bump = EarlyBumpAllocator::new();
        bump.init(config.kernel.phys_end, config.early_region_bytes)?;

        let bitmap_bytes = FrameBitmapAllocator::bitmap_bytes_for(phys_mem_size);
        let bitmap = bump.alloc(bitmap_bytes, 4096)?;
        if bitmap.as_u64() + u64::from(bitmap_bytes) > u64::from(config.identity_limit) {
            return Err(BootError::EarlyRegionOutsideIdentityWindow(bitmap));
        }
        let words = FrameBitmapAllocator::bitmap_words_for(phys_mem_size);
        let storage: &'static mut [u32] = unsafe { mmu.slice_mut(VirtualAddress::new(bitmap.as_u32()), words) };
        let bitmap_range = bitmap.as_u64()..bitmap.as_u64() + u64::from(bitmap_bytes);
        let mut frames = FrameBitmapAllocator::init(
            storage,
            phys_mem_size,
            &memory_map,
            &[config.kernel.phys_range(), bitmap_range],
        )?;

        let mut paging = unsafe { PageTableManager::<M, Active>::init_minimal(mmu, &mut bump, &config.paging())? };

        let kernel_start = config.kernel.phys_start.as_u64();
        frames.mark_region_used(kernel_start, bump.current_end() - kernel_start);
        bump.freeze();

        let layout = HeapLayout::compute(config.heap_base, config.heap_region_bytes, config.heap_initial_bytes)?;
        paging.prepare_tables(
            paging.kernel_directory(),
            config.heap_base,
            config.heap_region_bytes,
            &mut frames,
        )?;
        let heap = KernelHeap::with_layout(
            &mut KernelSpace {
                paging: &mut paging,
                frames: &mut frames,
            },
            layout,
        )?;

        info!(
            "memory up: {} MiB usable, {} frames free, heap {} KiB at {}",
            memory_map.total_usable_bytes() >> 20,
            frames.free_frame_count(),
            heap.total_bytes() / 1024,
            heap.data_start()
        );

        Ok(Self {
            config,
            memory_map,
            bump,
            frames,
            paging,
            heap,
        })
    }

    /// [`MemoryManager::boot`], treating any failure as fatal.
    ///
    /// # Safety
    /// As for [`MemoryManager::boot`].
    ///
    /// # Panics
    /// Whenever `boot` fails, after logging the cause.
    pub unsafe fn boot_or_halt(mmu: M, table: &E820Table<'_>, config: MemoryConfig) -> Self {
        match unsafe { Self::boot(mmu, table, config) } {
            Ok(memory) => memory,
            Err(e) => {
                error!("memory bring-up failed: {e}");
                panic!("memory bring-up failed: {e}");
            }
        }
    }

    fn heap_parts(&mut self) -> (&mut KernelHeap, KernelSpace<'_, M>) {
        (
            &mut self.heap,
            KernelSpace {
                paging: &mut self.paging,
                frames: &mut self.frames,
            },
        )
    }

    pub fn alloc_frame(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.frames.alloc_frame()
    }

    /// # Errors
    /// See [`FrameBitmapAllocator::free_frame`].
    pub fn free_frame(&mut self, pa: PhysicalAddress) -> Result<(), FrameError> {
        self.frames.free_frame(pa)
    }

    #[must_use]
    pub const fn free_frame_count(&self) -> usize {
        self.frames.free_frame_count()
    }

    /// Maps `va` to `pa` in the kernel directory.
    ///
    /// # Errors
    /// See [`PageTableManager::map`].
    pub fn map(&mut self, va: VirtualAddress, pa: PhysicalAddress, flags: PageEntryBits) -> Result<(), VmmError> {
        let kernel = self.paging.kernel_directory();
        self.paging.map(kernel, va, pa, flags, &mut self.frames)
    }

    /// # Errors
    /// See [`PageTableManager::unmap`].
    pub fn unmap(&mut self, va: VirtualAddress) -> Result<(), VmmError> {
        let kernel = self.paging.kernel_directory();
        self.paging.unmap(kernel, va)
    }

    /// Resolves `va` through the kernel directory.
    pub fn get_physical(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let kernel = self.paging.kernel_directory();
        self.paging.get_physical(kernel, va)
    }

    /// Resolves `va` through whichever directory is loaded.
    pub fn translate(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.paging.translate(va)
    }

    /// # Errors
    /// No frame is left for the directory.
    pub fn create_user_directory(&mut self) -> Result<Directory, VmmError> {
        self.paging.clone_user_from_kernel(&mut self.frames)
    }

    /// # Errors
    /// See [`PageTableManager::map_user_pages`].
    pub fn map_user_pages(
        &mut self,
        dir: Directory,
        start: VirtualAddress,
        size: u32,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        self.paging.map_user_pages(dir, start, size, flags, &mut self.frames)
    }

    /// # Safety
    /// See [`PageTableManager::switch_directory`].
    pub unsafe fn switch_directory(&mut self, dir: Directory) {
        unsafe { self.paging.switch_directory(dir) };
    }

    /// # Errors
    /// See [`KernelHeap::malloc`].
    pub fn malloc(&mut self, size: usize) -> Result<VirtualAddress, HeapError> {
        let (heap, mut space) = self.heap_parts();
        heap.malloc(&mut space, size)
    }

    /// # Errors
    /// See [`KernelHeap::calloc`].
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<VirtualAddress, HeapError> {
        let (heap, mut space) = self.heap_parts();
        heap.calloc(&mut space, count, size)
    }

    /// # Errors
    /// See [`KernelHeap::zalloc`].
    pub fn zalloc(&mut self, size: usize) -> Result<VirtualAddress, HeapError> {
        let (heap, mut space) = self.heap_parts();
        heap.zalloc(&mut space, size)
    }

    /// # Errors
    /// See [`KernelHeap::realloc`].
    pub fn realloc(&mut self, ptr: Option<VirtualAddress>, size: usize) -> Result<Option<VirtualAddress>, HeapError> {
        let (heap, mut space) = self.heap_parts();
        heap.realloc(&mut space, ptr, size)
    }

    /// # Errors
    /// See [`KernelHeap::free`].
    pub fn free(&mut self, ptr: VirtualAddress) -> Result<(), HeapError> {
        let (heap, mut space) = self.heap_parts();
        heap.free(&mut space, ptr)
    }

    /// # Errors
    /// See [`KernelHeap::malloc_aligned`].
    pub fn malloc_aligned(&mut self, size: usize, align: u32) -> Result<VirtualAddress, HeapError> {
        let (heap, mut space) = self.heap_parts();
        heap.malloc_aligned(&mut space, size, align)
    }

    /// # Errors
    /// See [`KernelHeap::page_alloc`].
    pub fn page_alloc(&mut self) -> Result<VirtualAddress, HeapError> {
        let (heap, mut space) = self.heap_parts();
        heap.page_alloc(&mut space)
    }

    /// # Errors
    /// See [`KernelHeap::pages_alloc`].
    pub fn pages_alloc(&mut self, count: usize) -> Result<VirtualAddress, HeapError> {
        let (heap, mut space) = self.heap_parts();
        heap.pages_alloc(&mut space, count)
    }

    /// # Errors
    /// See [`KernelHeap::block_size`].
    pub fn block_size(&mut self, ptr: VirtualAddress) -> Result<usize, HeapError> {
        let (heap, mut space) = self.heap_parts();
        heap.block_size(&mut space, ptr)
    }

    pub fn log_heap(&mut self) {
        let (heap, mut space) = self.heap_parts();
        heap.log_blocks(&mut space);
    }

    /// Bitmap population of the heap, for consistency checks.
    pub fn heap_used_units(&mut self) -> u32 {
        let (heap, mut space) = self.heap_parts();
        heap.count_used_units(&mut space)
    }

    /// Reads through the loaded directory.
    ///
    /// # Safety
    /// `va..va + dst.len()` must be mapped.
    pub unsafe fn read_virt(&mut self, va: VirtualAddress, dst: &mut [u8]) {
        unsafe { self.paging.mmu_mut().read_bytes(va, dst) };
    }

    /// Writes through the loaded directory.
    ///
    /// # Safety
    /// `va..va + src.len()` must be mapped writable and must not hold memory
    /// the manager relies on.
    pub unsafe fn write_virt(&mut self, va: VirtualAddress, src: &[u8]) {
        unsafe { self.paging.mmu_mut().write_bytes(va, src) };
    }

    #[must_use]
    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    #[must_use]
    pub const fn memory_map(&self) -> &PhysicalMemoryMap {
        &self.memory_map
    }

    #[must_use]
    pub const fn bump(&self) -> &EarlyBumpAllocator {
        &self.bump
    }

    #[must_use]
    pub const fn frames(&self) -> &FrameBitmapAllocator<'static> {
        &self.frames
    }

    #[must_use]
    pub const fn paging(&self) -> &PageTableManager<M, Active> {
        &self.paging
    }

    pub const fn paging_mut(&mut self) -> &mut PageTableManager<M, Active> {
        &mut self.paging
    }

    #[must_use]
    pub const fn heap(&self) -> &KernelHeap {
        &self.heap
    }
}
