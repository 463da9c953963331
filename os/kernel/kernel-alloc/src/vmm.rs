//! # Page-Table Manager
//!
//! Owns the kernel page directory and every page table hanging off it, and
//! builds user directories that share the kernel's slots.
//!
//! The manager is typed by its phase:
//!
//! * [`Bootstrap`]: paging is off. Tables come from the early bump allocator
//!   and are written through their physical addresses. Only
//!   [`PageTableManager::map_early`] and friends exist here.
//! * [`Active`]: paging is on. Tables come from a [`FrameAlloc`] and are
//!   touched only through the [`ScratchMapper`]. [`PageTableManager::map`]
//!   and the rest of the runtime surface exist only here, so mapping before
//!   paging is enabled does not compile.
//!
//! [`PageTableManager::activate`] consumes the bootstrap manager and returns
//! the active one.
//!
//! ## Shared slots
//!
//! A user directory starts as a copy of the kernel directory's identity-window
//! slots and of every slot from the kernel's virtual base upwards. The copied
//! entries point at the kernel's own page tables, so a change made through
//! any directory inside those slots is visible in all of them. Everything else
//! starts empty and belongs to the user directory alone.
//!
//! ```text
//! slot 0 ..identity_end      shared  (supervisor-only identity window)
//! identity_end..kernel_start private (user space)
//! kernel_start..1024         shared  (kernel image, heap, scratch)
//! ```

use crate::bootmem::{BumpError, EarlyBumpAllocator};
use crate::scratch::{ScratchError, ScratchMapper, identity};
use core::fmt;
use core::marker::PhantomData;
use kernel_info::boot::KernelImage;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress};
use kernel_vmem::{
    DirIndex, ENTRIES_PER_TABLE, FrameAlloc, Mmu, PageDirectory, PageEntryBits, PageTable,
    PdEntry, PdEntryKind, PtEntry, TABLE_SPAN, TableIndex, align_up,
};
use log::{debug, info, trace};

const PAGE: u32 = 4096;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("no physical frame available for a page table or page")]
    OutOfFrames,
    #[error("{0} is covered by a 4 MiB directory entry")]
    LargePage(VirtualAddress),
    #[error("early page table at {0} is outside the identity window")]
    OutsideIdentityWindow(PhysicalAddress),
    #[error("{0} lies in the scratch mapping's directory slot")]
    ReservedAddress(VirtualAddress),
    #[error("{0} lies in a directory slot shared with the kernel")]
    SharedKernelSlot(VirtualAddress),
    #[error("paging is already enabled")]
    PagingAlreadyEnabled,
    #[error("early page-table allocation failed: {0}")]
    Bump(#[from] BumpError),
    #[error(transparent)]
    Scratch(#[from] ScratchError),
}

/// Which side of the paging switch a manager is on.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    Bootstrap,
    Active,
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Bootstrap {}
    impl Sealed for super::Active {}
}

/// Type-level [`Phase`].
pub trait PagingPhase: sealed::Sealed {
    const PHASE: Phase;
}

/// Paging disabled; tables are reached by physical address.
pub enum Bootstrap {}

/// Paging enabled; tables are reached through the scratch mapping.
pub enum Active {}

impl PagingPhase for Bootstrap {
    const PHASE: Phase = Phase::Bootstrap;
}

impl PagingPhase for Active {
    const PHASE: Phase = Phase::Active;
}

/// Handle to a page directory owned by a [`PageTableManager`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Directory {
    frame: PhysicalPage<Size4K>,
    user: bool,
}

impl Directory {
    const fn kernel(frame: PhysicalPage<Size4K>) -> Self {
        Self { frame, user: false }
    }

    const fn user(frame: PhysicalPage<Size4K>) -> Self {
        Self { frame, user: true }
    }

    #[must_use]
    pub const fn frame(self) -> PhysicalPage<Size4K> {
        self.frame
    }

    /// The value CR3 is loaded with.
    #[must_use]
    pub const fn phys(self) -> PhysicalAddress {
        self.frame.base()
    }

    #[must_use]
    pub const fn is_user(self) -> bool {
        self.user
    }
}

impl fmt::Display for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.user { "user" } else { "kernel" };
        write!(f, "{kind} PD @ {}", self.frame.base())
    }
}

/// Layout the bootstrap phase establishes.
#[derive(Copy, Clone, Debug)]
pub struct PagingConfig {
    /// `[0, identity_limit)` is mapped VA == PA.
    pub identity_limit: u32,
    /// Mapped at its link address on top of the identity window.
    pub kernel: KernelImage,
    pub scratch_va: VirtualAddress,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct SharedSlots {
    identity_end: usize,
    kernel_start: usize,
}

impl SharedSlots {
    const fn new(config: &PagingConfig) -> Self {
        Self {
            identity_end: config.identity_limit.div_ceil(TABLE_SPAN) as usize,
            kernel_start: DirIndex::from(config.kernel.virt_start).as_usize(),
        }
    }

    const fn contains(self, idx: DirIndex) -> bool {
        idx.as_usize() < self.identity_end || idx.as_usize() >= self.kernel_start
    }
}

/// Where a missing page table comes from.
enum TableSource<'a> {
    Early(&'a mut EarlyBumpAllocator),
    Frames(&'a mut dyn FrameAlloc),
}

/// Owner of the kernel directory, its page tables and the scratch mapping.
pub struct PageTableManager<M: Mmu, P: PagingPhase> {
    mmu: M,
    scratch: ScratchMapper,
    kernel: Directory,
    current: Directory,
    identity_limit: u32,
    shared: SharedSlots,
    _phase: PhantomData<P>,
}

impl<M: Mmu, P: PagingPhase> PageTableManager<M, P> {
    #[must_use]
    pub const fn phase(&self) -> Phase {
        P::PHASE
    }

    #[must_use]
    pub const fn kernel_directory(&self) -> Directory {
        self.kernel
    }

    #[must_use]
    pub const fn current_directory(&self) -> Directory {
        self.current
    }

    #[must_use]
    pub const fn identity_limit(&self) -> u32 {
        self.identity_limit
    }

    #[must_use]
    pub const fn scratch(&self) -> &ScratchMapper {
        &self.scratch
    }

    #[must_use]
    pub const fn mmu(&self) -> &M {
        &self.mmu
    }

    pub const fn mmu_mut(&mut self) -> &mut M {
        &mut self.mmu
    }

    /// Whether `va` falls in a slot that `dir` shares with the kernel
    /// directory. Always `false` for the kernel directory itself.
    #[must_use]
    pub const fn is_shared_kernel_slot(&self, dir: Directory, va: VirtualAddress) -> bool {
        dir.is_user() && self.shared.contains(DirIndex::from(va))
    }

    /// Resolves `va` through `dir`, including the in-page offset.
    pub fn get_physical(&mut self, dir: Directory, va: VirtualAddress) -> Option<PhysicalAddress> {
        match self.directory_entry(dir, DirIndex::from(va)).kind() {
            PdEntryKind::Absent => None,
            PdEntryKind::Large(flags) => {
                let base = flags.physical_address().as_u32() & !(Size4M::SIZE - 1);
                Some(PhysicalAddress::new(base | (va.as_u32() & (Size4M::SIZE - 1))))
            }
            PdEntryKind::Table(table, _) => {
                let entry = self.with_table(table, |t| t.get(TableIndex::from(va)));
                let (page, _) = entry.page_4k()?;
                Some(page.join(va.offset::<Size4K>()))
            }
        }
    }

    fn directory_entry(&mut self, dir: Directory, idx: DirIndex) -> PdEntry {
        self.with_directory(dir, |pd| pd.get(idx))
    }

    fn with_directory<R>(&mut self, dir: Directory, f: impl FnOnce(&mut PageDirectory) -> R) -> R {
        if dir.is_user() {
            self.scratch.with_page(&mut self.mmu, dir.frame, f)
        } else {
            // The kernel directory lives below the identity limit.
            f(unsafe { identity::<PageDirectory, M>(&mut self.mmu, dir.frame) })
        }
    }

    fn with_table<R>(&mut self, table: PhysicalPage<Size4K>, f: impl FnOnce(&mut PageTable) -> R) -> R {
        match P::PHASE {
            Phase::Bootstrap => f(unsafe { identity::<PageTable, M>(&mut self.mmu, table) }),
            Phase::Active => self.scratch.with_page(&mut self.mmu, table, f),
        }
    }

    /// Returns the page table covering `va` in `dir`, creating and installing
    /// an empty one if the slot is absent.
    ///
    /// An existing directory entry gains the `writable`/`user` bits `leaf`
    /// asks for, since the effective permission is the intersection of both
    /// levels.
    fn ensure_table_for(
        &mut self,
        dir: Directory,
        va: VirtualAddress,
        leaf: PageEntryBits,
        source: TableSource<'_>,
    ) -> Result<PhysicalPage<Size4K>, VmmError> {
        let idx = DirIndex::from(va);
        match self.directory_entry(dir, idx).kind() {
            PdEntryKind::Table(table, flags) => {
                let wanted = flags
                    .with_writable(flags.writable() || leaf.writable())
                    .with_user_access(flags.user_access() || leaf.user_access());
                if wanted != flags {
                    self.with_directory(dir, |pd| pd.set(idx, PdEntry::make_table(table, wanted.flags_only())));
                }
                Ok(table)
            }
            PdEntryKind::Large(_) => Err(VmmError::LargePage(va)),
            PdEntryKind::Absent => {
                let table = match source {
                    TableSource::Early(bump) => {
                        let table = bump.alloc_page()?;
                        if table.base().as_u64() + u64::from(PAGE) > u64::from(self.identity_limit) {
                            return Err(VmmError::OutsideIdentityWindow(table.base()));
                        }
                        table
                    }
                    TableSource::Frames(frames) => frames.alloc_4k().ok_or(VmmError::OutOfFrames)?,
                };
                self.with_table(table, PageTable::clear);

                let flags = PageEntryBits::new()
                    .with_writable(true)
                    .with_user_access(leaf.user_access());
                self.with_directory(dir, |pd| pd.set(idx, PdEntry::make_table(table, flags)));
                trace!("new page table {table} for slot {} of {dir}", idx.as_usize());
                Ok(table)
            }
        }
    }

    fn check_mappable(&self, va: VirtualAddress) -> Result<(), VmmError> {
        if DirIndex::from(va) == DirIndex::from(self.scratch.virtual_address()) {
            return Err(VmmError::ReservedAddress(va));
        }
        Ok(())
    }
}

impl<M: Mmu> PageTableManager<M, Bootstrap> {
    /// Creates the kernel directory and the scratch mapping.
    ///
    /// # Safety
    /// Nothing else may use the memory the bump allocator hands out, and
    /// `mmu` must reach physical memory directly.
    ///
    /// # Errors
    /// Paging is already on, the bump allocator is exhausted, or it returns
    /// memory above the identity limit.
    pub unsafe fn new(
        mut mmu: M,
        bump: &mut EarlyBumpAllocator,
        config: &PagingConfig,
    ) -> Result<Self, VmmError> {
        if mmu.paging_enabled() {
            return Err(VmmError::PagingAlreadyEnabled);
        }

        let kernel = Self::create_directory(&mut mmu, bump, config.identity_limit)?;
        let scratch = unsafe {
            ScratchMapper::init(
                &mut mmu,
                kernel.frame,
                bump,
                config.scratch_va,
                config.identity_limit,
            )?
        };

        Ok(Self {
            mmu,
            scratch,
            kernel,
            current: kernel,
            identity_limit: config.identity_limit,
            shared: SharedSlots::new(config),
            _phase: PhantomData,
        })
    }

    fn create_directory(
        mmu: &mut M,
        bump: &mut EarlyBumpAllocator,
        identity_limit: u32,
    ) -> Result<Directory, VmmError> {
        let frame = bump.alloc_page()?;
        if frame.base().as_u64() + u64::from(PAGE) > u64::from(identity_limit) {
            return Err(VmmError::OutsideIdentityWindow(frame.base()));
        }
        unsafe { identity::<PageDirectory, M>(mmu, frame) }.clear();
        Ok(Directory::kernel(frame))
    }

    /// Installs one 4 KiB kernel mapping while paging is still off.
    ///
    /// # Errors
    /// `va` is in the scratch slot or under a large page, or the early
    /// allocator cannot provide a page table.
    pub fn map_early(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
        bump: &mut EarlyBumpAllocator,
    ) -> Result<(), VmmError> {
        let va = va.align_down::<Size4K>();
        self.check_mappable(va)?;
        let table = self.ensure_table_for(self.kernel, va, flags, TableSource::Early(bump))?;
        self.with_table(table, |t| t.set(TableIndex::from(va), PtEntry::make_4k(pa.page(), flags)));
        Ok(())
    }

    /// Maps `[0, identity_limit)` VA == PA, supervisor read/write.
    ///
    /// # Errors
    /// See [`PageTableManager::map_early`].
    pub fn identity_map(&mut self, bump: &mut EarlyBumpAllocator) -> Result<(), VmmError> {
        let pages = self.identity_limit.div_ceil(PAGE);
        for n in 0..pages {
            let addr = n * PAGE;
            self.map_early(
                VirtualAddress::new(addr),
                PhysicalAddress::new(addr),
                PageEntryBits::new_kernel_rw(),
                bump,
            )?;
        }
        debug!("identity window: [0, {:#010x})", self.identity_limit);
        Ok(())
    }

    /// Maps the kernel's physical image at its link address.
    ///
    /// # Errors
    /// See [`PageTableManager::map_early`].
    pub fn map_kernel_image(
        &mut self,
        image: &KernelImage,
        bump: &mut EarlyBumpAllocator,
    ) -> Result<(), VmmError> {
        let va = image.virt_start.align_down::<Size4K>();
        let pa = image.phys_start.page::<Size4K>().base();
        let pages = (image.size() + (image.phys_start.as_u32() - pa.as_u32())).div_ceil(PAGE);
        for n in 0..pages {
            self.map_early(
                va + n * PAGE,
                pa + n * PAGE,
                PageEntryBits::new_kernel_rw(),
                bump,
            )?;
        }
        debug!(
            "kernel image: {} -> {} ({pages} pages)",
            image.virt_start, image.phys_start
        );
        Ok(())
    }

    /// Loads the kernel directory and switches paging on.
    ///
    /// # Safety
    /// The code, stack and data the caller keeps using must be covered by the
    /// identity window or the kernel image mapping.
    #[must_use]
    pub unsafe fn activate(mut self) -> PageTableManager<M, Active> {
        unsafe {
            self.mmu.load_directory(self.kernel.phys());
            self.mmu.enable_paging();
        }
        info!("paging enabled with {}", self.kernel);

        PageTableManager {
            mmu: self.mmu,
            scratch: self.scratch,
            kernel: self.kernel,
            current: self.kernel,
            identity_limit: self.identity_limit,
            shared: self.shared,
            _phase: PhantomData,
        }
    }
}

impl<M: Mmu> PageTableManager<M, Active> {
    /// Builds the kernel directory, identity-maps `[0, identity_limit)`, maps
    /// the kernel image high, and enables paging.
    ///
    /// # Safety
    /// As for [`PageTableManager::new`] and [`PageTableManager::activate`].
    ///
    /// # Errors
    /// Any bootstrap mapping fails.
    pub unsafe fn init_minimal(
        mmu: M,
        bump: &mut EarlyBumpAllocator,
        config: &PagingConfig,
    ) -> Result<Self, VmmError> {
        let mut paging = unsafe { PageTableManager::<M, Bootstrap>::new(mmu, bump, config)? };
        paging.identity_map(bump)?;
        paging.map_kernel_image(&config.kernel, bump)?;
        Ok(unsafe { paging.activate() })
    }

    /// Maps the page containing `va` to the frame containing `pa` in `dir`,
    /// creating the page table from `frames` if needed.
    ///
    /// # Errors
    /// `va` is in the scratch slot or under a large page, or no frame is left
    /// for a new page table.
    pub fn map(
        &mut self,
        dir: Directory,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
        frames: &mut dyn FrameAlloc,
    ) -> Result<(), VmmError> {
        let va = va.align_down::<Size4K>();
        self.check_mappable(va)?;
        let table = self.ensure_table_for(dir, va, flags, TableSource::Frames(frames))?;
        self.with_table(table, |t| t.set(TableIndex::from(va), PtEntry::make_4k(pa.page(), flags)));
        self.mmu.invalidate_page(va);
        trace!("map {va} -> {pa} in {dir}");
        Ok(())
    }

    /// Removes the mapping of the page containing `va`. Unmapping something
    /// that was never mapped succeeds.
    ///
    /// # Errors
    /// `va` is in the scratch slot or under a large page.
    pub fn unmap(&mut self, dir: Directory, va: VirtualAddress) -> Result<(), VmmError> {
        let va = va.align_down::<Size4K>();
        self.check_mappable(va)?;
        match self.directory_entry(dir, DirIndex::from(va)).kind() {
            PdEntryKind::Absent => Ok(()),
            PdEntryKind::Large(_) => Err(VmmError::LargePage(va)),
            PdEntryKind::Table(table, _) => {
                self.with_table(table, |t| t.set(TableIndex::from(va), PtEntry::zero()));
                self.mmu.invalidate_page(va);
                if self.is_shared_kernel_slot(dir, va) {
                    debug!("unmapped {va} through {dir}; the table is shared with the kernel");
                }
                Ok(())
            }
        }
    }

    /// Walks the currently loaded directory.
    pub fn translate(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.get_physical(self.current, va)
    }

    /// Makes `dir` current and loads it into CR3.
    ///
    /// # Safety
    /// `dir` must come from this manager and map everything the caller keeps
    /// using. Directories from [`PageTableManager::clone_user_from_kernel`]
    /// share the identity window and the kernel half, so they qualify.
    pub unsafe fn switch_directory(&mut self, dir: Directory) {
        unsafe { self.mmu.load_directory(dir.phys()) };
        self.current = dir;
        debug!("switched to {dir}");
    }

    /// Creates a user directory whose identity-window and kernel-half slots
    /// alias the kernel directory's page tables.
    ///
    /// # Errors
    /// No frame is available for the directory.
    pub fn clone_user_from_kernel(&mut self, frames: &mut dyn FrameAlloc) -> Result<Directory, VmmError> {
        let frame = frames.alloc_4k().ok_or(VmmError::OutOfFrames)?;
        let kernel_pd = unsafe { identity::<PageDirectory, M>(&mut self.mmu, self.kernel.frame) };
        let shared = self.shared;
        self.scratch.with_page(&mut self.mmu, frame, |pd: &mut PageDirectory| {
            pd.clear();
            pd.share_slots_from(kernel_pd, 0..shared.identity_end);
            pd.share_slots_from(kernel_pd, shared.kernel_start..ENTRIES_PER_TABLE);
        });

        let dir = Directory::user(frame);
        debug!("created {dir}");
        Ok(dir)
    }

    /// Backs `[start, start + size)` in `dir` with fresh zeroed frames mapped
    /// with `flags | USER | PRESENT`.
    ///
    /// Pages mapped before a failure stay mapped. The frame for the page
    /// that failed goes back to `frames`.
    ///
    /// # Errors
    /// The range touches a slot shared with the kernel, or frames run out.
    pub fn map_user_pages(
        &mut self,
        dir: Directory,
        start: VirtualAddress,
        size: u32,
        flags: PageEntryBits,
        frames: &mut dyn FrameAlloc,
    ) -> Result<(), VmmError> {
        let first = start.align_down::<Size4K>().as_u64();
        let end = align_up(start.as_u64() + u64::from(size), u64::from(PAGE));
        let flags = flags.with_user_access(true).with_present(true);

        let mut addr = first;
        while addr < end {
            #[allow(clippy::cast_possible_truncation)]
            let va = VirtualAddress::new(addr as u32);
            if self.shared.contains(DirIndex::from(va)) {
                return Err(VmmError::SharedKernelSlot(va));
            }
            let frame = frames.alloc_4k().ok_or(VmmError::OutOfFrames)?;
            self.zero_frame(frame);
            if let Err(e) = self.map(dir, va, frame.base(), flags, frames) {
                frames.free_4k(frame);
                return Err(e);
            }
            addr += u64::from(PAGE);
        }
        Ok(())
    }

    /// Makes sure every 4 MiB slot overlapping `[start, start + len)` in `dir`
    /// has a page table.
    ///
    /// Boot does this for the heap so the tables exist before any user
    /// directory copies the kernel half.
    ///
    /// # Errors
    /// No frame is left for a table, or a slot holds a large page.
    pub fn prepare_tables(
        &mut self,
        dir: Directory,
        start: VirtualAddress,
        len: u32,
        frames: &mut dyn FrameAlloc,
    ) -> Result<(), VmmError> {
        if len == 0 {
            return Ok(());
        }
        let first = DirIndex::from(start).as_usize();
        let last = DirIndex::from(VirtualAddress::new(start.as_u32().saturating_add(len - 1))).as_usize();
        for slot in first..=last {
            #[allow(clippy::cast_possible_truncation)]
            let va = VirtualAddress::new((slot as u32) << Size4M::SHIFT);
            self.check_mappable(va)?;
            self.ensure_table_for(dir, va, PageEntryBits::new_kernel_rw(), TableSource::Frames(&mut *frames))?;
        }
        Ok(())
    }

    /// Zero-fills a frame through the scratch mapping.
    pub fn zero_frame(&mut self, frame: PhysicalPage<Size4K>) {
        self.scratch
            .with_page(&mut self.mmu, frame, |bytes: &mut [u8; PAGE as usize]| bytes.fill(0));
    }

    /// Runs `f` over the contents of `frame`, mapped through the scratch page.
    pub fn with_frame<T, R>(&mut self, frame: PhysicalPage<Size4K>, f: impl FnOnce(&mut T) -> R) -> R {
        self.scratch.with_page(&mut self.mmu, frame, f)
    }

    /// Points the scratch page at `pa` and returns its address. Any earlier
    /// scratch mapping is replaced.
    pub fn scratch_map(&mut self, pa: PhysicalAddress) -> VirtualAddress {
        self.scratch.map(&mut self.mmu, pa)
    }

    pub fn scratch_unmap(&mut self) {
        self.scratch.unmap(&mut self.mmu);
    }
}
