//! # Kernel Memory Core
//!
//! Physical, virtual and heap memory for the 32-bit higher-half kernel, built
//! bottom-up:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  KernelHeap (heap)                                  │
//! │    • malloc / free / realloc over 16-byte units     │
//! │    • grows page by page up to its region maximum    │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ back_page
//! ┌─────────────────▼───────────────────────────────────┐
//! │  PageTableManager (vmm) + ScratchMapper (scratch)   │
//! │    • kernel directory, user directories             │
//! │    • Bootstrap → Active phase as a type parameter   │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ FrameAlloc
//! ┌─────────────────▼───────────────────────────────────┐
//! │  FrameBitmapAllocator (frame_alloc)                 │
//! │    • one bit per 4 KiB frame, seeded from e820      │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ bitmap storage, early tables
//! ┌─────────────────▼───────────────────────────────────┐
//! │  EarlyBumpAllocator (bootmem)                       │
//! │  PhysicalMemoryMap (e820)                           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! [`setup::MemoryManager::boot`] wires the layers together in that order
//! and owns them afterwards.
//!
//! Nothing here touches hardware directly. All control-register, TLB and
//! memory access goes through [`kernel_vmem::Mmu`], so the whole core runs
//! unchanged against a simulated machine in tests.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kernel_alloc::e820::E820Table;
//! use kernel_alloc::setup::{MemoryConfig, MemoryManager};
//! use kernel_info::boot::KernelImage;
//! use kernel_vmem::BareMetalMmu;
//!
//! let table = unsafe { E820Table::from_raw(boot_info_ptr) }?;
//! let config = MemoryConfig::new(KernelImage::from_linker_symbols());
//! let mut memory = unsafe { MemoryManager::boot_or_halt(BareMetalMmu::new(), &table, config) };
//!
//! let buffer = memory.malloc(512)?;
//! memory.free(buffer)?;
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod bootmem;
pub mod e820;
pub mod frame_alloc;
pub mod heap;
pub mod scratch;
pub mod setup;
pub mod vmm;

pub use bootmem::{BumpError, EarlyBumpAllocator};
pub use e820::{E820Table, MemoryMapError, PhysicalExtent, PhysicalMemoryMap, RegionKind};
pub use frame_alloc::{FrameBitmapAllocator, FrameError};
pub use heap::{HeapBackend, HeapError, HeapLayout, KernelHeap};
pub use scratch::{ScratchError, ScratchMapper};
pub use setup::{BootError, KernelSpace, MemoryConfig, MemoryManager};
pub use vmm::{Active, Bootstrap, Directory, PageTableManager, PagingConfig, Phase, VmmError};
