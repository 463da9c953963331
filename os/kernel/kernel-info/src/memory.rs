//! # Memory Layout

/// Where the kernel image is loaded in *physical* memory (LMA).
pub const KERNEL_PHYS_BASE: u32 = 0x0010_0000; // 1 MiB

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_VIRT_BASE: u32 = 0xC000_0000;

/// Constant distance between a kernel-image virtual address and its physical address.
pub const KERNEL_OFFSET: u32 = KERNEL_VIRT_BASE - KERNEL_PHYS_BASE;

/// Bytes of low memory mapped VA == PA while paging is switched on. Every
/// structure the early allocator hands out must sit below this limit.
pub const IDENTITY_WINDOW_BYTES: u32 = 64 * 1024 * 1024;

/// Size of the early bump region placed right after the kernel image.
pub const EARLY_REGION_BYTES: u32 = 4 * 1024 * 1024;

/// The single virtual page used to reach arbitrary physical frames.
pub const SCRATCH_VA: u32 = 0xFFC0_0000;

/// Start of the kernel heap's virtual region.
pub const KHEAP_BASE: u32 = 0xD000_0000;

/// Full virtual extent reserved for the kernel heap (metadata and data).
pub const KHEAP_REGION_BYTES: u32 = 16 * 1024 * 1024;

/// Data bytes mapped eagerly when the heap comes up.
pub const KHEAP_INITIAL_BYTES: u32 = 1024 * 1024;

/// Heap allocation granule in bytes.
pub const HEAP_UNIT: u32 = 16;

/// Minimum alignment of every heap block.
pub const HEAP_ALIGNMENT: u32 = 8;

/// Capacity of the physical memory map.
pub const MAX_E820_ENTRIES: usize = 128;

/// Highest physical address space the frame allocator can describe.
pub const MAX_PHYSICAL_BYTES: u64 = 1 << 32;

const _: () = {
    assert!(KERNEL_PHYS_BASE.is_multiple_of(4096));
    assert!(KERNEL_VIRT_BASE.is_multiple_of(4 * 1024 * 1024));
    assert!(IDENTITY_WINDOW_BYTES <= KERNEL_VIRT_BASE);
    assert!(KHEAP_BASE > KERNEL_VIRT_BASE);
    assert!(KHEAP_BASE as u64 + KHEAP_REGION_BYTES as u64 <= SCRATCH_VA as u64);
    assert!(SCRATCH_VA.is_multiple_of(4 * 1024 * 1024));
    assert!(HEAP_UNIT.is_power_of_two() && HEAP_ALIGNMENT.is_power_of_two());
    assert!(KHEAP_INITIAL_BYTES <= KHEAP_REGION_BYTES);
};
