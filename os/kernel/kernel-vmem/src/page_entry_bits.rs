use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// Represents a single 32-bit x86 paging entry in its raw bitfield form.
///
/// Classic (non-PAE) paging uses the same 4-byte layout for page-directory
/// entries (PDE) and page-table entries (PTE); this type models the common
/// superset of both.
///
/// ### Bit layout
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (PTE only) |
/// | 7         | `PS` / `PAT`      | 4 MiB page in a PDE, PAT in a PTE |
/// | 8         | `G`               | Global (PTE only) |
/// | 9–11      | OS available      | Ignored by hardware |
/// | 12–31     | `addr`            | Physical frame bits [31:12] |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::new_kernel_rw().with_physical_address(PhysicalAddress::new(0x0012_3000));
/// assert!(e.present() && e.writable() && !e.user_access());
/// assert_eq!(e.into_bits(), 0x0012_3003);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Supervisor writes ignore this bit unless CR0.WP is set.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    ///
    /// Set to allow user-mode access. For a PDE it gates the whole 4 MiB
    /// span, so user mappings need it at both levels.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on the first write through a PTE.
    pub dirty: bool,

    /// Page Size (PS, bit 7) in a PDE: set for a 4 MiB leaf. Never used here;
    /// a PDE with PS set is treated as foreign.
    pub large_page: bool,

    /// Global (G, bit 8).
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available: u8,

    /// Physical address bits [31:12].
    #[bits(20)]
    phys_addr_bits_31_12: u32,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_31_12(phys.as_u32() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(mut self, phys: PhysicalAddress) -> Self {
        self.set_physical_address(phys);
        self
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_31_12() << 12)
    }

    /// The same entry with the frame bits cleared.
    #[inline]
    #[must_use]
    pub const fn flags_only(self) -> Self {
        self.with_phys_addr_bits_31_12(0)
    }

    /// Present, writable, supervisor-only.
    #[inline]
    #[must_use]
    pub const fn new_kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Present, writable, user-accessible.
    #[inline]
    #[must_use]
    pub const fn new_user_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
    }

    /// Present, read-only, user-accessible.
    #[inline]
    #[must_use]
    pub const fn new_user_ro() -> Self {
        Self::new().with_present(true).with_user_access(true)
    }
}
