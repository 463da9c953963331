//! # Kernel Boot Information

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

use crate::memory::{KERNEL_PHYS_BASE, KERNEL_VIRT_BASE};

/// Size of the table header that precedes the e820 entries.
pub const E820_HEADER_BYTES: usize = 16;

/// Smallest entry the firmware may report: base, length, type.
pub const E820_ENTRY_MIN_BYTES: usize = 20;

/// Entry size that carries the ACPI 3.0 extended attributes dword.
pub const E820_ENTRY_ACPI_BYTES: usize = 24;

/// Header of the e820 table the real-mode loader leaves behind.
///
/// It is followed directly by `count` entries of `entry_stride` bytes each.
/// Every entry starts with `base: u64, length: u64, type: u32` and, when the
/// stride allows, an extended-attributes `u32`. All fields are little endian.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct E820TableHeader {
    pub count: u16,
    pub entry_stride: u16,
    pub reserved: [u8; 12],
}

impl E820TableHeader {
    #[must_use]
    pub const fn new(count: u16, entry_stride: u16) -> Self {
        Self {
            count,
            entry_stride,
            reserved: [0; 12],
        }
    }

    /// Decodes a header from its little-endian byte image.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; E820_HEADER_BYTES]) -> Self {
        let mut reserved = [0; 12];
        reserved.copy_from_slice(&bytes[4..]);
        Self {
            count: u16::from_le_bytes([bytes[0], bytes[1]]),
            entry_stride: u16::from_le_bytes([bytes[2], bytes[3]]),
            reserved,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; E820_HEADER_BYTES] {
        let mut out = [0; E820_HEADER_BYTES];
        out[0..2].copy_from_slice(&self.count.to_le_bytes());
        out[2..4].copy_from_slice(&self.entry_stride.to_le_bytes());
        out[4..].copy_from_slice(&self.reserved);
        out
    }

    /// Whether entries of this stride carry the extended-attributes dword.
    #[must_use]
    pub const fn has_acpi_attributes(&self) -> bool {
        self.entry_stride as usize >= E820_ENTRY_ACPI_BYTES
    }
}

/// Bounds of the loaded kernel image, in both address spaces.
///
/// The image is linked at [`KERNEL_VIRT_BASE`] and loaded at
/// [`KERNEL_PHYS_BASE`]; the two ranges always have the same length.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelImage {
    pub virt_start: VirtualAddress,
    pub virt_end: VirtualAddress,
    pub phys_start: PhysicalAddress,
    pub phys_end: PhysicalAddress,
}

impl KernelImage {
    /// An image of `size` bytes placed at the default load and link addresses.
    #[must_use]
    pub const fn with_size(size: u32) -> Self {
        Self {
            virt_start: VirtualAddress::new(KERNEL_VIRT_BASE),
            virt_end: VirtualAddress::new(KERNEL_VIRT_BASE + size),
            phys_start: PhysicalAddress::new(KERNEL_PHYS_BASE),
            phys_end: PhysicalAddress::new(KERNEL_PHYS_BASE + size),
        }
    }

    /// Reads the bounds exported by the kernel linker script.
    #[cfg(target_os = "none")]
    #[allow(unsafe_code, clippy::cast_possible_truncation)]
    #[must_use]
    pub fn from_linker_symbols() -> Self {
        unsafe extern "C" {
            static _kernel_virt_start: u8;
            static _kernel_virt_end: u8;
            static _kernel_phys_start: u8;
            static _kernel_phys_end: u8;
        }

        // Only the symbol addresses are meaningful; nothing is read through them.
        let addr = |p: *const u8| p.addr() as u32;
        Self {
            virt_start: VirtualAddress::new(addr(&raw const _kernel_virt_start)),
            virt_end: VirtualAddress::new(addr(&raw const _kernel_virt_end)),
            phys_start: PhysicalAddress::new(addr(&raw const _kernel_phys_start)),
            phys_end: PhysicalAddress::new(addr(&raw const _kernel_phys_end)),
        }
    }

    #[must_use]
    pub const fn size(&self) -> u32 {
        self.phys_end.as_u32() - self.phys_start.as_u32()
    }

    /// Physical footprint as a half-open byte range.
    #[must_use]
    pub const fn phys_range(&self) -> core::ops::Range<u64> {
        self.phys_start.as_u64()..self.phys_end.as_u64()
    }

    #[must_use]
    pub const fn contains_virt(&self, va: VirtualAddress) -> bool {
        va.as_u32() >= self.virt_start.as_u32() && va.as_u32() < self.virt_end.as_u32()
    }

    /// Translates a kernel-image address; anything outside the image is
    /// treated as already physical (identity window).
    #[must_use]
    pub const fn virt_to_phys(&self, va: VirtualAddress) -> PhysicalAddress {
        if self.contains_virt(va) {
            PhysicalAddress::new(va.as_u32() - self.virt_start.as_u32() + self.phys_start.as_u32())
        } else {
            PhysicalAddress::new(va.as_u32())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bytes_round_trip() {
        let header = E820TableHeader::new(3, 24);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..4], &[3, 0, 24, 0]);
        assert_eq!(E820TableHeader::from_bytes(&bytes), header);
        assert!(header.has_acpi_attributes());
        assert!(!E820TableHeader::new(3, 20).has_acpi_attributes());
    }

    #[test]
    fn kernel_image_translation() {
        let image = KernelImage::with_size(0x10_0000);
        assert_eq!(image.phys_range(), 0x10_0000..0x20_0000);
        assert_eq!(
            image.virt_to_phys(VirtualAddress::new(0xC000_1234)),
            PhysicalAddress::new(0x0010_1234)
        );
        // outside the image: identity
        assert_eq!(
            image.virt_to_phys(VirtualAddress::new(0x0030_0000)),
            PhysicalAddress::new(0x0030_0000)
        );
        assert!(!image.contains_virt(VirtualAddress::new(0xC010_0000)));
    }
}
