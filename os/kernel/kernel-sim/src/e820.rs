use kernel_info::boot::{E820_ENTRY_ACPI_BYTES, E820TableHeader};

/// Firmware type codes.
pub mod kind {
    pub const USABLE: u32 = 1;
    pub const RESERVED: u32 = 2;
    pub const ACPI_RECLAIMABLE: u32 = 3;
    pub const ACPI_NVS: u32 = 4;
    pub const BAD: u32 = 5;
}

/// Builds an e820 handoff blob: the 16-byte header followed by the entries.
#[derive(Debug, Clone)]
pub struct E820Builder {
    stride: u16,
    entries: Vec<(u64, u64, u32)>,
    declared: Option<u16>,
}

impl Default for E820Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl E820Builder {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new() -> Self {
        Self {
            stride: E820_ENTRY_ACPI_BYTES as u16,
            entries: Vec::new(),
            declared: None,
        }
    }

    /// Entry size in bytes. Anything past the 20 meaningful bytes is padded
    /// with the ACPI attribute dword (1, "enabled") and then zeros.
    #[must_use]
    pub fn with_stride(mut self, stride: u16) -> Self {
        self.stride = stride;
        self
    }

    /// Overrides the header's entry count, e.g. to claim more entries than
    /// the blob holds.
    #[must_use]
    pub fn with_declared_count(mut self, count: u16) -> Self {
        self.declared = Some(count);
        self
    }

    #[must_use]
    pub fn region(mut self, base: u64, length: u64, kind: u32) -> Self {
        self.entries.push((base, length, kind));
        self
    }

    #[must_use]
    pub fn usable(self, base: u64, length: u64) -> Self {
        self.region(base, length, kind::USABLE)
    }

    #[must_use]
    pub fn reserved(self, base: u64, length: u64) -> Self {
        self.region(base, length, kind::RESERVED)
    }

    /// The layout of a small PC: conventional memory, the EBDA hole, the
    /// BIOS area, and `ram_bytes` of extended memory from 1 MiB.
    #[must_use]
    pub fn pc(ram_bytes: u64) -> Self {
        Self::new()
            .usable(0, 0x9_FC00)
            .reserved(0x9_FC00, 0x400)
            .reserved(0xF_0000, 0x1_0000)
            .usable(0x10_0000, ram_bytes - 0x10_0000)
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(&self) -> Vec<u8> {
        let count = self.declared.unwrap_or(self.entries.len() as u16);
        let mut blob = E820TableHeader::new(count, self.stride).to_bytes().to_vec();
        for &(base, length, kind) in &self.entries {
            let mut entry = Vec::with_capacity(usize::from(self.stride));
            entry.extend_from_slice(&base.to_le_bytes());
            entry.extend_from_slice(&length.to_le_bytes());
            entry.extend_from_slice(&kind.to_le_bytes());
            entry.extend_from_slice(&1u32.to_le_bytes());
            entry.resize(usize::from(self.stride), 0);
            blob.extend_from_slice(&entry);
        }
        blob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_the_handoff_format() {
        let blob = E820Builder::new().usable(0x1000, 0x2000).reserved(0x3000, 0x10).build();
        assert_eq!(blob.len(), 16 + 2 * 24);
        assert_eq!(&blob[0..4], &[2, 0, 24, 0]);
        assert_eq!(&blob[16..24], &0x1000u64.to_le_bytes());
        assert_eq!(&blob[24..32], &0x2000u64.to_le_bytes());
        assert_eq!(&blob[32..36], &1u32.to_le_bytes());
        assert_eq!(&blob[40 + 16..40 + 20], &2u32.to_le_bytes());
    }

    #[test]
    fn short_stride_drops_the_attribute_word() {
        let blob = E820Builder::new().with_stride(20).usable(0, 0x1000).build();
        assert_eq!(blob.len(), 16 + 20);
    }
}
