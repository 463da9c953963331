//! # Physical Memory Map
//!
//! The bootloader leaves an e820-style table behind: a 16-byte header
//! (`count`, `entry_stride`) followed by `count` little-endian records of
//! `entry_stride` bytes each.
//!
//! ```text
//! +0  base    u64
//! +8  length  u64
//! +16 kind    u32
//! +20 acpi    u32   (only when entry_stride >= 24)
//! ```
//!
//! [`E820Table`] is a bounds-checked view over that blob. [`PhysicalMemoryMap`]
//! copies at most [`MAX_E820_ENTRIES`] records out of it into a fixed array,
//! in firmware order, and answers the usability queries the frame allocator
//! needs.

use core::fmt;
use kernel_info::boot::{
    E820_ENTRY_ACPI_BYTES, E820_ENTRY_MIN_BYTES, E820_HEADER_BYTES, E820TableHeader,
};
use kernel_info::memory::{MAX_E820_ENTRIES, MAX_PHYSICAL_BYTES};
use log::{debug, info, warn};

/// Classification of a physical extent.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum RegionKind {
    Usable = 1,
    #[default]
    Reserved = 2,
    AcpiReclaimable = 3,
    AcpiNvs = 4,
    Bad = 5,
}

impl RegionKind {
    /// Decodes the firmware type word. Anything unknown is treated as reserved.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Usable,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::Bad,
            _ => Self::Reserved,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Usable => "usable",
            Self::Reserved => "reserved",
            Self::AcpiReclaimable => "ACPI reclaimable",
            Self::AcpiNvs => "ACPI NVS",
            Self::Bad => "bad",
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One physical range as reported by firmware.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PhysicalExtent {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
    /// Extended attribute word; zero for 20-byte records.
    pub acpi_attributes: u32,
}

impl PhysicalExtent {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: RegionKind) -> Self {
        Self {
            base,
            length,
            kind,
            acpi_attributes: 0,
        }
    }

    /// Exclusive end, saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, RegionKind::Usable)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryMapError {
    #[error("memory map blob is {0} bytes, shorter than its header")]
    TruncatedHeader(usize),
    #[error("memory map entry stride {0} is below the minimum record size")]
    InvalidStride(u16),
}

/// Bounds-checked view over the bootloader's memory map blob.
#[derive(Copy, Clone, Debug)]
pub struct E820Table<'a> {
    header: E820TableHeader,
    entries: &'a [u8],
}

impl<'a> E820Table<'a> {
    /// Validates the header and keeps only the entry bytes that are actually present.
    ///
    /// # Errors
    /// The blob is shorter than the header, or the stride cannot hold a record.
    pub fn parse(blob: &'a [u8]) -> Result<Self, MemoryMapError> {
        let Some((head, rest)) = blob.split_first_chunk::<E820_HEADER_BYTES>() else {
            return Err(MemoryMapError::TruncatedHeader(blob.len()));
        };
        let header = E820TableHeader::from_bytes(head);
        let stride = usize::from(header.entry_stride);
        if stride < E820_ENTRY_MIN_BYTES {
            return Err(MemoryMapError::InvalidStride(header.entry_stride));
        }

        let claimed = usize::from(header.count) * stride;
        let entries = if claimed > rest.len() {
            warn!(
                "memory map claims {} entries but only {} bytes follow the header",
                header.count,
                rest.len()
            );
            &rest[..rest.len() - rest.len() % stride]
        } else {
            &rest[..claimed]
        };

        Ok(Self { header, entries })
    }

    /// Reads the table from the bootloader handoff address.
    ///
    /// # Safety
    /// `ptr` must point at a readable header followed by `count * entry_stride`
    /// readable bytes, valid for `'a`.
    ///
    /// # Errors
    /// As for [`E820Table::parse`].
    pub unsafe fn from_raw(ptr: *const u8) -> Result<Self, MemoryMapError> {
        let head = unsafe { &*ptr.cast::<[u8; E820_HEADER_BYTES]>() };
        let header = E820TableHeader::from_bytes(head);
        let len = E820_HEADER_BYTES + usize::from(header.count) * usize::from(header.entry_stride);
        let blob = unsafe { core::slice::from_raw_parts(ptr, len) };
        Self::parse(blob)
    }

    #[must_use]
    pub const fn header(&self) -> &E820TableHeader {
        &self.header
    }

    /// Number of records the header announces.
    #[must_use]
    pub const fn reported_count(&self) -> usize {
        self.header.count as usize
    }

    /// Number of records actually present in the blob.
    #[must_use]
    pub const fn available_count(&self) -> usize {
        self.entries.len() / self.header.entry_stride as usize
    }

    /// Decodes record `index`, if it is present.
    #[must_use]
    pub fn entry(&self, index: usize) -> Option<PhysicalExtent> {
        let stride = usize::from(self.header.entry_stride);
        let start = index.checked_mul(stride)?;
        let raw = self.entries.get(start..start + stride)?;

        let acpi_attributes = if stride >= E820_ENTRY_ACPI_BYTES {
            le_u32(raw, 20)
        } else {
            0
        };
        Some(PhysicalExtent {
            base: le_u64(raw, 0),
            length: le_u64(raw, 8),
            kind: RegionKind::from_raw(le_u32(raw, 16)),
            acpi_attributes,
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = PhysicalExtent> + '_ {
        (0..self.available_count()).filter_map(|i| self.entry(i))
    }
}

fn le_u64(raw: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&raw[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn le_u32(raw: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&raw[at..at + 4]);
    u32::from_le_bytes(buf)
}

/// Normalized physical memory map with a fixed capacity.
#[derive(Clone)]
pub struct PhysicalMemoryMap {
    extents: [PhysicalExtent; MAX_E820_ENTRIES],
    count: usize,
    reported: usize,
}

impl PhysicalMemoryMap {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            extents: [PhysicalExtent::new(0, 0, RegionKind::Reserved); MAX_E820_ENTRIES],
            count: 0,
            reported: 0,
        }
    }

    /// Copies the table's records in firmware order, keeping at most
    /// [`MAX_E820_ENTRIES`]. Anything past capacity is counted and dropped.
    #[must_use]
    pub fn collect(table: &E820Table<'_>) -> Self {
        let mut map = Self::empty();
        map.reported = table.reported_count();
        for extent in table.entries() {
            if !map.push(extent) {
                break;
            }
        }

        if map.is_truncated() {
            warn!(
                "memory map truncated: kept {} of {} regions",
                map.count, map.reported
            );
        }
        info!(
            "memory map: {} regions, {} KiB usable of {} KiB reported",
            map.count,
            map.total_usable_bytes() / 1024,
            map.total_bytes() / 1024
        );
        map
    }

    /// Builds a map from already-decoded extents.
    #[must_use]
    pub fn from_extents(extents: &[PhysicalExtent]) -> Self {
        let mut map = Self::empty();
        map.reported = extents.len();
        for extent in extents {
            if !map.push(*extent) {
                break;
            }
        }
        map
    }

    fn push(&mut self, extent: PhysicalExtent) -> bool {
        if self.count == MAX_E820_ENTRIES {
            return false;
        }
        self.extents[self.count] = extent;
        self.count += 1;
        true
    }

    #[must_use]
    pub const fn region_count(&self) -> usize {
        self.count
    }

    /// Records announced by firmware, including any that did not fit.
    #[must_use]
    pub const fn reported_count(&self) -> usize {
        self.reported
    }

    #[must_use]
    pub const fn is_truncated(&self) -> bool {
        self.reported > self.count
    }

    #[must_use]
    pub fn region_by_index(&self, index: usize) -> Option<&PhysicalExtent> {
        if index < self.count {
            Some(&self.extents[index])
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhysicalExtent> {
        self.extents[..self.count].iter()
    }

    #[must_use]
    pub fn total_usable_bytes(&self) -> u64 {
        self.iter()
            .filter(|e| e.is_usable())
            .fold(0u64, |acc, e| acc.saturating_add(e.length))
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.iter().fold(0u64, |acc, e| acc.saturating_add(e.length))
    }

    /// End of the highest usable extent, capped at the 32-bit physical limit.
    ///
    /// This is the size the frame bitmap has to describe.
    #[must_use]
    pub fn highest_usable_end(&self) -> u64 {
        self.iter()
            .filter(|e| e.is_usable() && e.length > 0)
            .map(PhysicalExtent::end)
            .max()
            .unwrap_or(0)
            .min(MAX_PHYSICAL_BYTES)
    }

    pub fn log_regions(&self) {
        for (i, e) in self.iter().enumerate() {
            debug!(
                "e820[{i:>3}] {:#012x}..{:#012x} ({:>8} KiB) {}",
                e.base,
                e.end(),
                e.length / 1024,
                e.kind
            );
        }
    }
}

impl Default for PhysicalMemoryMap {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for PhysicalMemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalMemoryMap")
            .field("regions", &&self.extents[..self.count])
            .field("reported", &self.reported)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(stride: u16, entries: &[(u64, u64, u32, u32)]) -> Vec<u8> {
        let count = u16::try_from(entries.len()).unwrap();
        let mut out = E820TableHeader::new(count, stride).to_bytes().to_vec();
        for &(base, length, kind, acpi) in entries {
            out.extend_from_slice(&base.to_le_bytes());
            out.extend_from_slice(&length.to_le_bytes());
            out.extend_from_slice(&kind.to_le_bytes());
            if stride >= 24 {
                out.extend_from_slice(&acpi.to_le_bytes());
            }
            out.resize(out.len() + usize::from(stride).saturating_sub(24), 0);
        }
        out
    }

    #[test]
    fn three_region_discovery() {
        let raw = blob(
            24,
            &[
                (0, 0x9FC00, 1, 1),
                (0x9FC00, 0x400, 2, 1),
                (0x10_0000, 0x7EF_0000, 1, 1),
            ],
        );
        let table = E820Table::parse(&raw).unwrap();
        let map = PhysicalMemoryMap::collect(&table);
        assert_eq!(map.region_count(), 3);
        assert_eq!(map.total_usable_bytes(), 0x9FC00 + 0x7EF_0000);
        assert_eq!(map.total_bytes(), 0x9FC00 + 0x400 + 0x7EF_0000);
        assert_eq!(map.highest_usable_end(), 0x7FF_0000);
        assert_eq!(map.region_by_index(1).unwrap().kind, RegionKind::Reserved);
        assert_eq!(map.region_by_index(0).unwrap().acpi_attributes, 1);
    }

    #[test]
    fn region_by_index_is_strict() {
        let map = PhysicalMemoryMap::from_extents(&[PhysicalExtent::new(0, 4096, RegionKind::Usable)]);
        assert!(map.region_by_index(0).is_some());
        assert!(map.region_by_index(1).is_none());
    }

    #[test]
    fn short_records_have_no_acpi_word() {
        let raw = blob(20, &[(0x1000, 0x2000, 1, 0xFFFF), (0x3000, 0x1000, 9, 0)]);
        let table = E820Table::parse(&raw).unwrap();
        let first = table.entry(0).unwrap();
        assert_eq!(first.acpi_attributes, 0);
        assert_eq!(table.entry(1).unwrap().kind, RegionKind::Reserved);
        assert!(table.entry(2).is_none());
    }

    #[test]
    fn unknown_kinds_become_reserved() {
        for raw in [0, 6, 12, u32::MAX] {
            assert_eq!(RegionKind::from_raw(raw), RegionKind::Reserved);
        }
        assert_eq!(RegionKind::from_raw(3), RegionKind::AcpiReclaimable);
    }

    #[test]
    fn rejects_bad_headers() {
        assert_eq!(
            E820Table::parse(&[0u8; 8]).unwrap_err(),
            MemoryMapError::TruncatedHeader(8)
        );
        let raw = E820TableHeader::new(1, 16).to_bytes();
        assert_eq!(
            E820Table::parse(&raw).unwrap_err(),
            MemoryMapError::InvalidStride(16)
        );
    }

    #[test]
    fn missing_tail_records_are_dropped() {
        let mut raw = blob(24, &[(0, 0x1000, 1, 0), (0x1000, 0x1000, 1, 0)]);
        raw.truncate(raw.len() - 10);
        let table = E820Table::parse(&raw).unwrap();
        assert_eq!(table.reported_count(), 2);
        assert_eq!(table.available_count(), 1);
    }

    #[test]
    fn capacity_is_bounded() {
        let entries: Vec<_> = (0..MAX_E820_ENTRIES as u64 + 5)
            .map(|i| (i * 0x1000, 0x1000, 1, 0))
            .collect();
        let raw = blob(24, &entries);
        let map = PhysicalMemoryMap::collect(&E820Table::parse(&raw).unwrap());
        assert_eq!(map.region_count(), MAX_E820_ENTRIES);
        assert_eq!(map.reported_count(), MAX_E820_ENTRIES + 5);
        assert!(map.is_truncated());
    }

    #[test]
    fn highest_usable_end_is_capped() {
        let map = PhysicalMemoryMap::from_extents(&[
            PhysicalExtent::new(0x10_0000, 0x100, RegionKind::Usable),
            PhysicalExtent::new(0xF000_0000, 0x2000_0000, RegionKind::Usable),
            PhysicalExtent::new(0x2_0000_0000, 0x1000, RegionKind::Reserved),
        ]);
        assert_eq!(map.highest_usable_end(), MAX_PHYSICAL_BYTES);
    }
}
