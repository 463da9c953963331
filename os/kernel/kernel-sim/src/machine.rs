use core::ptr::NonNull;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::cr0::Cr0;
use kernel_registers::cr3::Cr3;
use kernel_vmem::{DirIndex, Mmu, PdEntry, PdEntryKind, PtEntry, TableIndex};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::HashMap;

const PAGE: usize = 4096;
const LARGE_OFFSET_MASK: u32 = (1 << 22) - 1;

/// Counters for what the memory core asked of the processor.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct MmuStats {
    pub invalidations: usize,
    pub directory_loads: usize,
    pub page_walks: usize,
    pub tlb_hits: usize,
}

/// RAM, CR0, CR3 and a TLB.
///
/// Accesses that fault (unmapped, or outside RAM) panic with the offending
/// address; a kernel would have triple-faulted.
pub struct SimulatedMachine {
    ram: NonNull<u8>,
    layout: Layout,
    cr0: Cr0,
    cr3: Cr3,
    /// Virtual page number → physical frame number.
    tlb: HashMap<u32, u32>,
    stats: MmuStats,
}

impl SimulatedMachine {
    /// A machine with `ram_bytes` of zeroed RAM starting at physical 0, in
    /// protected mode with paging off.
    ///
    /// # Panics
    /// `ram_bytes` is zero or not page-aligned.
    #[must_use]
    pub fn new(ram_bytes: usize) -> Self {
        assert!(ram_bytes > 0 && ram_bytes % PAGE == 0, "RAM must be whole pages");
        let layout = Layout::from_size_align(ram_bytes, PAGE).expect("RAM layout");
        let ram = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("host allocation for RAM");
        Self {
            ram,
            layout,
            cr0: Cr0::protected_mode(),
            cr3: Cr3::new(),
            tlb: HashMap::new(),
            stats: MmuStats::default(),
        }
    }

    #[must_use]
    pub const fn ram_bytes(&self) -> usize {
        self.layout.size()
    }

    #[must_use]
    pub const fn stats(&self) -> MmuStats {
        self.stats
    }

    #[must_use]
    pub const fn cr0(&self) -> Cr0 {
        self.cr0
    }

    /// Resolves `va` the way an access would: through the TLB first, then a
    /// page walk that fills it. `None` where an access would fault.
    pub fn translate(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        if !self.cr0.pg_paging() {
            return Some(PhysicalAddress::new(va.as_u32()));
        }

        let vpn = va.as_u32() >> 12;
        let offset = va.as_u32() & 0xFFF;
        if let Some(&pfn) = self.tlb.get(&vpn) {
            self.stats.tlb_hits += 1;
            return Some(PhysicalAddress::new((pfn << 12) | offset));
        }

        let pa = self.walk(va)?;
        self.tlb.insert(vpn, pa.as_u32() >> 12);
        Some(pa)
    }

    /// Walks the tables in memory, ignoring the TLB.
    #[allow(clippy::cast_possible_truncation)]
    pub fn walk(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.stats.page_walks += 1;
        let directory = self.cr3.directory_phys();
        let pde = PdEntry::from_raw(self.phys_read_u32(directory + DirIndex::from(va).as_usize() as u32 * 4));
        match pde.kind() {
            PdEntryKind::Absent => None,
            PdEntryKind::Large(flags) => Some(PhysicalAddress::new(
                (flags.physical_address().as_u32() & !LARGE_OFFSET_MASK) | (va.as_u32() & LARGE_OFFSET_MASK),
            )),
            PdEntryKind::Table(table, _) => {
                let pte = PtEntry::from_raw(
                    self.phys_read_u32(table.base() + TableIndex::from(va).as_usize() as u32 * 4),
                );
                pte.page_4k()
                    .map(|(frame, _)| PhysicalAddress::new(frame.base().as_u32() | (va.as_u32() & 0xFFF)))
            }
        }
    }

    /// Whether the TLB holds a translation for the page containing `va`.
    #[must_use]
    pub fn tlb_contains(&self, va: VirtualAddress) -> bool {
        self.tlb.contains_key(&(va.as_u32() >> 12))
    }

    /// Host pointer for `len` bytes at `pa`.
    ///
    /// # Panics
    /// The range leaves RAM.
    fn host(&self, pa: PhysicalAddress, len: usize) -> *mut u8 {
        let end = pa.as_usize().checked_add(len);
        assert!(
            end.is_some_and(|end| end <= self.ram_bytes()),
            "bus error: {len} bytes at {pa} outside {} bytes of RAM",
            self.ram_bytes()
        );
        unsafe { self.ram.as_ptr().add(pa.as_usize()) }
    }

    /// Host pointer for `len` bytes at `va`, which must not cross a page.
    fn host_virt(&mut self, va: VirtualAddress, len: usize) -> *mut u8 {
        let Some(pa) = self.translate(va) else {
            panic!("page fault at {va}");
        };
        self.host(pa, len)
    }

    /// Splits `[va, va + len)` at page boundaries and hands each host chunk
    /// to `f` together with its offset into the range.
    fn for_each_chunk(&mut self, va: VirtualAddress, len: usize, mut f: impl FnMut(*mut u8, usize, usize)) {
        let mut done = 0usize;
        while done < len {
            #[allow(clippy::cast_possible_truncation)]
            let at = va + done as u32;
            let n = (PAGE - (at.as_usize() % PAGE)).min(len - done);
            let ptr = self.host_virt(at, n);
            f(ptr, done, n);
            done += n;
        }
    }

    pub fn phys_read(&self, pa: PhysicalAddress, dst: &mut [u8]) {
        let src = self.host(pa, dst.len());
        unsafe { core::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
    }

    pub fn phys_write(&mut self, pa: PhysicalAddress, src: &[u8]) {
        let dst = self.host(pa, src.len());
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
    }

    #[must_use]
    pub fn phys_read_u32(&self, pa: PhysicalAddress) -> u32 {
        let mut buf = [0u8; 4];
        self.phys_read(pa, &mut buf);
        u32::from_le_bytes(buf)
    }

    pub fn phys_write_u32(&mut self, pa: PhysicalAddress, value: u32) {
        self.phys_write(pa, &value.to_le_bytes());
    }
}

impl Drop for SimulatedMachine {
    fn drop(&mut self) {
        unsafe { dealloc(self.ram.as_ptr(), self.layout) };
    }
}

impl Mmu for SimulatedMachine {
    fn paging_enabled(&self) -> bool {
        self.cr0.pg_paging()
    }

    fn active_directory(&self) -> PhysicalAddress {
        self.cr3.directory_phys()
    }

    unsafe fn load_directory(&mut self, directory: PhysicalAddress) {
        self.cr3 = Cr3::from_directory_phys(directory, false, false);
        self.tlb.clear();
        self.stats.directory_loads += 1;
    }

    unsafe fn enable_paging(&mut self) {
        self.cr0.set_pg_paging(true);
        self.tlb.clear();
    }

    fn invalidate_page(&mut self, va: VirtualAddress) {
        self.tlb.remove(&(va.as_u32() >> 12));
        self.stats.invalidations += 1;
    }

    unsafe fn view_mut<'a, T>(&mut self, va: VirtualAddress) -> &'a mut T {
        assert!(
            va.as_usize() % PAGE + size_of::<T>() <= PAGE,
            "view of {} bytes at {va} crosses a page",
            size_of::<T>()
        );
        let ptr = self.host_virt(va, size_of::<T>()).cast::<T>();
        assert!(ptr.is_aligned(), "misaligned view at {va}");
        unsafe { &mut *ptr }
    }

    unsafe fn slice_mut<'a, T>(&mut self, va: VirtualAddress, len: usize) -> &'a mut [T] {
        let bytes = len * size_of::<T>();
        let first = self.host_virt(va, bytes.min(PAGE - va.as_usize() % PAGE));
        let mut expected = first;
        self.for_each_chunk(va, bytes, |ptr, _, n| {
            assert_eq!(ptr, expected, "slice at {va} is not physically contiguous");
            expected = unsafe { ptr.add(n) };
        });
        let ptr = first.cast::<T>();
        assert!(ptr.is_aligned(), "misaligned slice at {va}");
        unsafe { core::slice::from_raw_parts_mut(ptr, len) }
    }

    unsafe fn read_bytes(&mut self, va: VirtualAddress, dst: &mut [u8]) {
        let out = dst.as_mut_ptr();
        self.for_each_chunk(va, dst.len(), |src, at, n| unsafe {
            core::ptr::copy_nonoverlapping(src, out.add(at), n);
        });
    }

    unsafe fn write_bytes(&mut self, va: VirtualAddress, src: &[u8]) {
        let input = src.as_ptr();
        self.for_each_chunk(va, src.len(), |dst, at, n| unsafe {
            core::ptr::copy_nonoverlapping(input.add(at), dst, n);
        });
    }

    unsafe fn fill_bytes(&mut self, va: VirtualAddress, value: u8, len: usize) {
        self.for_each_chunk(va, len, |dst, _, n| unsafe {
            core::ptr::write_bytes(dst, value, n);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::{PhysicalPage, Size4K};
    use kernel_vmem::{PageDirectory, PageEntryBits, PageTable};

    fn paged_machine() -> SimulatedMachine {
        let mut m = SimulatedMachine::new(1 << 20);
        let dir = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x1000));
        let table = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x2000));
        unsafe {
            let pd = m.view_mut::<PageDirectory>(VirtualAddress::new(0x1000));
            pd.set(DirIndex::new(0), PdEntry::make_table(table, PageEntryBits::new_kernel_rw()));
            let pt = m.view_mut::<PageTable>(VirtualAddress::new(0x2000));
            for i in 0..256u16 {
                let frame = PhysicalPage::<Size4K>::from_frame_number(u32::from(i));
                pt.set(TableIndex::new(i), PtEntry::make_4k(frame, PageEntryBits::new_kernel_rw()));
            }
            m.load_directory(dir.base());
            m.enable_paging();
        }
        m
    }

    #[test]
    fn paging_off_is_identity() {
        let mut m = SimulatedMachine::new(64 << 10);
        unsafe { m.write_u32(VirtualAddress::new(0x1234), 0xDEAD_BEEF) };
        assert_eq!(m.phys_read_u32(PhysicalAddress::new(0x1234)), 0xDEAD_BEEF);
    }

    #[test]
    fn stale_translations_survive_until_invalidated() {
        let mut m = paged_machine();
        let va = VirtualAddress::new(0x5000);
        assert_eq!(m.translate(va), Some(PhysicalAddress::new(0x5000)));

        // Repoint the PTE behind the TLB's back.
        let pte = PhysicalAddress::new(0x2000 + 5 * 4);
        let remapped = PtEntry::make_4k(
            PhysicalPage::from_addr(PhysicalAddress::new(0x9000)),
            PageEntryBits::new_kernel_rw(),
        );
        m.phys_write_u32(pte, remapped.raw());
        assert_eq!(m.translate(va), Some(PhysicalAddress::new(0x5000)));
        assert_eq!(m.walk(va), Some(PhysicalAddress::new(0x9000)));

        m.invalidate_page(va);
        assert_eq!(m.translate(va), Some(PhysicalAddress::new(0x9000)));
    }

    #[test]
    fn accesses_cross_pages() {
        let mut m = paged_machine();
        let data: Vec<u8> = (0..=255u8).cycle().take(6000).collect();
        unsafe { m.write_bytes(VirtualAddress::new(0x7F00), &data) };
        let mut back = vec![0; data.len()];
        unsafe { m.read_bytes(VirtualAddress::new(0x7F00), &mut back) };
        assert_eq!(back, data);
    }

    #[test]
    #[should_panic(expected = "page fault")]
    fn unmapped_access_faults() {
        let mut m = paged_machine();
        unsafe { m.read_u32(VirtualAddress::new(0x0040_0000)) };
    }
}
