//! The [`Mmu`] of the machine we are running on.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::cr0::Cr0;
use kernel_registers::cr3::Cr3;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

use crate::Mmu;

/// Direct register and memory access on a real (or emulated) i386.
pub struct BareMetalMmu {
    _private: (),
}

impl BareMetalMmu {
    /// # Safety
    /// Must run in ring 0, and only one instance may exist: the memory core
    /// assumes it is the sole writer of CR0.PG, CR3 and the page tables.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl Mmu for BareMetalMmu {
    fn paging_enabled(&self) -> bool {
        unsafe { Cr0::load_unsafe() }.pg_paging()
    }

    fn active_directory(&self) -> PhysicalAddress {
        unsafe { Cr3::load_unsafe() }.directory_phys()
    }

    unsafe fn load_directory(&mut self, directory: PhysicalAddress) {
        unsafe { Cr3::from_directory_phys(directory, false, false).store_unsafe() };
    }

    unsafe fn enable_paging(&mut self) {
        unsafe {
            let cr0 = Cr0::load_unsafe().with_pg_paging(true);
            cr0.store_unsafe();
        }
    }

    fn invalidate_page(&mut self, va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_usize(), options(nostack, preserves_flags));
        }
    }

    unsafe fn view_mut<'a, T>(&mut self, va: VirtualAddress) -> &'a mut T {
        unsafe { &mut *va.as_mut_ptr::<T>() }
    }

    unsafe fn slice_mut<'a, T>(&mut self, va: VirtualAddress, len: usize) -> &'a mut [T] {
        unsafe { core::slice::from_raw_parts_mut(va.as_mut_ptr::<T>(), len) }
    }

    unsafe fn read_bytes(&mut self, va: VirtualAddress, dst: &mut [u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(va.as_mut_ptr::<u8>(), dst.as_mut_ptr(), dst.len());
        }
    }

    unsafe fn write_bytes(&mut self, va: VirtualAddress, src: &[u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), va.as_mut_ptr::<u8>(), src.len());
        }
    }

    unsafe fn fill_bytes(&mut self, va: VirtualAddress, value: u8, len: usize) {
        unsafe { core::ptr::write_bytes(va.as_mut_ptr::<u8>(), value, len) };
    }

    unsafe fn copy_bytes(&mut self, dst: VirtualAddress, src: VirtualAddress, len: usize) {
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_mut_ptr::<u8>(), dst.as_mut_ptr::<u8>(), len);
        }
    }
}
