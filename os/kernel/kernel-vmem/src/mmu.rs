//! # Hardware Access Seam
//!
//! Everything the memory core needs from the processor goes through [`Mmu`]:
//! the two control registers, TLB invalidation, and loads/stores at virtual
//! addresses. The bare-metal implementation is a handful of instructions; a
//! simulated machine can implement the same contract in software, including
//! a TLB that keeps stale translations until told otherwise.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Processor-side view of memory.
///
/// Every address handed to the accessors is a **virtual** address in the
/// sense of the current CR0/CR3 state: while paging is off it equals the
/// physical address, afterwards it is translated through the loaded
/// directory (and whatever the TLB still caches).
pub trait Mmu {
    /// Whether CR0.PG is set.
    fn paging_enabled(&self) -> bool;

    /// Physical base of the directory currently loaded in CR3.
    fn active_directory(&self) -> PhysicalAddress;

    /// Loads CR3, flushing all non-global translations.
    ///
    /// # Safety
    /// `directory` must be a valid page directory. If paging is enabled it must
    /// map the code and data currently in use.
    unsafe fn load_directory(&mut self, directory: PhysicalAddress);

    /// Sets CR0.PG.
    ///
    /// # Safety
    /// A directory must be loaded that identity-maps the code performing the
    /// switch and everything the caller keeps using afterwards.
    unsafe fn enable_paging(&mut self);

    /// Drops any cached translation for the page containing `va` (`invlpg`).
    fn invalidate_page(&mut self, va: VirtualAddress);

    /// Views the object at `va` as `&mut T`.
    ///
    /// # Safety
    /// - `va..va + size_of::<T>()` must be mapped writable and lie within one page.
    /// - The bytes must be a valid `T` and nothing else may alias them for `'a`.
    /// - The mapping must stay in place for `'a`.
    unsafe fn view_mut<'a, T>(&mut self, va: VirtualAddress) -> &'a mut T;

    /// Views `len` consecutive `T`s at `va`.
    ///
    /// # Safety
    /// As for [`Mmu::view_mut`]; additionally the whole range must be backed
    /// by physically contiguous memory mapped in order (e.g. the identity window).
    unsafe fn slice_mut<'a, T>(&mut self, va: VirtualAddress, len: usize) -> &'a mut [T];

    /// # Safety
    /// `va..va + dst.len()` must be mapped.
    unsafe fn read_bytes(&mut self, va: VirtualAddress, dst: &mut [u8]);

    /// # Safety
    /// `va..va + src.len()` must be mapped writable and not in use by anything else.
    unsafe fn write_bytes(&mut self, va: VirtualAddress, src: &[u8]);

    /// # Safety
    /// `va..va + len` must be mapped writable and not in use by anything else.
    unsafe fn fill_bytes(&mut self, va: VirtualAddress, value: u8, len: usize);

    /// # Safety
    /// See [`Mmu::read_bytes`].
    unsafe fn read_u32(&mut self, va: VirtualAddress) -> u32 {
        let mut buf = [0u8; 4];
        unsafe { self.read_bytes(va, &mut buf) };
        u32::from_le_bytes(buf)
    }

    /// # Safety
    /// See [`Mmu::write_bytes`].
    unsafe fn write_u32(&mut self, va: VirtualAddress, value: u32) {
        unsafe { self.write_bytes(va, &value.to_le_bytes()) };
    }

    /// Copies `len` bytes from `src` to `dst`.
    ///
    /// # Safety
    /// Both ranges must be mapped (`dst` writable) and must not overlap.
    unsafe fn copy_bytes(&mut self, dst: VirtualAddress, src: VirtualAddress, len: usize) {
        let mut chunk = [0u8; 256];
        let mut done = 0usize;
        while done < len {
            let n = chunk.len().min(len - done);
            #[allow(clippy::cast_possible_truncation)]
            let step = done as u32;
            unsafe {
                self.read_bytes(src + step, &mut chunk[..n]);
                self.write_bytes(dst + step, &chunk[..n]);
            }
            done += n;
        }
    }
}
