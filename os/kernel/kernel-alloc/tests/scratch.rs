mod common;

use common::boot;
use kernel_info::memory::SCRATCH_VA;
use kernel_memory_addresses::VirtualAddress;
use kernel_sim::LogCapture;
use kernel_vmem::Mmu;

const SCRATCH: VirtualAddress = VirtualAddress::new(SCRATCH_VA);

#[test]
fn last_writer_wins() {
    let logs = LogCapture::start();
    let mut memory = boot();
    let first = memory.alloc_frame().unwrap();
    let second = memory.alloc_frame().unwrap();

    let paging = memory.paging_mut();
    assert_eq!(paging.scratch_map(first.base()), SCRATCH);
    assert_eq!(paging.mmu_mut().translate(SCRATCH), Some(first.base()));

    assert_eq!(paging.scratch_map(second.base()), SCRATCH);
    assert_eq!(paging.mmu_mut().translate(SCRATCH), Some(second.base()));
    assert_eq!(paging.scratch().current(), Some(second));
    assert_eq!(paging.scratch().overwrite_count(), 1);
    assert!(logs.contains(log::Level::Warn, "scratch slot still held"));

    paging.scratch_unmap();
    assert_eq!(paging.mmu_mut().translate(SCRATCH), None);
    assert_eq!(paging.scratch().current(), None);
}

#[test]
fn writes_land_in_the_exposed_frame() {
    let mut memory = boot();
    let frame = memory.alloc_frame().unwrap();
    let paging = memory.paging_mut();

    let va = paging.scratch_map(frame.base() + 0x10);
    unsafe { paging.mmu_mut().write_u32(va + 0x10, 0xCAFE_F00D) };
    paging.scratch_unmap();

    assert_eq!(paging.mmu().phys_read_u32(frame.base() + 0x10), 0xCAFE_F00D);
}

#[test]
fn zero_frame_clears_a_dirty_frame() {
    let mut memory = boot();
    let frame = memory.alloc_frame().unwrap();
    let paging = memory.paging_mut();
    paging.mmu_mut().phys_write(frame.base(), &[0xFF; 4096]);

    paging.zero_frame(frame);
    let mut back = [0xAAu8; 4096];
    paging.mmu().phys_read(frame.base(), &mut back);
    assert!(back.iter().all(|&b| b == 0));
    assert_eq!(paging.scratch().current(), None);
}

#[test]
fn internal_users_leave_the_slot_empty() {
    let logs = LogCapture::start();
    let mut memory = boot();
    let user = memory.create_user_directory().unwrap();
    let _ = memory.paging_mut().get_physical(user, VirtualAddress::new(0x4000_0000));
    for _ in 0..16 {
        let p = memory.page_alloc().unwrap();
        memory.free(p).unwrap();
    }
    assert_eq!(memory.paging().scratch().current(), None);
    assert_eq!(memory.paging().scratch().overwrite_count(), 0);
    assert!(!logs.contains(log::Level::Warn, "scratch slot"));
}
