mod common;

use common::{XorShift, boot, boot_with, config};
use kernel_alloc::HeapError;
use kernel_memory_addresses::VirtualAddress;
use kernel_sim::{E820Builder, LogCapture};

fn read(memory: &mut common::Memory, va: VirtualAddress, len: usize) -> Vec<u8> {
    let mut out = vec![0; len];
    unsafe { memory.read_virt(va, &mut out) };
    out
}

#[test]
fn malloc_free_malloc_reuses_the_block() {
    let mut memory = boot();
    let a = memory.malloc(200).unwrap();
    memory.free(a).unwrap();
    assert_eq!(memory.malloc(200).unwrap(), a);
}

#[test]
fn written_pattern_reads_back() {
    let mut memory = boot();
    let p = memory.malloc(5000).unwrap();
    let pattern: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
    unsafe { memory.write_virt(p, &pattern) };
    assert_eq!(read(&mut memory, p, 5000), pattern);
}

#[test]
fn random_live_blocks_are_disjoint() {
    let mut memory = boot();
    let mut rng = XorShift::new(0xD1B5_4A32_D192_ED03);
    let mut live: Vec<(VirtualAddress, usize)> = Vec::new();

    for _ in 0..1500 {
        if live.is_empty() || rng.below(4) != 0 {
            let size = 1 + rng.below(2000);
            let p = memory.malloc(size).unwrap();
            live.push((p, size));
        } else {
            let (p, _) = live.swap_remove(rng.below(live.len()));
            memory.free(p).unwrap();
        }
    }

    live.sort_unstable();
    for pair in live.windows(2) {
        let (a, len) = pair[0];
        assert!(a.as_u64() + len as u64 <= pair[1].0.as_u64(), "{pair:?} overlap");
    }
    let heap_used = memory.heap_used_units();
    assert_eq!(heap_used, memory.heap().total_units() - memory.heap().free_units());
}

#[test]
fn realloc_shrink_keeps_the_prefix() {
    let mut memory = boot();
    let p = memory.malloc(1024).unwrap();
    let pattern: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
    unsafe { memory.write_virt(p, &pattern) };

    assert_eq!(memory.realloc(Some(p), 100).unwrap(), Some(p));
    assert_eq!(read(&mut memory, p, 100), pattern[..100]);
    assert_eq!(memory.block_size(p).unwrap(), 112);
}

#[test]
fn realloc_moves_when_boxed_in() {
    let mut memory = boot();
    let p = memory.malloc(64).unwrap();
    unsafe { memory.write_virt(p, &[0x5A; 64]) };
    let _fence = memory.malloc(16).unwrap();

    let q = memory.realloc(Some(p), 4096).unwrap().unwrap();
    assert_ne!(q, p);
    assert_eq!(read(&mut memory, q, 64), [0x5A; 64]);
    assert_eq!(memory.free(p), Err(HeapError::Corruption(p)));
}

#[test]
fn zalloc_and_calloc_hand_out_zeroes() {
    let mut memory = boot();
    let dirty = memory.malloc(256).unwrap();
    unsafe { memory.write_virt(dirty, &[0xEE; 256]) };
    memory.free(dirty).unwrap();

    let z = memory.zalloc(256).unwrap();
    assert_eq!(z, dirty);
    assert!(read(&mut memory, z, 256).iter().all(|&b| b == 0));
    memory.free(z).unwrap();

    let c = memory.calloc(16, 16).unwrap();
    assert!(read(&mut memory, c, 256).iter().all(|&b| b == 0));
    assert_eq!(memory.calloc(usize::MAX / 2, 3), Err(HeapError::Overflow));
}

#[test]
fn page_allocations_are_page_aligned() {
    let mut memory = boot();
    memory.malloc(24).unwrap();
    let one = memory.page_alloc().unwrap();
    let many = memory.pages_alloc(3).unwrap();
    let aligned = memory.malloc_aligned(100, 256).unwrap();
    assert_eq!(one.as_u32() % 4096, 0);
    assert_eq!(many.as_u32() % 4096, 0);
    assert_eq!(aligned.as_u32() % 256, 0);
    assert_eq!(memory.block_size(many).unwrap(), 3 * 4096);
    assert!(matches!(memory.pages_alloc(0), Err(HeapError::InvalidArgument(_))));
}

#[test]
fn bad_frees_are_reported() {
    let logs = LogCapture::start();
    let mut memory = boot();
    let p = memory.malloc(64).unwrap();
    assert_eq!(memory.free(p + 16), Err(HeapError::Corruption(p + 16)));
    assert_eq!(memory.free(p + 4), Err(HeapError::InvalidPointer(p + 4)));
    assert_eq!(memory.heap().corruption_count(), 1);
    assert!(logs.contains(log::Level::Warn, "is not the start of a live block"));
    memory.free(p).unwrap();
}

#[test]
fn heap_grows_page_by_page_up_to_its_maximum() {
    let base = VirtualAddress::new(0xD000_0000);
    let mut memory = boot_with(
        &E820Builder::pc(common::RAM as u64),
        config().with_heap(base, 1 << 20, 64 << 10),
    );
    let initial = memory.heap().total_bytes();
    let block = 4096;

    for _ in 0..initial / block {
        memory.malloc(block).unwrap();
    }
    assert_eq!(memory.heap().free_bytes(), 0);
    assert_eq!(memory.heap().total_bytes(), initial);

    let frames_before = memory.free_frame_count();
    let grown = memory.malloc(block).unwrap();
    assert_eq!(grown.as_u64(), memory.heap().data_start().as_u64() + initial as u64);
    assert!(memory.free_frame_count() < frames_before);
    assert!(memory.get_physical(grown + 4095).is_some());

    let err = loop {
        if let Err(e) = memory.malloc(block) {
            break e;
        }
    };
    assert!(matches!(err, HeapError::OutOfMemory { .. }));
    let heap = memory.heap();
    assert!(heap.data_end() <= heap.layout().data_max());
    assert!(heap.layout().data_max() - heap.data_end() < block as u64);

    memory.log_heap();
}
