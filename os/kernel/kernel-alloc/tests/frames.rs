mod common;

use common::{XorShift, boot};
use kernel_alloc::{E820Table, FrameBitmapAllocator, FrameError, PhysicalMemoryMap};
use kernel_sim::E820Builder;
use std::collections::HashSet;

const MIB: u64 = 1 << 20;

fn sixteen_mib_map() -> PhysicalMemoryMap {
    let blob = E820Builder::pc(16 * MIB).build();
    PhysicalMemoryMap::collect(&E820Table::parse(&blob).unwrap())
}

#[test]
fn kernel_reservation_and_frame_zero_are_respected() {
    let map = sixteen_mib_map();
    let mut storage = vec![0u32; FrameBitmapAllocator::bitmap_words_for(16 * MIB)];
    let mut frames = FrameBitmapAllocator::init(&mut storage, 16 * MIB, &map, &[MIB..2 * MIB]).unwrap();

    let mut seen = HashSet::new();
    while let Some(frame) = frames.alloc_frame() {
        let pa = frame.base().as_u64();
        assert!(pa >= 0x1000, "frame zero handed out");
        assert!(!(MIB..2 * MIB).contains(&pa), "kernel frame {frame} handed out");
        assert!(pa < 16 * MIB);
        assert_eq!(pa % 4096, 0);
        assert!(seen.insert(pa), "{frame} handed out twice");
    }
    assert_eq!(frames.free_frame_count(), 0);
    assert_eq!(frames.count_free_frames(), 0);
}

#[test]
fn odd_sized_memory_never_yields_tail_frames() {
    let size = 16 * MIB + 5 * 4096;
    let blob = E820Builder::pc(size).build();
    let map = PhysicalMemoryMap::collect(&E820Table::parse(&blob).unwrap());
    let mut storage = vec![0u32; FrameBitmapAllocator::bitmap_words_for(size)];
    let mut frames = FrameBitmapAllocator::init(&mut storage, size, &map, &[]).unwrap();

    assert!(frames.tail_bits_set());
    let total = frames.total_frames() as u64;
    while let Some(frame) = frames.alloc_frame() {
        assert!(u64::from(frame.frame_number()) < total);
    }
    assert!(frames.tail_bits_set());
}

#[test]
fn random_traffic_keeps_the_counter_honest() {
    let mut memory = boot();
    let mut rng = XorShift::new(0x9E37_79B9_7F4A_7C15);
    let mut live = Vec::new();
    let start = memory.free_frame_count();

    for _ in 0..4000 {
        if live.is_empty() || rng.below(5) < 3 {
            if let Some(frame) = memory.alloc_frame() {
                live.push(frame);
            }
        } else {
            let frame = live.swap_remove(rng.below(live.len()));
            memory.free_frame(frame.base()).unwrap();
        }
        assert_eq!(memory.free_frame_count() + live.len(), start);
    }
    assert_eq!(memory.frames().count_free_frames(), memory.free_frame_count());

    let distinct: HashSet<_> = live.iter().collect();
    assert_eq!(distinct.len(), live.len());
}

#[test]
fn double_free_is_refused_and_counted() {
    let mut memory = boot();
    let frame = memory.alloc_frame().unwrap();
    memory.free_frame(frame.base()).unwrap();
    let before = memory.free_frame_count();
    assert_eq!(memory.free_frame(frame.base()), Err(FrameError::DoubleFree(frame.base())));
    assert_eq!(memory.free_frame_count(), before);
    assert_eq!(memory.frames().double_free_count(), 1);
}
