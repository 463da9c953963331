#![allow(dead_code)]

use kernel_alloc::{E820Table, MemoryConfig, MemoryManager};
use kernel_info::boot::KernelImage;
use kernel_sim::{E820Builder, SimulatedMachine};

pub const RAM: usize = 32 << 20;

pub type Memory = MemoryManager<SimulatedMachine>;

pub fn kernel() -> KernelImage {
    KernelImage::with_size(0x10_0000)
}

pub fn config() -> MemoryConfig {
    MemoryConfig::new(kernel())
}

pub fn boot() -> Memory {
    boot_with(&E820Builder::pc(RAM as u64), config())
}

pub fn boot_with(map: &E820Builder, config: MemoryConfig) -> Memory {
    let blob = map.build();
    let table = E820Table::parse(&blob).unwrap();
    unsafe { MemoryManager::boot(SimulatedMachine::new(RAM), &table, config) }.unwrap()
}

/// Deterministic xorshift64 sequence.
pub struct XorShift(u64);

impl XorShift {
    pub const fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    pub fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}
