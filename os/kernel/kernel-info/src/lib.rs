//! # Kernel Layout and Boot Interface
//!
//! Shared constants and handoff structures for the 32-bit higher-half kernel.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Identity window (bootstrap)    │  IDENTITY_WINDOW_BYTES
//!             ├─────────────────────────────────┤
//!             │         User Space              │
//! KERNEL_VIRT ├─────────────────────────────────┤ 0xC000_0000
//!             │       Kernel Text & Data        │
//! KHEAP_BASE  ├─────────────────────────────────┤ 0xD000_0000
//!             │   Kernel heap (metadata+data)   │
//!             │              ...                │
//! SCRATCH_VA  ├─────────────────────────────────┤ 0xFFC0_0000
//!             │   Scratch mapping slot (4 KiB)  │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │     Low Memory (< 1MiB)         │
//! PHYS_BASE   ├─────────────────────────────────┤ 0x0010_0000 (1 MiB)
//!             │       Kernel Image              │
//!             ├─────────────────────────────────┤ kernel phys end
//!             │   Early bump region (4 MiB)     │
//!             ├─────────────────────────────────┤
//!             │    Available RAM (frames)       │
//!             └─────────────────────────────────┘
//! ```
//!
//! The loader hands over an e820 table (see [`boot::E820TableHeader`]); the
//! kernel image bounds come from the linker (see [`boot::KernelImage`]).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
