//! # Typed i386 Control Registers
//!
//! Only the registers the memory core touches are modeled: [`cr0::Cr0`] for
//! the paging switch and [`cr3::Cr3`] for the page-directory base. The
//! `mov crN` accessors exist only when building for `x86` with the `asm`
//! feature; everywhere else the types are plain bitfields that simulated
//! machines can hold.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr0")]
pub mod cr0;

#[cfg(feature = "cr3")]
pub mod cr3;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}
