//! # pyre-common
//!
//! Shared types and constants for the Pyre loader and the kernels it boots.
//!
//! This crate defines the memory side of the loader-to-kernel ABI:
//! - [`MemoryKind`](memory::MemoryKind): stable numeric encoding of range types
//! - [`MemoryMap`](memory::MemoryMap): the finalized memory map handed over at
//!   kernel entry
//! - [`PhysAddr`]/[`VirtAddr`]: address newtypes used throughout the loader
//!
//! All handoff types use `#[repr(C)]` for a stable ABI across compilation
//! units and payload protocols.
//!
//! # no_std
//!
//! This crate is `#![no_std]` and has zero dependencies, so every other Pyre
//! crate can depend on it.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod addr;
pub mod memory;

// Re-export commonly used types
pub use addr::{PhysAddr, VirtAddr};
