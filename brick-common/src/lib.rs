//! # brick-common
//!
//! Shared bit and alignment arithmetic for the brick memory subsystem.
//!
//! Both the platform layer (`brick-pal`) and the allocator (`brick-alloc`)
//! derive their geometry from the helpers in [`bits`]: page rounding on the
//! OS boundary, chunk sizing and block offsets above it.
//!
//! # no_std
//!
//! This crate is `#![no_std]` and has zero dependencies, making it suitable
//! as a foundation crate that the other brick crates can depend on.

#![no_std]

pub mod bits;

pub use bits::{align_up, is_aligned, next_pow2, pow2_divisor, words_for_bits};
