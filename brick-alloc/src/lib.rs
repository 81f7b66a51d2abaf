//! # brick-alloc
//!
//! Fixed-block slab allocation over OS-sourced, alignment-guaranteed
//! chunks.
//!
//! An allocator instance serves blocks of one compile-time size `N`
//! (rounded up to the machine word). Blocks live inside large virtual
//! memory *chunks* obtained from `brick-pal`; each chunk tracks its
//! occupancy with a bitmap so acquiring and releasing a block touch only a
//! handful of 64-bit words, and the chunk's base alignment makes pointer to
//! chunk recovery a single mask.
//!
//! # Features
//!
//! - **Bitmap occupancy**: per-chunk bitmaps give O(1) amortised acquire
//!   and release plus double-free detection
//! - **Chunk lifecycle**: chunks move between vacant / partial / exhausted
//!   depots so reuse is cheap and fully free chunks can be returned to the
//!   OS with [`Slab::shrink`]
//! - **Whole-chunk geometry**: block sizes at or above the huge-page
//!   baseline bypass the bitmap and map one chunk per block ([`Bin`])
//! - **Injectable chunk source**: the OS boundary is a trait
//!   ([`ChunkSource`]), so tests can count, fail, or fake it
//!
//! # Optional features
//!
//! - `stats`: acquisition/release and chunk population counters
//! - `debug-poison`: fill patterns on acquire and release
//!
//! # Threading
//!
//! One allocator instance is single-threaded by contract; instances own
//! their chunks exclusively and contain raw pointers, so they are neither
//! `Send` nor `Sync`. Releasing a pointer through a different instance is
//! detected and treated as fatal (see [`fault`]).

#![deny(unsafe_op_in_unsafe_fn)]

pub mod bin;
pub mod config;
pub mod fault;
pub mod mask;
pub mod slab;
pub mod traits;

mod chunk;
mod depot;

#[cfg(test)]
mod testutil;

#[cfg(feature = "debug-poison")]
pub mod poison;

#[cfg(feature = "stats")]
pub mod stats;

pub use bin::Bin;
pub use fault::{set_fault_hook, Fault};
pub use slab::Slab;
pub use traits::{ChunkSource, OsSource};
