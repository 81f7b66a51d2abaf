//! Chunk header and raw layout accessors.
//!
//! A small chunk is a `geo.chunk`-byte region whose base address is a
//! multiple of `geo.chunk`. The header sits at the base, the bitmap right
//! behind it, and the block array begins at `geo.offset`. Because of the
//! base alignment, the owning chunk of any block pointer is recovered by
//! masking off the low `geo.chunk - 1` bits.

use core::ptr::{self, NonNull};

use crate::config::{Geometry, HEADER};

/// Per-chunk bookkeeping at the chunk base.
///
/// `outer` identifies the owning allocator and is written exactly once,
/// when the chunk is stamped; it is compared on release, never followed.
/// `prev`/`next` are owned by the depot the chunk currently sits on.
#[repr(C)]
pub(crate) struct Header {
    /// Count of live blocks in this chunk.
    pub used: usize,
    /// Identity tag of the owning allocator.
    pub outer: *const (),
    /// Depot linkage.
    pub prev: *mut Header,
    /// Depot linkage.
    pub next: *mut Header,
}

/// Stamp a header onto a chunk region and hand back the chunk handle.
///
/// # Safety
///
/// `base` must be the start of a live, writable region of `geo.chunk`
/// bytes, aligned to `geo.chunk`, whose bitmap words are all zero. Fresh
/// platform memory arrives zeroed; a recycled chunk cleared every bit on
/// the way back to the vacant depot.
pub(crate) unsafe fn init(base: NonNull<u8>, outer: *const ()) -> NonNull<Header> {
    let header = base.cast::<Header>();
    // SAFETY: the region starts with space for one header and is writable.
    unsafe {
        header.as_ptr().write(Header {
            used: 0,
            outer,
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        });
    }
    header
}

/// Borrow the chunk's occupancy bitmap.
///
/// # Safety
///
/// `chunk` must be live, and the returned borrow must end before any other
/// access to the bitmap region.
pub(crate) unsafe fn mask_of<'a>(chunk: NonNull<Header>, geo: Geometry) -> &'a mut [u64] {
    // SAFETY: the bitmap starts immediately after the header and spans
    // `geo.words` u64s, inside the chunk and 8-byte aligned (the base is
    // chunk-aligned and the header is four words).
    unsafe {
        let words = chunk.as_ptr().cast::<u8>().add(HEADER).cast::<u64>();
        core::slice::from_raw_parts_mut(words, geo.words)
    }
}

/// Address of block `index` inside `chunk`.
///
/// # Safety
///
/// `chunk` must be live and `index` within `geo.count`.
pub(crate) unsafe fn block_at(chunk: NonNull<Header>, geo: Geometry, index: usize) -> NonNull<u8> {
    debug_assert!(index < geo.count);
    // SAFETY: offset + index * block stays inside the chunk for any valid
    // index, and the result cannot wrap to null.
    unsafe {
        NonNull::new_unchecked(
            chunk
                .as_ptr()
                .cast::<u8>()
                .add(geo.offset + index * geo.block),
        )
    }
}

/// Recover the owning chunk of a block pointer by masking.
///
/// Returns `None` for addresses below the first chunk boundary, which can
/// only come from a pointer this allocator never produced.
pub(crate) fn of_block(ptr: NonNull<u8>, geo: Geometry) -> Option<NonNull<Header>> {
    let base = ptr.as_ptr() as usize & !(geo.chunk - 1);
    NonNull::new(base as *mut Header)
}

/// Block index of `ptr` inside its chunk.
///
/// Returns `None` when the pointer lands in the bookkeeping prefix, off a
/// block boundary, or past the last block. All of those are shapes of
/// foreign or corrupted pointers.
pub(crate) fn index_of(ptr: NonNull<u8>, geo: Geometry) -> Option<usize> {
    let offset = ptr.as_ptr() as usize & (geo.chunk - 1);
    if offset < geo.offset {
        return None;
    }
    let delta = offset - geo.offset;
    if delta % geo.block != 0 {
        return None;
    }
    let index = delta / geo.block;
    if index >= geo.count {
        return None;
    }
    Some(index)
}
