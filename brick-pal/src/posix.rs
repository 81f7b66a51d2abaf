//! POSIX backend: anonymous `mmap` with head/tail trimming.
//!
//! `mmap` only promises page alignment, so the region is over-mapped by
//! `align` bytes and the misaligned head and the unused tail are unmapped
//! before the aligned base is handed out. Anonymous private mappings are
//! zero-filled by the kernel.

use core::ptr::{self, NonNull};

use brick_common::align_up;

pub(crate) fn reserve(bytes: usize, align: usize) -> Option<NonNull<u8>> {
    let span = bytes + align;

    // SAFETY: requesting a fresh anonymous mapping; no existing memory is
    // affected. Failure is reported as MAP_FAILED, checked below.
    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            span,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return None;
    }

    let base = raw as usize;
    let aligned = align_up(base, align);

    // SAFETY: both ranges lie inside the mapping created above and do not
    // overlap the [aligned, aligned + bytes) slice being kept.
    unsafe {
        if aligned > base {
            libc::munmap(raw, aligned - base);
        }
        let keep_end = aligned + bytes;
        let tail = base + span - keep_end;
        if tail > 0 {
            libc::munmap(keep_end as *mut libc::c_void, tail);
        }
    }

    NonNull::new(aligned as *mut u8)
}

/// # Safety
///
/// `ptr` must be the aligned base of a live region produced by [`reserve`]
/// with the same `bytes`.
pub(crate) unsafe fn release(ptr: NonNull<u8>, bytes: usize, _align: usize) {
    // SAFETY: the head and tail were trimmed at reserve time, so exactly
    // [ptr, ptr + bytes) is still mapped.
    unsafe {
        libc::munmap(ptr.as_ptr().cast(), bytes);
    }
}
