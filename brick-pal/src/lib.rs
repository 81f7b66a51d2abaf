//! Platform Allocator
//!
//! Obtains and returns virtual-memory regions whose base address is aligned
//! to a caller-chosen power-of-two boundary, plus the CPU spin hint used by
//! busy-wait loops above this crate.
//!
//! All platform-specific code lives in one backend module per target:
//! - `posix`: anonymous `mmap`, over-map then trim to alignment
//! - `win32`: `VirtualAlloc2` when the loader exports it, else
//!   reserve-then-commit inside a padded reservation
//! - `fallback`: heap over-allocation with a hidden base-pointer slot,
//!   for targets with neither API
//!
//! The shared entry points normalise sizes and alignments so every backend
//! sees the same contract: `bytes` is a non-zero page multiple, `align` is a
//! power of two no smaller than [`PAGE`]. Regions come back zeroed,
//! readable and writable.

#![deny(unsafe_op_in_unsafe_fn)]

use core::ptr::NonNull;

use brick_common::align_up;

#[cfg(unix)]
mod posix;
#[cfg(unix)]
use posix as backend;

#[cfg(windows)]
mod win32;
#[cfg(windows)]
use win32 as backend;

#[cfg(not(any(unix, windows)))]
mod fallback;
#[cfg(not(any(unix, windows)))]
use fallback as backend;

/// Page allocation granularity: 16 KiB. `valloc` sizes are rounded up to a
/// multiple of this.
pub const PAGE: usize = 1 << 14;

/// Default chunk address boundary: 64 KiB, the Windows virtual-alloc
/// granularity. Alignments below [`PAGE`] are clamped up to [`PAGE`].
pub const BOUNDARY: usize = 1 << 16;

/// Huge-page baseline: 2 MiB. Block sizes at or above this use whole-chunk
/// geometry in the allocator layer.
pub const HUGEPAGE: usize = 1 << 21;

/// Reserve a readable, writable, zeroed virtual-memory region of at least
/// `bytes` bytes whose base address is a multiple of `align`.
///
/// `align` must be a power of two; values below [`PAGE`] are clamped up to
/// it. `bytes` is rounded up to a page multiple (zero rounds to one page).
/// Returns `None` when the request cannot be sized without overflow or the
/// OS is out of memory. Never aborts.
pub fn valloc(bytes: usize, align: usize) -> Option<NonNull<u8>> {
    let align = if align < PAGE { PAGE } else { align };
    debug_assert!(align.is_power_of_two());

    // The backends pad by one extra `align`; leave room for two so the
    // rounding below cannot wrap either.
    if align > usize::MAX / 2 || bytes > usize::MAX - 2 * align {
        return None;
    }
    let bytes = align_up(bytes.max(1), PAGE);

    backend::reserve(bytes, align)
}

/// Release a region obtained from [`valloc`].
///
/// `bytes` and `align` must match the values passed to the reserving call.
/// A null `ptr` is ignored.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by a prior [`valloc`] with the
/// same `bytes` and `align`, not released since. No access to the region may
/// happen after this call.
pub unsafe fn vfree(ptr: *mut u8, bytes: usize, align: usize) {
    let Some(ptr) = NonNull::new(ptr) else {
        return;
    };
    let align = if align < PAGE { PAGE } else { align };
    let bytes = align_up(bytes.max(1), PAGE);

    // SAFETY: caller guarantees a matching reservation; normalisation here
    // mirrors valloc, so the backend sees the sizes it reserved with.
    unsafe { backend::release(ptr, bytes, align) }
}

/// Hint the CPU that the caller is spinning on a condition another thread
/// will change. No observable effect on program state.
#[inline]
pub fn pause() {
    core::hint::spin_loop();
}
