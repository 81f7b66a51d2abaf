//! Memory poisoning patterns.
//!
//! Feature-gated under the `debug-poison` feature. Recognisable fill
//! patterns are written on acquire and release to flush out
//! use-of-uninitialised and use-after-free bugs in client code.

/// Pattern for freshly acquired blocks.
pub const ACQUIRE_POISON: u8 = 0xAA;

/// Pattern for released blocks.
pub const RELEASE_POISON: u8 = 0xDD;

/// Fill a freshly acquired block with [`ACQUIRE_POISON`].
///
/// # Safety
///
/// `ptr` must be valid for writes of `len` bytes.
pub unsafe fn on_acquire(ptr: *mut u8, len: usize) {
    // SAFETY: caller guarantees the range is writable.
    unsafe {
        core::ptr::write_bytes(ptr, ACQUIRE_POISON, len);
    }
}

/// Fill a released block with [`RELEASE_POISON`].
///
/// # Safety
///
/// `ptr` must be valid for writes of `len` bytes.
pub unsafe fn on_release(ptr: *mut u8, len: usize) {
    // SAFETY: caller guarantees the range is writable.
    unsafe {
        core::ptr::write_bytes(ptr, RELEASE_POISON, len);
    }
}

/// Check that a block still carries the release pattern.
///
/// # Safety
///
/// `ptr` must be valid for reads of `len` bytes.
pub unsafe fn verify_released(ptr: *const u8, len: usize) -> bool {
    // SAFETY: caller guarantees the range is readable.
    let bytes = unsafe { core::slice::from_raw_parts(ptr, len) };
    bytes.iter().all(|&b| b == RELEASE_POISON)
}
