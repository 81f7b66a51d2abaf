//! Chunk-source trait for runtime-provided memory backends.
//!
//! The allocator never calls the platform layer directly; it goes through
//! [`ChunkSource`] so tests can count calls, inject failure, or substitute
//! plain heap memory. [`OsSource`] is the production implementation and
//! simply forwards to `brick-pal`.

use core::ptr::NonNull;

/// Provider of aligned, zeroed virtual-memory regions.
pub trait ChunkSource {
    /// Reserve a readable, writable, zeroed region of `bytes` bytes whose
    /// base is a multiple of `align` (a power of two). `None` means the
    /// backend is out of memory; the allocator surfaces that as a failed
    /// acquire.
    fn valloc(&self, bytes: usize, align: usize) -> Option<NonNull<u8>>;

    /// Release a region obtained from [`ChunkSource::valloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from a prior `valloc` on this source with the same
    /// `bytes` and `align`, not released since, and the region must no
    /// longer be accessed.
    unsafe fn vfree(&self, ptr: NonNull<u8>, bytes: usize, align: usize);
}

impl<S: ChunkSource> ChunkSource for &S {
    fn valloc(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        (**self).valloc(bytes, align)
    }

    unsafe fn vfree(&self, ptr: NonNull<u8>, bytes: usize, align: usize) {
        // SAFETY: forwarded contract.
        unsafe { (**self).vfree(ptr, bytes, align) }
    }
}

/// The OS-backed chunk source.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSource;

impl ChunkSource for OsSource {
    fn valloc(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        brick_pal::valloc(bytes, align)
    }

    unsafe fn vfree(&self, ptr: NonNull<u8>, bytes: usize, align: usize) {
        // SAFETY: forwarded contract.
        unsafe { brick_pal::vfree(ptr.as_ptr(), bytes, align) }
    }
}
