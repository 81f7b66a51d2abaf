//! Win32 backend: `VirtualAlloc2` with an explicit alignment requirement,
//! falling back to reserve-then-commit inside a padded reservation.
//!
//! `VirtualAlloc2` is resolved from `kernelbase.dll` once and memoized for
//! the life of the process; loaders without the export take the fallback
//! path. On release the reservation base is recovered with `VirtualQuery`,
//! which also covers the fallback case where the committed slice does not
//! start at the reservation.

use core::ffi::c_void;
use core::mem;
use core::ptr::{self, NonNull};

use brick_common::align_up;
use spin::Once;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_RELEASE: u32 = 0x8000;
const PAGE_READWRITE: u32 = 0x04;

/// `MemExtendedParameterAddressRequirements`
const MEM_EXTENDED_PARAMETER_ADDRESS_REQUIREMENTS: u64 = 1;

#[repr(C)]
struct MemAddressRequirements {
    lowest_starting_address: *mut c_void,
    highest_ending_address: *mut c_void,
    alignment: usize,
}

#[repr(C)]
struct MemExtendedParameter {
    kind: u64,
    pointer: *mut c_void,
}

#[repr(C)]
#[allow(dead_code)]
struct MemoryBasicInformation {
    base_address: *mut c_void,
    allocation_base: *mut c_void,
    allocation_protect: u32,
    partition_id: u16,
    _pad0: u16,
    region_size: usize,
    state: u32,
    protect: u32,
    kind: u32,
    _pad1: u32,
}

#[link(name = "kernel32")]
extern "system" {
    fn VirtualAlloc(addr: *mut c_void, size: usize, kind: u32, protect: u32) -> *mut c_void;
    fn VirtualFree(addr: *mut c_void, size: usize, kind: u32) -> i32;
    fn VirtualQuery(addr: *const c_void, info: *mut MemoryBasicInformation, len: usize) -> usize;
    fn GetModuleHandleA(name: *const u8) -> *mut c_void;
    fn GetProcAddress(module: *mut c_void, name: *const u8) -> *mut c_void;
}

/// `VirtualAlloc2(process, base, size, kind, protect, params, count)`;
/// a null process handle targets the current process.
type VirtualAlloc2Fn = unsafe extern "system" fn(
    *mut c_void,
    *mut c_void,
    usize,
    u32,
    u32,
    *mut MemExtendedParameter,
    u32,
) -> *mut c_void;

static VIRTUAL_ALLOC2: Once<Option<VirtualAlloc2Fn>> = Once::new();

/// Resolve and memoize `VirtualAlloc2`. Pure function-pointer lookup;
/// initialised lazily and never torn down.
fn virtual_alloc2() -> Option<VirtualAlloc2Fn> {
    *VIRTUAL_ALLOC2.call_once(|| {
        // SAFETY: both calls take NUL-terminated names and return null on
        // failure; the transmute target matches the documented signature.
        unsafe {
            let module = GetModuleHandleA(c"kernelbase.dll".as_ptr().cast());
            if module.is_null() {
                return None;
            }
            let sym = GetProcAddress(module, c"VirtualAlloc2".as_ptr().cast());
            if sym.is_null() {
                None
            } else {
                Some(mem::transmute::<*mut c_void, VirtualAlloc2Fn>(sym))
            }
        }
    })
}

pub(crate) fn reserve(bytes: usize, align: usize) -> Option<NonNull<u8>> {
    if let Some(alloc2) = virtual_alloc2() {
        let mut requirements = MemAddressRequirements {
            lowest_starting_address: ptr::null_mut(),
            highest_ending_address: ptr::null_mut(),
            alignment: align,
        };
        let mut parameter = MemExtendedParameter {
            kind: MEM_EXTENDED_PARAMETER_ADDRESS_REQUIREMENTS,
            pointer: (&mut requirements as *mut MemAddressRequirements).cast(),
        };

        // SAFETY: the extended parameter points at a live requirements
        // struct for the duration of the call; committed pages come back
        // zeroed.
        let raw = unsafe {
            alloc2(
                ptr::null_mut(),
                ptr::null_mut(),
                bytes,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
                &mut parameter,
                1,
            )
        };
        return NonNull::new(raw.cast());
    }

    // Fallback: reserve a span padded by `align`, then commit only the
    // aligned slice. The reservation base is recovered on release via
    // VirtualQuery.
    let span = bytes + align;

    // SAFETY: plain reservation of fresh address space.
    let raw = unsafe { VirtualAlloc(ptr::null_mut(), span, MEM_RESERVE, PAGE_READWRITE) };
    if raw.is_null() {
        return None;
    }
    let aligned = align_up(raw as usize, align);

    // SAFETY: [aligned, aligned + bytes) lies inside the reservation made
    // above; committing zero-fills.
    let committed =
        unsafe { VirtualAlloc(aligned as *mut c_void, bytes, MEM_COMMIT, PAGE_READWRITE) };
    if committed.is_null() {
        // SAFETY: releasing the untouched reservation.
        unsafe { VirtualFree(raw, 0, MEM_RELEASE) };
        return None;
    }

    NonNull::new(committed.cast())
}

/// # Safety
///
/// `ptr` must be the aligned base of a live region produced by [`reserve`].
pub(crate) unsafe fn release(ptr: NonNull<u8>, _bytes: usize, _align: usize) {
    // SAFETY: info is a plain output struct; a zero return leaves it unused.
    let mut info = unsafe { mem::zeroed::<MemoryBasicInformation>() };
    // SAFETY: querying a live region owned by this allocator.
    let len = unsafe {
        VirtualQuery(
            ptr.as_ptr().cast(),
            &mut info,
            mem::size_of::<MemoryBasicInformation>(),
        )
    };

    // The committed slice may start inside a padded reservation; releasing
    // must name the reservation base.
    let base = if len == 0 {
        ptr.as_ptr().cast()
    } else {
        info.allocation_base
    };

    // SAFETY: MEM_RELEASE with size 0 frees the whole reservation.
    unsafe {
        VirtualFree(base, 0, MEM_RELEASE);
    }
}
