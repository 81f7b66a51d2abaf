//! Contract-violation taxonomy and the process-wide fault policy.
//!
//! Resource exhaustion is an ordinary `None` from `acquire`; everything in
//! [`Fault`] is a broken contract or an impossible state and must surface
//! loudly. Debug builds panic with the fault so tests and debuggers catch
//! it at the call site; release builds call the installed hook, then
//! abort. Silent corruption is worse than either.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Violations detected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Release of a pointer whose chunk belongs to a different allocator.
    ForeignRelease,
    /// Release of a pointer off any block boundary of its chunk.
    MisalignedRelease,
    /// Release of a block whose occupancy bit is already clear.
    DoubleRelease,
    /// Allocator dropped while blocks were still handed out.
    LiveOnDrop,
    /// A non-exhausted chunk produced no free bit.
    MaskExhausted,
    /// The free-block counter would go negative.
    CounterUnderflow,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForeignRelease => write!(f, "release of a block owned by another allocator"),
            Self::MisalignedRelease => write!(f, "release of a pointer off any block boundary"),
            Self::DoubleRelease => write!(f, "release of a block that is already free"),
            Self::LiveOnDrop => write!(f, "allocator dropped with blocks still handed out"),
            Self::MaskExhausted => write!(f, "no free bit in a chunk that reports free blocks"),
            Self::CounterUnderflow => write!(f, "free-block counter underflow"),
        }
    }
}

/// Hook invoked on a fault in release builds, before the process aborts.
pub type FaultHook = fn(Fault);

static HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Install the process-wide fault hook.
///
/// The hook runs once per fault in release builds; afterwards the process
/// aborts regardless. Installing replaces any previous hook. The default,
/// with no hook installed, is plain termination.
pub fn set_fault_hook(hook: FaultHook) {
    HOOK.store(hook as *mut (), Ordering::Release);
}

/// Report a fault and leave.
///
/// Debug builds panic so the condition is recoverable under test; release
/// builds notify the hook and abort.
#[cold]
pub(crate) fn fatal(fault: Fault) -> ! {
    #[cfg(debug_assertions)]
    {
        panic!("{fault}");
    }

    #[cfg(not(debug_assertions))]
    {
        let raw = HOOK.load(Ordering::Acquire);
        if !raw.is_null() {
            // SAFETY: the pointer was stored from a FaultHook in
            // set_fault_hook and fn pointers are address-compatible
            // with *mut ().
            let hook = unsafe { core::mem::transmute::<*mut (), FaultHook>(raw) };
            hook(fault);
        }
        std::process::abort();
    }
}
