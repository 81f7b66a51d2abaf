//! Whole-chunk allocator for huge block sizes.
//!
//! Once a block reaches the huge-page baseline there is no room for shared
//! bookkeeping: the chunk *is* the block, so a header inside it would be
//! visible to (and corruptible by) the client. A `Bin<N>` therefore keeps
//! its records out of line: a stack of vacant chunks retained for reuse
//! and a side table of handed-out chunk bases, keyed by address with open
//! addressing and linear probing. Both grow by doubling and never shrink.
//!
//! The public surface matches [`crate::slab::Slab`]; the state machine
//! degenerates to two populations, vacant and handed out.

use core::ptr::NonNull;

use crate::config::{self, HUGEPAGE, PAGE};
use crate::fault::{fatal, Fault};
use crate::traits::{ChunkSource, OsSource};

#[cfg(feature = "stats")]
use crate::stats::Stats;

use brick_common::align_up;

/// Whole-chunk allocator for one compile-time size class.
pub struct Bin<const N: usize, S: ChunkSource = OsSource> {
    /// Chunks retained for reuse, most recently released on top.
    vacant: Vec<NonNull<u8>>,
    /// Bases of handed-out chunks.
    live: SideTable,
    /// Free chunks, mirroring `vacant.len()` for the public counter.
    usable: usize,
    source: S,
    #[cfg(feature = "stats")]
    stats: Stats,
}

impl<const N: usize> Bin<N, OsSource> {
    /// Bin drawing chunks from the operating system.
    #[must_use]
    pub fn new() -> Self {
        Self::with_source(OsSource)
    }
}

impl<const N: usize> Default for Bin<N, OsSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, S: ChunkSource> Bin<N, S> {
    /// Block stride in bytes: the requested `N` rounded up to the page.
    pub const BLOCK: usize = align_up(N, PAGE);

    /// Chunk size; one block per chunk.
    pub const CHUNK: usize = Self::BLOCK;

    /// Bin drawing chunks from `source`.
    pub fn with_source(source: S) -> Self {
        const {
            assert!(
                config::block_size(N) >= HUGEPAGE,
                "block size is small geometry; use Slab instead"
            );
        }
        Self {
            vacant: Vec::new(),
            live: SideTable::new(),
            usable: 0,
            source,
            #[cfg(feature = "stats")]
            stats: Stats::new(),
        }
    }

    /// Hand out one page-aligned block of [`Self::BLOCK`] writable bytes.
    /// Contents are unspecified.
    ///
    /// Returns `None` only when no retained chunk exists *and* the source
    /// cannot produce a new one.
    pub fn acquire(&mut self) -> Option<NonNull<u8>> {
        let block = match self.vacant.pop() {
            Some(block) => {
                self.usable -= 1;
                block
            }
            None => {
                let block = self.source.valloc(Self::BLOCK, PAGE)?;
                #[cfg(feature = "stats")]
                {
                    self.stats.chunks += 1;
                    self.stats.source_vallocs += 1;
                }
                block
            }
        };
        self.live.insert(block.as_ptr() as usize);

        #[cfg(feature = "debug-poison")]
        // SAFETY: the block is a live, writable chunk.
        unsafe {
            crate::poison::on_acquire(block.as_ptr(), Self::BLOCK);
        }

        #[cfg(feature = "stats")]
        {
            self.stats.live_blocks += 1;
            self.stats.total_acquires += 1;
        }

        Some(block)
    }

    /// Return a block to this bin. The chunk is retained for reuse, not
    /// handed back to the source; see [`Bin::shrink`] for that.
    ///
    /// Releasing a pointer this bin did not hand out is a fault.
    ///
    /// # Safety
    ///
    /// No access to the block may happen after this call.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        if addr % PAGE != 0 {
            fatal(Fault::MisalignedRelease);
        }
        if !self.live.remove(addr) {
            // A chunk already sitting on the reuse stack was released
            // twice; anything else was never ours.
            if self.vacant.contains(&ptr) {
                fatal(Fault::DoubleRelease);
            }
            fatal(Fault::ForeignRelease);
        }

        #[cfg(feature = "debug-poison")]
        // SAFETY: the block is still a live, writable chunk.
        unsafe {
            crate::poison::on_release(ptr.as_ptr(), Self::BLOCK);
        }

        self.vacant.push(ptr);
        self.usable += 1;

        #[cfg(feature = "stats")]
        {
            self.stats.live_blocks -= 1;
            self.stats.total_releases += 1;
        }
    }

    /// Ensure at least `blocks` retained chunks. Returns the number of
    /// blocks actually added, which falls short only when the source
    /// fails.
    pub fn reserve(&mut self, blocks: usize) -> usize {
        let mut added = 0;
        while self.usable < blocks {
            let Some(block) = self.source.valloc(Self::BLOCK, PAGE) else {
                break;
            };
            #[cfg(feature = "stats")]
            {
                self.stats.chunks += 1;
                self.stats.source_vallocs += 1;
            }
            self.vacant.push(block);
            self.usable += 1;
            added += 1;
        }
        added
    }

    /// Hand every retained chunk back to the source. Returns the number of
    /// chunks destroyed. Handed-out blocks are untouched.
    pub fn shrink(&mut self) -> usize {
        let destroyed = self.vacant.len();
        while let Some(block) = self.vacant.pop() {
            // SAFETY: a vacant chunk has no outstanding user pointer.
            unsafe { self.destroy(block) };
        }
        self.usable = 0;
        destroyed
    }

    /// Free blocks (retained chunks) in this bin.
    #[must_use]
    pub fn usable(&self) -> usize {
        self.usable
    }

    /// Current statistics snapshot.
    #[cfg(feature = "stats")]
    #[must_use]
    pub fn stats(&self) -> Stats {
        let mut stats = self.stats;
        stats.vacant_chunks = self.vacant.len();
        stats.exhausted_chunks = self.live.len();
        stats
    }

    /// Hand one chunk back to the source.
    ///
    /// # Safety
    ///
    /// `block` must be a live chunk owned by this bin with no outstanding
    /// user pointer.
    unsafe fn destroy(&mut self, block: NonNull<u8>) {
        #[cfg(feature = "stats")]
        {
            self.stats.chunks -= 1;
            self.stats.source_vfrees += 1;
        }
        // SAFETY: reserved with exactly this size and alignment.
        unsafe { self.source.vfree(block, Self::BLOCK, PAGE) };
    }
}

impl<const N: usize, S: ChunkSource> Drop for Bin<N, S> {
    /// Hand every chunk back to the source.
    ///
    /// Dropping while blocks are still handed out is a fault in debug
    /// builds; release builds simply release the memory.
    fn drop(&mut self) {
        while let Some(block) = self.vacant.pop() {
            // SAFETY: retained chunk, no outstanding pointer.
            unsafe { self.destroy(block) };
        }

        #[cfg(debug_assertions)]
        if self.live.len() != 0 {
            fatal(Fault::LiveOnDrop);
        }

        while let Some(addr) = self.live.take_any() {
            // SAFETY: in release builds handed-out chunks are reclaimed
            // wholesale; the client contractually stopped using them.
            unsafe {
                let block = NonNull::new_unchecked(addr as *mut u8);
                self.destroy(block);
            }
        }
    }
}

/// Open-addressing table of handed-out chunk bases.
///
/// Linear probing with the empty slot encoded as zero (chunk bases are
/// page-aligned and never null). Grows by doubling at three-quarters load;
/// never shrinks.
struct SideTable {
    slots: Vec<usize>,
    len: usize,
}

const INITIAL_SLOTS: usize = 16;

impl SideTable {
    const fn new() -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn hash(addr: usize, slots: usize) -> usize {
        (addr >> PAGE.trailing_zeros()).wrapping_mul(0x9e37_79b9_7f4a_7c15) % slots
    }

    fn insert(&mut self, addr: usize) {
        if self.slots.is_empty() {
            self.slots = vec![0; INITIAL_SLOTS];
        } else if (self.len + 1) * 4 > self.slots.len() * 3 {
            self.grow();
        }

        let slots = self.slots.len();
        let mut index = Self::hash(addr, slots);
        while self.slots[index] != 0 {
            index = (index + 1) % slots;
        }
        self.slots[index] = addr;
        self.len += 1;
    }

    /// Remove `addr`; false when it is not in the table.
    fn remove(&mut self, addr: usize) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let slots = self.slots.len();
        let mut index = Self::hash(addr, slots);

        loop {
            match self.slots[index] {
                0 => return false,
                found if found == addr => {
                    self.slots[index] = 0;
                    self.len -= 1;
                    self.reseat_cluster(index);
                    return true;
                }
                _ => index = (index + 1) % slots,
            }
        }
    }

    /// Re-insert the entries following a vacated slot so linear probing
    /// still finds them.
    fn reseat_cluster(&mut self, vacated: usize) {
        let slots = self.slots.len();
        let mut index = (vacated + 1) % slots;

        while self.slots[index] != 0 {
            let addr = self.slots[index];
            self.slots[index] = 0;

            let mut seat = Self::hash(addr, slots);
            while self.slots[seat] != 0 {
                seat = (seat + 1) % slots;
            }
            self.slots[seat] = addr;

            index = (index + 1) % slots;
        }
    }

    fn grow(&mut self) {
        let grown = vec![0; self.slots.len() * 2];
        let old = core::mem::replace(&mut self.slots, grown);
        let slots = self.slots.len();

        for addr in old {
            if addr != 0 {
                let mut index = Self::hash(addr, slots);
                while self.slots[index] != 0 {
                    index = (index + 1) % slots;
                }
                self.slots[index] = addr;
            }
        }
    }

    /// Pop an arbitrary entry; used only when draining.
    fn take_any(&mut self) -> Option<usize> {
        for slot in &mut self.slots {
            if *slot != 0 {
                let addr = core::mem::take(slot);
                self.len -= 1;
                return Some(addr);
            }
        }
        None
    }
}
