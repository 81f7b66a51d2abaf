//! Statistics collection for the allocator.
//!
//! Feature-gated under the `stats` feature. These are plain counters
//! mutated inline by the owning allocator; an allocator cannot allocate
//! while reporting, so counters are its whole observability surface.

/// Allocator statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Blocks currently handed out.
    pub live_blocks: usize,
    /// Chunks currently owned, across every depot and `current`.
    pub chunks: usize,
    /// Chunks with every block free at snapshot time.
    pub vacant_chunks: usize,
    /// Chunks with some blocks handed out at snapshot time.
    pub partial_chunks: usize,
    /// Chunks with every block handed out at snapshot time.
    pub exhausted_chunks: usize,
    /// Total successful acquisitions since construction.
    pub total_acquires: u64,
    /// Total releases since construction.
    pub total_releases: u64,
    /// Chunk reservations requested from the platform layer.
    pub source_vallocs: u64,
    /// Chunk releases handed back to the platform layer.
    pub source_vfrees: u64,
}

impl Stats {
    /// Fresh, all-zero statistics.
    pub const fn new() -> Self {
        Self {
            live_blocks: 0,
            chunks: 0,
            vacant_chunks: 0,
            partial_chunks: 0,
            exhausted_chunks: 0,
            total_acquires: 0,
            total_releases: 0,
            source_vallocs: 0,
            source_vfrees: 0,
        }
    }
}
