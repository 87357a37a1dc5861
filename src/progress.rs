//! Shared progress counters, updated atomically by every pipeline stage.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Progress {
    pub dirs_scanned: AtomicU64,
    pub symlinks_scanned: AtomicU64,
    pub files_scanned: AtomicU64,
    pub specials_scanned: AtomicU64,
    /// File-level errors; a non-zero count turns the run's exit code to 2.
    pub errors: AtomicU64,
    pub original_size: AtomicU64,
    pub hardlink_size: AtomicU64,
    pub duplicate_size: AtomicU64,
    pub saved_by_segmentation: AtomicU64,
    pub filesystem_size: AtomicU64,
    pub block_count: AtomicU64,
    pub chunk_count: AtomicU64,
    pub compressed_size: AtomicU64,
}

impl Progress {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
