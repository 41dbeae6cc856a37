//! Read-only diagnostic snapshot of a cache's space accounting and
//! corruption state. Exposed through
//! [`crate::engine::CompositeCacheEngine::stats`].
//!
//! Per-process "unstored bytes" counters live alongside the snapshot
//! fields: they are never persisted to the shared header, only
//! accumulated locally each time this process observes an allocation
//! refused for lack of space.

use core::sync::atomic::{AtomicU64, Ordering};

/// Accumulates, per attach handle, how many bytes callers tried and failed
/// to store because a budget was exhausted. Advisory and process-local —
/// never written to the shared header.
#[derive(Default)]
pub struct UnstoredBytes {
    softmax: AtomicU64,
    aot: AtomicU64,
    jit: AtomicU64,
}

impl UnstoredBytes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_softmax(&self, bytes: u64) {
        self.softmax.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_aot(&self, bytes: u64) {
        self.aot.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_jit(&self, bytes: u64) {
        self.jit.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn softmax_unstored_bytes(&self) -> u64 {
        self.softmax.load(Ordering::Relaxed)
    }

    pub fn max_aot_unstored_bytes(&self) -> u64 {
        self.aot.load(Ordering::Relaxed)
    }

    pub fn max_jit_unstored_bytes(&self) -> u64 {
        self.jit.load(Ordering::Relaxed)
    }
}

/// A point-in-time snapshot of a cache's space accounting, corruption
/// state, and entry counts. Individual header fields are each read
/// atomically but the snapshot as a whole is not a single consistent view
/// under concurrent writers — sufficient for diagnostics, not for
/// correctness decisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_block_bytes: u64,
    pub soft_max_bytes: u64,
    pub aot_bytes: u64,
    pub min_aot: u64,
    pub max_aot: u64,
    pub jit_bytes: u64,
    pub min_jit: u64,
    pub max_jit: u64,
    pub entry_count: u64,
    pub stale_entry_count: u64,
    pub update_count: u64,
    pub reader_count: u32,
    pub writer_count: u32,
    pub block_space_full: bool,
    pub available_space_full: bool,
    pub aot_full: bool,
    pub jit_full: bool,
    pub corrupt: bool,
    pub softmax_unstored_bytes: u64,
    pub max_aot_unstored_bytes: u64,
    pub max_jit_unstored_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unstored_bytes_accumulate() {
        let u = UnstoredBytes::new();
        u.record_aot(100);
        u.record_aot(50);
        u.record_jit(7);
        assert_eq!(u.max_aot_unstored_bytes(), 150);
        assert_eq!(u.max_jit_unstored_bytes(), 7);
        assert_eq!(u.softmax_unstored_bytes(), 0);
    }

    #[test]
    fn default_snapshot_is_zeroed() {
        let s = CacheStats::default();
        assert_eq!(s.total_bytes, 0);
        assert!(!s.corrupt);
    }
}
