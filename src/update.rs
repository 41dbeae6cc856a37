//! Update propagation and the write-hash coalescer: a monotone
//! `update_count` readers snapshot to detect newly committed entries, and
//! a best-effort hash slot writers use to avoid duplicating each other's
//! work.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const WRITEHASH_SHIFT: u32 = 20;
const WRITEHASH_MASK: u32 = 0x000F_FFFF;
/// `jvm_id` only has 12 bits of room once packed into `write_hash` above
/// `WRITEHASH_MASK`'s 20 bits; mask defensively so a wider id can never
/// overflow the shift.
const WRITEHASH_JVM_ID_MASK: u32 = 0x0FFF;
const FAILED_WRITEHASH_MAX_COUNT: u32 = 20;

/// Tracks this attach handle's last-observed `update_count` so
/// [`UpdatePropagator::check_updates`] can report whether new committed
/// entries exist since the last call, without re-walking the whole chain.
pub struct UpdatePropagator {
    old_update_count: AtomicU64,
}

impl UpdatePropagator {
    pub fn new() -> Self {
        Self {
            old_update_count: AtomicU64::new(0),
        }
    }

    /// Number of entries committed since this handle last called
    /// [`Self::done_read_updates`]. Uses `Acquire` so a nonzero result
    /// happens-after every write committed before the counter bump it
    /// observed.
    pub fn check_updates(&self, shared_update_count: &AtomicU64) -> u64 {
        let current = shared_update_count.load(Ordering::Acquire);
        current.saturating_sub(self.old_update_count.load(Ordering::Relaxed))
    }

    /// Record that this handle has applied `n` of the pending updates
    /// reported by [`Self::check_updates`].
    pub fn done_read_updates(&self, n: u64) {
        self.old_update_count.fetch_add(n, Ordering::Relaxed);
    }

    /// Bump the shared counter after committing a new entry. `Release` so
    /// every byte of the entry is visible to any reader that observes the
    /// new count via `Acquire`.
    pub fn publish_update(&self, shared_update_count: &AtomicU64) {
        shared_update_count.fetch_add(1, Ordering::Release);
    }
}

impl Default for UpdatePropagator {
    fn default() -> Self {
        Self::new()
    }
}

/// Advisory, best-effort de-duplication of near-simultaneous writes of the
/// same (jvm, name) pair across processes: each writer tests-and-sets a
/// packed hash in the header before acquiring the write lock, so a writer
/// that sees its own hash already staked out can skip redundant work.
/// Never a correctness mechanism — a missed coalesce just means duplicate
/// (but individually valid) entries.
pub struct WriteHashCoalescer {
    failed_count: AtomicU32,
}

impl WriteHashCoalescer {
    pub fn new() -> Self {
        Self {
            failed_count: AtomicU32::new(0),
        }
    }

    fn pack(jvm_id: u16, name_hash: u32) -> u32 {
        ((jvm_id as u32 & WRITEHASH_JVM_ID_MASK) << WRITEHASH_SHIFT) | (name_hash & WRITEHASH_MASK)
    }

    /// Try to claim `(jvm_id, name_hash)` in `write_hash`. Returns `true`
    /// if this call claimed it (the slot was free or already ours),
    /// `false` if another writer holds it and the caller should proceed
    /// without coalescing.
    pub fn test_and_set_write_hash(
        &self,
        write_hash: &AtomicU32,
        jvm_id: u16,
        name_hash: u32,
    ) -> bool {
        let packed = Self::pack(jvm_id, name_hash);
        match write_hash.compare_exchange(0, packed, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(existing) if existing == packed => true,
            Err(_) => {
                let failed = self.failed_count.fetch_add(1, Ordering::Relaxed) + 1;
                if failed >= FAILED_WRITEHASH_MAX_COUNT {
                    // Too many writers are contending for distinct hashes
                    // to be useful; clear the slot so the next writer
                    // starts fresh instead of spinning on a stale claim.
                    write_hash.store(0, Ordering::Release);
                    self.failed_count.store(0, Ordering::Relaxed);
                }
                false
            }
        }
    }

    /// Release a previously claimed hash. No-op if `write_hash` no longer
    /// matches `(jvm_id, name_hash)` (another writer already cleared or
    /// reclaimed it).
    pub fn try_reset_write_hash(&self, write_hash: &AtomicU32, jvm_id: u16, name_hash: u32) {
        let packed = Self::pack(jvm_id, name_hash);
        let _ = write_hash.compare_exchange(packed, 0, Ordering::AcqRel, Ordering::Acquire);
        self.failed_count.store(0, Ordering::Relaxed);
    }
}

impl Default for WriteHashCoalescer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_updates_sees_advance_after_publish() {
        let shared = AtomicU64::new(0);
        let prop = UpdatePropagator::new();
        assert_eq!(prop.check_updates(&shared), 0);
        prop.publish_update(&shared);
        assert_eq!(prop.check_updates(&shared), 1);
        prop.done_read_updates(1);
        assert_eq!(prop.check_updates(&shared), 0);
    }

    #[test]
    fn write_hash_coalesces_same_key() {
        let hash = AtomicU32::new(0);
        let coalescer = WriteHashCoalescer::new();
        assert!(coalescer.test_and_set_write_hash(&hash, 3, 0xABCDE));
        assert!(coalescer.test_and_set_write_hash(&hash, 3, 0xABCDE));
        assert!(!coalescer.test_and_set_write_hash(&hash, 4, 0x11111));
        coalescer.try_reset_write_hash(&hash, 3, 0xABCDE);
        assert_eq!(hash.load(Ordering::Acquire), 0);
    }

    #[test]
    fn failed_attempts_reset_after_threshold() {
        let hash = AtomicU32::new(0);
        let coalescer = WriteHashCoalescer::new();
        assert!(coalescer.test_and_set_write_hash(&hash, 1, 1));
        for _ in 0..FAILED_WRITEHASH_MAX_COUNT {
            coalescer.test_and_set_write_hash(&hash, 2, 2);
        }
        assert_eq!(hash.load(Ordering::Acquire), 0);
    }
}
