//! Corruption state machine.
//!
//! Once `corrupt_flag` is set in the header, all allocators fail fast. A
//! read-only attacher cannot persist that flag (it never maps the header
//! writable) so it additionally latches a per-process flag — see
//! [`CorruptionState::local_corrupt`].

use core::sync::atomic::{AtomicBool, Ordering};

/// Corruption codes, each carrying a context value at the point of
/// detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CorruptionCode {
    CacheCrcInvalid,
    CacheBadCcInit,
    CacheSizeInvalid,
    CacheDataNull,
    CacheHeaderBadEyecatcher,
    CacheHeaderIncorrectDataLength,
    CacheHeaderIncorrectDataStartAddress,
    CacheHeaderIncorrectCacheSize,
    ItemTypeCorrupt,
    ItemLengthCorrupt,
    RomclassCorrupt,
    AcquireHeaderWriteLockFailed,
    CacheSemaphoreMismatch,
    CacheDebugareaBadFreeSpace,
    CacheDebugareaBadFreeSpaceSize,
    CacheDebugareaBadLvtHeaderInfo,
    CacheDebugareaBadLntHeaderInfo,
}

/// Sticky corruption record plus the per-process latch and the
/// fire-at-most-once "corrupt cache detected" event.
#[derive(Default)]
pub struct CorruptionState {
    /// Mirrors the header's `corrupt_flag`/`corruption_code`/`corrupt_value`
    /// once a writer has been able to persist them.
    header_corrupt: AtomicBool,
    /// Latched locally even when the process cannot write the header
    /// (read-only attach), so further operations still refuse to proceed.
    local_corrupt: AtomicBool,
    /// First detection fires the event exactly once per process.
    event_fired: AtomicBool,
    code: std::sync::Mutex<Option<(CorruptionCode, u64)>>,
}

impl CorruptionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if either the header or this process has recorded corruption.
    pub fn is_corrupt(&self) -> bool {
        self.header_corrupt.load(Ordering::Acquire) || self.local_corrupt.load(Ordering::Acquire)
    }

    /// Record corruption locally (always) and, if `can_write_header` is
    /// true, mark it as persisted too. Returns `true` the first time this
    /// process observes it (i.e. whether the "corrupt cache detected"
    /// event should fire).
    pub fn set_corrupt(
        &self,
        code: CorruptionCode,
        value: u64,
        can_write_header: bool,
    ) -> bool {
        self.local_corrupt.store(true, Ordering::Release);
        if can_write_header {
            self.header_corrupt.store(true, Ordering::Release);
        }
        *self.code.lock().unwrap() = Some((code, value));
        self.event_fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The first corruption code/value recorded by this process, if any.
    pub fn context(&self) -> Option<(CorruptionCode, u64)> {
        *self.code.lock().unwrap()
    }

    /// Load corruption state observed from a freshly-read header (used at
    /// startup, before this process has taken any lock).
    pub fn adopt_header_state(&self, corrupt: bool, code: Option<(CorruptionCode, u64)>) {
        if corrupt {
            self.header_corrupt.store(true, Ordering::Release);
            self.local_corrupt.store(true, Ordering::Release);
            if let Some(c) = code {
                *self.code.lock().unwrap() = Some(c);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once() {
        let st = CorruptionState::new();
        assert!(st.set_corrupt(CorruptionCode::ItemLengthCorrupt, 0, true));
        assert!(!st.set_corrupt(CorruptionCode::ItemLengthCorrupt, 0, true));
        assert!(st.is_corrupt());
    }

    #[test]
    fn read_only_cannot_persist_to_header() {
        let st = CorruptionState::new();
        st.set_corrupt(CorruptionCode::ItemLengthCorrupt, 42, false);
        assert!(st.is_corrupt());
        assert!(!st.header_corrupt.load(Ordering::Acquire));
    }
}
