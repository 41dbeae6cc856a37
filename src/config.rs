//! Configuration inputs and runtime flags.
//!
//! `CacheConfig` mirrors the enumerated `sharedClass*` options; each field
//! accepts `None` for "proportional default to cache size", matching the
//! conventional `-1` sentinel these options use elsewhere.

use serde::{Deserialize, Serialize};

/// Configuration supplied by the host at cache creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Total size of the mapped region, including the header.
    pub total_bytes: u64,
    /// Bytes reserved for the read-write (intern table) sub-region.
    /// `None` picks a proportional default.
    pub read_write_bytes: Option<u64>,
    /// Soft cap on used bytes. `None` defaults to `total_bytes`.
    pub soft_max_bytes: Option<u64>,
    /// Reserved minimum for the AOT sub-account.
    pub min_aot: Option<u64>,
    /// Absolute cap for the AOT sub-account.
    pub max_aot: Option<u64>,
    /// Reserved minimum for the JIT sub-account.
    pub min_jit: Option<u64>,
    /// Absolute cap for the JIT sub-account.
    pub max_jit: Option<u64>,
    /// Bytes reserved for the trailing debug sub-region.
    pub debug_region_bytes: Option<u64>,
    /// Node-count hint for the read-write intern table (informational;
    /// the CCE only reserves bytes, the table layout is the host's concern).
    pub intern_table_node_count: Option<u32>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            total_bytes: 1 << 20,
            read_write_bytes: None,
            soft_max_bytes: None,
            min_aot: None,
            max_aot: None,
            min_jit: None,
            max_jit: None,
            debug_region_bytes: None,
            intern_table_node_count: None,
        }
    }
}

/// Resolved (no more `None`s) sizing derived from a [`CacheConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ResolvedSizes {
    pub total_bytes: u64,
    pub read_write_bytes: u64,
    pub soft_max_bytes: u64,
    pub min_aot: u64,
    pub max_aot: u64,
    pub min_jit: u64,
    pub max_jit: u64,
    pub debug_region_bytes: u64,
}

impl CacheConfig {
    /// Apply the "-1 = proportional default" rule.
    pub fn resolve(&self) -> ResolvedSizes {
        let total = self.total_bytes;
        ResolvedSizes {
            total_bytes: total,
            // Default read-write area: ~1/64th of the cache, rounded to 8.
            read_write_bytes: self
                .read_write_bytes
                .unwrap_or_else(|| (total / 64).max(0) & !7),
            soft_max_bytes: self.soft_max_bytes.unwrap_or(total),
            min_aot: self.min_aot.unwrap_or(0),
            max_aot: self.max_aot.unwrap_or(0),
            min_jit: self.min_jit.unwrap_or(0),
            max_jit: self.max_jit.unwrap_or(0),
            debug_region_bytes: self.debug_region_bytes.unwrap_or(0),
        }
    }
}

/// Runtime flags bitset. Modeled as a `u64` newtype with associated
/// constants, the way the header's own `extra_flags` field is a bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeFlags(pub u64);

impl RuntimeFlags {
    pub const ENABLE_MPROTECT: Self = Self(1 << 0);
    pub const ENABLE_MPROTECT_ALL: Self = Self(1 << 1);
    pub const ENABLE_MPROTECT_RW: Self = Self(1 << 2);
    pub const ENABLE_MPROTECT_PARTIAL_PAGES: Self = Self(1 << 3);
    pub const MPROTECT_PARTIAL_PAGES_ON_STARTUP: Self = Self(1 << 4);
    pub const ENABLE_MPROTECT_ONFIND: Self = Self(1 << 5);
    pub const ENABLE_ROUND_TO_PAGE_SIZE: Self = Self(1 << 6);
    pub const ENABLE_MSYNC: Self = Self(1 << 7);
    pub const ENABLE_READONLY: Self = Self(1 << 8);
    pub const ENABLE_REDUCE_STORE_CONTENTION: Self = Self(1 << 9);
    pub const ENABLE_STATS: Self = Self(1 << 10);
    pub const DO_NOT_CREATE_CACHE: Self = Self(1 << 11);
    pub const SNAPSHOT: Self = Self(1 << 12);
    pub const DENY_CACHE_UPDATES: Self = Self(1 << 13);
    pub const DISABLE_CORRUPT_CACHE_DUMPS: Self = Self(1 << 14);
    pub const DETECT_NETWORK_CACHE: Self = Self(1 << 15);
    pub const FORCE_DUMP_IF_CORRUPT: Self = Self(1 << 16);
    pub const RESTRICT_CLASSPATHS: Self = Self(1 << 17);
    pub const ALLOW_CLASSPATHS: Self = Self(1 << 18);

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl core::ops::BitOr for RuntimeFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_defaults() {
        let cfg = CacheConfig {
            total_bytes: 65536,
            ..Default::default()
        };
        let sizes = cfg.resolve();
        assert_eq!(sizes.total_bytes, 65536);
        assert_eq!(sizes.soft_max_bytes, 65536);
        assert_eq!(sizes.min_aot, 0);
    }

    #[test]
    fn runtime_flags_bitset() {
        let f = RuntimeFlags::ENABLE_MPROTECT | RuntimeFlags::ENABLE_STATS;
        assert!(f.contains(RuntimeFlags::ENABLE_MPROTECT));
        assert!(f.contains(RuntimeFlags::ENABLE_STATS));
        assert!(!f.contains(RuntimeFlags::ENABLE_MSYNC));
        let f = f.without(RuntimeFlags::ENABLE_MPROTECT);
        assert!(!f.contains(RuntimeFlags::ENABLE_MPROTECT));
    }
}
