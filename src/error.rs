//! Error types for the composite cache engine.

use crate::corruption::CorruptionCode;
use core::fmt;

/// A region of the cache whose allocation budget has been exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Block,
    Aot,
    Jit,
    Available,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Region::Block => "block",
            Region::Aot => "AOT",
            Region::Jit => "JIT",
            Region::Available => "available",
        };
        f.write_str(s)
    }
}

/// One of the four abstract lock IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockId {
    Write,
    ReadWriteArea,
    AttachRead,
    HeaderWrite,
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockId::Write => "write",
            LockId::ReadWriteArea => "read-write-area",
            LockId::AttachRead => "attach-read",
            LockId::HeaderWrite => "header-write",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by startup; the caller decides whether a reset or
/// soft-reset is safe.
#[derive(thiserror::Error, Debug)]
pub enum StartupError {
    #[error("cache is corrupt: {code:?} (value={value:#x})")]
    Corrupt {
        code: CorruptionCode,
        value: u64,
    },
    #[error("cache startup failed: {0}")]
    Failed(String),
    #[error("cache must be reset (incompatible or unsafe to reuse)")]
    Reset,
    #[error("cache can be soft-reset (compatible but stale)")]
    SoftReset,
    #[error("no cache is present and creation was suppressed")]
    NoCache,
    #[error("no cachelets are present")]
    NoCachelets,
}

/// Top-level error type for every fallible CCE operation.
#[derive(thiserror::Error, Debug)]
pub enum CceError {
    #[error("{region} allocation space is full")]
    AllocationFull { region: Region },

    #[error("cache is corrupt: {code:?} (value={value:#x})")]
    Corrupt { code: CorruptionCode, value: u64 },

    #[error("startup failed")]
    Startup(#[from] StartupError),

    #[error("failed to acquire {lock} lock: {source}")]
    LockAcquireFailed {
        lock: LockId,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O failure")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, CceError>;
