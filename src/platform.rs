//! OS backend capability interface: the engine itself is concrete, only
//! the backend is polymorphic, split across `cfg(unix)`/`cfg(windows)`
//! raw-FFI modules that provide the file-backed shared mapping plus
//! byte-range locking and protection the composite cache needs.

#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

use std::io;
use std::path::Path;

/// Page protection requested for a byte range of the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadOnly,
    ReadWrite,
    NoAccess,
}

/// Whether a byte-range lock is exclusive (write) or shared (read).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// Result of a non-blocking lock attempt, distinguishing "would block on a
/// lock held elsewhere" from "would deadlock against this process's own
/// held locks" so callers can apply the EDEADLK recovery policy only to
/// the latter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    WouldBlock,
    WouldDeadlock,
}

/// An open cache file, opaque to everything above [`OsBackend`].
#[cfg(unix)]
pub struct RawHandle(pub std::os::unix::io::RawFd);
#[cfg(windows)]
pub struct RawHandle(pub std::os::windows::io::RawHandle);

#[cfg(unix)]
unsafe impl Send for RawHandle {}
#[cfg(unix)]
unsafe impl Sync for RawHandle {}
#[cfg(windows)]
unsafe impl Send for RawHandle {}
#[cfg(windows)]
unsafe impl Sync for RawHandle {}

/// The capability set the engine needs from the host OS. The engine holds
/// one `&'static dyn OsBackend` and never branches on `cfg(unix)`/
/// `cfg(windows)` itself — only this trait's implementations do.
pub trait OsBackend: Send + Sync {
    fn page_size(&self) -> usize;

    /// Open (creating if absent) the backing file and ensure it is exactly
    /// `total_bytes` long.
    fn create_or_open(&self, path: &Path, total_bytes: u64) -> io::Result<RawHandle>;

    /// Map the first `len` bytes of `handle` into this process, shared with
    /// every other attacher of the same file.
    ///
    /// # Safety
    /// `handle` must stay alive (not closed) for as long as the returned
    /// mapping is in use; `len` must not exceed the file's length.
    unsafe fn map(&self, handle: &RawHandle, len: usize) -> io::Result<*mut u8>;

    /// # Safety
    /// `ptr`/`len` must describe a live mapping created by [`Self::map`].
    unsafe fn unmap(&self, ptr: *mut u8, len: usize) -> io::Result<()>;

    /// # Safety
    /// `ptr`/`len` must lie within a live mapping.
    unsafe fn protect(&self, ptr: *mut u8, len: usize, prot: Protection) -> io::Result<()>;

    /// Flush dirty pages in `[ptr, ptr+len)` to the backing file.
    ///
    /// # Safety
    /// `ptr`/`len` must lie within a live mapping.
    unsafe fn msync(&self, ptr: *mut u8, len: usize) -> io::Result<()>;

    /// Attempt to acquire a byte-range lock without blocking.
    fn try_lock_range(
        &self,
        handle: &RawHandle,
        offset: u64,
        len: u64,
        kind: LockKind,
    ) -> io::Result<LockOutcome>;

    /// Acquire a byte-range lock, blocking until it is available.
    fn lock_range_blocking(
        &self,
        handle: &RawHandle,
        offset: u64,
        len: u64,
        kind: LockKind,
    ) -> io::Result<()>;

    fn unlock_range(&self, handle: &RawHandle, offset: u64, len: u64) -> io::Result<()>;

    /// Remove the cache file from the filesystem.
    fn destroy(&self, path: &Path) -> io::Result<()>;

    /// True if this process can retract a protection change it previously
    /// applied to its own mapping without re-attaching. Always true on
    /// Unix; false on Windows, where the first unprotect of a newly
    /// attached view needs a one-shot workaround (see `platform::windows`).
    fn supports_repeated_unprotect(&self) -> bool {
        true
    }
}

#[cfg(unix)]
pub type Backend = unix::UnixBackend;
#[cfg(windows)]
pub type Backend = windows::WindowsBackend;

/// The process-wide backend instance.
pub fn backend() -> &'static Backend {
    #[cfg(unix)]
    {
        &unix::UnixBackend
    }
    #[cfg(windows)]
    {
        &windows::WindowsBackend
    }
}
