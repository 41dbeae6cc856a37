//! Cross-process lock manager: four abstract locks, each gated in-process
//! by a [`crate::sync::SpinMutex`] before the OS-level file lock is
//! attempted, with the ordering rule "write before read-write-area, never
//! reverse" enforced by [`LockManager`]'s recovery policy on `EDEADLK`.
//!
//! The three recovery cases below: take the conflicting lock in the wrong
//! order, get told by the OS it could deadlock, back off and retry in the
//! blessed order.

use crate::config::RuntimeFlags;
use crate::error::{CceError, LockId};
use crate::platform::{Backend, LockKind, LockOutcome, OsBackend, RawHandle};
use crate::sync::{SpinMutex, SpinMutexGuard};
use log::{debug, warn};
use std::io;

/// Byte offsets within the cache file reserved for each lock's
/// byte-range. A single byte per lock is enough for `fcntl`/`LockFileEx`
/// range locking; they must not overlap.
mod offsets {
    pub const WRITE: u64 = 0;
    pub const READ_WRITE_AREA: u64 = 1;
    pub const ATTACH_READ: u64 = 2;
    pub const HEADER_WRITE: u64 = 3;
}

/// How many consecutive `EDEADLK` responses a single acquisition attempt
/// tolerates before giving up (guards against a livelock between two
/// processes that both insist on the wrong order).
const MAX_DEADLOCK_RETRIES: u32 = 8;

#[derive(Default)]
struct HeldLocks {
    write: bool,
    read_write_area: bool,
}

/// Owns the cache file handle, the in-process gates, and a record of which
/// OS locks this process currently holds, so `EDEADLK` recovery can tell
/// which of the three cases it is in.
pub struct LockManager {
    backend: &'static Backend,
    handle: RawHandle,
    write_gate: SpinMutex<()>,
    read_write_area_gate: SpinMutex<()>,
    attach_read_gate: SpinMutex<()>,
    header_write_gate: SpinMutex<()>,
    held: SpinMutex<HeldLocks>,
    flags: RuntimeFlags,
}

/// RAII guard released on drop; holding one keeps both the in-process gate
/// and the OS-level lock held.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    id: LockId,
    offset: u64,
    _inproc: SpinMutexGuard<'a, ()>,
}

impl LockManager {
    pub fn new(backend: &'static Backend, handle: RawHandle, flags: RuntimeFlags) -> Self {
        Self {
            backend,
            handle,
            write_gate: SpinMutex::new(()),
            read_write_area_gate: SpinMutex::new(()),
            attach_read_gate: SpinMutex::new(()),
            header_write_gate: SpinMutex::new(()),
            held: SpinMutex::new(HeldLocks::default()),
            flags,
        }
    }

    pub fn handle(&self) -> &RawHandle {
        &self.handle
    }

    pub fn enter_write_mutex(&self) -> Result<LockGuard<'_>, CceError> {
        let guard = self.write_gate.lock();
        self.acquire_with_recovery(offsets::WRITE, LockId::Write)?;
        self.held.lock().write = true;
        Ok(LockGuard {
            manager: self,
            id: LockId::Write,
            offset: offsets::WRITE,
            _inproc: guard,
        })
    }

    pub fn enter_read_write_area_mutex(&self) -> Result<LockGuard<'_>, CceError> {
        let guard = self.read_write_area_gate.lock();
        self.acquire_with_recovery(offsets::READ_WRITE_AREA, LockId::ReadWriteArea)?;
        self.held.lock().read_write_area = true;
        Ok(LockGuard {
            manager: self,
            id: LockId::ReadWriteArea,
            offset: offsets::READ_WRITE_AREA,
            _inproc: guard,
        })
    }

    pub fn enter_attach_read_mutex(&self) -> Result<LockGuard<'_>, CceError> {
        let guard = self.attach_read_gate.lock();
        self.backend
            .lock_range_blocking(&self.handle, offsets::ATTACH_READ, 1, LockKind::Shared)
            .map_err(|source| CceError::LockAcquireFailed {
                lock: LockId::AttachRead,
                source,
            })?;
        Ok(LockGuard {
            manager: self,
            id: LockId::AttachRead,
            offset: offsets::ATTACH_READ,
            _inproc: guard,
        })
    }

    pub fn enter_header_write_mutex(&self) -> Result<LockGuard<'_>, CceError> {
        let guard = self.header_write_gate.lock();
        self.backend
            .lock_range_blocking(&self.handle, offsets::HEADER_WRITE, 1, LockKind::Exclusive)
            .map_err(|source| CceError::LockAcquireFailed {
                lock: LockId::HeaderWrite,
                source,
            })?;
        Ok(LockGuard {
            manager: self,
            id: LockId::HeaderWrite,
            offset: offsets::HEADER_WRITE,
            _inproc: guard,
        })
    }

    /// Acquire `offset` as an exclusive lock, applying the three-case
    /// `EDEADLK` recovery policy if the OS reports the attempt could
    /// deadlock against a lock this process already holds.
    fn acquire_with_recovery(&self, offset: u64, id: LockId) -> Result<(), CceError> {
        for attempt in 0..MAX_DEADLOCK_RETRIES {
            match self
                .backend
                .try_lock_range(&self.handle, offset, 1, LockKind::Exclusive)
            {
                Ok(LockOutcome::Acquired) => return Ok(()),
                Ok(LockOutcome::WouldBlock) => {
                    return self
                        .backend
                        .lock_range_blocking(&self.handle, offset, 1, LockKind::Exclusive)
                        .map_err(|source| CceError::LockAcquireFailed { lock: id, source });
                }
                Ok(LockOutcome::WouldDeadlock) => {
                    self.recover_from_deadlock(id, attempt);
                    continue;
                }
                Err(source) => return Err(CceError::LockAcquireFailed { lock: id, source }),
            }
        }
        Err(CceError::LockAcquireFailed {
            lock: id,
            source: io::Error::new(io::ErrorKind::Deadlock, "exceeded EDEADLK recovery retries"),
        })
    }

    /// Case A: we hold read-write-area and are trying for write (the wrong
    /// order) — drop read-write-area so the holder of write can make
    /// progress, then the caller retries.
    ///
    /// Case B: we hold write and are trying for read-write-area — this is
    /// already the blessed order, so releasing write here would invert it
    /// and let another process barge it mid-operation. Keep write held and
    /// just retry the read-write-area acquisition; whatever holds
    /// read-write-area the wrong way around will back off under case A.
    ///
    /// Case C: we hold neither — a transient report from the OS's lock
    /// graph; log and retry without releasing anything.
    fn recover_from_deadlock(&self, id: LockId, attempt: u32) {
        let held = {
            let h = self.held.lock();
            (h.write, h.read_write_area)
        };
        match (id, held) {
            (LockId::Write, (_, true)) => {
                debug!("lock recovery case A: releasing read-write-area to unblock write");
                let _ = self
                    .backend
                    .unlock_range(&self.handle, offsets::READ_WRITE_AREA, 1);
                self.held.lock().read_write_area = false;
            }
            (LockId::ReadWriteArea, (true, _)) => {
                debug!(
                    "lock recovery case B: retrying read-write-area while keeping write held (attempt {attempt})"
                );
            }
            _ => {
                warn!(
                    "lock recovery case C: EDEADLK on {id} with no locally-tracked conflicting lock (attempt {attempt})"
                );
            }
        }
    }

    pub fn flags(&self) -> RuntimeFlags {
        self.flags
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        match self.id {
            LockId::Write => self.manager.held.lock().write = false,
            LockId::ReadWriteArea => self.manager.held.lock().read_write_area = false,
            _ => {}
        }
        let _ = self
            .manager
            .backend
            .unlock_range(&self.manager.handle, self.offset, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_held_flag_on_drop() {
        // Exercises the in-process bookkeeping without touching the OS
        // lock path (covered by the `tests/` integration suite, which
        // needs a real file).
        let held = SpinMutex::new(HeldLocks::default());
        {
            let mut h = held.lock();
            h.write = true;
        }
        assert!(held.lock().write);
    }
}
