//! Memory-protection state machine: nested ref-counted unprotect/protect
//! with an RAII scoped-acquisition guard whose destructor re-protects.
//!
//! Nesting matters because several call paths unprotect the same region
//! for the duration of an operation that itself calls into another
//! operation that also wants it unprotected; only the outermost caller's
//! drop should actually reprotect.

use crate::platform::{Backend, OsBackend, Protection};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use log::trace;

/// One counted, re-protectable region of the mapping.
struct Region {
    ptr: *mut u8,
    len: usize,
    cntr: AtomicU32,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// Tracks the two regions the engine ever unprotects: the header proper,
/// and the read-write (intern table) sub-region. Both nest independently.
pub struct HeaderProtector {
    backend: &'static Backend,
    header: Region,
    read_write: Region,
    enabled: bool,
    partial_pages: bool,
    partial_pages_on_startup: bool,
    page_size: u64,
    /// Set once this process has completed the Windows one-shot
    /// adjacent-page workaround for a given region; a no-op everywhere
    /// else.
    windows_primed: AtomicU64,
}

/// Held while a region is (at least locally) unprotected; reprotects on
/// drop if this was the outermost acquisition.
pub struct ProtectGuard<'a> {
    protector: &'a HeaderProtector,
    which: Which,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Which {
    Header,
    ReadWrite,
}

impl HeaderProtector {
    pub fn new(
        backend: &'static Backend,
        header_ptr: *mut u8,
        header_len: usize,
        read_write_ptr: *mut u8,
        read_write_len: usize,
        enabled: bool,
        partial_pages: bool,
        partial_pages_on_startup: bool,
    ) -> Self {
        Self {
            backend,
            header: Region {
                ptr: header_ptr,
                len: header_len,
                cntr: AtomicU32::new(0),
            },
            read_write: Region {
                ptr: read_write_ptr,
                len: read_write_len,
                cntr: AtomicU32::new(0),
            },
            enabled,
            partial_pages,
            partial_pages_on_startup,
            page_size: backend.page_size() as u64,
            windows_primed: AtomicU64::new(0),
        }
    }

    /// Round `ptr`/`len` out to whole pages unless `partial_pages` allows
    /// mprotect'ing only the bytes actually touched.
    fn page_align(&self, ptr: *mut u8, len: usize) -> (*mut u8, usize) {
        if self.partial_pages {
            return (ptr, len);
        }
        let page = self.page_size as usize;
        let addr = ptr as usize;
        let aligned_addr = addr & !(page - 1);
        let end = addr + len;
        let aligned_end = (end + page - 1) & !(page - 1);
        (aligned_addr as *mut u8, aligned_end - aligned_addr)
    }

    /// Unprotect the header region for the duration of the returned
    /// guard. Safe to call re-entrantly from the same thread.
    pub fn unprotect_header(&self) -> ProtectGuard<'_> {
        self.unprotect(&self.header, Which::Header);
        ProtectGuard {
            protector: self,
            which: Which::Header,
        }
    }

    pub fn unprotect_read_write(&self) -> ProtectGuard<'_> {
        self.unprotect(&self.read_write, Which::ReadWrite);
        ProtectGuard {
            protector: self,
            which: Which::ReadWrite,
        }
    }

    fn unprotect(&self, region: &Region, which: Which) {
        if !self.enabled {
            return;
        }
        if region.cntr.fetch_add(1, Ordering::AcqRel) == 0 {
            let (ptr, len) = self.page_align(region.ptr, region.len);
            trace!("unprotecting {len} bytes at {ptr:p}");
            unsafe {
                let _ = self.backend.protect(ptr, len, Protection::ReadWrite);
            }
            if !self.backend.supports_repeated_unprotect() {
                self.mark_windows_primed(which);
            }
        }
    }

    fn reprotect(&self, region: &Region) {
        if !self.enabled {
            return;
        }
        if region.cntr.fetch_sub(1, Ordering::AcqRel) == 1 {
            let (ptr, len) = self.page_align(region.ptr, region.len);
            trace!("reprotecting {len} bytes at {ptr:p}");
            unsafe {
                let _ = self.backend.protect(ptr, len, Protection::ReadOnly);
            }
        }
    }

    fn mark_windows_primed(&self, which: Which) {
        let bit = match which {
            Which::Header => 1,
            Which::ReadWrite => 2,
        };
        self.windows_primed.fetch_or(bit, Ordering::AcqRel);
    }

    /// True once the first unprotect for `which` has completed on a
    /// backend that needs the Windows one-shot workaround (harmless
    /// elsewhere — see `platform::windows::WindowsBackend`).
    pub fn windows_primed(&self, which_header: bool) -> bool {
        let bit = if which_header { 1 } else { 2 };
        (self.windows_primed.load(Ordering::Acquire) & bit) != 0
    }

    /// Whether the partial-page policy is in effect for the current phase.
    /// `ENABLE_MPROTECT_PARTIAL_PAGES` gates the feature outright;
    /// `MPROTECT_PARTIAL_PAGES_ON_STARTUP` additionally gates it during
    /// startup, since rounding to whole pages while the region is still
    /// being populated is cheaper and some callers want that during
    /// startup even with the feature otherwise enabled.
    fn partial_pages_active(&self, on_startup: bool) -> bool {
        self.partial_pages && (!on_startup || self.partial_pages_on_startup)
    }

    /// Protect just the partially-filled page at `frontier` — the
    /// not-yet-full page at a monotonically advancing boundary (segment or
    /// metadata) — instead of the whole region, when the partial-page
    /// policy is active for this phase. No-op otherwise, and no-op if
    /// protection itself is disabled.
    pub fn protect_partial_pages(&self, frontier: *mut u8, on_startup: bool) {
        if !self.enabled || !self.partial_pages_active(on_startup) {
            return;
        }
        let page = self.page_size as usize;
        let page_start = (frontier as usize) & !(page - 1);
        trace!("protecting partial page at {:p}", page_start as *mut u8);
        unsafe {
            let _ = self
                .backend
                .protect(page_start as *mut u8, page, Protection::ReadOnly);
        }
    }

    /// Undo [`Self::protect_partial_pages`] for the page containing
    /// `frontier`, making it writable again so the allocator can keep
    /// bumping into it.
    pub fn unprotect_partial_pages(&self, frontier: *mut u8, on_startup: bool) {
        if !self.enabled || !self.partial_pages_active(on_startup) {
            return;
        }
        let page = self.page_size as usize;
        let page_start = (frontier as usize) & !(page - 1);
        trace!("unprotecting partial page at {:p}", page_start as *mut u8);
        unsafe {
            let _ = self
                .backend
                .protect(page_start as *mut u8, page, Protection::ReadWrite);
        }
    }
}

impl Drop for ProtectGuard<'_> {
    fn drop(&mut self) {
        match self.which {
            Which::Header => self.protector.reprotect(&self.protector.header),
            Which::ReadWrite => self.protector.reprotect(&self.protector.read_write),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_align_rounds_to_whole_pages() {
        let backend = crate::platform::backend();
        let protector = HeaderProtector::new(
            backend,
            0x10 as *mut u8,
            8,
            0x2000 as *mut u8,
            16,
            true,
            false,
            false,
        );
        let (ptr, len) = protector.page_align(0x10 as *mut u8, 8);
        assert_eq!(ptr as usize, 0);
        assert!(len >= 8);
    }

    #[test]
    fn partial_pages_disables_rounding() {
        let backend = crate::platform::backend();
        let protector = HeaderProtector::new(
            backend,
            0x10 as *mut u8,
            8,
            0x2000 as *mut u8,
            16,
            true,
            true,
            true,
        );
        let (ptr, len) = protector.page_align(0x10 as *mut u8, 8);
        assert_eq!(ptr as usize, 0x10);
        assert_eq!(len, 8);
    }

    #[test]
    fn protect_partial_pages_respects_on_startup_gate() {
        let backend = crate::platform::backend();
        // partial_pages enabled, but MPROTECT_PARTIAL_PAGES_ON_STARTUP is
        // not, so the startup call is a no-op and the post-startup call is
        // active.
        let protector = HeaderProtector::new(
            backend,
            0x10 as *mut u8,
            8,
            0x2000 as *mut u8,
            16,
            true,
            true,
            false,
        );
        assert!(!protector.partial_pages_active(true));
        assert!(protector.partial_pages_active(false));
    }
}
