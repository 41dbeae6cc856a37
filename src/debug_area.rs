//! Debug sub-region sub-allocator: a trailing region holding two stacks
//! that grow toward each other, one for line-number tables and one for
//! local-variable tables. Reuses the same "reserve, write,
//! commit-advances-the-pointer" shape as [`crate::allocator::CacheAllocator`]
//! since both are two-ended bump allocators over one region — the debug
//! area's two ends just happen to both live past the debug region's start
//! instead of spanning the whole cache.

use crate::corruption::CorruptionCode;
use core::sync::atomic::Ordering;

use crate::header::CacheHeader;

/// One piece of a class's debug data: an offset into the debug sub-region
/// and the number of bytes reserved there.
#[derive(Debug, Clone, Copy)]
pub struct DebugPiece {
    pub offset: u64,
    pub len: u64,
}

/// The two pieces `allocate_class_debug_data` hands back: line-number table
/// bytes grow from `line_number_table_next_srp` forward (toward the end of
/// the cache); local-variable table bytes grow from
/// `local_variable_table_next_srp` backward (toward the debug region's
/// start).
pub struct DebugAllocation {
    pub line_number_table: Option<DebugPiece>,
    pub local_variable_table: Option<DebugPiece>,
}

/// Requested sizes for one class's debug data; either may be zero to skip
/// that piece (the `extra_flags` `NO_LINE_NUMBERS` bit means callers often
/// skip the line-number table entirely).
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugSizes {
    pub line_number_table_bytes: u64,
    pub local_variable_table_bytes: u64,
}

fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

/// Sub-allocator over `[debug_start, total_bytes)`. `line_number_table`
/// grows from `debug_start` upward; `local_variable_table` grows from
/// `total_bytes` downward; free space is the gap between the two.
pub struct DebugAreaAllocator {
    base: *mut u8,
    debug_start: u64,
    total_bytes: u64,
}

unsafe impl Send for DebugAreaAllocator {}
unsafe impl Sync for DebugAreaAllocator {}

impl DebugAreaAllocator {
    pub fn new(base: *mut u8, total_bytes: u64, debug_region_bytes: u64) -> Self {
        Self {
            base,
            debug_start: total_bytes - debug_region_bytes,
            total_bytes,
        }
    }

    #[inline]
    fn header<'a>(&self) -> &'a CacheHeader {
        unsafe { &*(self.base as *const CacheHeader) }
    }

    fn lnt_next(&self, header: &CacheHeader) -> u64 {
        unsafe { header.line_number_table_next_srp.offset_from(self.base) }
            .unwrap_or(self.debug_start as usize) as u64
    }

    fn lvt_next(&self, header: &CacheHeader) -> u64 {
        unsafe { header.local_variable_table_next_srp.offset_from(self.base) }
            .unwrap_or(self.total_bytes as usize) as u64
    }

    /// Free bytes currently available between the two ends of the debug
    /// stack. Returns `None`, meaning the region is corrupt, if the two
    /// pointers have crossed or lie outside `[debug_start, total_bytes]`.
    pub fn free_bytes(&self) -> Option<u64> {
        let header = self.header();
        let lnt = self.lnt_next(header);
        let lvt = self.lvt_next(header);
        if lnt > lvt || lnt < self.debug_start || lvt > self.total_bytes {
            return None;
        }
        Some(lvt - lnt)
    }

    /// Reserve space for one class's debug data. Does not write any bytes;
    /// returns the offsets the caller should write line-number/local-
    /// variable bytes into. Caller must follow with [`Self::commit`] or
    /// [`Self::rollback`] before reserving again (single outstanding
    /// reservation, matching the bump allocator's contract).
    pub fn reserve(&self, sizes: DebugSizes) -> Result<DebugAllocation, CorruptionCode> {
        let free = self.free_bytes().ok_or(CorruptionCode::CacheDebugareaBadFreeSpace)?;
        let lnt_len = align8(sizes.line_number_table_bytes);
        let lvt_len = align8(sizes.local_variable_table_bytes);
        if lnt_len + lvt_len > free {
            return Err(CorruptionCode::CacheDebugareaBadFreeSpaceSize);
        }

        let header = self.header();
        let lnt_start = self.lnt_next(header);
        let lvt_start = self.lvt_next(header);

        let line_number_table = (lnt_len > 0).then_some(DebugPiece {
            offset: lnt_start,
            len: lnt_len,
        });
        let local_variable_table = (lvt_len > 0).then_some(DebugPiece {
            offset: lvt_start - lvt_len,
            len: lvt_len,
        });
        Ok(DebugAllocation {
            line_number_table,
            local_variable_table,
        })
    }

    /// Advance both stack pointers past a reservation returned by
    /// [`Self::reserve`] that the caller has finished writing into.
    pub fn commit(&self, allocation: &DebugAllocation) {
        let header = self.header();
        if let Some(p) = allocation.line_number_table {
            unsafe {
                header
                    .line_number_table_next_srp
                    .set_offset_from(self.base, (p.offset + p.len) as usize)
            };
        }
        if let Some(p) = allocation.local_variable_table {
            unsafe {
                header
                    .local_variable_table_next_srp
                    .set_offset_from(self.base, p.offset as usize)
            };
        }
    }

    /// Discard a reservation that was never committed; the stack pointers
    /// were never advanced by `reserve`, so there is nothing to undo.
    pub fn rollback(&self, _allocation: &DebugAllocation) {}

    /// Validate that the two stack pointers lie within `[debug_start,
    /// total_bytes]` and have not crossed, returning the appropriate
    /// `CACHE_DEBUGAREA_*` code otherwise.
    pub fn validate(&self) -> Result<(), CorruptionCode> {
        let header = self.header();
        let lnt = self.lnt_next(header);
        if lnt < self.debug_start || lnt > self.total_bytes {
            return Err(CorruptionCode::CacheDebugareaBadLntHeaderInfo);
        }
        let lvt = self.lvt_next(header);
        if lvt < self.debug_start || lvt > self.total_bytes {
            return Err(CorruptionCode::CacheDebugareaBadLvtHeaderInfo);
        }
        if lnt > lvt {
            return Err(CorruptionCode::CacheDebugareaBadFreeSpace);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::CacheHeader;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    fn with_debug_area(total: u64, debug_bytes: u64, f: impl FnOnce(DebugAreaAllocator)) {
        let layout = Layout::from_size_align(total as usize, 8).unwrap();
        unsafe {
            let base = alloc_zeroed(layout);
            let header = base as *mut CacheHeader;
            CacheHeader::init(header, base, total, 0, debug_bytes, total, 0, 0, 0, 0, 4096);
            let alloc = DebugAreaAllocator::new(base, total, debug_bytes);
            f(alloc);
            dealloc(base, layout);
        }
    }

    #[test]
    fn reserve_commit_advances_both_ends() {
        with_debug_area(4096, 1024, |alloc| {
            let free_before = alloc.free_bytes().unwrap();
            let res = alloc
                .reserve(DebugSizes {
                    line_number_table_bytes: 40,
                    local_variable_table_bytes: 24,
                })
                .unwrap();
            alloc.commit(&res);
            let free_after = alloc.free_bytes().unwrap();
            assert_eq!(free_before - free_after, 40 + 24);
        });
    }

    #[test]
    fn rollback_leaves_pointers_untouched() {
        with_debug_area(4096, 1024, |alloc| {
            let free_before = alloc.free_bytes().unwrap();
            let res = alloc
                .reserve(DebugSizes {
                    line_number_table_bytes: 64,
                    local_variable_table_bytes: 0,
                })
                .unwrap();
            alloc.rollback(&res);
            assert_eq!(alloc.free_bytes().unwrap(), free_before);
        });
    }

    #[test]
    fn oversized_request_is_rejected() {
        with_debug_area(512, 256, |alloc| {
            let err = alloc.reserve(DebugSizes {
                line_number_table_bytes: 1000,
                local_variable_table_bytes: 0,
            });
            assert!(matches!(
                err,
                Err(CorruptionCode::CacheDebugareaBadFreeSpaceSize)
            ));
        });
    }

    #[test]
    fn validate_passes_on_fresh_region() {
        with_debug_area(4096, 1024, |alloc| {
            assert!(alloc.validate().is_ok());
        });
    }
}
