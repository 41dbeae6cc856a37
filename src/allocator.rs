//! Bidirectional bump allocator over the composite cache region: segment
//! bytes grow forward from `segment_srp`, metadata entries grow backward
//! from `update_srp`, both out of one contiguous region. The cache never
//! frees or coalesces an individual entry — committed data is either live
//! or marked stale — so this is a pair of straight-line bump pointers
//! rather than a free-list-backed allocator.

use crate::error::{CceError, Region};
use crate::header::{CacheHeader, ShcItem, ShcItemHdr, DUMMY_DATA_BYTE};
use core::sync::atomic::Ordering;
use log::{trace, warn};

/// Minimum slack kept between the segment area's high-water mark and the
/// metadata area's low-water mark so the two bump pointers are never
/// observed touching exactly.
const MIN_REGION_GAP: u64 = 8;

fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

/// Which sub-account an allocation is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Account {
    Block,
    Aot,
    Jit,
}

/// A reserved-but-not-yet-committed segment byte range.
pub struct SegmentReservation {
    pub offset: u64,
    pub len: u64,
}

/// A reserved-but-not-yet-committed metadata entry slot.
pub struct MetadataReservation {
    pub offset: u64,
    pub total_len: u64,
}

pub struct CacheAllocator {
    base: *mut u8,
    total_bytes: u64,
    read_write_bytes: u64,
    metadata_start: u64,
}

unsafe impl Send for CacheAllocator {}
unsafe impl Sync for CacheAllocator {}

impl CacheAllocator {
    pub fn new(base: *mut u8, total_bytes: u64, read_write_bytes: u64, debug_region_bytes: u64) -> Self {
        Self {
            base,
            total_bytes,
            read_write_bytes,
            metadata_start: total_bytes - debug_region_bytes,
        }
    }

    #[inline]
    fn header<'a>(&self) -> &'a CacheHeader {
        unsafe { &*(self.base as *const CacheHeader) }
    }

    /// Total bytes currently committed across both ends of the bump
    /// region (segment bytes plus metadata entries), for diagnostics and
    /// softmax bookkeeping outside the allocator itself.
    pub fn used_bytes_public(&self) -> u64 {
        self.used_bytes(self.header())
    }

    fn used_bytes(&self, header: &CacheHeader) -> u64 {
        let segment_used = unsafe { header.segment_srp.offset_from(self.base) }
            .unwrap_or(self.read_write_bytes as usize) as u64;
        let update_off = unsafe { header.update_srp.offset_from(self.base) }
            .unwrap_or(self.metadata_start as usize) as u64;
        let metadata_used = self.metadata_start - update_off;
        segment_used - self.read_write_bytes + metadata_used
    }

    fn reserved_for_others(&self, header: &CacheHeader, except: Account) -> u64 {
        let mut reserved = 0u64;
        if except != Account::Aot {
            let min_aot = header.min_aot.load(Ordering::Relaxed);
            let aot_bytes = header.aot_bytes.load(Ordering::Relaxed);
            reserved += min_aot.saturating_sub(aot_bytes);
        }
        if except != Account::Jit {
            let min_jit = header.min_jit.load(Ordering::Relaxed);
            let jit_bytes = header.jit_bytes.load(Ordering::Relaxed);
            reserved += min_jit.saturating_sub(jit_bytes);
        }
        reserved
    }

    /// Check the softmax budget and, for AOT/JIT, the per-account cap.
    /// `account` is charged `need` additional bytes.
    fn check_budget(&self, header: &CacheHeader, account: Account, need: u64) -> Result<(), CceError> {
        let soft_max = header.soft_max_bytes.load(Ordering::Relaxed);
        let used = self.used_bytes(header);
        let reserved = self.reserved_for_others(header, account);
        if used + need + reserved > soft_max {
            return Err(CceError::AllocationFull {
                region: match account {
                    Account::Block => Region::Block,
                    Account::Aot => Region::Aot,
                    Account::Jit => Region::Jit,
                },
            });
        }
        match account {
            Account::Aot => {
                let max_aot = header.max_aot.load(Ordering::Relaxed);
                let aot_bytes = header.aot_bytes.load(Ordering::Relaxed);
                if max_aot != 0 && aot_bytes + need > max_aot {
                    return Err(CceError::AllocationFull { region: Region::Aot });
                }
            }
            Account::Jit => {
                let max_jit = header.max_jit.load(Ordering::Relaxed);
                let jit_bytes = header.jit_bytes.load(Ordering::Relaxed);
                if max_jit != 0 && jit_bytes + need > max_jit {
                    return Err(CceError::AllocationFull { region: Region::Jit });
                }
            }
            Account::Block => {}
        }
        Ok(())
    }

    /// Reserve `len` segment bytes (caller must hold the write lock).
    /// Returns the byte offset (from the region base) the caller may write
    /// into once reserved; the reservation is not visible to other
    /// attachers until a matching metadata entry is committed.
    pub fn reserve_segment(
        &self,
        account: Account,
        len: u64,
    ) -> Result<SegmentReservation, CceError> {
        let header = self.header();
        let len = align8(len);
        self.check_budget(header, account, len)?;

        let cur = unsafe { header.segment_srp.offset_from(self.base) }
            .unwrap_or(self.read_write_bytes as usize) as u64;
        let update_off = unsafe { header.update_srp.offset_from(self.base) }
            .unwrap_or(self.metadata_start as usize) as u64;
        let new_cur = cur + len;
        if new_cur + MIN_REGION_GAP > update_off {
            self.fill_dummy_and_mark_full(header);
            return Err(CceError::AllocationFull { region: Region::Block });
        }
        Ok(SegmentReservation { offset: cur, len })
    }

    /// Commit a previously reserved segment range: advance `segment_srp`
    /// past it. Must be called with the same `len` used to reserve.
    pub fn commit_segment(&self, reservation: &SegmentReservation) {
        let header = self.header();
        let new_off = reservation.offset + reservation.len;
        unsafe { header.segment_srp.set_offset_from(self.base, new_off as usize) };
        trace!("committed segment bytes [{}, {})", reservation.offset, new_off);
    }

    /// Undo a reservation that was never committed (the write lock must
    /// still be held and no other reservation may have been made since).
    pub fn rollback_segment(&self, _reservation: &SegmentReservation) {
        // Bump pointers were never advanced by `reserve_segment`, only
        // computed; nothing to undo.
    }

    /// Reserve and write a metadata entry's prefix (`ShcItemHdr` +
    /// `ShcItem`) for a payload of `payload_len` bytes already written (or
    /// about to be written) at `segment_offset`. Bumps `update_srp`
    /// downward by the 8-aligned total entry length.
    pub fn reserve_metadata(
        &self,
        account: Account,
        data_type: u16,
        jvm_id: u16,
        payload_len: u32,
    ) -> Result<MetadataReservation, CceError> {
        let header = self.header();
        let entry_len = align8((core::mem::size_of::<ShcItemHdr>()
            + core::mem::size_of::<ShcItem>()) as u64
            + payload_len as u64);
        self.check_budget(header, account, entry_len)?;

        let update_off = unsafe { header.update_srp.offset_from(self.base) }
            .unwrap_or(self.metadata_start as usize) as u64;
        let segment_off = unsafe { header.segment_srp.offset_from(self.base) }
            .unwrap_or(self.read_write_bytes as usize) as u64;
        if update_off < entry_len || update_off - entry_len < segment_off + MIN_REGION_GAP {
            self.fill_dummy_and_mark_full(header);
            return Err(CceError::AllocationFull { region: Region::Block });
        }
        let new_update_off = update_off - entry_len;
        Ok(MetadataReservation {
            offset: new_update_off,
            total_len: entry_len,
        })
    }

    /// Commit a reserved metadata entry: write its `ShcItemHdr`/`ShcItem`
    /// prefix and advance `update_srp`, `last_metadata_type`, and the
    /// per-account byte counters. The caller must have already written the
    /// payload bytes at `reservation.offset + prefix_len`.
    ///
    /// # Safety
    /// `reservation` must have come from [`Self::reserve_metadata`] on this
    /// allocator with no intervening commit, and the payload bytes must
    /// already be written.
    pub unsafe fn commit_metadata(
        &self,
        account: Account,
        reservation: &MetadataReservation,
        data_type: u16,
        jvm_id: u16,
        payload_len: u32,
    ) {
        let header = self.header();
        let hdr_ptr = unsafe { self.base.add(reservation.offset as usize) } as *mut ShcItemHdr;
        let item_ptr = unsafe {
            self.base
                .add(reservation.offset as usize + core::mem::size_of::<ShcItemHdr>())
        } as *mut ShcItem;
        unsafe {
            hdr_ptr.write(ShcItemHdr::new(reservation.total_len as u32));
            item_ptr.write(ShcItem {
                payload_length: payload_len,
                data_type,
                jvm_id,
            });
        }

        unsafe {
            header
                .update_srp
                .set_offset_from(self.base, reservation.offset as usize)
        };
        header.last_metadata_type.store(
            ((jvm_id as u32) << 16) | data_type as u32,
            Ordering::Relaxed,
        );
        match account {
            Account::Aot => {
                header
                    .aot_bytes
                    .fetch_add(reservation.total_len, Ordering::Relaxed);
            }
            Account::Jit => {
                header
                    .jit_bytes
                    .fetch_add(reservation.total_len, Ordering::Relaxed);
            }
            Account::Block => {}
        }
    }

    pub fn rollback_metadata(&self, _reservation: &MetadataReservation) {
        // `update_srp` is only advanced by `commit_metadata`, so an
        // uncommitted reservation leaves no trace to undo.
    }

    /// Mark a previously committed entry stale. The entry's length field
    /// keeps the stale bit separate from its byte
    /// length so callers never need to re-derive the length after this.
    ///
    /// # Safety
    /// `entry_offset` must address a live, previously committed
    /// `ShcItemHdr`.
    pub unsafe fn mark_stale(&self, entry_offset: u64) {
        let hdr_ptr = unsafe { self.base.add(entry_offset as usize) } as *mut ShcItemHdr;
        unsafe {
            (*hdr_ptr).mark_stale();
        }
    }

    /// Walk metadata entries from newest (lowest address, closest to
    /// `update_srp`) to oldest (highest address, closest to
    /// `metadata_start`). Returns the offset of the next entry and its
    /// header, `Ok(None)` once the walk cleanly reaches `metadata_start`, or
    /// `Err(())` if the entry's length is corrupt: the length must not be
    /// trusted blindly — zero, or exceeding the distance to
    /// `metadata_start`, both set `ITEM_LENGTH_CORRUPT`.
    pub fn walk_next(&self, cursor: u64) -> Result<Option<(u64, ShcItemHdr)>, ()> {
        if cursor >= self.metadata_start {
            return Ok(None);
        }
        let hdr = unsafe { *(self.base.add(cursor as usize) as *const ShcItemHdr) };
        let len = hdr.byte_len() as u64;
        if len == 0 || cursor + len > self.metadata_start {
            warn!("metadata walk found an entry with an impossible length at offset {cursor}");
            return Err(());
        }
        Ok(Some((cursor, hdr)))
    }

    pub fn walk_start(&self) -> u64 {
        let header = self.header();
        unsafe { header.update_srp.offset_from(self.base) }.unwrap_or(self.metadata_start as usize) as u64
    }

    /// When the general block space is exhausted, consume whatever gap
    /// remains between the two bump pointers with a single synthetic
    /// metadata entry — a real `ShcItemHdr`/`ShcItem` prefix whose payload
    /// is filled with a recognizable byte pattern — so a later walker sees
    /// one well-formed, inert entry instead of raw `0xD9` bytes masquerading
    /// as a length field. Latches `BLOCK_SPACE_FULL` so later callers fail
    /// fast instead of re-deriving "full" from the bump pointers each time.
    fn fill_dummy_and_mark_full(&self, header: &CacheHeader) {
        use crate::header::CacheFullFlags;
        let flags = header.cache_full_flags.load(Ordering::Relaxed);
        if flags & CacheFullFlags::BLOCK_SPACE_FULL != 0 {
            return;
        }
        let segment_off = unsafe { header.segment_srp.offset_from(self.base) }
            .unwrap_or(self.read_write_bytes as usize) as u64;
        let update_off = unsafe { header.update_srp.offset_from(self.base) }
            .unwrap_or(self.metadata_start as usize) as u64;
        let prefix_len =
            (core::mem::size_of::<ShcItemHdr>() + core::mem::size_of::<ShcItem>()) as u64;
        if update_off > segment_off {
            let gap = update_off - segment_off;
            if gap >= prefix_len {
                // Every entry's stored length must be even (the stale bit
                // is the LSB). The gap itself isn't guaranteed even, so
                // round down and leave at most one untouched byte directly
                // after `segment_srp` — the dummy entry still ends exactly
                // at the old `update_srp`, keeping the log contiguous with
                // whatever real entries already sit above it.
                let slack = gap & 1;
                let entry_len = gap - slack;
                let entry_off = segment_off + slack;
                let payload_len = (entry_len - prefix_len) as u32;
                unsafe {
                    let hdr_ptr = self.base.add(entry_off as usize) as *mut ShcItemHdr;
                    let item_ptr = self
                        .base
                        .add(entry_off as usize + core::mem::size_of::<ShcItemHdr>())
                        as *mut ShcItem;
                    hdr_ptr.write(ShcItemHdr::new(entry_len as u32));
                    item_ptr.write(ShcItem {
                        payload_length: payload_len,
                        data_type: 0,
                        jvm_id: 0,
                    });
                    if payload_len > 0 {
                        core::ptr::write_bytes(
                            self.base.add(entry_off as usize + prefix_len as usize),
                            DUMMY_DATA_BYTE,
                            payload_len as usize,
                        );
                    }
                }
                unsafe {
                    header
                        .update_srp
                        .set_offset_from(self.base, entry_off as usize)
                };
                trace!(
                    "block space full; wrote dummy entry of {entry_len} bytes at offset {entry_off}"
                );
            } else {
                warn!(
                    "block space full; remaining gap of {gap} bytes is too small to hold a dummy entry header, leaving it unfilled"
                );
            }
        }
        header
            .cache_full_flags
            .fetch_or(CacheFullFlags::BLOCK_SPACE_FULL, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    fn with_cache(total: u64, rw: u64, debug: u64, f: impl FnOnce(*mut u8, CacheAllocator)) {
        let layout = Layout::from_size_align(total as usize, 8).unwrap();
        unsafe {
            let base = alloc_zeroed(layout);
            let header = base as *mut CacheHeader;
            CacheHeader::init(header, base, total, rw, debug, total, 0, 0, 0, 0, 4096);
            let allocator = CacheAllocator::new(base, total, rw, debug);
            f(base, allocator);
            dealloc(base, layout);
        }
    }

    #[test]
    fn segment_and_metadata_bump_toward_each_other() {
        with_cache(4096, 0, 0, |_base, alloc| {
            let seg = alloc.reserve_segment(Account::Block, 100).unwrap();
            assert_eq!(seg.offset, 0);
            alloc.commit_segment(&seg);

            let meta = alloc.reserve_metadata(Account::Block, 1, 7, 16).unwrap();
            unsafe {
                alloc.commit_metadata(Account::Block, &meta, 1, 7, 16);
            }
            assert!(meta.offset < 4096);
            assert!(meta.offset + meta.total_len <= 4096);
        });
    }

    #[test]
    fn block_space_full_fills_dummy_and_latches() {
        with_cache(256, 0, 0, |_base, alloc| {
            // Exhaust the gap quickly with a large segment reservation.
            let seg = alloc.reserve_segment(Account::Block, 200).unwrap();
            alloc.commit_segment(&seg);
            let err = alloc.reserve_metadata(Account::Block, 1, 1, 64);
            assert!(err.is_err());
            let header = alloc.header();
            use crate::header::CacheFullFlags;
            assert_ne!(
                header.cache_full_flags.load(Ordering::Acquire) & CacheFullFlags::BLOCK_SPACE_FULL,
                0
            );

            // The walker must see a single well-formed dummy entry spanning
            // the whole gap, not a corrupt length.
            let cursor = alloc.walk_start();
            let (offset, hdr) = alloc
                .walk_next(cursor)
                .expect("the dummy entry must be well-formed, not ITEM_LENGTH_CORRUPT")
                .expect("a dummy entry must exist once the block space is full");
            assert_eq!(offset, cursor);
            assert!(hdr.byte_len() > 0);
            assert!(alloc.walk_next(offset + hdr.byte_len() as u64).unwrap().is_none());
        });
    }

    #[test]
    fn aot_allocation_respects_max_cap() {
        with_cache(4096, 0, 0, |_base, alloc| {
            let header = alloc.header();
            header.max_aot.store(32, Ordering::Relaxed);
            let meta = alloc.reserve_metadata(Account::Aot, 2, 1, 8).unwrap();
            unsafe {
                alloc.commit_metadata(Account::Aot, &meta, 2, 1, 8);
            }
            let err = alloc.reserve_metadata(Account::Aot, 2, 1, 64);
            assert!(err.is_err());
        });
    }
}
