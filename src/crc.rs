//! Sampled CRC-32 over the stable portions of the cache: the segment
//! prefix `[0, segment_srp)` plus the metadata suffix `[update_srp,
//! debug_start)`, each sampled at a stride chosen so a huge cache still
//! CRCs quickly (capped at 100,000 samples; the 1535 base stride is "1.5k
//! - 1", picked so it doesn't land on a power-of-two boundary through the
//! cache).
//!
//! The sampling feeds one byte per stride into `crc32fast`'s running
//! hasher — enough to catch most single-byte corruption without reading
//! every byte of a multi-gigabyte cache.

use crate::header::CacheHeader;
use core::sync::atomic::Ordering;
use crc32fast::Hasher;

/// `crc_valid` holds this constant exactly when the stored CRC was computed
/// by the sampling rule implemented here. Bumping the stride or sampling
/// algorithm must bump this constant too.
pub const CRC_VALID_MAGIC: u32 = crate::header::CRC_VALID_MAGIC;

const BASE_STRIDE: u64 = 1535;
const MAX_SAMPLES: u64 = 100_000;

fn stride_for(area_size: u64) -> u64 {
    if area_size == 0 {
        return 1;
    }
    if area_size / BASE_STRIDE > MAX_SAMPLES {
        (area_size / MAX_SAMPLES).max(1)
    } else {
        BASE_STRIDE
    }
}

/// Sample one byte every `stride` bytes of `[ptr, ptr+len)` into a running
/// CRC-32: stride is `max(1535, area_size / 100000)`, expressed here as
/// "use 1535 unless that would exceed the sample cap".
///
/// # Safety
/// `[ptr, ptr+len)` must be readable for the duration of the call.
unsafe fn sampled_area_crc(ptr: *const u8, len: u64) -> u32 {
    if len == 0 {
        return 0;
    }
    let stride = stride_for(len);
    let mut hasher = Hasher::new();
    let mut offset = 0u64;
    while offset < len {
        let byte = unsafe { ptr.add(offset as usize).read() };
        hasher.update(core::slice::from_ref(&byte));
        offset += stride;
    }
    hasher.finalize()
}

/// Compute the cache-wide sampled CRC: segment bytes `[0, segment_srp)`
/// plus metadata bytes `[update_srp, cache_end - debug_region_size)`,
/// combined by wrapping addition of the two area CRCs. Only internal
/// round-trip consistency matters (`crc_valid == 3` implies a
/// recomputation matches), not any particular on-disk byte value.
///
/// # Safety
/// `base` must point at a live mapping of at least `total_bytes` bytes
/// belonging to `header`.
pub unsafe fn cache_crc(header: &CacheHeader, base: *mut u8) -> u32 {
    let total_bytes = header.total_bytes.load(Ordering::Relaxed);
    let debug_region_size = header.debug_region_size.load(Ordering::Relaxed);
    let segment_srp = unsafe { header.segment_srp.offset_from(base) }.unwrap_or(0) as u64;
    let update_srp =
        unsafe { header.update_srp.offset_from(base) }.unwrap_or(total_bytes as usize) as u64;
    let debug_start = total_bytes - debug_region_size;

    let segment_crc = unsafe { sampled_area_crc(base, segment_srp) };
    let metadata_len = debug_start.saturating_sub(update_srp);
    let metadata_crc =
        unsafe { sampled_area_crc(base.add(update_srp as usize), metadata_len) };

    segment_crc.wrapping_add(metadata_crc)
}

/// Recompute the CRC and store it in the header, setting `crc_valid` to the
/// magic value. Only safe to call at clean shutdown, while the write lock
/// is held and `deny_cache_updates` is set; caller is responsible for
/// holding the write lock and the header-write lock, and for having
/// unprotected the header first.
///
/// # Safety
/// Same preconditions as [`cache_crc`]; the header must be unprotected for
/// writing.
pub unsafe fn update_cache_crc(header: &CacheHeader, base: *mut u8) {
    let value = unsafe { cache_crc(header, base) };
    header.crc_value.store(value, Ordering::Relaxed);
    header.crc_valid.store(CRC_VALID_MAGIC, Ordering::Release);
}

/// Check the stored CRC against a fresh recomputation. Returns `true` only
/// if `crc_valid == 3` *and* the recomputed
/// value matches; any other combination means the cache should be marked
/// corrupt with `CACHE_CRC_INVALID`.
///
/// # Safety
/// Same preconditions as [`cache_crc`].
pub unsafe fn check_cache_crc(header: &CacheHeader, base: *mut u8) -> bool {
    if header.crc_valid.load(Ordering::Acquire) != CRC_VALID_MAGIC {
        return false;
    }
    let recomputed = unsafe { cache_crc(header, base) };
    header.crc_value.load(Ordering::Relaxed) == recomputed
}

/// Invalidate `crc_valid`: any write invalidates it first. Cheap and safe
/// to call unconditionally before any mutation.
pub fn invalidate(header: &CacheHeader) {
    header.crc_valid.store(0, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::CacheHeader;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    fn with_cache(total: u64, f: impl FnOnce(*mut u8, *mut CacheHeader)) {
        let layout = Layout::from_size_align(total as usize, 8).unwrap();
        unsafe {
            let base = alloc_zeroed(layout);
            let header = base as *mut CacheHeader;
            CacheHeader::init(header, base, total, 0, 0, total, 0, 0, 0, 0, 4096);
            f(base, header);
            dealloc(base, layout);
        }
    }

    #[test]
    fn check_fails_before_any_update() {
        with_cache(8192, |base, header| unsafe {
            assert!(!check_cache_crc(&*header, base));
        });
    }

    #[test]
    fn round_trips_after_update() {
        with_cache(8192, |base, header| unsafe {
            update_cache_crc(&*header, base);
            assert!(check_cache_crc(&*header, base));
        });
    }

    #[test]
    fn invalidate_clears_flag() {
        with_cache(8192, |base, header| unsafe {
            update_cache_crc(&*header, base);
            invalidate(&*header);
            assert!(!check_cache_crc(&*header, base));
        });
    }

    #[test]
    fn mutation_after_update_is_detected() {
        with_cache(65536, |base, header| unsafe {
            (*header)
                .segment_srp
                .set_offset_from(base, 4096);
            update_cache_crc(&*header, base);
            assert!(check_cache_crc(&*header, base));

            // Mutate a sampled byte (offset 0 is always sampled) without
            // going through invalidate() first, simulating torn/corrupted
            // data that bypassed the write path.
            *base = !(*base);
            // crc_valid is still the magic value, but the recomputed CRC no
            // longer matches: this must be treated as corrupt, not valid.
            assert!(!check_cache_crc(&*header, base));
        });
    }

    #[test]
    fn stride_grows_for_huge_areas() {
        assert_eq!(stride_for(1_000), BASE_STRIDE);
        assert_eq!(stride_for(BASE_STRIDE * MAX_SAMPLES), BASE_STRIDE);
        let huge = BASE_STRIDE * MAX_SAMPLES * 10;
        assert!(stride_for(huge) > BASE_STRIDE);
    }
}
