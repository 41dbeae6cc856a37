//! Cache header layout and self-relative pointers: offsets plus accessor
//! helpers that take the base pointer, never language-level references.
//!
//! An [`Srp`] stores a *signed byte offset from its own address* to the
//! value it points at, so a region containing `Srp`s remains valid after
//! being copied or mapped at a different base address — the offsets are
//! unaffected by where the region lands in the process's address space.

use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Fixed ASCII tag identifying the cache kind. Chosen to be recognizable in
/// a hex dump.
pub const EYECATCHER: [u8; 8] = *b"CCEh\0\0\0\0";

/// `crc_valid` holds this constant exactly when the stored CRC was computed
/// with the current sampling rule.
pub const CRC_VALID_MAGIC: u32 = 3;

/// Bytes used to fill a synthetic "dummy" metadata entry once block space is
/// full.
pub const DUMMY_DATA_BYTE: u8 = 0xD9;

/// A self-relative pointer: a signed offset, in bytes, from this field's own
/// address to the address it designates. `0` encodes "null".
#[repr(transparent)]
pub struct Srp(AtomicI64);

impl Srp {
    pub const fn null() -> Self {
        Self(AtomicI64::new(0))
    }

    /// Resolve to an absolute pointer, or `None` if null.
    ///
    /// # Safety
    /// The caller must ensure the resolved address, if any, is within a
    /// live mapping for as long as the returned pointer is used.
    #[inline]
    pub unsafe fn get(&self) -> Option<*mut u8> {
        let off = self.0.load(Ordering::Acquire);
        if off == 0 {
            None
        } else {
            let self_addr = (&self.0 as *const AtomicI64) as i64;
            Some((self_addr + off) as *mut u8)
        }
    }

    /// Point this SRP at `target` (or clear it, for `target = None`).
    ///
    /// # Safety
    /// `target`, if `Some`, must lie in the same shared mapping as `self`
    /// and fit in an `i64` offset (always true for any realistic cache
    /// size).
    #[inline]
    pub unsafe fn set(&self, target: Option<*mut u8>) {
        let self_addr = (&self.0 as *const AtomicI64) as i64;
        let off = match target {
            None => 0,
            Some(p) => {
                let off = (p as i64) - self_addr;
                if off == 0 {
                    // Can't distinguish "points at itself" from null; the
                    // CCE never needs an SRP to target its own address.
                    1
                } else {
                    off
                }
            }
        };
        self.0.store(off, Ordering::Release);
    }

    /// Resolve relative to `base`, returning a byte offset from `base`
    /// instead of an absolute pointer. Used by allocator code that tracks
    /// positions as `usize` offsets into the mapped region.
    ///
    /// # Safety
    /// Same preconditions as [`Srp::get`]; `base` must be the start of the
    /// same mapping.
    #[inline]
    pub unsafe fn offset_from(&self, base: *mut u8) -> Option<usize> {
        self.get().map(|p| (p as usize) - (base as usize))
    }

    /// Set this SRP to designate `base + offset`.
    ///
    /// # Safety
    /// Same preconditions as [`Srp::set`].
    #[inline]
    pub unsafe fn set_offset_from(&self, base: *mut u8, offset: usize) {
        self.set(Some(base.add(offset)));
    }
}

/// Bitfield for `cache_header.cc_init_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InitComplete(pub u32);
impl InitComplete {
    pub const IN_MEMORY: u32 = 1 << 0;
    pub const DURABLE: u32 = 1 << 1;
}

/// Bitset for `cache_header.cache_full_flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheFullFlags(pub u32);
impl CacheFullFlags {
    pub const BLOCK_SPACE_FULL: u32 = 1 << 0;
    pub const AVAILABLE_SPACE_FULL: u32 = 1 << 1;
    pub const AOT_FULL: u32 = 1 << 2;
    pub const JIT_FULL: u32 = 1 << 3;
}

/// Bitset for `cache_header.extra_flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtraFlags(pub u64);
impl ExtraFlags {
    pub const NO_LINE_NUMBERS: u64 = 1 << 0;
    pub const BCI_ENABLED: u64 = 1 << 1;
    pub const MPROTECT_PARTIAL_PAGES: u64 = 1 << 2;
    pub const RESTRICT_CLASSPATHS: u64 = 1 << 3;
    pub const AOT_HEADER_PRESENT: u64 = 1 << 4;
}

/// Fixed-size struct at offset 0 of the attached region. All fields mutated
/// outside the header-write lock are atomics so concurrent readers never
/// observe a torn value; advisory fields use `Relaxed` loads/stores,
/// everything gating visibility of committed data uses `Acquire`/`Release`.
#[repr(C)]
pub struct CacheHeader {
    pub eyecatcher: [u8; 8],
    pub total_bytes: AtomicU64,
    pub read_write_bytes: AtomicU64,

    pub segment_srp: Srp,
    pub update_srp: Srp,

    pub debug_region_size: AtomicU64,
    pub line_number_table_next_srp: Srp,
    pub local_variable_table_next_srp: Srp,

    pub update_count: AtomicU64,
    pub crash_counter: AtomicU64,
    pub writer_count: AtomicU32,
    pub reader_count: AtomicU32,
    pub locked: AtomicU32,
    pub cc_init_complete: AtomicU32,

    pub corrupt_flag: AtomicU32,
    pub corruption_code: AtomicU32,
    pub corrupt_value: AtomicU64,

    pub crc_value: AtomicU32,
    pub crc_valid: AtomicU32,

    pub soft_max_bytes: AtomicU64,
    pub min_aot: AtomicU64,
    pub max_aot: AtomicU64,
    pub min_jit: AtomicU64,
    pub max_jit: AtomicU64,
    pub aot_bytes: AtomicU64,
    pub jit_bytes: AtomicU64,

    pub cache_full_flags: AtomicU32,

    pub read_write_srp: Srp,
    pub read_write_crash_counter: AtomicU64,
    pub read_write_rebuild_counter: AtomicU64,

    pub os_page_size: AtomicU64,
    pub extra_flags: AtomicU64,

    pub vm_counter: AtomicU32,
    pub jvm_id_seed: AtomicU32,

    pub write_hash: AtomicU32,
    pub last_metadata_type: AtomicU32,

    /// Reserved for future fields; keeps the header a stable, page-friendly
    /// size and lets new fields be added without shifting existing offsets.
    pub _reserved: [u8; 64],
}

impl CacheHeader {
    /// Initialize a freshly-mapped, zeroed header in place.
    ///
    /// # Safety
    /// `header` must point at a writable region of at least
    /// `size_of::<CacheHeader>()` bytes belonging to a mapping that also
    /// contains at least `total_bytes` bytes starting at `base`.
    pub unsafe fn init(
        header: *mut CacheHeader,
        base: *mut u8,
        total_bytes: u64,
        read_write_bytes: u64,
        debug_region_size: u64,
        soft_max_bytes: u64,
        min_aot: u64,
        max_aot: u64,
        min_jit: u64,
        max_jit: u64,
        os_page_size: u64,
    ) {
        let h = &mut *header;
        h.eyecatcher = EYECATCHER;
        h.total_bytes = AtomicU64::new(total_bytes);
        h.read_write_bytes = AtomicU64::new(read_write_bytes);

        h.segment_srp = Srp::null();
        h.segment_srp
            .set_offset_from(base, read_write_bytes as usize);

        h.update_srp = Srp::null();
        let metadata_start = total_bytes - debug_region_size;
        h.update_srp.set_offset_from(base, metadata_start as usize);

        h.debug_region_size = AtomicU64::new(debug_region_size);
        h.line_number_table_next_srp = Srp::null();
        h.line_number_table_next_srp
            .set_offset_from(base, metadata_start as usize);
        h.local_variable_table_next_srp = Srp::null();
        h.local_variable_table_next_srp
            .set_offset_from(base, total_bytes as usize);

        h.update_count = AtomicU64::new(0);
        h.crash_counter = AtomicU64::new(0);
        h.writer_count = AtomicU32::new(0);
        h.reader_count = AtomicU32::new(0);
        h.locked = AtomicU32::new(0);
        h.cc_init_complete = AtomicU32::new(0);

        h.corrupt_flag = AtomicU32::new(0);
        h.corruption_code = AtomicU32::new(0);
        h.corrupt_value = AtomicU64::new(0);

        h.crc_value = AtomicU32::new(0);
        h.crc_valid = AtomicU32::new(0);

        h.soft_max_bytes = AtomicU64::new(soft_max_bytes);
        h.min_aot = AtomicU64::new(min_aot);
        h.max_aot = AtomicU64::new(max_aot);
        h.min_jit = AtomicU64::new(min_jit);
        h.max_jit = AtomicU64::new(max_jit);
        h.aot_bytes = AtomicU64::new(0);
        h.jit_bytes = AtomicU64::new(0);

        h.cache_full_flags = AtomicU32::new(0);

        h.read_write_srp = Srp::null();
        h.read_write_srp
            .set_offset_from(base, core::mem::size_of::<CacheHeader>());
        h.read_write_crash_counter = AtomicU64::new(0);
        h.read_write_rebuild_counter = AtomicU64::new(0);

        h.os_page_size = AtomicU64::new(os_page_size);
        h.extra_flags = AtomicU64::new(0);

        h.vm_counter = AtomicU32::new(0);
        h.jvm_id_seed = AtomicU32::new(0);

        h.write_hash = AtomicU32::new(0);
        h.last_metadata_type = AtomicU32::new(0);

        h.cc_init_complete
            .store(InitComplete::IN_MEMORY, Ordering::Release);
    }

    pub fn eyecatcher_valid(&self) -> bool {
        self.eyecatcher == EYECATCHER
    }
}

/// Metadata entry header (`ShcItemHdr`), stored at the high end, 8-byte
/// aligned. `length`'s LSB is the stale bit; clearing it yields the byte
/// length of `header + ShcItem + payload + padding`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ShcItemHdr {
    pub length: u32,
}

impl ShcItemHdr {
    pub const STALE_BIT: u32 = 1;

    pub fn new(byte_len: u32) -> Self {
        debug_assert_eq!(byte_len & Self::STALE_BIT, 0, "entry length must be even");
        Self { length: byte_len }
    }

    pub fn byte_len(&self) -> u32 {
        self.length & !Self::STALE_BIT
    }

    pub fn is_stale(&self) -> bool {
        (self.length & Self::STALE_BIT) != 0
    }

    pub fn mark_stale(&mut self) {
        self.length |= Self::STALE_BIT;
    }
}

/// Fixed prefix of every entry.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ShcItem {
    pub payload_length: u32,
    pub data_type: u16,
    pub jvm_id: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    fn with_region(size: usize, f: impl FnOnce(*mut u8)) {
        let layout = Layout::from_size_align(size, 8).unwrap();
        unsafe {
            let ptr = alloc_zeroed(layout);
            f(ptr);
            dealloc(ptr, layout);
        }
    }

    #[test]
    fn srp_round_trips_through_base() {
        with_region(4096, |base| unsafe {
            let header = base as *mut CacheHeader;
            CacheHeader::init(header, base, 4096, 0, 0, 4096, 0, 0, 0, 0, 4096);
            let h = &*header;
            assert_eq!(h.segment_srp.offset_from(base), Some(0));
            assert_eq!(h.update_srp.offset_from(base), Some(4096));
        });
    }

    #[test]
    fn stale_bit_does_not_disturb_length() {
        let mut hdr = ShcItemHdr::new(128);
        assert_eq!(hdr.byte_len(), 128);
        assert!(!hdr.is_stale());
        hdr.mark_stale();
        assert_eq!(hdr.byte_len(), 128);
        assert!(hdr.is_stale());
    }

    #[test]
    fn eyecatcher_detects_corruption() {
        with_region(512, |base| unsafe {
            let header = base as *mut CacheHeader;
            CacheHeader::init(header, base, 512, 0, 0, 512, 0, 0, 0, 0, 512);
            assert!((*header).eyecatcher_valid());
            (*header).eyecatcher[0] = 0;
            assert!(!(*header).eyecatcher_valid());
        });
    }
}
