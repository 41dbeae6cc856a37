//! Top-level Host ↔ CCE interface, composing every other module: `header`
//! for layout, `allocator` for the bump allocator, `lock` for
//! cross-process mutual exclusion, `protector` for page protection,
//! `update` for the update counter and write-hash coalescer, `crc` for
//! integrity, `corruption` for the sticky corruption record, and
//! `debug_area` for the trailing two-ended stack.

use core::sync::atomic::Ordering;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::allocator::{Account, CacheAllocator, MetadataReservation, SegmentReservation};
use crate::config::{CacheConfig, RuntimeFlags};
use crate::corruption::{CorruptionCode, CorruptionState};
use crate::crc;
use crate::debug_area::DebugAreaAllocator;
use crate::error::{CceError, Region, StartupError};
use crate::header::{CacheFullFlags, CacheHeader, ShcItem, ShcItemHdr};
use crate::lock::{LockGuard, LockManager};
use crate::platform::{backend, Backend, OsBackend, Protection};
use crate::protector::{HeaderProtector, ProtectGuard};
use crate::stats::{CacheStats, UnstoredBytes};
use crate::sync::SpinMutex;
use crate::update::{UpdatePropagator, WriteHashCoalescer};

/// A cache below this size cannot hold a header plus a single zero-payload
/// metadata entry.
const MIN_CACHE_SIZE_SLACK: u64 = 8;

fn corruption_code_from_u32(code: u32) -> CorruptionCode {
    // Mirrors the `#[repr(u32)]` discriminants declared on `CorruptionCode`
    // in declaration order; kept in sync manually since the enum has no
    // data-carrying variants to round-trip through.
    const CODES: &[CorruptionCode] = &[
        CorruptionCode::CacheCrcInvalid,
        CorruptionCode::CacheBadCcInit,
        CorruptionCode::CacheSizeInvalid,
        CorruptionCode::CacheDataNull,
        CorruptionCode::CacheHeaderBadEyecatcher,
        CorruptionCode::CacheHeaderIncorrectDataLength,
        CorruptionCode::CacheHeaderIncorrectDataStartAddress,
        CorruptionCode::CacheHeaderIncorrectCacheSize,
        CorruptionCode::ItemTypeCorrupt,
        CorruptionCode::ItemLengthCorrupt,
        CorruptionCode::RomclassCorrupt,
        CorruptionCode::AcquireHeaderWriteLockFailed,
        CorruptionCode::CacheSemaphoreMismatch,
        CorruptionCode::CacheDebugareaBadFreeSpace,
        CorruptionCode::CacheDebugareaBadFreeSpaceSize,
        CorruptionCode::CacheDebugareaBadLvtHeaderInfo,
        CorruptionCode::CacheDebugareaBadLntHeaderInfo,
    ];
    CODES.get(code as usize).copied().unwrap_or(CorruptionCode::CacheDataNull)
}

/// Mint a short, non-zero per-process id from the header's shared seed
/// (`vm_counter`, `jvm_id_seed`), unique across every process attached to
/// this cache. Masked to 12 bits: `update::WriteHashCoalescer` packs
/// `jvm_id << 20` into a `u32` alongside a 20-bit name hash, so a wider id
/// would overflow the packed word.
fn mint_jvm_id(header: &CacheHeader) -> u16 {
    header.vm_counter.fetch_add(1, Ordering::AcqRel);
    loop {
        let seed = header.jvm_id_seed.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let id = (seed & 0x0FFF) as u16;
        if id != 0 {
            return id;
        }
    }
}

struct PendingAllocation {
    account: Account,
    data_type: u16,
    payload_len: u32,
    segment: Option<SegmentReservation>,
    metadata: MetadataReservation,
}

/// One fully-decoded metadata entry as returned by [`CompositeCacheEngine::walk_next`].
#[derive(Debug, Clone, Copy)]
pub struct WalkEntry {
    pub offset: u64,
    pub header: ShcItemHdr,
    pub item: ShcItem,
    /// Cursor to pass back into the next `walk_next` call.
    pub next_cursor: u64,
}

/// Returned by [`CompositeCacheEngine::enter_read_write_area_mutex`].
pub struct RebuildInfo {
    /// This handle's local view of the intern table is stale relative to
    /// the shared region and should be rebuilt.
    pub rebuild_local: bool,
    /// The shared read-write area itself looks like it was left mid-update
    /// by a writer that crashed (odd `read_write_crash_counter`) and should
    /// be rebuilt from scratch.
    pub rebuild_cache: bool,
}

/// Held while this handle has the write lock; releases the OS lock on
/// drop, the RAII-guard pattern used everywhere a counted/locked resource
/// needs balanced release.
pub struct WriteMutexGuard<'a> {
    engine: &'a CompositeCacheEngine,
    _inner: LockGuard<'a>,
    locked_whole_cache: bool,
}

impl Drop for WriteMutexGuard<'_> {
    fn drop(&mut self) {
        if self.locked_whole_cache {
            let _g = self.engine.protector.unprotect_header();
            self.engine.header().locked.store(0, Ordering::Release);
        }
        self.engine.header().writer_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Held while this handle has the attach-read lock.
pub struct ReadMutexGuard<'a> {
    engine: &'a CompositeCacheEngine,
    _inner: LockGuard<'a>,
}

impl Drop for ReadMutexGuard<'_> {
    fn drop(&mut self) {
        self.engine.header().reader_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Held while this handle has the read-write-area lock.
pub struct ReadWriteAreaGuard<'a> {
    _inner: LockGuard<'a>,
    _protect: Option<ProtectGuard<'a>>,
    read_only: bool,
}

/// Cross-process shared class cache composite engine: the bidirectional
/// bump allocator, lock manager, memory-protection state machine,
/// CRC/corruption tracking, update propagator, and debug sub-allocator,
/// wired to one attached region.
pub struct CompositeCacheEngine {
    path: PathBuf,
    backend: &'static Backend,
    base: *mut u8,
    total_bytes: u64,
    read_write_bytes: u64,
    debug_region_bytes: u64,

    lock: LockManager,
    protector: HeaderProtector,
    allocator: CacheAllocator,
    debug_area: DebugAreaAllocator,
    update: UpdatePropagator,
    write_hash: WriteHashCoalescer,
    corruption: CorruptionState,
    unstored: UnstoredBytes,

    flags: RuntimeFlags,
    jvm_id: u16,
    last_rw_rebuild_seen: core::sync::atomic::AtomicU64,
    pending: SpinMutex<Option<PendingAllocation>>,
}

unsafe impl Send for CompositeCacheEngine {}
unsafe impl Sync for CompositeCacheEngine {}

impl CompositeCacheEngine {
    /// Attach to the cache at `path`, creating it if absent (unless
    /// `DO_NOT_CREATE_CACHE` is set). Validates the header and, if the
    /// cache already existed, its CRC, failing with the matching
    /// [`StartupError`].
    pub fn startup(
        path: &Path,
        config: &CacheConfig,
        flags: RuntimeFlags,
    ) -> Result<Self, StartupError> {
        let sizes = config.resolve();
        if sizes.total_bytes < core::mem::size_of::<CacheHeader>() as u64 + MIN_CACHE_SIZE_SLACK {
            return Err(StartupError::Corrupt {
                code: CorruptionCode::CacheSizeInvalid,
                value: sizes.total_bytes,
            });
        }

        let backend = backend();
        let existed = path.exists();
        if !existed && flags.contains(RuntimeFlags::DO_NOT_CREATE_CACHE) {
            return Err(StartupError::NoCache);
        }

        let handle = backend
            .create_or_open(path, sizes.total_bytes)
            .map_err(|e| StartupError::Failed(e.to_string()))?;
        let base = unsafe { backend.map(&handle, sizes.total_bytes as usize) }
            .map_err(|e| StartupError::Failed(e.to_string()))?;

        let header_ptr = base as *mut CacheHeader;
        if !existed {
            let page_size = backend.page_size() as u64;
            unsafe {
                CacheHeader::init(
                    header_ptr,
                    base,
                    sizes.total_bytes,
                    sizes.read_write_bytes,
                    sizes.debug_region_bytes,
                    sizes.soft_max_bytes,
                    // Clamp only at creation time, never inside
                    // `try_adjust_min_max` — deliberately asymmetric.
                    sizes.min_aot.min(sizes.total_bytes),
                    sizes.max_aot,
                    sizes.min_jit.min(sizes.total_bytes),
                    sizes.max_jit,
                    page_size,
                );
            }
            info!("created cache at {} ({} bytes)", path.display(), sizes.total_bytes);
        }

        let header = unsafe { &*header_ptr };
        if !header.eyecatcher_valid() {
            return Err(StartupError::Corrupt {
                code: CorruptionCode::CacheHeaderBadEyecatcher,
                value: 0,
            });
        }
        if header.total_bytes.load(Ordering::Relaxed) != sizes.total_bytes {
            return Err(StartupError::Corrupt {
                code: CorruptionCode::CacheHeaderIncorrectCacheSize,
                value: header.total_bytes.load(Ordering::Relaxed),
            });
        }

        let corruption = CorruptionState::new();
        if header.corrupt_flag.load(Ordering::Acquire) != 0 {
            let code = corruption_code_from_u32(header.corruption_code.load(Ordering::Relaxed));
            let value = header.corrupt_value.load(Ordering::Relaxed);
            corruption.adopt_header_state(true, Some((code, value)));
            return Err(StartupError::Corrupt { code, value });
        }

        // The startup CRC check only applies when `crc_valid` already
        // holds the magic value; an unset `crc_valid` (e.g. a brand-new
        // cache, or one mid-write when the host died before reaching a
        // clean shutdown) is not itself evidence of corruption.
        if existed && header.crc_valid.load(Ordering::Acquire) == crc::CRC_VALID_MAGIC {
            let ok = unsafe { crc::check_cache_crc(header, base) };
            if !ok {
                let value = header.crc_value.load(Ordering::Relaxed) as u64;
                let can_write = !flags.contains(RuntimeFlags::ENABLE_READONLY);
                corruption.set_corrupt(CorruptionCode::CacheCrcInvalid, value, can_write);
                if can_write {
                    unsafe {
                        header.corrupt_flag.store(1, Ordering::Release);
                        header
                            .corruption_code
                            .store(CorruptionCode::CacheCrcInvalid as u32, Ordering::Release);
                        header.corrupt_value.store(value, Ordering::Release);
                    }
                }
                return Err(StartupError::Corrupt {
                    code: CorruptionCode::CacheCrcInvalid,
                    value,
                });
            }
        }

        let header_len = core::mem::size_of::<CacheHeader>();
        let rw_len = sizes.read_write_bytes.saturating_sub(header_len as u64) as usize;
        let protector = HeaderProtector::new(
            backend,
            base,
            header_len,
            unsafe { base.add(header_len) },
            rw_len,
            flags.contains(RuntimeFlags::ENABLE_MPROTECT),
            flags.contains(RuntimeFlags::ENABLE_MPROTECT_PARTIAL_PAGES),
            flags.contains(RuntimeFlags::MPROTECT_PARTIAL_PAGES_ON_STARTUP),
        );

        // Windows' adjacent-page `VirtualProtect` defect needs a one-shot
        // whole-region unprotect/reprotect at attach; harmless and skipped
        // entirely on backends that report
        // `supports_repeated_unprotect() == true`.
        if !backend.supports_repeated_unprotect() {
            unsafe {
                let _ = backend.protect(base, sizes.total_bytes as usize, Protection::ReadWrite);
                let _ = backend.protect(base, sizes.total_bytes as usize, Protection::ReadOnly);
            }
        }

        let allocator = CacheAllocator::new(
            base,
            sizes.total_bytes,
            sizes.read_write_bytes,
            sizes.debug_region_bytes,
        );
        let debug_area = DebugAreaAllocator::new(base, sizes.total_bytes, sizes.debug_region_bytes);
        if let Err(code) = debug_area.validate() {
            let value = sizes.debug_region_bytes;
            let can_write = !flags.contains(RuntimeFlags::ENABLE_READONLY);
            corruption.set_corrupt(code, value, can_write);
            return Err(StartupError::Corrupt { code, value });
        }
        let lock = LockManager::new(backend, handle, flags);
        let jvm_id = mint_jvm_id(header);
        header.reader_count.fetch_add(1, Ordering::AcqRel);

        Ok(Self {
            path: path.to_path_buf(),
            backend,
            base,
            total_bytes: sizes.total_bytes,
            read_write_bytes: sizes.read_write_bytes,
            debug_region_bytes: sizes.debug_region_bytes,
            lock,
            protector,
            allocator,
            debug_area,
            update: UpdatePropagator::new(),
            write_hash: WriteHashCoalescer::new(),
            corruption,
            unstored: UnstoredBytes::new(),
            flags,
            jvm_id,
            last_rw_rebuild_seen: core::sync::atomic::AtomicU64::new(
                header.read_write_rebuild_counter.load(Ordering::Acquire),
            ),
            pending: SpinMutex::new(None),
        })
    }

    #[inline]
    fn header(&self) -> &CacheHeader {
        unsafe { &*(self.base as *const CacheHeader) }
    }

    fn ensure_not_corrupt(&self) -> Result<(), CceError> {
        if self.corruption.is_corrupt() {
            let (code, value) = self.corruption.context().unwrap_or((CorruptionCode::CacheDataNull, 0));
            return Err(CceError::Corrupt { code, value });
        }
        Ok(())
    }

    /// This handle's minted, process-unique, non-zero short id.
    pub fn jvm_id(&self) -> u16 {
        self.jvm_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The debug sub-region allocator — an external collaborator,
    /// described here only by the fields of the header it reads/writes.
    /// Callers allocate class debug data directly through it; the engine
    /// only validates its invariants at startup.
    pub fn debug_area(&self) -> &DebugAreaAllocator {
        &self.debug_area
    }

    /// Raw pointer to `offset` bytes into the attached region. Callers use
    /// this to write the payload bytes of an allocation at the offset
    /// `allocate_metadata`/`allocate_segment_and_metadata`/`allocate_aot`/
    /// `allocate_jit` returned, before calling [`Self::commit`].
    ///
    /// # Safety
    /// `offset` must be `< total_bytes`, and the caller must confine any
    /// write through the returned pointer to the bounds of the allocation
    /// it was handed.
    pub unsafe fn ptr_at(&self, offset: u64) -> *mut u8 {
        unsafe { self.base.add(offset as usize) }
    }

    /// Unmap the region and, if this process holds the write lock as the
    /// last writer and nothing else prevents it, flush a fresh CRC. The
    /// CRC is only recomputed at clean shutdown, while the write lock is
    /// held and `deny_cache_updates` is set.
    pub fn shutdown(self) -> Result<(), CceError> {
        if !self.flags.contains(RuntimeFlags::ENABLE_READONLY) {
            let guard = self.enter_write_mutex(false)?;
            {
                let _g = self.protector.unprotect_header();
                unsafe { crc::update_cache_crc(self.header(), self.base) };
            }
            drop(guard);
        }
        self.header().reader_count.fetch_sub(1, Ordering::AcqRel);
        unsafe {
            let _ = self.backend.unmap(self.base, self.total_bytes as usize);
        }
        Ok(())
    }

    /// Remove the cache file entirely.
    pub fn destroy(path: &Path, suppress_verbose: bool) -> Result<(), CceError> {
        if !suppress_verbose {
            info!("destroying cache at {}", path.display());
        }
        backend().destroy(path).map_err(CceError::Io)
    }

    // ---- Locking ----

    /// `lock_whole_cache` additionally sets the header's `locked` bit for
    /// the duration of the guard, for callers performing a wholesale
    /// metadata edit.
    pub fn enter_write_mutex(&self, lock_whole_cache: bool) -> Result<WriteMutexGuard<'_>, CceError> {
        if self.flags.contains(RuntimeFlags::DENY_CACHE_UPDATES) {
            return Err(CceError::LockAcquireFailed {
                lock: crate::error::LockId::Write,
                source: std::io::Error::new(std::io::ErrorKind::Other, "cache updates denied"),
            });
        }
        let inner = self.lock.enter_write_mutex()?;
        self.header().writer_count.fetch_add(1, Ordering::AcqRel);
        if lock_whole_cache {
            let _g = self.protector.unprotect_header();
            self.header().locked.store(1, Ordering::Release);
        }
        Ok(WriteMutexGuard {
            engine: self,
            _inner: inner,
            locked_whole_cache: lock_whole_cache,
        })
    }

    pub fn enter_read_mutex(&self) -> Result<ReadMutexGuard<'_>, CceError> {
        let inner = self.lock.enter_attach_read_mutex()?;
        self.header().reader_count.fetch_add(1, Ordering::AcqRel);
        Ok(ReadMutexGuard { engine: self, _inner: inner })
    }

    pub fn enter_read_write_area_mutex(
        &self,
        read_only: bool,
    ) -> Result<(ReadWriteAreaGuard<'_>, RebuildInfo), CceError> {
        let inner = self.lock.enter_read_write_area_mutex()?;
        let header = self.header();
        let protect = if read_only {
            None
        } else {
            let g = self.protector.unprotect_read_write();
            header.read_write_crash_counter.fetch_add(1, Ordering::AcqRel);
            Some(g)
        };
        let crash_ctr = header.read_write_crash_counter.load(Ordering::Acquire);
        let rebuild_cache = crash_ctr % 2 == 1 && read_only;
        let current_rebuild = header.read_write_rebuild_counter.load(Ordering::Acquire);
        let rebuild_local = current_rebuild != self.last_rw_rebuild_seen.swap(current_rebuild, Ordering::AcqRel);
        Ok((
            ReadWriteAreaGuard { _inner: inner, _protect: protect, read_only },
            RebuildInfo { rebuild_local, rebuild_cache },
        ))
    }

    /// `reset_reason`, if `Some`, bumps `read_write_rebuild_counter` so
    /// every other attached handle's next `enter_read_write_area_mutex`
    /// reports `rebuild_local = true`.
    pub fn exit_read_write_area_mutex(&self, guard: ReadWriteAreaGuard<'_>, reset_reason: Option<u32>) {
        if !guard.read_only {
            self.header().read_write_crash_counter.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(code) = reset_reason {
            self.header().read_write_rebuild_counter.fetch_add(1, Ordering::AcqRel);
            warn!("read-write area reset requested, reason={code}");
        }
        drop(guard);
    }

    // ---- Allocation ----

    pub fn allocate_metadata(&self, data_type: u16, payload_len: u32) -> Result<(u64, u64), CceError> {
        self.ensure_not_corrupt()?;
        let reservation = self.allocator.reserve_metadata(Account::Block, data_type, self.jvm_id, payload_len)
            .inspect_err(|_| self.unstored.record_softmax(payload_len as u64))?;
        let payload_offset = reservation.offset
            + core::mem::size_of::<ShcItemHdr>() as u64
            + core::mem::size_of::<ShcItem>() as u64;
        let entry_offset = reservation.offset;
        *self.pending.lock() = Some(PendingAllocation {
            account: Account::Block,
            data_type,
            payload_len,
            segment: None,
            metadata: reservation,
        });
        Ok((entry_offset, payload_offset))
    }

    pub fn allocate_segment_and_metadata(
        &self,
        data_type: u16,
        payload_len: u32,
        segment_len: u64,
    ) -> Result<(u64, u64, u64), CceError> {
        self.ensure_not_corrupt()?;
        let segment = self.allocator.reserve_segment(Account::Block, segment_len)?;
        let metadata = self
            .allocator
            .reserve_metadata(Account::Block, data_type, self.jvm_id, payload_len)
            .inspect_err(|_| {
                self.allocator.rollback_segment(&segment);
                self.unstored.record_softmax(payload_len as u64 + segment_len);
            })?;
        let payload_offset = metadata.offset
            + core::mem::size_of::<ShcItemHdr>() as u64
            + core::mem::size_of::<ShcItem>() as u64;
        let entry_offset = metadata.offset;
        let segment_offset = segment.offset;
        *self.pending.lock() = Some(PendingAllocation {
            account: Account::Block,
            data_type,
            payload_len,
            segment: Some(segment),
            metadata,
        });
        Ok((entry_offset, segment_offset, payload_offset))
    }

    pub fn allocate_aot(&self, data_type: u16, header_len: u32, code_len: u32) -> Result<(u64, u64), CceError> {
        self.allocate_charged(Account::Aot, data_type, header_len + code_len)
    }

    pub fn allocate_jit(&self, data_type: u16, header_len: u32, data_len: u32) -> Result<(u64, u64), CceError> {
        self.allocate_charged(Account::Jit, data_type, header_len + data_len)
    }

    fn allocate_charged(&self, account: Account, data_type: u16, payload_len: u32) -> Result<(u64, u64), CceError> {
        self.ensure_not_corrupt()?;
        let reservation = self
            .allocator
            .reserve_metadata(account, data_type, self.jvm_id, payload_len)
            .inspect_err(|e| match (account, e) {
                (Account::Aot, CceError::AllocationFull { .. }) => self.unstored.record_aot(payload_len as u64),
                (Account::Jit, CceError::AllocationFull { .. }) => self.unstored.record_jit(payload_len as u64),
                _ => {}
            })?;
        let payload_offset = reservation.offset
            + core::mem::size_of::<ShcItemHdr>() as u64
            + core::mem::size_of::<ShcItem>() as u64;
        let entry_offset = reservation.offset;
        *self.pending.lock() = Some(PendingAllocation {
            account,
            data_type,
            payload_len,
            segment: None,
            metadata: reservation,
        });
        Ok((entry_offset, payload_offset))
    }

    /// Reserve `len` bytes from the read-write (intern-table) sub-region.
    /// Distinct accounting from the segment/metadata bump pair; must be
    /// called while holding the read-write-area lock.
    pub fn allocate_readwrite(&self, len: u64) -> Result<u64, CceError> {
        self.ensure_not_corrupt()?;
        let header = self.header();
        let cur = unsafe { header.read_write_srp.offset_from(self.base) }
            .unwrap_or(core::mem::size_of::<CacheHeader>()) as u64;
        let aligned_len = (len + 7) & !7;
        let new_cur = cur + aligned_len;
        if new_cur > self.read_write_bytes {
            return Err(CceError::AllocationFull { region: Region::Available });
        }
        unsafe { header.read_write_srp.set_offset_from(self.base, new_cur as usize) };
        Ok(cur)
    }

    /// Commit the single outstanding allocation made by one of the
    /// `allocate_*` calls above, in order: invalidate the CRC, advance
    /// `segment_srp`, write the entry prefix and advance `update_srp`,
    /// bump `last_metadata_type`, bump `update_count`, and add to the
    /// charged sub-account.
    pub fn commit(&self) -> Result<(), CceError> {
        let pending = self.pending.lock().take();
        let Some(pending) = pending else {
            return Ok(());
        };
        let header = self.header();
        crc::invalidate(header);
        if let Some(seg) = &pending.segment {
            self.allocator.commit_segment(seg);
        }
        unsafe {
            self.allocator.commit_metadata(
                pending.account,
                &pending.metadata,
                pending.data_type,
                self.jvm_id,
                pending.payload_len,
            );
        }
        self.update.publish_update(&header.update_count);
        debug!(
            "committed entry at offset {} (type={}, jvm={})",
            pending.metadata.offset, pending.data_type, self.jvm_id
        );
        Ok(())
    }

    /// Discard the single outstanding allocation without touching any
    /// shared bump pointer: the cache-header SRPs are not yet written, so
    /// nothing else need be undone.
    pub fn rollback(&self) {
        let pending = self.pending.lock().take();
        if let Some(pending) = pending {
            if let Some(seg) = &pending.segment {
                self.allocator.rollback_segment(seg);
            }
            self.allocator.rollback_metadata(&pending.metadata);
        }
    }

    /// # Safety
    /// `entry_offset` must address a live, previously committed entry.
    pub unsafe fn mark_stale(&self, entry_offset: u64) -> Result<(), CceError> {
        self.ensure_not_corrupt()?;
        crc::invalidate(self.header());
        unsafe { self.allocator.mark_stale(entry_offset) };
        Ok(())
    }

    pub fn stale(&self, entry_offset: u64) -> bool {
        let hdr = unsafe { &*(self.base.add(entry_offset as usize) as *const ShcItemHdr) };
        hdr.is_stale()
    }

    pub fn find_start(&self) -> u64 {
        self.allocator.walk_start()
    }

    /// Advance from `cursor` (or [`Self::find_start`] if `None`) to the
    /// next metadata entry, optionally skipping stale ones. Surfaces
    /// `ITEM_LENGTH_CORRUPT` as a sticky [`CceError::Corrupt`] the moment a
    /// corrupt length is observed.
    pub fn walk_next(&self, cursor: Option<u64>, skip_stale: bool) -> Result<Option<WalkEntry>, CceError> {
        self.ensure_not_corrupt()?;
        let mut cur = cursor.unwrap_or_else(|| self.find_start());
        loop {
            match self.allocator.walk_next(cur) {
                Ok(None) => return Ok(None),
                Err(()) => {
                    let can_write = !self.flags.contains(RuntimeFlags::ENABLE_READONLY);
                    self.corruption
                        .set_corrupt(CorruptionCode::ItemLengthCorrupt, cur, can_write);
                    if can_write {
                        let header = self.header();
                        let _g = self.protector.unprotect_header();
                        header.corrupt_flag.store(1, Ordering::Release);
                        header
                            .corruption_code
                            .store(CorruptionCode::ItemLengthCorrupt as u32, Ordering::Release);
                        header.corrupt_value.store(cur, Ordering::Release);
                    }
                    return Err(CceError::Corrupt {
                        code: CorruptionCode::ItemLengthCorrupt,
                        value: cur,
                    });
                }
                Ok(Some((off, hdr))) => {
                    let next_cursor = off + hdr.byte_len() as u64;
                    if skip_stale && hdr.is_stale() {
                        cur = next_cursor;
                        continue;
                    }
                    let item_ptr = unsafe {
                        self.base.add(off as usize + core::mem::size_of::<ShcItemHdr>()) as *const ShcItem
                    };
                    let item = unsafe { *item_ptr };
                    return Ok(Some(WalkEntry { offset: off, header: hdr, item, next_cursor }));
                }
            }
        }
    }

    // ---- Update propagation ----

    /// Number of entries committed since the last [`Self::done_read_updates`]
    /// call on this handle.
    pub fn check_updates(&self) -> u64 {
        self.update.check_updates(&self.header().update_count)
    }

    pub fn done_read_updates(&self, n: u64) {
        self.update.done_read_updates(n);
    }

    // ---- Write-hash coalescer ----

    pub fn test_and_set_write_hash(&self, name_hash: u32) -> bool {
        self.write_hash
            .test_and_set_write_hash(&self.header().write_hash, self.jvm_id, name_hash)
    }

    pub fn try_reset_write_hash(&self, name_hash: u32) {
        self.write_hash
            .try_reset_write_hash(&self.header().write_hash, self.jvm_id, name_hash);
    }

    // ---- Softmax / sub-account tuning ----

    pub fn set_soft_max(&self, new_soft_max: u64) -> Result<(), CceError> {
        let header = self.header();
        let used = self.allocator.used_bytes_public();
        let clamped = new_soft_max.max(used);
        if clamped != new_soft_max {
            warn!("soft_max_bytes {new_soft_max} below used bytes {used}; clamped to {clamped}");
        }
        let _g = self.protector.unprotect_header();
        header.soft_max_bytes.store(clamped, Ordering::Release);
        if clamped > used {
            header.cache_full_flags.fetch_and(!CacheFullFlags::AVAILABLE_SPACE_FULL, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Adjust the AOT/JIT reserved-minimum and absolute-cap pairs at
    /// runtime. Unlike cache creation, `min_aot`/`min_jit` are validated
    /// but *not* clamped to `free_block_bytes` here — deliberately
    /// asymmetric with creation-time behavior.
    pub fn try_adjust_min_max(
        &self,
        min_aot: Option<u64>,
        max_aot: Option<u64>,
        min_jit: Option<u64>,
        max_jit: Option<u64>,
    ) -> Result<(), CceError> {
        let header = self.header();
        let soft_max = header.soft_max_bytes.load(Ordering::Relaxed);
        let _g = self.protector.unprotect_header();

        if let (Some(min), Some(max)) = (min_aot, max_aot) {
            if min > max {
                warn!("min_aot {min} > max_aot {max}; rejecting adjustment");
                return Ok(());
            }
        }
        if let (Some(min), Some(max)) = (min_jit, max_jit) {
            if min > max {
                warn!("min_jit {min} > max_jit {max}; rejecting adjustment");
                return Ok(());
            }
        }
        if let Some(max) = max_aot {
            if max > soft_max {
                warn!("max_aot {max} exceeds soft_max_bytes {soft_max}; rejecting adjustment");
                return Ok(());
            }
        }
        if let Some(max) = max_jit {
            if max > soft_max {
                warn!("max_jit {max} exceeds soft_max_bytes {soft_max}; rejecting adjustment");
                return Ok(());
            }
        }

        if let Some(v) = min_aot {
            header.min_aot.store(v, Ordering::Release);
        }
        if let Some(v) = max_aot {
            header.max_aot.store(v, Ordering::Release);
            if self.flags.contains(RuntimeFlags::ENABLE_REDUCE_STORE_CONTENTION) {
                header.cache_full_flags.fetch_and(!CacheFullFlags::AOT_FULL, Ordering::AcqRel);
            }
        }
        if let Some(v) = min_jit {
            header.min_jit.store(v, Ordering::Release);
        }
        if let Some(v) = max_jit {
            header.max_jit.store(v, Ordering::Release);
            if self.flags.contains(RuntimeFlags::ENABLE_REDUCE_STORE_CONTENTION) {
                header.cache_full_flags.fetch_and(!CacheFullFlags::JIT_FULL, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    // ---- Address classification ----

    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.base as usize;
        addr >= base && addr < base + self.total_bytes as usize
    }

    pub fn is_in_segment(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.base as usize;
        let start = base + self.read_write_bytes as usize;
        let end = base
            + unsafe { self.header().segment_srp.offset_from(self.base) }
                .unwrap_or(self.read_write_bytes as usize);
        addr >= start && addr < end
    }

    pub fn is_in_metadata_area(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.base as usize;
        let start = base
            + unsafe { self.header().update_srp.offset_from(self.base) }
                .unwrap_or(self.total_bytes as usize);
        let end = base + (self.total_bytes - self.debug_region_bytes) as usize;
        addr >= start && addr < end
    }

    // ---- Partial-page protection ----

    /// Protect the partially-filled page at the segment bump pointer's
    /// current frontier, honoring the `ENABLE_MPROTECT_PARTIAL_PAGES` /
    /// `MPROTECT_PARTIAL_PAGES_ON_STARTUP` policy. Pass `on_startup = true`
    /// only while still inside `startup()`'s own setup; everywhere else
    /// `false`.
    pub fn protect_partial_pages(&self, on_startup: bool) {
        let segment_off = unsafe { self.header().segment_srp.offset_from(self.base) }
            .unwrap_or(self.read_write_bytes as usize);
        let frontier = unsafe { self.base.add(segment_off) };
        self.protector.protect_partial_pages(frontier, on_startup);
    }

    /// Undo [`Self::protect_partial_pages`] so the allocator can keep
    /// bumping into the segment frontier's page.
    pub fn unprotect_partial_pages(&self, on_startup: bool) {
        let segment_off = unsafe { self.header().segment_srp.offset_from(self.base) }
            .unwrap_or(self.read_write_bytes as usize);
        let frontier = unsafe { self.base.add(segment_off) };
        self.protector.unprotect_partial_pages(frontier, on_startup);
    }

    // ---- Diagnostics ----

    /// A nonzero `crash_counter` means some writer, in this process or
    /// another, incremented it before a header-protected critical update
    /// and never got to decrement it afterward.
    pub fn crash_detected(&self) -> bool {
        self.header().crash_counter.load(Ordering::Acquire) != 0
    }

    pub fn stats(&self) -> CacheStats {
        let header = self.header();
        let full = header.cache_full_flags.load(Ordering::Acquire);
        let (entry_count, stale_entry_count) = self.count_entries();
        CacheStats {
            total_bytes: self.total_bytes,
            used_bytes: self.allocator.used_bytes_public(),
            free_block_bytes: self.total_bytes.saturating_sub(self.allocator.used_bytes_public()),
            soft_max_bytes: header.soft_max_bytes.load(Ordering::Relaxed),
            aot_bytes: header.aot_bytes.load(Ordering::Relaxed),
            min_aot: header.min_aot.load(Ordering::Relaxed),
            max_aot: header.max_aot.load(Ordering::Relaxed),
            jit_bytes: header.jit_bytes.load(Ordering::Relaxed),
            min_jit: header.min_jit.load(Ordering::Relaxed),
            max_jit: header.max_jit.load(Ordering::Relaxed),
            entry_count,
            stale_entry_count,
            update_count: header.update_count.load(Ordering::Relaxed),
            reader_count: header.reader_count.load(Ordering::Relaxed),
            writer_count: header.writer_count.load(Ordering::Relaxed),
            block_space_full: full & CacheFullFlags::BLOCK_SPACE_FULL != 0,
            available_space_full: full & CacheFullFlags::AVAILABLE_SPACE_FULL != 0,
            aot_full: full & CacheFullFlags::AOT_FULL != 0,
            jit_full: full & CacheFullFlags::JIT_FULL != 0,
            corrupt: self.corruption.is_corrupt(),
            softmax_unstored_bytes: self.unstored.softmax_unstored_bytes(),
            max_aot_unstored_bytes: self.unstored.max_aot_unstored_bytes(),
            max_jit_unstored_bytes: self.unstored.max_jit_unstored_bytes(),
        }
    }

    /// `(live, stale)` entry counts from one walk of the metadata log.
    fn count_entries(&self) -> (u64, u64) {
        let mut cursor = self.find_start();
        let mut live = 0u64;
        let mut stale = 0u64;
        loop {
            match self.allocator.walk_next(cursor) {
                Ok(Some((off, hdr))) => {
                    if hdr.is_stale() {
                        stale += 1;
                    } else {
                        live += 1;
                    }
                    cursor = off + hdr.byte_len() as u64;
                }
                _ => break,
            }
        }
        (live, stale)
    }

    /// A read-only attach handle cannot persist a "full" flag to the
    /// header, so it checks directly whether the next allocation of
    /// `next_alloc_bytes` would fit and, if not, treats the cache as
    /// effectively full for its own purposes without writing anything.
    pub fn effectively_full_for_readonly(&self, next_alloc_bytes: u64) -> bool {
        let header = self.header();
        let used = self.allocator.used_bytes_public();
        let soft_max = header.soft_max_bytes.load(Ordering::Relaxed);
        used + next_alloc_bytes > soft_max
    }
}
