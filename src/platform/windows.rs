//! Windows backend: `CreateFileMapping`/`MapViewOfFile`, `LockFileEx`,
//! `VirtualProtect`, `FlushViewOfFile`. Raw `extern "system"` declarations.
//!
//! Windows cannot narrow the protection of a view below what it was first
//! mapped with and then widen it back without special handling the first
//! time; `supports_repeated_unprotect` returns `false` so
//! [`crate::protector::HeaderProtector`] knows to use the one-shot
//! workaround on the very first unprotect of a freshly attached mapping.

use super::{LockKind, LockOutcome, OsBackend, Protection, RawHandle};
use core::ffi::c_void;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;

type Handle = *mut c_void;

const GENERIC_READ: u32 = 0x8000_0000;
const GENERIC_WRITE: u32 = 0x4000_0000;
const FILE_SHARE_READ: u32 = 0x1;
const FILE_SHARE_WRITE: u32 = 0x2;
const OPEN_ALWAYS: u32 = 4;
const FILE_ATTRIBUTE_NORMAL: u32 = 0x80;
const INVALID_HANDLE_VALUE: Handle = !0usize as Handle;

const PAGE_READONLY: u32 = 0x02;
const PAGE_READWRITE: u32 = 0x04;
const PAGE_NOACCESS: u32 = 0x01;
const FILE_MAP_WRITE: u32 = 0x0002;

const LOCKFILE_EXCLUSIVE_LOCK: u32 = 0x0000_0002;
const LOCKFILE_FAIL_IMMEDIATELY: u32 = 0x0000_0001;
const ERROR_LOCK_VIOLATION: i32 = 33;
const ERROR_IO_PENDING: i32 = 997;

#[repr(C)]
struct Overlapped {
    internal: usize,
    internal_high: usize,
    offset: u32,
    offset_high: u32,
    h_event: Handle,
}

unsafe extern "system" {
    #[link_name = "CreateFileW"]
    fn create_file_w(
        lp_file_name: *const u16,
        dw_desired_access: u32,
        dw_share_mode: u32,
        lp_security_attributes: *mut c_void,
        dw_creation_disposition: u32,
        dw_flags_and_attributes: u32,
        h_template_file: Handle,
    ) -> Handle;

    #[link_name = "CreateFileMappingW"]
    fn create_file_mapping_w(
        h_file: Handle,
        lp_attributes: *mut c_void,
        fl_protect: u32,
        dw_maximum_size_high: u32,
        dw_maximum_size_low: u32,
        lp_name: *const u16,
    ) -> Handle;

    #[link_name = "MapViewOfFile"]
    fn map_view_of_file(
        h_file_mapping_object: Handle,
        dw_desired_access: u32,
        dw_file_offset_high: u32,
        dw_file_offset_low: u32,
        dw_number_of_bytes_to_map: usize,
    ) -> *mut c_void;

    #[link_name = "UnmapViewOfFile"]
    fn unmap_view_of_file(lp_base_address: *mut c_void) -> i32;

    #[link_name = "FlushViewOfFile"]
    fn flush_view_of_file(lp_base_address: *mut c_void, dw_number_of_bytes_to_flush: usize) -> i32;

    #[link_name = "VirtualProtect"]
    fn virtual_protect(
        lp_address: *mut c_void,
        dw_size: usize,
        fl_new_protect: u32,
        lp_old_protect: *mut u32,
    ) -> i32;

    #[link_name = "SetFilePointerEx"]
    fn set_file_pointer_ex(
        h_file: Handle,
        li_distance_to_move: i64,
        lp_new_file_pointer: *mut i64,
        dw_move_method: u32,
    ) -> i32;

    #[link_name = "SetEndOfFile"]
    fn set_end_of_file(h_file: Handle) -> i32;

    #[link_name = "CloseHandle"]
    fn close_handle(h_object: Handle) -> i32;

    #[link_name = "DeleteFileW"]
    fn delete_file_w(lp_file_name: *const u16) -> i32;

    #[link_name = "LockFileEx"]
    fn lock_file_ex(
        h_file: Handle,
        dw_flags: u32,
        dw_reserved: u32,
        n_number_of_bytes_to_lock_low: u32,
        n_number_of_bytes_to_lock_high: u32,
        lp_overlapped: *mut Overlapped,
    ) -> i32;

    #[link_name = "UnlockFileEx"]
    fn unlock_file_ex(
        h_file: Handle,
        dw_reserved: u32,
        n_number_of_bytes_to_unlock_low: u32,
        n_number_of_bytes_to_unlock_high: u32,
        lp_overlapped: *mut Overlapped,
    ) -> i32;

    #[link_name = "GetLastError"]
    fn get_last_error() -> u32;

    #[link_name = "GetSystemInfo"]
    fn get_system_info(lp_system_info: *mut SystemInfo);
}

#[repr(C)]
struct SystemInfo {
    processor_arch_and_reserved: u32,
    page_size: u32,
    min_app_addr: *mut c_void,
    max_app_addr: *mut c_void,
    active_processor_mask: usize,
    number_of_processors: u32,
    processor_type: u32,
    alloc_granularity: u32,
    processor_level: u16,
    processor_revision: u16,
}

fn wide_path(path: &Path) -> Vec<u16> {
    path.as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

fn overlapped_at(offset: u64) -> Overlapped {
    Overlapped {
        internal: 0,
        internal_high: 0,
        offset: offset as u32,
        offset_high: (offset >> 32) as u32,
        h_event: core::ptr::null_mut(),
    }
}

pub struct WindowsBackend;

impl OsBackend for WindowsBackend {
    fn page_size(&self) -> usize {
        let mut info: SystemInfo = unsafe { core::mem::zeroed() };
        unsafe { get_system_info(&mut info) };
        info.page_size as usize
    }

    fn create_or_open(&self, path: &Path, total_bytes: u64) -> io::Result<RawHandle> {
        let wpath = wide_path(path);
        let file = unsafe {
            create_file_w(
                wpath.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                core::ptr::null_mut(),
                OPEN_ALWAYS,
                FILE_ATTRIBUTE_NORMAL,
                core::ptr::null_mut(),
            )
        };
        if file == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        let mut dist = total_bytes as i64;
        if unsafe { set_file_pointer_ex(file, dist, &mut dist as *mut i64, 0) } == 0 {
            let e = io::Error::last_os_error();
            unsafe { close_handle(file) };
            return Err(e);
        }
        if unsafe { set_end_of_file(file) } == 0 {
            let e = io::Error::last_os_error();
            unsafe { close_handle(file) };
            return Err(e);
        }
        Ok(RawHandle(file))
    }

    unsafe fn map(&self, handle: &RawHandle, len: usize) -> io::Result<*mut u8> {
        let mapping = unsafe {
            create_file_mapping_w(
                handle.0,
                core::ptr::null_mut(),
                PAGE_READWRITE,
                (len >> 32) as u32,
                len as u32,
                core::ptr::null(),
            )
        };
        if mapping.is_null() {
            return Err(io::Error::last_os_error());
        }
        let view = unsafe { map_view_of_file(mapping, FILE_MAP_WRITE, 0, 0, len) };
        // The mapping handle is not needed once the view exists; the OS
        // keeps the section alive until the last view is unmapped.
        unsafe { close_handle(mapping) };
        if view.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(view as *mut u8)
    }

    unsafe fn unmap(&self, ptr: *mut u8, _len: usize) -> io::Result<()> {
        if unsafe { unmap_view_of_file(ptr as *mut c_void) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    unsafe fn protect(&self, ptr: *mut u8, len: usize, prot: Protection) -> io::Result<()> {
        let flags = match prot {
            Protection::ReadOnly => PAGE_READONLY,
            Protection::ReadWrite => PAGE_READWRITE,
            Protection::NoAccess => PAGE_NOACCESS,
        };
        let mut old = 0u32;
        if unsafe { virtual_protect(ptr as *mut c_void, len, flags, &mut old as *mut u32) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    unsafe fn msync(&self, ptr: *mut u8, len: usize) -> io::Result<()> {
        if unsafe { flush_view_of_file(ptr as *mut c_void, len) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn try_lock_range(
        &self,
        handle: &RawHandle,
        offset: u64,
        len: u64,
        kind: LockKind,
    ) -> io::Result<LockOutcome> {
        let mut ov = overlapped_at(offset);
        let flags = LOCKFILE_FAIL_IMMEDIATELY
            | match kind {
                LockKind::Shared => 0,
                LockKind::Exclusive => LOCKFILE_EXCLUSIVE_LOCK,
            };
        let ok = unsafe {
            lock_file_ex(
                handle.0,
                flags,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut ov as *mut Overlapped,
            )
        };
        if ok != 0 {
            return Ok(LockOutcome::Acquired);
        }
        // Windows has no cross-process deadlock detector for file locks;
        // every contention surfaces as "would block" and the engine's lock
        // manager applies its own ordering discipline instead.
        match unsafe { get_last_error() } as i32 {
            ERROR_LOCK_VIOLATION | ERROR_IO_PENDING => Ok(LockOutcome::WouldBlock),
            _ => Err(io::Error::last_os_error()),
        }
    }

    fn lock_range_blocking(
        &self,
        handle: &RawHandle,
        offset: u64,
        len: u64,
        kind: LockKind,
    ) -> io::Result<()> {
        let mut ov = overlapped_at(offset);
        let flags = match kind {
            LockKind::Shared => 0,
            LockKind::Exclusive => LOCKFILE_EXCLUSIVE_LOCK,
        };
        if unsafe {
            lock_file_ex(
                handle.0,
                flags,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut ov as *mut Overlapped,
            )
        } == 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn unlock_range(&self, handle: &RawHandle, offset: u64, len: u64) -> io::Result<()> {
        let mut ov = overlapped_at(offset);
        if unsafe {
            unlock_file_ex(
                handle.0,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut ov as *mut Overlapped,
            )
        } == 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn destroy(&self, path: &Path) -> io::Result<()> {
        let wpath = wide_path(path);
        if unsafe { delete_file_w(wpath.as_ptr()) } == 0 {
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e);
            }
        }
        Ok(())
    }

    fn supports_repeated_unprotect(&self) -> bool {
        false
    }
}

impl Drop for RawHandle {
    fn drop(&mut self) {
        unsafe {
            close_handle(self.0);
        }
    }
}
