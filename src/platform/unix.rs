//! Unix backend: file-backed shared mmap, `fcntl` byte-range locks,
//! `mprotect`, `msync`. Raw `extern "C"` declarations rather than pulling
//! in `libc`/`memmap2` for this layer.

use super::{LockKind, LockOutcome, OsBackend, Protection, RawHandle};
use core::ffi::c_void;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const PROT_NONE: i32 = 0x0;
const PROT_READ: i32 = 0x1;
const PROT_WRITE: i32 = 0x2;
const MAP_SHARED: i32 = 0x01;
const MAP_FAILED: *mut c_void = !0usize as *mut c_void;

const O_RDWR: i32 = 0o2;
const O_CREAT: i32 = 0o100;

const F_SETLK: i32 = 6;
const F_SETLKW: i32 = 7;
const F_RDLCK: i16 = 0;
const F_WRLCK: i16 = 1;
const F_UNLCK: i16 = 2;
const SEEK_SET: i16 = 0;

const MS_SYNC: i32 = 4;

/// Linux's `EDEADLK`; other Unixes may number it differently, but this
/// backend only targets the Linux ABI.
const EDEADLK: i32 = 35;
const EACCES: i32 = 13;
const EAGAIN: i32 = 11;

#[repr(C)]
struct Flock {
    l_type: i16,
    l_whence: i16,
    l_start: i64,
    l_len: i64,
    l_pid: i32,
}

unsafe extern "C" {
    fn open(path: *const i8, flags: i32, mode: u32) -> i32;
    fn close(fd: i32) -> i32;
    fn ftruncate(fd: i32, length: i64) -> i32;
    fn unlink(path: *const i8) -> i32;

    fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> *mut c_void;
    fn munmap(addr: *mut c_void, length: usize) -> i32;
    fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;
    fn msync(addr: *mut c_void, length: usize, flags: i32) -> i32;

    fn fcntl(fd: i32, cmd: i32, lock: *mut Flock) -> i32;

    fn sysconf(name: i32) -> i64;

    #[link_name = "__errno_location"]
    fn errno_location() -> *mut i32;
}

const _SC_PAGESIZE: i32 = 30;

fn errno() -> i32 {
    unsafe { *errno_location() }
}

fn path_to_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

pub struct UnixBackend;

impl OsBackend for UnixBackend {
    fn page_size(&self) -> usize {
        let v = unsafe { sysconf(_SC_PAGESIZE) };
        if v > 0 {
            v as usize
        } else {
            4096
        }
    }

    fn create_or_open(&self, path: &Path, total_bytes: u64) -> io::Result<RawHandle> {
        let cpath = path_to_cstring(path)?;
        let fd = unsafe { open(cpath.as_ptr(), O_RDWR | O_CREAT, 0o644) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { ftruncate(fd, total_bytes as i64) } != 0 {
            let e = io::Error::last_os_error();
            unsafe { close(fd) };
            return Err(e);
        }
        Ok(RawHandle(fd))
    }

    unsafe fn map(&self, handle: &RawHandle, len: usize) -> io::Result<*mut u8> {
        let raw = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                handle.0,
                0,
            )
        };
        if raw == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(raw as *mut u8)
    }

    unsafe fn unmap(&self, ptr: *mut u8, len: usize) -> io::Result<()> {
        if unsafe { munmap(ptr as *mut c_void, len) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    unsafe fn protect(&self, ptr: *mut u8, len: usize, prot: Protection) -> io::Result<()> {
        let flags = match prot {
            Protection::ReadOnly => PROT_READ,
            Protection::ReadWrite => PROT_READ | PROT_WRITE,
            Protection::NoAccess => PROT_NONE,
        };
        if unsafe { mprotect(ptr as *mut c_void, len, flags) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    unsafe fn msync(&self, ptr: *mut u8, len: usize) -> io::Result<()> {
        if unsafe { msync(ptr as *mut c_void, len, MS_SYNC) } != 0 {
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
        let mut lock = Flock {
            l_type: match kind {
                LockKind::Shared => F_RDLCK,
                LockKind::Exclusive => F_WRLCK,
            },
            l_whence: SEEK_SET,
            l_start: offset as i64,
            l_len: len as i64,
            l_pid: 0,
        };
        if unsafe { fcntl(handle.0, F_SETLK, &mut lock as *mut Flock) } == 0 {
            return Ok(LockOutcome::Acquired);
        }
        match errno() {
            EDEADLK => Ok(LockOutcome::WouldDeadlock),
            EACCES | EAGAIN => Ok(LockOutcome::WouldBlock),
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
        let mut lock = Flock {
            l_type: match kind {
                LockKind::Shared => F_RDLCK,
                LockKind::Exclusive => F_WRLCK,
            },
            l_whence: SEEK_SET,
            l_start: offset as i64,
            l_len: len as i64,
            l_pid: 0,
        };
        if unsafe { fcntl(handle.0, F_SETLKW, &mut lock as *mut Flock) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn unlock_range(&self, handle: &RawHandle, offset: u64, len: u64) -> io::Result<()> {
        let mut lock = Flock {
            l_type: F_UNLCK,
            l_whence: SEEK_SET,
            l_start: offset as i64,
            l_len: len as i64,
            l_pid: 0,
        };
        if unsafe { fcntl(handle.0, F_SETLK, &mut lock as *mut Flock) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn destroy(&self, path: &Path) -> io::Result<()> {
        let cpath = path_to_cstring(path)?;
        if unsafe { unlink(cpath.as_ptr()) } != 0 {
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Drop for RawHandle {
    fn drop(&mut self) {
        unsafe {
            close(self.0);
        }
    }
}
