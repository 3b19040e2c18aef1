//! Shareable backing memory.
//!
//! Every allocation and event pool is backed by an anonymous `memfd` so the
//! same pages can be mapped by the device side, by the host, and by another
//! process that imported the descriptor.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

/// A `memfd` of fixed length.
#[derive(Debug)]
pub struct SharedMemory {
    fd: OwnedFd,
    len: usize,
    inode: u64,
}

impl SharedMemory {
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        let name = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: memfd_create returned a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let inode = fstat(fd.as_raw_fd())?.st_ino;
        Ok(Self { fd, len, inode })
    }

    /// Adopts a duplicated descriptor, verifying it still names `expected_inode`.
    pub fn adopt(fd: OwnedFd, expected_inode: u64) -> io::Result<Self> {
        let st = fstat(fd.as_raw_fd())?;
        if st.st_ino != expected_inode {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("descriptor names inode {} not {expected_inode}", st.st_ino),
            ));
        }
        Ok(Self {
            fd,
            len: st.st_size as usize,
            inode: st.st_ino,
        })
    }

    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn inode(&self) -> u64 {
        self.inode
    }

    /// Maps the first `len` bytes over `addr`, which must lie in a reservation.
    pub fn map_fixed(&self, addr: u64, len: usize) -> io::Result<()> {
        let ret = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.fd.as_raw_fd(),
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Maps the whole object at a kernel-chosen address.
    pub fn map(&self) -> io::Result<u64> {
        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                self.len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as u64)
    }
}

/// A live CPU mapping of [`SharedMemory`]. Owners wrap it in a
/// [`ScopedHandle`](crate::handle::ScopedHandle) whose destroy callback tears
/// the mapping down.
#[derive(Debug)]
pub struct Mapping {
    pub addr: u64,
    pub len: usize,
    pub memory: SharedMemory,
}

pub fn unmap(addr: u64, len: usize) {
    if unsafe { libc::munmap(addr as *mut libc::c_void, len) } != 0 {
        tracing::warn!(addr = format_args!("0x{addr:x}"), len, "munmap failed: {}", io::Error::last_os_error());
    }
}

// ===============================================================================================
// Address space reservation
// ===============================================================================================

/// An inaccessible, non-committed virtual address window.
#[derive(Debug)]
pub struct Reservation {
    base: u64,
    len: usize,
}

impl Reservation {
    pub fn new(len: usize) -> io::Result<Self> {
        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            base: ret as u64,
            len,
        })
    }

    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `[addr, addr + len)` to the inaccessible state.
    pub fn release(&self, addr: u64, len: usize) -> io::Result<()> {
        debug_assert!(addr >= self.base && addr + len as u64 <= self.base + self.len as u64);
        let ret = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        unmap(self.base, self.len);
    }
}

// ===============================================================================================
// Descriptor transfer
// ===============================================================================================

/// Obtains a local copy of descriptor `fd` owned by process `pid`.
///
/// Within one process this is a plain `dup`. Across processes it goes through
/// `pidfd_open` + `pidfd_getfd`, which needs ptrace access to the exporter.
pub fn duplicate_fd(pid: u32, fd: RawFd) -> io::Result<OwnedFd> {
    if pid == std::process::id() {
        let ret = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fcntl returned a fresh descriptor.
        return Ok(unsafe { OwnedFd::from_raw_fd(ret) });
    }

    let pidfd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0) };
    if pidfd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pidfd_open returned a fresh descriptor.
    let pidfd = unsafe { OwnedFd::from_raw_fd(pidfd as RawFd) };

    let ret = unsafe { libc::syscall(libc::SYS_pidfd_getfd, pidfd.as_raw_fd(), fd, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pidfd_getfd returned a fresh descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

fn fstat(fd: RawFd) -> io::Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, st.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fstat succeeded and filled the buffer.
    Ok(unsafe { st.assume_init() })
}
