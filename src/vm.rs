//! VM capability shim
//!
//! Thin facade over the host's virtual-memory primitives: reserve+commit an
//! anonymous region (optionally at a fixed address), flip page access
//! protection, release a reservation, and query the page size. The shim has
//! no state of its own; failures surface as [`ArenaError::Vm`] carrying the
//! platform errno.

use crate::error::{ArenaError, Result};

/// Page access protection for [`set_access`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Reads allowed, writes trap
    ReadOnly,
    /// Reads and writes allowed
    ReadWrite,
}

impl Protection {
    fn as_prot(self) -> libc::c_int {
        match self {
            Protection::ReadOnly => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// Host page size in bytes
pub fn page_size() -> usize {
    // sysconf is async-signal-safe, so this is callable from the fault path
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Reserve and commit `size` bytes of zeroed anonymous memory.
///
/// With `addr == 0` the kernel picks the placement. A non-zero `addr` is a
/// hard requirement: the mapping lands exactly there or the call fails
/// (`MAP_FIXED_NOREPLACE`, so an occupied range is an error rather than a
/// silent remap of foreign memory).
pub fn reserve_and_commit(addr: usize, size: usize) -> Result<*mut u8> {
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    if addr != 0 {
        flags |= libc::MAP_FIXED_NOREPLACE;
    }

    let ptr = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(ArenaError::Vm(std::io::Error::last_os_error()));
    }

    // Pre-4.17 kernels ignore MAP_FIXED_NOREPLACE and return a different
    // address instead of failing; treat that as the range being unavailable.
    if addr != 0 && ptr as usize != addr {
        unsafe { libc::munmap(ptr, size) };
        return Err(ArenaError::Vm(std::io::Error::from_raw_os_error(
            libc::EEXIST,
        )));
    }

    Ok(ptr as *mut u8)
}

/// Change page protection on `[addr, addr + size)`
pub fn set_access(addr: usize, size: usize, protection: Protection) -> Result<()> {
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, size, protection.as_prot()) };
    if rc != 0 {
        return Err(ArenaError::Vm(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Release a reservation created by [`reserve_and_commit`]
pub fn unreserve(addr: usize, size: usize) -> Result<()> {
    let rc = unsafe { libc::munmap(addr as *mut libc::c_void, size) };
    if rc != 0 {
        return Err(ArenaError::Vm(std::io::Error::last_os_error()));
    }
    Ok(())
}
