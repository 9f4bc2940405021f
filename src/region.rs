//! Aligned arena memory
//!
//! The arena never allocates the memory it mirrors; callers own it. What
//! callers do need is memory satisfying the arena's placement contract:
//! based on a 128 MiB boundary, with the successor bookkeeping slot at
//! `base + 128 MiB` unmapped and available. [`AlignedRegion`] produces
//! exactly that by over-reserving twice the alignment and trimming both
//! ends, and is what the crate's own tests, benches, and demos use.

use crate::error::Result;
use crate::vm;
use crate::{MAX_ARENA_SIZE, REQUIRED_ALIGNMENT};

/// Owned anonymous mapping aligned to the arena boundary
#[derive(Debug)]
pub struct AlignedRegion {
    base: *mut u8,
    len: usize,
}

impl AlignedRegion {
    /// Map `size` bytes (rounded up to page granularity) at a 128 MiB
    /// aligned base, leaving `base + 128 MiB` onward unmapped.
    pub fn new(size: usize) -> Result<Self> {
        let page_size = vm::page_size();
        let len = (size + page_size - 1) & !(page_size - 1);
        if len == 0 || len > MAX_ARENA_SIZE {
            return Err(crate::error::ArenaError::InvalidSize(size));
        }

        // Over-reserve so an aligned base plus the full arena slot fits,
        // then trim the slack below the base and everything above the
        // usable length. The trimmed tail keeps the bookkeeping slot free.
        let span = 2 * REQUIRED_ALIGNMENT;
        let raw = vm::reserve_and_commit(0, span)? as usize;
        let base = (raw + REQUIRED_ALIGNMENT - 1) & !(REQUIRED_ALIGNMENT - 1);

        if base > raw {
            vm::unreserve(raw, base - raw)?;
        }
        let tail = raw + span - (base + len);
        if tail > 0 {
            vm::unreserve(base + len, tail)?;
        }

        Ok(AlignedRegion {
            base: base as *mut u8,
            len,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The mapping as a byte slice (reads must be permitted by the current
    /// page protection)
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.len) }
    }
}

impl Drop for AlignedRegion {
    fn drop(&mut self) {
        if let Err(e) = vm::unreserve(self.base as usize, self.len) {
            tracing::warn!(error = %e, "failed to unreserve aligned region");
        }
    }
}

unsafe impl Send for AlignedRegion {}
