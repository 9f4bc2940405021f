//! Platform write-watch backend
//!
//! Alternative dirty-page source for arenas that opt out of trap-based
//! tracking: the kernel's soft-dirty mechanism. Bit 55 of a
//! `/proc/self/pagemap` entry is set when the page was written since soft-dirty
//! state was last cleared; writing `"4"` to `/proc/self/clear_refs` clears it.
//!
//! Querying is side-effect free, so a size-only capture call never consumes
//! the dirty generation. Resetting is process-wide: it clears soft-dirty
//! state for *every* mapping in the process, not just this arena. That is
//! the platform's granularity, and the reason an arena in this mode expects
//! single-producer discipline.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::error::Result;

const PAGEMAP: &str = "/proc/self/pagemap";
const CLEAR_REFS: &str = "/proc/self/clear_refs";
const SOFT_DIRTY_BIT: u64 = 1 << 55;

// Entries read per syscall when walking pagemap
const CHUNK_ENTRIES: usize = 512;

/// Soft-dirty query state for one arena: a scratch index array reused across
/// captures, sized to the arena's page count at construction.
#[derive(Debug)]
pub struct WriteWatch {
    scratch: Vec<u32>,
}

impl WriteWatch {
    pub fn new(num_pages: usize) -> Self {
        WriteWatch {
            scratch: Vec::with_capacity(num_pages),
        }
    }

    /// Dirty page indices for `[base, base + num_pages * page_size)`,
    /// ascending, borrowed from the scratch array. Does not consume the
    /// generation.
    pub fn query(&mut self, base: usize, num_pages: usize, page_size: usize) -> Result<&[u32]> {
        self.scratch.clear();
        walk(base, num_pages, page_size, |index| self.scratch.push(index))?;
        Ok(&self.scratch)
    }

    /// Dirty page count without touching the scratch array
    pub fn count_dirty(base: usize, num_pages: usize, page_size: usize) -> Result<usize> {
        let mut count = 0;
        walk(base, num_pages, page_size, |_| count += 1)?;
        Ok(count)
    }

    /// Clear soft-dirty state (process-wide, see module docs)
    pub fn reset() -> Result<()> {
        std::fs::write(CLEAR_REFS, b"4")?;
        Ok(())
    }
}

fn walk(
    base: usize,
    num_pages: usize,
    page_size: usize,
    mut on_dirty: impl FnMut(u32),
) -> Result<()> {
    let mut file = File::open(PAGEMAP)?;
    file.seek(SeekFrom::Start((base / page_size) as u64 * 8))?;

    let mut chunk = [0u8; CHUNK_ENTRIES * 8];
    let mut page = 0usize;
    while page < num_pages {
        let batch = (num_pages - page).min(CHUNK_ENTRIES);
        file.read_exact(&mut chunk[..batch * 8])?;
        for i in 0..batch {
            let entry = u64::from_le_bytes(chunk[i * 8..i * 8 + 8].try_into().unwrap());
            if entry & SOFT_DIRTY_BIT != 0 {
                on_dirty((page + i) as u32);
            }
        }
        page += batch;
    }
    Ok(())
}

/// Serializes tests that touch process-wide soft-dirty state
#[cfg(test)]
pub(crate) static SOFT_DIRTY_TEST_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm;

    // Soft-dirty needs CONFIG_MEM_SOFT_DIRTY; bail out quietly where the
    // kernel was built without it.
    fn soft_dirty_available() -> bool {
        WriteWatch::reset().is_ok()
    }

    #[test]
    fn test_written_pages_reported_dirty() {
        let _guard = SOFT_DIRTY_TEST_LOCK.lock();
        if !soft_dirty_available() {
            return;
        }
        let ps = vm::page_size();
        let ptr = vm::reserve_and_commit(0, 4 * ps).unwrap();
        WriteWatch::reset().unwrap();

        unsafe {
            ptr.write(1);
            ptr.add(2 * ps).write(1);
        }

        let mut watch = WriteWatch::new(4);
        let dirty = watch.query(ptr as usize, 4, ps).unwrap();
        assert_eq!(dirty, &[0, 2]);
        assert_eq!(
            WriteWatch::count_dirty(ptr as usize, 4, ps).unwrap(),
            2
        );
        vm::unreserve(ptr as usize, 4 * ps).unwrap();
    }

    #[test]
    fn test_query_does_not_consume_generation() {
        let _guard = SOFT_DIRTY_TEST_LOCK.lock();
        if !soft_dirty_available() {
            return;
        }
        let ps = vm::page_size();
        let ptr = vm::reserve_and_commit(0, 2 * ps).unwrap();
        WriteWatch::reset().unwrap();
        unsafe { ptr.write(1) };

        let mut watch = WriteWatch::new(2);
        assert_eq!(watch.query(ptr as usize, 2, ps).unwrap(), &[0]);
        assert_eq!(watch.query(ptr as usize, 2, ps).unwrap(), &[0]);

        WriteWatch::reset().unwrap();
        assert!(watch.query(ptr as usize, 2, ps).unwrap().is_empty());
        vm::unreserve(ptr as usize, 2 * ps).unwrap();
    }
}
