//! Dirty bookkeeping region
//!
//! Every diff-tracked arena carries a side region recording which of its
//! pages changed since the last consumed capture:
//!
//! - a magic number stamping the region as initialized
//! - an atomic dirty-page counter (a size hint, not load-bearing)
//! - a bitmap with one bit per page (the authoritative record)
//!
//! The region lives at `arena_base + MAX_ARENA_SIZE`, an address derived by
//! arithmetic alone. Nothing stores a pointer to it: the fault handler
//! recovers the owning arena base from the faulting address with a single
//! mask and lands here without touching any lookup table.
//!
//! `mark_dirty` is lock-free and safe to call concurrently for different
//! pages. Two threads marking the *same* page may both observe the bit clear
//! and double-increment the counter; the bitmap itself stays exact, which is
//! why capture sizes its output from a bitmap walk rather than the counter.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::MAX_ARENA_SIZE;

/// Magic stamped at offset 0 of an initialized bookkeeping region
pub const TRACKING_MAGIC: u64 = u64::from_le_bytes(*b"PGMIRROR");

const COUNT_OFFSET: usize = 8;
// Bitmap starts one cache line in, keeping the hot counter word away from it
const BITMAP_OFFSET: usize = 64;

/// Offset of an arena's bookkeeping region from its base
pub const fn tracking_offset() -> usize {
    MAX_ARENA_SIZE
}

/// Bytes to reserve for a bookkeeping region, rounded to page granularity.
///
/// The bitmap is always sized for a maximal arena so the fault handler can
/// mark any in-range page without knowing the arena's actual length.
pub fn tracking_region_len(page_size: usize) -> usize {
    let bitmap_bytes = MAX_ARENA_SIZE / page_size / 8;
    let raw = BITMAP_OFFSET + bitmap_bytes;
    (raw + page_size - 1) & !(page_size - 1)
}

/// Handle onto a bookkeeping region at a known address.
///
/// Copyable value type over raw memory; the committed mapping outlives every
/// handle because the owning arena unreserves it only on drop.
#[derive(Debug, Clone, Copy)]
pub struct TrackingRegion {
    base: usize,
}

impl TrackingRegion {
    /// Handle for the bookkeeping region of the arena based at `arena_base`
    ///
    /// # Safety
    ///
    /// `arena_base + MAX_ARENA_SIZE` must point at a live committed mapping
    /// of at least [`tracking_region_len`] bytes.
    pub unsafe fn from_arena_base(arena_base: usize) -> Self {
        TrackingRegion {
            base: arena_base + tracking_offset(),
        }
    }

    /// Handle at an explicit address (tests and the reset path during
    /// construction, where the region was just committed)
    ///
    /// # Safety
    ///
    /// Same mapping requirements as [`TrackingRegion::from_arena_base`].
    pub unsafe fn at(base: usize) -> Self {
        TrackingRegion { base }
    }

    fn magic(&self) -> &AtomicU64 {
        unsafe { &*(self.base as *const AtomicU64) }
    }

    fn count(&self) -> &AtomicU64 {
        unsafe { &*((self.base + COUNT_OFFSET) as *const AtomicU64) }
    }

    fn word(&self, index: usize) -> &AtomicU64 {
        unsafe { &*((self.base + BITMAP_OFFSET + index * 8) as *const AtomicU64) }
    }

    /// Zero the bitmap and counter and stamp the magic.
    ///
    /// Called at arena construction and after every consumed diff capture;
    /// the caller serializes against the fault path (dispatcher lock).
    pub fn reset(&self, num_pages: usize) {
        for w in 0..Self::word_count(num_pages) {
            self.word(w).store(0, Ordering::Relaxed);
        }
        self.count().store(0, Ordering::Relaxed);
        self.magic().store(TRACKING_MAGIC, Ordering::Release);
    }

    /// Whether the magic stamp is present
    pub fn magic_valid(&self) -> bool {
        self.magic().load(Ordering::Acquire) == TRACKING_MAGIC
    }

    /// Atomically record a write to `page_index`.
    ///
    /// Increments the counter only on the 0 -> 1 bit transition this thread
    /// observed. Async-signal-safe: atomics only.
    pub fn mark_dirty(&self, page_index: usize) {
        let bit = 1u64 << (page_index % 64);
        let prev = self.word(page_index / 64).fetch_or(bit, Ordering::AcqRel);
        if prev & bit == 0 {
            self.count().fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Dirty-page count hint
    pub fn dirty_count(&self) -> u64 {
        self.count().load(Ordering::Acquire)
    }

    /// Append the index of every set bit in `0..num_pages` to `out`,
    /// ascending
    pub fn collect_dirty(&self, num_pages: usize, out: &mut Vec<u32>) {
        for w in 0..Self::word_count(num_pages) {
            let mut bits = self.word(w).load(Ordering::Acquire);
            while bits != 0 {
                let b = bits.trailing_zeros() as usize;
                let index = w * 64 + b;
                if index >= num_pages {
                    break;
                }
                out.push(index as u32);
                bits &= bits - 1;
            }
        }
    }

    fn word_count(num_pages: usize) -> usize {
        (num_pages + 63) / 64
    }
}

// Raw pointers to a mapping shared with the fault path; all access is atomic.
unsafe impl Send for TrackingRegion {}
unsafe impl Sync for TrackingRegion {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm;

    fn scratch_region() -> (TrackingRegion, usize, usize) {
        let len = tracking_region_len(vm::page_size());
        let ptr = vm::reserve_and_commit(0, len).unwrap();
        (unsafe { TrackingRegion::at(ptr as usize) }, ptr as usize, len)
    }

    #[test]
    fn test_reset_stamps_magic_and_zeroes() {
        let (t, addr, len) = scratch_region();
        t.reset(1024);
        assert!(t.magic_valid());
        assert_eq!(t.dirty_count(), 0);
        let mut pages = Vec::new();
        t.collect_dirty(1024, &mut pages);
        assert!(pages.is_empty());
        vm::unreserve(addr, len).unwrap();
    }

    #[test]
    fn test_mark_dirty_sets_bit_and_counts() {
        let (t, addr, len) = scratch_region();
        t.reset(1024);

        t.mark_dirty(0);
        t.mark_dirty(63);
        t.mark_dirty(64);
        t.mark_dirty(1023);
        assert_eq!(t.dirty_count(), 4);

        let mut pages = Vec::new();
        t.collect_dirty(1024, &mut pages);
        assert_eq!(pages, vec![0, 63, 64, 1023]);
        vm::unreserve(addr, len).unwrap();
    }

    #[test]
    fn test_remarking_same_page_counts_once() {
        let (t, addr, len) = scratch_region();
        t.reset(128);

        t.mark_dirty(7);
        t.mark_dirty(7);
        t.mark_dirty(7);
        assert_eq!(t.dirty_count(), 1);

        let mut pages = Vec::new();
        t.collect_dirty(128, &mut pages);
        assert_eq!(pages, vec![7]);
        vm::unreserve(addr, len).unwrap();
    }

    #[test]
    fn test_reset_after_marks_is_idempotent() {
        let (t, addr, len) = scratch_region();
        t.reset(256);
        for p in 0..256 {
            t.mark_dirty(p);
        }
        assert_eq!(t.dirty_count(), 256);

        t.reset(256);
        t.reset(256);
        assert_eq!(t.dirty_count(), 0);
        let mut pages = Vec::new();
        t.collect_dirty(256, &mut pages);
        assert!(pages.is_empty());
        vm::unreserve(addr, len).unwrap();
    }

    #[test]
    fn test_concurrent_marks_distinct_pages() {
        let (t, addr, len) = scratch_region();
        t.reset(1024);

        let handles: Vec<_> = (0..8)
            .map(|thread_id| {
                std::thread::spawn(move || {
                    for i in 0..128 {
                        t.mark_dirty(thread_id * 128 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(t.dirty_count(), 1024);
        let mut pages = Vec::new();
        t.collect_dirty(1024, &mut pages);
        assert_eq!(pages.len(), 1024);
        vm::unreserve(addr, len).unwrap();
    }
}
