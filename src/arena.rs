//! Mirrored memory arena
//!
//! An [`Arena`] wraps a caller-owned memory region and answers one question
//! cheaply: which pages changed since the last capture? A capture packages
//! the answer into a change buffer a peer can [`Arena::apply_changes`] to
//! its own mirror of the region.
//!
//! The usage mode picks the tracking strategy:
//!
//! - [`UsageMode::ReadWrite`]: no tracking; capture snapshots the whole
//!   region as a full copy.
//! - [`UsageMode::ReadWriteDiff`]: trap-based tracking; the region stays
//!   read-only and the first write to each page faults into the dispatcher,
//!   which records it. Capture emits only dirty pages.
//! - [`UsageMode::ReadWriteDiffNoTraps`]: the same sparse output, produced
//!   from the kernel's soft-dirty write-watch instead of a custom fault
//!   handler.
//! - [`UsageMode::Read`]: a passive mirror; apply is the only mutation and
//!   capture always fails.
//!
//! Capture and apply on one arena require external single-writer
//! discipline; writes to the mirrored memory itself may come from any
//! thread at any time.

use crate::codec::{
    diff_entry_len, ChangeHeader, ChangeKind, DiffEntries, CHANGE_HEADER_LEN,
};
use crate::dispatch::{ClassificationMode, FaultDispatcher};
use crate::error::{ArenaError, Result};
use crate::tracking::{tracking_offset, tracking_region_len, TrackingRegion};
use crate::vm::{self, Protection};
use crate::writewatch::WriteWatch;
use crate::{MAX_ARENA_SIZE, REQUIRED_ALIGNMENT};

/// Dirty-tracking strategy for an arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageMode {
    /// Passive mirror: apply-only, never captured
    Read,
    /// Mutable, untracked: capture produces a full copy
    ReadWrite,
    /// Mutable, trap-tracked: capture produces a sparse diff
    ReadWriteDiff,
    /// Mutable, write-watch-tracked: sparse diff without a fault handler
    ReadWriteDiffNoTraps,
}

/// Construction descriptor for [`Arena::new`]
#[derive(Debug, Clone, Copy)]
pub struct ArenaDesc {
    /// Caller-owned memory; must be aligned to the 128 MiB arena boundary
    pub base: *mut u8,
    /// Region length in bytes, `0 < size <= 128 MiB`
    pub size: usize,
    pub usage: UsageMode,
    /// Fault classification requested when this arena installs the
    /// dispatcher (first diff arena in the process wins)
    pub classification: ClassificationMode,
}

impl ArenaDesc {
    pub fn new(base: *mut u8, size: usize, usage: UsageMode) -> Self {
        ArenaDesc {
            base,
            size,
            usage,
            classification: ClassificationMode::Strict,
        }
    }
}

/// A mirrored memory region plus its change-tracking state.
///
/// Owns only what it reserves itself (the bookkeeping region, the registry
/// entry, the write-watch scratch array); the mirrored memory belongs to
/// the caller and survives the arena.
pub struct Arena {
    base: *mut u8,
    size: usize,
    usage: UsageMode,
    page_size: usize,
    num_pages: usize,
    /// `size` rounded up to page granularity; protection flips and page
    /// copies operate on whole pages
    mapped_len: usize,
    tracking: Option<TrackingRegion>,
    dispatcher: Option<&'static FaultDispatcher>,
    watch: Option<WriteWatch>,
}

// The arena is a handle over raw memory; moving it between threads is fine,
// sharing it is not (capture/apply take &mut self).
unsafe impl Send for Arena {}

impl Arena {
    /// Validate the descriptor and attach tracking state per usage mode.
    ///
    /// A failed construction leaks nothing: partially reserved state is
    /// unwound and the caller's memory is left with its protection intact.
    pub fn new(desc: ArenaDesc) -> Result<Self> {
        if desc.base.is_null() {
            return Err(ArenaError::NullBase);
        }
        if desc.base as usize % REQUIRED_ALIGNMENT != 0 {
            return Err(ArenaError::MisalignedBase(desc.base as usize));
        }
        if desc.size == 0 || desc.size > MAX_ARENA_SIZE {
            return Err(ArenaError::InvalidSize(desc.size));
        }

        let page_size = vm::page_size();
        let num_pages = (desc.size + page_size - 1) / page_size;
        let mapped_len = num_pages * page_size;

        let mut arena = Arena {
            base: desc.base,
            size: desc.size,
            usage: desc.usage,
            page_size,
            num_pages,
            mapped_len,
            tracking: None,
            dispatcher: None,
            watch: None,
        };

        match desc.usage {
            UsageMode::Read | UsageMode::ReadWrite => {}
            UsageMode::ReadWriteDiff => arena.attach_trap_tracking(desc.classification)?,
            UsageMode::ReadWriteDiffNoTraps => {
                WriteWatch::reset()?;
                arena.watch = Some(WriteWatch::new(num_pages));
            }
        }

        tracing::debug!(
            base = desc.base as usize,
            size = desc.size,
            usage = ?desc.usage,
            "arena created"
        );
        Ok(arena)
    }

    fn attach_trap_tracking(&mut self, classification: ClassificationMode) -> Result<()> {
        let base = self.base as usize;
        let tracking_base = base + tracking_offset();
        let tracking_len = tracking_region_len(self.page_size);

        vm::reserve_and_commit(tracking_base, tracking_len)?;
        let tracking = unsafe { TrackingRegion::at(tracking_base) };
        tracking.reset(self.num_pages);

        let dispatcher = FaultDispatcher::install(classification);
        if let Err(e) = dispatcher.register_arena(base, self.mapped_len) {
            if classification == ClassificationMode::Strict {
                let _ = vm::unreserve(tracking_base, tracking_len);
                return Err(e);
            }
            // Trusting classification never consults the registry; a full
            // table only costs diagnostics
            tracing::warn!(error = %e, "arena registry full; continuing unregistered");
        }

        if let Err(e) = vm::set_access(base, self.mapped_len, Protection::ReadOnly) {
            dispatcher.unregister_arena(base);
            let _ = vm::unreserve(tracking_base, tracking_len);
            return Err(e);
        }

        self.tracking = Some(tracking);
        self.dispatcher = Some(dispatcher);
        Ok(())
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn usage(&self) -> UsageMode {
        self.usage
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Pages written since the last consumed capture.
    ///
    /// Per mode: the bookkeeping counter (`ReadWriteDiff`), a non-consuming
    /// write-watch query (`ReadWriteDiffNoTraps`), the total page count as a
    /// conservative bound (`ReadWrite`, nothing tracks writes), or 0
    /// (`Read`, nothing writes).
    pub fn dirty_page_count(&self) -> usize {
        match self.usage {
            UsageMode::Read => 0,
            UsageMode::ReadWrite => self.num_pages,
            UsageMode::ReadWriteDiff => {
                self.tracking.map_or(0, |t| t.dirty_count() as usize)
            }
            UsageMode::ReadWriteDiffNoTraps => {
                WriteWatch::count_dirty(self.base as usize, self.num_pages, self.page_size)
                    .unwrap_or(self.num_pages)
            }
        }
    }

    /// Capture changes since the last capture into `dest`.
    ///
    /// Returns the byte count written. An empty `dest` is the size query:
    /// nothing is written, the dirty generation is not consumed, and the
    /// return value is the capacity a subsequent call needs. A non-empty
    /// `dest` smaller than required fails with [`ArenaError::BufferTooSmall`]
    /// before any byte is written, also without consuming the generation.
    pub fn capture_changes(&mut self, dest: &mut [u8]) -> Result<usize> {
        match self.usage {
            UsageMode::Read => Err(ArenaError::CaptureUnsupported),
            UsageMode::ReadWrite => self.capture_full_copy(dest),
            UsageMode::ReadWriteDiff => self.capture_trap_diff(dest),
            UsageMode::ReadWriteDiffNoTraps => self.capture_watch_diff(dest),
        }
    }

    /// Capture into a freshly sized buffer.
    ///
    /// Re-queries on the rare race where new pages dirtied between the size
    /// query and the capture itself.
    pub fn capture_to_vec(&mut self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        loop {
            let required = self.capture_changes(&mut [])?;
            buffer.resize(required, 0);
            match self.capture_changes(&mut buffer) {
                Ok(written) => {
                    buffer.truncate(written);
                    return Ok(buffer);
                }
                Err(ArenaError::BufferTooSmall { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn capture_full_copy(&mut self, dest: &mut [u8]) -> Result<usize> {
        let required = CHANGE_HEADER_LEN + self.size;
        if dest.is_empty() {
            return Ok(required);
        }
        if dest.len() < required {
            return Err(ArenaError::BufferTooSmall { required });
        }

        // Freeze writers for a consistent image, copy, thaw
        vm::set_access(self.base as usize, self.mapped_len, Protection::ReadOnly)?;
        let header = ChangeHeader::new(ChangeKind::FullCopy, self.size as u64);
        dest[..CHANGE_HEADER_LEN].copy_from_slice(&header.to_bytes());
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base,
                dest[CHANGE_HEADER_LEN..].as_mut_ptr(),
                self.size,
            );
        }
        vm::set_access(self.base as usize, self.mapped_len, Protection::ReadWrite)?;

        tracing::debug!(bytes = required, "full-copy capture");
        Ok(required)
    }

    fn capture_trap_diff(&mut self, dest: &mut [u8]) -> Result<usize> {
        let tracking = self.tracking.expect("diff arena always carries tracking");
        let entry_len = diff_entry_len(self.page_size);

        if dest.is_empty() {
            // Size query from the counter hint; no flip, no reset
            return Ok(CHANGE_HEADER_LEN + tracking.dirty_count() as usize * entry_len);
        }

        let dispatcher = self
            .dispatcher
            .expect("diff arena always carries a dispatcher");
        let _guard = dispatcher.lock_fault_path();

        if !tracking.magic_valid() {
            return Err(ArenaError::InvalidTrackingMagic);
        }

        // Re-protect everything first so writes racing past this point
        // start a fresh generation
        vm::set_access(self.base as usize, self.mapped_len, Protection::ReadOnly)?;

        let mut pages = Vec::with_capacity(tracking.dirty_count() as usize);
        tracking.collect_dirty(self.num_pages, &mut pages);

        let required = CHANGE_HEADER_LEN + pages.len() * entry_len;
        if dest.len() < required {
            // Bitmap untouched: the caller can retry with the reported size
            return Err(ArenaError::BufferTooSmall { required });
        }

        let header = ChangeHeader::new(ChangeKind::SparseDiff, (required - CHANGE_HEADER_LEN) as u64);
        dest[..CHANGE_HEADER_LEN].copy_from_slice(&header.to_bytes());
        let mut offset = CHANGE_HEADER_LEN;
        for &index in &pages {
            dest[offset..offset + 4].copy_from_slice(&index.to_le_bytes());
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.base.add(index as usize * self.page_size),
                    dest[offset + 4..].as_mut_ptr(),
                    self.page_size,
                );
            }
            offset += entry_len;
        }

        tracking.reset(self.num_pages);

        tracing::debug!(pages = pages.len(), bytes = required, "sparse-diff capture");
        Ok(required)
    }

    fn capture_watch_diff(&mut self, dest: &mut [u8]) -> Result<usize> {
        let base = self.base as usize;
        let entry_len = diff_entry_len(self.page_size);

        if dest.is_empty() {
            let dirty = WriteWatch::count_dirty(base, self.num_pages, self.page_size)?;
            return Ok(CHANGE_HEADER_LEN + dirty * entry_len);
        }

        let watch = self.watch.as_mut().expect("no-traps arena carries a watch");
        let pages = watch.query(base, self.num_pages, self.page_size)?;

        let required = CHANGE_HEADER_LEN + pages.len() * entry_len;
        if dest.len() < required {
            return Err(ArenaError::BufferTooSmall { required });
        }

        // Reset before copying: a write landing during the copy re-dirties
        // its page and the next capture picks it up. Resetting after the
        // copy would erase such a write untracked.
        WriteWatch::reset()?;

        let header = ChangeHeader::new(ChangeKind::SparseDiff, (required - CHANGE_HEADER_LEN) as u64);
        dest[..CHANGE_HEADER_LEN].copy_from_slice(&header.to_bytes());
        let mut offset = CHANGE_HEADER_LEN;
        for &index in pages {
            dest[offset..offset + 4].copy_from_slice(&index.to_le_bytes());
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.base.add(index as usize * self.page_size),
                    dest[offset + 4..].as_mut_ptr(),
                    self.page_size,
                );
            }
            offset += entry_len;
        }
        let captured = pages.len();

        tracing::debug!(pages = captured, bytes = required, "write-watch capture");
        Ok(required)
    }

    /// Replay a change buffer onto this arena's memory.
    ///
    /// Every protocol check (kind tag, payload length, page indices, size
    /// match) runs before the first byte is applied. `Read` arenas are
    /// transiently widened to read-write around the copy and restored to
    /// read-only afterward.
    pub fn apply_changes(&mut self, buffer: &[u8]) -> Result<()> {
        let header = ChangeHeader::from_bytes(buffer)?;
        let payload = header.payload(buffer);

        match header.kind {
            ChangeKind::FullCopy => {
                if payload.len() != self.size {
                    return Err(ArenaError::SizeMismatch {
                        payload: header.payload_size,
                        arena: self.size,
                    });
                }
                self.with_writable(|arena| {
                    unsafe {
                        std::ptr::copy_nonoverlapping(payload.as_ptr(), arena.base, payload.len());
                    }
                    Ok(())
                })?;
                tracing::debug!(bytes = payload.len(), "full copy applied");
            }
            ChangeKind::SparseDiff => {
                for (index, _) in DiffEntries::new(payload, self.page_size)? {
                    if index as usize >= self.num_pages {
                        return Err(ArenaError::InvalidPageIndex {
                            index,
                            pages: self.num_pages,
                        });
                    }
                }
                let pages = self.with_writable(|arena| {
                    let entries = DiffEntries::new(payload, arena.page_size)?;
                    let mut pages = 0;
                    for (index, bytes) in entries {
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                bytes.as_ptr(),
                                arena.base.add(index as usize * arena.page_size),
                                arena.page_size,
                            );
                        }
                        pages += 1;
                    }
                    Ok(pages)
                })?;
                tracing::debug!(pages, "sparse diff applied");
            }
        }
        Ok(())
    }

    fn with_writable<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.usage == UsageMode::Read {
            vm::set_access(self.base as usize, self.mapped_len, Protection::ReadWrite)?;
            let result = f(self);
            vm::set_access(self.base as usize, self.mapped_len, Protection::ReadOnly)?;
            result
        } else {
            f(self)
        }
    }

    /// Whether `[offset, offset + len)` of the arena is entirely covered by
    /// `buffer`'s payload.
    ///
    /// For a full copy this is a bounds check; for a sparse diff every byte
    /// of the range must fall in some recorded page. A range touching one
    /// recorded and one unrecorded page is not covered.
    pub fn is_in_changes(&self, offset: usize, len: usize, buffer: &[u8]) -> Result<bool> {
        let header = ChangeHeader::from_bytes(buffer)?;
        let end = match offset.checked_add(len) {
            Some(end) => end,
            None => return Ok(false),
        };

        match header.kind {
            ChangeKind::FullCopy => Ok(end <= header.payload_size as usize),
            ChangeKind::SparseDiff => {
                if len == 0 {
                    return Ok(true);
                }
                let first = offset / self.page_size;
                let last = (end - 1) / self.page_size;
                let span = last - first + 1;

                let entries = DiffEntries::new(header.payload(buffer), self.page_size)?;
                // Duplicate entries count once, so fewer entries than pages
                // in the range can never cover it
                if span > entries.len() {
                    return Ok(false);
                }

                let mut seen = vec![false; span];
                for (index, _) in entries {
                    let page = index as usize;
                    if page >= first && page <= last {
                        seen[page - first] = true;
                    }
                }
                Ok(seen.iter().all(|&s| s))
            }
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // tracking is attached last during construction, so its presence
        // implies the protection flip and registration both happened
        if self.usage != UsageMode::ReadWriteDiff || self.tracking.is_none() {
            return;
        }
        let base = self.base as usize;
        if let Some(dispatcher) = self.dispatcher {
            dispatcher.unregister_arena(base);
        }
        // Leave the caller's memory writable; they own it beyond the arena
        if let Err(e) = vm::set_access(base, self.mapped_len, Protection::ReadWrite) {
            tracing::warn!(error = %e, "failed to restore arena protection");
        }
        if let Err(e) = vm::unreserve(base + tracking_offset(), tracking_region_len(self.page_size))
        {
            tracing::warn!(error = %e, "failed to unreserve bookkeeping region");
        }
    }
}
