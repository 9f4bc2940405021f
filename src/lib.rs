//! Pagemirror
//!
//! A mirrored memory arena with page-granularity change tracking: mutate a
//! region freely, then discover on demand exactly which pages changed since
//! the last observation and package them into a transmissible change buffer
//! a peer applies to its own mirror of the region.
//!
//! ## Features
//!
//! - **Trap-based dirty tracking**: writes to a protected arena fault into a
//!   process-wide dispatcher that records the page and restores access, so
//!   no manual dirty-bit bookkeeping is needed
//! - **Write-watch tracking**: the same sparse output produced from the
//!   kernel's native soft-dirty mechanism, with no fault handler installed
//! - **Full-copy fallback** for untracked regions
//! - **O(1) ownership lookup**: arena bases are aligned to a fixed 128 MiB
//!   bound, so a single address mask maps any interior pointer back to its
//!   arena on the fault path
//! - **Self-describing change buffers**: a 12-byte header plus either a raw
//!   image or `{page_index, page bytes}` entries, wire-compatible across
//!   both sparse producers
//!
//! ## Example
//!
//! ```rust,no_run
//! use pagemirror::{AlignedRegion, Arena, ArenaDesc, UsageMode};
//!
//! // Producer side: a trapped arena over caller-owned aligned memory
//! let memory = AlignedRegion::new(1 << 20).unwrap();
//! let mut producer = Arena::new(ArenaDesc::new(
//!     memory.base(),
//!     memory.len(),
//!     UsageMode::ReadWriteDiff,
//! ))
//! .unwrap();
//!
//! // Writes from any thread; first touch of each page traps and is recorded
//! unsafe { memory.base().write(42) };
//! assert_eq!(producer.dirty_page_count(), 1);
//!
//! // Capture consumes the dirty generation into a change buffer
//! let changes = producer.capture_to_vec().unwrap();
//!
//! // Consumer side: a passive mirror replays the buffer
//! let mirror_memory = AlignedRegion::new(1 << 20).unwrap();
//! let mut mirror = Arena::new(ArenaDesc::new(
//!     mirror_memory.base(),
//!     mirror_memory.len(),
//!     UsageMode::Read,
//! ))
//! .unwrap();
//! mirror.apply_changes(&changes).unwrap();
//! assert!(mirror.is_in_changes(0, 1, &changes).unwrap());
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │ Arena (caller-owned memory, 128 MiB aligned)       │
//! │  capture_changes / apply_changes / is_in_changes   │
//! ├──────────────┬─────────────────┬───────────────────┤
//! │ Trap path    │ Write-watch     │ Full copy         │
//! │ (SIGSEGV)    │ (soft-dirty)    │ (no tracking)     │
//! ├──────────────┴───────┬─────────┴───────────────────┤
//! │ Fault Dispatcher     │ Bookkeeping Region          │
//! │  classify → mark →   │  magic | dirty count |      │
//! │  unprotect → retry   │  page bitmap (atomic)       │
//! ├──────────────────────┴─────────────────────────────┤
//! │ VM shim: mmap / mprotect / munmap / page size      │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! Change buffers carry no compression and no endianness normalization;
//! producer and consumer are assumed to share page size and byte order.

pub mod arena;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod region;
pub mod tracking;
pub mod vm;
pub mod writewatch;

pub use arena::{Arena, ArenaDesc, UsageMode};
pub use codec::{ChangeHeader, ChangeKind, DiffEntries, CHANGE_HEADER_LEN};
pub use dispatch::{ClassificationMode, FaultDispatcher, FaultOutcome, MAX_ARENAS};
pub use error::{ArenaError, Result};
pub use region::AlignedRegion;
pub use vm::{page_size, Protection};

/// Largest supported arena, fixed by the format
pub const MAX_ARENA_SIZE: usize = 128 * 1024 * 1024;

/// Required alignment of every arena base.
///
/// Equal to [`MAX_ARENA_SIZE`] so that masking any interior address with
/// `!(MAX_ARENA_SIZE - 1)` recovers the owning arena's base in one
/// operation.
pub const REQUIRED_ALIGNMENT: usize = MAX_ARENA_SIZE;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
