//! Process-wide fault dispatcher
//!
//! Trap-based dirty tracking works by keeping an arena's pages read-only and
//! intercepting the `SIGSEGV` each first write raises. The dispatcher owns
//! that interception:
//!
//! - Installed lazily by the first trap-tracked arena and never uninstalled.
//! - Classifies each fault by masking the faulting address down to the
//!   128 MiB arena boundary (O(1), no table scan on the hot path).
//! - Marks the owning page dirty in the bookkeeping region, restores write
//!   access to exactly that page, and returns so the kernel re-executes the
//!   faulting store.
//!
//! # Classification modes
//!
//! [`ClassificationMode::Strict`] cross-checks the recovered base against a
//! bounded registry of live arenas and refuses faults that match nothing.
//! [`ClassificationMode::Trusting`] skips the registry scan and treats every
//! trap as an expected dirty-page fault; a stray wild write elsewhere in the
//! process will then be silently "resolved". The mode is fixed at install
//! time; later arenas requesting a different mode keep the installed one.
//!
//! A refused fault is retried once before escalating: the handler returns
//! with its own installation intact and lets the store re-execute. A store
//! that lost its arena mid-fault (the owner dropped it between fault
//! delivery and classification, leaving the page writable) then simply
//! succeeds, and tracking stays armed for every other live arena. A
//! genuinely bad access faults again at the same address, and the handler
//! escalates: it hands the fault to whatever handled `SIGSEGV` before
//! installation, or arms the default disposition and re-raises so the
//! process terminates.
//!
//! # Lock discipline
//!
//! Two locks with distinct purposes:
//!
//! - A raw spinlock ([`FaultDispatcher::lock_fault_path`]) serializes fault
//!   resolution, capture protection flips, and arena unregistration. It is
//!   exclusive and process-wide: two threads faulting on different arenas
//!   take turns. It must be acquirable inside a signal handler, which rules
//!   out every parking/poisoning lock in the ecosystem.
//! - A `parking_lot::Mutex` serializes the registration slow path (slot
//!   selection) between threads constructing arenas.
//!
//! The resolution step itself is a plain method, [`FaultDispatcher::
//! handle_protected_access`], so classification, marking, and unprotection
//! are testable without raising a real fault.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::error::{ArenaError, Result};
use crate::tracking::TrackingRegion;
use crate::vm::{self, Protection};
use crate::MAX_ARENA_SIZE;

/// Registry capacity; a hard bound, not a tuning knob
pub const MAX_ARENAS: usize = 64;

/// Fault classification policy, fixed at dispatcher installation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationMode {
    /// Reject faults whose address matches no registered arena
    Strict,
    /// Assume every trap belongs to a known arena
    Trusting,
}

/// Result of resolving one protected-access fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page was marked dirty and write access restored
    Resolved { page_index: usize },
    /// The address belongs to no known arena; the fault is not ours
    NotAnArena,
}

struct Slot {
    base: AtomicUsize,
    size: AtomicUsize,
}

pub struct FaultDispatcher {
    mode: ClassificationMode,
    registry: [Slot; MAX_ARENAS],
    admin: Mutex<()>,
}

static DISPATCHER: OnceLock<FaultDispatcher> = OnceLock::new();

// Spinlock guarding fault resolution and capture protection flips.
// Static rather than a field so the guard type needs no lifetime.
static FAULT_LOCK: AtomicBool = AtomicBool::new(false);

// SIGSEGV disposition that was in place before the dispatcher installed
// its handler; escalation chains to it.
static PREVIOUS_ACTION: OnceLock<libc::sigaction> = OnceLock::new();

// Retry bookkeeping for refused faults. A refused fault at a new address
// retries once; the same address refusing twice in a row, or too many
// refusals without a resolution in between, escalates.
static LAST_UNRESOLVED: AtomicUsize = AtomicUsize::new(0);
static UNRESOLVED_STREAK: AtomicUsize = AtomicUsize::new(0);
const MAX_UNRESOLVED_STREAK: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnresolvedAction {
    /// Return from the handler and let the store re-execute
    Retry,
    /// Hand the fault to the pre-installation disposition
    Escalate,
}

fn note_resolved() {
    LAST_UNRESOLVED.store(0, Ordering::Relaxed);
    UNRESOLVED_STREAK.store(0, Ordering::Relaxed);
}

fn note_unresolved(addr: usize) -> UnresolvedAction {
    let repeated = LAST_UNRESOLVED.swap(addr, Ordering::Relaxed) == addr;
    let streak = UNRESOLVED_STREAK.fetch_add(1, Ordering::Relaxed) + 1;
    if repeated || streak > MAX_UNRESOLVED_STREAK {
        UnresolvedAction::Escalate
    } else {
        UnresolvedAction::Retry
    }
}

/// RAII guard for the fault-path spinlock
pub struct FaultPathGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for FaultPathGuard {
    fn drop(&mut self) {
        FAULT_LOCK.store(false, Ordering::Release);
    }
}

impl FaultDispatcher {
    /// Install the trap handler (first call wins) and return the dispatcher.
    ///
    /// The handler stays installed for the remaining life of the process.
    pub fn install(mode: ClassificationMode) -> &'static FaultDispatcher {
        let dispatcher = DISPATCHER.get_or_init(|| {
            install_segv_handler();
            tracing::debug!(?mode, "fault dispatcher installed");
            FaultDispatcher {
                mode,
                registry: std::array::from_fn(|_| Slot {
                    base: AtomicUsize::new(0),
                    size: AtomicUsize::new(0),
                }),
                admin: Mutex::new(()),
            }
        });
        if dispatcher.mode != mode {
            tracing::warn!(
                installed = ?dispatcher.mode,
                requested = ?mode,
                "fault dispatcher already installed; keeping installed classification mode"
            );
        }
        dispatcher
    }

    /// The dispatcher, if any arena has installed it yet
    pub fn installed() -> Option<&'static FaultDispatcher> {
        DISPATCHER.get()
    }

    /// Classification mode fixed at installation
    pub fn mode(&self) -> ClassificationMode {
        self.mode
    }

    /// Acquire the fault-path spinlock.
    ///
    /// Held by capture while it flips protection and drains the bitmap, and
    /// by every fault resolution. Exclusive and process-wide.
    pub fn lock_fault_path(&self) -> FaultPathGuard {
        while FAULT_LOCK
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        FaultPathGuard {
            _not_send: std::marker::PhantomData,
        }
    }

    /// Record a live arena for strict classification.
    ///
    /// `base` must be 128 MiB aligned; duplicate registration replaces the
    /// recorded size.
    pub fn register_arena(&self, base: usize, size: usize) -> Result<()> {
        let _admin = self.admin.lock();
        let _fault = self.lock_fault_path();

        if let Some(slot) = self.registry.iter().find(|s| s.base.load(Ordering::Acquire) == base) {
            slot.size.store(size, Ordering::Release);
            return Ok(());
        }

        for slot in &self.registry {
            if slot.base.load(Ordering::Acquire) == 0 {
                // Size first: a non-zero base implies a valid size
                slot.size.store(size, Ordering::Release);
                slot.base.store(base, Ordering::Release);
                tracing::debug!(base, size, "arena registered");
                return Ok(());
            }
        }
        Err(ArenaError::RegistryFull(MAX_ARENAS))
    }

    /// Forget a live arena. No-op if `base` was never registered.
    pub fn unregister_arena(&self, base: usize) {
        let _admin = self.admin.lock();
        let _fault = self.lock_fault_path();

        for slot in &self.registry {
            if slot.base.load(Ordering::Acquire) == base {
                slot.base.store(0, Ordering::Release);
                slot.size.store(0, Ordering::Release);
                tracing::debug!(base, "arena unregistered");
                return;
            }
        }
    }

    /// Number of registered arenas (diagnostic)
    pub fn registered_arenas(&self) -> usize {
        self.registry
            .iter()
            .filter(|s| s.base.load(Ordering::Acquire) != 0)
            .count()
    }

    /// Resolve one protected-access fault at `addr`.
    ///
    /// Takes the fault-path lock, classifies, and on success marks the page
    /// dirty and restores write access to exactly that page. This is the
    /// entire handler body minus signal plumbing; tests call it directly to
    /// exercise the state machine without a hardware trap.
    ///
    /// Async-signal-safe: atomics, mprotect, sysconf. No allocation, no
    /// logging, no panics.
    pub fn handle_protected_access(&self, addr: usize) -> FaultOutcome {
        let _guard = self.lock_fault_path();
        self.resolve(addr)
    }

    fn resolve(&self, addr: usize) -> FaultOutcome {
        let base = addr & !(MAX_ARENA_SIZE - 1);
        if base == 0 {
            return FaultOutcome::NotAnArena;
        }
        if self.mode == ClassificationMode::Strict && !self.is_registered(addr, base) {
            return FaultOutcome::NotAnArena;
        }

        let page_size = vm::page_size();
        let page_index = (addr - base) / page_size;

        // Mark first, then unprotect: once the page is writable again a
        // concurrent writer must already find the bit set.
        unsafe { TrackingRegion::from_arena_base(base) }.mark_dirty(page_index);
        if vm::set_access(base + page_index * page_size, page_size, Protection::ReadWrite).is_err()
        {
            return FaultOutcome::NotAnArena;
        }
        FaultOutcome::Resolved { page_index }
    }

    fn is_registered(&self, addr: usize, base: usize) -> bool {
        for slot in &self.registry {
            if slot.base.load(Ordering::Acquire) == base {
                return addr < base + slot.size.load(Ordering::Acquire);
            }
        }
        false
    }
}

fn install_segv_handler() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = segv_handler
            as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void)
            as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        let mut previous: libc::sigaction = std::mem::zeroed();
        libc::sigaction(libc::SIGSEGV, &action, &mut previous);
        let _ = PREVIOUS_ACTION.set(previous);
    }
}

extern "C" fn segv_handler(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let addr = unsafe { (*info).si_addr() } as usize;
    let resolved = match DISPATCHER.get() {
        Some(dispatcher) => matches!(
            dispatcher.handle_protected_access(addr),
            FaultOutcome::Resolved { .. }
        ),
        None => false,
    };
    if resolved {
        note_resolved();
        return;
    }
    match note_unresolved(addr) {
        // Returning re-executes the store with this handler still
        // installed. An arena that was dropped mid-fault left its page
        // writable and the store succeeds; anything else faults the same
        // address again and escalates.
        UnresolvedAction::Retry => {}
        UnresolvedAction::Escalate => unsafe { escalate(signo, info, context) },
    }
}

/// Hand an unresolvable fault to the disposition that preceded the
/// dispatcher. Async-signal-safe: sigaction, raise, and calls into the
/// previous handler only.
unsafe fn escalate(signo: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    if let Some(previous) = PREVIOUS_ACTION.get() {
        if previous.sa_flags & libc::SA_SIGINFO != 0 {
            let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                std::mem::transmute(previous.sa_sigaction);
            return handler(signo, info, context);
        }
        if previous.sa_sigaction != libc::SIG_DFL && previous.sa_sigaction != libc::SIG_IGN {
            let handler: extern "C" fn(libc::c_int) = std::mem::transmute(previous.sa_sigaction);
            return handler(signo);
        }
    }
    // Default disposition. Queue the signal before returning so the process
    // terminates even if the retried store would now succeed; SIGSEGV is
    // blocked during delivery, so the raise fires on handler return.
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = libc::SIG_DFL;
    libc::sigemptyset(&mut action.sa_mask);
    libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut());
    libc::raise(libc::SIGSEGV);
}
