//! The safepoint protocol.
//!
//! A collection starts by atomically flipping the process-wide `gc_running`
//! word from 0 to 1; exactly one contender wins. Every mutator publishes a
//! nonzero `gc_state` before blocking (or before leaving managed code), and
//! the collector's [`wait_for_the_world`] pairs an acquire load of that
//! flag with the mutator's release store, so all pre-safepoint writes are
//! visible to the collector. Threads with nonzero `gc_state` must not touch
//! the managed heap.

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam::utils::Backoff;

use crate::thread::ThreadState;
use crate::vm::VMBinding;

/// The thread is running managed code.
pub const GC_STATE_UNSAFE: u8 = 0;
/// The thread is paused waiting for a collection to finish.
pub const GC_STATE_WAITING: u8 = 1;
/// The thread is outside managed code (blocked, or running native code)
/// and may be ignored by the world stop.
pub const GC_STATE_SAFE: u8 = 2;

/// The process-wide collection flag.
pub struct Safepoint {
    gc_running: AtomicU32,
}

impl Default for Safepoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Safepoint {
    pub fn new() -> Self {
        Safepoint {
            gc_running: AtomicU32::new(0),
        }
    }

    /// Try to become the collecting thread. Returns `true` to exactly one
    /// caller; the losers are already at a safepoint and simply return
    /// from their collect request.
    pub fn start_gc(&self) -> bool {
        self.gc_running
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the world after a collection.
    pub fn end_gc(&self) {
        debug_assert_eq!(self.gc_running.load(Ordering::Relaxed), 1);
        self.gc_running.store(0, Ordering::Release);
    }

    pub fn is_gc_running(&self) -> bool {
        self.gc_running.load(Ordering::Acquire) != 0
    }

    /// Spin until no collection is in progress.
    pub fn wait_gc(&self) {
        let backoff = Backoff::new();
        while self.is_gc_running() {
            backoff.snooze();
        }
    }
}

/// Spin until every other registered thread has published a nonzero
/// `gc_state`. The acquire load pairs with the release stores performed by
/// mutators when they park, so all their heap writes are visible to the
/// collector afterwards.
pub fn wait_for_the_world<VM: VMBinding>(threads: &[&'static ThreadState<VM>], self_tid: u16) {
    for tls in threads {
        if tls.tid == self_tid {
            continue;
        }
        let backoff = Backoff::new();
        while tls.gc_state.load(Ordering::Acquire) == 0 {
            backoff.snooze();
        }
    }
}

/// A mutator-side safepoint check: if a collection is running, park until
/// it finishes. Inserted at allocator entries and anywhere the runtime
/// polls.
pub fn safepoint<VM: VMBinding>(sp: &Safepoint, tls: &ThreadState<VM>) {
    if sp.is_gc_running() {
        let prev = tls.gc_state.load(Ordering::Relaxed);
        tls.gc_state.store(GC_STATE_WAITING, Ordering::Release);
        sp.wait_gc();
        tls.gc_state.store(prev, Ordering::Release);
    }
}

/// Mark the thread as outside managed code: collections proceed without
/// waiting for it. The thread must not touch the managed heap until it
/// calls [`leave_gc_safe`].
pub fn enter_gc_safe<VM: VMBinding>(tls: &ThreadState<VM>) {
    debug_assert_eq!(tls.gc_state.load(Ordering::Relaxed), GC_STATE_UNSAFE);
    tls.gc_state.store(GC_STATE_SAFE, Ordering::Release);
}

/// Re-enter managed code, waiting out any collection that started while
/// the thread was away.
pub fn leave_gc_safe<VM: VMBinding>(sp: &Safepoint, tls: &ThreadState<VM>) {
    debug_assert_eq!(tls.gc_state.load(Ordering::Relaxed), GC_STATE_SAFE);
    loop {
        sp.wait_gc();
        tls.gc_state.store(GC_STATE_UNSAFE, Ordering::Release);
        if !sp.is_gc_running() {
            return;
        }
        // A collection slipped in between the wait and the store; park
        // again so the collector does not observe us unsafe mid-stop.
        tls.gc_state.store(GC_STATE_SAFE, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_collector_wins() {
        let sp = Safepoint::new();
        assert!(sp.start_gc());
        assert!(!sp.start_gc());
        assert!(sp.is_gc_running());
        sp.end_gc();
        assert!(!sp.is_gc_running());
        assert!(sp.start_gc());
        sp.end_gc();
    }
}
