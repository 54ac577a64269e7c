//! The finalization subsystem.
//!
//! Finalizers are registered per thread as `(value, callable)` entries; a
//! collection moves entries whose value died into the global `to_finalize`
//! queue and runs them on the invoking mutator after the world resumes.
//! Objects reachable only through a finalizer survive one extra cycle.
//!
//! The per-thread lists are mutated lock-free by their owner and under the
//! finalizers lock by other threads, synchronized through an
//! acquire/release protocol on the list length: the owner publishes a push
//! with a release store of the new length; a foreign reader acquires the
//! length, mutates only the observed prefix, and publishes any shrink with
//! a compare-and-swap. If the swap loses to a concurrent owner push, the
//! removed entries stay behind as tombstones that every scanner skips.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::header::{self, GC_OLD_MARKED};
use crate::riptide::Riptide;
use crate::thread::ThreadState;
use crate::util::{Address, ObjectReference};
use crate::vm::VMBinding;

/// One finalizer registration.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Finalizer {
    /// A managed callable, dispatched through the language's generic
    /// apply.
    Managed {
        value: ObjectReference,
        func: ObjectReference,
    },
    /// An unmanaged function pointer called directly with the value's
    /// address.
    Native {
        value: ObjectReference,
        func: fn(Address),
    },
    /// Scheduled unconditionally at the next quiescence; carries an
    /// arbitrary pointer instead of a managed value.
    Quiescent { slot: Address, func: fn(Address) },
    /// Tombstone left by a foreign-thread removal that lost the length
    /// race. Skipped by every scanner.
    Dead,
}

impl Finalizer {
    /// The managed value guarded by this entry, if any.
    pub fn value(&self) -> Option<ObjectReference> {
        match self {
            Finalizer::Managed { value, .. } | Finalizer::Native { value, .. } => Some(*value),
            _ => None,
        }
    }
}

/// A per-thread finalizer list implementing the length protocol described
/// in the module docs.
pub struct FinalizerList {
    storage: UnsafeCell<Vec<Finalizer>>,
    len: AtomicUsize,
}

// Safety: all content mutation happens either on the owner thread between
// an acquire of `len` and the release publishing the new `len`, or on a
// foreign thread holding the finalizers lock, or inside the world stop.
unsafe impl Send for FinalizerList {}
unsafe impl Sync for FinalizerList {}

impl FinalizerList {
    pub fn new() -> Self {
        FinalizerList {
            storage: UnsafeCell::new(Vec::new()),
            len: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an entry. Owner thread only. Takes the finalizers lock only
    /// when the backing storage must grow, so the common case does not
    /// synchronize with foreign readers at all.
    pub(crate) fn push(&self, entry: Finalizer, lock: &Mutex<FinalizerQueues>) {
        let len = self.len.load(Ordering::Acquire);
        let vec = unsafe { &mut *self.storage.get() };
        if len == vec.capacity() {
            let _guard = lock.lock().unwrap();
            let mut bigger = Vec::with_capacity((vec.capacity() * 2).max(32));
            unsafe {
                std::ptr::copy_nonoverlapping(vec.as_ptr(), bigger.as_mut_ptr(), len);
            }
            *vec = bigger;
        }
        unsafe {
            std::ptr::write(vec.as_mut_ptr().add(len), entry);
        }
        self.len.store(len + 1, Ordering::Release);
    }

    /// Move every entry guarding `target` into `copied`. Must hold the
    /// finalizers lock; `need_sync` is set when this is another thread's
    /// list, enabling the length CAS protocol.
    pub(crate) fn finalize_object(
        &self,
        target: ObjectReference,
        copied: &mut Vec<Finalizer>,
        need_sync: bool,
    ) {
        // The acquire load makes sure the first `len` entries are fully
        // written. All mutation stays below `oldlen`; the owner only
        // writes at or past it and will not resize without the lock we
        // hold.
        let oldlen = self.len.load(Ordering::Acquire);
        let items = unsafe { (*self.storage.get()).as_mut_ptr() };
        let mut j = 0;
        for i in 0..oldlen {
            let entry = unsafe { *items.add(i) };
            if entry.value() == Some(target) {
                copied.push(entry);
                continue;
            }
            if matches!(entry, Finalizer::Dead) {
                continue;
            }
            if j < i {
                unsafe { *items.add(j) = entry };
            }
            j += 1;
        }
        if j == oldlen {
            return;
        }
        if need_sync {
            // Tombstone the vacated tail before publishing the shorter
            // length: if the swap loses to a concurrent push the tail
            // stays visible, and scanners must see dead entries there.
            for i in j..oldlen {
                unsafe { *items.add(i) = Finalizer::Dead };
            }
            let _ = self
                .len
                .compare_exchange(oldlen, j, Ordering::AcqRel, Ordering::Acquire);
        } else {
            self.len.store(j, Ordering::Release);
        }
    }

    /// The entries as a slice. Only valid inside the world stop (or on the
    /// owner thread).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn entries(&self) -> &mut [Finalizer] {
        let vec = &mut *self.storage.get();
        std::slice::from_raw_parts_mut(vec.as_mut_ptr(), self.len.load(Ordering::Acquire))
    }

    /// Truncate to `n` entries. Only valid inside the world stop.
    pub(crate) unsafe fn set_len(&self, n: usize) {
        debug_assert!(n <= self.len.load(Ordering::Relaxed));
        self.len.store(n, Ordering::Release);
    }
}

impl Default for FinalizerList {
    fn default() -> Self {
        Self::new()
    }
}

/// The global finalizer queues, all guarded by the finalizers lock.
#[derive(Default)]
pub struct FinalizerQueues {
    /// Entries whose value was unreachable but is kept alive pending
    /// finalization, promoted out of the per-thread lists during sweep.
    pub marked: Vec<Finalizer>,
    /// Entries ready to execute at the next quiescence.
    pub to_finalize: Vec<Finalizer>,
}

/// Queue `entry` for execution after the world resumes.
pub(crate) fn schedule_finalization<VM: VMBinding>(
    gc: &Riptide<VM>,
    queues: &mut FinalizerQueues,
    entry: Finalizer,
) {
    queues.to_finalize.push(entry);
    // Doesn't need release: readers keep checking under the lock until
    // they see the work.
    gc.have_pending_finalizers.store(true, Ordering::Relaxed);
}

/// Move unreachable entries of `items` to `to_finalize`, migrate old
/// entries to the global marked list, and compact the rest in place.
/// Returns the new length. `is_marked_list` disables the old-entry
/// migration when sweeping the marked list itself.
pub(crate) fn sweep_finalizer_entries<VM: VMBinding>(
    gc: &Riptide<VM>,
    queues: &mut FinalizerQueues,
    items: &mut [Finalizer],
    is_marked_list: bool,
) -> usize {
    let mut j = 0;
    for i in 0..items.len() {
        let entry = items[i];
        let (isfreed, isold) = match entry {
            Finalizer::Dead => continue,
            Finalizer::Quiescent { .. } => (true, false),
            Finalizer::Managed { value, func } => (
                !header::gc_marked(header::gc_bits(value)),
                !is_marked_list
                    && header::gc_bits(value) == GC_OLD_MARKED
                    && header::gc_bits(func) == GC_OLD_MARKED,
            ),
            Finalizer::Native { value, .. } => (
                !header::gc_marked(header::gc_bits(value)),
                !is_marked_list && header::gc_bits(value) == GC_OLD_MARKED,
            ),
        };
        if isfreed {
            schedule_finalization(gc, queues, entry);
        } else if isold {
            // The re-mark pass relies on migrated entries landing at the
            // end of the marked list.
            queues.marked.push(entry);
        } else {
            items[j] = entry;
            j += 1;
        }
    }
    j
}

/// Run one finalizer, isolating faults: a panicking managed finalizer is
/// logged and execution continues.
pub(crate) fn run_finalizer<VM: VMBinding>(entry: Finalizer) {
    match entry {
        Finalizer::Managed { value, func } => {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                VM::run_finalizer(func, value)
            }));
            if let Err(e) = result {
                let msg = e
                    .downcast_ref::<&str>()
                    .copied()
                    .map(String::from)
                    .or_else(|| e.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("error in running finalizer: {msg}");
            }
        }
        Finalizer::Native { value, func } => func(value.to_raw_address()),
        Finalizer::Quiescent { slot, func } => func(slot),
        Finalizer::Dead => {}
    }
}

/// Drain `to_finalize` and run the entries on the calling thread, newest
/// first. The drained list stays registered with the collector while it
/// runs, so a collection triggered from inside a finalizer still marks the
/// pending values.
pub(crate) fn run_finalizers<VM: VMBinding>(gc: &Riptide<VM>, tls: &ThreadState<VM>) {
    // Racy fast path: a stale read here is fine, the writer flushes under
    // the lock.
    if !gc.have_pending_finalizers.load(Ordering::Relaxed) {
        return;
    }
    let mut guard = gc.finalizer_queues.lock().unwrap();
    if guard.to_finalize.is_empty() {
        return;
    }
    let list = Box::new(std::mem::take(&mut guard.to_finalize));
    gc.have_pending_finalizers.store(false, Ordering::Relaxed);
    drop(guard);

    let span = NonNull::from(&*list);
    gc.inflight_finalizers.lock().push(span);
    let was_in_finalizer = tls.in_finalizer.swap(true, Ordering::Relaxed);
    // Run in reverse insertion order, so lower-level finalizers run last.
    for entry in list.iter().rev() {
        run_finalizer::<VM>(*entry);
    }
    tls.in_finalizer.store(was_in_finalizer, Ordering::Relaxed);
    gc.inflight_finalizers.lock().retain(|p| *p != span);
}

/// Run finalizers now if the thread is in a state where user code may run.
pub(crate) fn run_pending_finalizers<VM: VMBinding>(gc: &Riptide<VM>, tls: &ThreadState<VM>) {
    if !tls.in_finalizer.load(Ordering::Relaxed)
        && tls.locks_held.load(Ordering::Relaxed) == 0
        && tls.finalizers_inhibited.load(Ordering::Relaxed) == 0
    {
        run_finalizers(gc, tls);
    }
}

/// Eagerly run (and deregister) every finalizer guarding `value`.
pub(crate) fn finalize<VM: VMBinding>(
    gc: &Riptide<VM>,
    tls: &ThreadState<VM>,
    value: ObjectReference,
) {
    let guard = gc.finalizer_queues.lock().unwrap();
    // Copy the matching entries out so code in the finalizers can't change
    // the lists as we loop through them. No need to check `to_finalize`:
    // the caller still holds a reference to the object.
    let mut copied = Vec::new();
    let threads: Vec<_> = gc.threads.read().clone();
    for t in threads {
        t.finalizers
            .finalize_object(value, &mut copied, t.tid != tls.tid);
    }
    let mut guard = guard;
    finalize_object_in_vec(&mut guard.marked, value, &mut copied);
    drop(guard);
    if copied.is_empty() {
        return;
    }

    let list = Box::new(copied);
    let span = NonNull::from(&*list);
    gc.inflight_finalizers.lock().push(span);
    let was_in_finalizer = tls.in_finalizer.swap(true, Ordering::Relaxed);
    for entry in list.iter().rev() {
        run_finalizer::<VM>(*entry);
    }
    tls.in_finalizer.store(was_in_finalizer, Ordering::Relaxed);
    gc.inflight_finalizers.lock().retain(|p| *p != span);
}

fn finalize_object_in_vec(
    vec: &mut Vec<Finalizer>,
    target: ObjectReference,
    copied: &mut Vec<Finalizer>,
) {
    vec.retain(|entry| {
        if entry.value() == Some(target) {
            copied.push(*entry);
            false
        } else {
            !matches!(entry, Finalizer::Dead)
        }
    });
}

/// Schedule every registered finalizer (all threads plus the marked list)
/// and run them. Used at runtime shutdown.
pub(crate) fn run_all_finalizers<VM: VMBinding>(gc: &Riptide<VM>, tls: &ThreadState<VM>) {
    {
        let mut guard = gc.finalizer_queues.lock().unwrap();
        let marked = std::mem::take(&mut guard.marked);
        for entry in marked {
            if !matches!(entry, Finalizer::Dead) {
                schedule_finalization(gc, &mut guard, entry);
            }
        }
        let threads: Vec<_> = gc.threads.read().clone();
        for t in threads {
            // World is quiescent at shutdown; drain each list wholesale.
            let entries = unsafe { t.finalizers.entries() };
            for entry in entries.iter() {
                if !matches!(entry, Finalizer::Dead) {
                    schedule_finalization(gc, &mut guard, *entry);
                }
            }
            unsafe { t.finalizers.set_len(0) };
        }
    }
    run_finalizers(gc, tls);
}

/// Adjust the per-thread finalizer inhibition counter. Decrementing below
/// zero is refused with a one-shot warning.
pub(crate) fn enable_finalizers<VM: VMBinding>(gc: &Riptide<VM>, tls: &ThreadState<VM>, on: bool) {
    let old = tls.finalizers_inhibited.load(Ordering::Relaxed);
    if on {
        if old == 0 {
            if !gc.finalizer_warn_shot.swap(true, Ordering::Relaxed) {
                warn!("GC finalizers already enabled on this thread.");
            } else {
                debug!("GC finalizers already enabled on this thread.");
            }
            return;
        }
        tls.finalizers_inhibited.store(old - 1, Ordering::Relaxed);
        if old == 1 && gc.have_pending_finalizers.load(Ordering::Relaxed) {
            run_pending_finalizers(gc, tls);
        }
    } else {
        tls.finalizers_inhibited.store(old + 1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Address;

    fn fake_obj(storage: &'static mut [usize; 4]) -> ObjectReference {
        ObjectReference::from_raw_address(Address::from_ref(&storage[1])).unwrap()
    }

    fn noop(_: Address) {}

    #[test]
    fn push_and_len_protocol() {
        let lock = Mutex::new(FinalizerQueues::default());
        let list = FinalizerList::new();
        assert!(list.is_empty());
        let v = fake_obj(Box::leak(Box::new([0usize; 4])));
        for _ in 0..100 {
            list.push(Finalizer::Native { value: v, func: noop }, &lock);
        }
        assert_eq!(list.len(), 100);
    }

    #[test]
    fn finalize_object_extracts_matches() {
        let lock = Mutex::new(FinalizerQueues::default());
        let list = FinalizerList::new();
        let a = fake_obj(Box::leak(Box::new([0usize; 4])));
        let b = fake_obj(Box::leak(Box::new([0usize; 4])));
        list.push(Finalizer::Native { value: a, func: noop }, &lock);
        list.push(Finalizer::Native { value: b, func: noop }, &lock);
        list.push(Finalizer::Native { value: a, func: noop }, &lock);

        let mut copied = Vec::new();
        list.finalize_object(a, &mut copied, false);
        assert_eq!(copied.len(), 2);
        assert_eq!(list.len(), 1);
        let rest = unsafe { list.entries() };
        assert_eq!(rest[0].value(), Some(b));
    }

    #[test]
    fn dead_entries_are_skipped() {
        let lock = Mutex::new(FinalizerQueues::default());
        let list = FinalizerList::new();
        let a = fake_obj(Box::leak(Box::new([0usize; 4])));
        list.push(Finalizer::Dead, &lock);
        list.push(Finalizer::Native { value: a, func: noop }, &lock);
        let mut copied = Vec::new();
        list.finalize_object(a, &mut copied, false);
        assert_eq!(copied.len(), 1);
        assert_eq!(list.len(), 0);
    }
}
