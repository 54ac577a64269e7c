//! The generational write barrier.
//!
//! A store of a young child into an old, marked parent must re-queue the
//! parent so the next (quick) collection revisits it. The queued parent is
//! retagged `GC_MARKED` so the barrier does not fire for it again; premark
//! restores `GC_OLD_MARKED` for every remset entry at the start of the
//! next cycle.

use std::ptr::NonNull;

use crate::header::{self, GC_MARKED, GC_OLD_MARKED};
use crate::thread::ThreadState;
use crate::util::{Address, ObjectReference};
use crate::vm::{Binding, ObjectShape, VMBinding};

/// Queue an old object into the calling thread's remembered set.
///
/// The retag is not atomic, but that is safe here: the collector is not
/// running (callers are mutators in managed code) and only `GC_OLD` states
/// are written outside collections, so the worst outcome is a duplicated
/// remset entry.
pub(crate) fn queue_root<VM: VMBinding>(tls: &ThreadState<VM>, parent: ObjectReference) {
    header::set_gc_bits(parent, GC_MARKED);
    let heap = unsafe { tls.heap_mut() };
    heap.remset.push(parent);
    // conservative
    heap.remset_nptr += 1;
}

/// The full write barrier: `parent.field <- child`.
pub(crate) fn write_barrier<VM: VMBinding>(
    tls: &ThreadState<VM>,
    parent: ObjectReference,
    child: ObjectReference,
) {
    if header::gc_bits(parent) == GC_OLD_MARKED && !header::gc_marked(header::gc_bits(child)) {
        queue_root(tls, parent);
    }
}

/// The cheap form used when the stored child is statically known (or
/// assumed) to be young.
pub(crate) fn write_barrier_back<VM: VMBinding>(tls: &ThreadState<VM>, parent: ObjectReference) {
    if header::gc_bits(parent) == GC_OLD_MARKED {
        queue_root(tls, parent);
    }
}

/// Barrier for a bulk store of `child`'s fields reachable from `parent`
/// (e.g. after an inline struct assignment): re-queue the parent only if
/// `child` actually holds a young reference.
pub(crate) fn queue_multiroot<VM: VMBinding>(
    tls: &ThreadState<VM>,
    parent: ObjectReference,
    child: ObjectReference,
) {
    // first check if this is really necessary
    let tag = header::type_tag(child);
    let layout = match VM::shape_of(child, tag) {
        Some(ObjectShape::Struct { layout }) => layout,
        // Only layouts with field tables carry interior references worth
        // probing; be conservative for everything else.
        _ => {
            write_barrier_back(tls, parent);
            return;
        }
    };
    for i in 0..layout.npointers() {
        let slot = child.slot(layout.fields.get(i));
        let field = unsafe { slot.load::<Option<ObjectReference>>() };
        if let Some(f) = field {
            if !header::gc_marked(header::gc_bits(f)) {
                // this pointer was young, move the barrier back now
                write_barrier_back(tls, parent);
                return;
            }
        }
    }
}

/// Queue a module binding whose value slot was written.
pub(crate) fn queue_binding<VM: VMBinding>(tls: &ThreadState<VM>, binding: NonNull<Binding>) {
    // Bindings are buffers with headers one word before the struct.
    let obj =
        unsafe { ObjectReference::from_raw_address_unchecked(Address::from_ptr(binding.as_ptr())) };
    header::set_gc_bits(obj, GC_MARKED);
    let heap = unsafe { tls.heap_mut() };
    heap.rem_bindings.push(binding);
}

/// Restore the remset entries' mark state at the start of a collection so
/// the mark loop treats them as old-generation roots, and reset the
/// current remset for the new cycle.
pub(crate) fn premark<VM: VMBinding>(tls: &ThreadState<VM>) {
    let heap = unsafe { tls.heap_mut() };
    std::mem::swap(&mut heap.remset, &mut heap.last_remset);
    heap.remset.clear();
    heap.remset_nptr = 0;

    // Retag remembered objects and bindings before marking so they are not
    // counted twice in `perm_scanned_bytes`.
    for obj in heap.last_remset.iter() {
        header::set_gc_bits(*obj, GC_OLD_MARKED);
    }
    for binding in heap.rem_bindings.iter() {
        let obj = unsafe {
            ObjectReference::from_raw_address_unchecked(Address::from_ptr(binding.as_ptr()))
        };
        header::set_gc_bits(obj, GC_OLD_MARKED);
    }
}

/// After a quick sweep, return remembered objects to the queued state so
/// the barrier does not fire for them again; after a full sweep the
/// remsets start empty instead.
pub(crate) fn restore_remsets<VM: VMBinding>(threads: &[&'static ThreadState<VM>], full: bool) {
    for tls in threads {
        let heap = unsafe { tls.heap_mut() };
        if !full {
            for obj in heap.remset.iter() {
                header::set_gc_bits(*obj, GC_MARKED);
            }
            for binding in heap.rem_bindings.iter() {
                let obj = unsafe {
                    ObjectReference::from_raw_address_unchecked(Address::from_ptr(binding.as_ptr()))
                };
                header::set_gc_bits(obj, GC_MARKED);
            }
        } else {
            heap.remset.clear();
            heap.rem_bindings.clear();
        }
    }
}
