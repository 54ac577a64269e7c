//! VM-to-collector interface: safe, flat Rust APIs.
//!
//! A binding creates a [`Riptide`] context with [`gc_init`], binds one
//! [`Mutator`] per thread with [`bind_mutator`], and calls everything else
//! through those two handles. The functions here are thin: the logic lives
//! in the component modules, this surface just fixes the contract.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::barrier;
use crate::controller::{self, CollectMode, GcNum};
use crate::finalizer::{self, Finalizer};
use crate::header;
use crate::heap::big;
use crate::heap::malloc;
use crate::heap::pool::{self, MAX_SZCLASS, SIZE_CLASSES};
use crate::riptide::Riptide;
use crate::safepoint;
use crate::thread::Mutator;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::options::Options;
use crate::util::{Address, ObjectReference};
use crate::vm::{Binding, ObjectShape, TypeTag, VMBinding};

/// Create a collector instance. The binding usually leaks the box and
/// treats the reference as process-global.
pub fn gc_init<VM: VMBinding>(options: Options) -> Box<Riptide<VM>> {
    crate::util::logger::try_init();
    Riptide::new(options)
}

/// Register the calling thread as a mutator.
pub fn bind_mutator<VM: VMBinding>(gc: &'static Riptide<VM>) -> Mutator<VM> {
    gc.register_thread()
}

/// Allocate a managed object with `size` payload bytes and install its
/// header. Sizes up to [`MAX_SZCLASS`] use the pool fast path; anything
/// larger takes the big-object path.
pub fn alloc<VM: VMBinding>(mutator: &Mutator<VM>, size: usize, tag: TypeTag) -> ObjectReference {
    let obj = if size <= MAX_SZCLASS {
        let allocsz = size + BYTES_IN_WORD;
        let klass = pool::size_class(allocsz);
        pool::alloc_pool(mutator.gc, mutator.tls, klass, SIZE_CLASSES[klass])
    } else {
        big::alloc_big(mutator.gc, mutator.tls, size)
    };
    header::init_header(obj, tag);
    obj
}

/// Allocate from a specific pool size class. `osize` must be the class
/// size; exposing it keeps the table load out of compiled fast paths.
pub fn alloc_pool<VM: VMBinding>(
    mutator: &Mutator<VM>,
    size_class: usize,
    osize: usize,
    tag: TypeTag,
) -> ObjectReference {
    let obj = pool::alloc_pool(mutator.gc, mutator.tls, size_class, osize);
    header::init_header(obj, tag);
    obj
}

/// Allocate on the big-object path regardless of size.
pub fn alloc_big<VM: VMBinding>(
    mutator: &Mutator<VM>,
    size: usize,
    tag: TypeTag,
) -> ObjectReference {
    let obj = big::alloc_big(mutator.gc, mutator.tls, size);
    header::init_header(obj, tag);
    obj
}

/// Allocate a weak reference to `value`.
pub fn new_weakref<VM: VMBinding>(mutator: &Mutator<VM>, value: ObjectReference) -> ObjectReference {
    let wr = alloc(mutator, BYTES_IN_WORD, VM::weakref_tag());
    // no write barrier needed here: the weakref is young
    unsafe { wr.slot(0).store(value) };
    let heap = unsafe { mutator.tls.heap_mut() };
    heap.weak_refs.push(wr);
    wr
}

// -- finalizers --

/// Register a managed finalizer: `func(value)` runs after the collection
/// that finds `value` unreachable.
pub fn add_finalizer<VM: VMBinding>(
    mutator: &Mutator<VM>,
    value: ObjectReference,
    func: ObjectReference,
) {
    debug_assert_eq!(mutator.tls.gc_state.load(Ordering::Relaxed), 0);
    mutator
        .tls
        .finalizers
        .push(Finalizer::Managed { value, func }, &mutator.gc.finalizer_queues);
}

/// Register an unmanaged function-pointer finalizer.
pub fn add_ptr_finalizer<VM: VMBinding>(
    mutator: &Mutator<VM>,
    value: ObjectReference,
    func: fn(Address),
) {
    mutator
        .tls
        .finalizers
        .push(Finalizer::Native { value, func }, &mutator.gc.finalizer_queues);
}

/// Schedule `func(slot)` to run at the next quiescence, unconditionally.
pub fn add_quiescent<VM: VMBinding>(mutator: &Mutator<VM>, slot: Address, func: fn(Address)) {
    mutator
        .tls
        .finalizers
        .push(Finalizer::Quiescent { slot, func }, &mutator.gc.finalizer_queues);
}

/// Eagerly run every finalizer registered for `value`, on any thread's
/// list, and deregister them.
pub fn finalize<VM: VMBinding>(mutator: &Mutator<VM>, value: ObjectReference) {
    finalizer::finalize(mutator.gc, mutator.tls, value);
}

/// Run scheduled finalizers now if the thread may execute user code.
pub fn run_pending_finalizers<VM: VMBinding>(mutator: &Mutator<VM>) {
    finalizer::run_pending_finalizers(mutator.gc, mutator.tls);
}

/// Whether finalizers are waiting to run. Relaxed; runtimes poll this at
/// quiescence points and the lock inside the run path settles any race.
pub fn have_pending_finalizers<VM: VMBinding>(gc: &Riptide<VM>) -> bool {
    gc.have_pending_finalizers.load(Ordering::Relaxed)
}

/// Schedule and run every registered finalizer. For runtime shutdown.
pub fn run_all_finalizers<VM: VMBinding>(mutator: &Mutator<VM>) {
    finalizer::run_all_finalizers(mutator.gc, mutator.tls);
}

/// Balance-checked counterpart of the internal inhibition counter.
pub fn enable_finalizers<VM: VMBinding>(mutator: &Mutator<VM>, on: bool) {
    finalizer::enable_finalizers(mutator.gc, mutator.tls, on);
}

pub fn disable_finalizers_internal<VM: VMBinding>(mutator: &Mutator<VM>) {
    mutator
        .tls
        .finalizers_inhibited
        .fetch_add(1, Ordering::Relaxed);
}

pub fn enable_finalizers_internal<VM: VMBinding>(mutator: &Mutator<VM>) {
    enable_finalizers(mutator, true);
}

pub fn get_finalizers_inhibited<VM: VMBinding>(mutator: &Mutator<VM>) -> u32 {
    mutator.tls.finalizers_inhibited.load(Ordering::Relaxed)
}

// -- write barrier --

/// Barrier for `parent.field <- child`.
pub fn write_barrier<VM: VMBinding>(
    mutator: &Mutator<VM>,
    parent: ObjectReference,
    child: ObjectReference,
) {
    barrier::write_barrier(mutator.tls, parent, child);
}

/// Barrier for a store of a statically-young value into `parent`.
pub fn write_barrier_back<VM: VMBinding>(mutator: &Mutator<VM>, parent: ObjectReference) {
    barrier::write_barrier_back(mutator.tls, parent);
}

/// Queue an old object into the thread's remembered set unconditionally.
pub fn queue_root<VM: VMBinding>(mutator: &Mutator<VM>, obj: ObjectReference) {
    barrier::queue_root(mutator.tls, obj);
}

/// Barrier for bulk stores of `child`'s fields under `parent`.
pub fn queue_multiroot<VM: VMBinding>(
    mutator: &Mutator<VM>,
    parent: ObjectReference,
    child: ObjectReference,
) {
    barrier::queue_multiroot::<VM>(mutator.tls, parent, child);
}

/// Queue a written module binding into the binding remembered set.
pub fn queue_binding<VM: VMBinding>(mutator: &Mutator<VM>, binding: NonNull<Binding>) {
    barrier::queue_binding(mutator.tls, binding);
}

// -- collection control --

/// Enable or disable automatic collection on this thread. Returns the
/// previous state. Re-enabling after the last disabler drains the
/// deferred allocation count back into the trigger counter.
pub fn enable<VM: VMBinding>(mutator: &Mutator<VM>, on: bool) -> bool {
    let gc = mutator.gc;
    let tls = mutator.tls;
    let prev = !tls.disable_gc.load(Ordering::Relaxed);
    tls.disable_gc.store(!on, Ordering::Relaxed);
    if on && !prev {
        // disable -> enable
        if gc.disable_counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut st = gc.state.lock();
            st.gc_num.allocd += st.gc_num.deferred_alloc;
            st.gc_num.deferred_alloc = 0;
        }
    } else if prev && !on {
        // enable -> disable
        gc.disable_counter.fetch_add(1, Ordering::AcqRel);
        // wait for any running collection to finish
        safepoint::safepoint(&gc.safepoint, tls);
    }
    prev
}

pub fn is_enabled<VM: VMBinding>(mutator: &Mutator<VM>) -> bool {
    !mutator.tls.disable_gc.load(Ordering::Relaxed)
}

/// Request a collection.
pub fn collect<VM: VMBinding>(mutator: &Mutator<VM>, mode: CollectMode) {
    controller::collect(mutator.gc, mutator.tls, mode);
}

/// Poll for a pending collection without allocating.
pub fn gc_safepoint<VM: VMBinding>(mutator: &Mutator<VM>) {
    safepoint::safepoint(&mutator.gc.safepoint, mutator.tls);
}

/// Mark the thread as outside managed code (about to block).
pub fn enter_gc_safe<VM: VMBinding>(mutator: &Mutator<VM>) {
    safepoint::enter_gc_safe(mutator.tls);
}

/// Re-enter managed code.
pub fn leave_gc_safe<VM: VMBinding>(mutator: &Mutator<VM>) {
    safepoint::leave_gc_safe(&mutator.gc.safepoint, mutator.tls);
}

/// Note that the thread acquired a runtime lock (finalizers are deferred
/// while any are held).
pub fn lock_acquired<VM: VMBinding>(mutator: &Mutator<VM>) {
    mutator.tls.locks_held.fetch_add(1, Ordering::Relaxed);
}

pub fn lock_released<VM: VMBinding>(mutator: &Mutator<VM>) {
    let prev = mutator.tls.locks_held.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(prev > 0);
}

// -- counted and managed allocation --

pub fn counted_malloc<VM: VMBinding>(mutator: &Mutator<VM>, size: usize) -> Address {
    malloc::counted_malloc(mutator.gc, mutator.tls, size)
}

pub fn counted_calloc<VM: VMBinding>(mutator: &Mutator<VM>, nm: usize, size: usize) -> Address {
    malloc::counted_calloc(mutator.gc, mutator.tls, nm, size)
}

pub fn counted_realloc<VM: VMBinding>(
    mutator: &Mutator<VM>,
    ptr: Address,
    old_size: usize,
    new_size: usize,
) -> Address {
    malloc::counted_realloc(mutator.gc, mutator.tls, ptr, old_size, new_size)
}

pub fn counted_free_with_size<VM: VMBinding>(mutator: &Mutator<VM>, ptr: Address, size: usize) {
    malloc::counted_free_with_size(mutator.tls, ptr, size);
}

/// Cache-aligned array-storage allocation, charged to the collector.
pub fn managed_malloc<VM: VMBinding>(mutator: &Mutator<VM>, size: usize) -> Address {
    malloc::managed_malloc(mutator.gc, mutator.tls, size)
}

/// Resize array storage owned by `owner`.
pub fn managed_realloc<VM: VMBinding>(
    mutator: &Mutator<VM>,
    data: Address,
    new_size: usize,
    old_size: usize,
    owner: ObjectReference,
) -> Address {
    malloc::managed_realloc(mutator.gc, mutator.tls, data, new_size, old_size, owner)
}

/// Track an array whose storage came from malloc so the sweep frees it
/// with the array.
pub fn track_malloced_array<VM: VMBinding>(mutator: &Mutator<VM>, array: ObjectReference) {
    malloc::track_malloced_array(mutator.tls, array);
}

/// Register a task on the thread's live-task list; dead tasks have their
/// stacks released during sweeps.
pub fn record_live_task<VM: VMBinding>(mutator: &Mutator<VM>, task: ObjectReference) {
    let heap = unsafe { mutator.tls.heap_mut() };
    heap.live_tasks.push(task);
}

/// Register a foreign object whose dynamic sweep function must run when
/// it dies.
pub fn schedule_foreign_sweep<VM: VMBinding>(mutator: &Mutator<VM>, obj: ObjectReference) {
    let heap = unsafe { mutator.tls.heap_mut() };
    heap.sweep_objs.push(obj);
}

/// Register the runtime's read-only image region. Objects inside it are
/// treated as pinned old objects with no allocator metadata.
pub fn set_permalloc_region<VM: VMBinding>(gc: &Riptide<VM>, start: Address, end: Address) {
    gc.set_permalloc_region(start, end);
}

/// Pin a long-lived object directly into the old generation and queue it
/// so its fields stay live.
pub fn force_mark_old<VM: VMBinding>(mutator: &Mutator<VM>, obj: ObjectReference) {
    if header::gc_bits(obj) == header::GC_OLD_MARKED {
        return;
    }
    header::set_gc_bits(obj, header::GC_OLD_MARKED);
    let scan = !matches!(
        VM::shape_of(obj, header::type_tag(obj)),
        Some(ObjectShape::Opaque { .. }) | Some(ObjectShape::Weakref) | None
    );
    if scan {
        barrier::queue_root(mutator.tls, obj);
    }
}

// -- statistics --

pub fn num<VM: VMBinding>(gc: &Riptide<VM>) -> GcNum {
    gc.num()
}

pub fn total_bytes<VM: VMBinding>(gc: &Riptide<VM>) -> i64 {
    gc.total_bytes()
}

pub fn live_bytes<VM: VMBinding>(gc: &Riptide<VM>) -> i64 {
    gc.live_bytes()
}

pub fn diff_total_bytes<VM: VMBinding>(gc: &Riptide<VM>) -> i64 {
    gc.diff_total_bytes()
}

pub fn sync_total_bytes<VM: VMBinding>(gc: &Riptide<VM>, offset: i64) -> i64 {
    gc.sync_total_bytes(offset)
}

pub fn total_hrtime<VM: VMBinding>(gc: &Riptide<VM>) -> u64 {
    gc.total_hrtime()
}

pub fn reset_stats<VM: VMBinding>(gc: &Riptide<VM>) {
    gc.reset_stats();
}

pub fn set_max_memory<VM: VMBinding>(gc: &Riptide<VM>, bytes: usize) {
    gc.set_max_memory(bytes);
}

// -- callback registration --

pub fn set_gc_root_scanner<VM: VMBinding>(
    gc: &Riptide<VM>,
    cb: crate::callbacks::RootScanner<VM>,
    enable: bool,
) {
    gc.callbacks.set_root_scanner(cb, enable);
}

pub fn set_gc_task_scanner<VM: VMBinding>(
    gc: &Riptide<VM>,
    cb: crate::callbacks::TaskScanner<VM>,
    enable: bool,
) {
    gc.callbacks.set_task_scanner(cb, enable);
}

pub fn set_gc_pre_callback<VM: VMBinding>(gc: &Riptide<VM>, cb: crate::callbacks::PreGc, enable: bool) {
    gc.callbacks.set_pre_gc(cb, enable);
}

pub fn set_gc_post_callback<VM: VMBinding>(
    gc: &Riptide<VM>,
    cb: crate::callbacks::PostGc,
    enable: bool,
) {
    gc.callbacks.set_post_gc(cb, enable);
}

pub fn set_gc_notify_external_alloc<VM: VMBinding>(
    gc: &Riptide<VM>,
    cb: crate::callbacks::NotifyExternalAlloc,
    enable: bool,
) {
    gc.callbacks.set_notify_external_alloc(cb, enable);
}

pub fn set_gc_notify_external_free<VM: VMBinding>(
    gc: &Riptide<VM>,
    cb: crate::callbacks::NotifyExternalFree,
    enable: bool,
) {
    gc.callbacks.set_notify_external_free(cb, enable);
}
