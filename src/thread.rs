//! Per-thread collector state.
//!
//! Every mutator thread binds a [`Mutator`], which owns a leaked
//! [`ThreadState`]: the thread-local heap (pools, big list, remembered
//! sets, weak references), the mark cache, the finalizer list and the
//! safepoint flag. The state is registered with the collector context so a
//! collection can reach every thread's heap inside the world stop.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::finalizer::FinalizerList;
use crate::heap::big::BigVal;
use crate::heap::pool::{Pool, N_POOLS};
use crate::mark::MarkFrame;
use crate::riptide::Riptide;
use crate::util::{Address, ObjectReference};
use crate::vm::{Binding, VMBinding};

/// Per-thread allocation counters. `allocd` is biased by the negative
/// collect interval; crossing zero triggers a collection on the next
/// allocation.
#[derive(Default)]
pub struct ThreadGcNum {
    pub allocd: AtomicI64,
    pub freed: AtomicI64,
    pub malloc: AtomicU64,
    pub realloc: AtomicU64,
    pub poolalloc: AtomicU64,
    pub bigalloc: AtomicU64,
    pub freecall: AtomicU64,
}

impl ThreadGcNum {
    pub(crate) fn reset(&self, interval: usize) {
        self.allocd.store(-(interval as i64), Ordering::Relaxed);
        self.freed.store(0, Ordering::Relaxed);
        self.malloc.store(0, Ordering::Relaxed);
        self.realloc.store(0, Ordering::Relaxed);
        self.poolalloc.store(0, Ordering::Relaxed);
        self.bigalloc.store(0, Ordering::Relaxed);
        self.freecall.store(0, Ordering::Relaxed);
    }
}

/// The thread-local heap. Mutated by the owning thread without locks and by
/// the collecting thread inside the world stop.
pub struct ThreadHeap {
    /// One pool per size class.
    pub pools: [Pool; N_POOLS],
    /// Weak references allocated by this thread.
    pub weak_refs: Vec<ObjectReference>,
    /// Tasks whose stacks this thread manages.
    pub live_tasks: Vec<ObjectReference>,
    /// Arrays with malloc'd storage, for the malloc'd-array sweep.
    pub mallocarrays: Vec<ObjectReference>,
    /// Head of this thread's big-object list.
    pub big_objects: *mut BigVal,
    /// Old objects that may reference young ones, discovered since the
    /// last collection.
    pub remset: Vec<ObjectReference>,
    /// The previous cycle's remset; swapped with `remset` during premark.
    pub last_remset: Vec<ObjectReference>,
    /// Conservative count of old-to-young pointers behind `remset`.
    pub remset_nptr: usize,
    /// Module bindings that may reference young values.
    pub rem_bindings: Vec<NonNull<Binding>>,
    /// Foreign objects awaiting their dynamic sweep function.
    pub sweep_objs: Vec<ObjectReference>,
}

impl ThreadHeap {
    fn new() -> Self {
        ThreadHeap {
            pools: std::array::from_fn(|_| Pool::new()),
            weak_refs: Vec::new(),
            live_tasks: Vec::new(),
            mallocarrays: Vec::new(),
            big_objects: std::ptr::null_mut(),
            remset: Vec::new(),
            last_remset: Vec::new(),
            remset_nptr: 0,
            rem_bindings: Vec::new(),
            sweep_objs: Vec::new(),
        }
    }
}

/// How many pending big-object moves the mark cache buffers before a
/// flush.
pub(crate) const MARK_CACHE_BIG_OBJ: usize = 1024;

/// Per-thread mark cache: byte counters and pending big-object list moves,
/// flushed into the globals under the cache lock; plus the reusable mark
/// stack storage.
pub struct MarkCache {
    pub scanned_bytes: i64,
    pub perm_scanned_bytes: i64,
    /// `(header, back_to_young)` moves to apply to the big-object lists.
    pub big_obj: Vec<(NonNull<BigVal>, bool)>,
    /// Work-stack storage, kept to preserve its capacity across cycles.
    pub mark_stack: Vec<MarkFrame>,
}

impl MarkCache {
    fn new() -> Self {
        MarkCache {
            scanned_bytes: 0,
            perm_scanned_bytes: 0,
            big_obj: Vec::with_capacity(MARK_CACHE_BIG_OBJ),
            mark_stack: Vec::with_capacity(1024),
        }
    }
}

/// All collector state belonging to one mutator thread.
pub struct ThreadState<VM: VMBinding> {
    pub tid: u16,
    /// Nonzero when the thread is parked at a safepoint (or otherwise out
    /// of managed code) and will not touch the managed heap.
    pub gc_state: AtomicU8,
    pub gc_num: ThreadGcNum,
    /// Set while `enable(false)` is in effect on this thread.
    pub disable_gc: AtomicBool,
    pub in_finalizer: AtomicBool,
    pub finalizers_inhibited: AtomicU32,
    /// Number of runtime locks the thread currently holds; finalizers only
    /// run when this is zero.
    pub locks_held: AtomicU32,
    heap: std::cell::UnsafeCell<ThreadHeap>,
    cache: std::cell::UnsafeCell<MarkCache>,
    /// Finalizers registered by this thread, as `(value, callable)`
    /// entries. Foreign threads access it under the finalizers lock with
    /// the acquire/release length protocol.
    pub finalizers: FinalizerList,

    // Thread-local roots, maintained by the runtime.
    pub root_task: AtomicUsize,
    pub current_task: AtomicUsize,
    pub next_task: AtomicUsize,
    pub previous_task: AtomicUsize,
    pub previous_exception: AtomicUsize,
    /// The thread's backtrace buffer, scanned for managed values.
    pub bt_data: AtomicUsize,
    pub bt_size: AtomicUsize,
    /// Base of the thread's native stack, published by the runtime; used
    /// to rebase pointers into copied-out task stacks.
    pub stackbase: AtomicUsize,

    _vm: PhantomData<VM>,
}

// Safety: the interior-mutable parts (`heap`, `cache`) are only accessed by
// the owning thread while the world runs, and only by the collecting thread
// while the world is stopped; everything else is atomic.
unsafe impl<VM: VMBinding> Send for ThreadState<VM> {}
unsafe impl<VM: VMBinding> Sync for ThreadState<VM> {}

impl<VM: VMBinding> ThreadState<VM> {
    pub(crate) fn new(tid: u16, interval: usize) -> Self {
        let state = ThreadState {
            tid,
            gc_state: AtomicU8::new(0),
            gc_num: ThreadGcNum::default(),
            disable_gc: AtomicBool::new(false),
            in_finalizer: AtomicBool::new(false),
            finalizers_inhibited: AtomicU32::new(0),
            locks_held: AtomicU32::new(0),
            heap: std::cell::UnsafeCell::new(ThreadHeap::new()),
            cache: std::cell::UnsafeCell::new(MarkCache::new()),
            finalizers: FinalizerList::new(),
            root_task: AtomicUsize::new(0),
            current_task: AtomicUsize::new(0),
            next_task: AtomicUsize::new(0),
            previous_task: AtomicUsize::new(0),
            previous_exception: AtomicUsize::new(0),
            bt_data: AtomicUsize::new(0),
            bt_size: AtomicUsize::new(0),
            stackbase: AtomicUsize::new(0),
            _vm: PhantomData,
        };
        state.gc_num.reset(interval);
        state
    }

    /// Mutable access to the thread-local heap.
    ///
    /// # Safety
    /// Caller must be the owning thread (outside a collection), or the
    /// collecting thread inside the world stop.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn heap_mut(&self) -> &mut ThreadHeap {
        &mut *self.heap.get()
    }

    /// Mutable access to the mark cache; same rules as [`Self::heap_mut`].
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn cache_mut(&self) -> &mut MarkCache {
        &mut *self.cache.get()
    }

    fn root_slot(slot: &AtomicUsize) -> Option<ObjectReference> {
        ObjectReference::from_raw_address(Address::from_usize(slot.load(Ordering::Relaxed)))
    }

    pub(crate) fn thread_local_roots(&self) -> impl Iterator<Item = ObjectReference> + '_ {
        [
            &self.root_task,
            &self.current_task,
            &self.next_task,
            // shouldn't be necessary, but no reason not to
            &self.previous_task,
            &self.previous_exception,
        ]
        .into_iter()
        .filter_map(Self::root_slot)
    }
}

/// The handle a mutator thread uses to talk to the collector. Not `Sync`:
/// each thread binds its own.
pub struct Mutator<VM: VMBinding> {
    pub gc: &'static Riptide<VM>,
    pub(crate) tls: &'static ThreadState<VM>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<VM: VMBinding> Mutator<VM> {
    pub(crate) fn new(gc: &'static Riptide<VM>, tls: &'static ThreadState<VM>) -> Self {
        Mutator {
            gc,
            tls,
            _not_sync: PhantomData,
        }
    }

    /// The collector-visible state of this thread. Mostly useful for the
    /// runtime to publish task roots and backtrace buffers.
    pub fn state(&self) -> &'static ThreadState<VM> {
        self.tls
    }

    pub fn tid(&self) -> u16 {
        self.tls.tid
    }
}
