//! The collector context.
//!
//! All process-wide collector state lives in one [`Riptide`] value created
//! by the binding at startup: the page table, the safepoint word, thread
//! registry, finalizer queues, callback chains, counters and options. The
//! binding keeps the instance alive for the life of the process (usually
//! by leaking the box) and passes it to every API call.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::callbacks::Callbacks;
use crate::controller::{combine_thread_gc_counts, CollectorState, GcNum};
use crate::finalizer::{Finalizer, FinalizerQueues};
use crate::heap::big::{self, BigVal};
use crate::heap::pagetable::PageTable;
use crate::safepoint::Safepoint;
use crate::thread::{Mutator, ThreadState};
use crate::util::options::Options;
use crate::util::{Address, ObjectReference};
use crate::vm::VMBinding;

/// An instance of the collector. Also known as a "heap" to bindings: one
/// per process is the normal arrangement, but instances are fully
/// independent.
pub struct Riptide<VM: VMBinding> {
    /// The run-time options for this instance.
    pub options: Options,
    pub(crate) safepoint: Safepoint,
    pub(crate) pages: PageTable,
    pub(crate) callbacks: Callbacks<VM>,
    /// Registered mutator threads, indexed by tid.
    pub(crate) threads: spin::RwLock<Vec<&'static ThreadState<VM>>>,
    /// The finalizers lock: protects `to_finalize`, the marked list and
    /// any resize of a per-thread finalizer list. Held across the core
    /// collection pass.
    pub(crate) finalizer_queues: Mutex<FinalizerQueues>,
    pub(crate) have_pending_finalizers: AtomicBool,
    /// Spans of finalizer lists currently executing on some thread; they
    /// are marked as roots so a nested collection cannot reclaim pending
    /// values.
    pub(crate) inflight_finalizers: spin::Mutex<Vec<NonNull<Vec<Finalizer>>>>,
    /// One-shot flag so the enable-finalizers misuse warning is not
    /// spammed.
    pub(crate) finalizer_warn_shot: AtomicBool,
    /// Big objects whose list move was flushed during marking. Only
    /// non-empty inside a collection.
    big_objects_marked: UnsafeCell<*mut BigVal>,
    /// Serializes mark-cache flushes.
    gc_cache_lock: spin::Mutex<()>,
    pub(crate) state: spin::Mutex<CollectorState>,
    /// Young bytes scanned while marking.
    pub(crate) scanned_bytes: AtomicI64,
    /// Old bytes scanned while marking.
    pub(crate) perm_scanned_bytes: AtomicI64,
    pub(crate) disable_counter: AtomicU32,
    /// Soft cap on live memory; advisory (see the controller).
    pub(crate) max_total_memory: AtomicUsize,
    /// Objects pinned as roots by the runtime.
    pub(crate) global_roots: spin::RwLock<Vec<ObjectReference>>,
    perm_region_start: AtomicUsize,
    perm_region_end: AtomicUsize,
    t_start: Instant,
}

// Safety: the unsafe-cell state (`big_objects_marked`) is only touched
// under `gc_cache_lock` or inside the world stop; `inflight_finalizers`
// spans are raw pointers kept alive by their running thread.
unsafe impl<VM: VMBinding> Send for Riptide<VM> {}
unsafe impl<VM: VMBinding> Sync for Riptide<VM> {}

impl<VM: VMBinding> Riptide<VM> {
    pub fn new(options: Options) -> Box<Self> {
        let interval = options.collect_interval;
        let max_total = options.max_total_memory;
        info!(
            "Riptide initialized: interval {} B, soft cap {} B",
            interval, max_total
        );
        Box::new(Riptide {
            options,
            safepoint: Safepoint::new(),
            pages: PageTable::new(),
            callbacks: Callbacks::default(),
            threads: spin::RwLock::new(Vec::new()),
            finalizer_queues: Mutex::new(FinalizerQueues::default()),
            have_pending_finalizers: AtomicBool::new(false),
            inflight_finalizers: spin::Mutex::new(Vec::new()),
            finalizer_warn_shot: AtomicBool::new(false),
            big_objects_marked: UnsafeCell::new(std::ptr::null_mut()),
            gc_cache_lock: spin::Mutex::new(()),
            state: spin::Mutex::new(CollectorState::new(interval)),
            scanned_bytes: AtomicI64::new(0),
            perm_scanned_bytes: AtomicI64::new(0),
            disable_counter: AtomicU32::new(0),
            max_total_memory: AtomicUsize::new(max_total),
            global_roots: spin::RwLock::new(Vec::new()),
            perm_region_start: AtomicUsize::new(0),
            perm_region_end: AtomicUsize::new(0),
            t_start: Instant::now(),
        })
    }

    /// Register the calling thread as a mutator.
    pub(crate) fn register_thread(&'static self) -> Mutator<VM> {
        let mut threads = self.threads.write();
        let tid = threads.len() as u16;
        let interval = self.state.lock().gc_num.interval;
        let tls: &'static ThreadState<VM> = Box::leak(Box::new(ThreadState::new(tid, interval)));
        threads.push(tls);
        drop(threads);
        // Pairs with the fence in `collect`: a collector either sees this
        // thread in the registry or this thread sees the safepoint flag.
        std::sync::atomic::fence(Ordering::SeqCst);
        debug!("bound mutator thread {tid}");
        Mutator::new(self, tls)
    }

    /// Register the read-only image region: objects inside are pinned old
    /// and never have allocator metadata.
    pub fn set_permalloc_region(&self, start: Address, end: Address) {
        self.perm_region_start.store(start.as_usize(), Ordering::Relaxed);
        self.perm_region_end.store(end.as_usize(), Ordering::Relaxed);
    }

    pub(crate) fn in_perm_region(&self, addr: Address) -> bool {
        let start = self.perm_region_start.load(Ordering::Relaxed);
        let end = self.perm_region_end.load(Ordering::Relaxed);
        addr.as_usize() >= start && addr.as_usize() < end
    }

    /// Pin an object as a global root.
    pub fn add_global_root(&self, obj: ObjectReference) {
        let mut roots = self.global_roots.write();
        if !roots.contains(&obj) {
            roots.push(obj);
        }
    }

    /// Unpin a global root.
    pub fn remove_global_root(&self, obj: ObjectReference) {
        self.global_roots.write().retain(|r| *r != obj);
    }

    /// Head of the marked big-object list. Sweep-only (world stopped).
    pub(crate) unsafe fn big_objects_marked_head(&self) -> *mut *mut BigVal {
        self.big_objects_marked.get()
    }

    /// Flush one thread's mark cache into the globals.
    pub(crate) fn sync_cache(&self, tls: &ThreadState<VM>) {
        let _guard = self.gc_cache_lock.lock();
        self.sync_cache_nolock(tls, tls);
    }

    /// Flush every thread's cache. No other thread can be marking at the
    /// same time.
    pub(crate) fn sync_all_caches(
        &self,
        tls: &ThreadState<VM>,
        threads: &[&'static ThreadState<VM>],
    ) {
        let _guard = self.gc_cache_lock.lock();
        for owner in threads {
            self.sync_cache_nolock(tls, owner);
        }
    }

    fn sync_cache_nolock(&self, tls: &ThreadState<VM>, owner: &ThreadState<VM>) {
        let cache = unsafe { owner.cache_mut() };
        for (hdr, to_young) in cache.big_obj.drain(..) {
            unsafe {
                big::big_object_unlink(hdr.as_ptr());
                if to_young {
                    let heap = tls.heap_mut();
                    big::big_object_link(hdr.as_ptr(), std::ptr::addr_of_mut!(heap.big_objects));
                } else {
                    // Move the object to the shared marked list.
                    big::big_object_link(hdr.as_ptr(), self.big_objects_marked.get());
                }
            }
        }
        self.perm_scanned_bytes
            .fetch_add(cache.perm_scanned_bytes, Ordering::Relaxed);
        self.scanned_bytes
            .fetch_add(cache.scanned_bytes, Ordering::Relaxed);
        cache.perm_scanned_bytes = 0;
        cache.scanned_bytes = 0;
    }

    pub(crate) fn add_live_bytes(&self, delta: i64) {
        self.state.lock().live_bytes += delta;
    }

    /// Adjust the soft memory cap at run time. Zero is ignored.
    pub fn set_max_memory(&self, bytes: usize) {
        if bytes > 0 {
            self.max_total_memory.store(bytes, Ordering::Relaxed);
        }
    }

    // -- statistics --

    /// A snapshot of the collection counters, with the per-thread counts
    /// folded in.
    pub fn num(&self) -> GcNum {
        let mut num = self.state.lock().gc_num;
        let threads: Vec<_> = self.threads.read().clone();
        combine_thread_gc_counts(&mut num, &threads);
        num
    }

    /// Total bytes allocated over the life of the process.
    pub fn total_bytes(&self) -> i64 {
        let num = self.num();
        num.total_allocd + num.deferred_alloc + num.allocd
    }

    /// Bytes believed live after the last collection.
    pub fn live_bytes(&self) -> i64 {
        self.state.lock().live_bytes
    }

    /// Bytes allocated since the last call to this function.
    pub fn diff_total_bytes(&self) -> i64 {
        let new_tb = self.total_bytes();
        let mut st = self.state.lock();
        let old_tb = st.last_gc_total_bytes;
        st.last_gc_total_bytes = new_tb;
        new_tb - old_tb
    }

    /// Like [`Self::diff_total_bytes`], but offsets the baseline; used by
    /// runtimes that carve out allocation they account for themselves.
    pub fn sync_total_bytes(&self, offset: i64) -> i64 {
        let new_tb = self.total_bytes();
        let mut st = self.state.lock();
        let old_tb = st.last_gc_total_bytes;
        st.last_gc_total_bytes = new_tb - offset;
        new_tb - old_tb
    }

    /// Nanoseconds spent in collections so far.
    pub fn total_hrtime(&self) -> u64 {
        self.state.lock().gc_num.total_time
    }

    /// Nanoseconds since this instance was created.
    pub fn uptime_hrtime(&self) -> u64 {
        self.t_start.elapsed().as_nanos() as u64
    }

    /// Reset the high-watermark statistics.
    pub fn reset_stats(&self) {
        let mut st = self.state.lock();
        st.gc_num.max_pause = 0;
        st.gc_num.max_memory = 0;
        st.gc_num.max_time_to_safepoint = 0;
    }
}
