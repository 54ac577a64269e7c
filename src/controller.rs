//! The collection controller: entry points, the core collection pass, and
//! the quick/full sweep heuristics with collect-interval adaptation.

use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::barrier;
use crate::callbacks;
use crate::finalizer::{self, Finalizer};
use crate::mark::Marker;
use crate::riptide::Riptide;
use crate::safepoint::{self, GC_STATE_WAITING};
use crate::sweep::{self, SweepStats};
use crate::thread::ThreadState;
use crate::util::constants::BYTES_IN_WORD;
use crate::vm::VMBinding;

/// How a collection was requested.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CollectMode {
    /// Heuristic collection triggered by the allocation counters.
    Auto,
    /// Unconditional full collection.
    Full,
    /// Reserved; currently behaves as [`CollectMode::Auto`].
    Incremental,
}

/// Process-wide collection statistics, in the shape reported by
/// [`crate::memory_manager::num`].
#[derive(Copy, Clone, Debug, Default)]
pub struct GcNum {
    pub allocd: i64,
    pub deferred_alloc: i64,
    pub freed: i64,
    pub malloc: u64,
    pub realloc: u64,
    pub poolalloc: u64,
    pub bigalloc: u64,
    pub freecall: u64,
    /// Total nanoseconds spent inside collections.
    pub total_time: u64,
    pub total_allocd: i64,
    pub since_sweep: i64,
    /// Current allocation budget between automatic collections.
    pub interval: usize,
    /// Number of completed collection pauses.
    pub pause: u64,
    pub full_sweep: u64,
    pub max_pause: u64,
    pub max_memory: i64,
    pub time_to_safepoint: u64,
    pub max_time_to_safepoint: u64,
    pub mark_time: u64,
    pub total_mark_time: u64,
    pub sweep_time: u64,
    pub total_sweep_time: u64,
}

/// Controller state guarded by the collector's state lock.
pub(crate) struct CollectorState {
    pub gc_num: GcNum,
    /// Bytes believed live after the last collection.
    pub live_bytes: i64,
    pub last_live_bytes: i64,
    /// Bytes promoted to the old generation since the last full sweep.
    pub promoted_bytes: i64,
    /// Whether the last sweep was a full sweep.
    pub prev_sweep_full: bool,
    pub last_gc_total_bytes: i64,
}

impl CollectorState {
    pub(crate) fn new(interval: usize) -> Self {
        CollectorState {
            gc_num: GcNum {
                interval,
                ..Default::default()
            },
            live_bytes: 0,
            last_live_bytes: 0,
            promoted_bytes: 0,
            prev_sweep_full: true,
            last_gc_total_bytes: 0,
        }
    }
}

/// Fold every thread's biased counters into the global numbers.
pub(crate) fn combine_thread_gc_counts<VM: VMBinding>(
    dest: &mut GcNum,
    threads: &[&'static ThreadState<VM>],
) {
    let interval = dest.interval as i64;
    for tls in threads {
        dest.allocd += tls.gc_num.allocd.load(Ordering::Relaxed) + interval;
        dest.freed += tls.gc_num.freed.load(Ordering::Relaxed);
        dest.malloc += tls.gc_num.malloc.load(Ordering::Relaxed);
        dest.realloc += tls.gc_num.realloc.load(Ordering::Relaxed);
        dest.poolalloc += tls.gc_num.poolalloc.load(Ordering::Relaxed);
        dest.bigalloc += tls.gc_num.bigalloc.load(Ordering::Relaxed);
        dest.freecall += tls.gc_num.freecall.load(Ordering::Relaxed);
    }
}

fn reset_thread_gc_counts<VM: VMBinding>(threads: &[&'static ThreadState<VM>], interval: usize) {
    for tls in threads {
        tls.gc_num.reset(interval);
    }
}

/// The allocator-side trigger: collect once the biased allocation counter
/// crosses zero, otherwise just honor a pending safepoint.
pub(crate) fn maybe_collect<VM: VMBinding>(gc: &Riptide<VM>, tls: &ThreadState<VM>) {
    if tls.gc_num.allocd.load(Ordering::Relaxed) >= 0 {
        collect(gc, tls, CollectMode::Auto);
    } else {
        safepoint::safepoint(&gc.safepoint, tls);
    }
}

/// Collection entry point. Stops the world, runs the core pass (twice when
/// a full collection follows a quick one), releases the world and runs
/// scheduled finalizers on the calling thread.
pub(crate) fn collect<VM: VMBinding>(gc: &Riptide<VM>, tls: &ThreadState<VM>, mode: CollectMode) {
    // The reserved incremental mode currently behaves as AUTO.
    let mode = if mode == CollectMode::Incremental {
        CollectMode::Auto
    } else {
        mode
    };

    if gc.disable_counter.load(Ordering::Relaxed) > 0 {
        // Record the caller's allocations so re-enabling can account for
        // them, and return without collecting.
        let mut st = gc.state.lock();
        let interval = st.gc_num.interval as i64;
        let local = tls.gc_num.allocd.swap(-interval, Ordering::Relaxed) + interval;
        st.gc_num.deferred_alloc += local;
        return;
    }

    let old_state = tls.gc_state.load(Ordering::Relaxed);
    tls.gc_state.store(GC_STATE_WAITING, Ordering::Release);
    let t0 = Instant::now();
    // `start_gc` makes sure only one thread can run the collection.
    if !gc.safepoint.start_gc() {
        gc.safepoint.wait_gc();
        tls.gc_state.store(old_state, Ordering::Release);
        return;
    }

    // Synchronize with thread registration, then wait for every other
    // thread to reach a safepoint.
    std::sync::atomic::fence(Ordering::SeqCst);
    let threads: Vec<&'static ThreadState<VM>> = gc.threads.read().clone();
    safepoint::wait_for_the_world(&threads, tls.tid);

    let time_to_safepoint = t0.elapsed().as_nanos() as u64;
    {
        let mut st = gc.state.lock();
        st.gc_num.time_to_safepoint = time_to_safepoint;
        st.gc_num.max_time_to_safepoint =
            st.gc_num.max_time_to_safepoint.max(time_to_safepoint);
    }

    callbacks::invoke_pre_gc(gc, mode);

    if gc.disable_counter.load(Ordering::Relaxed) == 0 {
        let mut queues = gc.finalizer_queues.lock().unwrap();
        if collect_inner(gc, tls, &threads, mode, &mut queues) {
            // recollect
            let again = collect_inner(gc, tls, &threads, CollectMode::Auto, &mut queues);
            debug_assert!(!again, "recollection requested another recollection");
            if again {
                error!("recollection requested another recollection; not looping");
            }
        }
    }

    gc.safepoint.end_gc();
    tls.gc_state.store(old_state, Ordering::Release);

    // Only run finalizers on the current thread; waiting for other
    // threads' inhibition flags would be racy.
    if tls.finalizers_inhibited.load(Ordering::Relaxed) == 0
        && tls.locks_held.load(Ordering::Relaxed) == 0
    {
        finalizer::run_finalizers(gc, tls);
    }

    callbacks::invoke_post_gc(gc, mode);
}

/// The core pass. Only one thread runs in this function; the world is
/// stopped. Returns whether an automatic recollection should follow.
fn collect_inner<VM: VMBinding>(
    gc: &Riptide<VM>,
    tls: &ThreadState<VM>,
    threads: &[&'static ThreadState<VM>],
    mode: CollectMode,
    queues: &mut crate::finalizer::FinalizerQueues,
) -> bool {
    let gc_start = Instant::now();
    let (prev_sweep_full, interval_at_start) = {
        let mut st = gc.state.lock();
        combine_thread_gc_counts(&mut st.gc_num, threads);
        (st.prev_sweep_full, st.gc_num.interval)
    };
    let last_perm_scanned = gc.perm_scanned_bytes.load(Ordering::Relaxed);
    debug!(
        "collection start: mode {:?}, {} threads, {} pages",
        mode,
        threads.len(),
        gc.pages.npages.load(Ordering::Relaxed)
    );

    let start_mark = Instant::now();
    // 1. fix the GC bits of objects in the remsets
    for t in threads {
        barrier::premark(t);
    }

    let mut marker = Marker::new(gc, tls);
    for t in threads {
        // 2.1. mark every object in the last remsets and remembered bindings
        marker.queue_remset(t);
        // 2.2. mark every thread-local root
        marker.queue_thread_local_roots(t);
        // 2.3. mark any managed objects in the backtrace buffer
        marker.queue_bt_buf(t);
    }
    // Finalizer lists being run right now are reachable from the running
    // thread even though no heap object points at them.
    let inflight: Vec<(*const Finalizer, usize)> = gc
        .inflight_finalizers
        .lock()
        .iter()
        .map(|span| {
            let list = unsafe { span.as_ref() };
            (list.as_ptr(), list.len())
        })
        .collect();
    for (ptr, len) in inflight {
        marker.queue_finlist(unsafe { std::slice::from_raw_parts(ptr, len) }, 0);
    }

    // 3. walk the roots
    marker.mark_roots(mode);
    marker.mark_loop();

    let mark_time = start_mark.elapsed().as_nanos() as u64;
    let actual_allocd = {
        let mut st = gc.state.lock();
        st.gc_num.since_sweep += st.gc_num.allocd;
        st.gc_num.mark_time = mark_time;
        st.gc_num.total_mark_time += mark_time;
        st.gc_num.since_sweep
    };
    // marking is over

    // 4. check for objects to finalize
    sweep::clear_weak_refs(threads);
    // Record the length of the marked list: entries migrated from the
    // per-thread lists below still need to be marked.
    let mut orig_marked_len = queues.marked.len();
    for t in threads {
        let entries = unsafe { t.finalizers.entries() };
        let new_len = finalizer::sweep_finalizer_entries(gc, queues, entries, false);
        unsafe { t.finalizers.set_len(new_len) };
    }
    if prev_sweep_full {
        let mut marked = std::mem::take(&mut queues.marked);
        let new_len = finalizer::sweep_finalizer_entries(gc, queues, &mut marked, true);
        marked.truncate(new_len);
        queues.marked = marked;
        orig_marked_len = 0;
    }
    for t in threads {
        marker.queue_finlist(unsafe { t.finalizers.entries() }, 0);
    }
    marker.queue_finlist(&queues.marked, orig_marked_len);
    // Flush the mark stack before flipping the reset-age bit so already
    // queued objects are not incorrectly reset.
    marker.mark_loop();
    // Reset the age and old bit of anything only reachable through
    // `to_finalize`: those objects are unreachable from anywhere else, so
    // this keeps them collectable right after their finalizer runs.
    marker.set_reset_age(true);
    marker.queue_finlist(&queues.to_finalize, 0);
    marker.mark_loop();
    marker.set_reset_age(false);
    marker.finish();

    // Flush everything in the mark caches.
    gc.sync_all_caches(tls, threads);
    let scanned = gc.scanned_bytes.load(Ordering::Relaxed);
    let perm_scanned = gc.perm_scanned_bytes.load(Ordering::Relaxed);

    // 5. next collection decision
    let (live_bytes, estimate_freed) = {
        let mut st = gc.state.lock();
        st.gc_num.total_allocd += st.gc_num.since_sweep;
        if !prev_sweep_full {
            st.promoted_bytes += perm_scanned - last_perm_scanned;
        }
        let live_sz_ub = st.live_bytes + actual_allocd;
        let live_sz_est = scanned + perm_scanned;
        (st.live_bytes, live_sz_ub - live_sz_est)
    };
    let not_freed_enough =
        mode == CollectMode::Auto && estimate_freed < 7 * (actual_allocd / 10);
    let nptr: usize = threads
        .iter()
        .map(|t| unsafe { t.heap_mut() }.remset_nptr)
        .sum();
    // many pointers in the intergenerational frontier => "quick" mark is
    // not quick
    let large_frontier = nptr * BYTES_IN_WORD >= gc.options.collect_interval;
    let mut sweep_full = false;
    let mut recollect = false;

    // update the heuristics only if this collection was automatic
    if mode == CollectMode::Auto {
        let mut st = gc.state.lock();
        if not_freed_enough {
            st.gc_num.interval = interval_at_start * 2;
        }
        if large_frontier {
            sweep_full = true;
        }
        // on a big memory machine, increase the max interval
        let mut maxmem = gc.options.total_memory / threads.len().max(1) / 2;
        if maxmem < gc.options.max_collect_interval {
            maxmem = gc.options.max_collect_interval;
        }
        if st.gc_num.interval > maxmem {
            sweep_full = true;
            st.gc_num.interval = maxmem;
        }
    }
    // If the live data outgrows the soft cap we keep going with minimum
    // intervals and full sweeps until we either free some space or get an
    // OOM error.
    if live_bytes > gc.max_total_memory.load(Ordering::Relaxed) as i64 {
        sweep_full = true;
    }
    if gc.options.always_full {
        sweep_full = true;
    }
    if mode == CollectMode::Full {
        sweep_full = true;
        if !prev_sweep_full {
            recollect = true;
        }
    }
    if sweep_full {
        // the difference between the number of old bytes scanned on the
        // first collection after a full sweep and the current scan
        gc.perm_scanned_bytes.store(0, Ordering::Relaxed);
        gc.state.lock().promoted_bytes = 0;
    }
    gc.scanned_bytes.store(0, Ordering::Relaxed);

    // 6. sweep
    let start_sweep = Instant::now();
    let mut stats = SweepStats::default();
    sweep::sweep_weak_refs(threads);
    sweep::sweep_live_tasks(threads);
    sweep::sweep_foreign_objs(threads);
    sweep::sweep_malloced_arrays::<VM>(threads, &mut stats);
    sweep::sweep_big(gc, tls, threads, sweep_full, &mut stats);
    sweep::sweep_pool::<VM>(gc, threads, sweep_full, prev_sweep_full, &mut stats);
    let sweep_time = start_sweep.elapsed().as_nanos() as u64;

    // 7. on a quick sweep, put the remembered objects back in a queued
    // state so the write barrier does not fire for them again
    barrier::restore_remsets(threads, sweep_full);

    let pause = gc_start.elapsed().as_nanos() as u64;
    let interval = {
        let mut st = gc.state.lock();
        st.gc_num.freed += stats.freed;
        st.gc_num.freecall += stats.freecall;
        st.gc_num.sweep_time = sweep_time;
        st.gc_num.total_sweep_time += sweep_time;
        st.gc_num.full_sweep += sweep_full as u64;
        let max_memory = st.last_live_bytes + st.gc_num.allocd;
        if max_memory > st.gc_num.max_memory {
            st.gc_num.max_memory = max_memory;
        }

        st.gc_num.allocd = 0;
        st.last_live_bytes = st.live_bytes;
        st.live_bytes += st.gc_num.since_sweep - st.gc_num.freed;

        if mode == CollectMode::Auto {
            // shrink an interval that dwarfs the live set, but never go
            // below the default
            let half = st.live_bytes / 2;
            if st.gc_num.interval as i64 > half {
                st.gc_num.interval = half.max(0) as usize;
            }
            if st.gc_num.interval < gc.options.collect_interval {
                st.gc_num.interval = gc.options.collect_interval;
            }
        }
        let max_total = gc.max_total_memory.load(Ordering::Relaxed) as i64;
        if st.gc_num.interval as i64 + st.live_bytes > max_total {
            if st.live_bytes < max_total {
                st.gc_num.interval = (max_total - st.live_bytes) as usize;
            } else {
                // We can't stay under the goal, so go back to the minimum
                // interval and hope things get better.
                st.gc_num.interval = gc.options.collect_interval;
            }
        }

        info!(
            "GC: pause {:.2} ms, {} sweep, freed {} B, live {} B, interval {} B",
            pause as f64 / 1e6,
            if sweep_full { "full" } else { "quick" },
            st.gc_num.freed,
            st.live_bytes,
            st.gc_num.interval
        );

        st.prev_sweep_full = sweep_full;
        if !recollect {
            st.gc_num.pause += 1;
        }
        st.gc_num.total_time += pause;
        st.gc_num.since_sweep = 0;
        st.gc_num.freed = 0;
        if pause > st.gc_num.max_pause {
            st.gc_num.max_pause = pause;
        }
        st.gc_num.interval
    };
    reset_thread_gc_counts(threads, interval);

    recollect
}
