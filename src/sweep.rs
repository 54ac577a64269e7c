//! The sweep engine.
//!
//! Runs inside the world stop after marking: weak references are cleared,
//! dead tasks and foreign objects are released, the big-object lists and
//! malloc'd-array lists are pruned, and every pool page is either freed,
//! skipped (quick sweep of an unchanged old page), reset for reuse, or
//! scanned cell by cell to rebuild its free list and age its survivors.

use atomic::Ordering;

use crate::callbacks;
use crate::header::{self, GC_CLEAN, GC_MARKED, GC_OLD, GC_OLD_MARKED};
use crate::heap::big::{BigVal, PROMOTE_AGE};
use crate::heap::page::{page_of, PageMeta, PAGE_SZ};
use crate::heap::pool::{self, Pool, N_POOLS};
use crate::riptide::Riptide;
use crate::thread::ThreadState;
use crate::util::{memory, Address, ObjectReference};
use crate::vm::{ArrayStorage, ObjectShape, VMBinding};

/// Bytes and calls released by the sweep, merged into the global counters
/// by the controller.
#[derive(Default)]
pub(crate) struct SweepStats {
    pub freed: i64,
    pub freecall: u64,
    pub pages_lazily_kept: usize,
}

/// Set the GC bits of a pool cell in place. Sweep-only (world stopped).
fn set_cell_bits(cell: Address, bits: u8) {
    let word = unsafe { cell.as_atomic_word() };
    let old = word.load(std::sync::atomic::Ordering::Relaxed);
    word.store(
        (old & !0x3) | bits as usize,
        std::sync::atomic::Ordering::Relaxed,
    );
}

fn cell_bits(cell: Address) -> u8 {
    (unsafe { cell.as_atomic_word() }.load(std::sync::atomic::Ordering::Relaxed) & 0x3) as u8
}

/// Clear dead referents: a weak reference whose value did not survive the
/// mark phase is flipped to the `nothing` sentinel.
pub(crate) fn clear_weak_refs<VM: VMBinding>(threads: &[&'static ThreadState<VM>]) {
    let nothing = VM::nothing();
    for tls in threads {
        let heap = unsafe { tls.heap_mut() };
        for wr in heap.weak_refs.iter() {
            let slot = wr.slot(0);
            if let Some(value) = unsafe { slot.load::<Option<ObjectReference>>() } {
                if !header::gc_marked(header::gc_bits(value)) {
                    unsafe { slot.store(nothing) };
                }
            }
        }
    }
}

/// Drop weak references that themselves died.
pub(crate) fn sweep_weak_refs<VM: VMBinding>(threads: &[&'static ThreadState<VM>]) {
    for tls in threads {
        let heap = unsafe { tls.heap_mut() };
        heap.weak_refs
            .retain(|wr| header::gc_marked(header::gc_bits(*wr)));
    }
}

/// Release the stacks of dead tasks and drop them from the live-task
/// registry.
pub(crate) fn sweep_live_tasks<VM: VMBinding>(threads: &[&'static ThreadState<VM>]) {
    for tls in threads {
        let heap = unsafe { tls.heap_mut() };
        heap.live_tasks.retain(|task| {
            if header::gc_marked(header::gc_bits(*task)) {
                true
            } else {
                VM::release_task_stack(*task);
                false
            }
        });
    }
}

/// Run the dynamic sweep function of dead foreign objects.
pub(crate) fn sweep_foreign_objs<VM: VMBinding>(threads: &[&'static ThreadState<VM>]) {
    for tls in threads {
        let heap = unsafe { tls.heap_mut() };
        heap.sweep_objs.retain(|obj| {
            if header::gc_marked(header::gc_bits(*obj)) {
                true
            } else {
                if let Some(ObjectShape::Foreign(desc)) =
                    VM::shape_of(*obj, header::type_tag(*obj))
                {
                    (desc.sweepfn)(*obj);
                }
                false
            }
        });
    }
}

/// Free the malloc'd storage of dead tracked arrays.
pub(crate) fn sweep_malloced_arrays<VM: VMBinding>(
    threads: &[&'static ThreadState<VM>],
    stats: &mut SweepStats,
) {
    for tls in threads {
        let heap = unsafe { tls.heap_mut() };
        let mut freed = 0i64;
        let mut freecall = 0u64;
        heap.mallocarrays.retain(|a| {
            if header::gc_marked(header::gc_bits(*a)) {
                return true;
            }
            if let Some(ObjectShape::Array(shape)) = VM::shape_of(*a, header::type_tag(*a)) {
                if let ArrayStorage::Malloced { aligned } = shape.storage {
                    if aligned {
                        memory::free_aligned(shape.data);
                    } else {
                        unsafe { libc::free(shape.data.to_mut_ptr()) };
                    }
                    freed += shape.nbytes as i64;
                    freecall += 1;
                }
            }
            false
        });
        stats.freed += freed;
        stats.freecall += freecall;
    }
}

/// Sweep one intrusive big-object list, unlinking and freeing unmarked
/// entries and aging/promoting survivors. Returns the terminal `next` slot
/// of the culled list.
///
/// # Safety
/// Must run inside the world stop with a valid list head.
unsafe fn sweep_big_list<VM: VMBinding>(
    gc: &Riptide<VM>,
    sweep_full: bool,
    list: *mut *mut BigVal,
    stats: &mut SweepStats,
) -> *mut *mut BigVal {
    let mut pv = list;
    let mut v = *pv;
    while !v.is_null() {
        let nxt = (*v).next();
        let obj = (*v).object();
        let bits = header::gc_bits(obj);
        if header::gc_marked(bits) {
            pv = std::ptr::addr_of_mut!((*v).next);
            let age = (*v).age;
            if age >= PROMOTE_AGE || bits == GC_OLD_MARKED {
                if sweep_full || bits == GC_MARKED {
                    header::set_gc_bits(obj, GC_OLD);
                }
            } else {
                (*v).age = (age + 1).min(PROMOTE_AGE);
                header::set_gc_bits(obj, GC_CLEAN);
            }
        } else {
            // Remove v from the list and free it.
            *pv = nxt;
            if !nxt.is_null() {
                (*nxt).prev = pv;
            }
            stats.freed += (*v).sz as i64;
            callbacks::invoke_notify_external_free(gc, Address::from_ptr(v));
            memory::free_aligned(Address::from_ptr(v));
        }
        v = nxt;
    }
    pv
}

/// Sweep every thread's big-object list. On a full sweep the shared
/// `big_objects_marked` list is swept too and its survivors merged into
/// the collecting thread's list.
pub(crate) fn sweep_big<VM: VMBinding>(
    gc: &Riptide<VM>,
    tls: &ThreadState<VM>,
    threads: &[&'static ThreadState<VM>],
    sweep_full: bool,
    stats: &mut SweepStats,
) {
    for t in threads {
        let heap = unsafe { t.heap_mut() };
        unsafe {
            sweep_big_list(gc, sweep_full, &mut heap.big_objects, stats);
        }
    }
    if sweep_full {
        unsafe {
            let marked = gc.big_objects_marked_head();
            let last_next = sweep_big_list(gc, sweep_full, marked, stats);
            // Move all survivors onto the collecting thread's list.
            let heap = tls.heap_mut();
            if !heap.big_objects.is_null() {
                (*heap.big_objects).prev = last_next;
            }
            *last_next = heap.big_objects;
            heap.big_objects = *marked;
            if !heap.big_objects.is_null() {
                (*heap.big_objects).prev = std::ptr::addr_of_mut!(heap.big_objects);
            }
            *marked = std::ptr::null_mut();
        }
    }
}

/// Builds the cross-page free list for one (thread, size class) pool
/// during the sweep. Free cells chain through their first word; the
/// builder tracks the last cell so segments from different pages link up.
struct FreeListBuilder {
    head: Address,
    tail: Address,
}

impl FreeListBuilder {
    const fn new() -> Self {
        FreeListBuilder {
            head: Address::ZERO,
            tail: Address::ZERO,
        }
    }

    fn push_cell(&mut self, cell: Address) {
        if self.head.is_zero() {
            self.head = cell;
        } else {
            unsafe { self.tail.store(cell.as_usize()) };
        }
        self.tail = cell;
    }

    /// Splice in a page's cached free-list segment (already internally
    /// linked).
    fn append_segment(&mut self, begin: Address, end: Address) {
        if self.head.is_zero() {
            self.head = begin;
        } else {
            unsafe { self.tail.store(begin.as_usize()) };
        }
        self.tail = end;
    }

    fn finish(self, pool: &mut Pool) {
        if self.head.is_zero() {
            pool.freelist = Address::ZERO;
        } else {
            unsafe { self.tail.store(0usize) };
            pool.freelist = self.head;
        }
    }
}

/// Recount the free cells of the page currently feeding the allocator's
/// free list, so its `nfree` is accurate before the sweep.
fn pool_sync_nfree(pg: &PageMeta, last: Address) {
    debug_assert!(pg.freelist_extent().is_some());
    let (fl_begin, _) = pg.freelist_extent().expect("freelist page without extent");
    if last == fl_begin {
        // Fast path: nothing of this page's free list was consumed.
        return;
    }
    let mut nfree = 0u16;
    let mut cur = last;
    loop {
        nfree += 1;
        let next = unsafe { cur.load::<Address>() };
        if next.is_zero() || page_of(next) != pg.data {
            break;
        }
        cur = next;
    }
    pg.nfree.store(nfree, Ordering::Relaxed);
}

/// Sweep a single page. Returns `false` when the page should be released
/// to the OS.
#[allow(clippy::too_many_arguments)]
fn sweep_page<VM: VMBinding>(
    pg: &PageMeta,
    pool: &mut Pool,
    builder: &mut FreeListBuilder,
    sweep_full: bool,
    prev_sweep_full: bool,
    lazy_budget: usize,
    stats: &mut SweepStats,
) -> bool {
    let osize = pg.osize as usize;
    let old_nfree = pg.nfree.load(Ordering::Relaxed) as i64;
    let capacity = pg.capacity();
    let mut keep = true;
    let nfree;

    'done: {
        if !pg.has_marked.load(Ordering::Relaxed) {
            // No survivors. On quick sweeps keep a budget of empty pages
            // reset and threaded back onto `newpages`; free the rest.
            let lazy = !cfg!(feature = "eager_sweeping")
                && !sweep_full
                && stats.pages_lazily_kept <= lazy_budget;
            if lazy {
                let begin = pool::reset_page(pg, pool.newpages);
                pool.newpages = begin;
                unsafe { begin.store(0usize) };
                stats.pages_lazily_kept += 1;
            } else {
                keep = false;
            }
            nfree = capacity as i64;
            break 'done;
        }

        // For a quick sweep, skip the page entirely if it had no young
        // cells before marking and its old population is unchanged.
        if !sweep_full && !pg.has_young.load(Ordering::Relaxed) {
            debug_assert!(
                !prev_sweep_full
                    || pg.prev_nold.load(Ordering::Relaxed) >= pg.nold.load(Ordering::Relaxed)
            );
            if !prev_sweep_full
                || pg.prev_nold.load(Ordering::Relaxed) == pg.nold.load(Ordering::Relaxed)
            {
                if let Some((begin, end)) = pg.freelist_extent() {
                    builder.append_segment(begin, end);
                }
                nfree = pg.nfree.load(Ordering::Relaxed) as i64;
                break 'done;
            }
        }

        // Scan the cells.
        let mut has_marked = false;
        let mut has_young = false;
        let mut prev_nold: u16 = 0;
        let mut pg_nfree: i64 = 0;
        let mut fl_extent: Option<(Address, Address)> = None;
        let lim = pg.data + PAGE_SZ - osize;
        let mut cell = pg.first_cell();
        let mut idx = 0usize;
        while cell <= lim {
            let bits = cell_bits(cell);
            if !header::gc_marked(bits) {
                builder.push_cell(cell);
                fl_extent = Some((fl_extent.map_or(cell, |(b, _)| b), cell));
                pg_nfree += 1;
                pg.clear_age_bit(idx);
            } else {
                // marked young or old
                let new_bits = if pg.age_bit(idx) || bits == GC_OLD_MARKED {
                    // old enough; a clear age with `GC_OLD_MARKED` happens
                    // for non-first-class buffers such as bindings
                    prev_nold += 1;
                    if sweep_full || bits == GC_MARKED {
                        set_cell_bits(cell, GC_OLD); // promote
                        GC_OLD
                    } else {
                        bits
                    }
                } else {
                    debug_assert_eq!(bits, GC_MARKED);
                    set_cell_bits(cell, GC_CLEAN); // unmark
                    has_young = true;
                    GC_CLEAN
                };
                has_marked |= header::gc_marked(new_bits);
                pg.set_age_bit(idx);
            }
            cell += osize;
            idx += 1;
        }

        pg.has_marked.store(has_marked, Ordering::Relaxed);
        pg.has_young.store(has_young, Ordering::Relaxed);
        pg.set_freelist_extent(fl_extent);
        pg.nfree.store(pg_nfree as u16, Ordering::Relaxed);
        if sweep_full {
            pg.nold.store(0, Ordering::Relaxed);
            pg.prev_nold.store(prev_nold, Ordering::Relaxed);
        }
        nfree = pg_nfree;
    }

    stats.freed += (nfree - old_nfree) * osize as i64;
    keep
}

/// Sweep every pool page of every thread: finalize the pages that were
/// feeding the allocators, walk the page-table radix, and rebuild the
/// cross-page free lists.
pub(crate) fn sweep_pool<VM: VMBinding>(
    gc: &Riptide<VM>,
    threads: &[&'static ThreadState<VM>],
    sweep_full: bool,
    prev_sweep_full: bool,
    stats: &mut SweepStats,
) {
    let lazy_budget = gc.options.lazy_page_budget;
    let mut builders: Vec<FreeListBuilder> = (0..threads.len() * N_POOLS)
        .map(|_| FreeListBuilder::new())
        .collect();

    // Update the metadata of pages that were the current allocation
    // target of some pool.
    for tls in threads {
        let heap = unsafe { tls.heap_mut() };
        for (i, p) in heap.pools.iter_mut().enumerate() {
            let last = p.freelist;
            if !last.is_zero() {
                let pg = gc
                    .pages
                    .lookup(last)
                    .expect("freelist head without page metadata");
                debug_assert_eq!(pg.osize as usize, crate::heap::pool::SIZE_CLASSES[i]);
                pool_sync_nfree(pg, last);
                pg.has_young.store(true, Ordering::Relaxed);
                p.freelist = Address::ZERO;
            }
            let last = p.newpages;
            if !last.is_zero() {
                let pg = gc
                    .pages
                    .lookup(last - 1usize)
                    .expect("bump pointer without page metadata");
                let consumed = last - pg.data;
                pg.nfree
                    .store(((PAGE_SZ - consumed) / pg.osize as usize) as u16, Ordering::Relaxed);
                pg.has_young.store(true, Ordering::Relaxed);
                p.newpages = Address::ZERO;
            }
        }
    }

    // The actual sweep over the radix.
    gc.pages.sweep_pages(|pg| {
        let tls = threads[pg.thread_n as usize];
        let pool_n = pg.pool_n as usize;
        let heap = unsafe { tls.heap_mut() };
        let builder = &mut builders[pg.thread_n as usize * N_POOLS + pool_n];
        sweep_page::<VM>(
            pg,
            &mut heap.pools[pool_n],
            builder,
            sweep_full,
            prev_sweep_full,
            lazy_budget,
            stats,
        )
    });

    // Null out the terminal pointers and install the rebuilt free lists.
    for (t_i, tls) in threads.iter().enumerate() {
        let heap = unsafe { tls.heap_mut() };
        for i in 0..N_POOLS {
            let builder =
                std::mem::replace(&mut builders[t_i * N_POOLS + i], FreeListBuilder::new());
            builder.finish(&mut heap.pools[i]);
        }
    }
}
