//! The size-classed pool allocator.
//!
//! Small allocations are rounded up to a fixed table of size classes and
//! served from per-thread pools. Each pool keeps a free list of cells and a
//! bump pointer (`newpages`) into the current page; exhausted pages chain to
//! the next free page through their first word.

use atomic::Ordering;

use crate::controller;
use crate::heap::page::{page_of, PageMeta, PAGE_OFFSET, PAGE_SZ};
use crate::riptide::Riptide;
use crate::thread::ThreadState;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::{Address, ObjectReference};
use crate::vm::{AllocationError, VMBinding};

/// The number of pool size classes.
pub const N_POOLS: usize = 43;

/// The largest pool cell size (and the largest entry of [`SIZE_CLASSES`]).
pub const MAX_POOL_ALLOC: usize = 2032;

/// Object sizes served by the pools, in bytes, including the header word.
/// 8-byte spacing up to 128, 16-byte up to 256, then progressively coarser
/// strides to bound internal fragmentation.
pub const SIZE_CLASSES: [usize; N_POOLS] = [
    8, 16, 24, 32, 40, 48, 56, 64, 72, 80, 88, 96, 104, 112, 120, 128, //
    144, 160, 176, 192, 208, 224, 240, 256, //
    288, 320, 352, 384, 416, 448, 480, 512, //
    576, 640, 704, 768, 832, 896, 960, 1024, //
    1360, 1632, MAX_POOL_ALLOC,
];

/// The largest payload (excluding the header) served by the pools. One byte
/// more goes to the big-object path.
pub const MAX_SZCLASS: usize = MAX_POOL_ALLOC - BYTES_IN_WORD;

lazy_static! {
    /// Size class index by allocation size (payload + header).
    static ref CLASS_BY_SIZE: [u8; MAX_POOL_ALLOC + 1] = {
        let mut table = [0u8; MAX_POOL_ALLOC + 1];
        let mut klass = 0usize;
        for (sz, entry) in table.iter_mut().enumerate() {
            if sz > SIZE_CLASSES[klass] {
                klass += 1;
            }
            *entry = klass as u8;
        }
        table
    };
}

/// The smallest size class holding `allocsz` bytes (payload + header).
pub fn size_class(allocsz: usize) -> usize {
    debug_assert!(allocsz <= MAX_POOL_ALLOC);
    CLASS_BY_SIZE[allocsz] as usize
}

/// One size class of a thread-local heap.
#[derive(Default)]
pub struct Pool {
    /// Head of the free-cell list, or zero.
    pub freelist: Address,
    /// Bump pointer into the current page, or zero. Exhausted pages link to
    /// the next free page through their first word.
    pub newpages: Address,
}

impl Pool {
    pub const fn new() -> Self {
        Pool {
            freelist: Address::ZERO,
            newpages: Address::ZERO,
        }
    }
}

fn value_of(cell: Address) -> ObjectReference {
    debug_assert!(!cell.is_zero());
    unsafe { ObjectReference::from_raw_address_unchecked(cell + BYTES_IN_WORD) }
}

/// Thread a page's cells back into pristine bump state and hook it into the
/// free-page chain after `fl` (the current `newpages` head), returning the
/// new head. Inserting after the first page keeps allocation targeting a
/// single page at a time, which limits fragmentation.
pub(crate) fn reset_page(pg: &PageMeta, fl: Address) -> Address {
    const_assert!(PAGE_OFFSET >= BYTES_IN_WORD);
    pg.nfree.store(pg.capacity() as u16, Ordering::Relaxed);
    pg.reset_ages();
    let beg = pg.first_cell();
    let chain_slot = pg.data;
    let head = if fl.is_zero() {
        unsafe { chain_slot.store(0usize) };
        beg
    } else {
        let fl_chain_slot = page_of(fl);
        unsafe {
            chain_slot.store(fl_chain_slot.load::<usize>());
            fl_chain_slot.store(beg.as_usize());
        }
        fl
    };
    pg.has_young.store(false, Ordering::Relaxed);
    pg.has_marked.store(false, Ordering::Relaxed);
    pg.set_freelist_extent(None);
    head
}

/// Acquire a fresh page for the pool. Discards any pages in `newpages`
/// before it, so callers only invoke it once the chain is exhausted.
fn add_page<VM: VMBinding>(
    gc: &Riptide<VM>,
    tls: &ThreadState<VM>,
    klass: usize,
    osize: usize,
) -> Address {
    let pg = match gc
        .pages
        .alloc_page(|data| PageMeta::new(data, osize, klass as u8, tls.tid))
    {
        Some(pg) => pg,
        None => VM::out_of_memory(AllocationError::MmapOutOfMemory),
    };
    trace!(
        "thread {} added page {} for size class {} ({} B)",
        tls.tid,
        pg.data,
        klass,
        osize
    );
    let fl = reset_page(pg, Address::ZERO);
    let heap = unsafe { tls.heap_mut() };
    heap.pools[klass].newpages = fl;
    fl
}

/// Allocate one cell from the thread's pool for size class `klass`.
/// `osize` must be `SIZE_CLASSES[klass]`; callers pass it to keep the fast
/// path free of the table load. The returned object's header is
/// uninitialized; the caller installs the type tag.
pub(crate) fn alloc_pool<VM: VMBinding>(
    gc: &Riptide<VM>,
    tls: &ThreadState<VM>,
    klass: usize,
    osize: usize,
) -> ObjectReference {
    debug_assert_eq!(osize, SIZE_CLASSES[klass]);
    controller::maybe_collect(gc, tls);
    tls.gc_num.allocd.fetch_add(osize as i64, Ordering::Relaxed);
    tls.gc_num.poolalloc.fetch_add(1, Ordering::Relaxed);

    // first try to use the freelist
    let v = unsafe { tls.heap_mut() }.pools[klass].freelist;
    if !v.is_zero() {
        let next = unsafe { v.load::<Address>() };
        unsafe { tls.heap_mut() }.pools[klass].freelist = next;
        if page_of(v) != page_of(next) {
            // we only update the page's fields when the freelist changes
            // page, since the metadata is likely not in cache
            let pg = lookup_pool_page(gc, v);
            debug_assert_eq!(pg.osize as usize, osize);
            pg.nfree.store(0, Ordering::Relaxed);
            pg.has_young.store(true, Ordering::Relaxed);
        }
        return value_of(v);
    }

    // if the freelist is empty we bump-allocate from `newpages`
    let mut v = unsafe { tls.heap_mut() }.pools[klass].newpages;
    let mut next = v + osize;
    // If there are no pages left or the current page is used up, we need
    // the slow path.
    if v.is_zero() || page_of(v - 1usize) + PAGE_SZ < next {
        if !v.is_zero() {
            // like the freelist case, but only update the page metadata
            // when the page is full
            let cur_page = page_of(v - 1usize);
            let pg = lookup_pool_page(gc, cur_page);
            debug_assert_eq!(pg.osize as usize, osize);
            pg.nfree.store(0, Ordering::Relaxed);
            pg.has_young.store(true, Ordering::Relaxed);
            // follow the free-page chain threaded through the page's first
            // word
            v = unsafe { cur_page.load::<Address>() };
        }
        // Not an else: the chain may be exhausted too.
        if v.is_zero() {
            v = add_page(gc, tls, klass, osize);
        }
        next = v + osize;
    }
    unsafe { tls.heap_mut() }.pools[klass].newpages = next;
    value_of(v)
}

fn lookup_pool_page<'a, VM: VMBinding>(gc: &'a Riptide<VM>, addr: Address) -> &'a PageMeta {
    gc.pages
        .lookup(addr)
        .expect("pool cell has no page metadata")
}
