//! The page table: a three-level radix tree keyed by page address, mapping
//! every live pool page to its [`PageMeta`].
//!
//! Each level keeps an allocation bitmap (one bit per child) and an upper
//! bound hint so the sweep can skip unpopulated spans of the sparse address
//! space. Lookups are lock-free; inserts and removals serialize on a spin
//! lock, which is uncontended (inserts happen on the allocation slow path,
//! removals inside the world stop).

use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

use crate::heap::page::{PageMeta, LOG_PAGE_SZ, PAGE_SZ};
use crate::util::constants::LOG_MAPPABLE_BYTES;
use crate::util::{memory, Address};

const LOG_LEAF_ENTRIES: usize = 12;
const LEAF_ENTRIES: usize = 1 << LOG_LEAF_ENTRIES;
const LOG_MID_ENTRIES: usize = 12;
const MID_ENTRIES: usize = 1 << LOG_MID_ENTRIES;
const TOP_ENTRIES: usize = 1 << (LOG_MAPPABLE_BYTES - LOG_PAGE_SZ - LOG_MID_ENTRIES - LOG_LEAF_ENTRIES);

fn leaf_index(addr: Address) -> usize {
    (addr.as_usize() >> LOG_PAGE_SZ) & (LEAF_ENTRIES - 1)
}

fn mid_index(addr: Address) -> usize {
    (addr.as_usize() >> (LOG_PAGE_SZ + LOG_LEAF_ENTRIES)) & (MID_ENTRIES - 1)
}

fn top_index(addr: Address) -> usize {
    (addr.as_usize() >> (LOG_PAGE_SZ + LOG_LEAF_ENTRIES + LOG_MID_ENTRIES)) & (TOP_ENTRIES - 1)
}

struct PageTable0 {
    meta: [AtomicPtr<PageMeta>; LEAF_ENTRIES],
    allocmap: [AtomicU32; LEAF_ENTRIES / 32],
    ub: AtomicUsize,
}

struct PageTable1 {
    meta0: [AtomicPtr<PageTable0>; MID_ENTRIES],
    allocmap0: [AtomicU32; MID_ENTRIES / 32],
    ub: AtomicUsize,
}

impl PageTable0 {
    fn boxed() -> Box<Self> {
        Box::new(PageTable0 {
            meta: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
            allocmap: std::array::from_fn(|_| AtomicU32::new(0)),
            ub: AtomicUsize::new(0),
        })
    }
}

impl PageTable1 {
    fn boxed() -> Box<Self> {
        Box::new(PageTable1 {
            meta0: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
            allocmap0: std::array::from_fn(|_| AtomicU32::new(0)),
            ub: AtomicUsize::new(0),
        })
    }
}

/// The root of the radix. One per collector context.
pub struct PageTable {
    meta1: [AtomicPtr<PageTable1>; TOP_ENTRIES],
    allocmap1: [AtomicU32; TOP_ENTRIES / 32],
    ub: AtomicUsize,
    /// Serializes structural changes (insert/remove).
    grow_lock: Mutex<()>,
    /// Number of live pool pages, for logging.
    pub npages: AtomicUsize,
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    pub fn new() -> Self {
        PageTable {
            meta1: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
            allocmap1: std::array::from_fn(|_| AtomicU32::new(0)),
            ub: AtomicUsize::new(0),
            grow_lock: Mutex::new(()),
            npages: AtomicUsize::new(0),
        }
    }

    /// Obtain a fresh zeroed page from the OS and register its metadata.
    /// Returns `None` when the OS refuses to map more memory.
    pub fn alloc_page(&self, mut meta_for: impl FnMut(Address) -> PageMeta) -> Option<&PageMeta> {
        let data = memory::os_page_alloc(PAGE_SZ, PAGE_SZ);
        if data.is_zero() {
            return None;
        }
        let meta = Box::new(meta_for(data));
        Some(self.insert(meta))
    }

    /// Register page metadata. The page must not already be present.
    fn insert(&self, meta: Box<PageMeta>) -> &PageMeta {
        let page = meta.data;
        let _guard = self.grow_lock.lock();

        let ti = top_index(page);
        let mut t1 = self.meta1[ti].load(Ordering::Relaxed);
        if t1.is_null() {
            t1 = Box::into_raw(PageTable1::boxed());
            self.meta1[ti].store(t1, Ordering::Release);
        }
        let t1 = unsafe { &*t1 };

        let mi = mid_index(page);
        let mut t0 = t1.meta0[mi].load(Ordering::Relaxed);
        if t0.is_null() {
            t0 = Box::into_raw(PageTable0::boxed());
            t1.meta0[mi].store(t0, Ordering::Release);
        }
        let t0 = unsafe { &*t0 };

        let li = leaf_index(page);
        let ptr = Box::into_raw(meta);
        debug_assert!(t0.meta[li].load(Ordering::Relaxed).is_null());
        t0.meta[li].store(ptr, Ordering::Release);

        t0.allocmap[li / 32].fetch_or(1 << (li % 32), Ordering::Relaxed);
        t1.allocmap0[mi / 32].fetch_or(1 << (mi % 32), Ordering::Relaxed);
        self.allocmap1[ti / 32].fetch_or(1 << (ti % 32), Ordering::Relaxed);
        t0.ub.fetch_max(li / 32, Ordering::Relaxed);
        t1.ub.fetch_max(mi / 32, Ordering::Relaxed);
        self.ub.fetch_max(ti / 32, Ordering::Relaxed);
        self.npages.fetch_add(1, Ordering::Relaxed);

        unsafe { &*ptr }
    }

    /// Unregister a page and return its storage to the OS. Only called by
    /// the sweep, inside the world stop.
    pub fn free_page(&self, page: Address) {
        let _guard = self.grow_lock.lock();
        let t1 = self.meta1[top_index(page)].load(Ordering::Relaxed);
        debug_assert!(!t1.is_null());
        let t1 = unsafe { &*t1 };
        let t0 = t1.meta0[mid_index(page)].load(Ordering::Relaxed);
        debug_assert!(!t0.is_null());
        let t0 = unsafe { &*t0 };
        let li = leaf_index(page);
        let ptr = t0.meta[li].swap(std::ptr::null_mut(), Ordering::Relaxed);
        debug_assert!(!ptr.is_null());
        t0.allocmap[li / 32].fetch_and(!(1 << (li % 32)), Ordering::Relaxed);
        self.npages.fetch_sub(1, Ordering::Relaxed);
        drop(unsafe { Box::from_raw(ptr) });
        memory::os_page_free(page, PAGE_SZ);
    }

    /// Metadata for the pool page containing `addr`, if `addr` is inside
    /// one. Lock-free; used by the allocation fast path and the mark
    /// engine.
    pub fn lookup(&self, addr: Address) -> Option<&PageMeta> {
        let t1 = self.meta1[top_index(addr)].load(Ordering::Acquire);
        if t1.is_null() {
            return None;
        }
        let t0 = unsafe { &*t1 }.meta0[mid_index(addr)].load(Ordering::Acquire);
        if t0.is_null() {
            return None;
        }
        let meta = unsafe { &*t0 }.meta[leaf_index(addr)].load(Ordering::Acquire);
        if meta.is_null() {
            return None;
        }
        Some(unsafe { &*meta })
    }

    /// Visit every allocated page, releasing those for which `f` returns
    /// `false`. Maintains the allocation bitmaps and upper-bound hints.
    /// Must run inside the world stop.
    pub fn sweep_pages(&self, mut f: impl FnMut(&PageMeta) -> bool) {
        let mut top_ub = 0;
        for wi in 0..=self.ub.load(Ordering::Relaxed) {
            let mut line = self.allocmap1[wi].load(Ordering::Relaxed);
            let mut j = 0;
            while line != 0 {
                let skip = line.trailing_zeros() as usize;
                j += skip;
                line >>= skip;
                let t1 = self.meta1[wi * 32 + j].load(Ordering::Relaxed);
                if !t1.is_null() && !self.sweep_mid(unsafe { &*t1 }, &mut f) {
                    // no allocations found, remember that for next time
                    self.allocmap1[wi].fetch_and(!(1 << j), Ordering::Relaxed);
                }
                line >>= 1;
                j += 1;
            }
            if self.allocmap1[wi].load(Ordering::Relaxed) != 0 {
                top_ub = wi;
            }
        }
        self.ub.store(top_ub, Ordering::Relaxed);
    }

    fn sweep_mid(&self, t1: &PageTable1, f: &mut impl FnMut(&PageMeta) -> bool) -> bool {
        let mut any = false;
        let mut ub = 0;
        for wi in 0..=t1.ub.load(Ordering::Relaxed) {
            let mut line = t1.allocmap0[wi].load(Ordering::Relaxed);
            let mut j = 0;
            while line != 0 {
                let skip = line.trailing_zeros() as usize;
                j += skip;
                line >>= skip;
                let t0 = t1.meta0[wi * 32 + j].load(Ordering::Relaxed);
                if !t0.is_null() && !self.sweep_leaf(unsafe { &*t0 }, f) {
                    t1.allocmap0[wi].fetch_and(!(1 << j), Ordering::Relaxed);
                }
                line >>= 1;
                j += 1;
            }
            if t1.allocmap0[wi].load(Ordering::Relaxed) != 0 {
                ub = wi;
                any = true;
            }
        }
        t1.ub.store(ub, Ordering::Relaxed);
        any
    }

    fn sweep_leaf(&self, t0: &PageTable0, f: &mut impl FnMut(&PageMeta) -> bool) -> bool {
        let mut any = false;
        let mut ub = 0;
        for wi in 0..=t0.ub.load(Ordering::Relaxed) {
            let mut line = t0.allocmap[wi].load(Ordering::Relaxed);
            let mut j = 0;
            while line != 0 {
                let skip = line.trailing_zeros() as usize;
                j += skip;
                line >>= skip;
                let idx = wi * 32 + j;
                let ptr = t0.meta[idx].load(Ordering::Relaxed);
                debug_assert!(!ptr.is_null());
                if !f(unsafe { &*ptr }) {
                    let page = unsafe { &*ptr }.data;
                    t0.meta[idx].store(std::ptr::null_mut(), Ordering::Relaxed);
                    t0.allocmap[wi].fetch_and(!(1 << j), Ordering::Relaxed);
                    self.npages.fetch_sub(1, Ordering::Relaxed);
                    drop(unsafe { Box::from_raw(ptr) });
                    memory::os_page_free(page, PAGE_SZ);
                }
                line >>= 1;
                j += 1;
            }
            if t0.allocmap[wi].load(Ordering::Relaxed) != 0 {
                ub = wi;
                any = true;
            }
        }
        t0.ub.store(ub, Ordering::Relaxed);
        any
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        for t1 in self.meta1.iter() {
            let t1 = t1.load(Ordering::Relaxed);
            if t1.is_null() {
                continue;
            }
            let t1 = unsafe { Box::from_raw(t1) };
            for t0 in t1.meta0.iter() {
                let t0 = t0.load(Ordering::Relaxed);
                if t0.is_null() {
                    continue;
                }
                let t0 = unsafe { Box::from_raw(t0) };
                for meta in t0.meta.iter() {
                    let meta = meta.load(Ordering::Relaxed);
                    if !meta.is_null() {
                        let page = unsafe { &*meta }.data;
                        drop(unsafe { Box::from_raw(meta) });
                        memory::os_page_free(page, PAGE_SZ);
                    }
                }
            }
        }
    }
}
