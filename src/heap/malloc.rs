//! Counted and managed malloc: off-heap buffers whose size is charged to
//! the collector's accounting, and tracking of arrays with malloc'd
//! storage so the sweep can reclaim them.

use atomic::Ordering;

use crate::controller;
use crate::header::{self, GC_OLD_MARKED};
use crate::riptide::Riptide;
use crate::thread::ThreadState;
use crate::util::constants::CACHE_BYTE_ALIGNMENT;
use crate::util::{memory, Address, ObjectReference};
use crate::vm::{AllocationError, VMBinding};

/// `malloc` with the size charged against the thread's allocation counter
/// (and therefore against the collect interval).
pub(crate) fn counted_malloc<VM: VMBinding>(
    gc: &Riptide<VM>,
    tls: &ThreadState<VM>,
    sz: usize,
) -> Address {
    controller::maybe_collect(gc, tls);
    tls.gc_num.allocd.fetch_add(sz as i64, Ordering::Relaxed);
    tls.gc_num.malloc.fetch_add(1, Ordering::Relaxed);
    Address::from_ptr(unsafe { libc::malloc(sz.max(1)) } as *const u8)
}

/// `calloc` with collector accounting.
pub(crate) fn counted_calloc<VM: VMBinding>(
    gc: &Riptide<VM>,
    tls: &ThreadState<VM>,
    nm: usize,
    sz: usize,
) -> Address {
    controller::maybe_collect(gc, tls);
    tls.gc_num
        .allocd
        .fetch_add(nm.saturating_mul(sz) as i64, Ordering::Relaxed);
    tls.gc_num.malloc.fetch_add(1, Ordering::Relaxed);
    Address::from_ptr(unsafe { libc::calloc(nm.max(1), sz.max(1)) } as *const u8)
}

/// `realloc` with collector accounting of the size delta.
pub(crate) fn counted_realloc<VM: VMBinding>(
    gc: &Riptide<VM>,
    tls: &ThreadState<VM>,
    p: Address,
    old: usize,
    sz: usize,
) -> Address {
    controller::maybe_collect(gc, tls);
    if sz < old {
        tls.gc_num
            .freed
            .fetch_add((old - sz) as i64, Ordering::Relaxed);
    } else {
        tls.gc_num
            .allocd
            .fetch_add((sz - old) as i64, Ordering::Relaxed);
    }
    tls.gc_num.realloc.fetch_add(1, Ordering::Relaxed);
    Address::from_ptr(unsafe { libc::realloc(p.to_mut_ptr(), sz.max(1)) } as *const u8)
}

/// `free` for buffers allocated through the counted entry points; `sz` is
/// credited back to the thread's counters.
pub(crate) fn counted_free_with_size<VM: VMBinding>(tls: &ThreadState<VM>, p: Address, sz: usize) {
    unsafe { libc::free(p.to_mut_ptr()) };
    tls.gc_num.freed.fetch_add(sz as i64, Ordering::Relaxed);
    tls.gc_num.freecall.fetch_add(1, Ordering::Relaxed);
}

/// Cache-aligned allocation for array storage, counted like a managed
/// allocation. Failures raise the host OOM condition.
pub(crate) fn managed_malloc<VM: VMBinding>(
    gc: &Riptide<VM>,
    tls: &ThreadState<VM>,
    sz: usize,
) -> Address {
    controller::maybe_collect(gc, tls);
    let allocsz = match sz.checked_add(CACHE_BYTE_ALIGNMENT - 1) {
        Some(s) => s & !(CACHE_BYTE_ALIGNMENT - 1),
        None => VM::out_of_memory(AllocationError::HeapOutOfMemory),
    };
    tls.gc_num
        .allocd
        .fetch_add(allocsz as i64, Ordering::Relaxed);
    tls.gc_num.malloc.fetch_add(1, Ordering::Relaxed);
    let b = memory::malloc_cache_align(allocsz);
    if b.is_zero() {
        VM::out_of_memory(AllocationError::HeapOutOfMemory);
    }
    b
}

/// Resize array storage. When the owning array is already old and marked,
/// the growth is accounted as promoted live data rather than fresh
/// allocation, so a resize does not drag the next collection forward.
pub(crate) fn managed_realloc<VM: VMBinding>(
    gc: &Riptide<VM>,
    tls: &ThreadState<VM>,
    d: Address,
    sz: usize,
    oldsz: usize,
    owner: ObjectReference,
) -> Address {
    // don't want a collection in the middle of moving the buffer
    controller::maybe_collect(gc, tls);
    let allocsz = match sz.checked_add(CACHE_BYTE_ALIGNMENT - 1) {
        Some(s) => s & !(CACHE_BYTE_ALIGNMENT - 1),
        None => VM::out_of_memory(AllocationError::HeapOutOfMemory),
    };
    if header::gc_bits(owner) == GC_OLD_MARKED {
        let cache = unsafe { tls.cache_mut() };
        cache.perm_scanned_bytes += allocsz as i64 - oldsz as i64;
        gc.add_live_bytes(allocsz as i64 - oldsz as i64);
    } else if allocsz < oldsz {
        tls.gc_num
            .freed
            .fetch_add((oldsz - allocsz) as i64, Ordering::Relaxed);
    } else {
        tls.gc_num
            .allocd
            .fetch_add((allocsz - oldsz) as i64, Ordering::Relaxed);
    }
    tls.gc_num.realloc.fetch_add(1, Ordering::Relaxed);
    let b = memory::realloc_aligned(d, allocsz, oldsz, CACHE_BYTE_ALIGNMENT);
    if b.is_zero() {
        VM::out_of_memory(AllocationError::HeapOutOfMemory);
    }
    b
}

/// Register an array whose storage came from malloc so the sweep can free
/// the buffer once the array dies. Not a GC safe point.
pub(crate) fn track_malloced_array<VM: VMBinding>(tls: &ThreadState<VM>, a: ObjectReference) {
    let heap = unsafe { tls.heap_mut() };
    heap.mallocarrays.push(a);
}
