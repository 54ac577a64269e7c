use super::fixtures::*;
use crate::header;
use crate::heap::pool::{MAX_SZCLASS, SIZE_CLASSES};
use crate::util::constants::BYTES_IN_WORD;

#[test]
fn pool_and_big_boundary() {
    let gc = test_gc();
    let m = bind_mutator(gc);

    // Exactly MAX_SZCLASS bytes must use the pool path.
    let small = alloc(&m, MAX_SZCLASS, opaque_type(MAX_SZCLASS));
    assert!(gc.pages.lookup(small.to_raw_address()).is_some());

    // One byte more must use the big path.
    let big = alloc(&m, MAX_SZCLASS + 1, opaque_type(MAX_SZCLASS + 1));
    assert!(gc.pages.lookup(big.to_raw_address()).is_none());

    let n = num(gc);
    assert!(n.poolalloc >= 1);
    assert_eq!(n.bigalloc, 1);
}

#[test]
fn header_is_installed_clean() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let ty = opaque_type(24);
    let obj = alloc(&m, 24, ty);
    assert_eq!(header::gc_bits(obj), header::GC_CLEAN);
    assert_eq!(header::type_tag(obj), ty);
}

#[test]
fn payloads_are_heap_aligned_and_writable() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    for size in [0usize, 8, 56, 120, 1000, MAX_SZCLASS, MAX_SZCLASS + 1, 1 << 20] {
        let obj = alloc(&m, size, opaque_type(size));
        assert!(obj.to_raw_address().is_aligned_to(BYTES_IN_WORD));
        // The payload must be usable end to end.
        let words = size / BYTES_IN_WORD;
        for i in 0..words {
            unsafe { obj.slot(i).store(0xa5a5_0000 + i) };
        }
        for i in 0..words {
            assert_eq!(unsafe { obj.slot(i).load::<usize>() }, 0xa5a5_0000 + i);
        }
    }
}

#[test]
fn same_class_allocations_share_a_page() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let a = alloc(&m, 56, opaque_type(56));
    let b = alloc(&m, 56, opaque_type(56));
    let pg_a = gc.pages.lookup(a.to_raw_address()).unwrap();
    let pg_b = gc.pages.lookup(b.to_raw_address()).unwrap();
    assert_eq!(pg_a.data, pg_b.data);
    assert_eq!(pg_a.osize as usize, 64);
    // Consecutive bump allocations are adjacent cells.
    assert_eq!(
        b.to_raw_address().as_usize() - a.to_raw_address().as_usize(),
        64
    );
}

#[test]
fn allocation_counters_accumulate() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let before = num(gc);
    for _ in 0..10 {
        alloc(&m, 56, opaque_type(56));
    }
    let after = num(gc);
    assert_eq!(after.poolalloc - before.poolalloc, 10);
    assert_eq!(after.allocd - before.allocd, 10 * 64);
}

#[test]
fn counted_malloc_round_trip() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let p = counted_malloc(&m, 100);
    assert!(!p.is_zero());
    unsafe { p.store(42u64) };
    let p = counted_realloc(&m, p, 100, 200);
    assert_eq!(unsafe { p.load::<u64>() }, 42);
    counted_free_with_size(&m, p, 200);
    let n = num(gc);
    assert_eq!(n.malloc, 1);
    assert_eq!(n.realloc, 1);
    assert_eq!(n.freecall, 1);
    assert!(n.freed >= 200);
}

#[test]
fn size_class_capacities_fill_whole_pages() {
    // Every class must fit at least one object per page, and the largest
    // class still packs several.
    for osize in SIZE_CLASSES {
        assert!(crate::heap::page::PageMeta::capacity_for(osize) >= 8);
    }
}
