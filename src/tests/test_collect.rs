use std::sync::atomic::Ordering;

use super::fixtures::*;
use crate::header;

#[test]
fn full_collect_frees_unrooted_pool_objects() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    for _ in 0..1000 {
        alloc(&m, 56, opaque_type(56));
    }
    assert!(gc.pages.npages.load(Ordering::Relaxed) >= 4);

    collect(&m, CollectMode::Full);

    // A full sweep returns every empty page to the OS.
    assert_eq!(gc.pages.npages.load(Ordering::Relaxed), 0);
    assert!(live_bytes(gc) < 16 * 1024);
}

#[test]
fn quick_collect_retains_a_budget_of_empty_pages() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    for _ in 0..1000 {
        alloc(&m, 56, opaque_type(56));
    }
    let before = gc.pages.npages.load(Ordering::Relaxed);
    assert!(before >= 4);

    collect(&m, CollectMode::Auto);

    // Up to the lazy budget of pages stays reset on the allocation list.
    let after = gc.pages.npages.load(Ordering::Relaxed);
    assert!(after >= 1 && after <= gc.options.lazy_page_budget + 1);
    // The retained pages are immediately reusable without a fresh mmap.
    for _ in 0..200 {
        alloc(&m, 56, opaque_type(56));
    }
    assert_eq!(gc.pages.npages.load(Ordering::Relaxed), after.max(1));
}

#[test]
fn rooted_objects_survive_collection() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let ty = ref_struct_type(2, &[0, 1]);
    let a = alloc(&m, 16, ty);
    let b = alloc(&m, 56, opaque_type(56));
    unsafe {
        a.slot(0).store(b);
        a.slot(1).store(0usize);
    }
    gc.add_global_root(a);
    let wr_b = probe(gc, &m, b);

    collect(&m, CollectMode::Full);

    assert!(probe_alive(wr_b, b));
    assert_eq!(header::gc_bits(a), header::GC_CLEAN);
    assert_eq!(header::gc_bits(b), header::GC_CLEAN);
    assert!(gc.pages.lookup(a.to_raw_address()).is_some());
}

#[test]
fn ref_array_children_are_traced() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let arr = make_ref_array(&m, 50);
    let mut children = Vec::new();
    for i in 0..50 {
        let c = alloc(&m, 24, opaque_type(24));
        unsafe { arr.slot(1 + i).store(c) };
        children.push(c);
    }
    gc.add_global_root(arr);
    let probes: Vec<_> = children.iter().map(|c| probe(gc, &m, *c)).collect();

    collect(&m, CollectMode::Full);
    collect(&m, CollectMode::Full);

    for (wr, c) in probes.iter().zip(children.iter()) {
        assert!(probe_alive(*wr, *c));
    }
}

#[test]
fn deep_chain_does_not_overflow() {
    // A long singly-linked chain exercises the explicit work stack.
    let gc = test_gc();
    let m = bind_mutator(gc);
    let ty = ref_struct_type(1, &[0]);
    let mut head = alloc(&m, 8, ty);
    unsafe { head.slot(0).store(0usize) };
    for _ in 0..100_000 {
        let next = alloc(&m, 8, ty);
        unsafe { next.slot(0).store(head) };
        head = next;
    }
    gc.add_global_root(head);
    let tail_probe = probe(gc, &m, {
        // find the tail again by walking
        let mut cur = head;
        loop {
            match unsafe { cur.slot(0).load::<Option<ObjectReference>>() } {
                Some(next) => cur = next,
                None => break cur,
            }
        }
    });

    collect(&m, CollectMode::Full);

    let mut cur = head;
    let mut count = 0usize;
    while let Some(next) = unsafe { cur.slot(0).load::<Option<ObjectReference>>() } {
        cur = next;
        count += 1;
    }
    assert_eq!(count, 100_000);
    assert!(probe_alive(tail_probe, cur));
}

#[test]
fn second_full_collection_frees_nothing() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let arr = make_ref_array(&m, 100);
    for i in 0..100 {
        let c = alloc(&m, 56, opaque_type(56));
        unsafe { arr.slot(1 + i).store(c) };
    }
    gc.add_global_root(arr);

    collect(&m, CollectMode::Full);
    let live_after_first = live_bytes(gc);
    collect(&m, CollectMode::Full);
    let live_after_second = live_bytes(gc);

    assert_eq!(live_after_first, live_after_second);
}

#[test]
fn collect_is_reentrant_from_unrooted_heap() {
    // Collecting twice in a row with garbage in between keeps working.
    let gc = test_gc();
    let m = bind_mutator(gc);
    for round in 0..5 {
        for _ in 0..100 {
            alloc(&m, 120, opaque_type(120));
        }
        collect(
            &m,
            if round % 2 == 0 {
                CollectMode::Full
            } else {
                CollectMode::Auto
            },
        );
    }
    let n = num(gc);
    assert!(n.pause >= 5);
}
