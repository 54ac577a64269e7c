use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

use super::fixtures::*;
use crate::header::{self, GC_MARKED, GC_OLD_MARKED};

#[test]
fn collection_proceeds_while_other_threads_are_parked() {
    let gc = test_gc();
    let m = bind_mutator(gc);

    let (tx, rx) = mpsc::channel();
    let handle = std::thread::spawn(move || {
        let worker = bind_mutator(gc);
        for _ in 0..100 {
            alloc(&worker, 56, opaque_type(56));
        }
        // Park before handing control back, so the main thread can stop
        // the world without us.
        enter_gc_safe(&worker);
        tx.send(()).unwrap();
        // Stay parked until the process exits; the thread state remains
        // registered.
    });
    rx.recv().unwrap();

    collect(&m, CollectMode::Full);
    assert_eq!(num(gc).pause, 1);
    assert!(live_bytes(gc) < 4096);
    handle.join().unwrap();
}

#[test]
fn cross_generation_writes_from_two_threads() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let ty = ref_struct_type(1, &[0]);

    // Two old parents, one per worker.
    let parents: Vec<ObjectReference> = (0..2)
        .map(|_| {
            let a = alloc(&m, 8, ty);
            unsafe { a.slot(0).store(0usize) };
            gc.add_global_root(a);
            a
        })
        .collect();
    // Age them into the old generation.
    collect(&m, CollectMode::Full);
    collect(&m, CollectMode::Full);
    collect(&m, CollectMode::Auto);
    for a in &parents {
        assert_eq!(header::gc_bits(*a), GC_OLD_MARKED);
    }

    let (tx, rx) = mpsc::channel();
    let mut handles = Vec::new();
    for a in parents.iter().copied() {
        let tx = tx.clone();
        handles.push(std::thread::spawn(move || {
            let worker = bind_mutator(gc);
            let child = alloc(&worker, 24, opaque_type(24));
            unsafe { a.slot(0).store(child) };
            write_barrier(&worker, a, child);
            // The barrier queued the parent exactly once on this thread.
            let heap = unsafe { worker.state().heap_mut() };
            assert_eq!(heap.remset.iter().filter(|o| **o == a).count(), 1);
            assert_eq!(header::gc_bits(a), GC_MARKED);
            enter_gc_safe(&worker);
            tx.send((worker.state(), child)).unwrap();
        }));
    }
    drop(tx);
    let results: Vec<_> = rx.iter().collect();
    assert_eq!(results.len(), 2);

    let probes: Vec<_> = results
        .iter()
        .map(|(_, child)| probe(gc, &m, *child))
        .collect();

    // The next collection replays both thread-local remsets.
    collect(&m, CollectMode::Auto);
    for ((_, child), wr) in results.iter().zip(probes.iter()) {
        assert!(probe_alive(*wr, *child));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

static CROSS_FIN: AtomicUsize = AtomicUsize::new(0);

fn cross_fin(_addr: Address) {
    CROSS_FIN.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn finalize_drains_another_threads_list() {
    let gc = test_gc();
    let m = bind_mutator(gc);

    let (tx, rx) = mpsc::channel();
    let handle = std::thread::spawn(move || {
        let worker = bind_mutator(gc);
        let v = alloc(&worker, 56, opaque_type(56));
        add_ptr_finalizer(&worker, v, cross_fin);
        enter_gc_safe(&worker);
        tx.send((worker.state(), v)).unwrap();
    });
    let (worker_state, v) = rx.recv().unwrap();
    handle.join().unwrap();

    // Run the foreign thread's finalizer from here; the length protocol
    // keeps the pair from being lost or duplicated.
    finalize(&m, v);
    assert_eq!(CROSS_FIN.load(Ordering::SeqCst), 1);
    assert!(worker_state.finalizers.is_empty());

    finalize(&m, v);
    assert_eq!(CROSS_FIN.load(Ordering::SeqCst), 1);
}

#[test]
fn parked_threads_heaps_are_swept() {
    let gc = test_gc();
    let m = bind_mutator(gc);

    let (tx, rx) = mpsc::channel();
    let handle = std::thread::spawn(move || {
        let worker = bind_mutator(gc);
        let keep = alloc(&worker, 56, opaque_type(56));
        gc.add_global_root(keep);
        for _ in 0..500 {
            alloc(&worker, 56, opaque_type(56));
        }
        enter_gc_safe(&worker);
        tx.send(keep).unwrap();
    });
    let keep = rx.recv().unwrap();
    handle.join().unwrap();

    let wr = probe(gc, &m, keep);
    collect(&m, CollectMode::Full);

    // The worker's garbage is gone, its rooted object is not.
    assert!(probe_alive(wr, keep));
    assert!(live_bytes(gc) < 8192);
}
