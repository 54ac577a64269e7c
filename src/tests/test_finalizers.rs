use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::fixtures::*;
use crate::util::Address;

static RAN_ONCE: AtomicUsize = AtomicUsize::new(0);

fn count_once(_obj: ObjectReference) {
    RAN_ONCE.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn finalizer_runs_exactly_once_then_object_dies() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let v = alloc(&m, 56, opaque_type(56));
    let f = make_callable(&m, count_once);
    gc.add_global_root(f);
    add_finalizer(&m, v, f);
    let wr = probe(gc, &m, v);

    // First collection finds `v` unreachable, keeps it for finalization
    // and runs the finalizer after the world resumes. Weak references to
    // it are cleared before the resurrection pass.
    collect(&m, CollectMode::Full);
    assert_eq!(RAN_ONCE.load(Ordering::SeqCst), 1);
    assert!(!probe_alive(wr, v));

    // The second collection reclaims it without running anything.
    collect(&m, CollectMode::Full);
    assert_eq!(RAN_ONCE.load(Ordering::SeqCst), 1);
    assert!(!probe_alive(wr, v));
}

static ORDER: Mutex<Vec<u8>> = Mutex::new(Vec::new());

fn order_a(_obj: ObjectReference) {
    ORDER.lock().unwrap().push(b'a');
}

fn order_b(_obj: ObjectReference) {
    ORDER.lock().unwrap().push(b'b');
}

#[test]
fn finalizers_run_in_reverse_registration_order() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let v = alloc(&m, 56, opaque_type(56));
    let fa = make_callable(&m, order_a);
    let fb = make_callable(&m, order_b);
    gc.add_global_root(fa);
    gc.add_global_root(fb);
    add_finalizer(&m, v, fa);
    add_finalizer(&m, v, fb);

    collect(&m, CollectMode::Full);
    assert_eq!(*ORDER.lock().unwrap(), vec![b'b', b'a']);
}

static PTR_FIN: AtomicUsize = AtomicUsize::new(0);

fn ptr_fin(addr: Address) {
    assert!(!addr.is_zero());
    PTR_FIN.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn pointer_finalizers_are_called_directly() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let v = alloc(&m, 56, opaque_type(56));
    add_ptr_finalizer(&m, v, ptr_fin);

    collect(&m, CollectMode::Full);
    assert_eq!(PTR_FIN.load(Ordering::SeqCst), 1);
}

static QUIESCENT: AtomicUsize = AtomicUsize::new(0);

fn quiescent_fin(slot: Address) {
    assert_eq!(slot, Address::from_usize(0x1234_5670));
    QUIESCENT.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn quiescent_entries_run_at_the_next_collection() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    add_quiescent(&m, Address::from_usize(0x1234_5670), quiescent_fin);
    assert_eq!(QUIESCENT.load(Ordering::SeqCst), 0);
    collect(&m, CollectMode::Full);
    assert_eq!(QUIESCENT.load(Ordering::SeqCst), 1);
    collect(&m, CollectMode::Full);
    assert_eq!(QUIESCENT.load(Ordering::SeqCst), 1);
}

static EAGER: AtomicUsize = AtomicUsize::new(0);

fn eager_fin(_obj: ObjectReference) {
    EAGER.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn finalize_runs_eagerly_and_deregisters() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let v = alloc(&m, 56, opaque_type(56));
    gc.add_global_root(v);
    let f = make_callable(&m, eager_fin);
    gc.add_global_root(f);
    add_finalizer(&m, v, f);
    add_finalizer(&m, v, f);

    finalize(&m, v);
    assert_eq!(EAGER.load(Ordering::SeqCst), 2);
    assert!(m.state().finalizers.is_empty());

    // Nothing left to run at the next collection.
    gc.remove_global_root(v);
    collect(&m, CollectMode::Full);
    assert_eq!(EAGER.load(Ordering::SeqCst), 2);
}

static INHIBITED: AtomicUsize = AtomicUsize::new(0);

fn inhibited_fin(_obj: ObjectReference) {
    INHIBITED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn inhibition_defers_finalizers_until_reenabled() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let v = alloc(&m, 56, opaque_type(56));
    let f = make_callable(&m, inhibited_fin);
    gc.add_global_root(f);
    add_finalizer(&m, v, f);

    disable_finalizers_internal(&m);
    collect(&m, CollectMode::Full);
    // Scheduled but not run.
    assert_eq!(INHIBITED.load(Ordering::SeqCst), 0);

    enable_finalizers_internal(&m);
    assert_eq!(INHIBITED.load(Ordering::SeqCst), 1);
}

#[test]
fn unbalanced_enable_is_refused() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    // Enabling when never disabled must be refused, not underflow.
    enable_finalizers(&m, true);
    assert_eq!(get_finalizers_inhibited(&m), 0);
    // And the counter still balances afterwards.
    enable_finalizers(&m, false);
    enable_finalizers(&m, false);
    assert_eq!(get_finalizers_inhibited(&m), 2);
    enable_finalizers(&m, true);
    enable_finalizers(&m, true);
    assert_eq!(get_finalizers_inhibited(&m), 0);
}

static CHAINED: AtomicUsize = AtomicUsize::new(0);
static CHAIN_MUTATOR: AtomicUsize = AtomicUsize::new(0);

fn chained_fin(_obj: ObjectReference) {
    CHAINED.fetch_add(1, Ordering::SeqCst);
}

fn chaining_fin(_obj: ObjectReference) {
    // Register a new finalizer from inside a finalizer; it must wait for
    // the next cycle.
    let m = unsafe { &*(CHAIN_MUTATOR.load(Ordering::SeqCst) as *const Mutator<MockVM>) };
    let w = alloc(m, 24, opaque_type(24));
    let f = make_callable(m, chained_fin);
    m.gc.add_global_root(f);
    add_finalizer(m, w, f);
}

#[test]
fn finalizer_registered_during_finalization_waits_a_cycle() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    CHAIN_MUTATOR.store(&m as *const Mutator<MockVM> as usize, Ordering::SeqCst);

    let v = alloc(&m, 56, opaque_type(56));
    let f = make_callable(&m, chaining_fin);
    gc.add_global_root(f);
    add_finalizer(&m, v, f);

    collect(&m, CollectMode::Full);
    // The outer finalizer ran, the inner one is only registered.
    assert_eq!(CHAINED.load(Ordering::SeqCst), 0);

    collect(&m, CollectMode::Full);
    assert_eq!(CHAINED.load(Ordering::SeqCst), 1);
}

static SHUTDOWN: AtomicUsize = AtomicUsize::new(0);

fn shutdown_fin(_obj: ObjectReference) {
    SHUTDOWN.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn run_all_finalizers_drains_every_list() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let f = make_callable(&m, shutdown_fin);
    gc.add_global_root(f);
    for _ in 0..3 {
        let v = alloc(&m, 56, opaque_type(56));
        gc.add_global_root(v);
        add_finalizer(&m, v, f);
    }

    run_all_finalizers(&m);
    assert_eq!(SHUTDOWN.load(Ordering::SeqCst), 3);
    assert!(m.state().finalizers.is_empty());
}

static PANICKY: AtomicUsize = AtomicUsize::new(0);

fn panicking_fin(_obj: ObjectReference) {
    PANICKY.fetch_add(1, Ordering::SeqCst);
    panic!("finalizer fault");
}

fn after_panic_fin(_obj: ObjectReference) {
    PANICKY.fetch_add(100, Ordering::SeqCst);
}

#[test]
fn a_faulting_finalizer_does_not_stop_the_rest() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let v = alloc(&m, 56, opaque_type(56));
    let f_after = make_callable(&m, after_panic_fin);
    let f_bad = make_callable(&m, panicking_fin);
    gc.add_global_root(f_after);
    gc.add_global_root(f_bad);
    // Registered second, the faulting finalizer runs first.
    add_finalizer(&m, v, f_after);
    add_finalizer(&m, v, f_bad);

    collect(&m, CollectMode::Full);
    assert_eq!(PANICKY.load(Ordering::SeqCst), 101);
}
