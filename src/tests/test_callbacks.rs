use std::sync::atomic::{AtomicUsize, Ordering};

use super::fixtures::*;
use crate::mark::Marker;

static PRE: AtomicUsize = AtomicUsize::new(0);
static POST: AtomicUsize = AtomicUsize::new(0);

fn pre_cb(_mode: CollectMode) {
    PRE.fetch_add(1, Ordering::SeqCst);
}

fn post_cb(_mode: CollectMode) {
    POST.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn pre_and_post_callbacks_fire_once_per_collection() {
    let gc = test_gc();
    let m = bind_mutator(gc);

    // Registration is idempotent: a double register fires once.
    set_gc_pre_callback(gc, pre_cb, true);
    set_gc_pre_callback(gc, pre_cb, true);
    set_gc_post_callback(gc, post_cb, true);

    collect(&m, CollectMode::Full);
    assert_eq!(PRE.load(Ordering::SeqCst), 1);
    assert_eq!(POST.load(Ordering::SeqCst), 1);

    // Deregistering stops the callback; deregistering again is a no-op.
    set_gc_pre_callback(gc, pre_cb, false);
    set_gc_pre_callback(gc, pre_cb, false);
    collect(&m, CollectMode::Full);
    assert_eq!(PRE.load(Ordering::SeqCst), 1);
    assert_eq!(POST.load(Ordering::SeqCst), 2);
}

static SCANNER_ROOT: AtomicUsize = AtomicUsize::new(0);

fn scan_extra_root(marker: &mut Marker<'_, MockVM>, _mode: CollectMode) {
    if let Some(obj) =
        ObjectReference::from_raw_address(Address::from_usize(SCANNER_ROOT.load(Ordering::SeqCst)))
    {
        marker.queue_obj(obj);
    }
}

#[test]
fn root_scanner_keeps_objects_alive() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    set_gc_root_scanner(gc, scan_extra_root, true);

    let v = alloc(&m, 56, opaque_type(56));
    SCANNER_ROOT.store(v.to_raw_address().as_usize(), Ordering::SeqCst);
    let wr = probe(gc, &m, v);

    collect(&m, CollectMode::Full);
    assert!(probe_alive(wr, v));

    // Dropping the scanner root lets the object die.
    SCANNER_ROOT.store(0, Ordering::SeqCst);
    collect(&m, CollectMode::Full);
    assert!(!probe_alive(wr, v));

    set_gc_root_scanner(gc, scan_extra_root, false);
}

static EXT_ALLOC: AtomicUsize = AtomicUsize::new(0);
static EXT_FREE: AtomicUsize = AtomicUsize::new(0);

fn on_external_alloc(_ptr: Address, size: usize) {
    EXT_ALLOC.fetch_add(size, Ordering::SeqCst);
}

fn on_external_free(_ptr: Address) {
    EXT_FREE.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn external_alloc_callbacks_observe_big_objects() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    set_gc_notify_external_alloc(gc, on_external_alloc, true);
    set_gc_notify_external_free(gc, on_external_free, true);

    let _big = alloc(&m, 1 << 16, opaque_type(1 << 16));
    assert!(EXT_ALLOC.load(Ordering::SeqCst) >= 1 << 16);

    // The big object dies at the next collection and is reported freed.
    collect(&m, CollectMode::Full);
    assert_eq!(EXT_FREE.load(Ordering::SeqCst), 1);
}
