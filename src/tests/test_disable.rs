use super::fixtures::*;

fn small_interval_gc() -> &'static Riptide<MockVM> {
    let mut options = test_options();
    options.collect_interval = 64 * 1024;
    test_gc_with(options)
}

#[test]
fn disabled_gc_defers_allocation_accounting() {
    let gc = small_interval_gc();
    let m = bind_mutator(gc);

    assert!(enable(&m, false));
    assert!(!is_enabled(&m));

    // Allocate well past the collect interval; every would-be collection
    // must defer instead.
    for _ in 0..256 {
        alloc(&m, 1016, opaque_type(1016));
    }
    let n = num(gc);
    assert_eq!(n.pause, 0, "no collection while disabled");
    assert!(n.deferred_alloc > 0);

    // Re-enabling drains the deferred count into the trigger accounting.
    assert!(!enable(&m, true));
    let n = num(gc);
    assert_eq!(n.deferred_alloc, 0);
    assert!(n.allocd >= 200 * 1024);

    // The next allocations trigger a real collection again.
    for _ in 0..256 {
        alloc(&m, 1016, opaque_type(1016));
    }
    assert!(num(gc).pause >= 1);
}

#[test]
fn toggling_without_allocation_preserves_accounting() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    alloc(&m, 56, opaque_type(56));

    let before = {
        let n = num(gc);
        n.allocd + n.deferred_alloc
    };
    enable(&m, false);
    enable(&m, true);
    let after = {
        let n = num(gc);
        n.allocd + n.deferred_alloc
    };
    assert_eq!(before, after);
}

#[test]
fn explicit_collect_with_disabled_gc_is_a_deferral() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    for _ in 0..10 {
        alloc(&m, 56, opaque_type(56));
    }
    enable(&m, false);
    collect(&m, CollectMode::Full);
    let n = num(gc);
    assert_eq!(n.pause, 0);
    assert_eq!(n.deferred_alloc, 10 * 64);
    enable(&m, true);
}

#[test]
fn nested_disable_requires_matching_enables() {
    let gc = test_gc();
    let m1 = bind_mutator(gc);
    let m2 = bind_mutator(gc);

    enable(&m1, false);
    enable(&m2, false);
    // m1 re-enables, but m2 still holds the collector disabled.
    enable(&m1, true);
    collect(&m1, CollectMode::Full);
    assert_eq!(num(gc).pause, 0);

    enable(&m2, true);
    // m2 shares this OS thread, so park it before m1 stops the world.
    enter_gc_safe(&m2);
    collect(&m1, CollectMode::Full);
    assert_eq!(num(gc).pause, 1);
    leave_gc_safe(&m2);
}
