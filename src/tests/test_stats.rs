use super::fixtures::*;

#[test]
fn total_bytes_grows_with_allocation() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let t0 = total_bytes(gc);
    for _ in 0..100 {
        alloc(&m, 56, opaque_type(56));
    }
    let t1 = total_bytes(gc);
    assert_eq!(t1 - t0, 100 * 64);

    // Collection moves the numbers around but never loses them.
    collect(&m, CollectMode::Full);
    assert!(total_bytes(gc) >= t1);
}

#[test]
fn diff_total_bytes_is_zero_without_allocation() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    alloc(&m, 56, opaque_type(56));
    let _first = diff_total_bytes(gc);
    assert_eq!(diff_total_bytes(gc), 0);
    alloc(&m, 56, opaque_type(56));
    assert_eq!(diff_total_bytes(gc), 64);
}

#[test]
fn pause_statistics_accumulate_and_reset() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    alloc(&m, 56, opaque_type(56));
    collect(&m, CollectMode::Full);

    let n = num(gc);
    assert_eq!(n.pause, 1);
    assert_eq!(n.full_sweep, 1);
    assert!(n.max_pause > 0);
    assert!(n.total_time >= n.max_pause);
    assert!(total_hrtime(gc) == n.total_time);
    assert!(n.total_mark_time > 0);
    assert!(n.total_sweep_time > 0);

    reset_stats(gc);
    let n = num(gc);
    assert_eq!(n.max_pause, 0);
    assert_eq!(n.max_time_to_safepoint, 0);
    // Totals are not touched by a stats reset.
    assert!(n.total_time > 0);
    assert_eq!(n.pause, 1);
}

#[test]
fn live_bytes_tracks_the_rooted_set() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let keep = alloc(&m, 2024, opaque_type(2024));
    gc.add_global_root(keep);
    for _ in 0..50 {
        alloc(&m, 2024, opaque_type(2024));
    }
    collect(&m, CollectMode::Full);
    let live = live_bytes(gc);
    // One object of the 51 survives.
    assert!(live >= 2032 && live < 10 * 2032, "live was {live}");
}

#[test]
fn set_max_memory_rejects_zero() {
    let gc = test_gc();
    let before = gc.max_total_memory.load(std::sync::atomic::Ordering::Relaxed);
    set_max_memory(gc, 0);
    assert_eq!(
        gc.max_total_memory.load(std::sync::atomic::Ordering::Relaxed),
        before
    );
    set_max_memory(gc, 1 << 30);
    assert_eq!(
        gc.max_total_memory.load(std::sync::atomic::Ordering::Relaxed),
        1 << 30
    );
}
