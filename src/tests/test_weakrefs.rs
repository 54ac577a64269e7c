use super::fixtures::*;
use crate::vm::VMBinding;

#[test]
fn weak_reference_to_dead_object_is_cleared() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let v = alloc(&m, 56, opaque_type(56));
    let wr = new_weakref(&m, v);
    gc.add_global_root(wr);

    collect(&m, CollectMode::Full);

    let value = unsafe { wr.slot(0).load::<Option<ObjectReference>>() };
    assert_eq!(value, Some(MockVM::nothing()));
}

#[test]
fn weak_reference_to_live_object_is_kept() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let v = alloc(&m, 56, opaque_type(56));
    gc.add_global_root(v);
    let wr = new_weakref(&m, v);
    gc.add_global_root(wr);

    collect(&m, CollectMode::Full);
    collect(&m, CollectMode::Full);

    let value = unsafe { wr.slot(0).load::<Option<ObjectReference>>() };
    assert_eq!(value, Some(v));
}

#[test]
fn a_weak_reference_does_not_keep_its_referent_alive() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    let v = alloc(&m, 2000, opaque_type(2000));
    let wr = new_weakref(&m, v);
    gc.add_global_root(wr);
    let live_with_v = {
        collect(&m, CollectMode::Full);
        live_bytes(gc)
    };
    // `v`'s page was reclaimed; only the weakref's page remains.
    assert!(live_with_v < 2000);
}

#[test]
fn dead_weak_references_leave_the_registry() {
    let gc = test_gc();
    let m = bind_mutator(gc);
    for _ in 0..10 {
        let v = alloc(&m, 56, opaque_type(56));
        new_weakref(&m, v);
    }
    assert_eq!(unsafe { m.state().heap_mut() }.weak_refs.len(), 10);

    collect(&m, CollectMode::Full);

    assert!(unsafe { m.state().heap_mut() }.weak_refs.is_empty());
}
