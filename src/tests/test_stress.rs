use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::fixtures::*;
use crate::header::{self, GC_CLEAN, GC_MARKED, GC_OLD, GC_OLD_MARKED};

/// Churn a randomized object graph through repeated quick and full
/// collections. Every object reachable from the rooted table must keep a
/// valid header afterwards; a prematurely freed cell would expose its
/// free-list link word instead of the type tag.
#[test]
fn randomized_graph_churn_survives_collections() {
    const SLOTS: usize = 64;
    let gc = test_gc();
    let m = bind_mutator(gc);
    let mut rng = StdRng::seed_from_u64(0x0c0ffee);
    let ty = ref_struct_type(4, &[0, 1, 2, 3]);

    let table = make_ref_array(&m, SLOTS);
    gc.add_global_root(table);

    for round in 0..16 {
        for _ in 0..200 {
            let obj = alloc(&m, 32, ty);
            for i in 0..4 {
                unsafe { obj.slot(i).store(0usize) };
            }
            let slot = table.slot(1 + rng.random_range(0..SLOTS));
            let existing = unsafe { slot.load::<Option<ObjectReference>>() };
            if let Some(prev) = existing {
                if rng.random_bool(0.5) {
                    // Chain to the object being displaced so a random
                    // prefix of history stays reachable.
                    unsafe { obj.slot(0).store(prev) };
                }
            }
            unsafe { slot.store(obj) };
            write_barrier(&m, table, obj);
        }

        collect(
            &m,
            if round % 4 == 0 {
                CollectMode::Full
            } else {
                CollectMode::Auto
            },
        );

        // Validate everything reachable from the table.
        let mut visited = 0usize;
        for i in 0..SLOTS {
            let mut cur = unsafe { table.slot(1 + i).load::<Option<ObjectReference>>() };
            while let Some(obj) = cur {
                let bits = header::gc_bits(obj);
                assert!(
                    bits == GC_CLEAN || bits == GC_MARKED || bits == GC_OLD || bits == GC_OLD_MARKED
                );
                assert_eq!(
                    header::type_tag(obj),
                    ty,
                    "reachable object was reclaimed or rewritten"
                );
                visited += 1;
                assert!(visited < 1_000_000, "graph walk runaway");
                cur = unsafe { obj.slot(0).load::<Option<ObjectReference>>() };
            }
        }
        assert!(visited > 0);
    }
}
