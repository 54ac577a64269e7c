//! In-crate scenario tests driven by the mock binding.

mod fixtures {
    pub use crate::memory_manager::*;
    pub use crate::util::options::Options;
    pub use crate::util::{Address, ObjectReference};
    pub use crate::vm::mock::*;
    pub use crate::{CollectMode, Mutator, Riptide};

    /// Options that never trigger an automatic collection, so tests
    /// control liveness precisely through explicit roots and collects.
    pub fn test_options() -> Options {
        Options {
            collect_interval: 256 * 1024 * 1024,
            max_collect_interval: 1 << 30,
            max_total_memory: 1 << 42,
            total_memory: 1 << 33,
            always_full: false,
            lazy_page_budget: 2,
        }
    }

    pub fn test_gc() -> &'static Riptide<MockVM> {
        Box::leak(gc_init::<MockVM>(test_options()))
    }

    pub fn test_gc_with(options: Options) -> &'static Riptide<MockVM> {
        Box::leak(gc_init::<MockVM>(options))
    }

    /// A weak probe for an object's liveness across collections.
    pub fn probe(gc: &'static Riptide<MockVM>, m: &Mutator<MockVM>, obj: ObjectReference) -> ObjectReference {
        let wr = new_weakref(m, obj);
        gc.add_global_root(wr);
        wr
    }

    pub fn probe_alive(wr: ObjectReference, obj: ObjectReference) -> bool {
        (unsafe { wr.slot(0).load::<Option<ObjectReference>>() }) == Some(obj)
    }
}

mod test_alloc;
mod test_callbacks;
mod test_collect;
mod test_disable;
mod test_finalizers;
mod test_generations;
mod test_stats;
mod test_stress;
mod test_threads;
mod test_weakrefs;
