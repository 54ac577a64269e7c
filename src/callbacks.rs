//! Callback chains the runtime can hook into collection phases.
//!
//! Registration is idempotent and order-preserving; callbacks fire in
//! registration order during the corresponding phase. The chains are read
//! on hot collector paths and written rarely, so they sit behind reader/
//! writer spin locks.

use spin::RwLock;

use crate::controller::CollectMode;
use crate::mark::Marker;
use crate::riptide::Riptide;
use crate::util::{Address, ObjectReference};
use crate::vm::VMBinding;

/// Scans additional roots. Runs after the built-in root set is queued.
pub type RootScanner<VM> = for<'a, 'b> fn(&'b mut Marker<'a, VM>, CollectMode);
/// Observes every task encountered by the mark engine; the flag is set
/// when the task is some thread's root task.
pub type TaskScanner<VM> = for<'a, 'b> fn(&'b mut Marker<'a, VM>, ObjectReference, bool);
/// Runs before the collection starts, inside the world stop.
pub type PreGc = fn(CollectMode);
/// Runs after the world is released.
pub type PostGc = fn(CollectMode);
/// Observes big-object allocations.
pub type NotifyExternalAlloc = fn(Address, usize);
/// Observes big-object frees.
pub type NotifyExternalFree = fn(Address);

pub struct Callbacks<VM: VMBinding> {
    pub(crate) root_scanner: RwLock<Vec<RootScanner<VM>>>,
    pub(crate) task_scanner: RwLock<Vec<TaskScanner<VM>>>,
    pub(crate) pre_gc: RwLock<Vec<PreGc>>,
    pub(crate) post_gc: RwLock<Vec<PostGc>>,
    pub(crate) notify_external_alloc: RwLock<Vec<NotifyExternalAlloc>>,
    pub(crate) notify_external_free: RwLock<Vec<NotifyExternalFree>>,
}

impl<VM: VMBinding> Default for Callbacks<VM> {
    fn default() -> Self {
        Callbacks {
            root_scanner: RwLock::new(Vec::new()),
            task_scanner: RwLock::new(Vec::new()),
            pre_gc: RwLock::new(Vec::new()),
            post_gc: RwLock::new(Vec::new()),
            notify_external_alloc: RwLock::new(Vec::new()),
            notify_external_free: RwLock::new(Vec::new()),
        }
    }
}

fn set_enabled<T: PartialEq + Copy>(list: &RwLock<Vec<T>>, cb: T, enable: bool) {
    let mut list = list.write();
    if enable {
        if !list.contains(&cb) {
            list.push(cb);
        }
    } else {
        list.retain(|existing| *existing != cb);
    }
}

impl<VM: VMBinding> Callbacks<VM> {
    pub fn set_root_scanner(&self, cb: RootScanner<VM>, enable: bool) {
        set_enabled(&self.root_scanner, cb, enable);
    }

    pub fn set_task_scanner(&self, cb: TaskScanner<VM>, enable: bool) {
        set_enabled(&self.task_scanner, cb, enable);
    }

    pub fn set_pre_gc(&self, cb: PreGc, enable: bool) {
        set_enabled(&self.pre_gc, cb, enable);
    }

    pub fn set_post_gc(&self, cb: PostGc, enable: bool) {
        set_enabled(&self.post_gc, cb, enable);
    }

    pub fn set_notify_external_alloc(&self, cb: NotifyExternalAlloc, enable: bool) {
        set_enabled(&self.notify_external_alloc, cb, enable);
    }

    pub fn set_notify_external_free(&self, cb: NotifyExternalFree, enable: bool) {
        set_enabled(&self.notify_external_free, cb, enable);
    }
}

pub(crate) fn invoke_pre_gc<VM: VMBinding>(gc: &Riptide<VM>, mode: CollectMode) {
    for cb in gc.callbacks.pre_gc.read().iter() {
        cb(mode);
    }
}

pub(crate) fn invoke_post_gc<VM: VMBinding>(gc: &Riptide<VM>, mode: CollectMode) {
    for cb in gc.callbacks.post_gc.read().iter() {
        cb(mode);
    }
}

pub(crate) fn invoke_notify_external_alloc<VM: VMBinding>(
    gc: &Riptide<VM>,
    ptr: Address,
    size: usize,
) {
    for cb in gc.callbacks.notify_external_alloc.read().iter() {
        cb(ptr, size);
    }
}

pub(crate) fn invoke_notify_external_free<VM: VMBinding>(gc: &Riptide<VM>, ptr: Address) {
    for cb in gc.callbacks.notify_external_free.read().iter() {
        cb(ptr);
    }
}
