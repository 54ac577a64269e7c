//! Riptide is a tracing, generational, non-moving, stop-the-world garbage
//! collector core for managed language runtimes with multi-threaded mutator
//! execution.
//!
//! The crate provides the memory-management half of a runtime and expects the
//! language implementation (the *binding*) to provide the other half through
//! the [`vm::VMBinding`] trait: object layout descriptors, the `nothing`
//! sentinel, finalizer dispatch and the out-of-memory condition.
//!
//! Logically, the crate includes these major parts:
//! * The allocator: a size-classed, page-based pool allocator for small
//!   objects and an intrusive free list for big objects
//!   (see [`heap`]).
//! * The mark engine: an iterative depth-first traversal over an explicit
//!   work stack, with specialized scan kernels for each object shape
//!   (see [`mark`]).
//! * The sweep engine: lazy/eager pool page reclamation and big-object list
//!   pruning (see [`sweep`]).
//! * Generational bookkeeping: two-bit object ages, per-thread remembered
//!   sets and the write barrier (see [`barrier`]).
//! * The collection controller: quick/full sweep heuristics and collect
//!   interval adaptation (see [`controller`]).
//! * The finalization subsystem and the safepoint protocol
//!   (see [`finalizer`] and [`safepoint`]).
//!
//! Bindings interact with the collector through the flat, safe API in
//! [`memory_manager`], after creating a [`Riptide`] context and binding a
//! [`Mutator`] per thread.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod util;
pub mod memory_manager;
pub mod vm;

pub(crate) mod header;

pub mod barrier;
pub mod callbacks;
pub mod controller;
pub mod finalizer;
pub mod heap;
pub mod mark;
pub mod safepoint;
pub mod sweep;
pub mod thread;

mod riptide;
pub use crate::riptide::Riptide;
pub use crate::controller::CollectMode;
pub use crate::thread::Mutator;
pub use crate::util::{Address, ObjectReference};

#[cfg(test)]
mod tests;
