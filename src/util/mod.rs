//! Utilities used across the collector: address newtypes, layout constants,
//! OS memory primitives, logging and run-time options.

mod address;
pub mod constants;
pub mod logger;
pub mod memory;
pub mod options;

pub use address::{Address, ByteOffset, ByteSize, ObjectReference};
