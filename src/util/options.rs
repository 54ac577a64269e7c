//! Run-time options for the collector.
//!
//! Each option can be overridden from the environment with a `RIPTIDE_`
//! prefixed variable, e.g. `RIPTIDE_COLLECT_INTERVAL=1048576`. Invalid
//! values are logged and ignored.

use crate::util::constants::BYTES_IN_WORD;
use crate::util::memory;

/// The env var prefix for options.
const PREFIX: &str = "RIPTIDE_";

#[cfg(target_pointer_width = "64")]
const DEFAULT_COLLECT_INTERVAL: usize = 5600 * 1024 * BYTES_IN_WORD;
#[cfg(target_pointer_width = "32")]
const DEFAULT_COLLECT_INTERVAL: usize = 3200 * 1024 * BYTES_IN_WORD;

#[cfg(target_pointer_width = "64")]
const DEFAULT_MAX_COLLECT_INTERVAL: usize = 1_250_000_000;
#[cfg(target_pointer_width = "32")]
const DEFAULT_MAX_COLLECT_INTERVAL: usize = 500_000_000;

// max_total_memory is a suggestion. We try very hard to stay under this
// limit, but we will go above it rather than halting.
#[cfg(target_pointer_width = "64")]
const MAX_TOTAL_MEMORY_CEILING: u64 = 2 << 50;
#[cfg(target_pointer_width = "32")]
const MAX_TOTAL_MEMORY_CEILING: u64 = 2 << 30;

/// Collector tuning knobs. Snapshotted once at [`crate::Riptide::new`];
/// the soft memory cap can additionally be adjusted at run time through
/// [`crate::memory_manager::set_max_memory`].
#[derive(Clone, Debug)]
pub struct Options {
    /// The number of allocated bytes between automatic collections. The
    /// per-thread allocation counter is biased by this amount; the
    /// controller doubles or shrinks it as the survival rate changes.
    pub collect_interval: usize,
    /// Upper clamp for the adaptive collect interval on this machine.
    pub max_collect_interval: usize,
    /// Soft cap on total live memory, in bytes. Advisory: the collector
    /// shrinks the interval and runs full sweeps rather than halting.
    pub max_total_memory: usize,
    /// Total system memory, used to raise `max_collect_interval` on big
    /// machines.
    pub total_memory: usize,
    /// Debugging flag: make every sweep a full sweep.
    pub always_full: bool,
    /// The number of empty-but-reset pages a quick sweep may retain on the
    /// allocation list instead of returning them to the OS.
    pub lazy_page_budget: usize,
}

impl Default for Options {
    fn default() -> Self {
        let total = memory::get_system_total_memory();
        // We allocate with abandon until we get close to the free memory on
        // the machine; 70% of what is available now is the high-water mark.
        let high_water = memory::get_system_available_memory() / 10 * 7;
        let max_total = high_water.min(MAX_TOTAL_MEMORY_CEILING).max(1) as usize;
        Self {
            collect_interval: DEFAULT_COLLECT_INTERVAL,
            max_collect_interval: DEFAULT_MAX_COLLECT_INTERVAL,
            max_total_memory: max_total,
            total_memory: total as usize,
            always_full: false,
            lazy_page_budget: DEFAULT_COLLECT_INTERVAL / crate::heap::page::PAGE_SZ,
        }
    }
}

impl Options {
    /// Default options with every `RIPTIDE_*` environment override applied.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        read_env("COLLECT_INTERVAL", &mut opts.collect_interval);
        read_env("MAX_COLLECT_INTERVAL", &mut opts.max_collect_interval);
        read_env("MAX_TOTAL_MEMORY", &mut opts.max_total_memory);
        read_env("LAZY_PAGE_BUDGET", &mut opts.lazy_page_budget);
        let mut always_full = opts.always_full;
        read_env("ALWAYS_FULL", &mut always_full);
        opts.always_full = always_full;
        opts
    }
}

fn read_env<T: std::str::FromStr>(name: &str, into: &mut T) {
    let key = format!("{PREFIX}{name}");
    if let Ok(val) = std::env::var(&key) {
        match val.parse() {
            Ok(parsed) => *into = parsed,
            Err(_) => warn!("Invalid value for option {key}: {val}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let opts = Options::default();
        assert!(opts.collect_interval > 0);
        assert!(opts.max_collect_interval >= opts.collect_interval);
        assert!(opts.max_total_memory > 0);
        assert!(opts.lazy_page_budget > 0);
        assert!(!opts.always_full);
    }
}
