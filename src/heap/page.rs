//! Pool pages and their metadata.
//!
//! A pool page is a fixed-size, page-aligned region holding objects of a
//! single size class. The first [`PAGE_OFFSET`] bytes are reserved: the
//! first word doubles as the link of the free-page chain threaded through
//! `newpages`, and the offset puts the first payload on the heap
//! alignment (cells of 16-byte-multiple classes keep it).

use atomic::{Atomic, Ordering};
use std::sync::atomic::{AtomicBool, AtomicU8};

use crate::util::constants::{BITS_IN_BYTE, BYTES_IN_WORD, HEAP_ALIGNMENT};
use crate::util::Address;

/// log2 of the pool page size
pub const LOG_PAGE_SZ: usize = 14;
/// Pool page size: 16 KiB.
pub const PAGE_SZ: usize = 1 << LOG_PAGE_SZ;
/// Offset of the first object cell in a page.
pub const PAGE_OFFSET: usize = HEAP_ALIGNMENT - BYTES_IN_WORD;

/// Sentinel for `fl_begin_offset`/`fl_end_offset`: the page has no free
/// list. All in-page offsets fit in a `u16` with 16 KiB pages.
pub const NO_FREELIST: u16 = u16::MAX;

/// Metadata for one pool page. The fields written during marking (`nold`,
/// `has_marked`, ages) are atomics so the scan kernels stay reentrant for
/// future parallel marking; everything else is only touched by the owning
/// thread or inside the world stop.
pub struct PageMeta {
    /// Start of the page data.
    pub data: Address,
    /// Size of each object cell in this page, including the header word.
    pub osize: u16,
    /// Index of the pool (size class) this page belongs to.
    pub pool_n: u8,
    /// The thread whose pool owns this page.
    pub thread_n: u16,
    /// Number of free cells.
    pub nfree: Atomic<u16>,
    /// Whether any cell survived the last mark phase.
    pub has_marked: AtomicBool,
    /// Whether the page holds (or held) young cells since the last sweep.
    pub has_young: AtomicBool,
    /// In-page offset of the first free cell, or [`NO_FREELIST`].
    pub fl_begin_offset: Atomic<u16>,
    /// In-page offset of the last free cell, or [`NO_FREELIST`].
    pub fl_end_offset: Atomic<u16>,
    /// Old cells marked this cycle.
    pub nold: Atomic<u16>,
    /// `nold` as of the last sweep, used to skip unchanged old pages on
    /// quick sweeps.
    pub prev_nold: Atomic<u16>,
    /// One age bit per cell: set when the cell survived at least one sweep.
    ages: Box<[AtomicU8]>,
}

impl PageMeta {
    pub fn new(data: Address, osize: usize, pool_n: u8, thread_n: u16) -> Self {
        debug_assert!(data.is_aligned_to(PAGE_SZ));
        debug_assert!(osize >= BYTES_IN_WORD && osize <= PAGE_SZ - PAGE_OFFSET);
        let nages = PAGE_SZ / BITS_IN_BYTE / osize + 1;
        let ages = (0..nages).map(|_| AtomicU8::new(0)).collect();
        PageMeta {
            data,
            osize: osize as u16,
            pool_n,
            thread_n,
            nfree: Atomic::new(Self::capacity_for(osize) as u16),
            has_marked: AtomicBool::new(false),
            has_young: AtomicBool::new(false),
            fl_begin_offset: Atomic::new(NO_FREELIST),
            fl_end_offset: Atomic::new(NO_FREELIST),
            nold: Atomic::new(0),
            prev_nold: Atomic::new(0),
            ages,
        }
    }

    pub const fn capacity_for(osize: usize) -> usize {
        (PAGE_SZ - PAGE_OFFSET) / osize
    }

    /// Number of object cells the page holds.
    pub fn capacity(&self) -> usize {
        Self::capacity_for(self.osize as usize)
    }

    /// Address of the first object cell.
    pub fn first_cell(&self) -> Address {
        self.data + PAGE_OFFSET
    }

    /// Index of the cell containing `addr`.
    pub fn cell_index(&self, addr: Address) -> usize {
        debug_assert!(addr >= self.first_cell());
        (addr - self.first_cell()) / self.osize as usize
    }

    pub fn age_bit(&self, idx: usize) -> bool {
        self.ages[idx / 8].load(std::sync::atomic::Ordering::Relaxed) & (1 << (idx % 8)) != 0
    }

    pub fn set_age_bit(&self, idx: usize) {
        self.ages[idx / 8].fetch_or(1 << (idx % 8), std::sync::atomic::Ordering::Relaxed);
    }

    pub fn clear_age_bit(&self, idx: usize) {
        self.ages[idx / 8].fetch_and(!(1 << (idx % 8)), std::sync::atomic::Ordering::Relaxed);
    }

    pub fn reset_ages(&self) {
        for byte in self.ages.iter() {
            byte.store(0, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// The cached in-page free list, as `(first_cell, last_cell)`.
    pub fn freelist_extent(&self) -> Option<(Address, Address)> {
        let begin = self.fl_begin_offset.load(Ordering::Relaxed);
        if begin == NO_FREELIST {
            return None;
        }
        let end = self.fl_end_offset.load(Ordering::Relaxed);
        Some((self.data + begin as usize, self.data + end as usize))
    }

    pub fn set_freelist_extent(&self, extent: Option<(Address, Address)>) {
        match extent {
            Some((begin, end)) => {
                self.fl_begin_offset
                    .store((begin - self.data) as u16, Ordering::Relaxed);
                self.fl_end_offset
                    .store((end - self.data) as u16, Ordering::Relaxed);
            }
            None => {
                self.fl_begin_offset.store(NO_FREELIST, Ordering::Relaxed);
                self.fl_end_offset.store(NO_FREELIST, Ordering::Relaxed);
            }
        }
    }
}

/// The page containing `addr`.
pub fn page_of(addr: Address) -> Address {
    addr.align_down(PAGE_SZ)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_and_cells() {
        let data = Address::from_usize(0x40000);
        let pg = PageMeta::new(data, 64, 7, 0);
        assert_eq!(pg.capacity(), (PAGE_SZ - PAGE_OFFSET) / 64);
        assert_eq!(pg.first_cell(), data + PAGE_OFFSET);
        assert_eq!(pg.cell_index(pg.first_cell()), 0);
        assert_eq!(pg.cell_index(pg.first_cell() + 64usize), 1);
    }

    #[test]
    fn age_bits() {
        let pg = PageMeta::new(Address::from_usize(0x40000), 32, 0, 0);
        assert!(!pg.age_bit(10));
        pg.set_age_bit(10);
        assert!(pg.age_bit(10));
        assert!(!pg.age_bit(11));
        pg.clear_age_bit(10);
        assert!(!pg.age_bit(10));
        pg.set_age_bit(3);
        pg.reset_ages();
        assert!(!pg.age_bit(3));
    }

    #[test]
    fn freelist_extent_round_trip() {
        let data = Address::from_usize(0x40000);
        let pg = PageMeta::new(data, 16, 0, 0);
        assert!(pg.freelist_extent().is_none());
        pg.set_freelist_extent(Some((data + 8usize, data + 1032usize)));
        assert_eq!(
            pg.freelist_extent(),
            Some((data + 8usize, data + 1032usize))
        );
        pg.set_freelist_extent(None);
        assert!(pg.freelist_extent().is_none());
    }
}
