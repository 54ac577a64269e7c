//! Layout constants shared by the allocator and the mark/sweep engines.

/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: usize = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

#[cfg(target_pointer_width = "32")]
/// log2 of the number of bytes in a word
pub const LOG_BYTES_IN_WORD: usize = 2;
#[cfg(target_pointer_width = "64")]
/// log2 of the number of bytes in a word
pub const LOG_BYTES_IN_WORD: usize = 3;
/// The number of bytes in a word (an object header, a reference slot)
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;

/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: usize = 10;
/// The number of bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: usize = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// Alignment guaranteed for managed object payloads. The first cell of a
/// pool page is offset so that payloads land on this boundary.
pub const HEAP_ALIGNMENT: usize = 16;

/// Alignment used for big objects and tracked malloc buffers, chosen to
/// avoid false sharing of the object header with neighbouring allocations.
pub const CACHE_BYTE_ALIGNMENT: usize = 64;

/// The number of address bits the page table radix covers. Covers the
/// canonical user-space range of all 64-bit platforms we target; on 32-bit
/// platforms the upper levels of the radix are simply sparse.
pub const LOG_MAPPABLE_BYTES: usize = 48;
