//! OS memory primitives: page-granular anonymous mappings for pool pages and
//! cache-aligned malloc for big objects and tracked buffers.

use crate::util::constants::CACHE_BYTE_ALIGNMENT;
use crate::util::Address;

/// Set a range of memory to 0.
pub fn zero(start: Address, len: usize) {
    unsafe {
        std::ptr::write_bytes(start.to_mut_ptr::<u8>(), 0, len);
    }
}

/// Allocate `size` bytes of zero-initialized memory from the OS, aligned to
/// `align`. Returns `Address::ZERO` on exhaustion; the caller decides how to
/// surface the failure.
pub fn os_page_alloc(size: usize, align: usize) -> Address {
    debug_assert!(align.is_power_of_two());
    os_page_alloc_impl(size, align)
}

/// Return a region obtained from [`os_page_alloc`] to the OS.
pub fn os_page_free(start: Address, size: usize) {
    os_page_free_impl(start, size)
}

cfg_if::cfg_if! {
    if #[cfg(target_family = "unix")] {
        fn os_page_alloc_impl(size: usize, align: usize) -> Address {
            let os_page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            // Over-map and trim so the result is aligned beyond the OS page
            // granularity. MAP_ANONYMOUS memory is already zeroed.
            let extra = if align > os_page { align } else { 0 };
            #[allow(unused_mut)]
            let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            #[cfg(target_os = "linux")]
            {
                flags |= libc::MAP_NORESERVE;
            }
            let res = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size + extra,
                    libc::PROT_READ | libc::PROT_WRITE,
                    flags,
                    -1,
                    0,
                )
            };
            if res == libc::MAP_FAILED {
                return Address::ZERO;
            }
            let raw = Address::from_ptr(res as *const u8);
            if extra == 0 {
                return raw;
            }
            let start = raw.align_up(align);
            let head = start - raw;
            let tail = extra - head;
            unsafe {
                if head != 0 {
                    libc::munmap(raw.to_mut_ptr(), head);
                }
                if tail != 0 {
                    libc::munmap((start + size).to_mut_ptr(), tail);
                }
            }
            start
        }

        fn os_page_free_impl(start: Address, size: usize) {
            let ret = unsafe { libc::munmap(start.to_mut_ptr(), size) };
            debug_assert_eq!(ret, 0, "munmap failed at {}", start);
        }
    } else if #[cfg(target_os = "windows")] {
        fn os_page_alloc_impl(size: usize, align: usize) -> Address {
            // VirtualAlloc reservations are 64 KiB-granular, which satisfies
            // every alignment the collector asks for.
            debug_assert!(align <= 64 * 1024);
            let res = unsafe {
                libc::VirtualAlloc(
                    std::ptr::null_mut(),
                    size,
                    libc::MEM_RESERVE | libc::MEM_COMMIT,
                    libc::PAGE_READWRITE,
                )
            };
            Address::from_ptr(res as *const u8)
        }

        fn os_page_free_impl(start: Address, _size: usize) {
            unsafe {
                libc::VirtualFree(start.to_mut_ptr(), 0, libc::MEM_RELEASE);
            }
        }
    }
}

/// Cache-aligned allocation for big objects and array buffers. Returns
/// `Address::ZERO` on failure.
pub fn malloc_cache_align(size: usize) -> Address {
    malloc_aligned(size, CACHE_BYTE_ALIGNMENT)
}

/// Aligned allocation. Returns `Address::ZERO` on failure.
pub fn malloc_aligned(size: usize, align: usize) -> Address {
    debug_assert!(align.is_power_of_two());
    cfg_if::cfg_if! {
        if #[cfg(target_family = "unix")] {
            let mut ptr: *mut libc::c_void = std::ptr::null_mut();
            let ret = unsafe { libc::posix_memalign(&mut ptr, align, size.max(1)) };
            if ret != 0 {
                return Address::ZERO;
            }
            Address::from_ptr(ptr as *const u8)
        } else {
            Address::from_ptr(unsafe { libc::aligned_malloc(size.max(1), align) } as *const u8)
        }
    }
}

/// Reallocate an aligned allocation, preserving `oldsz` bytes of content.
/// POSIX has no aligned realloc, so this is alloc + copy + free, exactly as
/// runtimes do it by hand. Returns `Address::ZERO` on failure.
pub fn realloc_aligned(old: Address, size: usize, oldsz: usize, align: usize) -> Address {
    let fresh = malloc_aligned(size, align);
    if fresh.is_zero() {
        return Address::ZERO;
    }
    unsafe {
        std::ptr::copy_nonoverlapping(
            old.to_ptr::<u8>(),
            fresh.to_mut_ptr::<u8>(),
            oldsz.min(size),
        );
    }
    free_aligned(old);
    fresh
}

/// Free an allocation obtained from [`malloc_aligned`].
pub fn free_aligned(ptr: Address) {
    cfg_if::cfg_if! {
        if #[cfg(target_family = "unix")] {
            unsafe { libc::free(ptr.to_mut_ptr()) }
        } else {
            unsafe { libc::aligned_free(ptr.to_mut_ptr()) }
        }
    }
}

/// Get the total memory of the system in bytes, used to size the collect
/// interval ceiling on large machines.
pub fn get_system_total_memory() -> u64 {
    use sysinfo::{MemoryRefreshKind, RefreshKind, System};
    let sys = System::new_with_specifics(
        RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram()),
    );
    sys.total_memory()
}

/// Get the currently available memory of the system in bytes, used for the
/// default soft heap cap.
pub fn get_system_available_memory() -> u64 {
    use sysinfo::{MemoryRefreshKind, RefreshKind, System};
    let sys = System::new_with_specifics(
        RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram()),
    );
    sys.available_memory()
}
