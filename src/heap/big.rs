//! Big objects: allocations too large for any pool class.
//!
//! Each big object carries a [`BigVal`] header ahead of the tagged value
//! and lives on an intrusive doubly-linked list. The back link points at
//! the previous node's `next` slot (or the list head), so unlinking from
//! the middle is O(1) without a distinguished sentinel node.

use atomic::Ordering;

use crate::callbacks;
use crate::controller;
use crate::riptide::Riptide;
use crate::thread::ThreadState;
use crate::util::constants::{BYTES_IN_WORD, CACHE_BYTE_ALIGNMENT, HEAP_ALIGNMENT};
use crate::util::{memory, Address, ObjectReference};
use crate::vm::{AllocationError, VMBinding};

/// Objects become old after surviving this many sweeps. Cannot be raised
/// as-is: the pool sweep and the page age storage are specialized for a
/// one-bit age.
pub const PROMOTE_AGE: u8 = 1;

/// Header of a big object. The tagged value follows the struct directly.
#[repr(C)]
pub struct BigVal {
    pub(crate) next: *mut BigVal,
    /// Pointer to the previous node's `next` slot, or to the list head.
    pub(crate) prev: *mut *mut BigVal,
    /// Aligned total size of the allocation, including this header.
    pub sz: usize,
    /// Saturating survival count.
    pub age: u8,
    _pad: [u8; BIGVAL_PAD],
}

#[cfg(target_pointer_width = "64")]
const BIGVAL_PAD: usize = 15;
#[cfg(target_pointer_width = "32")]
const BIGVAL_PAD: usize = 15;

// The value (one word past the header) must land on the heap alignment.
const_assert_eq!(
    (std::mem::size_of::<BigVal>() + BYTES_IN_WORD) % HEAP_ALIGNMENT,
    0
);
const_assert!(std::mem::size_of::<BigVal>() >= 3 * BYTES_IN_WORD);

impl BigVal {
    /// Byte offset from the start of the header to the object value.
    pub const OBJECT_OFFSET: usize = std::mem::size_of::<BigVal>() + BYTES_IN_WORD;

    /// The header address of the contained object.
    pub fn header_addr(&self) -> Address {
        Address::from_ref(self) + std::mem::size_of::<BigVal>()
    }

    /// The contained object.
    pub fn object(&self) -> ObjectReference {
        unsafe { ObjectReference::from_raw_address_unchecked(self.header_addr() + BYTES_IN_WORD) }
    }

    /// Recover the header from an object known to be big.
    pub fn from_object(obj: ObjectReference) -> *mut BigVal {
        (obj.to_raw_address() - Self::OBJECT_OFFSET).to_mut_ptr()
    }

    pub fn next(&self) -> *mut BigVal {
        self.next
    }
}

/// Push `hdr` onto the list rooted at `list`.
///
/// # Safety
/// `hdr` must be unlinked and `list` a valid list head; callers serialize
/// list access (owner thread, or the collector inside the world stop /
/// under the cache lock).
pub unsafe fn big_object_link(hdr: *mut BigVal, list: *mut *mut BigVal) {
    (*hdr).next = *list;
    (*hdr).prev = list;
    if !(*hdr).next.is_null() {
        (*(*hdr).next).prev = &mut (*hdr).next;
    }
    *list = hdr;
}

/// Remove `hdr` from whatever list it is on.
///
/// # Safety
/// `hdr` must currently be linked; same serialization rules as
/// [`big_object_link`].
pub unsafe fn big_object_unlink(hdr: *mut BigVal) {
    *(*hdr).prev = (*hdr).next;
    if !(*hdr).next.is_null() {
        (*(*hdr).next).prev = (*hdr).prev;
    }
}

/// Allocate a big object of `size` payload bytes on the calling thread's
/// big-object list. The header is uninitialized; the caller installs the
/// type tag.
pub(crate) fn alloc_big<VM: VMBinding>(
    gc: &Riptide<VM>,
    tls: &ThreadState<VM>,
    size: usize,
) -> ObjectReference {
    controller::maybe_collect(gc, tls);
    let allocsz = match size.checked_add(BigVal::OBJECT_OFFSET) {
        Some(sz) => (sz + CACHE_BYTE_ALIGNMENT - 1) & !(CACHE_BYTE_ALIGNMENT - 1),
        None => VM::out_of_memory(AllocationError::HeapOutOfMemory),
    };
    if allocsz < size {
        // overflow while aligning, size was "negative"
        VM::out_of_memory(AllocationError::HeapOutOfMemory);
    }
    let mem = memory::malloc_cache_align(allocsz);
    if mem.is_zero() {
        VM::out_of_memory(AllocationError::HeapOutOfMemory);
    }
    callbacks::invoke_notify_external_alloc(gc, mem, allocsz);
    tls.gc_num
        .allocd
        .fetch_add(allocsz as i64, Ordering::Relaxed);
    tls.gc_num.bigalloc.fetch_add(1, Ordering::Relaxed);

    let hdr: *mut BigVal = mem.to_mut_ptr();
    let heap = unsafe { tls.heap_mut() };
    unsafe {
        (*hdr).sz = allocsz;
        (*hdr).age = 0;
        big_object_link(hdr, &mut heap.big_objects);
        (*hdr).object()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_bigval(sz: usize) -> *mut BigVal {
        let mem = memory::malloc_cache_align(sz + BigVal::OBJECT_OFFSET);
        let hdr: *mut BigVal = mem.to_mut_ptr();
        unsafe {
            (*hdr).sz = sz + BigVal::OBJECT_OFFSET;
            (*hdr).age = 0;
            (*hdr).next = std::ptr::null_mut();
            (*hdr).prev = std::ptr::null_mut();
        }
        hdr
    }

    #[test]
    fn object_round_trip() {
        let hdr = raw_bigval(64);
        let obj = unsafe { (*hdr).object() };
        assert!(obj
            .to_raw_address()
            .is_aligned_to(crate::util::constants::HEAP_ALIGNMENT));
        assert_eq!(BigVal::from_object(obj), hdr);
        memory::free_aligned(Address::from_ptr(hdr));
    }

    #[test]
    fn link_and_unlink_middle() {
        let mut list: *mut BigVal = std::ptr::null_mut();
        let a = raw_bigval(16);
        let b = raw_bigval(16);
        let c = raw_bigval(16);
        unsafe {
            big_object_link(a, &mut list);
            big_object_link(b, &mut list);
            big_object_link(c, &mut list);
            // list is c -> b -> a
            assert_eq!(list, c);
            assert_eq!((*c).next, b);
            assert_eq!((*b).next, a);

            big_object_unlink(b);
            assert_eq!(list, c);
            assert_eq!((*c).next, a);
            assert_eq!((*a).prev, &mut (*c).next as *mut _);

            big_object_unlink(c);
            assert_eq!(list, a);
            big_object_unlink(a);
            assert!(list.is_null());
        }
        for hdr in [a, b, c] {
            memory::free_aligned(Address::from_ptr(hdr));
        }
    }
}
