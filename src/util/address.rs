use bytemuck::NoUninit;

use std::fmt;
use std::num::NonZeroUsize;
use std::ops::*;
use std::sync::atomic::AtomicUsize;

use crate::util::constants::BYTES_IN_WORD;

/// size in bytes
pub type ByteSize = usize;
/// offset in bytes
pub type ByteOffset = isize;

/// Address represents an arbitrary address. This is designed to represent
/// address and do address arithmetic mostly in a safe way, and to allow
/// marking some operations as unsafe. This type needs to be zero overhead
/// (memory wise and time wise). The idea is from the paper
/// High-level Low-level Programming (VEE09) and JikesRVM.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit, Default)]
pub struct Address(usize);

/// Address + ByteSize (positive)
impl Add<ByteSize> for Address {
    type Output = Address;
    fn add(self, offset: ByteSize) -> Address {
        Address(self.0 + offset)
    }
}

/// Address += ByteSize (positive)
impl AddAssign<ByteSize> for Address {
    fn add_assign(&mut self, offset: ByteSize) {
        self.0 += offset;
    }
}

/// Address + ByteOffset (positive or negative)
impl Add<ByteOffset> for Address {
    type Output = Address;
    fn add(self, offset: ByteOffset) -> Address {
        Address((self.0 as isize + offset) as usize)
    }
}

/// Address - ByteSize (positive)
impl Sub<ByteSize> for Address {
    type Output = Address;
    fn sub(self, offset: ByteSize) -> Address {
        Address(self.0 - offset)
    }
}

/// Address - Address (the first address must be higher)
impl Sub<Address> for Address {
    type Output = ByteSize;
    fn sub(self, other: Address) -> ByteSize {
        debug_assert!(
            self.0 >= other.0,
            "for (addr_a - addr_b), a({}) needs to be larger than b({})",
            self,
            other
        );
        self.0 - other.0
    }
}

impl Address {
    /// The zero address.
    pub const ZERO: Self = Address(0);

    /// creates Address from a usize.
    pub const fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    /// creates Address from a pointer
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    /// creates Address from a Rust reference
    pub fn from_ref<T>(r: &T) -> Address {
        Address(r as *const T as usize)
    }

    /// Get the numerical value of the address.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// is this address zero?
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// aligns up the address to the given alignment
    pub const fn align_up(self, align: ByteSize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address((self.0 + align - 1) & !(align - 1))
    }

    /// aligns down the address to the given alignment
    pub const fn align_down(self, align: ByteSize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address(self.0 & !(align - 1))
    }

    /// is this address aligned to the given alignment?
    pub const fn is_aligned_to(self, align: ByteSize) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }

    /// converts the Address to a raw pointer
    pub const fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// converts the Address to a mutable raw pointer
    pub const fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// loads a value of type T from the address
    ///
    /// # Safety
    /// The caller must guarantee the address is valid, initialized and
    /// properly aligned for `T`.
    pub unsafe fn load<T: Copy>(self) -> T {
        *(self.0 as *const T)
    }

    /// stores a value of type T to the address
    ///
    /// # Safety
    /// The caller must guarantee the address is valid and properly aligned
    /// for `T`, and that no other thread accesses it concurrently.
    pub unsafe fn store<T>(self, value: T) {
        *(self.0 as *mut T) = value;
    }

    /// Views the word at this address as an atomic. Used for object headers
    /// and free-list links, which other subsystems may race on.
    ///
    /// # Safety
    /// The caller must guarantee the address points at a valid, word-aligned
    /// word that lives for `'a`.
    pub unsafe fn as_atomic_word<'a>(self) -> &'a AtomicUsize {
        debug_assert!(self.is_aligned_to(BYTES_IN_WORD));
        &*(self.0 as *const AtomicUsize)
    }
}

impl fmt::UpperHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// ObjectReference represents a managed object. It is a non-null pointer to
/// the object's *value* (the word past the tagged header), which is how the
/// runtime itself refers to objects; the header lives at the word before.
///
/// We currently do not allow an opaque `ObjectReference` type for which a
/// binding can define their layout. A binding that needs interior or tagged
/// references must convert them before handing them to the collector.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit)]
pub struct ObjectReference(NonZeroUsize);

impl ObjectReference {
    /// Cast the object reference to its raw address.
    pub const fn to_raw_address(self) -> Address {
        Address(self.0.get())
    }

    /// Cast a raw address to an object reference. Returns `None` for the
    /// zero address.
    pub fn from_raw_address(addr: Address) -> Option<ObjectReference> {
        NonZeroUsize::new(addr.0).map(ObjectReference)
    }

    /// Like `from_raw_address`, but without the null check.
    ///
    /// # Safety
    /// The address must not be zero.
    pub const unsafe fn from_raw_address_unchecked(addr: Address) -> ObjectReference {
        debug_assert!(!addr.is_zero());
        ObjectReference(NonZeroUsize::new_unchecked(addr.0))
    }

    /// The address of the tagged header word of this object.
    pub const fn header_address(self) -> Address {
        Address(self.0.get() - BYTES_IN_WORD)
    }

    /// The address of the `idx`th word-sized slot of the object's payload.
    pub const fn slot(self, idx: usize) -> Address {
        Address(self.0.get() + idx * BYTES_IN_WORD)
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_allocation() {
        let addr = Address::from_usize(0x123456);
        assert_eq!(addr.align_down(4096), Address::from_usize(0x123000));
        assert_eq!(addr.align_up(4096), Address::from_usize(0x124000));
        assert!(!addr.is_aligned_to(16));
        assert!(addr.align_up(16).is_aligned_to(16));
    }

    #[test]
    fn object_reference_round_trip() {
        let addr = Address::from_usize(0xdead0);
        let obj = ObjectReference::from_raw_address(addr).unwrap();
        assert_eq!(obj.to_raw_address(), addr);
        assert_eq!(obj.header_address(), addr - BYTES_IN_WORD);
        assert_eq!(obj.slot(2), addr + 2 * BYTES_IN_WORD);
        assert!(ObjectReference::from_raw_address(Address::ZERO).is_none());
    }

    #[test]
    fn option_object_reference_is_word_sized() {
        assert_eq!(
            std::mem::size_of::<Option<ObjectReference>>(),
            std::mem::size_of::<usize>()
        );
    }
}
