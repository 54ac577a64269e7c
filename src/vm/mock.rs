//! A minimal test binding.
//!
//! `MockVM` describes objects through leaked, 16-byte-aligned type
//! descriptors whose addresses double as type tags. Tests construct the
//! object shapes they need (opaque blobs, reference structs, inline
//! reference arrays, callables) and drive the collector through the public
//! API.

use crate::header::GC_OLD_MARKED;
use crate::memory_manager;
use crate::thread::Mutator;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::{Address, ObjectReference};
use crate::vm::{
    AllocationError, DataTypeLayout, FieldOffsets, ObjectShape, TypeTag, VMBinding,
};

/// A type descriptor; its address is the type tag, so it must keep the
/// low header bits clear.
#[repr(align(16))]
pub struct MockType {
    pub kind: MockKind,
}

pub enum MockKind {
    /// No reference fields; `size` payload bytes.
    Opaque { size: usize },
    /// A struct with reference fields at the layout's word offsets.
    RefStruct { layout: DataTypeLayout },
    /// Payload is `[len, ref0, ref1, ..]`, svec-style.
    RefArray,
    /// A weak reference cell.
    Weakref,
    /// Payload slot 0 holds a `fn(ObjectReference)` to run as a
    /// finalizer.
    Callable,
}

/// Leak a descriptor and return its tag.
pub fn mock_type(kind: MockKind) -> TypeTag {
    let ty: &'static MockType = Box::leak(Box::new(MockType { kind }));
    TypeTag(ty as *const MockType as usize)
}

/// Tag for an opaque type of `size` payload bytes.
pub fn opaque_type(size: usize) -> TypeTag {
    mock_type(MockKind::Opaque { size })
}

/// Tag for a struct with `nfields` payload words whose reference fields
/// sit at `ref_fields`.
pub fn ref_struct_type(nfields: usize, ref_fields: &[u8]) -> TypeTag {
    let fields: &'static [u8] = Box::leak(ref_fields.to_vec().into_boxed_slice());
    mock_type(MockKind::RefStruct {
        layout: DataTypeLayout {
            size: nfields * BYTES_IN_WORD,
            fields: FieldOffsets::U8(fields),
        },
    })
}

lazy_static! {
    static ref WEAKREF_TYPE: TypeTag = mock_type(MockKind::Weakref);
    static ref CALLABLE_TYPE: TypeTag = mock_type(MockKind::Callable);
    static ref REF_ARRAY_TYPE: TypeTag = mock_type(MockKind::RefArray);
    /// A statically allocated `nothing` object, pre-marked old so the
    /// collector never touches its (nonexistent) allocator metadata.
    static ref NOTHING: ObjectReference = {
        let cell: &'static mut [usize; 2] = Box::leak(Box::new([0; 2]));
        cell[0] = opaque_type(BYTES_IN_WORD).0 | GC_OLD_MARKED as usize;
        ObjectReference::from_raw_address(Address::from_ref(&cell[1])).unwrap()
    };
}

pub struct MockVM;

impl VMBinding for MockVM {
    fn shape_of(object: ObjectReference, tag: TypeTag) -> Option<ObjectShape<Self>> {
        if tag.0 == 0 {
            return None;
        }
        let ty = unsafe { &*(tag.0 as *const MockType) };
        Some(match &ty.kind {
            MockKind::Opaque { size } => ObjectShape::Opaque { size: *size },
            MockKind::RefStruct { layout } => ObjectShape::Struct { layout },
            MockKind::RefArray => {
                let len = unsafe { object.slot(0).load::<usize>() };
                ObjectShape::ObjArray {
                    start: object.slot(1),
                    len,
                    size: (len + 1) * BYTES_IN_WORD,
                }
            }
            MockKind::Weakref => ObjectShape::Weakref,
            MockKind::Callable => ObjectShape::Opaque {
                size: BYTES_IN_WORD,
            },
        })
    }

    fn nothing() -> ObjectReference {
        *NOTHING
    }

    fn weakref_tag() -> TypeTag {
        *WEAKREF_TYPE
    }

    fn run_finalizer(func: ObjectReference, value: ObjectReference) {
        let raw = unsafe { func.slot(0).load::<usize>() };
        let f: fn(ObjectReference) = unsafe { std::mem::transmute(raw) };
        f(value);
    }

    fn out_of_memory(error: AllocationError) -> ! {
        panic!("mock VM out of memory: {error:?}");
    }
}

/// Allocate a managed callable wrapping `f`, for finalizer tests.
pub fn make_callable(mutator: &Mutator<MockVM>, f: fn(ObjectReference)) -> ObjectReference {
    let obj = memory_manager::alloc(mutator, BYTES_IN_WORD, *CALLABLE_TYPE);
    unsafe { obj.slot(0).store(f as usize) };
    obj
}

/// Allocate a reference array of `len` slots, all null.
pub fn make_ref_array(mutator: &Mutator<MockVM>, len: usize) -> ObjectReference {
    let obj = memory_manager::alloc(mutator, (len + 1) * BYTES_IN_WORD, *REF_ARRAY_TYPE);
    unsafe {
        obj.slot(0).store(len);
        for i in 0..len {
            obj.slot(1 + i).store(0usize);
        }
    }
    obj
}
