//! Scannable object shapes.
//!
//! [`crate::vm::VMBinding::shape_of`] translates a type tag into one of
//! these descriptors; the mark engine dispatches on the variant to pick a
//! scan kernel. The descriptors deliberately mirror what runtimes keep in
//! their datatype layouts: pointer-field counts, field-offset tables of
//! three widths, array storage flags and task bookkeeping.

use std::sync::atomic::AtomicUsize;

use crate::mark::Marker;
use crate::util::{Address, ObjectReference};
use crate::vm::frames::{ExcStack, GcFrame};
use crate::vm::VMBinding;

/// Word indices of the reference fields of a struct payload, in one of
/// three widths. Which width a type uses is the runtime's choice; the
/// collector has a scan kernel per width.
#[derive(Copy, Clone, Debug)]
pub enum FieldOffsets {
    U8(&'static [u8]),
    U16(&'static [u16]),
    U32(&'static [u32]),
}

impl FieldOffsets {
    pub fn len(&self) -> usize {
        match self {
            FieldOffsets::U8(f) => f.len(),
            FieldOffsets::U16(f) => f.len(),
            FieldOffsets::U32(f) => f.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `i`th reference-field word index.
    pub fn get(&self, i: usize) -> usize {
        match self {
            FieldOffsets::U8(f) => f[i] as usize,
            FieldOffsets::U16(f) => f[i] as usize,
            FieldOffsets::U32(f) => f[i] as usize,
        }
    }
}

/// Layout of a struct-like datatype.
#[derive(Copy, Clone, Debug)]
pub struct DataTypeLayout {
    /// Payload size in bytes, excluding the header word.
    pub size: usize,
    /// Word indices of the reference fields within the payload. The number
    /// of pointers is the length of the table.
    pub fields: FieldOffsets,
}

impl DataTypeLayout {
    pub fn npointers(&self) -> usize {
        self.fields.len()
    }

    /// The word index of the first reference field, used by the multi-root
    /// write barrier to probe for young children.
    pub fn first_ptr(&self) -> Option<usize> {
        if self.fields.is_empty() {
            None
        } else {
            Some(self.fields.get(0))
        }
    }
}

/// How an array's element storage was obtained.
#[derive(Copy, Clone, Debug)]
pub enum ArrayStorage {
    /// Elements are inline, directly after the array header.
    Inline,
    /// Elements live in a separate managed buffer object.
    OwnedBuffer { buf: Address },
    /// Elements live in a malloc'd buffer tracked by the malloc'd-array
    /// sweep; `aligned` selects the free primitive.
    Malloced { aligned: bool },
    /// The storage belongs to another array.
    Shared { owner: ObjectReference },
}

/// What an array's elements contain.
#[derive(Copy, Clone, Debug)]
pub enum ArrayElements {
    /// No references; nothing to scan.
    Bits,
    /// A dense array of object references.
    Pointers,
    /// Inline structs, each scanned with the given layout's field table.
    InlineStructs { layout: &'static DataTypeLayout },
}

/// Shape of an array object.
#[derive(Copy, Clone, Debug)]
pub struct ArrayShape {
    /// First element.
    pub data: Address,
    /// Element count.
    pub len: usize,
    /// Element size in bytes.
    pub elsize: usize,
    /// Total storage bytes (for accounting and the malloc'd-array sweep).
    pub nbytes: usize,
    pub storage: ArrayStorage,
    pub elements: ArrayElements,
}

/// A module binding cell. Lives outside the object graph proper (bindings
/// are buffers with headers, not first-class objects); the mark engine
/// scans the three reference slots with relaxed loads because mutators may
/// publish to them between safepoints.
#[repr(C)]
pub struct Binding {
    /// The bound value, or 0.
    pub value: AtomicUsize,
    /// The cached globalref object, or 0.
    pub globalref: AtomicUsize,
    /// The declared type of the binding, or 0.
    pub ty: AtomicUsize,
}

/// Shape of a module object.
#[derive(Copy, Clone, Debug)]
pub struct ModuleShape {
    /// Array of nullable `*mut Binding` slots.
    pub bindings: Address,
    /// Number of binding slots.
    pub nbindings: usize,
    /// Array of object references for `using`ed modules.
    pub usings: Address,
    pub nusings: usize,
    /// The enclosing module.
    pub parent: Option<ObjectReference>,
    /// Module struct size in bytes (payload, excluding header).
    pub size: usize,
}

/// Shape of a task object.
#[derive(Copy, Clone, Debug)]
pub struct TaskShape {
    /// The task struct's own reference fields. Runtimes keep these in the
    /// 8-bit width; the kernel asserts it.
    pub layout: &'static DataTypeLayout,
    /// The stack buffer and its size, if the task owns one.
    pub stkbuf: Option<(Address, usize)>,
    /// Nonzero when the task runs on a copied stack: the number of bytes
    /// copied out, used to rebase frame pointers.
    pub copy_stack: usize,
    /// Head of the GC shadow-frame chain, or null.
    pub gcstack: *mut GcFrame,
    /// The exception stack, or null.
    pub excstack: *mut ExcStack,
    /// The thread the task last ran on, when it is not running in place.
    pub tid: Option<usize>,
}

/// Dynamic layout for foreign object types: the runtime marks and sweeps
/// these itself through function pointers.
pub struct ForeignDescriptor<VM: VMBinding> {
    /// Mark the object's children; returns the number of young references
    /// found so the caller can maintain the old-to-young invariant.
    pub markfn: for<'a, 'b> fn(&'b mut Marker<'a, VM>, ObjectReference) -> usize,
    /// Release the object's external resources when it is swept.
    pub sweepfn: fn(ObjectReference),
}

/// Everything the mark engine can scan.
pub enum ObjectShape<VM: VMBinding> {
    /// No reference fields (bits types, strings, symbols). `size` is the
    /// payload size in bytes.
    Opaque { size: usize },
    /// A dense inline array of object references starting at `start`
    /// (svec-like). `size` is the payload size in bytes.
    ObjArray {
        start: Address,
        len: usize,
        size: usize,
    },
    /// A struct with a field-offset table.
    Struct { layout: &'static DataTypeLayout },
    Array(ArrayShape),
    Module(ModuleShape),
    Task(TaskShape),
    /// A weak reference; the referent slot is deliberately not scanned.
    Weakref,
    Foreign(&'static ForeignDescriptor<VM>),
}
