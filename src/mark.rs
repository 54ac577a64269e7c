//! The mark engine.
//!
//! Marking is an iterative depth-first traversal: instead of recursing, the
//! marker keeps an explicit stack of resumable work items, one variant per
//! scan kernel. A kernel walks its slots until it finds an unmarked child,
//! pushes its own continuation followed by the child's scan frame, and
//! returns to the driver loop. The explicit stack gives unbounded depth, a
//! clean profile, and frames that a future parallel marker could steal.
//!
//! Each kernel threads an `nptr` accumulator through its frame: bit 0 is
//! set when a young reference was seen, bit 1 when the parent itself is
//! old, and the upper bits count references. A parent finishing with both
//! low bits set is pushed onto the remembered set so the next quick
//! collection revisits it.

use atomic::Ordering;

use crate::finalizer::Finalizer;
use crate::header::{self, GC_BITS_MASK, GC_MARKED, GC_OLD, GC_OLD_MARKED};
use crate::heap::big::BigVal;
use crate::riptide::Riptide;
use crate::thread::{ThreadState, MARK_CACHE_BIG_OBJ};
use crate::util::constants::BYTES_IN_WORD;
use crate::util::{Address, ObjectReference};
use crate::vm::frames::{self, ExcStack, GcFrame, GCFRAME_INDIRECT};
use crate::vm::{ArrayElements, ArrayStorage, Binding, FieldOffsets, ObjectShape, TypeTag, VMBinding};

/// A resumable work item. `Scan` is the generic entry; the rest are the
/// specialized kernels mid-object.
#[derive(Copy, Clone, Debug)]
pub enum MarkFrame {
    /// A marked object whose metadata may still need updating, awaiting
    /// shape dispatch.
    Scan {
        obj: ObjectReference,
        tag: usize,
        bits: u8,
        meta_updated: bool,
    },
    /// Dense reference array with a byte stride.
    ObjArray {
        parent: ObjectReference,
        begin: Address,
        end: Address,
        step: usize,
        nptr: usize,
    },
    /// Array of inline structs with an 8-bit field-offset table.
    Array8 {
        parent: ObjectReference,
        begin: Address,
        end: Address,
        elsize: usize,
        fields: &'static [u8],
        fidx: usize,
        nptr: usize,
    },
    /// Array of inline structs with a 16-bit field-offset table.
    Array16 {
        parent: ObjectReference,
        begin: Address,
        end: Address,
        elsize: usize,
        fields: &'static [u16],
        fidx: usize,
        nptr: usize,
    },
    /// Struct with an 8-bit field-offset table.
    Obj8 {
        parent: ObjectReference,
        fields: &'static [u8],
        idx: usize,
        nptr: usize,
    },
    /// Struct with a 16-bit field-offset table.
    Obj16 {
        parent: ObjectReference,
        fields: &'static [u16],
        idx: usize,
        nptr: usize,
    },
    /// Struct with a 32-bit field-offset table.
    Obj32 {
        parent: ObjectReference,
        fields: &'static [u32],
        idx: usize,
        nptr: usize,
    },
    /// A linked chain of GC shadow frames, with copy-stack rebasing.
    Stack {
        frame: Address,
        i: usize,
        nroots: usize,
        offset: usize,
        lb: usize,
        ub: usize,
    },
    /// An exception stack of backtrace records.
    ExcStack {
        stack: Address,
        itr: usize,
        bt_index: usize,
        jlval_index: usize,
    },
    /// A module's binding table, then its usings and parent.
    ModuleBinding {
        parent: ObjectReference,
        table: Address,
        idx: usize,
        nbindings: usize,
        usings: Address,
        nusings: usize,
        mparent: Option<ObjectReference>,
        nptr: usize,
        bits: u8,
    },
    /// A finalizer list; marks both halves of each entry.
    FinList {
        items: *const Finalizer,
        idx: usize,
        len: usize,
        half: u8,
    },
}

/// The single-threaded marker driving a collection's trace. Also handed to
/// root-scanner and foreign-mark callbacks so they can queue objects.
pub struct Marker<'a, VM: VMBinding> {
    gc: &'a Riptide<VM>,
    tls: &'a ThreadState<VM>,
    stack: Vec<MarkFrame>,
    mark_reset_age: bool,
}

impl<'a, VM: VMBinding> Marker<'a, VM> {
    /// Create a marker on the collecting thread, reusing the thread's mark
    /// stack storage.
    pub(crate) fn new(gc: &'a Riptide<VM>, tls: &'a ThreadState<VM>) -> Self {
        let stack = std::mem::take(&mut unsafe { tls.cache_mut() }.mark_stack);
        Marker {
            gc,
            tls,
            stack,
            mark_reset_age: false,
        }
    }

    /// Keep finalizer-reachable objects alive while resetting their age,
    /// so they are collected promptly on the next cycle.
    pub(crate) fn set_reset_age(&mut self, on: bool) {
        self.mark_reset_age = on;
    }

    /// Return the stack storage to the cache.
    pub(crate) fn finish(mut self) {
        debug_assert!(self.stack.is_empty());
        self.stack.clear();
        unsafe { self.tls.cache_mut() }.mark_stack = std::mem::take(&mut self.stack);
    }

    /// Check the reference and atomically set its mark bit. Updates `nptr`
    /// when the child is young. Returns the tag and bits when the object
    /// was freshly marked and needs its metadata updated and a scan.
    fn try_set_mark(&mut self, obj: ObjectReference, nptr: &mut usize) -> Option<(usize, u8)> {
        let word = header::header_word(obj);
        let bits = (word & 0x3) as u8;
        if header::gc_marked(bits) {
            if !header::gc_old(bits) {
                *nptr |= 1;
            }
            return None;
        }
        let (mode, won) = header::set_mark_tag(obj, word, GC_MARKED, self.mark_reset_age);
        if !header::gc_old(mode) {
            *nptr |= 1;
        }
        if won {
            Some((word & !GC_BITS_MASK, mode))
        } else {
            None
        }
    }

    /// Update page or big-object metadata for a freshly marked object.
    /// Called exactly once per object per cycle.
    fn update_meta(&mut self, obj: ObjectReference, bits: u8) {
        let cache = unsafe { self.tls.cache_mut() };
        if let Some(pg) = self.gc.pages.lookup(obj.to_raw_address()) {
            let osize = pg.osize as usize;
            if bits == GC_OLD_MARKED {
                cache.perm_scanned_bytes += osize as i64;
                pg.nold.fetch_add(1, Ordering::Relaxed);
            } else {
                cache.scanned_bytes += osize as i64;
                if self.mark_reset_age {
                    // Reset the object as if it was just allocated.
                    pg.has_young.store(true, Ordering::Relaxed);
                    pg.clear_age_bit(pg.cell_index(obj.header_address()));
                }
            }
            pg.has_marked.store(true, Ordering::Relaxed);
        } else {
            let hdr = BigVal::from_object(obj);
            let sz = unsafe { (*hdr).sz };
            if bits == GC_OLD_MARKED {
                cache.perm_scanned_bytes += sz as i64;
                self.queue_big_marked(hdr, false);
            } else {
                cache.scanned_bytes += sz as i64;
                // A zero age means the object is already on a young list.
                if self.mark_reset_age && unsafe { (*hdr).age } != 0 {
                    unsafe { (*hdr).age = 0 };
                    self.queue_big_marked(hdr, true);
                }
            }
        }
    }

    fn queue_big_marked(&mut self, hdr: *mut BigVal, to_young: bool) {
        let cache = unsafe { self.tls.cache_mut() };
        if cache.big_obj.len() >= MARK_CACHE_BIG_OBJ {
            self.gc.sync_cache(self.tls);
        }
        let cache = unsafe { self.tls.cache_mut() };
        debug_assert!(!hdr.is_null());
        cache
            .big_obj
            .push((unsafe { std::ptr::NonNull::new_unchecked(hdr) }, to_young));
    }

    /// Mark a non-first-class buffer (array storage, binding cell,
    /// exception stack): set its mark bit with the owner's generation and
    /// update its metadata, but never scan it.
    fn set_mark_buf(&mut self, buf: Address, mark_mode: u8, _minsz: usize) {
        let obj = match ObjectReference::from_raw_address(buf) {
            Some(o) => o,
            None => return,
        };
        let word = header::header_word(obj);
        if header::gc_marked((word & 0x3) as u8) {
            return;
        }
        let (bits, won) = header::set_mark_tag(obj, word, mark_mode, self.mark_reset_age);
        if won {
            self.update_meta(obj, bits);
        }
    }

    /// Check `nptr` for `old & refers-to-young` and push the object onto
    /// the collecting thread's remembered set if so.
    fn push_remset(&mut self, obj: ObjectReference, nptr: usize) {
        if nptr & 0x3 == 0x3 {
            let heap = unsafe { self.tls.heap_mut() };
            heap.remset_nptr += nptr >> 2;
            heap.remset.push(obj);
        }
    }

    /// Mark and queue an object for scanning. Returns whether the object
    /// is young (for remset compaction of binding lists).
    pub fn queue_obj(&mut self, obj: ObjectReference) -> bool {
        let mut nptr = 0;
        if let Some((tag, bits)) = self.try_set_mark(obj, &mut nptr) {
            self.stack.push(MarkFrame::Scan {
                obj,
                tag,
                bits,
                meta_updated: false,
            });
        }
        nptr & 1 != 0
    }

    /// Queue an object that is already marked and metadata-updated, so
    /// only the scan runs (remset replay).
    pub(crate) fn queue_scan_obj(&mut self, obj: ObjectReference) {
        let word = header::header_word(obj);
        self.stack.push(MarkFrame::Scan {
            obj,
            tag: word & !GC_BITS_MASK,
            bits: (word & 0x3) as u8,
            meta_updated: true,
        });
    }

    /// Queue a finalizer list segment starting at `start`.
    pub(crate) fn queue_finlist(&mut self, items: &[Finalizer], start: usize) {
        if items.len() <= start {
            return;
        }
        self.stack.push(MarkFrame::FinList {
            items: items.as_ptr(),
            idx: start,
            len: items.len(),
            half: 0,
        });
    }

    /// Queue a thread's local roots: its task slots and previous
    /// exception.
    pub(crate) fn queue_thread_local_roots(&mut self, tls2: &ThreadState<VM>) {
        for root in tls2.thread_local_roots().collect::<Vec<_>>() {
            self.queue_obj(root);
        }
    }

    /// Queue any managed values sitting in a thread's backtrace buffer.
    pub(crate) fn queue_bt_buf(&mut self, tls2: &ThreadState<VM>) {
        let bt = Address::from_usize(tls2.bt_data.load(std::sync::atomic::Ordering::Relaxed));
        let size = tls2.bt_size.load(std::sync::atomic::Ordering::Relaxed);
        if bt.is_zero() {
            return;
        }
        let mut i = 0;
        while i < size {
            unsafe {
                if !frames::bt_is_native(bt, i) {
                    let desc = (bt + (i + 1) * BYTES_IN_WORD).load::<usize>();
                    for j in 0..frames::bt_num_values(desc) {
                        let word = frames::bt_value_word(bt, i, j);
                        if let Some(obj) =
                            ObjectReference::from_raw_address(Address::from_usize(word))
                        {
                            self.queue_obj(obj);
                        }
                    }
                }
                i += frames::bt_entry_size(bt, i);
            }
        }
    }

    /// Replay a thread's remembered sets: every last-cycle remset entry is
    /// re-scanned as an old root, and bindings keep their remset slot only
    /// while they still point at young values.
    pub(crate) fn queue_remset(&mut self, tls2: &ThreadState<VM>) {
        let len = unsafe { tls2.heap_mut() }.last_remset.len();
        for i in 0..len {
            let obj = unsafe { tls2.heap_mut() }.last_remset[i];
            self.queue_scan_obj(obj);
        }

        let len = unsafe { tls2.heap_mut() }.rem_bindings.len();
        let mut n_young = 0;
        for i in 0..len {
            let binding = unsafe { tls2.heap_mut() }.rem_bindings[i];
            let value = unsafe { binding.as_ref() }.value.load(Ordering::Relaxed);
            if let Some(v) = ObjectReference::from_raw_address(Address::from_usize(value)) {
                if self.queue_obj(v) {
                    unsafe { tls2.heap_mut() }.rem_bindings[n_young] = binding;
                    n_young += 1;
                }
            }
        }
        unsafe { tls2.heap_mut() }.rem_bindings.truncate(n_young);
    }

    /// Queue the global root set: pinned roots plus registered root
    /// scanners.
    pub(crate) fn mark_roots(&mut self, mode: crate::controller::CollectMode) {
        let roots: Vec<ObjectReference> = self.gc.global_roots.read().clone();
        for root in roots {
            self.queue_obj(root);
        }
        let scanners: Vec<_> = self.gc.callbacks.root_scanner.read().clone();
        for scanner in scanners {
            scanner(self, mode);
        }
    }

    /// Run the trace to quiescence.
    pub(crate) fn mark_loop(&mut self) {
        while let Some(frame) = self.stack.pop() {
            match frame {
                MarkFrame::Scan {
                    obj,
                    tag,
                    bits,
                    meta_updated,
                } => self.scan(obj, tag, bits, meta_updated),
                MarkFrame::ObjArray { .. } => self.scan_objarray(frame),
                MarkFrame::Array8 { .. } | MarkFrame::Array16 { .. } => self.scan_array_elems(frame),
                MarkFrame::Obj8 { .. } | MarkFrame::Obj16 { .. } | MarkFrame::Obj32 { .. } => {
                    self.scan_obj_fields(frame)
                }
                MarkFrame::Stack { .. } => self.scan_stack(frame),
                MarkFrame::ExcStack { .. } => self.scan_excstack(frame),
                MarkFrame::ModuleBinding { .. } => self.scan_module_binding(frame),
                MarkFrame::FinList { .. } => self.scan_finlist(frame),
            }
        }
    }

    /// Generic scan entry: update metadata and dispatch the object to its
    /// kernel.
    fn scan(&mut self, obj: ObjectReference, tag: usize, bits: u8, meta_updated: bool) {
        // Objects inside the read-only image region have no page or big
        // metadata to update.
        let update = !meta_updated && !self.gc.in_perm_region(obj.header_address());
        let shape = match VM::shape_of(obj, TypeTag(tag)) {
            Some(shape) => shape,
            None => self.assert_datatype_fail(obj, tag),
        };
        match shape {
            ObjectShape::Opaque { .. } | ObjectShape::Weakref => {
                if update {
                    self.update_meta(obj, bits);
                }
            }
            ObjectShape::ObjArray { start, len, .. } => {
                if update {
                    self.update_meta(obj, bits);
                }
                if len == 0 {
                    return;
                }
                let nptr = (len << 2) | (bits & GC_OLD) as usize;
                self.scan_objarray(MarkFrame::ObjArray {
                    parent: obj,
                    begin: start,
                    end: start + len * BYTES_IN_WORD,
                    step: BYTES_IN_WORD,
                    nptr,
                });
            }
            ObjectShape::Struct { layout } => {
                if update {
                    self.update_meta(obj, bits);
                }
                let npointers = layout.npointers();
                if npointers == 0 {
                    return;
                }
                let nptr = (npointers << 2) | (bits & GC_OLD) as usize;
                self.scan_obj_fields(obj_fields_frame(obj, layout.fields, nptr));
            }
            ObjectShape::Array(a) => self.scan_array(obj, a, bits, update),
            ObjectShape::Module(m) => {
                if update {
                    self.update_meta(obj, bits);
                }
                let nptr = ((m.nbindings + m.nusings + 1) << 2) | (bits & GC_OLD) as usize;
                self.scan_module_binding(MarkFrame::ModuleBinding {
                    parent: obj,
                    table: m.bindings,
                    idx: 0,
                    nbindings: m.nbindings,
                    usings: m.usings,
                    nusings: m.nusings,
                    mparent: m.parent,
                    nptr,
                    bits,
                });
            }
            ObjectShape::Task(t) => {
                if update {
                    self.update_meta(obj, bits);
                }
                self.scan_task(obj, t, bits);
            }
            ObjectShape::Foreign(desc) => {
                if update {
                    self.update_meta(obj, bits);
                }
                let old = header::gc_old(header::gc_bits(obj));
                let young = (desc.markfn)(self, obj);
                if old && young > 0 {
                    self.push_remset(obj, (young << 2) | 0x3);
                }
            }
        }
    }

    fn scan_array(&mut self, obj: ObjectReference, a: crate::vm::ArrayShape, bits: u8, update: bool) {
        if update {
            self.update_meta(obj, bits);
        }
        match a.storage {
            ArrayStorage::Inline => {}
            ArrayStorage::OwnedBuffer { buf } => self.set_mark_buf(buf, bits, a.nbytes),
            ArrayStorage::Malloced { .. } => {
                if update {
                    let cache = unsafe { self.tls.cache_mut() };
                    if bits == GC_OLD_MARKED {
                        cache.perm_scanned_bytes += a.nbytes as i64;
                    } else {
                        cache.scanned_bytes += a.nbytes as i64;
                    }
                }
            }
            ArrayStorage::Shared { owner } => {
                let mut nptr = (1 << 2) | (bits & GC_OLD) as usize;
                let mark_owner = self.try_set_mark(owner, &mut nptr);
                self.push_remset(obj, nptr);
                if let Some((tag, obits)) = mark_owner {
                    self.stack.push(MarkFrame::Scan {
                        obj: owner,
                        tag,
                        bits: obits,
                        meta_updated: false,
                    });
                }
                return;
            }
        }
        if a.data.is_zero() || a.len == 0 {
            return;
        }
        match a.elements {
            ArrayElements::Bits => {}
            ArrayElements::Pointers => {
                let nptr = (a.len << 2) | (bits & GC_OLD) as usize;
                self.scan_objarray(MarkFrame::ObjArray {
                    parent: obj,
                    begin: a.data,
                    end: a.data + a.len * BYTES_IN_WORD,
                    step: BYTES_IN_WORD,
                    nptr,
                });
            }
            ArrayElements::InlineStructs { layout } => {
                let npointers = layout.npointers();
                if npointers == 0 {
                    return;
                }
                let nptr = ((a.len * npointers) << 2) | (bits & GC_OLD) as usize;
                let end = a.data + a.len * a.elsize;
                if npointers == 1 {
                    // Uniform stride: scan as a strided reference array.
                    self.scan_objarray(MarkFrame::ObjArray {
                        parent: obj,
                        begin: a.data + layout.fields.get(0) * BYTES_IN_WORD,
                        end,
                        step: a.elsize,
                        nptr,
                    });
                    return;
                }
                match layout.fields {
                    FieldOffsets::U8(fields) => self.scan_array_elems(MarkFrame::Array8 {
                        parent: obj,
                        begin: a.data,
                        end,
                        elsize: a.elsize,
                        fields,
                        fidx: 0,
                        nptr,
                    }),
                    FieldOffsets::U16(fields) => self.scan_array_elems(MarkFrame::Array16 {
                        parent: obj,
                        begin: a.data,
                        end,
                        elsize: a.elsize,
                        fields,
                        fidx: 0,
                        nptr,
                    }),
                    FieldOffsets::U32(_) => {
                        debug_assert!(false, "32-bit field tables never describe inline elements");
                    }
                }
            }
        }
    }

    fn scan_task(&mut self, obj: ObjectReference, t: crate::vm::TaskShape, bits: u8) {
        let scanners: Vec<_> = self.gc.callbacks.task_scanner.read().clone();
        if !scanners.is_empty() {
            let is_root_task = t
                .tid
                .and_then(|tid| self.gc.threads.read().get(tid).copied())
                .map(|tls2| {
                    tls2.root_task.load(std::sync::atomic::Ordering::Relaxed)
                        == obj.to_raw_address().as_usize()
                })
                .unwrap_or(false);
            for scanner in scanners {
                scanner(self, obj, is_root_task);
            }
        }

        if let Some((stkbuf, bufsz)) = t.stkbuf {
            if t.copy_stack != 0 {
                self.set_mark_buf(stkbuf, bits, bufsz);
            }
        }

        // Rebase window for tasks whose stack lives in a copied-out buffer.
        let (mut offset, mut lb, mut ub) = (0usize, 0usize, usize::MAX);
        if t.copy_stack != 0 {
            if let (Some((stkbuf, _)), Some(tid)) = (t.stkbuf, t.tid) {
                if let Some(tls2) = self.gc.threads.read().get(tid).copied() {
                    let stackbase = tls2.stackbase.load(std::sync::atomic::Ordering::Relaxed);
                    if stackbase != 0 {
                        ub = stackbase;
                        lb = ub - t.copy_stack;
                        offset = stkbuf.as_usize().wrapping_sub(lb);
                    }
                }
            }
        }
        if !t.gcstack.is_null() {
            let frame = Address::from_ptr(t.gcstack);
            let nroots = unsafe { frames::read_stack(frame, offset, lb, ub) };
            self.stack.push(MarkFrame::Stack {
                frame,
                i: 0,
                nroots,
                offset,
                lb,
                ub,
            });
        }
        if !t.excstack.is_null() {
            let stack = Address::from_ptr(t.excstack);
            let excstack = unsafe { &*t.excstack };
            self.set_mark_buf(stack, bits, excstack.nbytes());
            self.stack.push(MarkFrame::ExcStack {
                stack,
                itr: excstack.top,
                bt_index: 0,
                jlval_index: 0,
            });
        }
        // The task struct's own fields; assume tasks always reference
        // young objects, so the young bit starts set.
        let npointers = t.layout.npointers();
        if npointers != 0 {
            let nptr = (npointers << 2) | 1 | (bits & GC_OLD) as usize;
            self.scan_obj_fields(obj_fields_frame(obj, t.layout.fields, nptr));
        }
    }

    fn scan_objarray(&mut self, frame: MarkFrame) {
        let MarkFrame::ObjArray {
            parent,
            mut begin,
            end,
            step,
            mut nptr,
        } = frame
        else {
            unreachable!()
        };
        while begin < end {
            let child = unsafe { begin.load::<Option<ObjectReference>>() };
            begin += step;
            if let Some(c) = child {
                if let Some((tag, bits)) = self.try_set_mark(c, &mut nptr) {
                    if begin < end {
                        // Haven't finished this array: push the
                        // continuation back first.
                        self.stack.push(MarkFrame::ObjArray {
                            parent,
                            begin,
                            end,
                            step,
                            nptr,
                        });
                    } else {
                        self.push_remset(parent, nptr);
                    }
                    self.stack.push(MarkFrame::Scan {
                        obj: c,
                        tag,
                        bits,
                        meta_updated: false,
                    });
                    return;
                }
            }
        }
        self.push_remset(parent, nptr);
    }

    fn scan_obj_fields(&mut self, frame: MarkFrame) {
        match frame {
            MarkFrame::Obj8 {
                parent,
                fields,
                idx,
                nptr,
            } => self.scan_obj_fields_w(parent, fields, idx, nptr, |parent, idx, nptr| {
                MarkFrame::Obj8 {
                    parent,
                    fields,
                    idx,
                    nptr,
                }
            }),
            MarkFrame::Obj16 {
                parent,
                fields,
                idx,
                nptr,
            } => self.scan_obj_fields_w(parent, fields, idx, nptr, |parent, idx, nptr| {
                MarkFrame::Obj16 {
                    parent,
                    fields,
                    idx,
                    nptr,
                }
            }),
            MarkFrame::Obj32 {
                parent,
                fields,
                idx,
                nptr,
            } => self.scan_obj_fields_w(parent, fields, idx, nptr, |parent, idx, nptr| {
                MarkFrame::Obj32 {
                    parent,
                    fields,
                    idx,
                    nptr,
                }
            }),
            _ => unreachable!(),
        }
    }

    fn scan_obj_fields_w<T: FieldWidth>(
        &mut self,
        parent: ObjectReference,
        fields: &'static [T],
        mut idx: usize,
        mut nptr: usize,
        mk: impl Fn(ObjectReference, usize, usize) -> MarkFrame,
    ) {
        while idx < fields.len() {
            let slot = parent.slot(fields[idx].field_index());
            idx += 1;
            let child = unsafe { slot.load::<Option<ObjectReference>>() };
            if let Some(c) = child {
                if let Some((tag, bits)) = self.try_set_mark(c, &mut nptr) {
                    if idx < fields.len() {
                        self.stack.push(mk(parent, idx, nptr));
                    } else {
                        self.push_remset(parent, nptr);
                    }
                    self.stack.push(MarkFrame::Scan {
                        obj: c,
                        tag,
                        bits,
                        meta_updated: false,
                    });
                    return;
                }
            }
        }
        self.push_remset(parent, nptr);
    }

    fn scan_array_elems(&mut self, frame: MarkFrame) {
        match frame {
            MarkFrame::Array8 {
                parent,
                begin,
                end,
                elsize,
                fields,
                fidx,
                nptr,
            } => self.scan_array_elems_w(
                parent,
                begin,
                end,
                elsize,
                fields,
                fidx,
                nptr,
                |begin, fidx, nptr| MarkFrame::Array8 {
                    parent,
                    begin,
                    end,
                    elsize,
                    fields,
                    fidx,
                    nptr,
                },
            ),
            MarkFrame::Array16 {
                parent,
                begin,
                end,
                elsize,
                fields,
                fidx,
                nptr,
            } => self.scan_array_elems_w(
                parent,
                begin,
                end,
                elsize,
                fields,
                fidx,
                nptr,
                |begin, fidx, nptr| MarkFrame::Array16 {
                    parent,
                    begin,
                    end,
                    elsize,
                    fields,
                    fidx,
                    nptr,
                },
            ),
            _ => unreachable!(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_array_elems_w<T: FieldWidth>(
        &mut self,
        parent: ObjectReference,
        mut begin: Address,
        end: Address,
        elsize: usize,
        fields: &'static [T],
        mut fidx: usize,
        mut nptr: usize,
        mk: impl Fn(Address, usize, usize) -> MarkFrame,
    ) {
        while begin < end {
            while fidx < fields.len() {
                let slot = begin + fields[fidx].field_index() * BYTES_IN_WORD;
                fidx += 1;
                let child = unsafe { slot.load::<Option<ObjectReference>>() };
                if let Some(c) = child {
                    if let Some((tag, bits)) = self.try_set_mark(c, &mut nptr) {
                        if fidx < fields.len() {
                            self.stack.push(mk(begin, fidx, nptr));
                        } else {
                            let next = begin + elsize;
                            if next < end {
                                self.stack.push(mk(next, 0, nptr));
                            } else {
                                self.push_remset(parent, nptr);
                            }
                        }
                        self.stack.push(MarkFrame::Scan {
                            obj: c,
                            tag,
                            bits,
                            meta_updated: false,
                        });
                        return;
                    }
                }
            }
            fidx = 0;
            begin += elsize;
        }
        self.push_remset(parent, nptr);
    }

    fn scan_stack(&mut self, frame: MarkFrame) {
        let MarkFrame::Stack {
            frame: mut s,
            mut i,
            mut nroots,
            offset,
            lb,
            ub,
        } = frame
        else {
            unreachable!()
        };
        loop {
            let nr = GcFrame::nroots_count(nroots);
            while i < nr {
                let slot = GcFrame::root_slot(s, i);
                let word = unsafe { frames::read_stack(slot, offset, lb, ub) };
                let child_word = if nroots & GCFRAME_INDIRECT != 0 {
                    if word == 0 {
                        i += 1;
                        continue;
                    }
                    unsafe { frames::read_stack(Address::from_usize(word), offset, lb, ub) }
                } else {
                    word
                };
                i += 1;
                if let Some(c) = ObjectReference::from_raw_address(Address::from_usize(child_word))
                {
                    let mut nptr = 0;
                    if let Some((tag, bits)) = self.try_set_mark(c, &mut nptr) {
                        if i < nr {
                            self.stack.push(MarkFrame::Stack {
                                frame: s,
                                i,
                                nroots,
                                offset,
                                lb,
                                ub,
                            });
                        } else {
                            let prev = unsafe {
                                frames::read_stack(s + BYTES_IN_WORD, offset, lb, ub)
                            };
                            if prev != 0 {
                                let prev = Address::from_usize(prev);
                                let new_nroots =
                                    unsafe { frames::read_stack(prev, offset, lb, ub) };
                                self.stack.push(MarkFrame::Stack {
                                    frame: prev,
                                    i: 0,
                                    nroots: new_nroots,
                                    offset,
                                    lb,
                                    ub,
                                });
                            }
                        }
                        self.stack.push(MarkFrame::Scan {
                            obj: c,
                            tag,
                            bits,
                            meta_updated: false,
                        });
                        return;
                    }
                }
            }
            // walk up one stack frame
            let prev = unsafe { frames::read_stack(s + BYTES_IN_WORD, offset, lb, ub) };
            if prev == 0 {
                return;
            }
            s = Address::from_usize(prev);
            i = 0;
            nroots = unsafe { frames::read_stack(s, offset, lb, ub) };
        }
    }

    fn scan_excstack(&mut self, frame: MarkFrame) {
        let MarkFrame::ExcStack {
            stack,
            mut itr,
            mut bt_index,
            mut jlval_index,
        } = frame
        else {
            unreachable!()
        };
        let excstack: &ExcStack = unsafe { &*stack.to_ptr() };
        while itr > 0 {
            let bt_size = excstack.bt_size(itr);
            let bt = excstack.bt_entry_addr(itr, 0);
            while bt_index < bt_size {
                if unsafe { frames::bt_is_native(bt, bt_index) } {
                    bt_index += 1;
                    continue;
                }
                // Found an extended backtrace entry: iterate over any
                // managed values inside.
                let desc = unsafe { (bt + (bt_index + 1) * BYTES_IN_WORD).load::<usize>() };
                let njlvals = frames::bt_num_values(desc);
                while jlval_index < njlvals {
                    let word = unsafe { frames::bt_value_word(bt, bt_index, jlval_index) };
                    jlval_index += 1;
                    if let Some(c) = ObjectReference::from_raw_address(Address::from_usize(word)) {
                        let mut nptr = 0;
                        if let Some((tag, bits)) = self.try_set_mark(c, &mut nptr) {
                            self.stack.push(MarkFrame::ExcStack {
                                stack,
                                itr,
                                bt_index,
                                jlval_index,
                            });
                            self.stack.push(MarkFrame::Scan {
                                obj: c,
                                tag,
                                bits,
                                meta_updated: false,
                            });
                            return;
                        }
                    }
                }
                jlval_index = 0;
                bt_index += unsafe { frames::bt_entry_size(bt, bt_index) };
            }
            // The exception comes last.
            let exc = excstack.exception_word(itr);
            itr = excstack.next(itr);
            bt_index = 0;
            jlval_index = 0;
            if let Some(c) = ObjectReference::from_raw_address(Address::from_usize(exc)) {
                let mut nptr = 0;
                if let Some((tag, bits)) = self.try_set_mark(c, &mut nptr) {
                    self.stack.push(MarkFrame::ExcStack {
                        stack,
                        itr,
                        bt_index,
                        jlval_index,
                    });
                    self.stack.push(MarkFrame::Scan {
                        obj: c,
                        tag,
                        bits,
                        meta_updated: false,
                    });
                    return;
                }
            }
        }
    }

    fn scan_module_binding(&mut self, frame: MarkFrame) {
        let MarkFrame::ModuleBinding {
            parent,
            table,
            mut idx,
            nbindings,
            usings,
            nusings,
            mparent,
            mut nptr,
            bits,
        } = frame
        else {
            unreachable!()
        };
        let repush = |idx: usize, nptr: usize| MarkFrame::ModuleBinding {
            parent,
            table,
            idx,
            nbindings,
            usings,
            nusings,
            mparent,
            nptr,
            bits,
        };
        while idx < nbindings {
            let slot = table + idx * BYTES_IN_WORD;
            idx += 1;
            let b_ptr = unsafe { slot.load::<*const Binding>() };
            if b_ptr.is_null() {
                continue;
            }
            let b_addr = Address::from_ptr(b_ptr);
            let b_obj = unsafe { ObjectReference::from_raw_address_unchecked(b_addr) };
            if self.gc.in_perm_region(b_obj.header_address()) {
                // Bindings inside the read-only image are pinned old.
                let word = header::header_word(b_obj);
                if !header::gc_marked((word & 0x3) as u8) {
                    header::set_mark_tag(b_obj, word, GC_OLD_MARKED, false);
                }
            } else {
                self.set_mark_buf(b_addr, bits, std::mem::size_of::<Binding>());
            }
            let b = unsafe { &*b_ptr };

            let ty = b.ty.load(Ordering::Relaxed);
            if let Some(ty) = ObjectReference::from_raw_address(Address::from_usize(ty)) {
                if let Some((tag, tbits)) = self.try_set_mark(ty, &mut nptr) {
                    // Revisit this binding for its value slots once the
                    // type is scanned.
                    self.stack.push(repush(idx - 1, nptr));
                    self.stack.push(MarkFrame::Scan {
                        obj: ty,
                        tag,
                        bits: tbits,
                        meta_updated: false,
                    });
                    return;
                }
            }
            let value = b.value.load(Ordering::Relaxed);
            let globalref = b.globalref.load(Ordering::Relaxed);
            if let Some(v) = ObjectReference::from_raw_address(Address::from_usize(value)) {
                if let Some((tag, vbits)) = self.try_set_mark(v, &mut nptr) {
                    self.stack.push(repush(idx, nptr));
                    if let Some(g) =
                        ObjectReference::from_raw_address(Address::from_usize(globalref))
                    {
                        if let Some((gtag, gbits)) = self.try_set_mark(g, &mut nptr) {
                            self.stack.push(MarkFrame::Scan {
                                obj: g,
                                tag: gtag,
                                bits: gbits,
                                meta_updated: false,
                            });
                        }
                    }
                    self.stack.push(MarkFrame::Scan {
                        obj: v,
                        tag,
                        bits: vbits,
                        meta_updated: false,
                    });
                    return;
                }
            }
            if let Some(g) = ObjectReference::from_raw_address(Address::from_usize(globalref)) {
                if let Some((tag, gbits)) = self.try_set_mark(g, &mut nptr) {
                    self.stack.push(repush(idx, nptr));
                    self.stack.push(MarkFrame::Scan {
                        obj: g,
                        tag,
                        bits: gbits,
                        meta_updated: false,
                    });
                    return;
                }
            }
        }

        // Bindings done: the parent module and the usings list remain.
        // The usings array is scanned because bindings for used modules
        // are only created on first access; this array may hold the only
        // reference.
        let mut scan_parent = None;
        if let Some(p) = mparent {
            if let Some((tag, pbits)) = self.try_set_mark(p, &mut nptr) {
                scan_parent = Some((p, tag, pbits));
            }
        }
        if nusings > 0 {
            let objarray = MarkFrame::ObjArray {
                parent,
                begin: usings,
                end: usings + nusings * BYTES_IN_WORD,
                step: BYTES_IN_WORD,
                nptr,
            };
            if scan_parent.is_none() {
                self.scan_objarray(objarray);
            } else {
                self.stack.push(objarray);
            }
        } else {
            self.push_remset(parent, nptr);
        }
        if let Some((p, tag, pbits)) = scan_parent {
            self.stack.push(MarkFrame::Scan {
                obj: p,
                tag,
                bits: pbits,
                meta_updated: false,
            });
        }
    }

    fn scan_finlist(&mut self, frame: MarkFrame) {
        let MarkFrame::FinList {
            items,
            mut idx,
            len,
            mut half,
        } = frame
        else {
            unreachable!()
        };
        while idx < len {
            let entry = unsafe { *items.add(idx) };
            let target = match (entry, half) {
                (Finalizer::Managed { value, .. }, 0) => Some(value),
                (Finalizer::Managed { func, .. }, _) => Some(func),
                (Finalizer::Native { value, .. }, 0) => Some(value),
                _ => None,
            };
            let more_halves = matches!(entry, Finalizer::Managed { .. }) && half == 0;
            if more_halves {
                half = 1;
            } else {
                half = 0;
                idx += 1;
            }
            if let Some(c) = target {
                let mut nptr = 0;
                if let Some((tag, bits)) = self.try_set_mark(c, &mut nptr) {
                    if idx < len {
                        self.stack.push(MarkFrame::FinList {
                            items,
                            idx,
                            len,
                            half,
                        });
                    }
                    self.stack.push(MarkFrame::Scan {
                        obj: c,
                        tag,
                        bits,
                        meta_updated: false,
                    });
                    return;
                }
            }
        }
    }

    fn assert_datatype_fail(&self, obj: ObjectReference, tag: usize) -> ! {
        error!(
            "GC error (probable corruption): object {} has non-datatype tag {:#x}",
            obj, tag
        );
        error!(
            "mark stack depth at failure: {}; dumping up to 16 frames",
            self.stack.len()
        );
        for frame in self.stack.iter().rev().take(16) {
            error!("  {:?}", frame);
        }
        std::process::abort();
    }
}

/// Field-offset element widths usable by the struct kernels.
pub trait FieldWidth: Copy + 'static {
    fn field_index(self) -> usize;
}

impl FieldWidth for u8 {
    fn field_index(self) -> usize {
        self as usize
    }
}

impl FieldWidth for u16 {
    fn field_index(self) -> usize {
        self as usize
    }
}

impl FieldWidth for u32 {
    fn field_index(self) -> usize {
        self as usize
    }
}

fn obj_fields_frame(parent: ObjectReference, fields: FieldOffsets, nptr: usize) -> MarkFrame {
    match fields {
        FieldOffsets::U8(fields) => MarkFrame::Obj8 {
            parent,
            fields,
            idx: 0,
            nptr,
        },
        FieldOffsets::U16(fields) => MarkFrame::Obj16 {
            parent,
            fields,
            idx: 0,
            nptr,
        },
        FieldOffsets::U32(fields) => MarkFrame::Obj32 {
            parent,
            fields,
            idx: 0,
            nptr,
        },
    }
}
