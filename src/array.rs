//! Functionality relating to the array type.
//!
//! [`ArrayRef`] reads any array — immutable slots in a document buffer or a
//! mutable heap node — through one API. [`MutableArray`] is a retained
//! handle to a heap node holding a slot per element over an optional
//! immutable *source*: unset slots read through to the source at the same
//! index, so wrapping an array is O(count) empty slots, not a deep copy.

use std::cell::Cell;
use std::fmt::{self, Debug, Formatter};
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use crate::encoder::Encoder;
use crate::heap::{self, HeapHeader};
use crate::slot::{SlotValue, ValueSlot};
use crate::value::{self, Tag, ValueRef};

/// A reference to an array value, mutable or immutable.
#[derive(Copy, Clone)]
pub struct ArrayRef<'a>(ValueRef<'a>);

impl<'a> ArrayRef<'a> {
    pub(crate) fn new(v: ValueRef<'a>) -> Self {
        debug_assert_eq!(v.tag(), Tag::Array);
        ArrayRef(v)
    }

    /// The underlying value reference.
    #[must_use]
    pub fn value(&self) -> ValueRef<'a> {
        self.0
    }

    /// Whether this array is a mutable overlay.
    #[must_use]
    pub fn is_mutable(&self) -> bool {
        self.0.is_mutable()
    }

    /// Number of elements.
    #[must_use]
    pub fn count(&self) -> usize {
        if self.is_mutable() {
            // Safety: mutable array refs denote live HeapArray nodes.
            unsafe { heap_node(self.0) }.items.len()
        } else {
            // Safety: immutable arrays were validated on decode.
            unsafe { value::coll_info(self.0.ptr()) }.count
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// The element at `index`, or `None` past the end. Unset overlay slots
    /// within range read as null.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<ValueRef<'a>> {
        if self.is_mutable() {
            // Safety: as above.
            unsafe { heap_node(self.0) }.get(index)
        } else {
            // Safety: as above.
            unsafe {
                let info = value::coll_info(self.0.ptr());
                if index >= info.count {
                    return None;
                }
                let slot = info.elems.add(index * info.width());
                Some(ValueRef::from_ptr(value::deref_slot(slot, info.wide)))
            }
        }
    }

    /// Iterates the elements in index order.
    #[must_use]
    pub fn iter(&self) -> ArrayIter<'a> {
        ArrayIter {
            array: *self,
            index: 0,
        }
    }
}

impl<'a> IntoIterator for &ArrayRef<'a> {
    type Item = ValueRef<'a>;
    type IntoIter = ArrayIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl Debug for ArrayRef<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value().to_json())
    }
}

/// Iterator over array elements.
pub struct ArrayIter<'a> {
    array: ArrayRef<'a>,
    index: usize,
}

impl<'a> Iterator for ArrayIter<'a> {
    type Item = ValueRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let v = self.array.get(self.index)?;
        self.index += 1;
        Some(v)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.array.count().saturating_sub(self.index);
        (n, Some(n))
    }
}

impl ExactSizeIterator for ArrayIter<'_> {}

/// Heap node of a mutable array.
#[repr(C)]
pub(crate) struct HeapArray<'a> {
    hd: HeapHeader,
    source: Option<ArrayRef<'a>>,
    items: Vec<ValueSlot<'a>>,
}

const _: () = assert!(mem::offset_of!(HeapArray<'static>, hd) == 0);

impl<'a> HeapArray<'a> {
    fn get(&self, index: usize) -> Option<ValueRef<'a>> {
        let slot = self.items.get(index)?;
        if let Some(v) = slot.value() {
            return Some(v);
        }
        if let Some(src) = self.source {
            if index < src.count() {
                return src.get(index);
            }
        }
        Some(ValueRef::null())
    }

    pub(crate) fn write_to(&self, enc: &mut Encoder<'_>) {
        enc.begin_array();
        for i in 0..self.items.len() {
            match self.get(i) {
                Some(v) => enc.write_value(v),
                None => enc.write_null(),
            }
        }
        enc.end_array();
    }
}

/// Recovers the node behind a mutable array value.
///
/// # Safety
/// `v` must be an odd, array-tagged value pointer of a live node.
pub(crate) unsafe fn heap_node<'x>(v: ValueRef<'x>) -> &'x HeapArray<'x> {
    &*heap::header_ptr(v.ptr()).cast::<HeapArray<'x>>()
}

/// Drops an array node whose refcount reached zero.
///
/// # Safety
/// `hd` must be the header of a `HeapArray` allocated by `MutableArray`.
pub(crate) unsafe fn drop_heap_array(hd: *mut HeapHeader) {
    drop(Box::from_raw(hd.cast::<HeapArray<'static>>()));
}

/// Promotes an array value to a mutable handle: retains it if already
/// mutable, otherwise wraps it as the source of a fresh overlay.
pub(crate) fn promote<'a>(v: ValueRef<'a>) -> Option<MutableArray<'a>> {
    if v.tag() != Tag::Array {
        return None;
    }
    if v.is_mutable() {
        // Safety: odd array-tagged pointer is a live HeapArray.
        Some(unsafe { MutableArray::retained_from_value(v) })
    } else {
        Some(MutableArray::from_array(ArrayRef::new(v)))
    }
}

/// A retained handle to a mutable array.
///
/// Cloning retains the same node; dropping the last handle (and the last
/// slot referencing the node) frees it. Not `Send`/`Sync`: mutable trees
/// are single-threaded scratchpads.
pub struct MutableArray<'a> {
    node: NonNull<HeapArray<'a>>,
    _own: PhantomData<Cell<&'a [u8]>>,
}

impl<'a> MutableArray<'a> {
    fn from_node(node: HeapArray<'a>) -> Self {
        // Safety: Box never returns null.
        let node = unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(node))) };
        MutableArray {
            node,
            _own: PhantomData,
        }
    }

    /// An empty mutable array with no source.
    #[must_use]
    pub fn new() -> Self {
        Self::from_node(HeapArray {
            hd: HeapHeader::new_container(Tag::Array),
            source: None,
            items: Vec::new(),
        })
    }

    /// A mutable overlay over an immutable array. The caller keeps the
    /// source's buffer alive for the overlay's lifetime.
    #[must_use]
    pub fn from_array(source: ArrayRef<'a>) -> Self {
        debug_assert!(!source.is_mutable());
        let mut items = Vec::new();
        items.resize_with(source.count(), ValueSlot::empty);
        Self::from_node(HeapArray {
            hd: HeapHeader::new_container(Tag::Array),
            source: Some(source),
            items,
        })
    }

    /// # Safety
    /// `v` must be an odd, array-tagged value pointer of a live node.
    pub(crate) unsafe fn retained_from_value(v: ValueRef<'a>) -> Self {
        heap::retain(v.ptr());
        MutableArray {
            node: NonNull::new_unchecked(heap::header_ptr(v.ptr()).cast()),
            _own: PhantomData,
        }
    }

    fn node(&self) -> &HeapArray<'a> {
        // Safety: the handle retains the node.
        unsafe { self.node.as_ref() }
    }

    fn node_mut(&mut self) -> &mut HeapArray<'a> {
        // Safety: the handle retains the node; trees are single-threaded.
        unsafe { self.node.as_mut() }
    }

    /// The node's value pointer, independent of this handle's borrow.
    pub(crate) fn value_ref(&self) -> ValueRef<'a> {
        // Safety: odd value pointer of a live node.
        unsafe { ValueRef::from_ptr(heap::value_ptr(self.node.as_ptr())) }
    }

    /// This array as a plain value.
    #[must_use]
    pub fn as_value(&self) -> ValueRef<'a> {
        self.value_ref()
    }

    /// This array behind the common read API.
    #[must_use]
    pub fn as_array(&self) -> ArrayRef<'_> {
        ArrayRef::new(self.value_ref())
    }

    /// The immutable source this overlay reads through, if any.
    #[must_use]
    pub fn source(&self) -> Option<ArrayRef<'a>> {
        self.node().source
    }

    /// Whether any mutation happened since construction.
    #[must_use]
    pub fn is_changed(&self) -> bool {
        self.node().hd.is_changed()
    }

    fn mark_changed(&mut self) {
        self.node().hd.set_changed(true);
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.node().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// The element at `index`; unset slots within range read through to the
    /// source, or as null beyond it. `None` past the end.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<ValueRef<'_>> {
        self.node().get(index)
    }

    /// Iterates elements in index order.
    #[must_use]
    pub fn iter(&self) -> ArrayIter<'_> {
        self.as_array().iter()
    }

    /// Overwrites the element at `index`.
    ///
    /// # Panics
    /// If `index` is out of bounds.
    pub fn set(&mut self, index: usize, v: impl SlotValue<'a>) {
        v.write_into(&mut self.node_mut().items[index]);
        self.mark_changed();
    }

    /// Appends an element, growing the array by one.
    pub fn append(&mut self, v: impl SlotValue<'a>) {
        let items = &mut self.node_mut().items;
        items.push(ValueSlot::empty());
        v.write_into(items.last_mut().expect("just pushed"));
        self.mark_changed();
    }

    /// Inserts `n` null elements at `index`, shifting the tail right.
    ///
    /// # Panics
    /// If `index` is past the end.
    pub fn insert(&mut self, index: usize, n: usize) {
        assert!(index <= self.count(), "insert past end of array");
        // Shifted slots can no longer read through by position.
        self.populate(index);
        let _ = self
            .node_mut()
            .items
            .splice(index..index, std::iter::repeat_with(ValueSlot::null).take(n));
        self.mark_changed();
    }

    /// Removes `n` elements starting at `index`, shifting the tail left.
    ///
    /// # Panics
    /// If the range is out of bounds.
    pub fn remove(&mut self, index: usize, n: usize) {
        assert!(
            index.checked_add(n).is_some_and(|end| end <= self.count()),
            "remove past end of array"
        );
        self.populate(index + n);
        let _ = self.node_mut().items.drain(index..index + n);
        self.mark_changed();
    }

    /// Grows the array with null-reading slots, or truncates it.
    pub fn resize(&mut self, n: usize) {
        if n == self.count() {
            return;
        }
        self.node_mut().items.resize_with(n, ValueSlot::empty);
        self.mark_changed();
    }

    /// Materializes source elements from `from` onward so that the tail no
    /// longer depends on positional read-through.
    fn populate(&mut self, from: usize) {
        let node = self.node_mut();
        let Some(src) = node.source else { return };
        let end = node.items.len().min(src.count());
        for i in from..end {
            if node.items[i].is_empty() {
                if let Some(v) = src.get(i) {
                    node.items[i].set_value(v);
                }
            }
        }
    }

    /// Promotes the element at `index` to a mutable array, storing the
    /// promotion back into the slot. `None` if it is not an array.
    pub fn get_mutable_array(&mut self, index: usize) -> Option<MutableArray<'a>> {
        let node = self.node_mut();
        if index >= node.items.len() {
            return None;
        }
        let result = if !node.items[index].is_empty() {
            node.items[index].make_mutable_array()
        } else {
            let v = node
                .source
                .filter(|s| index < s.count())
                .and_then(|s| s.get(index))?;
            let ma = promote(v)?;
            node.items[index].set_value(ma.value_ref());
            Some(ma)
        };
        if result.is_some() {
            self.mark_changed();
        }
        result
    }

    /// Promotes the element at `index` to a mutable dictionary.
    pub fn get_mutable_dict(&mut self, index: usize) -> Option<crate::dict::MutableDict<'a>> {
        let node = self.node_mut();
        if index >= node.items.len() {
            return None;
        }
        let result = if !node.items[index].is_empty() {
            node.items[index].make_mutable_dict()
        } else {
            let v = node
                .source
                .filter(|s| index < s.count())
                .and_then(|s| s.get(index))?;
            let md = crate::dict::promote(v)?;
            node.items[index].set_value(md.value_ref());
            Some(md)
        };
        if result.is_some() {
            self.mark_changed();
        }
        result
    }
}

impl Default for MutableArray<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MutableArray<'_> {
    fn clone(&self) -> Self {
        // Safety: the node is alive; the clone owns its own reference.
        unsafe { heap::retain(heap::value_ptr(self.node.as_ptr())) };
        MutableArray {
            node: self.node,
            _own: PhantomData,
        }
    }
}

impl Drop for MutableArray<'_> {
    fn drop(&mut self) {
        // Safety: the handle owns one reference.
        unsafe { heap::release(heap::value_ptr(self.node.as_ptr())) };
    }
}

impl PartialEq for MutableArray<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl Eq for MutableArray<'_> {}

impl Debug for MutableArray<'_> {
    fmt_via_json!();
}
