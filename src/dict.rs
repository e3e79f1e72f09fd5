//! Functionality relating to the dictionary type.
//!
//! Dictionaries keep their pairs in ascending byte order of the keys, so a
//! mutable overlay ([`MutableDict`]) and its immutable *source* merge in a
//! single pass: a sorted `BTreeMap` of changed slots over the sorted source
//! pairs. Empty overlay slots are tombstones recording removals of source
//! keys. A dictionary in a delta may also be *inherited*: its first key is
//! the short-int [`PARENT_KEY`](crate::value) whose value points back at
//! the parent dict, and an `undefined` value marks a parent key deleted.

use std::cell::Cell;
use std::collections::btree_map::Iter as MapIter;
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::iter::Peekable;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use crate::array::MutableArray;
use crate::encoder::Encoder;
use crate::heap::{self, HeapHeader};
use crate::slot::{SlotValue, ValueSlot};
use crate::value::{self, Tag, ValueRef, PARENT_KEY};

/// A reference to a dictionary value, mutable or immutable.
#[derive(Copy, Clone)]
pub struct DictRef<'a>(ValueRef<'a>);

impl<'a> DictRef<'a> {
    pub(crate) fn new(v: ValueRef<'a>) -> Self {
        debug_assert_eq!(v.tag(), Tag::Dict);
        DictRef(v)
    }

    /// The underlying value reference.
    #[must_use]
    pub fn value(&self) -> ValueRef<'a> {
        self.0
    }

    /// Whether this dictionary is a mutable overlay.
    #[must_use]
    pub fn is_mutable(&self) -> bool {
        self.0.is_mutable()
    }

    /// Number of live keys. For inherited dictionaries this merges the
    /// parent chain.
    #[must_use]
    pub fn count(&self) -> usize {
        if self.is_mutable() {
            // Safety: mutable dict refs denote live HeapDict nodes.
            unsafe { heap_node(self.0) }.count as usize
        } else if self.parent().is_some() {
            self.iter().count()
        } else {
            // Safety: immutable dicts were validated on decode.
            unsafe { value::coll_info(self.0.ptr()) }.count
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Looks up a key; `None` for missing or deleted keys.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<ValueRef<'a>> {
        if self.is_mutable() {
            // Safety: as above.
            unsafe { heap_node(self.0) }.get(key)
        } else {
            self.get_imm(key.as_bytes())
        }
    }

    fn get_imm(&self, key: &[u8]) -> Option<ValueRef<'a>> {
        let mut parent = None;
        for (k, v) in self.raw_entries() {
            match k.tag() {
                Tag::Short | Tag::Int => {
                    if k.as_int() == PARENT_KEY {
                        parent = v.as_dict();
                    }
                }
                Tag::String => match k.str_bytes().cmp(key) {
                    std::cmp::Ordering::Less => continue,
                    std::cmp::Ordering::Equal => {
                        return if v.is_undefined() { None } else { Some(v) };
                    }
                    // Keys are sorted: not among the own pairs.
                    std::cmp::Ordering::Greater => break,
                },
                _ => {}
            }
        }
        parent.and_then(|p: DictRef<'a>| p.get_imm(key))
    }

    /// The parent dict of an inherited dictionary.
    pub(crate) fn parent(&self) -> Option<DictRef<'a>> {
        if self.is_mutable() {
            return None;
        }
        let (k, v) = self.raw_entries().next()?;
        if matches!(k.tag(), Tag::Short | Tag::Int) && k.as_int() == PARENT_KEY {
            v.as_dict()
        } else {
            None
        }
    }

    /// Raw `(key, value)` pairs of an immutable dict, parent pair and
    /// deletion markers included.
    pub(crate) fn raw_entries(&self) -> RawEntries<'a> {
        debug_assert!(!self.is_mutable());
        // Safety: immutable dicts were validated on decode.
        let info = unsafe { value::coll_info(self.0.ptr()) };
        RawEntries {
            slot: info.elems,
            remaining: info.count,
            wide: info.wide,
            _buf: PhantomData,
        }
    }

    /// Iterates live `(key, value)` pairs in ascending key order, merging
    /// the overlay or parent chain.
    #[must_use]
    pub fn iter(&self) -> DictIter<'a> {
        if self.is_mutable() {
            // Safety: the node outlives 'a through the handle or slot that
            // produced this reference.
            unsafe { heap_node(self.0) }.entries()
        } else {
            DictIter {
                base: self.parent().map(|p| Box::new(p.iter().peekable())),
                over: OverlayIter::Raw(self.raw_entries()).peekable(),
            }
        }
    }
}

impl<'a> IntoIterator for &DictRef<'a> {
    type Item = (&'a str, ValueRef<'a>);
    type IntoIter = DictIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl Debug for DictRef<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value().to_json())
    }
}

/// Raw slot walker over an immutable dict's pairs.
pub(crate) struct RawEntries<'a> {
    slot: *const u8,
    remaining: usize,
    wide: bool,
    _buf: PhantomData<&'a [u8]>,
}

impl<'a> Iterator for RawEntries<'a> {
    type Item = (ValueRef<'a>, ValueRef<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let w = if self.wide { 4 } else { 2 };
        // Safety: slots were validated on decode.
        let pair = unsafe {
            (
                ValueRef::from_ptr(value::deref_slot(self.slot, self.wide)),
                ValueRef::from_ptr(value::deref_slot(self.slot.add(w), self.wide)),
            )
        };
        self.slot = unsafe { self.slot.add(2 * w) };
        self.remaining -= 1;
        Some(pair)
    }
}

/// The overlay side of a merge: sorted entries where `None` marks a
/// removed (or parent-deleted) key.
enum OverlayIter<'a> {
    Map(MapIter<'a, Box<[u8]>, ValueSlot<'a>>),
    Raw(RawEntries<'a>),
}

impl<'a> Iterator for OverlayIter<'a> {
    type Item = (&'a [u8], Option<ValueRef<'a>>);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            OverlayIter::Map(it) => it.next().map(|(k, slot)| (&**k as &[u8], slot.value())),
            OverlayIter::Raw(it) => loop {
                let (k, v) = it.next()?;
                if k.tag() == Tag::String {
                    let v = if v.is_undefined() { None } else { Some(v) };
                    return Some((k.str_bytes(), v));
                }
                // Parent pair: not an entry.
            },
        }
    }
}

/// Sorted merge iterator over a dictionary's live keys.
///
/// Both sides are sorted, so this is an array merge: the overlay wins ties,
/// and tombstones suppress the key on both sides.
pub struct DictIter<'a> {
    base: Option<Box<Peekable<DictIter<'a>>>>,
    over: Peekable<OverlayIter<'a>>,
}

impl<'a> Iterator for DictIter<'a> {
    type Item = (&'a str, ValueRef<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let base_key = match self.base.as_mut() {
                Some(b) => b.peek().map(|(k, _)| k.as_bytes()),
                None => None,
            };
            let over_key = self.over.peek().map(|(k, _)| *k);
            let take_over = match (base_key, over_key) {
                (None, None) => return None,
                (None, Some(_)) => true,
                (Some(_), None) => false,
                (Some(bk), Some(ok)) => ok <= bk,
            };
            if take_over {
                let (k, v) = self.over.next().expect("peeked");
                if let Some(b) = self.base.as_mut() {
                    if b.peek().is_some_and(|(bk, _)| bk.as_bytes() == k) {
                        b.next();
                    }
                }
                if let Some(v) = v {
                    // Safety: keys come from `&str` setters or validated
                    // string values.
                    return Some((unsafe { std::str::from_utf8_unchecked(k) }, v));
                }
                // Tombstone: key suppressed on both sides.
            } else {
                let b = self.base.as_mut().expect("peeked");
                return b.next();
            }
        }
    }
}

/// Heap node of a mutable dictionary.
#[repr(C)]
pub(crate) struct HeapDict<'a> {
    hd: HeapHeader,
    /// Live keys: overlay ∪ source, minus tombstones.
    count: u32,
    source: Option<DictRef<'a>>,
    map: BTreeMap<Box<[u8]>, ValueSlot<'a>>,
}

const _: () = assert!(mem::offset_of!(HeapDict<'static>, hd) == 0);

impl<'a> HeapDict<'a> {
    fn get(&self, key: &str) -> Option<ValueRef<'a>> {
        match self.map.get(key.as_bytes()) {
            Some(slot) => slot.value(),
            None => self.source.and_then(|s| s.get(key)),
        }
    }

    fn entries<'s>(&'s self) -> DictIter<'s>
    where
        'a: 's,
    {
        let base: Option<Box<Peekable<DictIter<'s>>>> = self.source.map(|s| {
            let s: DictRef<'s> = s;
            Box::new(s.iter().peekable())
        });
        DictIter {
            base,
            over: OverlayIter::Map(self.map.iter()).peekable(),
        }
    }

    pub(crate) fn write_to(&self, enc: &mut Encoder<'_>) {
        let inherited = self.source.is_some_and(|src| {
            enc.base_offset_of(src.value()).is_some()
                && !too_many_ancestors(src)
                && self.map.len() + 1 < self.count as usize
        });
        if inherited {
            let src = self.source.expect("checked above");
            // Write only the changed keys, with the source as parent;
            // tombstones encode as `undefined` so readers drop the key.
            enc.begin_dict_with_parent(src.value());
            for (k, slot) in &self.map {
                enc.write_key_bytes(k);
                enc.write_value(slot.value_or_undefined());
            }
            enc.end_dict();
        } else {
            enc.begin_dict();
            for (k, v) in self.entries() {
                enc.write_key(k);
                enc.write_value(v);
            }
            enc.end_dict();
        }
    }
}

/// An inherited source whose own parent is itself inherited would make
/// readers chase O(depth) pointers per lookup; materialize instead.
fn too_many_ancestors(src: DictRef<'_>) -> bool {
    src.parent().is_some_and(|p| p.parent().is_some())
}

/// Recovers the node behind a mutable dict value.
///
/// # Safety
/// `v` must be an odd, dict-tagged value pointer of a live node.
pub(crate) unsafe fn heap_node<'x>(v: ValueRef<'x>) -> &'x HeapDict<'x> {
    &*heap::header_ptr(v.ptr()).cast::<HeapDict<'x>>()
}

/// Drops a dict node whose refcount reached zero.
///
/// # Safety
/// `hd` must be the header of a `HeapDict` allocated by `MutableDict`.
pub(crate) unsafe fn drop_heap_dict(hd: *mut HeapHeader) {
    drop(Box::from_raw(hd.cast::<HeapDict<'static>>()));
}

/// Promotes a dict value to a mutable handle: retains it if already
/// mutable, otherwise wraps it as the source of a fresh overlay.
pub(crate) fn promote<'a>(v: ValueRef<'a>) -> Option<MutableDict<'a>> {
    if v.tag() != Tag::Dict {
        return None;
    }
    if v.is_mutable() {
        // Safety: odd dict-tagged pointer is a live HeapDict.
        Some(unsafe { MutableDict::retained_from_value(v) })
    } else {
        Some(MutableDict::from_dict(DictRef::new(v)))
    }
}

/// A retained handle to a mutable dictionary.
///
/// Cloning retains the same node; not `Send`/`Sync`.
pub struct MutableDict<'a> {
    node: NonNull<HeapDict<'a>>,
    _own: PhantomData<Cell<&'a [u8]>>,
}

impl<'a> MutableDict<'a> {
    fn from_node(node: HeapDict<'a>) -> Self {
        // Safety: Box never returns null.
        let node = unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(node))) };
        MutableDict {
            node,
            _own: PhantomData,
        }
    }

    /// An empty mutable dictionary with no source.
    #[must_use]
    pub fn new() -> Self {
        Self::from_node(HeapDict {
            hd: HeapHeader::new_container(Tag::Dict),
            count: 0,
            source: None,
            map: BTreeMap::new(),
        })
    }

    /// A mutable overlay over an immutable dictionary.
    #[must_use]
    pub fn from_dict(source: DictRef<'a>) -> Self {
        debug_assert!(!source.is_mutable());
        Self::from_node(HeapDict {
            hd: HeapHeader::new_container(Tag::Dict),
            count: source.count() as u32,
            source: Some(source),
            map: BTreeMap::new(),
        })
    }

    /// # Safety
    /// `v` must be an odd, dict-tagged value pointer of a live node.
    pub(crate) unsafe fn retained_from_value(v: ValueRef<'a>) -> Self {
        heap::retain(v.ptr());
        MutableDict {
            node: NonNull::new_unchecked(heap::header_ptr(v.ptr()).cast()),
            _own: PhantomData,
        }
    }

    fn node(&self) -> &HeapDict<'a> {
        // Safety: the handle retains the node.
        unsafe { self.node.as_ref() }
    }

    fn node_mut(&mut self) -> &mut HeapDict<'a> {
        // Safety: the handle retains the node; trees are single-threaded.
        unsafe { self.node.as_mut() }
    }

    /// The node's value pointer, independent of this handle's borrow.
    pub(crate) fn value_ref(&self) -> ValueRef<'a> {
        // Safety: odd value pointer of a live node.
        unsafe { ValueRef::from_ptr(heap::value_ptr(self.node.as_ptr())) }
    }

    /// This dictionary as a plain value.
    #[must_use]
    pub fn as_value(&self) -> ValueRef<'a> {
        self.value_ref()
    }

    /// This dictionary behind the common read API.
    #[must_use]
    pub fn as_dict(&self) -> DictRef<'_> {
        DictRef::new(self.value_ref())
    }

    /// The immutable source this overlay reads through, if any.
    #[must_use]
    pub fn source(&self) -> Option<DictRef<'a>> {
        self.node().source
    }

    /// Whether any mutation happened since construction.
    #[must_use]
    pub fn is_changed(&self) -> bool {
        self.node().hd.is_changed()
    }

    /// Number of live keys.
    #[must_use]
    pub fn count(&self) -> usize {
        self.node().count as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Looks up a key: the overlay wins, tombstones read as missing, and
    /// untouched keys fall through to the source.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<ValueRef<'_>> {
        self.node().get(key)
    }

    /// Iterates live `(key, value)` pairs in ascending key order.
    #[must_use]
    pub fn iter(&self) -> DictIter<'_> {
        self.node().entries()
    }

    /// Stores or replaces a key.
    pub fn set(&mut self, key: &str, v: impl SlotValue<'a>) {
        let node = self.node_mut();
        let kb = key.as_bytes();
        let was_live = match node.map.get(kb) {
            Some(slot) => !slot.is_empty(),
            None => node.source.is_some_and(|s| s.get(key).is_some()),
        };
        if let Some(slot) = node.map.get_mut(kb) {
            v.write_into(slot);
        } else {
            let mut slot = ValueSlot::empty();
            v.write_into(&mut slot);
            node.map.insert(kb.into(), slot);
        }
        if !was_live {
            node.count += 1;
        }
        node.hd.set_changed(true);
    }

    /// Removes a key: a tombstone if the source has it, otherwise the
    /// overlay entry is erased. Missing keys are a no-op.
    pub fn remove(&mut self, key: &str) {
        let node = self.node_mut();
        let kb = key.as_bytes();
        if node.source.is_some_and(|s| s.get(key).is_some()) {
            match node.map.get_mut(kb) {
                Some(slot) if slot.is_empty() => return, // already removed
                Some(slot) => *slot = ValueSlot::empty(),
                None => {
                    node.map.insert(kb.into(), ValueSlot::empty());
                }
            }
        } else if node.map.remove(kb).is_none() {
            return;
        }
        node.count -= 1;
        node.hd.set_changed(true);
    }

    /// Removes every key; with a source, installs a tombstone per source
    /// key so reads and iteration see an empty merged view.
    pub fn remove_all(&mut self) {
        let node = self.node_mut();
        if node.count == 0 && node.map.is_empty() {
            return;
        }
        node.map.clear();
        let source = node.source;
        if let Some(src) = source {
            for (k, _) in src.iter() {
                node.map.insert(k.as_bytes().into(), ValueSlot::empty());
            }
        }
        node.count = 0;
        node.hd.set_changed(true);
    }

    /// Promotes the value under `key` to a mutable array, storing the
    /// promotion back into the overlay. `None` if it is not an array.
    pub fn get_mutable_array(&mut self, key: &str) -> Option<MutableArray<'a>> {
        let node = self.node_mut();
        let kb = key.as_bytes();
        let result = if let Some(slot) = node.map.get_mut(kb) {
            slot.make_mutable_array()
        } else {
            let v = node.source.and_then(|s| s.get(key))?;
            let ma = crate::array::promote(v)?;
            let mut slot = ValueSlot::empty();
            slot.set_value(ma.value_ref());
            node.map.insert(kb.into(), slot);
            Some(ma)
        };
        if result.is_some() {
            node.hd.set_changed(true);
        }
        result
    }

    /// Promotes the value under `key` to a mutable dictionary.
    pub fn get_mutable_dict(&mut self, key: &str) -> Option<MutableDict<'a>> {
        let node = self.node_mut();
        let kb = key.as_bytes();
        let result = if let Some(slot) = node.map.get_mut(kb) {
            slot.make_mutable_dict()
        } else {
            let v = node.source.and_then(|s| s.get(key))?;
            let md = promote(v)?;
            let mut slot = ValueSlot::empty();
            slot.set_value(md.value_ref());
            node.map.insert(kb.into(), slot);
            Some(md)
        };
        if result.is_some() {
            node.hd.set_changed(true);
        }
        result
    }
}

impl Default for MutableDict<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MutableDict<'_> {
    fn clone(&self) -> Self {
        // Safety: the node is alive; the clone owns its own reference.
        unsafe { heap::retain(heap::value_ptr(self.node.as_ptr())) };
        MutableDict {
            node: self.node,
            _own: PhantomData,
        }
    }
}

impl Drop for MutableDict<'_> {
    fn drop(&mut self) {
        // Safety: the handle owns one reference.
        unsafe { heap::release(heap::value_ptr(self.node.as_ptr())) };
    }
}

impl PartialEq for MutableDict<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl Eq for MutableDict<'_> {}

impl Debug for MutableDict<'_> {
    fmt_via_json!();
}
