//! The delta-aware encoder.
//!
//! Values are written bottom-up: scalars small enough to live inside a
//! collection slot are held as pending inline items, everything else is
//! written to the output immediately and referenced by a back-pointer when
//! its collection header is flushed. With a *base buffer* installed, values
//! that already live in the base are never copied — the delta just points
//! at them — and previously written strings (including the base's, after
//! [`Encoder::reuse_base_strings`]) are shared by pointer. Appending the
//! finished delta to the base yields a new valid document.

use hashbrown::HashMap;

use crate::value::{
    self, Tag, ValueRef, FALSE_BYTE, LONG_COUNT, NULL_BYTE, PARENT_KEY, TRUE_BYTE,
};
use crate::varint;

const NARROW_MAX_OFFSET: usize = 0x7FFF * 2;

/// A pending collection element: a complete tiny encoding, or the absolute
/// document offset of a value already written (or living in the base).
#[derive(Copy, Clone)]
enum Item {
    Inline([u8; 2], u8),
    Ref(usize),
}

/// Dictionary keys sort int-first, then byte-wise; this is the canonical
/// pair order of an encoded dict.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum KeySort {
    Int(i64),
    Str(Box<[u8]>),
}

enum Pending {
    Array {
        items: Vec<Item>,
    },
    Dict {
        pairs: Vec<(KeySort, Item, Item)>,
        pending_key: Option<(KeySort, Item)>,
    },
}

/// Encodes a value tree into document bytes, optionally as a delta against
/// a base document.
pub struct Encoder<'a> {
    base: Option<&'a [u8]>,
    out: Vec<u8>,
    /// Written (or base) string value bytes → absolute document offset.
    strings: HashMap<Box<[u8]>, usize>,
    stack: Vec<Pending>,
    root: Option<Item>,
}

impl<'a> Encoder<'a> {
    #[must_use]
    pub fn new() -> Self {
        Encoder {
            base: None,
            out: Vec::new(),
            strings: HashMap::new(),
            stack: Vec::new(),
            root: None,
        }
    }

    /// Installs the base document this encoder writes a delta against.
    /// Values inside it are emitted as back-pointers instead of copies.
    pub fn set_base(&mut self, base: &'a [u8]) {
        debug_assert!(self.out.is_empty(), "set_base before writing");
        self.base = Some(base);
    }

    /// Registers every string in the base so equal strings written later
    /// reuse the base bytes by pointer.
    pub fn reuse_base_strings(&mut self) {
        let Some(base) = self.base else { return };
        if let Ok(root) = ValueRef::from_trusted_bytes(base) {
            self.register_strings(root, base);
        }
    }

    fn register_strings(&mut self, v: ValueRef<'_>, base: &[u8]) {
        match v.tag() {
            Tag::String => {
                if v.data_size() > 2 {
                    if let Some(off) = v.offset_in(base) {
                        self.strings.entry(v.str_bytes().into()).or_insert(off);
                    }
                }
            }
            Tag::Array => {
                for e in v.as_array().expect("array-tagged").iter() {
                    self.register_strings(e, base);
                }
            }
            Tag::Dict => {
                for (k, val) in v.as_dict().expect("dict-tagged").raw_entries() {
                    self.register_strings(k, base);
                    self.register_strings(val, base);
                }
            }
            _ => {}
        }
    }

    fn base_len(&self) -> usize {
        self.base.map_or(0, <[u8]>::len)
    }

    fn doc_len(&self) -> usize {
        self.base_len() + self.out.len()
    }

    fn pad_to_even(&mut self) {
        if self.doc_len() % 2 != 0 {
            self.out.push(0);
        }
    }

    /// Writes a complete value encoding out of line, returning its
    /// document offset.
    fn write_out(&mut self, bytes: &[u8]) -> usize {
        self.pad_to_even();
        let off = self.doc_len();
        self.out.extend_from_slice(bytes);
        off
    }

    pub(crate) fn base_offset_of(&self, v: ValueRef<'_>) -> Option<usize> {
        self.base.and_then(|b| v.offset_in(b))
    }

    fn put_scalar(&mut self, bytes: &[u8]) -> Item {
        if bytes.len() <= 2 {
            let mut buf = [0u8; 2];
            buf[..bytes.len()].copy_from_slice(bytes);
            Item::Inline(buf, bytes.len() as u8)
        } else {
            Item::Ref(self.write_out(bytes))
        }
    }

    fn put_string(&mut self, tag: Tag, bytes: &[u8]) -> Item {
        let mut header = [0u8; 1 + varint::MAX_LEN];
        let hlen = value::string_header(&mut header, tag, bytes.len());
        if hlen + bytes.len() <= 2 {
            let mut buf = [0u8; 2];
            buf[..hlen].copy_from_slice(&header[..hlen]);
            buf[hlen..hlen + bytes.len()].copy_from_slice(bytes);
            return Item::Inline(buf, (hlen + bytes.len()) as u8);
        }
        // Out-of-line strings are deduplicated; equal ones share bytes.
        if tag == Tag::String {
            if let Some(&off) = self.strings.get(bytes) {
                return Item::Ref(off);
            }
        }
        self.pad_to_even();
        let off = self.doc_len();
        self.out.extend_from_slice(&header[..hlen]);
        self.out.extend_from_slice(bytes);
        if tag == Tag::String {
            self.strings.insert(bytes.into(), off);
        }
        Item::Ref(off)
    }

    fn add_item(&mut self, item: Item) {
        match self.stack.last_mut() {
            None => {
                assert!(self.root.is_none(), "more than one root value");
                self.root = Some(item);
            }
            Some(Pending::Array { items }) => items.push(item),
            Some(Pending::Dict { pairs, pending_key }) => {
                let (sort, key) = pending_key.take().expect("dictionary value without a key");
                pairs.push((sort, key, item));
            }
        }
    }

    /// Writes any value: immutable values in the base become pointers,
    /// mutable trees serialize their changes, everything else is copied.
    pub fn write_value(&mut self, v: ValueRef<'_>) {
        if v.is_mutable() {
            match v.tag() {
                Tag::Array => {
                    // Safety: odd array-tagged pointers are live nodes.
                    let node = unsafe { crate::array::heap_node(v) };
                    node.write_to(self);
                    return;
                }
                Tag::Dict => {
                    // Safety: odd dict-tagged pointers are live nodes.
                    let node = unsafe { crate::dict::heap_node(v) };
                    node.write_to(self);
                    return;
                }
                _ => {} // heap scalars forward their encoded bytes below
            }
        }
        let item = self.value_item(v);
        self.add_item(item);
    }

    fn value_item(&mut self, v: ValueRef<'_>) -> Item {
        if !v.is_mutable() {
            if let Some(off) = self.base_offset_of(v) {
                return Item::Ref(off);
            }
        }
        match v.tag() {
            Tag::String => self.put_string(Tag::String, v.str_bytes()),
            Tag::Binary => self.put_string(Tag::Binary, v.str_bytes()),
            Tag::Array => {
                let arr = v.as_array().expect("array-tagged");
                self.begin_array();
                for e in arr.iter() {
                    self.write_value(e);
                }
                self.end_array_item()
            }
            Tag::Dict => {
                // Copying a dict materializes its merged view, resolving
                // any parent chain.
                let dict = v.as_dict().expect("dict-tagged");
                self.begin_dict();
                for (k, val) in dict.iter() {
                    self.write_key(k);
                    self.write_value(val);
                }
                self.end_dict_item()
            }
            _ => self.put_scalar(v.scalar_bytes()),
        }
    }

    pub fn write_null(&mut self) {
        let item = self.put_scalar(&[NULL_BYTE, 0]);
        self.add_item(item);
    }

    pub fn write_bool(&mut self, b: bool) {
        let item = self.put_scalar(&[if b { TRUE_BYTE } else { FALSE_BYTE }, 0]);
        self.add_item(item);
    }

    pub fn write_int(&mut self, i: i64) {
        let mut buf = [0u8; value::MAX_SCALAR];
        let len = value::encode_int(&mut buf, i, false);
        let item = self.put_scalar(&buf[..len]);
        self.add_item(item);
    }

    pub fn write_uint(&mut self, u: u64) {
        let mut buf = [0u8; value::MAX_SCALAR];
        let len = value::encode_int(&mut buf, u as i64, true);
        let item = self.put_scalar(&buf[..len]);
        self.add_item(item);
    }

    pub fn write_float(&mut self, f: f32) {
        let mut buf = [0u8; value::MAX_SCALAR];
        let len = value::encode_float(&mut buf, f);
        let item = self.put_scalar(&buf[..len]);
        self.add_item(item);
    }

    pub fn write_double(&mut self, d: f64) {
        let mut buf = [0u8; value::MAX_SCALAR];
        let len = value::encode_double(&mut buf, d);
        let item = self.put_scalar(&buf[..len]);
        self.add_item(item);
    }

    pub fn write_string(&mut self, s: &str) {
        let item = self.put_string(Tag::String, s.as_bytes());
        self.add_item(item);
    }

    pub fn write_data(&mut self, d: &[u8]) {
        let item = self.put_string(Tag::Binary, d);
        self.add_item(item);
    }

    pub fn begin_array(&mut self) {
        self.stack.push(Pending::Array { items: Vec::new() });
    }

    pub fn end_array(&mut self) {
        let item = self.end_array_item();
        self.add_item(item);
    }

    fn end_array_item(&mut self) -> Item {
        match self.stack.pop() {
            Some(Pending::Array { items }) => {
                let count = items.len();
                self.flush_coll(Tag::Array, items, count)
            }
            _ => panic!("end_array without begin_array"),
        }
    }

    pub fn begin_dict(&mut self) {
        self.stack.push(Pending::Dict {
            pairs: Vec::new(),
            pending_key: None,
        });
    }

    /// Begins an inherited dictionary: only changed pairs follow, and the
    /// reader resolves everything else through `parent`.
    ///
    /// # Panics
    /// If `parent` does not live in the encoder's base.
    pub fn begin_dict_with_parent(&mut self, parent: ValueRef<'_>) {
        let off = self
            .base_offset_of(parent)
            .expect("parent dictionary must live in the encoder's base");
        self.stack.push(Pending::Dict {
            pairs: vec![(
                KeySort::Int(PARENT_KEY),
                Item::Inline([0x08, 0x00], 2),
                Item::Ref(off),
            )],
            pending_key: None,
        });
    }

    /// Writes the key of the next dictionary pair.
    pub fn write_key(&mut self, key: &str) {
        self.write_key_bytes(key.as_bytes());
    }

    pub(crate) fn write_key_bytes(&mut self, key: &[u8]) {
        let item = self.put_string(Tag::String, key);
        match self.stack.last_mut() {
            Some(Pending::Dict { pending_key, .. }) => {
                assert!(pending_key.is_none(), "two keys in a row");
                *pending_key = Some((KeySort::Str(key.into()), item));
            }
            _ => panic!("key outside a dictionary"),
        }
    }

    pub fn end_dict(&mut self) {
        let item = self.end_dict_item();
        self.add_item(item);
    }

    fn end_dict_item(&mut self) -> Item {
        match self.stack.pop() {
            Some(Pending::Dict {
                mut pairs,
                pending_key,
            }) => {
                assert!(pending_key.is_none(), "dictionary key without a value");
                pairs.sort_by(|a, b| a.0.cmp(&b.0));
                let count = pairs.len();
                let mut items = Vec::with_capacity(count * 2);
                for (_, k, v) in pairs {
                    items.push(k);
                    items.push(v);
                }
                self.flush_coll(Tag::Dict, items, count)
            }
            _ => panic!("end_dict without begin_dict"),
        }
    }

    fn flush_coll(&mut self, tag: Tag, items: Vec<Item>, count: usize) -> Item {
        let start = {
            let d = self.doc_len();
            d + (d & 1)
        };
        let header_len = if count < LONG_COUNT {
            2
        } else {
            (2 + varint::uvarint_len(count as u64)).div_ceil(2) * 2
        };
        // Narrow slots unless some back-pointer would be out of range.
        let wide = items.iter().enumerate().any(|(i, item)| match item {
            Item::Ref(off) => start + header_len + i * 2 - off > NARROW_MAX_OFFSET,
            Item::Inline(..) => false,
        });
        let w = if wide { 4 } else { 2 };

        self.pad_to_even();
        debug_assert_eq!(self.doc_len(), start);
        let count_field = count.min(LONG_COUNT);
        let wide_flag = if wide { 0x08 } else { 0 };
        self.out
            .push(((tag as u8) << 4) | wide_flag | ((count_field >> 8) as u8 & 0x07));
        self.out.push((count_field & 0xFF) as u8);
        if count >= LONG_COUNT {
            let mut buf = [0u8; varint::MAX_LEN];
            let vlen = varint::put_uvarint(&mut buf, count as u64);
            self.out.extend_from_slice(&buf[..vlen]);
            self.pad_to_even();
        }
        for item in items {
            let slot_pos = self.doc_len();
            match item {
                Item::Inline(buf, len) => {
                    self.out.extend_from_slice(&buf[..len as usize]);
                    for _ in len as usize..w {
                        self.out.push(0);
                    }
                }
                Item::Ref(off) => {
                    let delta = (slot_pos - off) / 2;
                    if wide {
                        self.out
                            .extend_from_slice(&(0x8000_0000 | delta as u32).to_be_bytes());
                    } else {
                        debug_assert!(delta <= 0x7FFF);
                        self.out
                            .extend_from_slice(&(0x8000 | delta as u16).to_be_bytes());
                    }
                }
            }
        }
        Item::Ref(start)
    }

    /// Finishes the document: appends the trailing root pointer and
    /// returns the bytes (the delta, when a base is set).
    ///
    /// # Panics
    /// If a collection is still open or nothing was written.
    pub fn finish(mut self) -> Vec<u8> {
        assert!(self.stack.is_empty(), "unbalanced begin/end");
        let root = self.root.take().expect("nothing written");
        let root_off = match root {
            Item::Ref(off) => off,
            Item::Inline(buf, len) => {
                if self.base.is_none() && self.out.is_empty() {
                    // The whole document is one small value.
                    self.out.extend_from_slice(&buf[..len as usize]);
                    while self.out.len() < 2 {
                        self.out.push(0);
                    }
                    return self.out;
                }
                self.write_out(&buf[..len as usize])
            }
        };
        self.pad_to_even();
        let delta = self.doc_len() - root_off;
        if delta <= NARROW_MAX_OFFSET {
            self.out
                .extend_from_slice(&(0x8000 | (delta / 2) as u16).to_be_bytes());
        } else {
            // Too far for a narrow root pointer: wide hop first.
            self.out
                .extend_from_slice(&(0x8000_0000 | (delta / 2) as u32).to_be_bytes());
            self.out.extend_from_slice(&(0x8000u16 | 2).to_be_bytes());
        }
        self.out
    }
}

impl Default for Encoder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;

    #[test]
    fn scalar_documents() {
        let mut enc = Encoder::new();
        enc.write_bool(true);
        let doc = enc.finish();
        assert_eq!(doc, vec![TRUE_BYTE, 0]);
        let v = ValueRef::from_bytes(&doc).unwrap();
        assert!(v.as_bool());

        let mut enc = Encoder::new();
        enc.write_int(123_456_789);
        let doc = enc.finish();
        let v = ValueRef::from_bytes(&doc).unwrap();
        assert_eq!(v.as_int(), 123_456_789);
    }

    #[test]
    fn arrays_round_trip() {
        let mut enc = Encoder::new();
        enc.begin_array();
        enc.write_null();
        enc.write_bool(false);
        enc.write_int(0);
        enc.write_int(-123);
        enc.write_int(2017);
        enc.write_int(123_456_789);
        enc.write_string("Hot dog");
        enc.write_double(2.5);
        enc.end_array();
        let doc = enc.finish();

        let arr = ValueRef::from_bytes(&doc).unwrap().as_array().unwrap();
        assert_eq!(arr.count(), 8);
        assert_eq!(arr.get(0).unwrap().value_type(), ValueType::Null);
        assert!(!arr.get(1).unwrap().as_bool());
        assert_eq!(arr.get(2).unwrap().as_int(), 0);
        assert_eq!(arr.get(3).unwrap().as_int(), -123);
        assert_eq!(arr.get(4).unwrap().as_int(), 2017);
        assert_eq!(arr.get(5).unwrap().as_int(), 123_456_789);
        assert_eq!(arr.get(6).unwrap().as_str(), Some("Hot dog"));
        assert_eq!(arr.get(7).unwrap().as_double(), 2.5);
    }

    #[test]
    fn dicts_sort_keys() {
        let mut enc = Encoder::new();
        enc.begin_dict();
        for key in ["z", "a", "mm", "b"] {
            enc.write_key(key);
            enc.write_int(1);
        }
        enc.end_dict();
        let doc = enc.finish();

        let dict = ValueRef::from_bytes(&doc).unwrap().as_dict().unwrap();
        assert_eq!(dict.count(), 4);
        let keys: Vec<&str> = dict.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "b", "mm", "z"]);
        assert_eq!(dict.get("mm").unwrap().as_int(), 1);
        assert!(dict.get("q").is_none());
    }

    #[test]
    fn equal_strings_are_written_once() {
        let mut enc = Encoder::new();
        enc.begin_array();
        enc.write_string("totoro");
        enc.write_string("totoro");
        enc.write_string("totoro");
        enc.end_array();
        let doc = enc.finish();

        let occurrences = doc.windows(6).filter(|win| win == b"totoro").count();
        assert_eq!(occurrences, 1);

        let arr = ValueRef::from_bytes(&doc).unwrap().as_array().unwrap();
        assert!(arr.get(0).unwrap().same(arr.get(1).unwrap()));
    }

    #[test]
    fn nested_collections() {
        let mut enc = Encoder::new();
        enc.begin_dict();
        enc.write_key("list");
        enc.begin_array();
        enc.write_int(1);
        enc.write_int(2);
        enc.end_array();
        enc.write_key("name");
        enc.write_string("nested");
        enc.end_dict();
        let doc = enc.finish();

        let dict = ValueRef::from_bytes(&doc).unwrap().as_dict().unwrap();
        let list = dict.get("list").unwrap().as_array().unwrap();
        assert_eq!(list.count(), 2);
        assert_eq!(list.get(1).unwrap().as_int(), 2);
        assert_eq!(dict.get("name").unwrap().as_str(), Some("nested"));
    }

    #[test]
    fn base_values_become_pointers() {
        let mut enc = Encoder::new();
        enc.begin_array();
        enc.write_string("totoro");
        enc.write_string("catbus");
        enc.end_array();
        let base = enc.finish();
        let base_arr = ValueRef::from_bytes(&base).unwrap().as_array().unwrap();

        // Swap the two elements in a delta.
        let mut enc = Encoder::new();
        enc.set_base(&base);
        enc.begin_array();
        enc.write_value(base_arr.get(1).unwrap());
        enc.write_value(base_arr.get(0).unwrap());
        enc.end_array();
        let delta = enc.finish();
        assert!(delta.len() <= 8, "delta should be pointers only");

        let doc = crate::apply_delta(&base, &delta);
        let arr = ValueRef::from_bytes(&doc).unwrap().as_array().unwrap();
        assert_eq!(arr.get(0).unwrap().as_str(), Some("catbus"));
        assert_eq!(arr.get(1).unwrap().as_str(), Some("totoro"));
    }

    #[test]
    fn long_array_counts() {
        let n = LONG_COUNT + 5;
        let mut enc = Encoder::new();
        enc.begin_array();
        for i in 0..n {
            enc.write_int(i as i64);
        }
        enc.end_array();
        let doc = enc.finish();

        let arr = ValueRef::from_bytes(&doc).unwrap().as_array().unwrap();
        assert_eq!(arr.count(), n);
        assert_eq!(arr.get(0).unwrap().as_int(), 0);
        assert_eq!(arr.get(n - 1).unwrap().as_int(), n as i64 - 1);
    }
}
