//! The value slot: element/field storage of mutable containers.
//!
//! A slot is exactly two machine words. Small values are stored inline as a
//! complete format encoding (up to [`INLINE_CAPACITY`] bytes, flag in the
//! final byte), so setting nulls, booleans, numbers, and short strings never
//! allocates. Larger values live out of line: the first word holds a value
//! pointer — owning (retained) for heap nodes, borrowing for immutable
//! buffer values. An out-of-line null pointer is the empty slot, which
//! doubles as the dictionary tombstone.

use std::fmt::{self, Debug, Formatter};
use std::marker::PhantomData;
use std::mem;

use crate::array::MutableArray;
use crate::dict::MutableDict;
use crate::heap;
use crate::value::{self, Null, Tag, ValueRef, FALSE_BYTE, NULL_BYTE, TRUE_BYTE};

/// Bytes of inline storage in a slot: two words minus the flag byte.
pub const INLINE_CAPACITY: usize = 2 * mem::size_of::<usize>() - 1;

const TAIL: usize = INLINE_CAPACITY - mem::size_of::<usize>();

/// A two-word cell holding one value inline or by reference.
#[repr(C)]
pub struct ValueSlot<'a> {
    /// Out-of-line value pointer; doubles as inline bytes 0..8.
    ptr: *const u8,
    /// Inline bytes 8..15.
    tail: [u8; TAIL],
    /// Nonzero when the slot stores an inline encoding.
    inline: u8,
    _buf: PhantomData<&'a [u8]>,
}

const _: () = {
    assert!(mem::size_of::<ValueSlot<'static>>() == 2 * mem::size_of::<usize>());
    assert!(mem::offset_of!(ValueSlot<'static>, inline) == INLINE_CAPACITY);
};

impl<'a> ValueSlot<'a> {
    /// The empty slot: no value; a tombstone inside a dictionary overlay.
    #[must_use]
    pub fn empty() -> Self {
        ValueSlot {
            ptr: std::ptr::null(),
            tail: [0; TAIL],
            inline: 0,
            _buf: PhantomData,
        }
    }

    /// A slot holding an inline JSON null.
    #[must_use]
    pub fn null() -> Self {
        let mut slot = Self::empty();
        slot.set_null();
        slot
    }

    fn is_inline(&self) -> bool {
        self.inline != 0
    }

    /// True when the slot holds no value at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.is_inline() && self.ptr.is_null()
    }

    fn inline_ptr(&self) -> *const u8 {
        let p = self as *const Self as *const u8;
        debug_assert!(p as usize & 1 == 0);
        p
    }

    fn release_value(&mut self) {
        if !self.is_inline() && !self.ptr.is_null() {
            // Safety: an out-of-line slot owns one reference to its value.
            unsafe { heap::release(self.ptr) };
        }
        self.ptr = std::ptr::null();
        self.inline = 0;
    }

    /// The stored value, or `None` for an empty slot.
    #[must_use]
    pub fn value(&self) -> Option<ValueRef<'a>> {
        if self.is_inline() {
            // Safety: inline bytes are a complete encoding at an even
            // address; callers re-scope the lifetime to their own borrow.
            Some(unsafe { ValueRef::from_ptr(self.inline_ptr()) })
        } else if self.ptr.is_null() {
            None
        } else {
            // Safety: the slot retains out-of-line heap values; immutable
            // ones outlive `'a` by contract.
            Some(unsafe { ValueRef::from_ptr(self.ptr) })
        }
    }

    /// The stored value, with empty slots reading as the `undefined`
    /// sentinel (the encoding of a deletion in a delta).
    #[must_use]
    pub fn value_or_undefined(&self) -> ValueRef<'a> {
        self.value().unwrap_or_else(|| ValueRef::undefined())
    }

    fn set_inline(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= INLINE_CAPACITY);
        self.release_value();
        // Safety: bytes 0..INLINE_CAPACITY are plain storage; the flag
        // byte at offset INLINE_CAPACITY is untouched.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self as *mut Self as *mut u8,
                bytes.len(),
            );
        }
        self.inline = 1;
    }

    /// Stores a freshly allocated heap value (refcount already 1).
    fn store_owned(&mut self, p: *const u8) {
        self.release_value();
        self.ptr = p;
    }

    pub fn set_null(&mut self) {
        self.set_inline(&[NULL_BYTE, 0]);
    }

    pub fn set_bool(&mut self, b: bool) {
        self.set_inline(&[if b { TRUE_BYTE } else { FALSE_BYTE }, 0]);
    }

    pub fn set_int(&mut self, i: i64) {
        let mut buf = [0u8; value::MAX_SCALAR];
        let len = value::encode_int(&mut buf, i, false);
        self.set_scalar(&buf[..len]);
    }

    pub fn set_uint(&mut self, u: u64) {
        let mut buf = [0u8; value::MAX_SCALAR];
        let len = value::encode_int(&mut buf, u as i64, true);
        self.set_scalar(&buf[..len]);
    }

    pub fn set_float(&mut self, f: f32) {
        let mut buf = [0u8; value::MAX_SCALAR];
        let len = value::encode_float(&mut buf, f);
        self.set_scalar(&buf[..len]);
    }

    pub fn set_double(&mut self, d: f64) {
        let mut buf = [0u8; value::MAX_SCALAR];
        let len = value::encode_double(&mut buf, d);
        self.set_scalar(&buf[..len]);
    }

    /// Stores a complete scalar encoding, inline when it fits.
    fn set_scalar(&mut self, bytes: &[u8]) {
        if bytes.len() <= INLINE_CAPACITY {
            self.set_inline(bytes);
        } else {
            self.store_owned(heap::alloc_scalar(
                Tag::of_byte(bytes[0]),
                bytes[0] & 0x0F,
                &bytes[1..],
            ));
        }
    }

    pub fn set_string(&mut self, s: &str) {
        self.set_string_or_data(Tag::String, s.as_bytes());
    }

    pub fn set_data(&mut self, d: &[u8]) {
        self.set_string_or_data(Tag::Binary, d);
    }

    fn set_string_or_data(&mut self, tag: Tag, bytes: &[u8]) {
        if 1 + bytes.len() <= INLINE_CAPACITY {
            // Short strings go inline; length always fits the tiny nibble.
            let mut buf = [0u8; INLINE_CAPACITY];
            buf[0] = ((tag as u8) << 4) | bytes.len() as u8;
            buf[1..=bytes.len()].copy_from_slice(bytes);
            self.set_inline(&buf[..=bytes.len()]);
        } else {
            self.store_owned(heap::alloc_string(tag, bytes));
        }
    }

    /// Stores any value: small scalars are copied inline, heap values are
    /// retained, and immutable composites or large scalars are borrowed.
    pub fn set_value(&mut self, v: ValueRef<'a>) {
        if !self.is_inline() && std::ptr::eq(self.ptr, v.ptr()) {
            return;
        }
        if v.tag() < Tag::Array && v.data_size() <= INLINE_CAPACITY {
            self.set_scalar(v.scalar_bytes());
            return;
        }
        // Safety: retain before releasing the old value in case they share
        // a node through some other path.
        unsafe { heap::retain(v.ptr()) };
        self.release_value();
        self.ptr = v.ptr();
    }

    /// Converts a slot holding an array into a mutable array rooted at it,
    /// replacing the slot contents. `None` if the slot holds anything else
    /// (including an inline scalar or a tombstone).
    pub fn make_mutable_array(&mut self) -> Option<MutableArray<'a>> {
        if self.is_inline() {
            return None;
        }
        let ma = crate::array::promote(self.value()?)?;
        self.set_value(ma.value_ref());
        Some(ma)
    }

    /// Converts a slot holding a dictionary into a mutable dictionary
    /// rooted at it, replacing the slot contents.
    pub fn make_mutable_dict(&mut self) -> Option<MutableDict<'a>> {
        if self.is_inline() {
            return None;
        }
        let md = crate::dict::promote(self.value()?)?;
        self.set_value(md.value_ref());
        Some(md)
    }
}

impl Default for ValueSlot<'_> {
    fn default() -> Self {
        Self::empty()
    }
}

impl Clone for ValueSlot<'_> {
    fn clone(&self) -> Self {
        if !self.is_inline() {
            // Safety: the copy owns a second reference.
            unsafe { heap::retain(self.ptr) };
        }
        ValueSlot {
            ptr: self.ptr,
            tail: self.tail,
            inline: self.inline,
            _buf: PhantomData,
        }
    }
}

impl Drop for ValueSlot<'_> {
    fn drop(&mut self) {
        self.release_value();
    }
}

impl Debug for ValueSlot<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(v) => Debug::fmt(&v, f),
            None => f.write_str("<empty>"),
        }
    }
}

/// Anything that can be stored into a [`ValueSlot`] by the typed setter
/// and appender APIs of the mutable containers.
pub trait SlotValue<'a> {
    #[doc(hidden)]
    fn write_into(self, slot: &mut ValueSlot<'a>);
}

impl<'a> SlotValue<'a> for Null {
    fn write_into(self, slot: &mut ValueSlot<'a>) {
        slot.set_null();
    }
}

impl<'a> SlotValue<'a> for bool {
    fn write_into(self, slot: &mut ValueSlot<'a>) {
        slot.set_bool(self);
    }
}

macro_rules! signed_slot_impls {
    ($($ty:ty),*) => {
        $(impl<'a> SlotValue<'a> for $ty {
            fn write_into(self, slot: &mut ValueSlot<'a>) {
                slot.set_int(self as i64);
            }
        })*
    };
}

macro_rules! unsigned_slot_impls {
    ($($ty:ty),*) => {
        $(impl<'a> SlotValue<'a> for $ty {
            fn write_into(self, slot: &mut ValueSlot<'a>) {
                slot.set_uint(self as u64);
            }
        })*
    };
}

signed_slot_impls!(i8, i16, i32, i64, isize);
unsigned_slot_impls!(u8, u16, u32, u64, usize);

impl<'a> SlotValue<'a> for f32 {
    fn write_into(self, slot: &mut ValueSlot<'a>) {
        slot.set_float(self);
    }
}

impl<'a> SlotValue<'a> for f64 {
    fn write_into(self, slot: &mut ValueSlot<'a>) {
        slot.set_double(self);
    }
}

impl<'a, 'b> SlotValue<'a> for &'b str {
    fn write_into(self, slot: &mut ValueSlot<'a>) {
        slot.set_string(self);
    }
}

impl<'a, 'b> SlotValue<'a> for &'b [u8] {
    fn write_into(self, slot: &mut ValueSlot<'a>) {
        slot.set_data(self);
    }
}

impl<'a> SlotValue<'a> for ValueRef<'a> {
    fn write_into(self, slot: &mut ValueSlot<'a>) {
        slot.set_value(self);
    }
}

impl<'a, 'b> SlotValue<'a> for &'b MutableArray<'a> {
    fn write_into(self, slot: &mut ValueSlot<'a>) {
        slot.set_value(self.value_ref());
    }
}

impl<'a, 'b> SlotValue<'a> for &'b MutableDict<'a> {
    fn write_into(self, slot: &mut ValueSlot<'a>) {
        slot.set_value(self.value_ref());
    }
}
