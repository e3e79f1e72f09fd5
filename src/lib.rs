//! Compact binary JSON with zero-copy reads and delta-encoded mutation.
//!
//! A document is a contiguous byte buffer read in place: values are tagged
//! byte sequences, and composites reference their children through relative
//! back-pointers, so access never parses more than it touches. On top of an
//! immutable document, [`MutableArray`] and [`MutableDict`] layer sparse
//! in-memory overlays: untouched entries read through to the *source*,
//! removals are tombstones, and the merged view is reachable through the
//! same read API as plain values. Re-encoding an overlay with its base
//! installed yields a *delta* — new bytes that reuse unchanged subtrees and
//! interior strings by pointer — and `base ++ delta` is again a valid
//! document.
//!
//! ```
//! use djson::{Encoder, MutableDict, ValueRef};
//!
//! // Encode a document.
//! let mut enc = Encoder::new();
//! enc.begin_dict();
//! enc.write_key("name");
//! enc.write_string("totoro");
//! enc.write_key("vehicle");
//! enc.write_string("catbus");
//! enc.end_dict();
//! let base = enc.finish();
//!
//! // Edit it through a mutable overlay.
//! let root = ValueRef::from_bytes(&base)?;
//! let mut update = MutableDict::from_dict(root.as_dict().unwrap());
//! update.set("vehicle", "top");
//!
//! // Re-encode against the base and append the delta.
//! let mut enc = Encoder::new();
//! enc.set_base(&base);
//! enc.reuse_base_strings();
//! enc.write_value(update.as_value());
//! let doc = djson::apply_delta(&base, &enc.finish());
//!
//! let updated = ValueRef::from_bytes(&doc)?.as_dict().unwrap();
//! assert_eq!(updated.get("vehicle").unwrap().as_str(), Some("top"));
//! assert_eq!(updated.get("name").unwrap().as_str(), Some("totoro"));
//! # Ok::<(), djson::Error>(())
//! ```
//!
//! Mutable trees are single-threaded editing scratchpads: handles are
//! neither `Send` nor `Sync`, while immutable document buffers can be
//! shared freely.

macro_rules! fmt_via_json {
    () => {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            f.write_str(&self.as_value().to_json())
        }
    };
}

mod array;
mod dict;
mod encoder;
mod error;
mod heap;
mod json;
mod slot;
mod value;
mod varint;

pub use array::{ArrayIter, ArrayRef, MutableArray};
pub use dict::{DictIter, DictRef, MutableDict};
pub use encoder::Encoder;
pub use error::Error;
pub use slot::{SlotValue, ValueSlot, INLINE_CAPACITY};
pub use value::{Null, ValueRef, ValueType};

/// Applies a delta produced by an [`Encoder`] with `base` installed: the
/// new document is simply the concatenation.
#[must_use]
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Vec<u8> {
    let mut doc = Vec::with_capacity(base.len() + delta.len());
    doc.extend_from_slice(base);
    doc.extend_from_slice(delta);
    doc
}

#[cfg(test)]
#[global_allocator]
static ALLOCATOR: mockalloc::Mockalloc<std::alloc::System> =
    mockalloc::Mockalloc(std::alloc::System);
