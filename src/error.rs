use thiserror::Error;

/// Error type for decoding a document from bytes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The buffer is empty, odd-sized, or too short to hold its root.
    #[error("document is truncated or misaligned")]
    Truncated,
    /// A document longer than one value does not end in a root pointer.
    #[error("document has no root pointer")]
    MissingRoot,
    /// A value header is malformed or extends past the end of the buffer.
    #[error("invalid value at offset {0}")]
    InvalidValue(usize),
    /// A back-pointer does not land on a value inside the buffer.
    #[error("pointer out of range at offset {0}")]
    BadPointer(usize),
    /// A dictionary key is not a string or short integer, or keys are not
    /// in ascending order.
    #[error("invalid dictionary key at offset {0}")]
    BadKey(usize),
    /// A string value is not valid UTF-8.
    #[error("invalid UTF-8 in string at offset {0}")]
    InvalidUtf8(usize),
}
