//! Error types shared by every collection.

use std::fmt;
use std::io;

/// Errors raised by the collections and the underlying mapped-file manager.
///
/// Operations that merely miss (absent key, out-of-range read, expired
/// element) report through their return value (`None` / `false`); an `Error`
/// means the operation itself could not be carried out.
#[derive(Debug)]
pub enum Error {
    /// The heap inside the mapped file could not satisfy an allocation,
    /// even after growing the file once.
    MemoryAllocationFailed,
    /// The backing file could not be created.
    FileCreationFailed(io::Error),
    /// The backing file could not be opened.
    FileOpenFailed(io::Error),
    /// A payload could not be encoded for storage.
    SerializationFailed(String),
    /// A stored payload could not be decoded.
    DeserializationFailed(String),
    /// A positional operation addressed an index past the end.
    IndexOutOfBounds { index: usize, size: usize },
    /// A keyed operation found no record for the key.
    KeyNotFound,
    /// A required element was absent (e.g. `remove` on an empty queue).
    NotFound,
    /// The collection cannot accept more elements.
    CollectionFull,
    /// A lock could not be acquired within its deadline.
    LockTimeout,
    /// An argument was rejected before touching the file.
    InvalidArgument(String),
    /// The file contents failed validation (bad magic, version mismatch,
    /// region type conflict) or an internal invariant was violated.
    InternalError(String),
    /// A blocking operation ran out of time.
    Timeout,
    /// The addressed element exists but its TTL has elapsed.
    ElementExpired,
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MemoryAllocationFailed => {
                write!(f, "failed to allocate memory in mapped file")
            }
            Error::FileCreationFailed(e) => write!(f, "failed to create backing file: {e}"),
            Error::FileOpenFailed(e) => write!(f, "failed to open backing file: {e}"),
            Error::SerializationFailed(msg) => write!(f, "serialization failed: {msg}"),
            Error::DeserializationFailed(msg) => write!(f, "deserialization failed: {msg}"),
            Error::IndexOutOfBounds { index, size } => {
                write!(f, "index {index} out of bounds for size {size}")
            }
            Error::KeyNotFound => write!(f, "key not found"),
            Error::NotFound => write!(f, "element not found"),
            Error::CollectionFull => write!(f, "collection is full"),
            Error::LockTimeout => write!(f, "timed out waiting for lock"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::InternalError(msg) => write!(f, "internal error: {msg}"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::ElementExpired => write!(f, "element has expired"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::FileCreationFailed(e) | Error::FileOpenFailed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::InternalError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = Error::IndexOutOfBounds { index: 7, size: 3 };
        assert_eq!(e.to_string(), "index 7 out of bounds for size 3");

        let e = Error::MemoryAllocationFailed;
        assert!(e.to_string().contains("mapped file"));
    }

    #[test]
    fn test_io_error_source() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let e = Error::FileOpenFailed(io_err);
        assert!(std::error::Error::source(&e).is_some());
    }
}
