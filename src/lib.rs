//! shmkit: persistent, shared-memory-backed collections with per-entry
//! TTL.
//!
//! Five container types ([`ShmList`], [`ShmSet`], [`ShmMap`],
//! [`ShmQueue`], [`ShmStack`]) store opaque byte payloads in a
//! memory-mapped file. Data survives process exit and is visible to every
//! process mapping the same file; locks and atomics live inside the
//! mapping and are of interprocess kind. Every stored element carries its
//! own time-to-live: expired elements are invisible to readers and
//! reclaimed lazily by writers or an explicit `remove_expired` sweep.
//!
//! All durable references inside a file are byte offsets, so a file can be
//! remapped at any address, grown, or opened by another process without
//! disturbing the linked structures. Files are host-endian and
//! host-word-width by design and are not portable across architectures.
//!
//! # Examples
//!
//! ```no_run
//! use shmkit::{ShmMap, TTL_INFINITE};
//!
//! let mut map = ShmMap::open_or_create("/tmp/sessions.shm", 16 * 1024 * 1024, true)?;
//! map.put(b"session:abc", b"data", 30)?;          // visible for 30 seconds
//! map.put(b"config:app", b"v1", TTL_INFINITE)?;   // never expires
//! assert_eq!(map.get(b"session:abc").as_deref(), Some(&b"data"[..]));
//! # Ok::<(), shmkit::Error>(())
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

pub mod error;
pub mod handle;
pub mod list;
pub mod map;
pub mod queue;
pub mod set;
pub mod shm;
pub mod stack;
pub mod stats;

pub use error::{Error, Result};
pub use handle::{Collection, CollectionKind};
pub use list::ShmList;
pub use map::ShmMap;
pub use queue::ShmQueue;
pub use set::ShmSet;
pub use shm::mapping::{delete_file, file_stats, is_valid_file};
pub use shm::{DEFAULT_BUCKET_COUNT, DEFAULT_GROWTH_STEP, DEFAULT_INITIAL_SIZE, TTL_INFINITE};
pub use stack::ShmStack;
pub use stats::{CollectionStats, FileStats, StatsSnapshot};

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Process-wide initialization guard. Collections do not require it, but
/// bindings call it once before first use.
pub fn initialize() {
    INITIALIZED.store(true, Ordering::Release);
}

/// Mark the library shut down. Open handles stay usable; this only resets
/// the [`initialize`] guard.
pub fn shutdown() {
    INITIALIZED.store(false, Ordering::Release);
}

/// Whether [`initialize`] has been called since the last [`shutdown`].
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Semantic version of the library.
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(version(), "1.0.0");
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_guard() {
        initialize();
        assert!(is_initialized());
        shutdown();
        assert!(!is_initialized());
        initialize();
        assert!(is_initialized());
    }
}
