//! Shared-memory storage substrate.
//!
//! Three layers, bottom up:
//!
//! - [`mapping`]: the mapped-file manager, holding the superblock,
//!   named-region directory, and a free-list heap carved out of one
//!   memory-mapped file.
//! - [`lock`]: process-shared pthread locks embedded in file-resident
//!   structures.
//! - [`entry`]: the `#[repr(C)]` record and header layouts the containers
//!   link together by offset.
//!
//! Containers never store pointers: every durable reference is a byte
//! offset from the start of the file, resolved to a transient pointer per
//! access. That is what lets a file be remapped at a different address
//! after growth or in another process while every linked structure stays
//! intact.

pub mod entry;
pub mod lock;
pub mod mapping;

pub use entry::{
    Bucket, CollectionHeader, DequeHeader, EntryHeader, HashTableHeader, KeyValue, ListHeader,
    Node, DEFAULT_BUCKET_COUNT, NULL_OFFSET, TTL_INFINITE,
};
pub use lock::{ShmMutex, ShmRwLock};
pub use mapping::{
    delete_file, file_stats, is_valid_file, MappedFile, DEFAULT_GROWTH_STEP, DEFAULT_INITIAL_SIZE,
};
