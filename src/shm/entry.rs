//! File-resident record and header layouts.
//!
//! Every structure in this module is `#[repr(C)]` and lives inside the
//! mapped file; processes address them by byte offset from the mapping base
//! and never by pointer. Offsets stored in link fields are either
//! [`NULL_OFFSET`] or the absolute offset of a live record in the same file.
//!
//! A record is born `Empty`, moves to `Writing` while its payload is
//! copied, and is published with a release store to `Valid`. Expiry is
//! lazy: readers treat a `Valid` record past its `expires_at` as invisible
//! without writing anything; writers and explicit sweeps unlink it and mark
//! it `Deleted` before returning its storage to the heap.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use super::lock::{ShmMutex, ShmRwLock};

/// Null link value.
pub const NULL_OFFSET: i64 = -1;

/// TTL sentinel: the entry never expires.
pub const TTL_INFINITE: i64 = -1;

/// Magic number stamped into every collection header.
pub const COLLECTION_MAGIC: u32 = 0xFAC0_1EC0;

/// Collection data-structure version.
pub const COLLECTION_VERSION: u32 = 1;

/// Default number of hash buckets. Must be a power of two.
pub const DEFAULT_BUCKET_COUNT: u32 = 16384;

/// Reported (but not acted upon) load factor for hash containers.
pub const DEFAULT_LOAD_FACTOR_PERCENT: u32 = 75;

/// Record alignment and granularity. Matches the cache line on the targets
/// this format supports.
pub const RECORD_ALIGN: usize = 64;

pub const STATE_EMPTY: u32 = 0;
pub const STATE_WRITING: u32 = 1;
pub const STATE_VALID: u32 = 2;
pub const STATE_DELETED: u32 = 3;
pub const STATE_EXPIRED: u32 = 4;

/// Round `n` up to a multiple of `align` (a power of two).
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// FNV-1a over the key-equivalent payload; used for fast probe rejection
/// before byte comparison.
pub fn fnv1a_hash(data: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// Current wall-clock time in nanoseconds.
///
/// `CLOCK_REALTIME` so that TTL comparisons agree between processes and
/// survive a restart of the machine mapping the file.
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}

/// Fixed metadata prefix of every stored record. Exactly 64 bytes.
#[repr(C)]
pub struct EntryHeader {
    state: AtomicU32,
    /// Byte length of the payload following the containing record.
    pub data_size: u32,
    /// FNV-1a/32 of the key-equivalent payload.
    pub hash_code: u32,
    _pad: u32,
    /// Authored TTL in seconds; [`TTL_INFINITE`] means never expires.
    pub ttl_seconds: i64,
    /// Nanosecond timestamp at write (or last TTL rebase).
    pub created_at: u64,
    /// `0` means never; otherwise `created_at + ttl_seconds * 1e9`.
    pub expires_at: u64,
    /// Bumped on every in-place payload update.
    pub version: AtomicU64,
    _reserved: [u8; 16],
}

const _: () = assert!(std::mem::size_of::<EntryHeader>() == 64);

impl EntryHeader {
    /// Reset the header to the just-allocated state.
    ///
    /// # Safety
    /// `ptr` must address writable mapped memory owned by a record that no
    /// other process can observe yet.
    pub unsafe fn init(ptr: *mut EntryHeader) {
        (*ptr).state = AtomicU32::new(STATE_EMPTY);
        (*ptr).data_size = 0;
        (*ptr).hash_code = 0;
        (*ptr)._pad = 0;
        (*ptr).ttl_seconds = TTL_INFINITE;
        (*ptr).created_at = 0;
        (*ptr).expires_at = 0;
        (*ptr).version = AtomicU64::new(0);
    }

    pub fn mark_writing(&self) {
        self.state.store(STATE_WRITING, Ordering::Release);
    }

    /// Publish the record; readers using acquire loads see the payload.
    pub fn mark_valid(&self) {
        self.state.store(STATE_VALID, Ordering::Release);
    }

    pub fn mark_deleted(&self) {
        self.state.store(STATE_DELETED, Ordering::Release);
    }

    pub fn mark_expired(&self) {
        self.state.store(STATE_EXPIRED, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_VALID
    }

    /// Expired means explicitly marked, or `Valid` with an elapsed deadline.
    pub fn is_expired(&self) -> bool {
        let s = self.state.load(Ordering::Acquire);
        if s == STATE_EXPIRED {
            return true;
        }
        if s != STATE_VALID {
            return false;
        }
        self.expires_at != 0 && now_ns() >= self.expires_at
    }

    /// Alive means `Valid` and not past the expiry deadline.
    pub fn is_alive(&self) -> bool {
        if !self.is_valid() {
            return false;
        }
        self.expires_at == 0 || now_ns() < self.expires_at
    }

    /// Set the TTL, rebasing `created_at` to the current instant.
    pub fn set_ttl(&mut self, ttl_seconds: i64) {
        self.ttl_seconds = ttl_seconds;
        self.created_at = now_ns();
        if ttl_seconds < 0 {
            self.expires_at = 0;
        } else {
            self.expires_at = self
                .created_at
                .saturating_add((ttl_seconds as u64).saturating_mul(1_000_000_000));
        }
    }

    /// Remaining whole seconds until expiry: `-1` if infinite, `0` if
    /// already expired.
    pub fn remaining_ttl_seconds(&self) -> i64 {
        if self.ttl_seconds < 0 || self.expires_at == 0 {
            return TTL_INFINITE;
        }
        let now = now_ns();
        if now >= self.expires_at {
            return 0;
        }
        ((self.expires_at - now) / 1_000_000_000) as i64
    }
}

/// Linked record for list, queue and stack chains. The payload bytes start
/// immediately after the struct.
#[repr(C)]
pub struct Node {
    pub entry: EntryHeader,
    pub next_offset: AtomicI64,
    pub prev_offset: AtomicI64,
}

const _: () = assert!(std::mem::size_of::<Node>() == 80);

impl Node {
    /// Total allocation size for a node carrying `data_size` payload bytes.
    pub const fn total_size(data_size: usize) -> usize {
        align_up(std::mem::size_of::<Node>() + data_size, RECORD_ALIGN)
    }

    /// # Safety
    /// `ptr` must address a freshly allocated block of at least
    /// `total_size(0)` writable bytes.
    pub unsafe fn init(ptr: *mut Node) {
        EntryHeader::init(&mut (*ptr).entry);
        (*ptr).next_offset = AtomicI64::new(NULL_OFFSET);
        (*ptr).prev_offset = AtomicI64::new(NULL_OFFSET);
    }

    /// # Safety
    /// `node` must point into the mapping at a record of this layout.
    pub unsafe fn data_ptr(node: *const Node) -> *const u8 {
        (node as *const u8).add(std::mem::size_of::<Node>())
    }

    /// Borrow the payload bytes.
    ///
    /// # Safety
    /// As [`Node::data_ptr`]; the returned slice is only consistent while
    /// the caller's locking discipline keeps the record from being updated.
    pub unsafe fn payload<'a>(node: *const Node) -> &'a [u8] {
        std::slice::from_raw_parts(Self::data_ptr(node), (*node).entry.data_size as usize)
    }

    /// Copy `data` into the node, stamp hash and TTL, and publish it.
    ///
    /// # Safety
    /// `node` must be exclusively owned (fresh allocation, or held under
    /// the owning container's write lock).
    pub unsafe fn write_payload(node: *mut Node, data: &[u8], ttl_seconds: i64) {
        let entry = &mut (*node).entry;
        entry.mark_writing();
        entry.data_size = data.len() as u32;
        entry.hash_code = fnv1a_hash(data);
        entry.set_ttl(ttl_seconds);
        std::ptr::copy_nonoverlapping(
            data.as_ptr(),
            Self::data_ptr(node) as *mut u8,
            data.len(),
        );
        entry.mark_valid();
    }

    /// Copy the payload out.
    ///
    /// # Safety
    /// As [`Node::payload`].
    pub unsafe fn read_payload(node: *const Node) -> Vec<u8> {
        Self::payload(node).to_vec()
    }
}

/// Keyed record for hash containers; key bytes then value bytes follow the
/// struct.
#[repr(C)]
pub struct KeyValue {
    pub entry: EntryHeader,
    pub next_offset: AtomicI64,
    pub prev_offset: AtomicI64,
    pub key_size: u32,
    pub value_size: u32,
}

const _: () = assert!(std::mem::size_of::<KeyValue>() == 88);

impl KeyValue {
    /// Total allocation size for a record carrying the given key and value.
    pub const fn total_size(key_size: usize, value_size: usize) -> usize {
        align_up(
            std::mem::size_of::<KeyValue>() + key_size + value_size,
            RECORD_ALIGN,
        )
    }

    /// # Safety
    /// `ptr` must address a freshly allocated block of at least
    /// `total_size(0, 0)` writable bytes.
    pub unsafe fn init(ptr: *mut KeyValue) {
        EntryHeader::init(&mut (*ptr).entry);
        (*ptr).next_offset = AtomicI64::new(NULL_OFFSET);
        (*ptr).prev_offset = AtomicI64::new(NULL_OFFSET);
        (*ptr).key_size = 0;
        (*ptr).value_size = 0;
    }

    /// # Safety
    /// `kv` must point into the mapping at a record of this layout.
    pub unsafe fn key<'a>(kv: *const KeyValue) -> &'a [u8] {
        let base = (kv as *const u8).add(std::mem::size_of::<KeyValue>());
        std::slice::from_raw_parts(base, (*kv).key_size as usize)
    }

    /// # Safety
    /// As [`KeyValue::key`].
    pub unsafe fn value<'a>(kv: *const KeyValue) -> &'a [u8] {
        let base = (kv as *const u8)
            .add(std::mem::size_of::<KeyValue>())
            .add((*kv).key_size as usize);
        std::slice::from_raw_parts(base, (*kv).value_size as usize)
    }

    /// Copy key and value into the record, stamp hash (over the key) and
    /// TTL, and publish it.
    ///
    /// # Safety
    /// `kv` must be exclusively owned.
    pub unsafe fn write_payload(kv: *mut KeyValue, key: &[u8], value: &[u8], ttl_seconds: i64) {
        let base = (kv as *mut u8).add(std::mem::size_of::<KeyValue>());
        (*kv).key_size = key.len() as u32;
        (*kv).value_size = value.len() as u32;
        let entry = &mut (*kv).entry;
        entry.mark_writing();
        entry.data_size = (key.len() + value.len()) as u32;
        entry.hash_code = fnv1a_hash(key);
        entry.set_ttl(ttl_seconds);
        std::ptr::copy_nonoverlapping(key.as_ptr(), base, key.len());
        std::ptr::copy_nonoverlapping(value.as_ptr(), base.add(key.len()), value.len());
        entry.mark_valid();
    }

    /// Overwrite the value bytes in place. Only legal when the new value
    /// has the same length as the stored one.
    ///
    /// # Safety
    /// Caller must hold the owning bucket's mutex.
    pub unsafe fn overwrite_value(kv: *mut KeyValue, value: &[u8], ttl_seconds: i64) {
        debug_assert_eq!((*kv).value_size as usize, value.len());
        let dst = (kv as *mut u8)
            .add(std::mem::size_of::<KeyValue>())
            .add((*kv).key_size as usize);
        std::ptr::copy_nonoverlapping(value.as_ptr(), dst, value.len());
        (*kv).entry.set_ttl(ttl_seconds);
        (*kv).entry.version.fetch_add(1, Ordering::Release);
        (*kv).entry.mark_valid();
    }
}

/// One hash bucket: its mutex, the chain head, and a record count.
/// Padded to a power-of-two stride so the bucket array indexes cheaply.
#[repr(C)]
pub struct Bucket {
    pub mutex: ShmMutex,
    pub head_offset: AtomicI64,
    pub count: AtomicU32,
    _reserved: [u8; 52],
}

const _: () = assert!(std::mem::size_of::<Bucket>() == 128);

impl Bucket {
    /// # Safety
    /// `ptr` must address zeroed region memory not yet visible to other
    /// processes.
    pub unsafe fn init(ptr: *mut Bucket) -> std::io::Result<()> {
        (*ptr).mutex.init()?;
        (*ptr).head_offset = AtomicI64::new(NULL_OFFSET);
        (*ptr).count = AtomicU32::new(0);
        Ok(())
    }
}

/// Fields shared by every collection header.
#[repr(C)]
pub struct CollectionHeader {
    pub magic: u32,
    pub version: u32,
    pub created_at: u64,
    pub modified_at: AtomicU64,
    /// Raw count of linked records (including expired-but-unswept ones).
    /// The user-visible count is always recomputed over alive records.
    pub size: AtomicU64,
    pub lock: ShmRwLock,
}

impl CollectionHeader {
    /// # Safety
    /// `ptr` must address zeroed region memory not yet visible to other
    /// processes.
    pub unsafe fn init(ptr: *mut CollectionHeader) -> std::io::Result<()> {
        let now = now_ns();
        (*ptr).magic = COLLECTION_MAGIC;
        (*ptr).version = COLLECTION_VERSION;
        (*ptr).created_at = now;
        (*ptr).modified_at = AtomicU64::new(now);
        (*ptr).size = AtomicU64::new(0);
        (*ptr).lock.init()
    }

    pub fn is_valid(&self) -> bool {
        self.magic == COLLECTION_MAGIC && self.version == COLLECTION_VERSION
    }

    pub fn touch(&self) {
        self.modified_at.store(now_ns(), Ordering::Relaxed);
    }
}

/// Header for the ordered list: head and tail of the doubly-linked chain.
#[repr(C)]
pub struct ListHeader {
    pub common: CollectionHeader,
    pub head_offset: AtomicI64,
    pub tail_offset: AtomicI64,
}

impl ListHeader {
    /// # Safety
    /// As [`CollectionHeader::init`].
    pub unsafe fn init(ptr: *mut ListHeader) -> std::io::Result<()> {
        CollectionHeader::init(&mut (*ptr).common)?;
        (*ptr).head_offset = AtomicI64::new(NULL_OFFSET);
        (*ptr).tail_offset = AtomicI64::new(NULL_OFFSET);
        Ok(())
    }
}

/// Header for queue and stack: front and back of the chain.
#[repr(C)]
pub struct DequeHeader {
    pub common: CollectionHeader,
    pub front_offset: AtomicI64,
    pub back_offset: AtomicI64,
}

impl DequeHeader {
    /// # Safety
    /// As [`CollectionHeader::init`].
    pub unsafe fn init(ptr: *mut DequeHeader) -> std::io::Result<()> {
        CollectionHeader::init(&mut (*ptr).common)?;
        (*ptr).front_offset = AtomicI64::new(NULL_OFFSET);
        (*ptr).back_offset = AtomicI64::new(NULL_OFFSET);
        Ok(())
    }
}

/// Header for set and map; the bucket array is a separate named region.
#[repr(C)]
pub struct HashTableHeader {
    pub common: CollectionHeader,
    pub bucket_count: u32,
    pub load_factor_percent: u32,
    pub total_bytes: AtomicU64,
}

impl HashTableHeader {
    /// # Safety
    /// As [`CollectionHeader::init`]. `bucket_count` must be a power of two.
    pub unsafe fn init(ptr: *mut HashTableHeader, bucket_count: u32) -> std::io::Result<()> {
        CollectionHeader::init(&mut (*ptr).common)?;
        (*ptr).bucket_count = bucket_count;
        (*ptr).load_factor_percent = DEFAULT_LOAD_FACTOR_PERCENT;
        (*ptr).total_bytes = AtomicU64::new(0);
        Ok(())
    }

    pub fn bucket_index(&self, hash: u32) -> u32 {
        hash & (self.bucket_count - 1)
    }
}

/// Compare payloads: size first, then hash was already checked by callers,
/// then the bytes themselves.
pub fn bytes_equal(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(std::mem::size_of::<EntryHeader>(), 64);
        assert_eq!(std::mem::size_of::<Node>(), 80);
        assert_eq!(std::mem::size_of::<KeyValue>(), 88);
        assert_eq!(std::mem::size_of::<Bucket>(), 128);
    }

    #[test]
    fn test_node_total_size_alignment() {
        assert_eq!(Node::total_size(0), 128);
        assert_eq!(Node::total_size(1), 128);
        assert_eq!(Node::total_size(48), 128);
        assert_eq!(Node::total_size(49), 192);
        assert_eq!(KeyValue::total_size(4, 36), 128);
        assert_eq!(KeyValue::total_size(4, 37), 192);
    }

    #[test]
    fn test_fnv1a_known_values() {
        // FNV-1a/32 reference vectors.
        assert_eq!(fnv1a_hash(b""), 2_166_136_261);
        assert_eq!(fnv1a_hash(b"a"), 0xe40c292c);
        assert_eq!(fnv1a_hash(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_entry_state_machine() {
        let mut entry: EntryHeader = unsafe { std::mem::zeroed() };
        unsafe { EntryHeader::init(&mut entry) };
        assert!(!entry.is_valid());
        assert!(!entry.is_alive());

        entry.set_ttl(TTL_INFINITE);
        entry.mark_valid();
        assert!(entry.is_alive());
        assert!(!entry.is_expired());
        assert_eq!(entry.remaining_ttl_seconds(), TTL_INFINITE);

        entry.mark_deleted();
        assert!(!entry.is_alive());
        assert!(!entry.is_expired());
    }

    #[test]
    fn test_ttl_zero_expires_immediately() {
        let mut entry: EntryHeader = unsafe { std::mem::zeroed() };
        unsafe { EntryHeader::init(&mut entry) };
        entry.set_ttl(0);
        entry.mark_valid();
        assert!(entry.is_expired());
        assert!(!entry.is_alive());
        assert_eq!(entry.remaining_ttl_seconds(), 0);
    }

    #[test]
    fn test_ttl_future_deadline() {
        let mut entry: EntryHeader = unsafe { std::mem::zeroed() };
        unsafe { EntryHeader::init(&mut entry) };
        entry.set_ttl(3600);
        entry.mark_valid();
        assert!(entry.is_alive());
        let remaining = entry.remaining_ttl_seconds();
        assert!(remaining > 3590 && remaining <= 3600);
    }

    #[test]
    fn test_set_ttl_rebases_created_at() {
        let mut entry: EntryHeader = unsafe { std::mem::zeroed() };
        unsafe { EntryHeader::init(&mut entry) };
        entry.set_ttl(5);
        let first = entry.created_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        entry.set_ttl(TTL_INFINITE);
        assert!(entry.created_at > first);
        assert_eq!(entry.expires_at, 0);
    }

    #[test]
    fn test_bucket_index_masks_power_of_two() {
        let mut header: HashTableHeader = unsafe { std::mem::zeroed() };
        unsafe { HashTableHeader::init(&mut header, 1024).unwrap() };
        assert_eq!(header.bucket_index(0), 0);
        assert_eq!(header.bucket_index(1023), 1023);
        assert_eq!(header.bucket_index(1024), 0);
        assert_eq!(header.bucket_index(0xdead_beef), 0xdead_beef & 1023);
    }
}
