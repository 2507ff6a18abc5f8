//! Hash set of opaque payloads backed by a mapped file.
//!
//! Open chaining over a fixed bucket array (a separate named region).
//! Writers take the owning bucket's process-shared mutex; membership
//! probes are lock-free chain walks using acquire loads, filtering on the
//! record state so partially unlinked nodes are never reported.
//!
//! The bucket count is fixed at construction. The load factor is reported
//! in the header but never acted on; there is no resize.

use std::path::Path;
use std::sync::atomic::Ordering;

use crossbeam_utils::CachePadded;
use tracing::trace;

use crate::error::{Error, Result};
use crate::shm::entry::{
    bytes_equal, fnv1a_hash, Bucket, HashTableHeader, Node, DEFAULT_BUCKET_COUNT, NULL_OFFSET,
};
use crate::shm::mapping::{region_kind, MappedFile, DEFAULT_INITIAL_SIZE};
use crate::stats::CollectionStats;

const HEADER_REGION: &str = "set_header";
const BUCKETS_REGION: &str = "set_buckets";

/// A persistent, shared-memory-backed hash set with per-entry TTL.
pub struct ShmSet {
    file: MappedFile,
    header_offset: u64,
    buckets_offset: u64,
    stats: CachePadded<CollectionStats>,
}

impl ShmSet {
    /// Open `path`, creating it with default sizing if absent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_or_create(path, DEFAULT_INITIAL_SIZE, false)
    }

    /// Open or create with the default bucket count.
    pub fn open_or_create<P: AsRef<Path>>(
        path: P,
        initial_size: usize,
        create_new: bool,
    ) -> Result<Self> {
        Self::with_bucket_count(path, initial_size, create_new, DEFAULT_BUCKET_COUNT)
    }

    /// Open or create, sizing the bucket array at `bucket_count` (rounded
    /// up to a power of two; `0` selects the default). The count only
    /// applies when the file is created; reopening uses the stored
    /// geometry.
    pub fn with_bucket_count<P: AsRef<Path>>(
        path: P,
        initial_size: usize,
        create_new: bool,
        bucket_count: u32,
    ) -> Result<Self> {
        let requested = if bucket_count == 0 {
            DEFAULT_BUCKET_COUNT
        } else {
            bucket_count.next_power_of_two()
        };

        let file = MappedFile::open_or_create(path, initial_size, create_new)?;
        let (header_offset, _created) = file.find_or_create_region(
            HEADER_REGION,
            region_kind::HASH_HEADER,
            std::mem::size_of::<HashTableHeader>(),
            |ptr| unsafe { HashTableHeader::init(ptr as *mut HashTableHeader, requested) },
        )?;

        let header = unsafe { &*(file.ptr_at(header_offset) as *const HashTableHeader) };
        if !header.common.is_valid() {
            return Err(Error::InternalError(format!(
                "invalid set header in {}",
                file.path().display()
            )));
        }
        let stored_count = header.bucket_count;

        let (buckets_offset, _created) = file.find_or_create_region(
            BUCKETS_REGION,
            region_kind::BUCKET_ARRAY,
            stored_count as usize * std::mem::size_of::<Bucket>(),
            |ptr| unsafe {
                for i in 0..stored_count as usize {
                    Bucket::init((ptr as *mut Bucket).add(i))?;
                }
                Ok(())
            },
        )?;

        let set = ShmSet {
            file,
            header_offset,
            buckets_offset,
            stats: CachePadded::new(CollectionStats::default()),
        };
        set.stats
            .set_size(set.header().common.size.load(Ordering::Relaxed));
        Ok(set)
    }

    fn header(&self) -> &HashTableHeader {
        unsafe { &*(self.file.ptr_at(self.header_offset) as *const HashTableHeader) }
    }

    fn node_ptr(&self, offset: i64) -> *mut Node {
        debug_assert!(offset >= 0);
        self.file.ptr_at(offset as u64) as *mut Node
    }

    fn bucket_ptr(&self, index: u32) -> *mut Bucket {
        let offset = self.buckets_offset + index as u64 * std::mem::size_of::<Bucket>() as u64;
        self.file.ptr_at(offset) as *mut Bucket
    }

    fn bucket_for(&self, hash: u32) -> *mut Bucket {
        self.bucket_ptr(self.header().bucket_index(hash))
    }

    /// First chain record matching `data` by hash, length and bytes,
    /// regardless of expiry. Caller decides what aliveness means for the
    /// operation. Bucket mutex must be held.
    fn find_in_bucket(&self, bucket: *mut Bucket, data: &[u8], hash: u32) -> Option<i64> {
        let mut cur = unsafe { (*bucket).head_offset.load(Ordering::Acquire) };
        while cur >= 0 {
            let node = self.node_ptr(cur);
            unsafe {
                if (*node).entry.is_valid()
                    && (*node).entry.hash_code == hash
                    && bytes_equal(Node::payload(node), data)
                {
                    return Some(cur);
                }
                cur = (*node).next_offset.load(Ordering::Acquire);
            }
        }
        None
    }

    fn allocate_node(&self, data: &[u8], ttl_seconds: i64) -> Result<i64> {
        let offset = self.file.allocate(Node::total_size(data.len()))? as i64;
        let node = self.node_ptr(offset);
        unsafe {
            Node::init(node);
            Node::write_payload(node, data, ttl_seconds);
        }
        Ok(offset)
    }

    /// Splice a node in at the chain head. Bucket mutex must be held.
    fn push_chain_head(&self, bucket: *mut Bucket, node_offset: i64) {
        unsafe {
            let node = self.node_ptr(node_offset);
            let old_head = (*bucket).head_offset.load(Ordering::Acquire);
            (*node).next_offset.store(old_head, Ordering::Release);
            (*node).prev_offset.store(NULL_OFFSET, Ordering::Release);
            if old_head >= 0 {
                (*self.node_ptr(old_head))
                    .prev_offset
                    .store(node_offset, Ordering::Release);
            }
            (*bucket).head_offset.store(node_offset, Ordering::Release);
            (*bucket).count.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Detach a record from its chain. Bucket mutex must be held.
    fn unlink_from_chain(&self, bucket: *mut Bucket, node_offset: i64) {
        unsafe {
            let node = self.node_ptr(node_offset);
            let prev = (*node).prev_offset.load(Ordering::Acquire);
            let next = (*node).next_offset.load(Ordering::Acquire);
            if prev >= 0 {
                (*self.node_ptr(prev)).next_offset.store(next, Ordering::Release);
            } else {
                (*bucket).head_offset.store(next, Ordering::Release);
            }
            if next >= 0 {
                (*self.node_ptr(next)).prev_offset.store(prev, Ordering::Release);
            }
            (*bucket).count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn free_node(&self, offset: i64) {
        unsafe { (*self.node_ptr(offset)).entry.mark_deleted() };
        self.file.deallocate(offset);
    }

    /// Insert `data`. Returns `Ok(false)` if an alive twin already exists.
    /// An expired twin is revived in place with the fresh TTL instead of
    /// allocating a replacement.
    pub fn add(&mut self, data: &[u8], ttl_seconds: i64) -> Result<bool> {
        if data.is_empty() {
            return Ok(false);
        }
        let hash = fnv1a_hash(data);
        let bucket = self.bucket_for(hash);
        let _guard = unsafe { (*bucket).mutex.lock() };

        if let Some(offset) = self.find_in_bucket(bucket, data, hash) {
            let node = self.node_ptr(offset);
            if unsafe { (*node).entry.is_alive() } {
                return Ok(false);
            }
            unsafe {
                (*node).entry.set_ttl(ttl_seconds);
                (*node).entry.version.fetch_add(1, Ordering::Release);
                (*node).entry.mark_valid();
            }
            self.header().common.touch();
            self.stats.record_write();
            return Ok(true);
        }

        let node_offset = self.allocate_node(data, ttl_seconds)?;
        self.push_chain_head(bucket, node_offset);

        let header = self.header();
        header.common.size.fetch_add(1, Ordering::AcqRel);
        header
            .total_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        header.common.touch();
        self.stats.add_size(1);
        self.stats.record_write();
        Ok(true)
    }

    /// Remove the alive record equal to `data`.
    pub fn remove(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let hash = fnv1a_hash(data);
        let bucket = self.bucket_for(hash);
        let _guard = unsafe { (*bucket).mutex.lock() };

        let Some(offset) = self.find_in_bucket(bucket, data, hash) else {
            return false;
        };
        if !unsafe { (*self.node_ptr(offset)).entry.is_alive() } {
            return false;
        }

        self.unlink_from_chain(bucket, offset);
        self.free_node(offset);

        let header = self.header();
        header.common.size.fetch_sub(1, Ordering::AcqRel);
        header.common.touch();
        self.stats.sub_size(1);
        true
    }

    /// Lock-free membership probe.
    pub fn contains(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let hash = fnv1a_hash(data);
        let bucket = self.bucket_for(hash);

        let mut cur = unsafe { (*bucket).head_offset.load(Ordering::Acquire) };
        while cur >= 0 {
            let node = self.node_ptr(cur);
            unsafe {
                if (*node).entry.is_alive()
                    && (*node).entry.hash_code == hash
                    && bytes_equal(Node::payload(node), data)
                {
                    self.stats.record_hit();
                    return true;
                }
                cur = (*node).next_offset.load(Ordering::Acquire);
            }
        }
        self.stats.record_miss();
        false
    }

    /// Remaining TTL of the alive record equal to `data`: `-1` infinite,
    /// `0` absent or expired. Lock-free.
    pub fn get_ttl(&self, data: &[u8]) -> i64 {
        if data.is_empty() {
            return 0;
        }
        let hash = fnv1a_hash(data);
        let bucket = self.bucket_for(hash);

        let mut cur = unsafe { (*bucket).head_offset.load(Ordering::Acquire) };
        while cur >= 0 {
            let node = self.node_ptr(cur);
            unsafe {
                if (*node).entry.is_alive()
                    && (*node).entry.hash_code == hash
                    && bytes_equal(Node::payload(node), data)
                {
                    return (*node).entry.remaining_ttl_seconds();
                }
                cur = (*node).next_offset.load(Ordering::Acquire);
            }
        }
        0
    }

    /// Update the TTL of the alive record equal to `data`; rebases
    /// `created_at`.
    pub fn set_ttl(&mut self, data: &[u8], ttl_seconds: i64) -> bool {
        if data.is_empty() {
            return false;
        }
        let hash = fnv1a_hash(data);
        let bucket = self.bucket_for(hash);
        let _guard = unsafe { (*bucket).mutex.lock() };

        let Some(offset) = self.find_in_bucket(bucket, data, hash) else {
            return false;
        };
        let node = self.node_ptr(offset);
        if !unsafe { (*node).entry.is_alive() } {
            return false;
        }
        unsafe { (*node).entry.set_ttl(ttl_seconds) };
        self.header().common.touch();
        true
    }

    /// Insert each element; returns how many were newly added.
    pub fn add_all(&mut self, elements: &[(&[u8], i64)]) -> Result<usize> {
        let mut added = 0;
        for (data, ttl) in elements {
            if self.add(data, *ttl)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Remove each element; returns how many were present.
    pub fn remove_all(&mut self, elements: &[&[u8]]) -> usize {
        let mut removed = 0;
        for data in elements {
            if self.remove(data) {
                removed += 1;
            }
        }
        removed
    }

    /// Remove every alive element the predicate rejects; returns how many
    /// were removed. Buckets are locked one at a time.
    pub fn retain_if<F: FnMut(&[u8]) -> bool>(&mut self, mut predicate: F) -> usize {
        let mut removed = 0;
        for i in 0..self.header().bucket_count {
            let bucket = self.bucket_ptr(i);
            let _guard = unsafe { (*bucket).mutex.lock() };

            let mut cur = unsafe { (*bucket).head_offset.load(Ordering::Acquire) };
            while cur >= 0 {
                let node = self.node_ptr(cur);
                let next = unsafe { (*node).next_offset.load(Ordering::Acquire) };
                let alive = unsafe { (*node).entry.is_alive() };
                if alive && !predicate(unsafe { Node::payload(node) }) {
                    self.unlink_from_chain(bucket, cur);
                    self.free_node(cur);
                    self.header().common.size.fetch_sub(1, Ordering::AcqRel);
                    self.stats.sub_size(1);
                    removed += 1;
                }
                cur = next;
            }
        }
        if removed > 0 {
            self.header().common.touch();
        }
        removed
    }

    /// Unlink and free every expired record; returns how many were swept.
    pub fn remove_expired(&mut self) -> usize {
        let mut removed = 0;
        for i in 0..self.header().bucket_count {
            let bucket = self.bucket_ptr(i);
            let _guard = unsafe { (*bucket).mutex.lock() };

            let mut cur = unsafe { (*bucket).head_offset.load(Ordering::Acquire) };
            while cur >= 0 {
                let node = self.node_ptr(cur);
                let next = unsafe { (*node).next_offset.load(Ordering::Acquire) };
                if unsafe { (*node).entry.is_expired() } {
                    self.unlink_from_chain(bucket, cur);
                    self.free_node(cur);
                    self.header().common.size.fetch_sub(1, Ordering::AcqRel);
                    self.stats.sub_size(1);
                    removed += 1;
                }
                cur = next;
            }
        }
        if removed > 0 {
            self.header().common.touch();
            trace!(removed, "swept expired set records");
        }
        removed
    }

    /// Visit alive payloads bucket by bucket; the callback returns `false`
    /// to stop. Lock-free.
    pub fn for_each<F: FnMut(&[u8]) -> bool>(&self, mut callback: F) {
        for i in 0..self.header().bucket_count {
            let bucket = self.bucket_ptr(i);
            let mut cur = unsafe { (*bucket).head_offset.load(Ordering::Acquire) };
            while cur >= 0 {
                let node = self.node_ptr(cur);
                unsafe {
                    if (*node).entry.is_alive() && !callback(Node::payload(node)) {
                        return;
                    }
                    cur = (*node).next_offset.load(Ordering::Acquire);
                }
            }
        }
    }

    /// As [`ShmSet::for_each`], also passing the remaining TTL.
    pub fn for_each_with_ttl<F: FnMut(&[u8], i64) -> bool>(&self, mut callback: F) {
        for i in 0..self.header().bucket_count {
            let bucket = self.bucket_ptr(i);
            let mut cur = unsafe { (*bucket).head_offset.load(Ordering::Acquire) };
            while cur >= 0 {
                let node = self.node_ptr(cur);
                unsafe {
                    if (*node).entry.is_alive() {
                        let ttl = (*node).entry.remaining_ttl_seconds();
                        if !callback(Node::payload(node), ttl) {
                            return;
                        }
                    }
                    cur = (*node).next_offset.load(Ordering::Acquire);
                }
            }
        }
    }

    /// Collect alive payloads.
    pub fn to_array(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        self.for_each(|data| {
            out.push(data.to_vec());
            true
        });
        out
    }

    /// Remove every record, expired or not.
    pub fn clear(&mut self) {
        for i in 0..self.header().bucket_count {
            let bucket = self.bucket_ptr(i);
            let _guard = unsafe { (*bucket).mutex.lock() };

            let mut cur = unsafe { (*bucket).head_offset.load(Ordering::Acquire) };
            while cur >= 0 {
                let node = self.node_ptr(cur);
                let next = unsafe { (*node).next_offset.load(Ordering::Acquire) };
                self.free_node(cur);
                cur = next;
            }
            unsafe {
                (*bucket).head_offset.store(NULL_OFFSET, Ordering::Release);
                (*bucket).count.store(0, Ordering::Release);
            }
        }
        let header = self.header();
        header.common.size.store(0, Ordering::Release);
        header.total_bytes.store(0, Ordering::Relaxed);
        header.common.touch();
        self.stats.set_size(0);
    }

    /// Count of alive records, recomputed by walking every chain.
    pub fn size(&self) -> usize {
        let mut alive = 0;
        for i in 0..self.header().bucket_count {
            let bucket = self.bucket_ptr(i);
            let mut cur = unsafe { (*bucket).head_offset.load(Ordering::Acquire) };
            while cur >= 0 {
                let node = self.node_ptr(cur);
                unsafe {
                    if (*node).entry.is_alive() {
                        alive += 1;
                    }
                    cur = (*node).next_offset.load(Ordering::Acquire);
                }
            }
        }
        alive
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Configured bucket count.
    pub fn bucket_count(&self) -> u32 {
        self.header().bucket_count
    }

    pub fn stats(&self) -> &CollectionStats {
        &self.stats
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::entry::TTL_INFINITE;
    use tempfile::tempdir;

    const MB: usize = 1024 * 1024;

    fn new_set(dir: &tempfile::TempDir, name: &str) -> ShmSet {
        // A small bucket array keeps chain collisions exercised.
        ShmSet::with_bucket_count(dir.path().join(name), MB, true, 64).unwrap()
    }

    #[test]
    fn test_add_contains_uniqueness() {
        let dir = tempdir().unwrap();
        let mut set = new_set(&dir, "basic.shm");

        assert!(set.add(b"apple", TTL_INFINITE).unwrap());
        assert!(!set.add(b"apple", TTL_INFINITE).unwrap());
        assert_eq!(set.size(), 1);
        assert!(set.contains(b"apple"));
        assert!(!set.contains(b"pear"));
    }

    #[test]
    fn test_remove() {
        let dir = tempdir().unwrap();
        let mut set = new_set(&dir, "remove.shm");
        set.add(b"apple", TTL_INFINITE).unwrap();

        assert!(set.remove(b"apple"));
        assert!(!set.remove(b"apple"));
        assert!(!set.contains(b"apple"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_chain_collisions() {
        let dir = tempdir().unwrap();
        let mut set = ShmSet::with_bucket_count(dir.path().join("chain.shm"), MB, true, 2).unwrap();

        for i in 0..64u32 {
            assert!(set.add(&i.to_le_bytes(), TTL_INFINITE).unwrap());
        }
        assert_eq!(set.size(), 64);
        for i in 0..64u32 {
            assert!(set.contains(&i.to_le_bytes()));
        }
        // Remove odd values, keep even.
        for i in (1..64u32).step_by(2) {
            assert!(set.remove(&i.to_le_bytes()));
        }
        assert_eq!(set.size(), 32);
        assert!(set.contains(&2u32.to_le_bytes()));
        assert!(!set.contains(&3u32.to_le_bytes()));
    }

    #[test]
    fn test_expired_twin_is_revived() {
        let dir = tempdir().unwrap();
        let mut set = new_set(&dir, "revive.shm");

        set.add(b"flash", 0).unwrap();
        assert!(!set.contains(b"flash"));
        // The expired record is revived in place rather than reinserted.
        assert!(set.add(b"flash", TTL_INFINITE).unwrap());
        assert!(set.contains(b"flash"));
        assert_eq!(set.size(), 1);
    }

    #[test]
    fn test_ttl_accessors() {
        let dir = tempdir().unwrap();
        let mut set = new_set(&dir, "ttl.shm");
        set.add(b"forever", TTL_INFINITE).unwrap();
        set.add(b"brief", 120).unwrap();

        assert_eq!(set.get_ttl(b"forever"), -1);
        let remaining = set.get_ttl(b"brief");
        assert!(remaining > 110 && remaining <= 120);
        assert_eq!(set.get_ttl(b"missing"), 0);

        assert!(set.set_ttl(b"brief", TTL_INFINITE));
        assert_eq!(set.get_ttl(b"brief"), -1);
        assert!(!set.set_ttl(b"missing", 5));
    }

    #[test]
    fn test_bulk_operations() {
        let dir = tempdir().unwrap();
        let mut set = new_set(&dir, "bulk.shm");

        let added = set
            .add_all(&[(b"a".as_slice(), TTL_INFINITE), (b"b".as_slice(), TTL_INFINITE), (b"a".as_slice(), TTL_INFINITE)])
            .unwrap();
        assert_eq!(added, 2);

        let removed = set.remove_all(&[b"a".as_slice(), b"z".as_slice()]);
        assert_eq!(removed, 1);
        assert_eq!(set.size(), 1);
    }

    #[test]
    fn test_retain_if() {
        let dir = tempdir().unwrap();
        let mut set = new_set(&dir, "retain.shm");
        for i in 0..10u32 {
            set.add(&i.to_le_bytes(), TTL_INFINITE).unwrap();
        }

        let removed = set.retain_if(|data| {
            let v = u32::from_le_bytes(data.try_into().unwrap());
            v % 2 == 0
        });
        assert_eq!(removed, 5);
        assert_eq!(set.size(), 5);
        assert!(set.contains(&4u32.to_le_bytes()));
        assert!(!set.contains(&5u32.to_le_bytes()));
    }

    #[test]
    fn test_remove_expired() {
        let dir = tempdir().unwrap();
        let mut set = new_set(&dir, "sweep.shm");
        set.add(b"stays", TTL_INFINITE).unwrap();
        set.add(b"goes", 1).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(set.size(), 1);
        assert_eq!(set.remove_expired(), 1);
        assert_eq!(set.remove_expired(), 0);
        assert!(set.contains(b"stays"));
    }

    #[test]
    fn test_to_array_and_for_each() {
        let dir = tempdir().unwrap();
        let mut set = new_set(&dir, "iter.shm");
        set.add(b"one", TTL_INFINITE).unwrap();
        set.add(b"two", TTL_INFINITE).unwrap();

        let mut all = set.to_array();
        all.sort();
        assert_eq!(all, vec![b"one".to_vec(), b"two".to_vec()]);

        let mut visits = 0;
        set.for_each(|_| {
            visits += 1;
            false
        });
        assert_eq!(visits, 1);
    }

    #[test]
    fn test_clear() {
        let dir = tempdir().unwrap();
        let mut set = new_set(&dir, "clear.shm");
        for i in 0..20u32 {
            set.add(&i.to_le_bytes(), TTL_INFINITE).unwrap();
        }
        set.clear();
        assert!(set.is_empty());
        assert!(set.add(b"fresh", TTL_INFINITE).unwrap());
        assert_eq!(set.size(), 1);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.shm");
        {
            let mut set = ShmSet::with_bucket_count(&path, MB, true, 64).unwrap();
            set.add(b"survivor", TTL_INFINITE).unwrap();
            set.flush().unwrap();
        }
        let set = ShmSet::open(&path).unwrap();
        assert_eq!(set.bucket_count(), 64);
        assert!(set.contains(b"survivor"));
    }
}
