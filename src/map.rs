//! Hash map from opaque keys to opaque values backed by a mapped file.
//!
//! Same skeleton as the set (open chaining over a fixed bucket array,
//! per-bucket process-shared mutexes for writers, lock-free acquire-load
//! reads), but records carry key and value side by side and lookup is
//! driven by the key alone.
//!
//! Value updates follow a sizing rule: when the new value is exactly the
//! stored length, the bytes are overwritten in place (no allocation, chain
//! untouched); otherwise a replacement record is spliced in between the
//! same neighbours and the old one is freed.

use std::path::Path;
use std::sync::atomic::Ordering;

use crossbeam_utils::CachePadded;
use tracing::trace;

use crate::error::{Error, Result};
use crate::shm::entry::{
    bytes_equal, fnv1a_hash, Bucket, HashTableHeader, KeyValue, DEFAULT_BUCKET_COUNT, NULL_OFFSET,
};
use crate::shm::mapping::{region_kind, MappedFile, DEFAULT_INITIAL_SIZE};
use crate::stats::CollectionStats;

const HEADER_REGION: &str = "map_header";
const BUCKETS_REGION: &str = "map_buckets";

/// A persistent, shared-memory-backed hash map with per-entry TTL.
pub struct ShmMap {
    file: MappedFile,
    header_offset: u64,
    buckets_offset: u64,
    stats: CachePadded<CollectionStats>,
}

impl ShmMap {
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
    /// up to a power of two; `0` selects the default). Applies only when
    /// the file is created.
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
                "invalid map header in {}",
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

        let map = ShmMap {
            file,
            header_offset,
            buckets_offset,
            stats: CachePadded::new(CollectionStats::default()),
        };
        map.stats
            .set_size(map.header().common.size.load(Ordering::Relaxed));
        Ok(map)
    }

    fn header(&self) -> &HashTableHeader {
        unsafe { &*(self.file.ptr_at(self.header_offset) as *const HashTableHeader) }
    }

    fn kv_ptr(&self, offset: i64) -> *mut KeyValue {
        debug_assert!(offset >= 0);
        self.file.ptr_at(offset as u64) as *mut KeyValue
    }

    fn bucket_ptr(&self, index: u32) -> *mut Bucket {
        let offset = self.buckets_offset + index as u64 * std::mem::size_of::<Bucket>() as u64;
        self.file.ptr_at(offset) as *mut Bucket
    }

    fn bucket_for(&self, hash: u32) -> *mut Bucket {
        self.bucket_ptr(self.header().bucket_index(hash))
    }

    /// First chain record whose key matches, regardless of expiry. Bucket
    /// mutex must be held.
    fn find_in_bucket(&self, bucket: *mut Bucket, key: &[u8], hash: u32) -> Option<i64> {
        let mut cur = unsafe { (*bucket).head_offset.load(Ordering::Acquire) };
        while cur >= 0 {
            let kv = self.kv_ptr(cur);
            unsafe {
                if (*kv).entry.is_valid()
                    && (*kv).entry.hash_code == hash
                    && bytes_equal(KeyValue::key(kv), key)
                {
                    return Some(cur);
                }
                cur = (*kv).next_offset.load(Ordering::Acquire);
            }
        }
        None
    }

    fn allocate_kv(&self, key: &[u8], value: &[u8], ttl_seconds: i64) -> Result<i64> {
        let offset = self
            .file
            .allocate(KeyValue::total_size(key.len(), value.len()))? as i64;
        let kv = self.kv_ptr(offset);
        unsafe {
            KeyValue::init(kv);
            KeyValue::write_payload(kv, key, value, ttl_seconds);
        }
        Ok(offset)
    }

    fn free_kv(&self, offset: i64) {
        unsafe { (*self.kv_ptr(offset)).entry.mark_deleted() };
        self.file.deallocate(offset);
    }

    /// Splice a brand-new record at the chain head and bump the counters.
    /// Bucket mutex must be held.
    fn insert_new(&self, bucket: *mut Bucket, key: &[u8], value: &[u8], ttl: i64) -> Result<()> {
        let offset = self.allocate_kv(key, value, ttl)?;
        unsafe {
            let kv = self.kv_ptr(offset);
            let old_head = (*bucket).head_offset.load(Ordering::Acquire);
            (*kv).next_offset.store(old_head, Ordering::Release);
            (*kv).prev_offset.store(NULL_OFFSET, Ordering::Release);
            if old_head >= 0 {
                (*self.kv_ptr(old_head))
                    .prev_offset
                    .store(offset, Ordering::Release);
            }
            (*bucket).head_offset.store(offset, Ordering::Release);
            (*bucket).count.fetch_add(1, Ordering::AcqRel);
        }

        let header = self.header();
        header.common.size.fetch_add(1, Ordering::AcqRel);
        header
            .total_bytes
            .fetch_add((key.len() + value.len()) as u64, Ordering::Relaxed);
        header.common.touch();
        self.stats.add_size(1);
        self.stats.record_write();
        Ok(())
    }

    /// Detach a record from its chain. Bucket mutex must be held.
    fn unlink_from_chain(&self, bucket: *mut Bucket, offset: i64) {
        unsafe {
            let kv = self.kv_ptr(offset);
            let prev = (*kv).prev_offset.load(Ordering::Acquire);
            let next = (*kv).next_offset.load(Ordering::Acquire);
            if prev >= 0 {
                (*self.kv_ptr(prev)).next_offset.store(next, Ordering::Release);
            } else {
                (*bucket).head_offset.store(next, Ordering::Release);
            }
            if next >= 0 {
                (*self.kv_ptr(next)).prev_offset.store(prev, Ordering::Release);
            }
            (*bucket).count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Replace a record with a resized copy spliced between the same
    /// neighbours. Bucket mutex must be held.
    fn splice_replace(
        &self,
        bucket: *mut Bucket,
        old_offset: i64,
        key: &[u8],
        value: &[u8],
        ttl: i64,
    ) -> Result<()> {
        let (prev, next) = unsafe {
            let old = self.kv_ptr(old_offset);
            (
                (*old).prev_offset.load(Ordering::Acquire),
                (*old).next_offset.load(Ordering::Acquire),
            )
        };

        let new_offset = self.allocate_kv(key, value, ttl)?;
        unsafe {
            let new = self.kv_ptr(new_offset);
            (*new).prev_offset.store(prev, Ordering::Release);
            (*new).next_offset.store(next, Ordering::Release);
            if prev >= 0 {
                (*self.kv_ptr(prev))
                    .next_offset
                    .store(new_offset, Ordering::Release);
            } else {
                (*bucket).head_offset.store(new_offset, Ordering::Release);
            }
            if next >= 0 {
                (*self.kv_ptr(next))
                    .prev_offset
                    .store(new_offset, Ordering::Release);
            }
        }
        self.free_kv(old_offset);
        Ok(())
    }

    /// Insert or update. Updating an existing key follows the sizing rule;
    /// an expired record for the key is revived by the update.
    pub fn put(&mut self, key: &[u8], value: &[u8], ttl_seconds: i64) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        let hash = fnv1a_hash(key);
        let bucket = self.bucket_for(hash);
        let _guard = unsafe { (*bucket).mutex.lock() };

        if let Some(offset) = self.find_in_bucket(bucket, key, hash) {
            let kv = self.kv_ptr(offset);
            if unsafe { (*kv).value_size as usize } == value.len() {
                unsafe { KeyValue::overwrite_value(kv, value, ttl_seconds) };
            } else {
                self.splice_replace(bucket, offset, key, value, ttl_seconds)?;
            }
            self.header().common.touch();
            self.stats.record_write();
            return Ok(true);
        }

        self.insert_new(bucket, key, value, ttl_seconds)?;
        Ok(true)
    }

    /// Insert only when no alive record exists for the key. An expired
    /// record is unlinked first and a fresh one inserted.
    pub fn put_if_absent(&mut self, key: &[u8], value: &[u8], ttl_seconds: i64) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        let hash = fnv1a_hash(key);
        let bucket = self.bucket_for(hash);
        let _guard = unsafe { (*bucket).mutex.lock() };

        if let Some(offset) = self.find_in_bucket(bucket, key, hash) {
            if unsafe { (*self.kv_ptr(offset)).entry.is_alive() } {
                return Ok(false);
            }
            self.unlink_from_chain(bucket, offset);
            self.free_kv(offset);
            self.header().common.size.fetch_sub(1, Ordering::AcqRel);
            self.stats.sub_size(1);
        }

        self.insert_new(bucket, key, value, ttl_seconds)?;
        Ok(true)
    }

    /// Value for `key`, if an alive record exists. Lock-free.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if key.is_empty() {
            return None;
        }
        let hash = fnv1a_hash(key);
        let bucket = self.bucket_for(hash);

        let mut cur = unsafe { (*bucket).head_offset.load(Ordering::Acquire) };
        while cur >= 0 {
            let kv = self.kv_ptr(cur);
            unsafe {
                if (*kv).entry.is_alive()
                    && (*kv).entry.hash_code == hash
                    && bytes_equal(KeyValue::key(kv), key)
                {
                    self.stats.record_hit();
                    return Some(KeyValue::value(kv).to_vec());
                }
                cur = (*kv).next_offset.load(Ordering::Acquire);
            }
        }
        self.stats.record_miss();
        None
    }

    /// Value for `key`, or a copy of `default` when absent or expired.
    pub fn get_or_default(&self, key: &[u8], default: &[u8]) -> Vec<u8> {
        self.get(key).unwrap_or_else(|| default.to_vec())
    }

    /// Remaining TTL for `key`: `-1` infinite, `0` absent or expired.
    /// Lock-free.
    pub fn get_ttl(&self, key: &[u8]) -> i64 {
        if key.is_empty() {
            return 0;
        }
        let hash = fnv1a_hash(key);
        let bucket = self.bucket_for(hash);

        let mut cur = unsafe { (*bucket).head_offset.load(Ordering::Acquire) };
        while cur >= 0 {
            let kv = self.kv_ptr(cur);
            unsafe {
                if (*kv).entry.is_alive()
                    && (*kv).entry.hash_code == hash
                    && bytes_equal(KeyValue::key(kv), key)
                {
                    return (*kv).entry.remaining_ttl_seconds();
                }
                cur = (*kv).next_offset.load(Ordering::Acquire);
            }
        }
        0
    }

    /// Update the TTL of the alive record for `key`; rebases `created_at`.
    pub fn set_ttl(&mut self, key: &[u8], ttl_seconds: i64) -> bool {
        if key.is_empty() {
            return false;
        }
        let hash = fnv1a_hash(key);
        let bucket = self.bucket_for(hash);
        let _guard = unsafe { (*bucket).mutex.lock() };

        let Some(offset) = self.find_in_bucket(bucket, key, hash) else {
            return false;
        };
        let kv = self.kv_ptr(offset);
        if !unsafe { (*kv).entry.is_alive() } {
            return false;
        }
        unsafe { (*kv).entry.set_ttl(ttl_seconds) };
        self.header().common.touch();
        true
    }

    /// Remove the record for `key`, returning its value when it was alive.
    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        if key.is_empty() {
            return None;
        }
        let hash = fnv1a_hash(key);
        let bucket = self.bucket_for(hash);
        let _guard = unsafe { (*bucket).mutex.lock() };

        let offset = self.find_in_bucket(bucket, key, hash)?;
        let kv = self.kv_ptr(offset);
        let value = unsafe {
            if (*kv).entry.is_alive() {
                Some(KeyValue::value(kv).to_vec())
            } else {
                None
            }
        };

        self.unlink_from_chain(bucket, offset);
        self.free_kv(offset);
        let header = self.header();
        header.common.size.fetch_sub(1, Ordering::AcqRel);
        header.common.touch();
        self.stats.sub_size(1);
        value
    }

    /// Remove only when the alive record's value equals `expected_value`.
    pub fn remove_if_equals(&mut self, key: &[u8], expected_value: &[u8]) -> bool {
        if key.is_empty() {
            return false;
        }
        let hash = fnv1a_hash(key);
        let bucket = self.bucket_for(hash);
        let _guard = unsafe { (*bucket).mutex.lock() };

        let Some(offset) = self.find_in_bucket(bucket, key, hash) else {
            return false;
        };
        let kv = self.kv_ptr(offset);
        unsafe {
            if !(*kv).entry.is_alive() || !bytes_equal(KeyValue::value(kv), expected_value) {
                return false;
            }
        }

        self.unlink_from_chain(bucket, offset);
        self.free_kv(offset);
        let header = self.header();
        header.common.size.fetch_sub(1, Ordering::AcqRel);
        header.common.touch();
        self.stats.sub_size(1);
        true
    }

    /// Replace the value only when an alive record exists for the key.
    pub fn replace(&mut self, key: &[u8], value: &[u8], ttl_seconds: i64) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        let hash = fnv1a_hash(key);
        let bucket = self.bucket_for(hash);
        let _guard = unsafe { (*bucket).mutex.lock() };

        let Some(offset) = self.find_in_bucket(bucket, key, hash) else {
            return Ok(false);
        };
        let kv = self.kv_ptr(offset);
        if !unsafe { (*kv).entry.is_alive() } {
            return Ok(false);
        }

        if unsafe { (*kv).value_size as usize } == value.len() {
            unsafe { KeyValue::overwrite_value(kv, value, ttl_seconds) };
        } else {
            self.splice_replace(bucket, offset, key, value, ttl_seconds)?;
        }
        self.header().common.touch();
        self.stats.record_write();
        Ok(true)
    }

    /// Compare-and-replace: succeeds only when the key is alive and its
    /// current value equals `expected_value`.
    pub fn replace_if_equals(
        &mut self,
        key: &[u8],
        expected_value: &[u8],
        new_value: &[u8],
        ttl_seconds: i64,
    ) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        let hash = fnv1a_hash(key);
        let bucket = self.bucket_for(hash);
        let _guard = unsafe { (*bucket).mutex.lock() };

        let Some(offset) = self.find_in_bucket(bucket, key, hash) else {
            return Ok(false);
        };
        let kv = self.kv_ptr(offset);
        unsafe {
            if !(*kv).entry.is_alive() || !bytes_equal(KeyValue::value(kv), expected_value) {
                return Ok(false);
            }
        }

        if unsafe { (*kv).value_size as usize } == new_value.len() {
            unsafe { KeyValue::overwrite_value(kv, new_value, ttl_seconds) };
        } else {
            self.splice_replace(bucket, offset, key, new_value, ttl_seconds)?;
        }
        self.header().common.touch();
        self.stats.record_write();
        Ok(true)
    }

    /// Lock-free key probe.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        if key.is_empty() {
            return false;
        }
        let hash = fnv1a_hash(key);
        let bucket = self.bucket_for(hash);

        let mut cur = unsafe { (*bucket).head_offset.load(Ordering::Acquire) };
        while cur >= 0 {
            let kv = self.kv_ptr(cur);
            unsafe {
                if (*kv).entry.is_alive()
                    && (*kv).entry.hash_code == hash
                    && bytes_equal(KeyValue::key(kv), key)
                {
                    return true;
                }
                cur = (*kv).next_offset.load(Ordering::Acquire);
            }
        }
        false
    }

    /// Whether any alive record stores exactly `value`. Unindexed: walks
    /// every bucket chain.
    pub fn contains_value(&self, value: &[u8]) -> bool {
        let mut found = false;
        self.for_each(|_, v| {
            if bytes_equal(v, value) {
                found = true;
                return false;
            }
            true
        });
        found
    }

    /// Unlink and free every expired record; returns how many were swept.
    pub fn remove_expired(&mut self) -> usize {
        let mut removed = 0;
        for i in 0..self.header().bucket_count {
            let bucket = self.bucket_ptr(i);
            let _guard = unsafe { (*bucket).mutex.lock() };

            let mut cur = unsafe { (*bucket).head_offset.load(Ordering::Acquire) };
            while cur >= 0 {
                let kv = self.kv_ptr(cur);
                let next = unsafe { (*kv).next_offset.load(Ordering::Acquire) };
                if unsafe { (*kv).entry.is_expired() } {
                    self.unlink_from_chain(bucket, cur);
                    self.free_kv(cur);
                    self.header().common.size.fetch_sub(1, Ordering::AcqRel);
                    self.stats.sub_size(1);
                    removed += 1;
                }
                cur = next;
            }
        }
        if removed > 0 {
            self.header().common.touch();
            trace!(removed, "swept expired map records");
        }
        removed
    }

    /// Visit alive (key, value) pairs; the callback returns `false` to
    /// stop. Lock-free.
    pub fn for_each<F: FnMut(&[u8], &[u8]) -> bool>(&self, mut callback: F) {
        for i in 0..self.header().bucket_count {
            let bucket = self.bucket_ptr(i);
            let mut cur = unsafe { (*bucket).head_offset.load(Ordering::Acquire) };
            while cur >= 0 {
                let kv = self.kv_ptr(cur);
                unsafe {
                    if (*kv).entry.is_alive()
                        && !callback(KeyValue::key(kv), KeyValue::value(kv))
                    {
                        return;
                    }
                    cur = (*kv).next_offset.load(Ordering::Acquire);
                }
            }
        }
    }

    /// As [`ShmMap::for_each`], also passing the remaining TTL.
    pub fn for_each_with_ttl<F: FnMut(&[u8], &[u8], i64) -> bool>(&self, mut callback: F) {
        for i in 0..self.header().bucket_count {
            let bucket = self.bucket_ptr(i);
            let mut cur = unsafe { (*bucket).head_offset.load(Ordering::Acquire) };
            while cur >= 0 {
                let kv = self.kv_ptr(cur);
                unsafe {
                    if (*kv).entry.is_alive() {
                        let ttl = (*kv).entry.remaining_ttl_seconds();
                        if !callback(KeyValue::key(kv), KeyValue::value(kv), ttl) {
                            return;
                        }
                    }
                    cur = (*kv).next_offset.load(Ordering::Acquire);
                }
            }
        }
    }

    /// Visit alive keys.
    pub fn for_each_key<F: FnMut(&[u8]) -> bool>(&self, mut callback: F) {
        self.for_each(|key, _| callback(key));
    }

    /// Visit alive values.
    pub fn for_each_value<F: FnMut(&[u8]) -> bool>(&self, mut callback: F) {
        self.for_each(|_, value| callback(value));
    }

    /// Collect alive keys.
    pub fn key_set(&self) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        self.for_each_key(|key| {
            keys.push(key.to_vec());
            true
        });
        keys
    }

    /// Collect alive values.
    pub fn values(&self) -> Vec<Vec<u8>> {
        let mut values = Vec::new();
        self.for_each_value(|value| {
            values.push(value.to_vec());
            true
        });
        values
    }

    /// Remove every record, expired or not.
    pub fn clear(&mut self) {
        for i in 0..self.header().bucket_count {
            let bucket = self.bucket_ptr(i);
            let _guard = unsafe { (*bucket).mutex.lock() };

            let mut cur = unsafe { (*bucket).head_offset.load(Ordering::Acquire) };
            while cur >= 0 {
                let kv = self.kv_ptr(cur);
                let next = unsafe { (*kv).next_offset.load(Ordering::Acquire) };
                self.free_kv(cur);
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
                let kv = self.kv_ptr(cur);
                unsafe {
                    if (*kv).entry.is_alive() {
                        alive += 1;
                    }
                    cur = (*kv).next_offset.load(Ordering::Acquire);
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

    fn new_map(dir: &tempfile::TempDir, name: &str) -> ShmMap {
        ShmMap::with_bucket_count(dir.path().join(name), MB, true, 64).unwrap()
    }

    #[test]
    fn test_put_get() {
        let dir = tempdir().unwrap();
        let mut map = new_map(&dir, "basic.shm");

        map.put(b"user:1001", b"John", TTL_INFINITE).unwrap();
        map.put(b"user:1002", b"Jane", TTL_INFINITE).unwrap();
        assert_eq!(map.size(), 2);
        assert_eq!(map.get(b"user:1001").unwrap(), b"John");
        assert_eq!(map.get(b"user:1002").unwrap(), b"Jane");
        assert_eq!(map.get(b"user:1003"), None);
    }

    #[test]
    fn test_put_overwrites() {
        let dir = tempdir().unwrap();
        let mut map = new_map(&dir, "overwrite.shm");

        map.put(b"k", b"v1", TTL_INFINITE).unwrap();
        // Same value length: in-place path.
        map.put(b"k", b"v2", TTL_INFINITE).unwrap();
        assert_eq!(map.get(b"k").unwrap(), b"v2");
        // Different length: splice-replacement path.
        map.put(b"k", b"a much longer value", TTL_INFINITE).unwrap();
        assert_eq!(map.get(b"k").unwrap(), b"a much longer value");
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn test_put_if_absent() {
        let dir = tempdir().unwrap();
        let mut map = new_map(&dir, "pia.shm");

        assert!(map.put_if_absent(b"k", b"first", TTL_INFINITE).unwrap());
        assert!(!map.put_if_absent(b"k", b"second", TTL_INFINITE).unwrap());
        assert_eq!(map.get(b"k").unwrap(), b"first");
    }

    #[test]
    fn test_put_if_absent_replaces_expired() {
        let dir = tempdir().unwrap();
        let mut map = new_map(&dir, "pia-expired.shm");

        map.put(b"k", b"stale", 0).unwrap();
        assert_eq!(map.get(b"k"), None);
        // The expired record is unlinked and a fresh one inserted.
        assert!(map.put_if_absent(b"k", b"fresh", TTL_INFINITE).unwrap());
        assert_eq!(map.get(b"k").unwrap(), b"fresh");
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn test_replace_requires_alive_key() {
        let dir = tempdir().unwrap();
        let mut map = new_map(&dir, "replace.shm");

        assert!(!map.replace(b"k", b"v", TTL_INFINITE).unwrap());
        map.put(b"k", b"v1", TTL_INFINITE).unwrap();
        assert!(map.replace(b"k", b"v2", TTL_INFINITE).unwrap());
        assert_eq!(map.get(b"k").unwrap(), b"v2");
    }

    #[test]
    fn test_replace_if_equals() {
        let dir = tempdir().unwrap();
        let mut map = new_map(&dir, "cas.shm");
        map.put(b"k", b"old", TTL_INFINITE).unwrap();

        assert!(!map
            .replace_if_equals(b"k", b"wrong", b"new", TTL_INFINITE)
            .unwrap());
        assert_eq!(map.get(b"k").unwrap(), b"old");

        assert!(map
            .replace_if_equals(b"k", b"old", b"new", TTL_INFINITE)
            .unwrap());
        assert_eq!(map.get(b"k").unwrap(), b"new");
    }

    #[test]
    fn test_remove_and_conditional_remove() {
        let dir = tempdir().unwrap();
        let mut map = new_map(&dir, "remove.shm");
        map.put(b"k", b"v", TTL_INFINITE).unwrap();

        assert!(!map.remove_if_equals(b"k", b"other"));
        assert!(map.contains_key(b"k"));
        assert!(map.remove_if_equals(b"k", b"v"));
        assert!(!map.contains_key(b"k"));

        map.put(b"k2", b"v2", TTL_INFINITE).unwrap();
        assert_eq!(map.remove(b"k2").unwrap(), b"v2");
        assert_eq!(map.remove(b"k2"), None);
    }

    #[test]
    fn test_get_or_default() {
        let dir = tempdir().unwrap();
        let mut map = new_map(&dir, "default.shm");
        map.put(b"k", b"v", TTL_INFINITE).unwrap();

        assert_eq!(map.get_or_default(b"k", b"fallback"), b"v");
        assert_eq!(map.get_or_default(b"missing", b"fallback"), b"fallback");
    }

    #[test]
    fn test_ttl_accessors() {
        let dir = tempdir().unwrap();
        let mut map = new_map(&dir, "ttl.shm");
        map.put(b"config:app", b"v", TTL_INFINITE).unwrap();
        map.put(b"session:abc", b"data", 30).unwrap();

        assert_eq!(map.get_ttl(b"config:app"), -1);
        let remaining = map.get_ttl(b"session:abc");
        assert!(remaining > 20 && remaining <= 30, "remaining = {remaining}");
        assert_eq!(map.get_ttl(b"missing"), 0);

        assert!(map.set_ttl(b"session:abc", TTL_INFINITE));
        assert_eq!(map.get_ttl(b"session:abc"), -1);
    }

    #[test]
    fn test_expiry_and_sweep() {
        let dir = tempdir().unwrap();
        let mut map = new_map(&dir, "sweep.shm");
        map.put(b"stays", b"v", TTL_INFINITE).unwrap();
        map.put(b"goes", b"v", 1).unwrap();
        assert_eq!(map.size(), 2);

        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(map.size(), 1);
        assert_eq!(map.get(b"goes"), None);
        assert_eq!(map.remove_expired(), 1);
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn test_contains_value_scan() {
        let dir = tempdir().unwrap();
        let mut map = new_map(&dir, "cv.shm");
        map.put(b"a", b"needle", TTL_INFINITE).unwrap();
        map.put(b"b", b"hay", TTL_INFINITE).unwrap();

        assert!(map.contains_value(b"needle"));
        assert!(!map.contains_value(b"absent"));
    }

    #[test]
    fn test_iterators() {
        let dir = tempdir().unwrap();
        let mut map = new_map(&dir, "iter.shm");
        map.put(b"a", b"1", TTL_INFINITE).unwrap();
        map.put(b"b", b"2", TTL_INFINITE).unwrap();

        let mut keys = map.key_set();
        keys.sort();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);

        let mut values = map.values();
        values.sort();
        assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec()]);

        let mut pairs = 0;
        map.for_each_with_ttl(|_, _, ttl| {
            assert_eq!(ttl, -1);
            pairs += 1;
            true
        });
        assert_eq!(pairs, 2);
    }

    #[test]
    fn test_clear() {
        let dir = tempdir().unwrap();
        let mut map = new_map(&dir, "clear.shm");
        for i in 0..20u32 {
            map.put(&i.to_le_bytes(), b"v", TTL_INFINITE).unwrap();
        }
        map.clear();
        assert!(map.is_empty());
        map.put(b"again", b"v", TTL_INFINITE).unwrap();
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.shm");
        {
            let mut map = ShmMap::with_bucket_count(&path, MB, true, 64).unwrap();
            map.put(b"survivor", b"value", TTL_INFINITE).unwrap();
            map.flush().unwrap();
        }
        let map = ShmMap::open(&path).unwrap();
        assert_eq!(map.get(b"survivor").unwrap(), b"value");
    }
}
