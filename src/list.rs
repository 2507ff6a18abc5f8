//! Ordered list of opaque payloads backed by a mapped file.
//!
//! Nodes form a doubly-linked chain addressed by file offsets, with head
//! and tail kept in the [`ListHeader`]. Both ends are O(1); positional
//! access is O(n) with a sequential-access cache that makes `get(i)`,
//! `get(i + 1)` walks amortised O(1).
//!
//! Every operation, reads included, holds the header's process-shared
//! rwlock exclusively; the payoff is that the positional cache and the
//! expiry skips never race.

use std::cell::Cell;
use std::path::Path;
use std::sync::atomic::Ordering;

use crossbeam_utils::CachePadded;
use tracing::trace;

use crate::error::{Error, Result};
use crate::shm::entry::{bytes_equal, fnv1a_hash, ListHeader, Node, NULL_OFFSET};
use crate::shm::mapping::{region_kind, MappedFile, DEFAULT_INITIAL_SIZE};
use crate::stats::CollectionStats;

const HEADER_REGION: &str = "list_header";

/// Positional lookup cache; only meaningful between operations of one
/// handle, invalidated by any structural change.
#[derive(Clone, Copy)]
struct AccessCache {
    last_index: usize,
    last_offset: i64,
}

const CACHE_EMPTY: AccessCache = AccessCache {
    last_index: usize::MAX,
    last_offset: NULL_OFFSET,
};

/// A persistent, shared-memory-backed ordered list with per-entry TTL.
pub struct ShmList {
    file: MappedFile,
    header_offset: u64,
    stats: CachePadded<CollectionStats>,
    access_cache: Cell<AccessCache>,
}

// All operations run under the header's exclusive lock, which also makes
// the unsynchronized access cache safe to share.
unsafe impl Send for ShmList {}
unsafe impl Sync for ShmList {}

impl ShmList {
    /// Open `path`, creating it with default sizing if absent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_or_create(path, DEFAULT_INITIAL_SIZE, false)
    }

    /// Open or create the list file. With `create_new`, any existing file
    /// is replaced.
    pub fn open_or_create<P: AsRef<Path>>(
        path: P,
        initial_size: usize,
        create_new: bool,
    ) -> Result<Self> {
        let file = MappedFile::open_or_create(path, initial_size, create_new)?;
        let (header_offset, _created) = file.find_or_create_region(
            HEADER_REGION,
            region_kind::LIST_HEADER,
            std::mem::size_of::<ListHeader>(),
            |ptr| unsafe { ListHeader::init(ptr as *mut ListHeader) },
        )?;

        let list = ShmList {
            file,
            header_offset,
            stats: CachePadded::new(CollectionStats::default()),
            access_cache: Cell::new(CACHE_EMPTY),
        };
        if !list.header().common.is_valid() {
            return Err(Error::InternalError(format!(
                "invalid list header in {}",
                list.file.path().display()
            )));
        }
        list.stats
            .set_size(list.header().common.size.load(Ordering::Relaxed));
        Ok(list)
    }

    fn header(&self) -> &ListHeader {
        unsafe { &*(self.file.ptr_at(self.header_offset) as *const ListHeader) }
    }

    fn node_ptr(&self, offset: i64) -> *mut Node {
        debug_assert!(offset >= 0);
        self.file.ptr_at(offset as u64) as *mut Node
    }

    fn invalidate_cache(&self) {
        self.access_cache.set(CACHE_EMPTY);
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

    fn free_node(&self, offset: i64) {
        unsafe { (*self.node_ptr(offset)).entry.mark_deleted() };
        self.file.deallocate(offset);
    }

    /// Splice a node between `prev` and `next` (either may be null),
    /// updating head/tail as needed. Lock must be held.
    fn link_node(&self, node_offset: i64, prev: i64, next: i64) {
        let header = self.header();
        unsafe {
            let node = self.node_ptr(node_offset);
            (*node).prev_offset.store(prev, Ordering::Release);
            (*node).next_offset.store(next, Ordering::Release);

            if prev >= 0 {
                (*self.node_ptr(prev))
                    .next_offset
                    .store(node_offset, Ordering::Release);
            } else {
                header.head_offset.store(node_offset, Ordering::Release);
            }

            if next >= 0 {
                (*self.node_ptr(next))
                    .prev_offset
                    .store(node_offset, Ordering::Release);
            } else {
                header.tail_offset.store(node_offset, Ordering::Release);
            }
        }
    }

    /// Detach a node from the chain. Lock must be held.
    fn unlink_node(&self, node_offset: i64) {
        let header = self.header();
        unsafe {
            let node = self.node_ptr(node_offset);
            let prev = (*node).prev_offset.load(Ordering::Acquire);
            let next = (*node).next_offset.load(Ordering::Acquire);

            if prev >= 0 {
                (*self.node_ptr(prev)).next_offset.store(next, Ordering::Release);
            } else {
                header.head_offset.store(next, Ordering::Release);
            }

            if next >= 0 {
                (*self.node_ptr(next)).prev_offset.store(prev, Ordering::Release);
            } else {
                header.tail_offset.store(prev, Ordering::Release);
            }
        }
        self.invalidate_cache();
    }

    /// Offset of the `index`-th alive node. Checks the access cache for
    /// repeat and ±1 lookups before falling back to a head scan that counts
    /// alive nodes. Lock must be held.
    fn node_at_index(&self, index: usize) -> Option<i64> {
        let cache = self.access_cache.get();
        if cache.last_offset >= 0 && cache.last_index != usize::MAX {
            let cached = self.node_ptr(cache.last_offset);
            if unsafe { (*cached).entry.is_alive() } {
                if index == cache.last_index {
                    return Some(cache.last_offset);
                }
                if index == cache.last_index + 1 {
                    let mut cur = unsafe { (*cached).next_offset.load(Ordering::Acquire) };
                    while cur >= 0 {
                        let node = self.node_ptr(cur);
                        if unsafe { (*node).entry.is_alive() } {
                            self.access_cache.set(AccessCache {
                                last_index: index,
                                last_offset: cur,
                            });
                            return Some(cur);
                        }
                        cur = unsafe { (*node).next_offset.load(Ordering::Acquire) };
                    }
                    return None;
                }
                if cache.last_index > 0 && index == cache.last_index - 1 {
                    let mut cur = unsafe { (*cached).prev_offset.load(Ordering::Acquire) };
                    while cur >= 0 {
                        let node = self.node_ptr(cur);
                        if unsafe { (*node).entry.is_alive() } {
                            self.access_cache.set(AccessCache {
                                last_index: index,
                                last_offset: cur,
                            });
                            return Some(cur);
                        }
                        cur = unsafe { (*node).prev_offset.load(Ordering::Acquire) };
                    }
                    return None;
                }
            }
        }

        let mut cur = self.header().head_offset.load(Ordering::Acquire);
        let mut live = 0usize;
        while cur >= 0 {
            let node = self.node_ptr(cur);
            if unsafe { (*node).entry.is_alive() } {
                if live == index {
                    self.access_cache.set(AccessCache {
                        last_index: index,
                        last_offset: cur,
                    });
                    return Some(cur);
                }
                live += 1;
            }
            cur = unsafe { (*node).next_offset.load(Ordering::Acquire) };
        }
        None
    }

    /// Count alive nodes. Lock must be held.
    fn alive_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.header().head_offset.load(Ordering::Acquire);
        while cur >= 0 {
            let node = self.node_ptr(cur);
            if unsafe { (*node).entry.is_alive() } {
                count += 1;
            }
            cur = unsafe { (*node).next_offset.load(Ordering::Acquire) };
        }
        count
    }

    fn bump_size(&self) {
        let header = self.header();
        header.common.size.fetch_add(1, Ordering::AcqRel);
        header.common.touch();
        self.stats.add_size(1);
        self.stats.record_write();
    }

    fn drop_size(&self) {
        let header = self.header();
        header.common.size.fetch_sub(1, Ordering::AcqRel);
        header.common.touch();
        self.stats.sub_size(1);
    }

    /// Append to the tail. Rejects empty payloads.
    pub fn add(&mut self, data: &[u8], ttl_seconds: i64) -> Result<bool> {
        if data.is_empty() {
            return Ok(false);
        }
        let header = self.header();
        let _guard = header.common.lock.write();

        let node_offset = self.allocate_node(data, ttl_seconds)?;
        let tail = self.header().tail_offset.load(Ordering::Acquire);
        self.link_node(node_offset, tail, NULL_OFFSET);
        self.bump_size();
        Ok(true)
    }

    /// Prepend to the head.
    pub fn add_first(&mut self, data: &[u8], ttl_seconds: i64) -> Result<bool> {
        if data.is_empty() {
            return Ok(false);
        }
        let header = self.header();
        let _guard = header.common.lock.write();

        let node_offset = self.allocate_node(data, ttl_seconds)?;
        let head = self.header().head_offset.load(Ordering::Acquire);
        self.link_node(node_offset, NULL_OFFSET, head);
        self.bump_size();
        self.invalidate_cache();
        Ok(true)
    }

    /// Insert before visible index `index`; `index == size` appends.
    /// Returns `Ok(false)` when `index > size`.
    pub fn add_at(&mut self, index: usize, data: &[u8], ttl_seconds: i64) -> Result<bool> {
        if data.is_empty() {
            return Ok(false);
        }
        let header = self.header();
        let _guard = header.common.lock.write();

        let visible = self.alive_count();
        if index > visible {
            return Ok(false);
        }

        let node_offset = self.allocate_node(data, ttl_seconds)?;
        if index == visible {
            let tail = self.header().tail_offset.load(Ordering::Acquire);
            self.link_node(node_offset, tail, NULL_OFFSET);
        } else if index == 0 {
            let head = self.header().head_offset.load(Ordering::Acquire);
            self.link_node(node_offset, NULL_OFFSET, head);
        } else {
            let Some(next) = self.node_at_index(index) else {
                self.free_node(node_offset);
                return Ok(false);
            };
            let prev = unsafe { (*self.node_ptr(next)).prev_offset.load(Ordering::Acquire) };
            self.link_node(node_offset, prev, next);
        }
        self.bump_size();
        self.invalidate_cache();
        Ok(true)
    }

    /// Payload of the `index`-th alive node.
    pub fn get(&self, index: usize) -> Option<Vec<u8>> {
        let header = self.header();
        let _guard = header.common.lock.write();

        match self.node_at_index(index) {
            Some(offset) => {
                let data = unsafe { Node::read_payload(self.node_ptr(offset)) };
                self.stats.record_hit();
                Some(data)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// First alive payload, skipping any expired prefix.
    pub fn get_first(&self) -> Option<Vec<u8>> {
        let header = self.header();
        let _guard = header.common.lock.write();
        self.end_payload(true)
    }

    /// Last alive payload, skipping any expired suffix.
    pub fn get_last(&self) -> Option<Vec<u8>> {
        let header = self.header();
        let _guard = header.common.lock.write();
        self.end_payload(false)
    }

    fn end_payload(&self, from_head: bool) -> Option<Vec<u8>> {
        let header = self.header();
        let mut cur = if from_head {
            header.head_offset.load(Ordering::Acquire)
        } else {
            header.tail_offset.load(Ordering::Acquire)
        };
        while cur >= 0 {
            let node = self.node_ptr(cur);
            if unsafe { (*node).entry.is_alive() } {
                self.stats.record_hit();
                return Some(unsafe { Node::read_payload(node) });
            }
            cur = unsafe {
                if from_head {
                    (*node).next_offset.load(Ordering::Acquire)
                } else {
                    (*node).prev_offset.load(Ordering::Acquire)
                }
            };
        }
        self.stats.record_miss();
        None
    }

    /// Remaining TTL of the `index`-th alive node: `-1` infinite, `0`
    /// absent or expired.
    pub fn get_ttl(&self, index: usize) -> i64 {
        let header = self.header();
        let _guard = header.common.lock.write();
        match self.node_at_index(index) {
            Some(offset) => unsafe { (*self.node_ptr(offset)).entry.remaining_ttl_seconds() },
            None => 0,
        }
    }

    /// Replace the payload at `index`. Same-size payloads are overwritten
    /// in place; otherwise the node is reallocated and spliced between the
    /// same neighbours.
    pub fn set(&mut self, index: usize, data: &[u8], ttl_seconds: i64) -> Result<bool> {
        if data.is_empty() {
            return Ok(false);
        }
        let header = self.header();
        let _guard = header.common.lock.write();

        let Some(offset) = self.node_at_index(index) else {
            return Ok(false);
        };
        let node = self.node_ptr(offset);
        unsafe {
            if (*node).entry.data_size as usize == data.len() {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    Node::data_ptr(node) as *mut u8,
                    data.len(),
                );
                (*node).entry.hash_code = fnv1a_hash(data);
                (*node).entry.set_ttl(ttl_seconds);
                (*node).entry.version.fetch_add(1, Ordering::Release);
                (*node).entry.mark_valid();
            } else {
                let prev = (*node).prev_offset.load(Ordering::Acquire);
                let next = (*node).next_offset.load(Ordering::Acquire);
                let new_offset = self.allocate_node(data, ttl_seconds)?;
                self.link_node(new_offset, prev, next);
                self.free_node(offset);
            }
        }
        self.header().common.touch();
        self.stats.record_write();
        self.invalidate_cache();
        Ok(true)
    }

    /// Update the TTL of the `index`-th alive node without touching its
    /// payload; rebases `created_at`.
    pub fn set_ttl(&mut self, index: usize, ttl_seconds: i64) -> bool {
        let header = self.header();
        let _guard = header.common.lock.write();

        let Some(offset) = self.node_at_index(index) else {
            return false;
        };
        unsafe { (*self.node_ptr(offset)).entry.set_ttl(ttl_seconds) };
        self.header().common.touch();
        true
    }

    /// Remove the `index`-th alive node and return its payload.
    pub fn remove(&mut self, index: usize) -> Option<Vec<u8>> {
        let header = self.header();
        let _guard = header.common.lock.write();

        let offset = self.node_at_index(index)?;
        let data = unsafe { Node::read_payload(self.node_ptr(offset)) };
        self.unlink_node(offset);
        self.free_node(offset);
        self.drop_size();
        Some(data)
    }

    /// Remove the first alive node.
    pub fn remove_first(&mut self) -> Option<Vec<u8>> {
        let header = self.header();
        let _guard = header.common.lock.write();
        self.remove_end(true)
    }

    /// Remove the last alive node.
    pub fn remove_last(&mut self) -> Option<Vec<u8>> {
        let header = self.header();
        let _guard = header.common.lock.write();
        self.remove_end(false)
    }

    fn remove_end(&self, from_head: bool) -> Option<Vec<u8>> {
        let header = self.header();
        let mut cur = if from_head {
            header.head_offset.load(Ordering::Acquire)
        } else {
            header.tail_offset.load(Ordering::Acquire)
        };
        while cur >= 0 {
            let node = self.node_ptr(cur);
            if unsafe { (*node).entry.is_alive() } {
                let data = unsafe { Node::read_payload(node) };
                self.unlink_node(cur);
                self.free_node(cur);
                self.drop_size();
                return Some(data);
            }
            cur = unsafe {
                if from_head {
                    (*node).next_offset.load(Ordering::Acquire)
                } else {
                    (*node).prev_offset.load(Ordering::Acquire)
                }
            };
        }
        None
    }

    /// Remove the first alive occurrence of `data`. The stored hash code
    /// pre-filters candidates before the byte comparison.
    pub fn remove_element(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let target_hash = fnv1a_hash(data);
        let header = self.header();
        let _guard = header.common.lock.write();

        let mut cur = self.header().head_offset.load(Ordering::Acquire);
        while cur >= 0 {
            let node = self.node_ptr(cur);
            unsafe {
                if (*node).entry.is_alive()
                    && (*node).entry.hash_code == target_hash
                    && bytes_equal(Node::payload(node), data)
                {
                    self.unlink_node(cur);
                    self.free_node(cur);
                    self.drop_size();
                    return true;
                }
                cur = (*node).next_offset.load(Ordering::Acquire);
            }
        }
        false
    }

    /// Unlink and free every expired node; returns how many were swept.
    pub fn remove_expired(&mut self) -> usize {
        let header = self.header();
        let _guard = header.common.lock.write();

        let mut removed = 0;
        let mut cur = self.header().head_offset.load(Ordering::Acquire);
        while cur >= 0 {
            let node = self.node_ptr(cur);
            let next = unsafe { (*node).next_offset.load(Ordering::Acquire) };
            if unsafe { (*node).entry.is_expired() } {
                self.unlink_node(cur);
                self.free_node(cur);
                self.drop_size();
                removed += 1;
            }
            cur = next;
        }
        if removed > 0 {
            trace!(removed, "swept expired list nodes");
        }
        removed
    }

    /// Whether any alive node carries exactly `data`.
    pub fn contains(&self, data: &[u8]) -> bool {
        self.index_of(data) >= 0
    }

    /// Visible index of the first alive occurrence of `data`, or `-1`.
    pub fn index_of(&self, data: &[u8]) -> i64 {
        if data.is_empty() {
            return -1;
        }
        let target_hash = fnv1a_hash(data);
        let header = self.header();
        let _guard = header.common.lock.write();

        let mut cur = self.header().head_offset.load(Ordering::Acquire);
        let mut index: i64 = 0;
        while cur >= 0 {
            let node = self.node_ptr(cur);
            unsafe {
                if (*node).entry.is_alive() {
                    if (*node).entry.hash_code == target_hash
                        && bytes_equal(Node::payload(node), data)
                    {
                        return index;
                    }
                    index += 1;
                }
                cur = (*node).next_offset.load(Ordering::Acquire);
            }
        }
        -1
    }

    /// Visible index of the last alive occurrence of `data`, or `-1`.
    pub fn last_index_of(&self, data: &[u8]) -> i64 {
        if data.is_empty() {
            return -1;
        }
        let target_hash = fnv1a_hash(data);
        let header = self.header();
        let _guard = header.common.lock.write();

        let total_alive = self.alive_count() as i64;
        let mut cur = self.header().tail_offset.load(Ordering::Acquire);
        let mut index = total_alive - 1;
        while cur >= 0 {
            let node = self.node_ptr(cur);
            unsafe {
                if (*node).entry.is_alive() {
                    if (*node).entry.hash_code == target_hash
                        && bytes_equal(Node::payload(node), data)
                    {
                        return index;
                    }
                    index -= 1;
                }
                cur = (*node).prev_offset.load(Ordering::Acquire);
            }
        }
        -1
    }

    /// Remove every node, expired or not.
    pub fn clear(&mut self) {
        let header = self.header();
        let _guard = header.common.lock.write();

        let mut cur = self.header().head_offset.load(Ordering::Acquire);
        while cur >= 0 {
            let node = self.node_ptr(cur);
            let next = unsafe { (*node).next_offset.load(Ordering::Acquire) };
            self.free_node(cur);
            cur = next;
        }

        let header = self.header();
        header.head_offset.store(NULL_OFFSET, Ordering::Release);
        header.tail_offset.store(NULL_OFFSET, Ordering::Release);
        header.common.size.store(0, Ordering::Release);
        header.common.touch();
        self.stats.set_size(0);
        self.invalidate_cache();
    }

    /// Count of alive nodes. Recomputed by traversal on every call; the
    /// header's raw counter is not trusted for visibility.
    pub fn size(&self) -> usize {
        let header = self.header();
        let _guard = header.common.lock.write();
        self.alive_count()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Visit alive payloads head→tail with their visible index; the
    /// callback returns `false` to stop.
    pub fn for_each<F: FnMut(&[u8], usize) -> bool>(&self, mut callback: F) {
        let header = self.header();
        let _guard = header.common.lock.write();

        let mut cur = self.header().head_offset.load(Ordering::Acquire);
        let mut index = 0usize;
        while cur >= 0 {
            let node = self.node_ptr(cur);
            unsafe {
                if (*node).entry.is_alive() {
                    if !callback(Node::payload(node), index) {
                        break;
                    }
                    index += 1;
                }
                cur = (*node).next_offset.load(Ordering::Acquire);
            }
        }
    }

    /// As [`ShmList::for_each`], also passing the remaining TTL.
    pub fn for_each_with_ttl<F: FnMut(&[u8], usize, i64) -> bool>(&self, mut callback: F) {
        let header = self.header();
        let _guard = header.common.lock.write();

        let mut cur = self.header().head_offset.load(Ordering::Acquire);
        let mut index = 0usize;
        while cur >= 0 {
            let node = self.node_ptr(cur);
            unsafe {
                if (*node).entry.is_alive() {
                    let ttl = (*node).entry.remaining_ttl_seconds();
                    if !callback(Node::payload(node), index, ttl) {
                        break;
                    }
                    index += 1;
                }
                cur = (*node).next_offset.load(Ordering::Acquire);
            }
        }
    }

    /// Collect alive payloads head→tail.
    pub fn to_vec(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        self.for_each(|data, _| {
            out.push(data.to_vec());
            true
        });
        out
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

    fn new_list(dir: &tempfile::TempDir, name: &str) -> ShmList {
        ShmList::open_or_create(dir.path().join(name), MB, true).unwrap()
    }

    #[test]
    fn test_add_get_size() {
        let dir = tempdir().unwrap();
        let mut list = new_list(&dir, "basic.shm");

        for word in ["Hello", "World", "shared memory", "is", "awesome!"] {
            assert!(list.add(word.as_bytes(), TTL_INFINITE).unwrap());
        }
        assert_eq!(list.size(), 5);
        assert_eq!(list.get(2).unwrap(), b"shared memory");
        assert_eq!(list.get(0).unwrap(), b"Hello");
        assert_eq!(list.get(4).unwrap(), b"awesome!");
        assert_eq!(list.get(5), None);
    }

    #[test]
    fn test_empty_payload_rejected() {
        let dir = tempdir().unwrap();
        let mut list = new_list(&dir, "empty.shm");
        assert!(!list.add(b"", TTL_INFINITE).unwrap());
        assert_eq!(list.size(), 0);
    }

    #[test]
    fn test_get_on_empty() {
        let dir = tempdir().unwrap();
        let list = new_list(&dir, "none.shm");
        assert_eq!(list.get(0), None);
        assert_eq!(list.get_first(), None);
        assert_eq!(list.get_last(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_add_first_and_positional_insert() {
        let dir = tempdir().unwrap();
        let mut list = new_list(&dir, "insert.shm");

        list.add(b"b", TTL_INFINITE).unwrap();
        list.add(b"d", TTL_INFINITE).unwrap();
        list.add_first(b"a", TTL_INFINITE).unwrap();
        assert!(list.add_at(2, b"c", TTL_INFINITE).unwrap());
        // index == size appends
        assert!(list.add_at(4, b"e", TTL_INFINITE).unwrap());
        // past the end fails
        assert!(!list.add_at(6, b"x", TTL_INFINITE).unwrap());

        let collected = list.to_vec();
        assert_eq!(collected, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec(), b"e".to_vec()]);
    }

    #[test]
    fn test_ends() {
        let dir = tempdir().unwrap();
        let mut list = new_list(&dir, "ends.shm");
        list.add(b"first", TTL_INFINITE).unwrap();
        list.add(b"middle", TTL_INFINITE).unwrap();
        list.add(b"last", TTL_INFINITE).unwrap();

        assert_eq!(list.get_first().unwrap(), b"first");
        assert_eq!(list.get_last().unwrap(), b"last");
        assert_eq!(list.remove_last().unwrap(), b"last");
        assert_eq!(list.remove_first().unwrap(), b"first");
        assert_eq!(list.size(), 1);
    }

    #[test]
    fn test_set_in_place_and_resized() {
        let dir = tempdir().unwrap();
        let mut list = new_list(&dir, "set.shm");
        list.add(b"aaaa", TTL_INFINITE).unwrap();
        list.add(b"keep", TTL_INFINITE).unwrap();

        // Same length: in-place update.
        assert!(list.set(0, b"bbbb", TTL_INFINITE).unwrap());
        assert_eq!(list.get(0).unwrap(), b"bbbb");

        // Different length: reallocation preserves position.
        assert!(list.set(0, b"a longer payload", TTL_INFINITE).unwrap());
        assert_eq!(list.get(0).unwrap(), b"a longer payload");
        assert_eq!(list.get(1).unwrap(), b"keep");
        assert_eq!(list.size(), 2);

        assert!(!list.set(7, b"nope", TTL_INFINITE).unwrap());
    }

    #[test]
    fn test_remove_by_index() {
        let dir = tempdir().unwrap();
        let mut list = new_list(&dir, "remove.shm");
        for word in ["Hello", "World", "shared memory", "is", "awesome!"] {
            list.add(word.as_bytes(), TTL_INFINITE).unwrap();
        }

        assert_eq!(list.remove(1).unwrap(), b"World");
        assert_eq!(
            list.to_vec(),
            vec![b"Hello".to_vec(), b"shared memory".to_vec(), b"is".to_vec(), b"awesome!".to_vec()]
        );
        assert_eq!(list.remove(10), None);
    }

    #[test]
    fn test_remove_element_keeps_duplicates() {
        let dir = tempdir().unwrap();
        let mut list = new_list(&dir, "dup.shm");
        list.add(b"x", TTL_INFINITE).unwrap();
        list.add(b"x", TTL_INFINITE).unwrap();

        assert!(list.remove_element(b"x"));
        assert!(list.contains(b"x"));
        assert!(list.remove_element(b"x"));
        assert!(!list.contains(b"x"));
        assert!(!list.remove_element(b"x"));
    }

    #[test]
    fn test_search() {
        let dir = tempdir().unwrap();
        let mut list = new_list(&dir, "search.shm");
        for word in ["Hello", "World", "shared memory", "World"] {
            list.add(word.as_bytes(), TTL_INFINITE).unwrap();
        }

        assert!(list.contains(b"World"));
        assert!(!list.contains(b"Python"));
        assert_eq!(list.index_of(b"shared memory"), 2);
        assert_eq!(list.index_of(b"World"), 1);
        assert_eq!(list.last_index_of(b"World"), 3);
        assert_eq!(list.index_of(b"missing"), -1);
    }

    #[test]
    fn test_sequential_access_cache() {
        let dir = tempdir().unwrap();
        let mut list = new_list(&dir, "cache.shm");
        for i in 0..100u32 {
            list.add(&i.to_le_bytes(), TTL_INFINITE).unwrap();
        }
        // Forward then backward walks go through the ±1 cache paths.
        for i in 0..100u32 {
            assert_eq!(list.get(i as usize).unwrap(), i.to_le_bytes());
        }
        for i in (0..100u32).rev() {
            assert_eq!(list.get(i as usize).unwrap(), i.to_le_bytes());
        }
    }

    #[test]
    fn test_ttl_zero_is_invisible() {
        let dir = tempdir().unwrap();
        let mut list = new_list(&dir, "ttl0.shm");
        list.add(b"gone", 0).unwrap();
        assert_eq!(list.size(), 0);
        assert_eq!(list.get(0), None);
        assert!(!list.contains(b"gone"));
    }

    #[test]
    fn test_ttl_expiry_and_sweep() {
        let dir = tempdir().unwrap();
        let mut list = new_list(&dir, "ttl.shm");
        list.add(b"ephemeral", 1).unwrap();
        assert_eq!(list.size(), 1);

        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(list.size(), 0);
        assert_eq!(list.remove_expired(), 1);
        assert_eq!(list.remove_expired(), 0);
    }

    #[test]
    fn test_get_ttl_and_set_ttl() {
        let dir = tempdir().unwrap();
        let mut list = new_list(&dir, "gttl.shm");
        list.add(b"forever", TTL_INFINITE).unwrap();
        list.add(b"brief", 60).unwrap();

        assert_eq!(list.get_ttl(0), -1);
        let remaining = list.get_ttl(1);
        assert!(remaining > 50 && remaining <= 60);
        assert_eq!(list.get_ttl(9), 0);

        assert!(list.set_ttl(1, TTL_INFINITE));
        assert_eq!(list.get_ttl(1), -1);
    }

    #[test]
    fn test_clear_and_reuse() {
        let dir = tempdir().unwrap();
        let mut list = new_list(&dir, "clear.shm");
        for i in 0..10u32 {
            list.add(&i.to_le_bytes(), TTL_INFINITE).unwrap();
        }
        list.clear();
        assert!(list.is_empty());

        list.add(b"again", TTL_INFINITE).unwrap();
        assert_eq!(list.size(), 1);
        assert_eq!(list.get(0).unwrap(), b"again");
    }

    #[test]
    fn test_for_each_early_stop() {
        let dir = tempdir().unwrap();
        let mut list = new_list(&dir, "fe.shm");
        for i in 0..10u32 {
            list.add(&i.to_le_bytes(), TTL_INFINITE).unwrap();
        }

        let mut seen = 0;
        list.for_each(|_, _| {
            seen += 1;
            seen < 4
        });
        assert_eq!(seen, 4);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.shm");
        {
            let mut list = ShmList::open_or_create(&path, MB, true).unwrap();
            list.add(b"survivor", TTL_INFINITE).unwrap();
            list.flush().unwrap();
        }
        let list = ShmList::open(&path).unwrap();
        assert_eq!(list.size(), 1);
        assert_eq!(list.get(0).unwrap(), b"survivor");
    }
}
