//! Unbounded FIFO queue (deque) backed by a mapped file.
//!
//! A doubly-linked chain between the header's front and back offsets,
//! every operation exclusive under the header's process-shared rwlock.
//!
//! The central algorithm is the front-skip protocol: before the front is
//! reported or returned, any expired prefix is unlinked under the lock,
//! each node's bytes returned to the heap and the raw size decremented.
//! The mirror-image protocol runs from the back for `poll_last` /
//! `peek_last`. That keeps `peek` and the visible count consistent without
//! ever scanning the whole chain.
//!
//! Blocking (`take`, `poll_timeout`) is a sleep-and-retry loop with a
//! millisecond backoff. There is no cross-process wake-up: producers have
//! no notification obligation, and cancellation is deadline expiry.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use tracing::trace;

use crate::error::{Error, Result};
use crate::shm::entry::{bytes_equal, fnv1a_hash, DequeHeader, Node, NULL_OFFSET};
use crate::shm::mapping::{region_kind, MappedFile, DEFAULT_INITIAL_SIZE};
use crate::stats::CollectionStats;

const HEADER_REGION: &str = "queue_header";

/// Backoff between retries of a blocking poll.
const POLL_BACKOFF: Duration = Duration::from_millis(1);

/// A persistent, shared-memory-backed FIFO queue with per-entry TTL.
pub struct ShmQueue {
    file: MappedFile,
    header_offset: u64,
    stats: CachePadded<CollectionStats>,
}

impl ShmQueue {
    /// Open `path`, creating it with default sizing if absent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_or_create(path, DEFAULT_INITIAL_SIZE, false)
    }

    /// Open or create the queue file. With `create_new`, any existing file
    /// is replaced.
    pub fn open_or_create<P: AsRef<Path>>(
        path: P,
        initial_size: usize,
        create_new: bool,
    ) -> Result<Self> {
        let file = MappedFile::open_or_create(path, initial_size, create_new)?;
        let (header_offset, _created) = file.find_or_create_region(
            HEADER_REGION,
            region_kind::DEQUE_HEADER,
            std::mem::size_of::<DequeHeader>(),
            |ptr| unsafe { DequeHeader::init(ptr as *mut DequeHeader) },
        )?;

        let queue = ShmQueue {
            file,
            header_offset,
            stats: CachePadded::new(CollectionStats::default()),
        };
        if !queue.header().common.is_valid() {
            return Err(Error::InternalError(format!(
                "invalid queue header in {}",
                queue.file.path().display()
            )));
        }
        queue
            .stats
            .set_size(queue.header().common.size.load(Ordering::Relaxed));
        Ok(queue)
    }

    fn header(&self) -> &DequeHeader {
        unsafe { &*(self.file.ptr_at(self.header_offset) as *const DequeHeader) }
    }

    fn node_ptr(&self, offset: i64) -> *mut Node {
        debug_assert!(offset >= 0);
        self.file.ptr_at(offset as u64) as *mut Node
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

    /// Unlink the expired prefix, returning each node's storage to the
    /// heap. Lock must be held.
    fn skip_expired_front(&self) {
        loop {
            let header = self.header();
            let front = header.front_offset.load(Ordering::Acquire);
            if front < 0 {
                return;
            }
            let node = self.node_ptr(front);
            if !unsafe { (*node).entry.is_expired() } {
                return;
            }

            let next = unsafe { (*node).next_offset.load(Ordering::Acquire) };
            header.front_offset.store(next, Ordering::Release);
            if next >= 0 {
                unsafe {
                    (*self.node_ptr(next))
                        .prev_offset
                        .store(NULL_OFFSET, Ordering::Release)
                };
            } else {
                header.back_offset.store(NULL_OFFSET, Ordering::Release);
            }

            self.free_node(front);
            header.common.size.fetch_sub(1, Ordering::AcqRel);
            self.stats.sub_size(1);
        }
    }

    /// Inverse of [`ShmQueue::skip_expired_front`]: unlink the expired
    /// suffix. Lock must be held.
    fn skip_expired_back(&self) {
        loop {
            let header = self.header();
            let back = header.back_offset.load(Ordering::Acquire);
            if back < 0 {
                return;
            }
            let node = self.node_ptr(back);
            if !unsafe { (*node).entry.is_expired() } {
                return;
            }

            let prev = unsafe { (*node).prev_offset.load(Ordering::Acquire) };
            header.back_offset.store(prev, Ordering::Release);
            if prev >= 0 {
                unsafe {
                    (*self.node_ptr(prev))
                        .next_offset
                        .store(NULL_OFFSET, Ordering::Release)
                };
            } else {
                header.front_offset.store(NULL_OFFSET, Ordering::Release);
            }

            self.free_node(back);
            header.common.size.fetch_sub(1, Ordering::AcqRel);
            self.stats.sub_size(1);
        }
    }

    /// Pop the front node. Expired-prefix skipping must already have run.
    /// Lock must be held.
    fn pop_front_locked(&self) -> Option<Vec<u8>> {
        let header = self.header();
        let front = header.front_offset.load(Ordering::Acquire);
        if front < 0 {
            return None;
        }
        let node = self.node_ptr(front);
        if !unsafe { (*node).entry.is_alive() } {
            return None;
        }

        let data = unsafe { Node::read_payload(node) };
        let next = unsafe { (*node).next_offset.load(Ordering::Acquire) };
        header.front_offset.store(next, Ordering::Release);
        if next >= 0 {
            unsafe {
                (*self.node_ptr(next))
                    .prev_offset
                    .store(NULL_OFFSET, Ordering::Release)
            };
        } else {
            header.back_offset.store(NULL_OFFSET, Ordering::Release);
        }

        self.free_node(front);
        header.common.size.fetch_sub(1, Ordering::AcqRel);
        header.common.touch();
        self.stats.sub_size(1);
        Some(data)
    }

    /// Append to the back of the queue. Rejects empty payloads.
    pub fn offer(&mut self, data: &[u8], ttl_seconds: i64) -> Result<bool> {
        if data.is_empty() {
            return Ok(false);
        }
        let header = self.header();
        let _guard = header.common.lock.write();

        let node_offset = self.allocate_node(data, ttl_seconds)?;
        let header = self.header();
        let back = header.back_offset.load(Ordering::Acquire);
        unsafe {
            let node = self.node_ptr(node_offset);
            (*node).prev_offset.store(back, Ordering::Release);
            (*node).next_offset.store(NULL_OFFSET, Ordering::Release);
            if back >= 0 {
                (*self.node_ptr(back))
                    .next_offset
                    .store(node_offset, Ordering::Release);
            } else {
                header.front_offset.store(node_offset, Ordering::Release);
            }
            header.back_offset.store(node_offset, Ordering::Release);
        }
        header.common.size.fetch_add(1, Ordering::AcqRel);
        header.common.touch();
        self.stats.add_size(1);
        self.stats.record_write();
        Ok(true)
    }

    /// Alias of [`ShmQueue::offer`].
    pub fn add(&mut self, data: &[u8], ttl_seconds: i64) -> Result<bool> {
        self.offer(data, ttl_seconds)
    }

    /// Alias of [`ShmQueue::offer`]; the queue is unbounded so a put never
    /// blocks.
    pub fn put(&mut self, data: &[u8], ttl_seconds: i64) -> Result<bool> {
        self.offer(data, ttl_seconds)
    }

    /// Alias of [`ShmQueue::offer`]; the queue is unbounded so the timeout
    /// never applies.
    pub fn offer_timeout(
        &mut self,
        data: &[u8],
        ttl_seconds: i64,
        _timeout: Duration,
    ) -> Result<bool> {
        self.offer(data, ttl_seconds)
    }

    /// Prepend to the front of the queue.
    pub fn offer_first(&mut self, data: &[u8], ttl_seconds: i64) -> Result<bool> {
        if data.is_empty() {
            return Ok(false);
        }
        let header = self.header();
        let _guard = header.common.lock.write();

        let node_offset = self.allocate_node(data, ttl_seconds)?;
        let header = self.header();
        let front = header.front_offset.load(Ordering::Acquire);
        unsafe {
            let node = self.node_ptr(node_offset);
            (*node).next_offset.store(front, Ordering::Release);
            (*node).prev_offset.store(NULL_OFFSET, Ordering::Release);
            if front >= 0 {
                (*self.node_ptr(front))
                    .prev_offset
                    .store(node_offset, Ordering::Release);
            } else {
                header.back_offset.store(node_offset, Ordering::Release);
            }
            header.front_offset.store(node_offset, Ordering::Release);
        }
        header.common.size.fetch_add(1, Ordering::AcqRel);
        header.common.touch();
        self.stats.add_size(1);
        self.stats.record_write();
        Ok(true)
    }

    /// Alias of [`ShmQueue::offer`].
    pub fn offer_last(&mut self, data: &[u8], ttl_seconds: i64) -> Result<bool> {
        self.offer(data, ttl_seconds)
    }

    /// Remove and return the front element, or `None` when the queue has
    /// no alive element.
    pub fn poll(&mut self) -> Option<Vec<u8>> {
        let header = self.header();
        let _guard = header.common.lock.write();

        self.skip_expired_front();
        match self.pop_front_locked() {
            Some(data) => {
                self.stats.record_hit();
                Some(data)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// As [`ShmQueue::poll`] but an empty queue is an error.
    pub fn remove(&mut self) -> Result<Vec<u8>> {
        self.poll().ok_or(Error::NotFound)
    }

    /// Remove and return the back element.
    pub fn poll_last(&mut self) -> Option<Vec<u8>> {
        let header = self.header();
        let _guard = header.common.lock.write();

        self.skip_expired_back();
        let header = self.header();
        let back = header.back_offset.load(Ordering::Acquire);
        if back < 0 {
            self.stats.record_miss();
            return None;
        }
        let node = self.node_ptr(back);
        if !unsafe { (*node).entry.is_alive() } {
            self.stats.record_miss();
            return None;
        }

        let data = unsafe { Node::read_payload(node) };
        let prev = unsafe { (*node).prev_offset.load(Ordering::Acquire) };
        header.back_offset.store(prev, Ordering::Release);
        if prev >= 0 {
            unsafe {
                (*self.node_ptr(prev))
                    .next_offset
                    .store(NULL_OFFSET, Ordering::Release)
            };
        } else {
            header.front_offset.store(NULL_OFFSET, Ordering::Release);
        }

        self.free_node(back);
        header.common.size.fetch_sub(1, Ordering::AcqRel);
        header.common.touch();
        self.stats.sub_size(1);
        self.stats.record_hit();
        Some(data)
    }

    /// Copy the front element without removing it.
    pub fn peek(&self) -> Option<Vec<u8>> {
        let header = self.header();
        let _guard = header.common.lock.write();

        self.skip_expired_front();
        let front = self.header().front_offset.load(Ordering::Acquire);
        if front < 0 {
            self.stats.record_miss();
            return None;
        }
        let node = self.node_ptr(front);
        if !unsafe { (*node).entry.is_alive() } {
            self.stats.record_miss();
            return None;
        }
        self.stats.record_hit();
        Some(unsafe { Node::read_payload(node) })
    }

    /// As [`ShmQueue::peek`] but an empty queue is an error.
    pub fn element(&self) -> Result<Vec<u8>> {
        self.peek().ok_or(Error::NotFound)
    }

    /// Copy the back element without removing it.
    pub fn peek_last(&self) -> Option<Vec<u8>> {
        let header = self.header();
        let _guard = header.common.lock.write();

        self.skip_expired_back();
        let back = self.header().back_offset.load(Ordering::Acquire);
        if back < 0 {
            self.stats.record_miss();
            return None;
        }
        let node = self.node_ptr(back);
        if !unsafe { (*node).entry.is_alive() } {
            self.stats.record_miss();
            return None;
        }
        self.stats.record_hit();
        Some(unsafe { Node::read_payload(node) })
    }

    /// Remaining TTL of the first alive element: `-1` infinite, `0` when
    /// the queue is empty.
    pub fn peek_ttl(&self) -> i64 {
        let header = self.header();
        let _guard = header.common.lock.write();

        let mut cur = self.header().front_offset.load(Ordering::Acquire);
        while cur >= 0 {
            let node = self.node_ptr(cur);
            unsafe {
                if (*node).entry.is_alive() {
                    return (*node).entry.remaining_ttl_seconds();
                }
                cur = (*node).next_offset.load(Ordering::Acquire);
            }
        }
        0
    }

    /// Block until an element is available. Retries with a 1 ms backoff;
    /// there is no cross-process wake-up to wait on.
    pub fn take(&mut self) -> Vec<u8> {
        loop {
            if let Some(data) = self.poll() {
                return data;
            }
            std::thread::sleep(POLL_BACKOFF);
        }
    }

    /// As [`ShmQueue::take`] with a deadline; `None` on timeout.
    pub fn poll_timeout(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(data) = self.poll() {
                return Some(data);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(POLL_BACKOFF);
        }
    }

    /// Whether any alive element carries exactly `data`.
    pub fn contains(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let target_hash = fnv1a_hash(data);
        let header = self.header();
        let _guard = header.common.lock.write();

        let mut cur = self.header().front_offset.load(Ordering::Acquire);
        while cur >= 0 {
            let node = self.node_ptr(cur);
            unsafe {
                if (*node).entry.is_alive()
                    && (*node).entry.hash_code == target_hash
                    && bytes_equal(Node::payload(node), data)
                {
                    return true;
                }
                cur = (*node).next_offset.load(Ordering::Acquire);
            }
        }
        false
    }

    /// Remove the first alive occurrence of `data`.
    pub fn remove_element(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let target_hash = fnv1a_hash(data);
        let header = self.header();
        let _guard = header.common.lock.write();

        let mut cur = self.header().front_offset.load(Ordering::Acquire);
        while cur >= 0 {
            let node = self.node_ptr(cur);
            unsafe {
                if (*node).entry.is_alive()
                    && (*node).entry.hash_code == target_hash
                    && bytes_equal(Node::payload(node), data)
                {
                    self.unlink_inner(cur);
                    self.free_node(cur);
                    let header = self.header();
                    header.common.size.fetch_sub(1, Ordering::AcqRel);
                    header.common.touch();
                    self.stats.sub_size(1);
                    return true;
                }
                cur = (*node).next_offset.load(Ordering::Acquire);
            }
        }
        false
    }

    /// Detach a node anywhere in the chain. Lock must be held.
    fn unlink_inner(&self, offset: i64) {
        let header = self.header();
        unsafe {
            let node = self.node_ptr(offset);
            let prev = (*node).prev_offset.load(Ordering::Acquire);
            let next = (*node).next_offset.load(Ordering::Acquire);
            if prev >= 0 {
                (*self.node_ptr(prev)).next_offset.store(next, Ordering::Release);
            } else {
                header.front_offset.store(next, Ordering::Release);
            }
            if next >= 0 {
                (*self.node_ptr(next)).prev_offset.store(prev, Ordering::Release);
            } else {
                header.back_offset.store(prev, Ordering::Release);
            }
        }
    }

    /// Unlink and free every expired element; returns how many were swept.
    pub fn remove_expired(&mut self) -> usize {
        let header = self.header();
        let _guard = header.common.lock.write();

        let mut removed = 0;
        let mut cur = self.header().front_offset.load(Ordering::Acquire);
        while cur >= 0 {
            let node = self.node_ptr(cur);
            let next = unsafe { (*node).next_offset.load(Ordering::Acquire) };
            if unsafe { (*node).entry.is_expired() } {
                self.unlink_inner(cur);
                self.free_node(cur);
                self.header().common.size.fetch_sub(1, Ordering::AcqRel);
                self.stats.sub_size(1);
                removed += 1;
            }
            cur = next;
        }
        if removed > 0 {
            self.header().common.touch();
            trace!(removed, "swept expired queue nodes");
        }
        removed
    }

    /// Pop alive elements front-first into `callback`, stopping when the
    /// queue is empty or `max_elements` have been delivered (`0` means
    /// unbounded). Returns how many were drained.
    pub fn drain_to<F: FnMut(Vec<u8>)>(&mut self, mut callback: F, max_elements: usize) -> usize {
        let header = self.header();
        let _guard = header.common.lock.write();

        let limit = if max_elements == 0 {
            usize::MAX
        } else {
            max_elements
        };
        let mut drained = 0;
        while drained < limit {
            self.skip_expired_front();
            let Some(data) = self.pop_front_locked() else {
                break;
            };
            callback(data);
            drained += 1;
        }
        if drained > 0 {
            self.stats.read_count.fetch_add(drained as u64, Ordering::Relaxed);
        }
        drained
    }

    /// Remove every element, expired or not.
    pub fn clear(&mut self) {
        let header = self.header();
        let _guard = header.common.lock.write();

        let mut cur = self.header().front_offset.load(Ordering::Acquire);
        while cur >= 0 {
            let node = self.node_ptr(cur);
            let next = unsafe { (*node).next_offset.load(Ordering::Acquire) };
            self.free_node(cur);
            cur = next;
        }

        let header = self.header();
        header.front_offset.store(NULL_OFFSET, Ordering::Release);
        header.back_offset.store(NULL_OFFSET, Ordering::Release);
        header.common.size.store(0, Ordering::Release);
        header.common.touch();
        self.stats.set_size(0);
    }

    /// Count of alive elements, recomputed by traversal.
    pub fn size(&self) -> usize {
        let header = self.header();
        let _guard = header.common.lock.write();

        let mut alive = 0;
        let mut cur = self.header().front_offset.load(Ordering::Acquire);
        while cur >= 0 {
            let node = self.node_ptr(cur);
            unsafe {
                if (*node).entry.is_alive() {
                    alive += 1;
                }
                cur = (*node).next_offset.load(Ordering::Acquire);
            }
        }
        alive
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Visit alive payloads front→back; the callback returns `false` to
    /// stop.
    pub fn for_each<F: FnMut(&[u8]) -> bool>(&self, mut callback: F) {
        let header = self.header();
        let _guard = header.common.lock.write();

        let mut cur = self.header().front_offset.load(Ordering::Acquire);
        while cur >= 0 {
            let node = self.node_ptr(cur);
            unsafe {
                if (*node).entry.is_alive() && !callback(Node::payload(node)) {
                    break;
                }
                cur = (*node).next_offset.load(Ordering::Acquire);
            }
        }
    }

    /// As [`ShmQueue::for_each`], also passing the remaining TTL.
    pub fn for_each_with_ttl<F: FnMut(&[u8], i64) -> bool>(&self, mut callback: F) {
        let header = self.header();
        let _guard = header.common.lock.write();

        let mut cur = self.header().front_offset.load(Ordering::Acquire);
        while cur >= 0 {
            let node = self.node_ptr(cur);
            unsafe {
                if (*node).entry.is_alive() {
                    let ttl = (*node).entry.remaining_ttl_seconds();
                    if !callback(Node::payload(node), ttl) {
                        break;
                    }
                }
                cur = (*node).next_offset.load(Ordering::Acquire);
            }
        }
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

    fn new_queue(dir: &tempfile::TempDir, name: &str) -> ShmQueue {
        ShmQueue::open_or_create(dir.path().join(name), MB, true).unwrap()
    }

    #[test]
    fn test_fifo_order() {
        let dir = tempdir().unwrap();
        let mut queue = new_queue(&dir, "fifo.shm");

        queue.offer(b"t1", TTL_INFINITE).unwrap();
        queue.offer(b"t2", TTL_INFINITE).unwrap();
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.poll().unwrap(), b"t1");
        assert_eq!(queue.poll().unwrap(), b"t2");
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn test_offer_first_jumps_queue() {
        let dir = tempdir().unwrap();
        let mut queue = new_queue(&dir, "prio.shm");

        queue.offer(b"t1", TTL_INFINITE).unwrap();
        queue.offer(b"t2", TTL_INFINITE).unwrap();
        queue.offer_first(b"t3", TTL_INFINITE).unwrap();

        assert_eq!(queue.poll().unwrap(), b"t3");
        assert_eq!(queue.poll().unwrap(), b"t1");
    }

    #[test]
    fn test_peek_does_not_consume() {
        let dir = tempdir().unwrap();
        let mut queue = new_queue(&dir, "peek.shm");
        queue.offer(b"head", TTL_INFINITE).unwrap();
        queue.offer(b"tail", TTL_INFINITE).unwrap();

        assert_eq!(queue.peek().unwrap(), b"head");
        assert_eq!(queue.peek().unwrap(), b"head");
        assert_eq!(queue.peek_last().unwrap(), b"tail");
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn test_remove_and_element_error_on_empty() {
        let dir = tempdir().unwrap();
        let mut queue = new_queue(&dir, "err.shm");

        assert!(matches!(queue.remove(), Err(Error::NotFound)));
        assert!(matches!(queue.element(), Err(Error::NotFound)));

        queue.offer(b"x", TTL_INFINITE).unwrap();
        assert_eq!(queue.element().unwrap(), b"x");
        assert_eq!(queue.remove().unwrap(), b"x");
    }

    #[test]
    fn test_poll_last() {
        let dir = tempdir().unwrap();
        let mut queue = new_queue(&dir, "deque.shm");
        queue.offer(b"a", TTL_INFINITE).unwrap();
        queue.offer(b"b", TTL_INFINITE).unwrap();

        assert_eq!(queue.poll_last().unwrap(), b"b");
        assert_eq!(queue.poll_last().unwrap(), b"a");
        assert_eq!(queue.poll_last(), None);
    }

    #[test]
    fn test_front_skip_frees_expired_prefix() {
        let dir = tempdir().unwrap();
        let mut queue = new_queue(&dir, "skip.shm");
        queue.offer(b"dead1", 0).unwrap();
        queue.offer(b"dead2", 0).unwrap();
        queue.offer(b"alive", TTL_INFINITE).unwrap();

        // The expired prefix is skipped, not returned.
        assert_eq!(queue.peek().unwrap(), b"alive");
        assert_eq!(queue.poll().unwrap(), b"alive");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_back_skip() {
        let dir = tempdir().unwrap();
        let mut queue = new_queue(&dir, "backskip.shm");
        queue.offer(b"alive", TTL_INFINITE).unwrap();
        queue.offer(b"dead", 0).unwrap();

        assert_eq!(queue.peek_last().unwrap(), b"alive");
        assert_eq!(queue.poll_last().unwrap(), b"alive");
        assert_eq!(queue.poll_last(), None);
    }

    #[test]
    fn test_poll_timeout_expires() {
        let dir = tempdir().unwrap();
        let mut queue = new_queue(&dir, "timeout.shm");

        let started = Instant::now();
        let result = queue.poll_timeout(Duration::from_millis(30));
        assert_eq!(result, None);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_poll_timeout_returns_value() {
        let dir = tempdir().unwrap();
        let mut queue = new_queue(&dir, "timely.shm");
        queue.offer(b"ready", TTL_INFINITE).unwrap();
        assert_eq!(
            queue.poll_timeout(Duration::from_millis(100)).unwrap(),
            b"ready"
        );
    }

    #[test]
    fn test_peek_ttl() {
        let dir = tempdir().unwrap();
        let mut queue = new_queue(&dir, "pttl.shm");
        assert_eq!(queue.peek_ttl(), 0);

        queue.offer(b"x", 90).unwrap();
        let remaining = queue.peek_ttl();
        assert!(remaining > 80 && remaining <= 90);

        queue.clear();
        queue.offer(b"y", TTL_INFINITE).unwrap();
        assert_eq!(queue.peek_ttl(), -1);
    }

    #[test]
    fn test_contains_and_remove_element() {
        let dir = tempdir().unwrap();
        let mut queue = new_queue(&dir, "search.shm");
        queue.offer(b"a", TTL_INFINITE).unwrap();
        queue.offer(b"b", TTL_INFINITE).unwrap();
        queue.offer(b"c", TTL_INFINITE).unwrap();

        assert!(queue.contains(b"b"));
        assert!(queue.remove_element(b"b"));
        assert!(!queue.contains(b"b"));
        // FIFO order of the remainder is preserved.
        assert_eq!(queue.poll().unwrap(), b"a");
        assert_eq!(queue.poll().unwrap(), b"c");
    }

    #[test]
    fn test_drain_to() {
        let dir = tempdir().unwrap();
        let mut queue = new_queue(&dir, "drain.shm");
        for i in 0..10u32 {
            queue.offer(&i.to_le_bytes(), TTL_INFINITE).unwrap();
        }

        let mut drained = Vec::new();
        let n = queue.drain_to(|data| drained.push(data), 4);
        assert_eq!(n, 4);
        assert_eq!(drained[0], 0u32.to_le_bytes());
        assert_eq!(drained[3], 3u32.to_le_bytes());
        assert_eq!(queue.size(), 6);

        // max == 0 drains everything.
        let n = queue.drain_to(|_| {}, 0);
        assert_eq!(n, 6);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_expired() {
        let dir = tempdir().unwrap();
        let mut queue = new_queue(&dir, "sweep.shm");
        queue.offer(b"keep", TTL_INFINITE).unwrap();
        queue.offer(b"drop", 1).unwrap();
        queue.offer(b"keep2", TTL_INFINITE).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(queue.remove_expired(), 1);
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.poll().unwrap(), b"keep");
        assert_eq!(queue.poll().unwrap(), b"keep2");
    }

    #[test]
    fn test_clear() {
        let dir = tempdir().unwrap();
        let mut queue = new_queue(&dir, "clear.shm");
        for i in 0..10u32 {
            queue.offer(&i.to_le_bytes(), TTL_INFINITE).unwrap();
        }
        queue.clear();
        assert!(queue.is_empty());
        queue.offer(b"fresh", TTL_INFINITE).unwrap();
        assert_eq!(queue.poll().unwrap(), b"fresh");
    }

    #[test]
    fn test_for_each_order() {
        let dir = tempdir().unwrap();
        let mut queue = new_queue(&dir, "iter.shm");
        queue.offer(b"1", TTL_INFINITE).unwrap();
        queue.offer(b"2", TTL_INFINITE).unwrap();
        queue.offer(b"3", TTL_INFINITE).unwrap();

        let mut seen = Vec::new();
        queue.for_each(|data| {
            seen.push(data.to_vec());
            true
        });
        assert_eq!(seen, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.shm");
        {
            let mut queue = ShmQueue::open_or_create(&path, MB, true).unwrap();
            queue.offer(b"job", TTL_INFINITE).unwrap();
            queue.flush().unwrap();
        }
        let mut queue = ShmQueue::open(&path).unwrap();
        assert_eq!(queue.poll().unwrap(), b"job");
    }
}
