//! LIFO stack backed by a mapped file, with lock-free push and pop.
//!
//! The chain hangs off the header's `front_offset`, but the stack packs
//! that word: bits 0..48 hold the top node's offset, bits 48..63 a
//! generation tag bumped by every successful top mutation. The empty stack
//! is still `-1`, so the front-null-means-empty invariant shared with the
//! queue header survives. The tag is what defeats ABA: if the heap
//! recycles the exact offset for a new node between a pop's load and its
//! CAS, the tag no longer matches and the CAS fails.
//!
//! Push and pop are CAS loops and take no lock. Middle-of-chain surgery
//! (`remove_element`, `remove_expired`, `clear`) runs under the header's
//! rwlock and still CASes when it touches the top, since lock-free pushers
//! don't honour the lock.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use tracing::trace;

use crate::error::{Error, Result};
use crate::shm::entry::{bytes_equal, fnv1a_hash, DequeHeader, Node, NULL_OFFSET};
use crate::shm::mapping::{region_kind, MappedFile, DEFAULT_INITIAL_SIZE};
use crate::stats::CollectionStats;

const HEADER_REGION: &str = "stack_header";
const ABA_REGION: &str = "stack_aba_tag";

const TOP_OFFSET_BITS: u32 = 48;
const TOP_OFFSET_MASK: i64 = (1i64 << TOP_OFFSET_BITS) - 1;
/// 15 tag bits; bit 63 stays clear so packed words are non-negative.
const TOP_TAG_MASK: i64 = 0x7FFF;

fn pack_top(offset: i64, tag: i64) -> i64 {
    debug_assert!((0..=TOP_OFFSET_MASK).contains(&offset));
    ((tag & TOP_TAG_MASK) << TOP_OFFSET_BITS) | offset
}

/// Offset half of a packed top word; `-1` stays `-1`.
fn top_offset(word: i64) -> i64 {
    if word < 0 {
        NULL_OFFSET
    } else {
        word & TOP_OFFSET_MASK
    }
}

fn top_tag(word: i64) -> i64 {
    if word < 0 {
        0
    } else {
        (word >> TOP_OFFSET_BITS) & TOP_TAG_MASK
    }
}

/// Successor word installing `new_offset` with a bumped tag.
fn next_top(current_word: i64, new_offset: i64) -> i64 {
    if new_offset < 0 {
        NULL_OFFSET
    } else {
        pack_top(new_offset, top_tag(current_word) + 1)
    }
}

/// A persistent, shared-memory-backed LIFO stack with per-entry TTL.
pub struct ShmStack {
    file: MappedFile,
    header_offset: u64,
    aba_offset: u64,
    stats: CachePadded<CollectionStats>,
}

impl ShmStack {
    /// Open `path`, creating it with default sizing if absent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_or_create(path, DEFAULT_INITIAL_SIZE, false)
    }

    /// Open or create the stack file. With `create_new`, any existing file
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
        let (aba_offset, _created) = file.find_or_create_region(
            ABA_REGION,
            region_kind::COUNTER,
            std::mem::size_of::<AtomicU64>(),
            |_| Ok(()),
        )?;

        let stack = ShmStack {
            file,
            header_offset,
            aba_offset,
            stats: CachePadded::new(CollectionStats::default()),
        };
        if !stack.header().common.is_valid() {
            return Err(Error::InternalError(format!(
                "invalid stack header in {}",
                stack.file.path().display()
            )));
        }
        stack
            .stats
            .set_size(stack.header().common.size.load(Ordering::Relaxed));
        Ok(stack)
    }

    fn header(&self) -> &DequeHeader {
        unsafe { &*(self.file.ptr_at(self.header_offset) as *const DequeHeader) }
    }

    /// Monotonic modification counter, bumped on every successful top
    /// mutation.
    fn aba_tag(&self) -> &AtomicU64 {
        unsafe { &*(self.file.ptr_at(self.aba_offset) as *const AtomicU64) }
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

    /// Guard for unsynchronized reads: a concurrently freed node may show
    /// a torn `data_size`; refuse to build a slice past the mapping.
    fn payload_in_bounds(&self, offset: i64, node: *const Node) -> bool {
        let size = unsafe { (*node).entry.data_size } as u64;
        offset as u64 + std::mem::size_of::<Node>() as u64 + size <= self.file.size()
    }

    /// Push on top of the stack. Lock-free.
    pub fn push(&mut self, data: &[u8], ttl_seconds: i64) -> Result<bool> {
        if data.is_empty() {
            return Ok(false);
        }
        let node_offset = self.allocate_node(data, ttl_seconds)?;
        let header = self.header();

        loop {
            let current = header.front_offset.load(Ordering::Acquire);
            let current_offset = top_offset(current);
            unsafe {
                let node = self.node_ptr(node_offset);
                (*node).next_offset.store(current_offset, Ordering::Release);
                (*node).prev_offset.store(NULL_OFFSET, Ordering::Release);
            }

            let new_word = pack_top(node_offset, top_tag(current) + 1);
            if header
                .front_offset
                .compare_exchange_weak(current, new_word, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if current_offset >= 0 {
                    // Best-effort back link; only iteration uses it.
                    unsafe {
                        (*self.node_ptr(current_offset))
                            .prev_offset
                            .store(node_offset, Ordering::Release);
                    }
                }
                self.aba_tag().fetch_add(1, Ordering::Relaxed);
                header.common.size.fetch_add(1, Ordering::AcqRel);
                header.common.touch();
                self.stats.add_size(1);
                self.stats.record_write();
                return Ok(true);
            }
        }
    }

    /// Pop the top alive element. Expired nodes at the top are unlinked
    /// and reclaimed on the way. Lock-free.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        let header = self.header();

        loop {
            let current = header.front_offset.load(Ordering::Acquire);
            let current_offset = top_offset(current);
            if current_offset < 0 {
                self.stats.record_miss();
                return None;
            }

            let node = self.node_ptr(current_offset);
            if !self.payload_in_bounds(current_offset, node) {
                // Torn read of a recycled node; the top has moved on.
                continue;
            }

            if unsafe { (*node).entry.is_expired() } {
                let next = unsafe { (*node).next_offset.load(Ordering::Acquire) };
                if header
                    .front_offset
                    .compare_exchange_weak(
                        current,
                        next_top(current, next),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    if next >= 0 {
                        unsafe {
                            (*self.node_ptr(next))
                                .prev_offset
                                .store(NULL_OFFSET, Ordering::Release);
                        }
                    }
                    self.free_node(current_offset);
                    self.aba_tag().fetch_add(1, Ordering::Relaxed);
                    header.common.size.fetch_sub(1, Ordering::AcqRel);
                    self.stats.sub_size(1);
                }
                continue;
            }

            // Copy the payload before the CAS: a concurrent pop may free
            // this node, in which case our CAS fails and the copy is
            // discarded.
            let data = unsafe { Node::read_payload(node) };
            let next = unsafe { (*node).next_offset.load(Ordering::Acquire) };

            if header
                .front_offset
                .compare_exchange_weak(
                    current,
                    next_top(current, next),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                if next >= 0 {
                    unsafe {
                        (*self.node_ptr(next))
                            .prev_offset
                            .store(NULL_OFFSET, Ordering::Release);
                    }
                }
                self.free_node(current_offset);
                self.aba_tag().fetch_add(1, Ordering::Relaxed);
                header.common.size.fetch_sub(1, Ordering::AcqRel);
                header.common.touch();
                self.stats.sub_size(1);
                self.stats.record_hit();
                return Some(data);
            }
        }
    }

    /// As [`ShmStack::pop`] but an empty stack is an error.
    pub fn pop_or_err(&mut self) -> Result<Vec<u8>> {
        self.pop().ok_or(Error::NotFound)
    }

    /// Copy the top alive element without removing it, walking past any
    /// expired prefix. Lock-free, mutates nothing.
    pub fn peek(&self) -> Option<Vec<u8>> {
        let header = self.header();
        let mut cur = top_offset(header.front_offset.load(Ordering::Acquire));
        while cur >= 0 {
            let node = self.node_ptr(cur);
            if unsafe { (*node).entry.is_alive() } && self.payload_in_bounds(cur, node) {
                self.stats.record_hit();
                return Some(unsafe { Node::read_payload(node) });
            }
            cur = unsafe { (*node).next_offset.load(Ordering::Acquire) };
        }
        self.stats.record_miss();
        None
    }

    /// As [`ShmStack::peek`] but an empty stack is an error.
    pub fn peek_or_err(&self) -> Result<Vec<u8>> {
        self.peek().ok_or(Error::NotFound)
    }

    /// Remaining TTL of the top alive element: `-1` infinite, `0` when the
    /// stack is empty.
    pub fn peek_ttl(&self) -> i64 {
        let header = self.header();
        let mut cur = top_offset(header.front_offset.load(Ordering::Acquire));
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

    /// Push each element; returns how many were pushed.
    pub fn push_all(&mut self, elements: &[(&[u8], i64)]) -> Result<usize> {
        let mut pushed = 0;
        for (data, ttl) in elements {
            if self.push(data, *ttl)? {
                pushed += 1;
            }
        }
        Ok(pushed)
    }

    /// Pop up to `max_count` elements (`0` means until empty), top first.
    pub fn pop_all(&mut self, max_count: usize) -> Vec<Vec<u8>> {
        let limit = if max_count == 0 { usize::MAX } else { max_count };
        let mut out = Vec::new();
        while out.len() < limit {
            match self.pop() {
                Some(data) => out.push(data),
                None => break,
            }
        }
        out
    }

    /// 1-based distance of `data` from the top, counting alive elements
    /// only; `-1` when absent. Lock-free.
    pub fn search(&self, data: &[u8]) -> i64 {
        if data.is_empty() {
            return -1;
        }
        let target_hash = fnv1a_hash(data);
        let header = self.header();

        let mut distance: i64 = 1;
        let mut cur = top_offset(header.front_offset.load(Ordering::Acquire));
        while cur >= 0 {
            let node = self.node_ptr(cur);
            unsafe {
                if (*node).entry.is_alive() {
                    if (*node).entry.hash_code == target_hash
                        && self.payload_in_bounds(cur, node)
                        && bytes_equal(Node::payload(node), data)
                    {
                        return distance;
                    }
                    distance += 1;
                }
                cur = (*node).next_offset.load(Ordering::Acquire);
            }
        }
        -1
    }

    /// Remove the first alive occurrence of `data`, anywhere in the chain.
    /// Takes the header lock; top removal still CASes against lock-free
    /// pushers.
    pub fn remove_element(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let target_hash = fnv1a_hash(data);
        let header = self.header();
        let _guard = header.common.lock.write();

        'restart: loop {
            let mut prev: i64 = NULL_OFFSET;
            let mut cur = top_offset(header.front_offset.load(Ordering::Acquire));
            while cur >= 0 {
                let node = self.node_ptr(cur);
                let next = unsafe { (*node).next_offset.load(Ordering::Acquire) };
                let matches = unsafe {
                    (*node).entry.is_alive()
                        && (*node).entry.hash_code == target_hash
                        && bytes_equal(Node::payload(node), data)
                };
                if matches {
                    if prev < 0 {
                        let word = header.front_offset.load(Ordering::Acquire);
                        if top_offset(word) != cur
                            || header
                                .front_offset
                                .compare_exchange(
                                    word,
                                    next_top(word, next),
                                    Ordering::AcqRel,
                                    Ordering::Relaxed,
                                )
                                .is_err()
                        {
                            // A concurrent push moved the top; rescan.
                            continue 'restart;
                        }
                    } else {
                        unsafe {
                            (*self.node_ptr(prev)).next_offset.store(next, Ordering::Release)
                        };
                    }
                    if next >= 0 {
                        unsafe {
                            (*self.node_ptr(next)).prev_offset.store(prev, Ordering::Release)
                        };
                    }
                    self.free_node(cur);
                    self.aba_tag().fetch_add(1, Ordering::Relaxed);
                    let header = self.header();
                    header.common.size.fetch_sub(1, Ordering::AcqRel);
                    header.common.touch();
                    self.stats.sub_size(1);
                    return true;
                }
                prev = cur;
                cur = next;
            }
            return false;
        }
    }

    /// Unlink and free every expired element; returns how many were swept.
    /// Takes the header lock.
    pub fn remove_expired(&mut self) -> usize {
        let header = self.header();
        let _guard = header.common.lock.write();

        let mut removed = 0;
        'restart: loop {
            let mut prev: i64 = NULL_OFFSET;
            let mut cur = top_offset(header.front_offset.load(Ordering::Acquire));
            while cur >= 0 {
                let node = self.node_ptr(cur);
                let next = unsafe { (*node).next_offset.load(Ordering::Acquire) };
                if unsafe { (*node).entry.is_expired() } {
                    if prev < 0 {
                        let word = header.front_offset.load(Ordering::Acquire);
                        if top_offset(word) != cur
                            || header
                                .front_offset
                                .compare_exchange(
                                    word,
                                    next_top(word, next),
                                    Ordering::AcqRel,
                                    Ordering::Relaxed,
                                )
                                .is_err()
                        {
                            continue 'restart;
                        }
                    } else {
                        unsafe {
                            (*self.node_ptr(prev)).next_offset.store(next, Ordering::Release)
                        };
                    }
                    if next >= 0 {
                        unsafe {
                            (*self.node_ptr(next)).prev_offset.store(prev, Ordering::Release)
                        };
                    }
                    self.free_node(cur);
                    self.header().common.size.fetch_sub(1, Ordering::AcqRel);
                    self.stats.sub_size(1);
                    removed += 1;
                } else {
                    prev = cur;
                }
                cur = next;
            }
            break;
        }

        if removed > 0 {
            self.aba_tag().fetch_add(1, Ordering::Relaxed);
            self.header().common.touch();
            trace!(removed, "swept expired stack nodes");
        }
        removed
    }

    /// Remove every element, expired or not. Takes the header lock; the
    /// whole chain is detached with one atomic swap so racing pops fail
    /// their CAS cleanly.
    pub fn clear(&mut self) {
        let header = self.header();
        let _guard = header.common.lock.write();

        let word = header.front_offset.swap(NULL_OFFSET, Ordering::AcqRel);
        let mut cur = top_offset(word);
        while cur >= 0 {
            let node = self.node_ptr(cur);
            let next = unsafe { (*node).next_offset.load(Ordering::Acquire) };
            self.free_node(cur);
            cur = next;
        }

        header.common.size.store(0, Ordering::Release);
        header.common.touch();
        self.aba_tag().fetch_add(1, Ordering::Relaxed);
        self.stats.set_size(0);
    }

    /// Count of alive elements, recomputed by traversal. Lock-free.
    pub fn size(&self) -> usize {
        let header = self.header();
        let mut alive = 0;
        let mut cur = top_offset(header.front_offset.load(Ordering::Acquire));
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

    /// Visit alive payloads top→bottom; the callback returns `false` to
    /// stop. Lock-free.
    pub fn for_each<F: FnMut(&[u8]) -> bool>(&self, mut callback: F) {
        let header = self.header();
        let mut cur = top_offset(header.front_offset.load(Ordering::Acquire));
        while cur >= 0 {
            let node = self.node_ptr(cur);
            unsafe {
                if (*node).entry.is_alive()
                    && self.payload_in_bounds(cur, node)
                    && !callback(Node::payload(node))
                {
                    break;
                }
                cur = (*node).next_offset.load(Ordering::Acquire);
            }
        }
    }

    /// As [`ShmStack::for_each`], also passing the remaining TTL.
    pub fn for_each_with_ttl<F: FnMut(&[u8], i64) -> bool>(&self, mut callback: F) {
        let header = self.header();
        let mut cur = top_offset(header.front_offset.load(Ordering::Acquire));
        while cur >= 0 {
            let node = self.node_ptr(cur);
            unsafe {
                if (*node).entry.is_alive() && self.payload_in_bounds(cur, node) {
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

    fn new_stack(dir: &tempfile::TempDir, name: &str) -> ShmStack {
        ShmStack::open_or_create(dir.path().join(name), MB, true).unwrap()
    }

    #[test]
    fn test_top_word_packing() {
        let word = pack_top(0x1234, 7);
        assert_eq!(top_offset(word), 0x1234);
        assert_eq!(top_tag(word), 7);
        assert!(word >= 0);

        assert_eq!(top_offset(NULL_OFFSET), NULL_OFFSET);
        assert_eq!(top_tag(NULL_OFFSET), 0);

        // The tag wraps inside its 15 bits without touching the offset.
        let wrapped = next_top(pack_top(64, TOP_TAG_MASK), 64);
        assert_eq!(top_offset(wrapped), 64);
        assert_eq!(top_tag(wrapped), 0);
    }

    #[test]
    fn test_lifo_order() {
        let dir = tempdir().unwrap();
        let mut stack = new_stack(&dir, "lifo.shm");

        stack.push(b"A", TTL_INFINITE).unwrap();
        stack.push(b"B", TTL_INFINITE).unwrap();
        stack.push(b"C", TTL_INFINITE).unwrap();

        assert_eq!(stack.size(), 3);
        assert_eq!(stack.pop().unwrap(), b"C");
        assert_eq!(stack.pop().unwrap(), b"B");
        assert_eq!(stack.pop().unwrap(), b"A");
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn test_search_distance_from_top() {
        let dir = tempdir().unwrap();
        let mut stack = new_stack(&dir, "search.shm");
        stack.push(b"A", TTL_INFINITE).unwrap();
        stack.push(b"B", TTL_INFINITE).unwrap();
        stack.push(b"C", TTL_INFINITE).unwrap();

        assert_eq!(stack.search(b"C"), 1);
        assert_eq!(stack.search(b"B"), 2);
        assert_eq!(stack.search(b"A"), 3);
        assert_eq!(stack.search(b"Z"), -1);
    }

    #[test]
    fn test_peek_skips_expired_top() {
        let dir = tempdir().unwrap();
        let mut stack = new_stack(&dir, "peek.shm");
        stack.push(b"bottom", TTL_INFINITE).unwrap();
        stack.push(b"gone", 0).unwrap();

        assert_eq!(stack.peek().unwrap(), b"bottom");
        assert_eq!(stack.size(), 1);
        // pop reclaims the expired top on its way down.
        assert_eq!(stack.pop().unwrap(), b"bottom");
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn test_pop_or_err() {
        let dir = tempdir().unwrap();
        let mut stack = new_stack(&dir, "err.shm");
        assert!(matches!(stack.pop_or_err(), Err(Error::NotFound)));
        assert!(matches!(stack.peek_or_err(), Err(Error::NotFound)));

        stack.push(b"x", TTL_INFINITE).unwrap();
        assert_eq!(stack.peek_or_err().unwrap(), b"x");
        assert_eq!(stack.pop_or_err().unwrap(), b"x");
    }

    #[test]
    fn test_push_all_pop_all() {
        let dir = tempdir().unwrap();
        let mut stack = new_stack(&dir, "bulk.shm");

        let pushed = stack
            .push_all(&[
                (b"a".as_slice(), TTL_INFINITE),
                (b"b".as_slice(), TTL_INFINITE),
                (b"c".as_slice(), TTL_INFINITE),
            ])
            .unwrap();
        assert_eq!(pushed, 3);

        let top_two = stack.pop_all(2);
        assert_eq!(top_two, vec![b"c".to_vec(), b"b".to_vec()]);

        let rest = stack.pop_all(0);
        assert_eq!(rest, vec![b"a".to_vec()]);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_remove_element_from_middle() {
        let dir = tempdir().unwrap();
        let mut stack = new_stack(&dir, "mid.shm");
        stack.push(b"A", TTL_INFINITE).unwrap();
        stack.push(b"B", TTL_INFINITE).unwrap();
        stack.push(b"C", TTL_INFINITE).unwrap();

        assert!(stack.remove_element(b"B"));
        assert!(!stack.remove_element(b"B"));
        assert_eq!(stack.pop().unwrap(), b"C");
        assert_eq!(stack.pop().unwrap(), b"A");
    }

    #[test]
    fn test_remove_element_at_top() {
        let dir = tempdir().unwrap();
        let mut stack = new_stack(&dir, "top.shm");
        stack.push(b"A", TTL_INFINITE).unwrap();
        stack.push(b"B", TTL_INFINITE).unwrap();

        assert!(stack.remove_element(b"B"));
        assert_eq!(stack.peek().unwrap(), b"A");
    }

    #[test]
    fn test_remove_expired() {
        let dir = tempdir().unwrap();
        let mut stack = new_stack(&dir, "sweep.shm");
        stack.push(b"keep", TTL_INFINITE).unwrap();
        stack.push(b"drop", 1).unwrap();
        stack.push(b"keep2", TTL_INFINITE).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(stack.remove_expired(), 1);
        assert_eq!(stack.size(), 2);
        assert_eq!(stack.pop().unwrap(), b"keep2");
        assert_eq!(stack.pop().unwrap(), b"keep");
    }

    #[test]
    fn test_peek_ttl() {
        let dir = tempdir().unwrap();
        let mut stack = new_stack(&dir, "pttl.shm");
        assert_eq!(stack.peek_ttl(), 0);

        stack.push(b"x", 45).unwrap();
        let remaining = stack.peek_ttl();
        assert!(remaining > 35 && remaining <= 45);

        stack.push(b"y", TTL_INFINITE).unwrap();
        assert_eq!(stack.peek_ttl(), -1);
    }

    #[test]
    fn test_clear() {
        let dir = tempdir().unwrap();
        let mut stack = new_stack(&dir, "clear.shm");
        for i in 0..10u32 {
            stack.push(&i.to_le_bytes(), TTL_INFINITE).unwrap();
        }
        stack.clear();
        assert!(stack.is_empty());
        stack.push(b"fresh", TTL_INFINITE).unwrap();
        assert_eq!(stack.pop().unwrap(), b"fresh");
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.shm");
        {
            let mut stack = ShmStack::open_or_create(&path, MB, true).unwrap();
            stack.push(b"survivor", TTL_INFINITE).unwrap();
            stack.flush().unwrap();
        }
        let mut stack = ShmStack::open(&path).unwrap();
        assert_eq!(stack.pop().unwrap(), b"survivor");
    }

    #[test]
    fn test_concurrent_push_pop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hammer.shm");
        ShmStack::open_or_create(&path, 8 * MB, true).unwrap();

        const THREADS: usize = 4;
        const PER_THREAD: usize = 500;

        let mut handles = Vec::new();
        for t in 0..THREADS {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                // Each thread opens its own handle, as a separate process
                // would.
                let mut stack = ShmStack::open(&path).unwrap();
                let mut popped = 0usize;
                for i in 0..PER_THREAD {
                    let value = ((t * PER_THREAD + i) as u64).to_le_bytes();
                    stack.push(&value, TTL_INFINITE).unwrap();
                    if i % 2 == 1 && stack.pop().is_some() {
                        popped += 1;
                    }
                }
                popped
            }));
        }

        let total_popped: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let mut stack = ShmStack::open(&path).unwrap();
        assert_eq!(stack.size(), THREADS * PER_THREAD - total_popped);
        assert_eq!(stack.pop_all(0).len(), THREADS * PER_THREAD - total_popped);
    }
}
