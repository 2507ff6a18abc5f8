//! Uniform byte-in / byte-out adapter over the five container types.
//!
//! Language bindings talk to a [`Collection`] handle instead of the
//! concrete container types: payloads and keys are byte slices in,
//! `Vec<u8>` out, absent-or-expired is `None`, and TTLs use the
//! `-1`-means-infinite convention throughout. Operations that make no
//! sense for the underlying kind (positional access on a set, key lookup
//! on a queue) report `InvalidArgument` instead of panicking.

use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::list::ShmList;
use crate::map::ShmMap;
use crate::queue::ShmQueue;
use crate::set::ShmSet;
use crate::stack::ShmStack;

/// Which container type a [`Collection`] handle wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    List,
    Set,
    Map,
    Queue,
    Stack,
}

/// A type-erased handle over one container.
pub enum Collection {
    List(ShmList),
    Set(ShmSet),
    Map(ShmMap),
    Queue(ShmQueue),
    Stack(ShmStack),
}

fn wrong_kind(operation: &str, kind: CollectionKind) -> Error {
    Error::InvalidArgument(format!("{operation} is not supported by a {kind:?} collection"))
}

impl Collection {
    /// Open or create a container of the given kind. `bucket_count`
    /// applies to hash containers only (`0` selects the default) and is
    /// ignored by the rest.
    pub fn open_or_create<P: AsRef<Path>>(
        kind: CollectionKind,
        path: P,
        initial_size: usize,
        create_new: bool,
        bucket_count: u32,
    ) -> Result<Self> {
        Ok(match kind {
            CollectionKind::List => {
                Collection::List(ShmList::open_or_create(path, initial_size, create_new)?)
            }
            CollectionKind::Set => Collection::Set(ShmSet::with_bucket_count(
                path,
                initial_size,
                create_new,
                bucket_count,
            )?),
            CollectionKind::Map => Collection::Map(ShmMap::with_bucket_count(
                path,
                initial_size,
                create_new,
                bucket_count,
            )?),
            CollectionKind::Queue => {
                Collection::Queue(ShmQueue::open_or_create(path, initial_size, create_new)?)
            }
            CollectionKind::Stack => {
                Collection::Stack(ShmStack::open_or_create(path, initial_size, create_new)?)
            }
        })
    }

    pub fn kind(&self) -> CollectionKind {
        match self {
            Collection::List(_) => CollectionKind::List,
            Collection::Set(_) => CollectionKind::Set,
            Collection::Map(_) => CollectionKind::Map,
            Collection::Queue(_) => CollectionKind::Queue,
            Collection::Stack(_) => CollectionKind::Stack,
        }
    }

    /// Store bytes: list append, set insert, map put (`value` required),
    /// queue offer, stack push.
    pub fn put(&mut self, key: &[u8], value: Option<&[u8]>, ttl_seconds: i64) -> Result<bool> {
        match self {
            Collection::List(list) => list.add(key, ttl_seconds),
            Collection::Set(set) => set.add(key, ttl_seconds),
            Collection::Map(map) => {
                let value = value.ok_or_else(|| {
                    Error::InvalidArgument("map put requires a value".to_string())
                })?;
                map.put(key, value, ttl_seconds)
            }
            Collection::Queue(queue) => queue.offer(key, ttl_seconds),
            Collection::Stack(stack) => stack.push(key, ttl_seconds),
        }
    }

    /// Key lookup; maps only.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self {
            Collection::Map(map) => Ok(map.get(key)),
            other => Err(wrong_kind("get by key", other.kind())),
        }
    }

    /// Positional lookup; lists only.
    pub fn get_at(&self, index: usize) -> Result<Option<Vec<u8>>> {
        match self {
            Collection::List(list) => Ok(list.get(index)),
            other => Err(wrong_kind("get by index", other.kind())),
        }
    }

    /// Non-destructive front/top read: list first element, queue front,
    /// stack top.
    pub fn peek(&self) -> Result<Option<Vec<u8>>> {
        match self {
            Collection::List(list) => Ok(list.get_first()),
            Collection::Queue(queue) => Ok(queue.peek()),
            Collection::Stack(stack) => Ok(stack.peek()),
            other => Err(wrong_kind("peek", other.kind())),
        }
    }

    /// Destructive front/top read: list remove-first, queue poll, stack
    /// pop.
    pub fn take_next(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            Collection::List(list) => Ok(list.remove_first()),
            Collection::Queue(queue) => Ok(queue.poll()),
            Collection::Stack(stack) => Ok(stack.pop()),
            other => Err(wrong_kind("take", other.kind())),
        }
    }

    /// Blocking destructive read with a deadline; queues only.
    pub fn take_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self {
            Collection::Queue(queue) => Ok(queue.poll_timeout(timeout)),
            other => Err(wrong_kind("timed take", other.kind())),
        }
    }

    /// Membership: list/queue/stack by payload, set by element, map by
    /// key.
    pub fn contains(&self, key: &[u8]) -> bool {
        match self {
            Collection::List(list) => list.contains(key),
            Collection::Set(set) => set.contains(key),
            Collection::Map(map) => map.contains_key(key),
            Collection::Queue(queue) => queue.contains(key),
            Collection::Stack(stack) => stack.search(key) >= 0,
        }
    }

    /// Remove by key/payload. For lists, queues and stacks this is
    /// remove-first-occurrence.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        Ok(match self {
            Collection::List(list) => list.remove_element(key),
            Collection::Set(set) => set.remove(key),
            Collection::Map(map) => map.remove(key).is_some(),
            Collection::Queue(queue) => queue.remove_element(key),
            Collection::Stack(stack) => stack.remove_element(key),
        })
    }

    /// Remaining TTL for the identified element: `-1` infinite, `0`
    /// absent or expired. Lists are addressed by index via
    /// [`Collection::get_ttl_at`]; queue and stack report their
    /// front/top element and ignore `key`.
    pub fn get_ttl(&self, key: &[u8]) -> Result<i64> {
        match self {
            Collection::Set(set) => Ok(set.get_ttl(key)),
            Collection::Map(map) => Ok(map.get_ttl(key)),
            Collection::Queue(queue) => Ok(queue.peek_ttl()),
            Collection::Stack(stack) => Ok(stack.peek_ttl()),
            other => Err(wrong_kind("get_ttl by key", other.kind())),
        }
    }

    /// Remaining TTL by position; lists only.
    pub fn get_ttl_at(&self, index: usize) -> Result<i64> {
        match self {
            Collection::List(list) => Ok(list.get_ttl(index)),
            other => Err(wrong_kind("get_ttl by index", other.kind())),
        }
    }

    /// Rebase the TTL of the identified element; sets and maps only.
    pub fn set_ttl(&mut self, key: &[u8], ttl_seconds: i64) -> Result<bool> {
        match self {
            Collection::Set(set) => Ok(set.set_ttl(key, ttl_seconds)),
            Collection::Map(map) => Ok(map.set_ttl(key, ttl_seconds)),
            other => Err(wrong_kind("set_ttl by key", other.kind())),
        }
    }

    /// Rebase the TTL by position; lists only.
    pub fn set_ttl_at(&mut self, index: usize, ttl_seconds: i64) -> Result<bool> {
        match self {
            Collection::List(list) => Ok(list.set_ttl(index, ttl_seconds)),
            other => Err(wrong_kind("set_ttl by index", other.kind())),
        }
    }

    /// Sweep expired records; returns the count reclaimed.
    pub fn remove_expired(&mut self) -> u64 {
        (match self {
            Collection::List(list) => list.remove_expired(),
            Collection::Set(set) => set.remove_expired(),
            Collection::Map(map) => map.remove_expired(),
            Collection::Queue(queue) => queue.remove_expired(),
            Collection::Stack(stack) => stack.remove_expired(),
        }) as u64
    }

    /// Visible (alive) element count.
    pub fn size(&self) -> u64 {
        (match self {
            Collection::List(list) => list.size(),
            Collection::Set(set) => set.size(),
            Collection::Map(map) => map.size(),
            Collection::Queue(queue) => queue.size(),
            Collection::Stack(stack) => stack.size(),
        }) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&mut self) {
        match self {
            Collection::List(list) => list.clear(),
            Collection::Set(set) => set.clear(),
            Collection::Map(map) => map.clear(),
            Collection::Queue(queue) => queue.clear(),
            Collection::Stack(stack) => stack.clear(),
        }
    }

    pub fn flush(&self) -> Result<()> {
        match self {
            Collection::List(list) => list.flush(),
            Collection::Set(set) => set.flush(),
            Collection::Map(map) => map.flush(),
            Collection::Queue(queue) => queue.flush(),
            Collection::Stack(stack) => stack.flush(),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Collection::List(list) => list.path(),
            Collection::Set(set) => set.path(),
            Collection::Map(map) => map.path(),
            Collection::Queue(queue) => queue.path(),
            Collection::Stack(stack) => stack.path(),
        }
    }
}
