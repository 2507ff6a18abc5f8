//! Operation counters and file-level statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-local operation counters kept by every collection handle.
///
/// These mirror activity seen through *this* handle only; they are not
/// shared through the file. The `size` field tracks inserts minus removes
/// and can drift from the visible count while expired records await
/// sweeping.
#[derive(Debug, Default)]
pub struct CollectionStats {
    pub size: AtomicU64,
    pub read_count: AtomicU64,
    pub write_count: AtomicU64,
    pub hit_count: AtomicU64,
    pub miss_count: AtomicU64,
}

impl CollectionStats {
    pub fn record_write(&self) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        self.hit_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        self.miss_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_size(&self, n: u64) {
        self.size.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sub_size(&self, n: u64) {
        let mut current = self.size.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(n);
            match self.size.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn set_size(&self, n: u64) {
        self.size.store(n, Ordering::Relaxed);
    }

    /// A point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            size: self.size.load(Ordering::Relaxed),
            read_count: self.read_count.load(Ordering::Relaxed),
            write_count: self.write_count.load(Ordering::Relaxed),
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value copy of [`CollectionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub size: u64,
    pub read_count: u64,
    pub write_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
}

/// Statistics about a collection's backing file, as reported by
/// [`file_stats`](crate::file_stats).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStats {
    pub total_size: u64,
    pub used_size: u64,
    pub free_size: u64,
    /// Raw linked-record count from the collection header, including
    /// expired records that have not been swept yet.
    pub element_count: u64,
    pub created_at: u64,
    pub modified_at: u64,
}
