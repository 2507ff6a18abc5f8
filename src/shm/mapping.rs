//! Mapped-file manager: a growable heap inside a file, with a directory of
//! typed named regions.
//!
//! The first 4096 bytes hold the superblock: format magic and version, the
//! heap bump pointer and free list, a process-shared allocator mutex, and a
//! fixed directory of named regions. Everything after the superblock is
//! heap. All durable references are byte offsets from the start of the
//! file; raw pointers are derived per access and never stored.
//!
//! Growth extends the file and remaps it. The previous mapping is retired
//! rather than dropped, so transient pointers held elsewhere in this
//! process keep addressing the same (shared) pages until the manager goes
//! away. A resolver handed an offset beyond the current mapping refreshes
//! from the file's on-disk length, which covers the file being grown by a
//! different process.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::entry::{align_up, now_ns, CollectionHeader, NULL_OFFSET, RECORD_ALIGN};
use super::lock::ShmMutex;
use crate::error::{Error, Result};
use crate::stats::FileStats;

/// Magic number at offset 0 of every collection file.
pub const FILE_MAGIC: u64 = u64::from_le_bytes(*b"SHMKIT\x01\x00");

/// On-disk format version of the superblock and heap.
pub const FILE_FORMAT_VERSION: u32 = 1;

/// Bytes reserved for the superblock; the heap starts here.
pub const SUPERBLOCK_SIZE: usize = 4096;

/// Default initial file size when none is given.
pub const DEFAULT_INITIAL_SIZE: usize = 64 * 1024 * 1024;

/// How much extra to grow by when an allocation exhausts the heap.
pub const DEFAULT_GROWTH_STEP: usize = 16 * 1024 * 1024;

/// Offsets must stay representable in the 48-bit packed form used by
/// lock-free consumers.
pub const MAX_FILE_SIZE: u64 = 1 << 48;

const BLOCK_HEADER_SIZE: usize = 64;

/// A free block smaller than this is not worth splitting.
const MIN_SPLIT_REMAINDER: usize = BLOCK_HEADER_SIZE + RECORD_ALIGN;

const MAX_REGIONS: usize = 8;
const REGION_NAME_MAX: usize = 24;

/// Type tags recorded in the region directory.
pub mod region_kind {
    pub const LIST_HEADER: u32 = 1;
    pub const DEQUE_HEADER: u32 = 2;
    pub const HASH_HEADER: u32 = 3;
    pub const BUCKET_ARRAY: u32 = 4;
    pub const COUNTER: u32 = 5;
}

/// The header region names a collection file may carry, with the type tag
/// each is registered under.
const HEADER_REGION_NAMES: [(&str, u32); 5] = [
    ("list_header", region_kind::LIST_HEADER),
    ("set_header", region_kind::HASH_HEADER),
    ("map_header", region_kind::HASH_HEADER),
    ("queue_header", region_kind::DEQUE_HEADER),
    ("stack_header", region_kind::DEQUE_HEADER),
];

#[repr(C)]
struct RegionEntry {
    name: [u8; REGION_NAME_MAX],
    name_len: u32,
    kind: u32,
    offset: u64,
    size: u64,
}

const _: () = assert!(std::mem::size_of::<RegionEntry>() == 48);

#[repr(C)]
struct Superblock {
    magic: u64,
    version: u32,
    region_count: u32,
    file_size: AtomicU64,
    /// Next bump-allocation offset. Guarded by `alloc_mutex`.
    heap_tail: u64,
    /// Head of the LIFO free list, or [`NULL_OFFSET`]. Guarded by
    /// `alloc_mutex`.
    free_head: i64,
    /// Total bytes sitting on the free list. Guarded by `alloc_mutex`.
    free_bytes: u64,
    created_at: u64,
    modified_at: AtomicU64,
    alloc_mutex: ShmMutex,
    regions: [RegionEntry; MAX_REGIONS],
}

const _: () = assert!(std::mem::size_of::<Superblock>() <= SUPERBLOCK_SIZE);

/// Prefix of every heap block. The payload offset handed to callers is the
/// block offset plus this header.
#[repr(C)]
struct BlockHeader {
    /// Total block size, header included.
    size: u64,
    /// Free-list link while the block is free.
    next_free: i64,
    free: u32,
    _pad: u32,
    _reserved: [u8; 40],
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == BLOCK_HEADER_SIZE);

/// Owns one file mapped into the process address space.
pub struct MappedFile {
    path: PathBuf,
    file: File,
    map: RwLock<MmapMut>,
    /// Mappings replaced by growth, kept alive so transient pointers held
    /// by lock-free readers in this process never dangle.
    retired: Mutex<Vec<MmapMut>>,
    growth_step: usize,
}

impl MappedFile {
    /// Open `path`, creating it with `initial_size` bytes if `create_new`
    /// is set or the file does not exist.
    pub fn open_or_create<P: AsRef<Path>>(
        path: P,
        initial_size: usize,
        create_new: bool,
    ) -> Result<Self> {
        let path = path.as_ref();
        if create_new || !path.exists() {
            Self::create(path, initial_size)
        } else {
            Self::open(path)
        }
    }

    fn create(path: &Path, initial_size: usize) -> Result<Self> {
        if path.exists() {
            fs::remove_file(path).map_err(Error::FileCreationFailed)?;
        }

        let size = initial_size.max(SUPERBLOCK_SIZE * 4).min(MAX_FILE_SIZE as usize);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(Error::FileCreationFailed)?;
        file.set_len(size as u64).map_err(Error::FileCreationFailed)?;

        let map = unsafe { MmapOptions::new().map_mut(&file) }.map_err(Error::FileCreationFailed)?;

        let this = MappedFile {
            path: path.to_path_buf(),
            file,
            map: RwLock::new(map),
            retired: Mutex::new(Vec::new()),
            growth_step: DEFAULT_GROWTH_STEP,
        };

        unsafe {
            let sb = this.superblock();
            let now = now_ns();
            (*sb).magic = FILE_MAGIC;
            (*sb).version = FILE_FORMAT_VERSION;
            (*sb).region_count = 0;
            (*sb).file_size = AtomicU64::new(size as u64);
            (*sb).heap_tail = SUPERBLOCK_SIZE as u64;
            (*sb).free_head = NULL_OFFSET;
            (*sb).free_bytes = 0;
            (*sb).created_at = now;
            (*sb).modified_at = AtomicU64::new(now);
            (*sb)
                .alloc_mutex
                .init()
                .map_err(|e| Error::InternalError(format!("allocator mutex init failed: {e}")))?;
        }

        debug!(path = %path.display(), size, "created collection file");
        Ok(this)
    }

    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(Error::FileOpenFailed)?;
        let len = file.metadata().map_err(Error::FileOpenFailed)?.len();
        if len < SUPERBLOCK_SIZE as u64 {
            return Err(Error::InternalError(format!(
                "file {} is too small to hold a superblock",
                path.display()
            )));
        }

        let map = unsafe { MmapOptions::new().map_mut(&file) }.map_err(Error::FileOpenFailed)?;

        let this = MappedFile {
            path: path.to_path_buf(),
            file,
            map: RwLock::new(map),
            retired: Mutex::new(Vec::new()),
            growth_step: DEFAULT_GROWTH_STEP,
        };

        unsafe {
            let sb = this.superblock();
            if (*sb).magic != FILE_MAGIC || (*sb).version != FILE_FORMAT_VERSION {
                warn!(path = %path.display(), "rejected file with bad magic or version");
                return Err(Error::InternalError(format!(
                    "file {} is not a valid collection file",
                    path.display()
                )));
            }
        }

        debug!(path = %path.display(), len, "opened collection file");
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current base of the mapping. The pointer is transient: it is only
    /// guaranteed to address this file's pages for as long as this manager
    /// is alive, and a later growth may leave it addressing a stale (but
    /// still mapped) view.
    pub fn base(&self) -> *mut u8 {
        self.map.read().as_ptr() as *mut u8
    }

    /// Resolve an absolute file offset to a pointer, refreshing the mapping
    /// if the file was grown by another process.
    pub fn ptr_at(&self, offset: u64) -> *mut u8 {
        {
            let map = self.map.read();
            if (offset as usize) < map.len() {
                return unsafe { map.as_ptr().add(offset as usize) as *mut u8 };
            }
        }
        self.refresh();
        let map = self.map.read();
        debug_assert!((offset as usize) < map.len(), "offset {offset} beyond mapping");
        unsafe { map.as_ptr().add(offset as usize) as *mut u8 }
    }

    fn superblock(&self) -> *mut Superblock {
        self.base() as *mut Superblock
    }

    fn block_at(&self, block_offset: u64) -> *mut BlockHeader {
        self.ptr_at(block_offset) as *mut BlockHeader
    }

    /// Allocate `bytes` from the heap and return the payload offset.
    /// Attempts one growth before giving up.
    pub fn allocate(&self, bytes: usize) -> Result<u64> {
        let sb = self.superblock();
        let _guard = unsafe { (*sb).alloc_mutex.lock() };
        unsafe { self.allocate_locked(sb, bytes) }
    }

    unsafe fn allocate_locked(&self, sb: *mut Superblock, bytes: usize) -> Result<u64> {
        let total = BLOCK_HEADER_SIZE + align_up(bytes.max(1), RECORD_ALIGN);

        if let Some(block) = self.take_from_free_list(sb, total) {
            return Ok(block + BLOCK_HEADER_SIZE as u64);
        }
        if let Some(block) = self.take_from_tail(sb, total) {
            return Ok(block + BLOCK_HEADER_SIZE as u64);
        }

        if !self.grow_locked(sb, total + self.growth_step) {
            return Err(Error::MemoryAllocationFailed);
        }
        match self.take_from_tail(sb, total) {
            Some(block) => Ok(block + BLOCK_HEADER_SIZE as u64),
            None => Err(Error::MemoryAllocationFailed),
        }
    }

    unsafe fn take_from_free_list(&self, sb: *mut Superblock, total: usize) -> Option<u64> {
        let mut prev: i64 = NULL_OFFSET;
        let mut cur = (*sb).free_head;

        while cur >= 0 {
            let block = self.block_at(cur as u64);
            let block_size = (*block).size as usize;
            let next = (*block).next_free;

            if block_size >= total {
                if prev >= 0 {
                    (*self.block_at(prev as u64)).next_free = next;
                } else {
                    (*sb).free_head = next;
                }
                (*sb).free_bytes -= block_size as u64;

                if block_size - total >= MIN_SPLIT_REMAINDER {
                    let rem_offset = cur as u64 + total as u64;
                    let rem = self.block_at(rem_offset);
                    (*rem).size = (block_size - total) as u64;
                    (*rem).free = 1;
                    (*rem).next_free = (*sb).free_head;
                    (*sb).free_head = rem_offset as i64;
                    (*sb).free_bytes += (block_size - total) as u64;
                    (*block).size = total as u64;
                }

                (*block).free = 0;
                (*block).next_free = NULL_OFFSET;
                return Some(cur as u64);
            }

            prev = cur;
            cur = next;
        }
        None
    }

    unsafe fn take_from_tail(&self, sb: *mut Superblock, total: usize) -> Option<u64> {
        let tail = (*sb).heap_tail;
        let file_size = (*sb).file_size.load(Ordering::Acquire);
        if tail + total as u64 > file_size {
            return None;
        }
        (*sb).heap_tail = tail + total as u64;

        let block = self.block_at(tail);
        (*block).size = total as u64;
        (*block).free = 0;
        (*block).next_free = NULL_OFFSET;
        Some(tail)
    }

    /// Return a previously allocated payload offset to the heap.
    pub fn deallocate(&self, payload_offset: i64) {
        if payload_offset < BLOCK_HEADER_SIZE as i64 {
            return;
        }
        let block_offset = payload_offset as u64 - BLOCK_HEADER_SIZE as u64;
        let sb = self.superblock();
        let _guard = unsafe { (*sb).alloc_mutex.lock() };
        unsafe {
            let block = self.block_at(block_offset);
            if (*block).free != 0 {
                return;
            }
            (*block).free = 1;
            (*block).next_free = (*sb).free_head;
            (*sb).free_head = block_offset as i64;
            (*sb).free_bytes += (*block).size;
            (*sb).modified_at.store(now_ns(), Ordering::Relaxed);
        }
    }

    /// Extend the file and remap. Must be called with the allocator mutex
    /// held; the superblock pointer stays usable across the remap because
    /// the old mapping is retired, not unmapped.
    fn grow_locked(&self, sb: *mut Superblock, additional: usize) -> bool {
        let current = unsafe { (*sb).file_size.load(Ordering::Acquire) };
        let new_size = current.saturating_add(additional as u64);
        if new_size > MAX_FILE_SIZE {
            warn!(current, additional, "refusing to grow past maximum file size");
            return false;
        }
        if let Err(e) = self.file.set_len(new_size) {
            warn!(error = %e, "failed to extend backing file");
            return false;
        }
        let new_map = match unsafe { MmapOptions::new().map_mut(&self.file) } {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to remap grown file");
                return false;
            }
        };
        {
            let mut map = self.map.write();
            let old = std::mem::replace(&mut *map, new_map);
            self.retired.lock().push(old);
        }
        unsafe { (*sb).file_size.store(new_size, Ordering::Release) };
        debug!(old_size = current, new_size, path = %self.path.display(), "grew collection file");
        true
    }

    /// Remap if the file is longer on disk than the current mapping (grown
    /// by another process).
    fn refresh(&self) {
        let Ok(meta) = self.file.metadata() else {
            return;
        };
        let file_len = meta.len() as usize;
        let mut map = self.map.write();
        if file_len <= map.len() {
            return;
        }
        match unsafe { MmapOptions::new().map_mut(&self.file) } {
            Ok(new_map) => {
                let old = std::mem::replace(&mut *map, new_map);
                self.retired.lock().push(old);
            }
            Err(e) => warn!(error = %e, "failed to refresh mapping"),
        }
    }

    /// Find a named region, validating its type tag. `Ok(None)` when the
    /// name is unknown.
    pub fn find_region(&self, name: &str, kind: u32) -> Result<Option<u64>> {
        let sb = self.superblock();
        let _guard = unsafe { (*sb).alloc_mutex.lock() };
        unsafe { self.find_region_locked(sb, name, kind) }
    }

    unsafe fn find_region_locked(
        &self,
        sb: *mut Superblock,
        name: &str,
        kind: u32,
    ) -> Result<Option<u64>> {
        for i in 0..(*sb).region_count as usize {
            let entry = &(*sb).regions[i];
            if &entry.name[..entry.name_len as usize] == name.as_bytes() {
                if entry.kind != kind {
                    return Err(Error::InternalError(format!(
                        "region '{name}' registered with conflicting type tag {}",
                        entry.kind
                    )));
                }
                return Ok(Some(entry.offset));
            }
        }
        Ok(None)
    }

    /// Find a named region or allocate, zero, and initialize it. `init`
    /// runs only when the region is created, while the directory is still
    /// locked, so no other process can observe a half-built region.
    ///
    /// Returns the region offset and whether it was created by this call.
    pub fn find_or_create_region(
        &self,
        name: &str,
        kind: u32,
        byte_size: usize,
        init: impl FnOnce(*mut u8) -> io::Result<()>,
    ) -> Result<(u64, bool)> {
        if name.len() > REGION_NAME_MAX {
            return Err(Error::InvalidArgument(format!(
                "region name '{name}' exceeds {REGION_NAME_MAX} bytes"
            )));
        }

        let sb = self.superblock();
        let _guard = unsafe { (*sb).alloc_mutex.lock() };
        unsafe {
            if let Some(offset) = self.find_region_locked(sb, name, kind)? {
                let entry = (*sb)
                    .regions
                    .iter()
                    .find(|e| &e.name[..e.name_len as usize] == name.as_bytes())
                    .unwrap_or_else(|| unreachable!());
                if entry.size != byte_size as u64 {
                    return Err(Error::InternalError(format!(
                        "region '{name}' has size {} but {byte_size} was requested",
                        entry.size
                    )));
                }
                return Ok((offset, false));
            }

            let index = (*sb).region_count as usize;
            if index >= MAX_REGIONS {
                return Err(Error::InternalError("region directory is full".into()));
            }

            let offset = self.allocate_locked(sb, byte_size)?;
            std::ptr::write_bytes(self.ptr_at(offset), 0, byte_size);
            init(self.ptr_at(offset)).map_err(|e| {
                Error::InternalError(format!("failed to initialize region '{name}': {e}"))
            })?;

            let entry = &mut (*sb).regions[index];
            entry.name = [0; REGION_NAME_MAX];
            entry.name[..name.len()].copy_from_slice(name.as_bytes());
            entry.name_len = name.len() as u32;
            entry.kind = kind;
            entry.offset = offset;
            entry.size = byte_size as u64;
            (*sb).region_count = (index + 1) as u32;
            (*sb).modified_at.store(now_ns(), Ordering::Relaxed);

            debug!(name, kind, offset, byte_size, "constructed named region");
            Ok((offset, true))
        }
    }

    /// Flush dirty pages back to the file.
    pub fn flush(&self) -> Result<()> {
        self.map
            .read()
            .flush()
            .map_err(|e| Error::InternalError(format!("flush failed: {e}")))
    }

    /// Bytes still available without growing: unbumped tail plus the free
    /// list.
    pub fn free_space(&self) -> u64 {
        let sb = self.superblock();
        let _guard = unsafe { (*sb).alloc_mutex.lock() };
        unsafe {
            let file_size = (*sb).file_size.load(Ordering::Acquire);
            file_size - (*sb).heap_tail + (*sb).free_bytes
        }
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        unsafe { (*self.superblock()).file_size.load(Ordering::Acquire) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        // Destructor-path flush failures are swallowed; callers wanting the
        // error flush explicitly first.
        let _ = self.map.read().flush();
    }
}

/// Remove a collection's backing file.
pub fn delete_file<P: AsRef<Path>>(path: P) -> bool {
    fs::remove_file(path.as_ref()).is_ok()
}

fn map_read_only(path: &Path) -> io::Result<Mmap> {
    let file = File::open(path)?;
    unsafe { MmapOptions::new().map(&file) }
}

/// Locate a collection header in a read-only mapping: superblock magic and
/// version first, then the first known header region whose own magic and
/// version check out.
fn locate_header(map: &Mmap) -> Option<(*const Superblock, *const CollectionHeader)> {
    if map.len() < SUPERBLOCK_SIZE {
        return None;
    }
    let sb = map.as_ptr() as *const Superblock;
    unsafe {
        if (*sb).magic != FILE_MAGIC || (*sb).version != FILE_FORMAT_VERSION {
            return None;
        }
        for (name, _kind) in HEADER_REGION_NAMES {
            for i in 0..((*sb).region_count as usize).min(MAX_REGIONS) {
                let entry = &(*sb).regions[i];
                if &entry.name[..(entry.name_len as usize).min(REGION_NAME_MAX)]
                    == name.as_bytes()
                {
                    let end = entry.offset as usize + std::mem::size_of::<CollectionHeader>();
                    if end > map.len() {
                        continue;
                    }
                    let header = map.as_ptr().add(entry.offset as usize) as *const CollectionHeader;
                    if (*header).is_valid() {
                        return Some((sb, header));
                    }
                }
            }
        }
    }
    None
}

/// Check whether `path` holds a valid collection file of any container
/// type.
pub fn is_valid_file<P: AsRef<Path>>(path: P) -> bool {
    let path = path.as_ref();
    if !path.exists() {
        return false;
    }
    match map_read_only(path) {
        Ok(map) => locate_header(&map).is_some(),
        Err(_) => false,
    }
}

/// Extract file-level statistics without taking any locks. `None` when the
/// file is absent or not a collection file.
pub fn file_stats<P: AsRef<Path>>(path: P) -> Option<FileStats> {
    let map = map_read_only(path.as_ref()).ok()?;
    let (sb, header) = locate_header(&map)?;
    unsafe {
        let total_size = (*sb).file_size.load(Ordering::Relaxed);
        let free_size = total_size - (*sb).heap_tail + (*sb).free_bytes;
        Some(FileStats {
            total_size,
            used_size: total_size - free_size,
            free_size,
            element_count: (*header).size.load(Ordering::Relaxed),
            created_at: (*header).created_at,
            modified_at: (*header).modified_at.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_open_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.shm");

        let file = MappedFile::open_or_create(&path, 1024 * 1024, true).unwrap();
        assert_eq!(file.size(), 1024 * 1024);
        drop(file);

        let file = MappedFile::open_or_create(&path, 1024 * 1024, false).unwrap();
        assert_eq!(file.size(), 1024 * 1024);
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.shm");
        fs::write(&path, vec![0xAB; 8192]).unwrap();

        let err = MappedFile::open_or_create(&path, 1024 * 1024, false)
            .err()
            .expect("opening garbage must fail");
        assert!(matches!(err, Error::InternalError(_)));
    }

    #[test]
    fn test_allocate_and_reuse() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alloc.shm");
        let file = MappedFile::open_or_create(&path, 1024 * 1024, true).unwrap();

        let a = file.allocate(100).unwrap();
        let b = file.allocate(100).unwrap();
        assert_ne!(a, b);
        assert_eq!(a % RECORD_ALIGN as u64, 0);

        let before = file.free_space();
        file.deallocate(a as i64);
        assert!(file.free_space() > before);

        // The freed block satisfies an equal-sized request.
        let c = file.allocate(100).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_allocate_splits_large_free_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("split.shm");
        let file = MappedFile::open_or_create(&path, 1024 * 1024, true).unwrap();

        let big = file.allocate(4096).unwrap();
        file.deallocate(big as i64);

        // A small allocation carves the front of the freed block...
        let small = file.allocate(64).unwrap();
        assert_eq!(small, big);
        // ...and the remainder serves the next one.
        let next = file.allocate(64).unwrap();
        assert!(next > small && next < big + 4096 + BLOCK_HEADER_SIZE as u64);
    }

    #[test]
    fn test_allocation_grows_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grow.shm");
        let file = MappedFile::open_or_create(&path, SUPERBLOCK_SIZE * 4, true).unwrap();
        let initial = file.size();

        // Far larger than the initial file; must grow to satisfy.
        let offset = file.allocate(256 * 1024).unwrap();
        assert!(file.size() > initial);
        assert!(offset + 256 * 1024 <= file.size());
    }

    #[test]
    fn test_named_region_find_or_create() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("regions.shm");
        let file = MappedFile::open_or_create(&path, 1024 * 1024, true).unwrap();

        let (offset, created) = file
            .find_or_create_region("counter", region_kind::COUNTER, 8, |_| Ok(()))
            .unwrap();
        assert!(created);

        let (again, created) = file
            .find_or_create_region("counter", region_kind::COUNTER, 8, |_| {
                panic!("init must not run for an existing region")
            })
            .unwrap();
        assert!(!created);
        assert_eq!(offset, again);

        assert_eq!(
            file.find_region("counter", region_kind::COUNTER).unwrap(),
            Some(offset)
        );
        assert_eq!(file.find_region("missing", region_kind::COUNTER).unwrap(), None);
    }

    #[test]
    fn test_region_kind_conflict() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conflict.shm");
        let file = MappedFile::open_or_create(&path, 1024 * 1024, true).unwrap();

        file.find_or_create_region("thing", region_kind::COUNTER, 8, |_| Ok(()))
            .unwrap();
        assert!(file.find_region("thing", region_kind::BUCKET_ARRAY).is_err());
    }

    #[test]
    fn test_regions_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.shm");

        let offset = {
            let file = MappedFile::open_or_create(&path, 1024 * 1024, true).unwrap();
            let (offset, _) = file
                .find_or_create_region("counter", region_kind::COUNTER, 8, |ptr| {
                    unsafe { (ptr as *mut u64).write(42) };
                    Ok(())
                })
                .unwrap();
            file.flush().unwrap();
            offset
        };

        let file = MappedFile::open_or_create(&path, 1024 * 1024, false).unwrap();
        assert_eq!(
            file.find_region("counter", region_kind::COUNTER).unwrap(),
            Some(offset)
        );
        let value = unsafe { *(file.ptr_at(offset) as *const u64) };
        assert_eq!(value, 42);
    }

    #[test]
    fn test_delete_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doomed.shm");
        MappedFile::open_or_create(&path, 1024 * 1024, true).unwrap();
        assert!(path.exists());
        assert!(delete_file(&path));
        assert!(!path.exists());
        assert!(!delete_file(&path));
    }

    #[test]
    fn test_is_valid_file_on_non_collection() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        fs::write(&path, vec![0u8; 8192]).unwrap();
        assert!(!is_valid_file(&path));
        assert!(!is_valid_file(dir.path().join("absent.bin")));
    }
}
