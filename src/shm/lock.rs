//! Process-shared lock primitives living inside the mapped file.
//!
//! The locks are POSIX pthread objects initialized with
//! `PTHREAD_PROCESS_SHARED`, so any process mapping the same file can
//! contend on them. Storage is over-reserved because the pthread types have
//! different sizes per platform (`pthread_rwlock_t` is 56 bytes on x86_64
//! Linux, 200 bytes on macOS arm64).

use std::cell::UnsafeCell;
use std::io;

/// Bytes reserved for an embedded `pthread_rwlock_t`.
pub const RWLOCK_STORAGE: usize = 256;

/// Bytes reserved for an embedded `pthread_mutex_t`.
pub const MUTEX_STORAGE: usize = 64;

const _: () = assert!(std::mem::size_of::<libc::pthread_rwlock_t>() <= RWLOCK_STORAGE);
const _: () = assert!(std::mem::size_of::<libc::pthread_mutex_t>() <= MUTEX_STORAGE);

/// A reader-writer lock embedded in shared memory.
///
/// Lives inside a file-resident header struct; never constructed on the
/// Rust stack. Initialized exactly once when its containing region is
/// first created, then attached to by every process that maps the file.
#[repr(C, align(8))]
pub struct ShmRwLock {
    storage: UnsafeCell<[u8; RWLOCK_STORAGE]>,
}

unsafe impl Send for ShmRwLock {}
unsafe impl Sync for ShmRwLock {}

impl ShmRwLock {
    fn raw(&self) -> *mut libc::pthread_rwlock_t {
        self.storage.get() as *mut libc::pthread_rwlock_t
    }

    /// Initialize the rwlock in place.
    ///
    /// # Safety
    /// The storage must not be in use by any process, and must not already
    /// hold an initialized lock.
    pub unsafe fn init(&self) -> io::Result<()> {
        let mut attr: libc::pthread_rwlockattr_t = std::mem::zeroed();
        let ret = libc::pthread_rwlockattr_init(&mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }

        let ret = libc::pthread_rwlockattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if ret != 0 {
            libc::pthread_rwlockattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(ret));
        }

        let ret = libc::pthread_rwlock_init(self.raw(), &attr);
        libc::pthread_rwlockattr_destroy(&mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        Ok(())
    }

    /// Acquire exclusively. Blocks until available.
    pub fn write(&self) -> ShmRwLockGuard<'_> {
        unsafe {
            let ret = libc::pthread_rwlock_wrlock(self.raw());
            debug_assert_eq!(ret, 0, "pthread_rwlock_wrlock failed: {ret}");
        }
        ShmRwLockGuard { lock: self }
    }

    /// Acquire shared. Blocks until available.
    pub fn read(&self) -> ShmRwLockGuard<'_> {
        unsafe {
            let ret = libc::pthread_rwlock_rdlock(self.raw());
            debug_assert_eq!(ret, 0, "pthread_rwlock_rdlock failed: {ret}");
        }
        ShmRwLockGuard { lock: self }
    }
}

/// RAII guard for [`ShmRwLock`]; unlocks on drop.
pub struct ShmRwLockGuard<'a> {
    lock: &'a ShmRwLock,
}

impl Drop for ShmRwLockGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            let ret = libc::pthread_rwlock_unlock(self.lock.raw());
            debug_assert_eq!(ret, 0, "pthread_rwlock_unlock failed: {ret}");
        }
    }
}

/// A mutex embedded in shared memory, one per hash bucket and one for the
/// heap allocator.
#[repr(C, align(8))]
pub struct ShmMutex {
    storage: UnsafeCell<[u8; MUTEX_STORAGE]>,
}

unsafe impl Send for ShmMutex {}
unsafe impl Sync for ShmMutex {}

impl ShmMutex {
    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.storage.get() as *mut libc::pthread_mutex_t
    }

    /// Initialize the mutex in place.
    ///
    /// # Safety
    /// The storage must not be in use by any process, and must not already
    /// hold an initialized lock.
    pub unsafe fn init(&self) -> io::Result<()> {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let ret = libc::pthread_mutexattr_init(&mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }

        let ret = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if ret != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(ret));
        }

        let ret = libc::pthread_mutex_init(self.raw(), &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        Ok(())
    }

    /// Acquire the mutex. Blocks until available.
    pub fn lock(&self) -> ShmMutexGuard<'_> {
        unsafe {
            let ret = libc::pthread_mutex_lock(self.raw());
            debug_assert_eq!(ret, 0, "pthread_mutex_lock failed: {ret}");
        }
        ShmMutexGuard { lock: self }
    }
}

/// RAII guard for [`ShmMutex`]; unlocks on drop.
pub struct ShmMutexGuard<'a> {
    lock: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            let ret = libc::pthread_mutex_unlock(self.lock.raw());
            debug_assert_eq!(ret, 0, "pthread_mutex_unlock failed: {ret}");
        }
    }
}
