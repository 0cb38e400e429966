//! Named cross-process mutex.
//!
//! The lock word lives in its own small memory object, so any process that
//! opens the same name contends on the same futex. States: 0 unlocked,
//! 1 locked, 2 locked with possible waiters; unlock only enters the kernel
//! when the word was 2.

use std::sync::Arc;

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU32, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU32, Ordering};

use crate::region::{RegionMemory, SharedRegion};
use crate::shm::{create_writable_region, destroy_memory_object, OpenMode};
use crate::wait::{wait_u32, wake_one, WaitResult};
use crate::{ShmConfig, SyncResult};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

const MUTEX_STATE_SIZE: usize = std::mem::size_of::<u32>();

/// Lock capability a condition variable consumes as its external lock.
pub trait IpcLock: Send + Sync {
    fn lock(&self);
    fn unlock(&self);

    /// Releases this handle's resources. Does not remove the named object.
    fn close(self) -> SyncResult<()>
    where
        Self: Sized;
}

impl<T: IpcLock> IpcLock for &T {
    fn lock(&self) {
        (**self).lock()
    }

    fn unlock(&self) {
        (**self).unlock()
    }

    /// Borrowed locks are released by their owner.
    fn close(self) -> SyncResult<()> {
        Ok(())
    }
}

impl<T: IpcLock> IpcLock for Arc<T> {
    fn lock(&self) {
        (**self).lock()
    }

    fn unlock(&self) {
        (**self).unlock()
    }

    /// Closes the lock once the last shared handle goes away.
    fn close(self) -> SyncResult<()> {
        match Arc::try_unwrap(self) {
            Ok(inner) => inner.close(),
            Err(_) => Ok(()),
        }
    }
}

/// Futex mutex stored in a named memory object.
#[derive(Debug)]
pub struct NamedMutex {
    name: String,
    region: SharedRegion,
}

impl NamedMutex {
    pub fn new(name: &str, mode: OpenMode, config: &ShmConfig) -> SyncResult<Self> {
        let (region, created) = create_writable_region(name, mode, MUTEX_STATE_SIZE, config)?;
        tracing::debug!(created, "opened mutex {name:?}");
        Ok(Self {
            name: name.to_owned(),
            region,
        })
    }

    /// Creates the mutex, failing if it already exists.
    pub fn create(name: &str, config: &ShmConfig) -> SyncResult<Self> {
        Self::new(name, OpenMode::CreateOnly, config)
    }

    /// Opens an existing mutex.
    pub fn open(name: &str, config: &ShmConfig) -> SyncResult<Self> {
        Self::new(name, OpenMode::OpenOnly, config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the lock without blocking.
    pub fn try_lock(&self) -> bool {
        self.word()
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquires the lock and releases it when the guard drops.
    pub fn guard(&self) -> NamedMutexGuard<'_> {
        IpcLock::lock(self);
        NamedMutexGuard { mutex: self }
    }

    fn word(&self) -> &AtomicU32 {
        // SAFETY: the mapping holds at least one aligned u32 for our lifetime.
        unsafe { &*self.region.base().as_ptr().cast::<AtomicU32>() }
    }
}

impl IpcLock for NamedMutex {
    fn lock(&self) {
        if self.try_lock() {
            return;
        }
        let word = self.word();
        while word.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            if let WaitResult::Failed(errno) = wait_u32(word, CONTENDED, None) {
                panic!("futex wait on mutex {:?} failed (errno {errno})", self.name);
            }
        }
    }

    fn unlock(&self) {
        let word = self.word();
        if word.fetch_sub(1, Ordering::Release) != LOCKED {
            word.store(UNLOCKED, Ordering::Release);
            wake_one(word);
        }
    }

    fn close(self) -> SyncResult<()> {
        self.region.close()
    }
}

/// Scoped hold on a [`NamedMutex`].
#[must_use = "dropping the guard releases the lock immediately"]
pub struct NamedMutexGuard<'a> {
    mutex: &'a NamedMutex,
}

impl Drop for NamedMutexGuard<'_> {
    fn drop(&mut self) {
        IpcLock::unlock(self.mutex);
    }
}

/// Removes the named mutex object. A missing mutex is not an error.
pub fn destroy_mutex(name: &str, config: &ShmConfig) -> SyncResult<()> {
    destroy_memory_object(name, config)
}
