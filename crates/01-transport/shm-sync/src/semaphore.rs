//! Named counting semaphore.
//!
//! The count lives in its own memory object (`<name>.sv`) next to a ready
//! flag. It is guarded by a named mutex (`<name>.sl`), and acquirers block on
//! a [`Cond`] called `<name>.sc` that uses that mutex as its caller lock.
//!
//! The creator sets up the mutex and condition variable before it raises the
//! ready flag, so a process that opens the semaphore waits for the flag and
//! then finds every part in place.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::cond::{destroy_cond, Cond};
use crate::error::CleanupErrors;
use crate::mutex::{destroy_mutex, IpcLock, NamedMutex};
use crate::naming::{sem_cond_name, sem_lock_name, sem_value_name, validate_name};
use crate::region::{RegionMemory, SharedRegion};
use crate::shm::{create_writable_region, destroy_memory_object, OpenMode};
use crate::{ShmConfig, SyncError, SyncResult};

const READY_WAIT: Duration = Duration::from_millis(500);
const READY_POLL: Duration = Duration::from_millis(1);

#[repr(C)]
struct SemState {
    count: AtomicU32,
    ready: AtomicU32,
}

const STATE_SIZE: usize = std::mem::size_of::<SemState>();

/// Counting semaphore shared by every process that opens the same name.
pub struct Semaphore {
    state: SharedRegion,
    cond: Cond<NamedMutex>,
    name: String,
    config: ShmConfig,
}

impl Semaphore {
    /// Creates or opens the semaphore called `name`.
    ///
    /// `initial` is the starting count and is only used when this call
    /// creates the semaphore. Creating also resets any lock or condition
    /// variable left behind under the derived names.
    pub fn new(name: &str, mode: OpenMode, initial: u32, config: &ShmConfig) -> SyncResult<Self> {
        validate_name(name)?;
        let (state, created) =
            create_writable_region(&sem_value_name(name), mode, STATE_SIZE, config)
                .map_err(|err| err.context("failed to create semaphore value"))?;

        let cond = if created {
            Self::initialise(name, &state, initial, config)
        } else {
            Self::attach(name, &state, config)
        };
        match cond {
            Ok(cond) => {
                tracing::debug!(created, initial, "opened semaphore {name:?}");
                Ok(Self {
                    state,
                    cond,
                    name: name.to_owned(),
                    config: config.clone(),
                })
            }
            Err(err) if created => {
                drop(state);
                let mut cleanup = CleanupErrors::new();
                remove_objects(name, config, &mut cleanup);
                Err(cleanup.finish_after(err))
            }
            Err(err) => Err(err),
        }
    }

    /// Creates the semaphore with count `initial`, failing if it exists.
    pub fn create(name: &str, initial: u32, config: &ShmConfig) -> SyncResult<Self> {
        Self::new(name, OpenMode::CreateOnly, initial, config)
    }

    /// Opens an existing semaphore.
    pub fn open(name: &str, config: &ShmConfig) -> SyncResult<Self> {
        Self::new(name, OpenMode::OpenOnly, 0, config)
    }

    fn initialise(
        name: &str,
        state: &SharedRegion,
        initial: u32,
        config: &ShmConfig,
    ) -> SyncResult<Cond<NamedMutex>> {
        let lock = NamedMutex::new(&sem_lock_name(name), OpenMode::CreateTruncate, config)
            .map_err(|err| err.context("failed to create semaphore lock"))?;
        let cond = Cond::new(&sem_cond_name(name), OpenMode::CreateTruncate, lock, config)
            .map_err(|err| err.context("failed to create semaphore cond"))?;
        let shared = shared_state(state);
        shared.count.store(initial, Ordering::Relaxed);
        shared.ready.store(1, Ordering::Release);
        Ok(cond)
    }

    fn attach(name: &str, state: &SharedRegion, config: &ShmConfig) -> SyncResult<Cond<NamedMutex>> {
        let ready = &shared_state(state).ready;
        let deadline = Instant::now() + READY_WAIT;
        while ready.load(Ordering::Acquire) == 0 {
            if Instant::now() >= deadline {
                return Err(SyncError::NotReady {
                    name: sem_value_name(name),
                });
            }
            thread::sleep(READY_POLL);
        }
        let lock = NamedMutex::open(&sem_lock_name(name), config)
            .map_err(|err| err.context("failed to open semaphore lock"))?;
        Cond::open(&sem_cond_name(name), lock, config)
            .map_err(|err| err.context("failed to open semaphore cond"))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current count, read without the lock.
    pub fn value(&self) -> u32 {
        self.count().load(Ordering::Acquire)
    }

    /// Takes one unit, blocking while the count is zero.
    pub fn wait(&self) {
        let lock = self.cond.locker();
        lock.lock();
        while self.count().load(Ordering::Relaxed) == 0 {
            self.cond.wait();
        }
        self.take_one();
        lock.unlock();
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`. Returns true
    /// when a unit was taken.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let lock = self.cond.locker();
        lock.lock();
        let taken = loop {
            if self.count().load(Ordering::Relaxed) > 0 {
                self.take_one();
                break true;
            }
            match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => {
                        self.cond.wait_timeout(left);
                    }
                    _ => break false,
                },
                None => self.cond.wait(),
            }
        };
        lock.unlock();
        taken
    }

    /// Takes one unit if the count is positive.
    pub fn try_wait(&self) -> bool {
        let lock = self.cond.locker();
        lock.lock();
        let taken = self.count().load(Ordering::Relaxed) > 0;
        if taken {
            self.take_one();
        }
        lock.unlock();
        taken
    }

    /// Adds `n` units and wakes up to `n` blocked acquirers.
    ///
    /// # Panics
    ///
    /// Panics if the count would overflow `u32`.
    pub fn signal(&self, n: u32) {
        let lock = self.cond.locker();
        lock.lock();
        let count = self.count().load(Ordering::Relaxed);
        let raised = count
            .checked_add(n)
            .unwrap_or_else(|| panic!("semaphore {:?} count overflow", self.name));
        self.count().store(raised, Ordering::Release);
        let wakes = (n as usize).min(self.cond.waiter_count());
        for _ in 0..wakes {
            self.cond.signal();
        }
        lock.unlock();
        tracing::trace!(n, wakes, "released semaphore {:?}", self.name);
    }

    /// Releases this handle's mappings and locks. Shared objects stay.
    pub fn close(self) -> SyncResult<()> {
        let mut cleanup = CleanupErrors::new();
        self.close_into(&mut cleanup);
        cleanup.finish()
    }

    /// Closes the handle and permanently removes the shared objects.
    pub fn destroy(self) -> SyncResult<()> {
        let mut cleanup = CleanupErrors::new();
        let name = self.name.clone();
        let config = self.config.clone();
        self.close_into(&mut cleanup);
        remove_objects(&name, &config, &mut cleanup);
        cleanup.finish()
    }

    fn close_into(self, cleanup: &mut CleanupErrors) {
        cleanup.record(self.cond.close(), "failed to close semaphore cond");
        cleanup.record(self.state.close(), "failed to close semaphore value");
    }

    fn count(&self) -> &AtomicU32 {
        &shared_state(&self.state).count
    }

    fn take_one(&self) {
        let count = self.count().load(Ordering::Relaxed);
        self.count().store(count - 1, Ordering::Release);
    }
}

fn shared_state(region: &SharedRegion) -> &SemState {
    // SAFETY: the region holds `STATE_SIZE` page-aligned bytes for its lifetime.
    unsafe { &*region.base().as_ptr().cast::<SemState>() }
}

/// Removes the shared objects of semaphore `name` without a handle.
pub fn destroy_semaphore(name: &str, config: &ShmConfig) -> SyncResult<()> {
    validate_name(name)?;
    let mut cleanup = CleanupErrors::new();
    remove_objects(name, config, &mut cleanup);
    cleanup.finish()
}

fn remove_objects(name: &str, config: &ShmConfig, cleanup: &mut CleanupErrors) {
    cleanup.record(
        destroy_memory_object(&sem_value_name(name), config),
        "failed to destroy semaphore value",
    );
    cleanup.record(
        destroy_cond(&sem_cond_name(name), config),
        "failed to destroy semaphore cond",
    );
    cleanup.record(
        destroy_mutex(&sem_lock_name(name), config),
        "failed to destroy semaphore lock",
    );
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn config() -> (tempfile::TempDir, ShmConfig) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ShmConfig::with_dir(dir.path()).max_cond_waiters(8);
        (dir, config)
    }

    fn wait_for_blocked(sem: &Semaphore, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while sem.cond.waiter_count() != expected {
            assert!(Instant::now() < deadline, "acquirers never reached {expected}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn initial_count_is_consumed_then_refused() {
        let (_dir, config) = config();
        let sem = Semaphore::create("slots", 2, &config).expect("create");
        assert_eq!(sem.value(), 2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        assert_eq!(sem.value(), 0);
        sem.destroy().expect("destroy");
    }

    #[test]
    fn acquire_blocks_until_another_handle_releases() {
        let (_dir, config) = config();
        let owner = Semaphore::create("slots", 0, &config).expect("create");
        let other = Semaphore::open("slots", &config).expect("open");

        thread::scope(|scope| {
            let acquirer = scope.spawn(|| other.wait_timeout(Duration::from_secs(10)));
            wait_for_blocked(&owner, 1);
            assert!(!acquirer.is_finished());
            owner.signal(1);
            assert!(acquirer.join().expect("acquirer"));
        });
        assert_eq!(owner.value(), 0);
        other.close().expect("close");
        owner.destroy().expect("destroy");
    }

    #[test]
    fn wait_timeout_gives_up_on_empty_semaphore() {
        let (_dir, config) = config();
        let sem = Semaphore::create("slots", 0, &config).expect("create");
        let start = Instant::now();
        assert!(!sem.wait_timeout(Duration::from_millis(60)));
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_eq!(sem.cond.waiter_count(), 0);
    }

    #[test]
    fn signal_many_wakes_that_many() {
        let (_dir, config) = config();
        let sem = Semaphore::create("slots", 0, &config).expect("create");

        thread::scope(|scope| {
            let acquirers: Vec<_> = (0..3)
                .map(|_| scope.spawn(|| sem.wait_timeout(Duration::from_secs(10))))
                .collect();
            wait_for_blocked(&sem, 3);
            sem.signal(3);
            for acquirer in acquirers {
                assert!(acquirer.join().expect("acquirer"));
            }
        });
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn release_without_waiters_accumulates() {
        let (_dir, config) = config();
        let sem = Semaphore::create("slots", 1, &config).expect("create");
        sem.signal(4);
        assert_eq!(sem.value(), 5);
        sem.wait();
        assert_eq!(sem.value(), 4);
    }

    #[test]
    fn truncating_create_resets_count() {
        let (_dir, config) = config();
        Semaphore::create("slots", 1, &config)
            .expect("create")
            .close()
            .expect("close");
        assert!(Semaphore::create("slots", 1, &config).is_err());

        let reset = Semaphore::new("slots", OpenMode::CreateTruncate, 3, &config).expect("reset");
        assert_eq!(reset.value(), 3);
        assert_eq!(Semaphore::open("slots", &config).expect("open").value(), 3);
    }

    #[test]
    fn open_missing_semaphore_fails() {
        let (_dir, config) = config();
        let err = Semaphore::open("absent", &config).err().expect("missing");
        assert!(err.is_not_found(), "{err}");
    }

    #[test]
    fn open_refuses_semaphore_never_marked_ready() {
        let (dir, config) = config();
        create_writable_region(&sem_value_name("half"), OpenMode::CreateOnly, STATE_SIZE, &config)
            .expect("value");

        let err = Semaphore::open("half", &config).err().expect("not ready");
        assert!(matches!(err, SyncError::NotReady { .. }), "{err}");
        assert!(dir.path().join("half.sv").exists(), "opener must not remove objects");
    }

    #[test]
    fn destroy_removes_every_object() {
        let (dir, config) = config();
        let sem = Semaphore::create("slots", 1, &config).expect("create");
        for file in ["slots.sv", "slots.sl", "slots.sc.m", "slots.sc.st"] {
            assert!(dir.path().join(file).exists(), "{file} created");
        }
        sem.destroy().expect("destroy");
        for file in ["slots.sv", "slots.sl", "slots.sc.m", "slots.sc.st"] {
            assert!(!dir.path().join(file).exists(), "{file} removed");
        }
        destroy_semaphore("slots", &config).expect("already gone");
    }
}
