//! Cross-process condition variable.
//!
//! Waiters register a record in a shared array (`<name>.st`) guarded by a
//! named list mutex (`<name>.m`), then release the caller's lock and park on
//! their record. Signalers walk the same array under the list mutex and flip
//! records until enough of them report a wake.
//!
//! Lock order is always caller lock, then list mutex. Signalers may hold the
//! caller lock or not; they never take it while holding the list mutex.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::CleanupErrors;
use crate::mutex::{destroy_mutex, IpcLock, NamedMutex, NamedMutexGuard};
use crate::naming::{cond_mutex_name, cond_state_name, validate_name};
use crate::region::{RawRegion, SharedRegion};
use crate::shm::{create_writable_region, destroy_memory_object, OpenMode};
use crate::waiter::{FutexWaiter, Waiter};
use crate::{shared_array_size, SharedArray, ShmConfig, SyncResult};

/// How long `open` waits for a concurrent creator to publish the list header.
const HEADER_WAIT: Duration = Duration::from_millis(500);
const HEADER_POLL: Duration = Duration::from_millis(1);

/// Condition variable shared by every process that opens the same name.
///
/// All cooperating processes must use the same
/// [`max_cond_waiters`](ShmConfig::max_cond_waiters).
pub struct Cond<L: IpcLock, W: Waiter = FutexWaiter> {
    locker: L,
    list_lock: NamedMutex,
    name: String,
    config: ShmConfig,
    waiters: UnsafeCell<SharedArray<SharedRegion>>,
    /// Read-only view of the same bytes, used for lock-free length reads.
    len_view: SharedArray<RawRegion>,
    _waiter: PhantomData<fn() -> W>,
}

// SAFETY: `waiters` is only reached through `WaiterList`, which holds the list
// mutex for as long as the mutable borrow lives. `len_view` only performs
// atomic header loads.
unsafe impl<L: IpcLock, W: Waiter> Sync for Cond<L, W> {}

/// Exclusive view of the waiter array while the list mutex is held.
struct WaiterList<'a> {
    array: &'a mut SharedArray<SharedRegion>,
    _guard: NamedMutexGuard<'a>,
}

impl Deref for WaiterList<'_> {
    type Target = SharedArray<SharedRegion>;

    fn deref(&self) -> &Self::Target {
        self.array
    }
}

impl DerefMut for WaiterList<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.array
    }
}

impl<L: IpcLock, W: Waiter> Cond<L, W> {
    /// Creates or attaches to the condition variable called `name`.
    ///
    /// When this call creates the shared state it also removes any stale list
    /// mutex left behind by a previous owner, so a crash while holding that
    /// mutex cannot wedge the new instance.
    ///
    /// The creator publishes the list header only after its list mutex
    /// exists. A caller attaching to existing state polls for that header for
    /// up to half a second before opening the mutex, and fails with
    /// [`SyncError::InvalidShape`](crate::SyncError::InvalidShape) if it
    /// never appears.
    pub fn new(name: &str, mode: OpenMode, locker: L, config: &ShmConfig) -> SyncResult<Self> {
        validate_name(name)?;
        let capacity = config.max_cond_waiters as usize;
        let size = shared_array_size(capacity, W::RECORD_SIZE);
        let state_name = cond_state_name(name);
        let mutex_name = cond_mutex_name(name);

        let (region, created) = create_writable_region(&state_name, mode, size, config)
            .map_err(|err| err.context("failed to create shared state"))?;

        match Self::attach_list(region, created, &mutex_name, mode, capacity, config) {
            Ok((list_lock, waiters, len_view)) => {
                tracing::debug!(created, capacity, "opened cond {name:?}");
                Ok(Self {
                    locker,
                    list_lock,
                    name: name.to_owned(),
                    config: config.clone(),
                    waiters: UnsafeCell::new(waiters),
                    len_view,
                    _waiter: PhantomData,
                })
            }
            Err(err) if created => {
                let mut cleanup = CleanupErrors::new();
                cleanup.record(destroy_mutex(&mutex_name, config), "remove partial list mutex");
                cleanup.record(
                    destroy_memory_object(&state_name, config),
                    "remove partial shared state",
                );
                Err(cleanup.finish_after(err))
            }
            Err(err) => Err(err),
        }
    }

    /// Creates the condition variable, failing if its state already exists.
    pub fn create(name: &str, locker: L, config: &ShmConfig) -> SyncResult<Self> {
        Self::new(name, OpenMode::CreateOnly, locker, config)
    }

    /// Attaches to an existing condition variable.
    pub fn open(name: &str, locker: L, config: &ShmConfig) -> SyncResult<Self> {
        Self::new(name, OpenMode::OpenOnly, locker, config)
    }

    fn attach_list(
        region: SharedRegion,
        created: bool,
        mutex_name: &str,
        mode: OpenMode,
        capacity: usize,
        config: &ShmConfig,
    ) -> SyncResult<(NamedMutex, SharedArray<SharedRegion>, SharedArray<RawRegion>)> {
        let (list_lock, waiters) = if created {
            destroy_mutex(mutex_name, config)
                .map_err(|err| err.context("failed to remove stale list mutex"))?;
            let list_lock = NamedMutex::new(mutex_name, mode, config)
                .map_err(|err| err.context("failed to obtain list mutex"))?;
            let waiters = SharedArray::create(region, capacity, W::RECORD_SIZE)
                .map_err(|err| err.context("failed to lay out waiter list"))?;
            (list_lock, waiters)
        } else {
            let waiters = Self::open_published(region)
                .map_err(|err| err.context("failed to lay out waiter list"))?;
            let list_lock = NamedMutex::new(mutex_name, mode, config)
                .map_err(|err| err.context("failed to obtain list mutex"))?;
            (list_lock, waiters)
        };
        // SAFETY: stored next to `waiters`, which owns the mapping, and
        // dropped before it in `close_into`.
        let len_view = SharedArray::open(unsafe { waiters.region().raw_view() })?;
        if waiters.capacity() != capacity || waiters.elem_size() != W::RECORD_SIZE {
            tracing::warn!(
                capacity = waiters.capacity(),
                elem_size = waiters.elem_size(),
                expected = capacity,
                "waiter list shape differs from local configuration"
            );
        }
        Ok((list_lock, waiters, len_view))
    }

    /// Opens the list once its creator has written the header.
    fn open_published(region: SharedRegion) -> SyncResult<SharedArray<SharedRegion>> {
        let deadline = Instant::now() + HEADER_WAIT;
        loop {
            // SAFETY: the view is dropped before `region` moves.
            let ready = matches!(
                SharedArray::open(unsafe { region.raw_view() }),
                Ok(view) if view.elem_size() == W::RECORD_SIZE
            );
            if ready || Instant::now() >= deadline {
                break;
            }
            thread::sleep(HEADER_POLL);
        }
        SharedArray::open(region)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The caller-supplied lock released while waiting.
    pub fn locker(&self) -> &L {
        &self.locker
    }

    /// Number of registered waiters, read without the list mutex.
    pub fn waiter_count(&self) -> usize {
        self.len_view.safe_len()
    }

    /// Releases the caller's lock, blocks until signaled, then reacquires it.
    ///
    /// The caller must hold the lock.
    ///
    /// # Panics
    ///
    /// Panics if the waiter list already holds `max_cond_waiters` entries.
    pub fn wait(&self) {
        self.do_wait(None);
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`. Returns true
    /// when woken by a signal or broadcast.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.do_wait(Some(timeout))
    }

    /// Wakes one waiter, if any.
    pub fn signal(&self) {
        let list = self.list();
        Self::signal_n(&list, 1);
    }

    /// Wakes every waiter registered when the list mutex was taken.
    pub fn broadcast(&self) {
        let list = self.list();
        let len = list.len();
        Self::signal_n(&list, len);
    }

    /// Releases this handle's mapping and lock handles, including the caller
    /// lock it owns. Shared objects stay.
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
        tracing::debug!("closing cond {:?}", self.name);
        let Self {
            locker,
            list_lock,
            waiters,
            len_view,
            ..
        } = self;
        drop(len_view);
        cleanup.record(locker.close(), "failed to close caller lock");
        cleanup.record(list_lock.close(), "failed to close list mutex");
        cleanup.record(
            waiters.into_inner().into_region().close(),
            "failed to close waiter list region",
        );
    }

    fn list(&self) -> WaiterList<'_> {
        let guard = self.list_lock.guard();
        WaiterList {
            // SAFETY: the list mutex serialises every mutable borrow across
            // threads and processes; no other borrow outlives its guard.
            array: unsafe { &mut *self.waiters.get() },
            _guard: guard,
        }
    }

    fn do_wait(&self, timeout: Option<Duration>) -> bool {
        let waiter = self.register();
        self.locker.unlock();
        let woken = match timeout {
            Some(timeout) => waiter.wait_timeout(timeout),
            None => {
                waiter.wait();
                true
            }
        };
        self.locker.lock();
        self.unregister(waiter);
        woken
    }

    fn register(&self) -> W {
        let mut list = self.list();
        let (len, capacity) = (list.len(), list.capacity());
        assert!(
            len < capacity,
            "too many waiters on cond {:?} (max {capacity})",
            self.name
        );
        // The record is written in place by `init`.
        list.push_back(&[]);
        let slot = list.slot_ptr(len);
        tracing::trace!(position = len, "registered waiter on {:?}", self.name);
        // SAFETY: the slot is 4-aligned, `RECORD_SIZE` bytes, and stays
        // occupied until `unregister` removes it.
        unsafe { W::init(slot) }
    }

    fn unregister(&self, waiter: W) {
        let mut list = self.list();
        match (0..list.len()).find(|&i| waiter.is_same(list.slot_ptr(i))) {
            Some(i) => {
                list.remove_at(i);
                tracing::trace!(position = i, "removed waiter from {:?}", self.name);
            }
            None => tracing::warn!("waiter record missing from {:?}", self.name),
        }
        waiter.destroy();
    }

    /// Signals entries front to back until `count` of them wake.
    fn signal_n(list: &WaiterList<'_>, count: usize) -> usize {
        let mut woken = 0;
        for i in 0..list.len() {
            if woken >= count {
                break;
            }
            // SAFETY: occupied slots hold records initialised by `register`.
            let waiter = unsafe { W::attach(list.slot_ptr(i)) };
            if waiter.signal() {
                woken += 1;
            }
        }
        tracing::trace!(requested = count, woken, "signaled waiters");
        woken
    }
}

/// Removes the shared objects of condition variable `name` without a handle.
///
/// Every removal is attempted; missing objects are not errors.
pub fn destroy_cond(name: &str, config: &ShmConfig) -> SyncResult<()> {
    validate_name(name)?;
    let mut cleanup = CleanupErrors::new();
    remove_objects(name, config, &mut cleanup);
    cleanup.finish()
}

fn remove_objects(name: &str, config: &ShmConfig, cleanup: &mut CleanupErrors) {
    cleanup.record(
        destroy_mutex(&cond_mutex_name(name), config),
        "failed to destroy list mutex",
    );
    cleanup.record(
        destroy_memory_object(&cond_state_name(name), config),
        "failed to destroy shared state",
    );
    tracing::debug!("destroyed cond {name:?}");
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn config() -> (tempfile::TempDir, ShmConfig) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ShmConfig::with_dir(dir.path()).max_cond_waiters(8);
        (dir, config)
    }

    fn wait_for_waiters<L: IpcLock>(cond: &Cond<L>, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while cond.waiter_count() != expected {
            assert!(Instant::now() < deadline, "waiters never reached {expected}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn wait_timeout_without_signal_leaves_list_empty() {
        let (_dir, config) = config();
        let lock = NamedMutex::create("guard", &config).expect("lock");
        let cond = Cond::<_>::create("cv", &lock, &config).expect("cond");

        lock.lock();
        let start = Instant::now();
        assert!(!cond.wait_timeout(Duration::from_millis(100)));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(!lock.try_lock(), "caller lock is held again on return");
        lock.unlock();
        assert_eq!(cond.waiter_count(), 0);
    }

    #[test]
    fn signal_wakes_one_then_broadcast_the_rest() {
        let (_dir, config) = config();
        let lock = NamedMutex::create("guard", &config).expect("lock");
        let cond = Cond::<_>::create("cv", &lock, &config).expect("cond");

        thread::scope(|scope| {
            let waiters: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        let _held = lock.guard();
                        cond.wait_timeout(Duration::from_secs(10))
                    })
                })
                .collect();
            wait_for_waiters(&cond, 2);

            cond.signal();
            let deadline = Instant::now() + Duration::from_secs(5);
            while waiters.iter().filter(|w| w.is_finished()).count() < 1 {
                assert!(Instant::now() < deadline, "signal woke nobody");
                thread::sleep(Duration::from_millis(1));
            }
            thread::sleep(Duration::from_millis(50));
            assert_eq!(waiters.iter().filter(|w| w.is_finished()).count(), 1);
            wait_for_waiters(&cond, 1);

            cond.broadcast();
            for waiter in waiters {
                assert!(waiter.join().expect("waiter"), "woken, not timed out");
            }
        });
        assert_eq!(cond.waiter_count(), 0);
    }

    #[test]
    fn waiter_count_reads_while_list_is_held() {
        let (_dir, config) = config();
        let lock = NamedMutex::create("guard", &config).expect("lock");
        let cond = Cond::<_>::create("cv", &lock, &config).expect("cond");

        let mut list = cond.list();
        list.push_back(&[]);
        assert_eq!(cond.waiter_count(), 1);
        list.pop_back();
        assert_eq!(cond.waiter_count(), 0);
    }

    #[test]
    fn open_waits_for_creator_to_publish_header() {
        let (_dir, config) = config();
        let lock = NamedMutex::create("guard", &config).expect("lock");
        let capacity = config.max_cond_waiters as usize;
        let size = shared_array_size(capacity, FutexWaiter::RECORD_SIZE);
        // State sized and zeroed, list mutex and header still missing.
        let (state, created) =
            create_writable_region(&cond_state_name("cv"), OpenMode::CreateOnly, size, &config)
                .expect("state");
        assert!(created);

        thread::scope(|scope| {
            let opener = scope.spawn(|| Cond::<_>::open("cv", &lock, &config));
            thread::sleep(Duration::from_millis(50));
            let list_lock = NamedMutex::create(&cond_mutex_name("cv"), &config).expect("list mutex");
            let waiters =
                SharedArray::create(state, capacity, FutexWaiter::RECORD_SIZE).expect("header");

            let cond = opener.join().expect("opener").expect("open after header");
            assert_eq!(cond.waiter_count(), 0);
            cond.signal();
            cond.destroy().expect("destroy");
            drop((list_lock, waiters));
        });
    }

    #[test]
    fn open_gives_up_on_unpublished_header() {
        let (_dir, config) = config();
        let lock = NamedMutex::create("guard", &config).expect("lock");
        let size = shared_array_size(config.max_cond_waiters as usize, FutexWaiter::RECORD_SIZE);
        let (_state, _) =
            create_writable_region(&cond_state_name("cv"), OpenMode::CreateOnly, size, &config)
                .expect("state");

        let start = Instant::now();
        let err = Cond::<_>::open("cv", &lock, &config).err().expect("never published");
        assert!(start.elapsed() >= HEADER_WAIT);
        match &err {
            crate::SyncError::Context { source, .. } => assert!(
                matches!(**source, crate::SyncError::InvalidShape { capacity: 0, .. }),
                "{err}"
            ),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn signal_without_waiters_is_noop() {
        let (_dir, config) = config();
        let lock = NamedMutex::create("guard", &config).expect("lock");
        let cond = Cond::<_>::create("cv", &lock, &config).expect("cond");
        cond.signal();
        cond.broadcast();
        assert_eq!(cond.waiter_count(), 0);
    }

    #[test]
    fn create_replaces_stale_list_mutex() {
        let (_dir, config) = config();
        let stale = NamedMutex::create(&cond_mutex_name("cv"), &config).expect("stale");
        stale.lock();
        drop(stale);

        let lock = NamedMutex::create("guard", &config).expect("lock");
        let cond = Cond::<_>::create("cv", &lock, &config).expect("cond");
        cond.signal();
        cond.destroy().expect("destroy");
    }

    #[test]
    fn open_attaches_to_existing_state() {
        let (_dir, config) = config();
        let lock = NamedMutex::create("guard", &config).expect("lock");
        let first = Cond::<_>::create("cv", &lock, &config).expect("create");
        let second = Cond::<_>::open("cv", &lock, &config).expect("open");
        assert_eq!(second.name(), "cv");
        assert!(Cond::<_>::create("cv", &lock, &config).is_err());

        thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let _held = lock.guard();
                first.wait_timeout(Duration::from_secs(10))
            });
            wait_for_waiters(&second, 1);
            second.signal();
            assert!(waiter.join().expect("waiter"));
        });
        second.close().expect("close");
        first.destroy().expect("destroy");
    }

    #[test]
    fn open_missing_cond_fails() {
        let (_dir, config) = config();
        let lock = NamedMutex::create("guard", &config).expect("lock");
        let err = Cond::<_>::open("absent", &lock, &config).err().expect("missing");
        assert!(err.is_not_found(), "{err}");
    }

    #[test]
    fn destroy_removes_both_objects() {
        let (dir, config) = config();
        let lock = NamedMutex::create("guard", &config).expect("lock");
        let cond = Cond::<_>::create("cv", &lock, &config).expect("cond");
        assert!(dir.path().join("cv.m").exists());
        assert!(dir.path().join("cv.st").exists());
        cond.destroy().expect("destroy");
        assert!(!dir.path().join("cv.m").exists());
        assert!(!dir.path().join("cv.st").exists());
        destroy_cond("cv", &config).expect("already gone");
    }

    #[test]
    #[should_panic(expected = "too many waiters")]
    fn overflowing_waiter_list_panics() {
        let (_dir, config) = config();
        let config = config.max_cond_waiters(1);
        let lock = NamedMutex::create("guard", &config).expect("lock");
        let cond = Cond::<_>::create("cv", &lock, &config).expect("cond");

        thread::scope(|scope| {
            scope.spawn(|| {
                let _held = lock.guard();
                cond.wait_timeout(Duration::from_millis(500));
            });
            wait_for_waiters(&cond, 1);
            let _held = lock.guard();
            cond.wait();
        });
    }
}
