//! Wake handles embedded in waiter-list slots.
//!
//! Each blocked caller owns exactly one slot of the condition variable's
//! shared array and parks on a futex word stored in it. A signaler in another
//! process attaches to the same slot through its own mapping and flips the
//! state word before waking.

use std::ptr::NonNull;
use std::time::{Duration, Instant};

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU32, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU32, Ordering};

use crate::wait::{wait_u32, wake_all, WaitResult};

/// Wake-handle capability consumed by [`Cond`](crate::Cond).
pub trait Waiter: Sized {
    /// Bytes each record occupies in its slot.
    const RECORD_SIZE: usize;

    /// Writes a fresh, unsignaled record into `slot`.
    ///
    /// # Safety
    ///
    /// `slot` must point at `RECORD_SIZE` writable bytes, aligned to 4, that
    /// stay allocated and occupied until [`Waiter::destroy`] is called.
    unsafe fn init(slot: NonNull<u8>) -> Self;

    /// Attaches to a record another caller initialised.
    ///
    /// # Safety
    ///
    /// Same as [`Waiter::init`], and the record must already be initialised.
    unsafe fn attach(slot: NonNull<u8>) -> Self;

    /// Blocks until signaled.
    fn wait(&self);

    /// Blocks until signaled or `timeout` elapses; returns true when signaled.
    fn wait_timeout(&self, timeout: Duration) -> bool;

    /// Wakes the waiter. Returns true only for the call that performed the wake.
    fn signal(&self) -> bool;

    /// Whether this handle's record lives at `slot`.
    fn is_same(&self, slot: NonNull<u8>) -> bool;

    /// Releases the handle's wake resources.
    fn destroy(self);
}

const WAITING: u32 = 0;
const SIGNALED: u32 = 1;
const ABANDONED: u32 = 2;

#[repr(C)]
struct WaiterRecord {
    state: AtomicU32,
    pid: u32,
}

/// Futex-backed waiter.
///
/// A timed-out waiter moves its record to `ABANDONED` so that a concurrent
/// signal skips it and wakes the next entry instead.
pub struct FutexWaiter {
    record: NonNull<WaiterRecord>,
}

impl FutexWaiter {
    fn record(&self) -> &WaiterRecord {
        // SAFETY: guaranteed live by the `init`/`attach` contract.
        unsafe { self.record.as_ref() }
    }

    fn state(&self) -> &AtomicU32 {
        &self.record().state
    }

    /// Process id of the caller that registered this record.
    pub fn pid(&self) -> u32 {
        self.record().pid
    }

    fn park(&self, deadline: Option<Instant>) -> bool {
        let state = self.state();
        loop {
            match state.load(Ordering::Acquire) {
                SIGNALED => return true,
                WAITING => {}
                other => panic!("waiter record in unexpected state {other}"),
            }
            let timeout = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => Some(left),
                    _ => return self.abandon(),
                },
                None => None,
            };
            if let WaitResult::Failed(errno) = wait_u32(state, WAITING, timeout) {
                panic!("futex wait on waiter record failed (errno {errno})");
            }
        }
    }

    /// Gives up waiting; false unless a signal won the race.
    fn abandon(&self) -> bool {
        self.state()
            .compare_exchange(WAITING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
    }
}

impl Waiter for FutexWaiter {
    const RECORD_SIZE: usize = std::mem::size_of::<WaiterRecord>();

    unsafe fn init(slot: NonNull<u8>) -> Self {
        debug_assert_eq!(slot.as_ptr() as usize % std::mem::align_of::<WaiterRecord>(), 0);
        let record = slot.cast::<WaiterRecord>();
        record.as_ptr().write(WaiterRecord {
            state: AtomicU32::new(WAITING),
            pid: std::process::id(),
        });
        Self { record }
    }

    unsafe fn attach(slot: NonNull<u8>) -> Self {
        debug_assert_eq!(slot.as_ptr() as usize % std::mem::align_of::<WaiterRecord>(), 0);
        Self {
            record: slot.cast(),
        }
    }

    fn wait(&self) {
        self.park(None);
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.park(Some(deadline)),
            None => self.park(None),
        }
    }

    fn signal(&self) -> bool {
        let state = self.state();
        if state
            .compare_exchange(WAITING, SIGNALED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        wake_all(state);
        true
    }

    fn is_same(&self, slot: NonNull<u8>) -> bool {
        self.record.cast::<u8>() == slot
    }

    fn destroy(self) {
        // Nothing outside the slot; the array frees the slot itself.
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[repr(C, align(8))]
    struct Slot([u8; 8]);

    struct SharedSlot(std::cell::UnsafeCell<Slot>);

    unsafe impl Sync for SharedSlot {}
    unsafe impl Send for SharedSlot {}

    impl SharedSlot {
        fn new() -> Arc<Self> {
            Arc::new(Self(std::cell::UnsafeCell::new(Slot([0xFF; 8]))))
        }

        fn ptr(&self) -> NonNull<u8> {
            NonNull::new(self.0.get().cast::<u8>()).expect("non-null")
        }
    }

    #[test]
    fn record_fits_waiter_slot() {
        assert_eq!(FutexWaiter::RECORD_SIZE, 8);
    }

    #[test]
    fn signal_is_idempotent() {
        let slot = SharedSlot::new();
        let waiter = unsafe { FutexWaiter::init(slot.ptr()) };
        assert_eq!(waiter.pid(), std::process::id());
        let remote = unsafe { FutexWaiter::attach(slot.ptr()) };
        assert!(remote.signal());
        assert!(!remote.signal());
        assert!(waiter.wait_timeout(Duration::from_secs(1)), "already signaled");
        waiter.destroy();
    }

    #[test]
    fn identity_is_slot_address() {
        let a = SharedSlot::new();
        let b = SharedSlot::new();
        let waiter = unsafe { FutexWaiter::init(a.ptr()) };
        assert!(waiter.is_same(a.ptr()));
        assert!(!waiter.is_same(b.ptr()));
    }

    #[test]
    fn timed_out_waiter_refuses_late_signal() {
        let slot = SharedSlot::new();
        let waiter = unsafe { FutexWaiter::init(slot.ptr()) };
        let start = Instant::now();
        assert!(!waiter.wait_timeout(Duration::from_millis(40)));
        assert!(start.elapsed() >= Duration::from_millis(40));
        let late = unsafe { FutexWaiter::attach(slot.ptr()) };
        assert!(!late.signal(), "abandoned record must be skipped");
    }

    #[test]
    fn signal_from_other_thread_wakes_blocked_waiter() {
        let slot = SharedSlot::new();
        let waiter = unsafe { FutexWaiter::init(slot.ptr()) };
        let remote_slot = slot.clone();
        let signaler = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let remote = unsafe { FutexWaiter::attach(remote_slot.ptr()) };
            remote.signal()
        });
        waiter.wait();
        assert!(signaler.join().expect("signaler"));
    }
}
