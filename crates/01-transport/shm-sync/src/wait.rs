//! Atomic wait/notify shims usable across process boundaries.
//!
//! Waiters park on a 32-bit word that lives in a `MAP_SHARED` mapping, so the
//! futex calls must use shared (non-private) keys: the kernel then matches
//! waiters and wakers by the underlying page rather than the virtual address,
//! and two processes mapping the object at different addresses still meet.

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU32, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Result of attempting to wait on an atomic location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The caller was woken, possibly spuriously.
    Ok,
    /// The value no longer matched when the wait was attempted.
    NotEqual,
    /// The wait timed out before a notify was observed.
    TimedOut,
    /// A signal handler interrupted the wait.
    Interrupted,
    /// The kernel rejected the wait with this errno.
    Failed(i32),
}

#[cfg(feature = "loom")]
mod imp {
    use super::{AtomicU32, Duration, WaitResult};

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitResult {
        let _ = (atomic, expected, timeout);
        WaitResult::NotEqual
    }

    #[inline]
    pub(crate) fn wake(atomic: &AtomicU32, count: i32) -> u32 {
        let _ = (atomic, count);
        0
    }
}

#[cfg(all(not(feature = "loom"), any(target_os = "linux", target_os = "android")))]
mod imp {
    use super::{AtomicU32, Duration, WaitResult};

    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitResult {
        let timespec = timeout.map(|timeout| libc::timespec {
            tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        });
        let timespec_ptr = timespec
            .as_ref()
            .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

        // SAFETY: `atomic` is a valid, aligned u32 for the duration of the call;
        // FUTEX_WAIT only reads it. The timeout is relative.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                atomic.as_ptr(),
                libc::FUTEX_WAIT,
                expected,
                timespec_ptr,
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if ret == 0 {
            return WaitResult::Ok;
        }
        from_errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    pub(crate) fn from_errno(errno: i32) -> WaitResult {
        match errno {
            libc::EAGAIN => WaitResult::NotEqual,
            libc::ETIMEDOUT => WaitResult::TimedOut,
            libc::EINTR => WaitResult::Interrupted,
            other => WaitResult::Failed(other),
        }
    }

    pub(crate) fn wake(atomic: &AtomicU32, count: i32) -> u32 {
        // SAFETY: FUTEX_WAKE only uses the address as a key.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                atomic.as_ptr(),
                libc::FUTEX_WAKE,
                count,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        ret.max(0) as u32
    }
}

/// Blocks while `atomic` holds `expected`, until woken or `timeout` elapses.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[inline]
pub fn wait_u32(atomic: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitResult {
    imp::wait_u32(atomic, expected, timeout)
}

/// Wakes at most one waiter parked on `atomic`, returning how many woke.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[inline]
pub fn wake_one(atomic: &AtomicU32) -> u32 {
    imp::wake(atomic, 1)
}

/// Wakes all waiters parked on `atomic`, returning how many woke.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[inline]
pub fn wake_all(atomic: &AtomicU32) -> u32 {
    imp::wake(atomic, i32::MAX)
}

/// Convenience helper that captures the current value and waits for a change.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[inline]
pub fn wait_for_change(atomic: &AtomicU32, order: Ordering, timeout: Option<Duration>) -> WaitResult {
    let expected = atomic.load(order);
    wait_u32(atomic, expected, timeout)
}

#[cfg(all(test, not(feature = "loom"), any(target_os = "linux", target_os = "android")))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn mismatched_value_returns_immediately() {
        let word = AtomicU32::new(3);
        assert_eq!(wait_u32(&word, 4, None), WaitResult::NotEqual);
    }

    #[test]
    fn timeout_elapses() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        let result = wait_u32(&word, 0, Some(Duration::from_millis(30)));
        assert_eq!(result, WaitResult::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wake_releases_parked_thread() {
        let word = Arc::new(AtomicU32::new(0));
        let parked = word.clone();
        let waiter = thread::spawn(move || {
            while parked.load(Ordering::Acquire) == 0 {
                wait_u32(&parked, 0, Some(Duration::from_secs(5)));
            }
        });
        thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        wake_all(&word);
        waiter.join().expect("waiter thread");
    }

    #[test]
    fn unexpected_errno_is_reported() {
        assert_eq!(imp::from_errno(libc::EAGAIN), WaitResult::NotEqual);
        assert_eq!(imp::from_errno(libc::EINVAL), WaitResult::Failed(libc::EINVAL));
        assert_eq!(imp::from_errno(libc::ENOSYS), WaitResult::Failed(libc::ENOSYS));
    }

    #[test]
    fn wake_without_waiters_is_harmless() {
        let word = AtomicU32::new(0);
        assert_eq!(wake_one(&word), 0);
        assert_eq!(wait_for_change(&word, Ordering::Relaxed, Some(Duration::from_millis(1))), WaitResult::TimedOut);
    }
}
