//! Shared-memory synchronisation primitives for cooperating processes.
//!
//! This crate exposes the pieces unrelated processes need to coordinate through
//! memory they all map:
//! * [`SharedArray`] – fixed-capacity circular array laid over raw region bytes,
//!   reattachable by any process without reinitialisation.
//! * [`SharedRegion`] / [`MemoryObject`] – owned byte arenas and the named
//!   objects that back them.
//! * [`NamedMutex`] – futex mutex addressed by name, the reference [`IpcLock`].
//! * [`Cond`] – condition variable whose waiter list lives in a [`SharedArray`].
//! * [`Semaphore`] – named counting semaphore built on a [`Cond`].
//! * [`SyncError`] – environment failures during setup and teardown.

mod array;
mod bitmap;
mod config;
mod error;
mod layout;
pub mod naming;
mod region;
mod shm;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod cond;
#[cfg(any(target_os = "linux", target_os = "android"))]
mod mutex;
#[cfg(any(target_os = "linux", target_os = "android"))]
mod semaphore;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod wait;
#[cfg(any(target_os = "linux", target_os = "android"))]
mod waiter;

pub use array::SharedArray;
pub use config::{ShmConfig, DEFAULT_MAX_COND_WAITERS, DEFAULT_PERMISSIONS, SHM_DIR_ENV};
pub use error::{SyncError, SyncResult};
pub use layout::{shared_array_size, ArrayLayout};
pub use naming::{
    cond_mutex_name, cond_state_name, sem_cond_name, sem_lock_name, sem_value_name, validate_name,
};
pub use region::{RawRegion, RegionMemory, SharedRegion};
pub use shm::{create_writable_region, destroy_memory_object, MemoryObject, OpenMode};

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use cond::{destroy_cond, Cond};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use mutex::{destroy_mutex, IpcLock, NamedMutex, NamedMutexGuard};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use semaphore::{destroy_semaphore, Semaphore};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use waiter::{FutexWaiter, Waiter};
