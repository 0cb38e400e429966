//! Deterministic names for the auxiliary resources of condition variables
//! and semaphores.
//!
//! Independent processes rendezvous purely by agreeing on a base name; every
//! derived name is a pure function of it.

use crate::{SyncError, SyncResult};

/// Name of the internal list lock guarding a condition variable's waiters.
pub fn cond_mutex_name(name: &str) -> String {
    format!("{name}.m")
}

/// Name of the memory object holding a condition variable's waiter list.
pub fn cond_state_name(name: &str) -> String {
    format!("{name}.st")
}

/// Name of the memory object holding a semaphore's count.
pub fn sem_value_name(name: &str) -> String {
    format!("{name}.sv")
}

/// Name of the mutex serialising a semaphore's count.
pub fn sem_lock_name(name: &str) -> String {
    format!("{name}.sl")
}

/// Base name of the condition variable semaphore waiters block on.
pub fn sem_cond_name(name: &str) -> String {
    format!("{name}.sc")
}

/// Checks that `name` can be used as a single path component.
pub fn validate_name(name: &str) -> SyncResult<()> {
    let reason = if name.is_empty() {
        Some("name is empty")
    } else if name == "." || name == ".." {
        Some("name is a directory alias")
    } else if name.contains('/') {
        Some("name contains '/'")
    } else if name.contains('\0') {
        Some("name contains NUL")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(SyncError::InvalidName {
            name: name.to_owned(),
            reason,
        }),
        None => Ok(()),
    }
}
