//! Error handling helpers for the shared-memory sync crate.
//!
//! Only environment failures are surfaced as values: undersized or misaligned
//! regions, bad names, and OS errors while creating, opening, or removing
//! named objects. Contract violations by a cooperating process (index out of
//! range, pushing into a full array, too many waiters) panic instead.

use std::io;

use thiserror::Error;

/// Convenience result alias for fallible sync operations.
pub type SyncResult<T, E = SyncError> = Result<T, E>;

/// Errors surfaced while setting up or tearing down shared sync state.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid array shape: capacity {capacity}, element size {elem_size}")]
    InvalidShape { capacity: usize, elem_size: usize },

    #[error("region of {actual} bytes is smaller than the {required} bytes required")]
    RegionTooSmall { required: usize, actual: usize },

    #[error("region base {addr:#x} is not aligned to {alignment} bytes")]
    Misaligned { addr: usize, alignment: usize },

    #[error("invalid object name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("{name:?} was never initialised by its creator")]
    NotReady { name: String },

    #[error("{op} {name:?}: {source}")]
    Io {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Context {
        context: &'static str,
        #[source]
        source: Box<SyncError>,
    },

    #[error("{} cleanup step(s) failed: {}", .0.len(), join_messages(.0))]
    Cleanup(Vec<SyncError>),
}

impl SyncError {
    pub fn io(op: &'static str, name: impl Into<String>, source: io::Error) -> Self {
        SyncError::Io {
            op,
            name: name.into(),
            source,
        }
    }

    /// Wraps `self` with a short description of the step that failed.
    pub fn context(self, context: &'static str) -> Self {
        SyncError::Context {
            context,
            source: Box::new(self),
        }
    }

    /// Returns true when the underlying OS error reports a missing object.
    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            SyncError::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

fn join_messages(errors: &[SyncError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Accumulates failures from best-effort release paths.
///
/// Every step is attempted; `finish` reports nothing, the single failure, or
/// all of them bundled in [`SyncError::Cleanup`].
#[derive(Debug, Default)]
pub(crate) struct CleanupErrors {
    errors: Vec<SyncError>,
}

impl CleanupErrors {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, result: SyncResult<()>, context: &'static str) {
        if let Err(err) = result {
            tracing::warn!("{context}: {err}");
            self.errors.push(err.context(context));
        }
    }

    /// Reports `primary` together with any failures recorded while undoing
    /// the work that led to it.
    pub(crate) fn finish_after(mut self, primary: SyncError) -> SyncError {
        if self.errors.is_empty() {
            return primary;
        }
        self.errors.insert(0, primary);
        SyncError::Cleanup(self.errors)
    }

    pub(crate) fn finish(mut self) -> SyncResult<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(SyncError::Cleanup(self.errors)),
        }
    }
}
