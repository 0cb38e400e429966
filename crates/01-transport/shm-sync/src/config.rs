//! Process-level settings shared by every named object this crate opens.

use std::env;
use std::path::{Path, PathBuf};

use crate::naming::validate_name;
use crate::SyncResult;

/// Environment variable overriding the directory named objects live in.
pub const SHM_DIR_ENV: &str = "SHM_SYNC_DIR";
/// Permission bits applied to newly created objects.
pub const DEFAULT_PERMISSIONS: u32 = 0o644;
/// Waiter slots reserved per condition variable.
pub const DEFAULT_MAX_COND_WAITERS: u32 = 128;

#[cfg(target_os = "linux")]
const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// Where named objects live and how they are shaped.
///
/// Every process cooperating on one named object must use the same `dir` and
/// `max_cond_waiters`; neither is recorded or checked at runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShmConfig {
    pub dir: PathBuf,
    pub permissions: u32,
    pub max_cond_waiters: u32,
}

impl ShmConfig {
    /// Reads [`SHM_DIR_ENV`], falling back to the platform default.
    pub fn from_env() -> Self {
        let dir = env::var_os(SHM_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(default_dir);
        Self::with_dir(dir)
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            permissions: DEFAULT_PERMISSIONS,
            max_cond_waiters: DEFAULT_MAX_COND_WAITERS,
        }
    }

    pub fn permissions(mut self, permissions: u32) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn max_cond_waiters(mut self, max: u32) -> Self {
        self.max_cond_waiters = max;
        self
    }

    /// Filesystem path of the object called `name`.
    pub fn path_for(&self, name: &str) -> SyncResult<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(name))
    }
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn default_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let shm = Path::new(DEFAULT_SHM_DIR);
        if shm.is_dir() {
            return shm.to_path_buf();
        }
    }
    env::temp_dir()
}
