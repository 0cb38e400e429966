//! Named shared-memory objects.
//!
//! An object is a file in the configured shared directory; mapping it with
//! `MAP_SHARED` gives every process that opens the same name the same bytes.
//! Creation, sizing, and unlinking are keyed by name only.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::region::SharedRegion;
use crate::{ShmConfig, SyncError, SyncResult};

/// How to treat an existing (or missing) object when opening it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Create a new object; fail if one already exists.
    CreateOnly,
    /// Attach to an existing object; fail if it is missing.
    OpenOnly,
    /// Attach if present, otherwise create.
    OpenOrCreate,
    /// Create, discarding the contents of any existing object.
    CreateTruncate,
}

/// Open handle to a named memory object.
#[derive(Debug)]
pub struct MemoryObject {
    file: File,
    name: String,
    path: PathBuf,
}

impl MemoryObject {
    /// Opens `name` according to `mode`, returning whether this call created it.
    pub fn open(name: &str, mode: OpenMode, config: &ShmConfig) -> SyncResult<(Self, bool)> {
        let path = config.path_for(name)?;
        let opened = match mode {
            OpenMode::CreateOnly => create_new(&path, config).map(|file| (file, true)),
            OpenMode::OpenOnly => open_existing(&path).map(|file| (file, false)),
            OpenMode::CreateTruncate => {
                let mut options = writable();
                options.create(true).truncate(true);
                set_mode(&mut options, config.permissions);
                options.open(&path).map(|file| (file, true))
            }
            OpenMode::OpenOrCreate => match create_new(&path, config) {
                Ok(file) => Ok((file, true)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    open_existing(&path).map(|file| (file, false))
                }
                Err(err) => Err(err),
            },
        };
        let (file, created) = opened.map_err(|err| SyncError::io("open", name, err))?;

        Ok((
            Self {
                file,
                name: name.to_owned(),
                path,
            },
            created,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current size of the object in bytes.
    pub fn size(&self) -> SyncResult<u64> {
        self.file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| SyncError::io("stat", &self.name, err))
    }

    /// Resizes the object; new bytes read as zero.
    pub fn truncate(&self, len: u64) -> SyncResult<()> {
        self.file
            .set_len(len)
            .map_err(|err| SyncError::io("truncate", &self.name, err))
    }

    /// Maps the whole object read-write and shared.
    pub fn map(&self) -> SyncResult<SharedRegion> {
        let map = unsafe {
            // SAFETY: the object is only ever resized by `truncate`, which
            // cooperating processes call before anyone maps it.
            memmap2::MmapMut::map_mut(&self.file)
        }
        .map_err(|err| SyncError::io("map", &self.name, err))?;
        Ok(SharedRegion::from_mmap(map))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Unlinks the object called `name`. A missing object is not an error.
pub fn destroy_memory_object(name: &str, config: &ShmConfig) -> SyncResult<()> {
    let path = config.path_for(name)?;
    match fs::remove_file(&path) {
        Ok(()) => {
            tracing::debug!("destroyed memory object {name:?}");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SyncError::io("unlink", name, err)),
    }
}

/// Opens or creates `name` and maps at least `size` bytes of it.
///
/// A created object is sized to exactly `size`; an attached one must already
/// be at least that large. If this call created the object and a later step
/// fails, the object is unlinked again.
pub fn create_writable_region(
    name: &str,
    mode: OpenMode,
    size: usize,
    config: &ShmConfig,
) -> SyncResult<(SharedRegion, bool)> {
    let (object, created) = MemoryObject::open(name, mode, config)?;
    let result = map_sized(&object, created, size);
    if result.is_err() && created {
        if let Err(err) = destroy_memory_object(name, config) {
            tracing::warn!("failed to remove partially created {name:?}: {err}");
        }
    }
    result.map(|region| (region, created))
}

fn map_sized(object: &MemoryObject, created: bool, size: usize) -> SyncResult<SharedRegion> {
    if created {
        object.truncate(size as u64)?;
    } else {
        let actual = object.size()? as usize;
        if actual < size {
            return Err(SyncError::RegionTooSmall {
                required: size,
                actual,
            });
        }
    }
    object.map()
}

fn writable() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.read(true).write(true);
    options
}

fn create_new(path: &Path, config: &ShmConfig) -> io::Result<File> {
    let mut options = writable();
    options.create_new(true);
    set_mode(&mut options, config.permissions);
    options.open(path)
}

fn open_existing(path: &Path) -> io::Result<File> {
    writable().open(path)
}

#[cfg(unix)]
fn set_mode(options: &mut OpenOptions, permissions: u32) {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(permissions);
}

#[cfg(not(unix))]
fn set_mode(_options: &mut OpenOptions, _permissions: u32) {}
