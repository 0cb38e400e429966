//! Byte arenas backing shared arrays and named locks.
//!
//! A [`SharedRegion`] owns a mapping: a file-backed `MAP_SHARED` view of a
//! named object, or a zero-filled anonymous mapping for structures that only
//! threads of one process share. [`RawRegion`] is a borrowed view used when a
//! second attachment to the same bytes lives in the same process.

use std::ptr::NonNull;

use memmap2::{MmapMut, MmapOptions};

use crate::{SyncError, SyncResult};

/// Memory that a shared structure can be laid over.
///
/// # Safety
///
/// Implementors must guarantee that `base()` is valid for reads and writes of
/// `size()` bytes for as long as the value is alive, and that the address does
/// not change while it is alive.
pub unsafe trait RegionMemory {
    fn base(&self) -> NonNull<u8>;
    fn size(&self) -> usize;
}

/// Owned mapping backing shared arrays and locks.
///
/// Mappings are page aligned, which satisfies every structure in this crate.
#[derive(Debug)]
pub struct SharedRegion {
    map: MmapMut,
}

// SAFETY: the region is plain memory whose concurrent use is coordinated by
// the structures laid over it, the same way other processes share it.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Maps `len` private zero-filled bytes.
    pub fn anonymous(len: usize) -> SyncResult<Self> {
        if len == 0 {
            return Err(SyncError::RegionTooSmall {
                required: 1,
                actual: 0,
            });
        }
        let map = MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|err| SyncError::io("map", "anonymous region", err))?;
        Ok(Self { map })
    }

    /// Wraps an existing mapping, typically of a named memory object.
    pub fn from_mmap(map: MmapMut) -> Self {
        Self { map }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Borrowed view over the same bytes, for a second attachment in-process.
    ///
    /// # Safety
    ///
    /// The view must not outlive `self`.
    pub unsafe fn raw_view(&self) -> RawRegion {
        RawRegion::from_raw(self.map.as_ptr() as *mut u8, self.map.len())
    }

    /// Unmaps the region, flushing it first. Unlike a plain drop this reports
    /// a failed flush.
    pub fn close(self) -> SyncResult<()> {
        self.map
            .flush()
            .map_err(|err| SyncError::io("flush", "mapped region", err))
    }
}

unsafe impl RegionMemory for SharedRegion {
    fn base(&self) -> NonNull<u8> {
        // SAFETY: a live mapping never starts at address zero.
        unsafe { NonNull::new_unchecked(self.map.as_ptr() as *mut u8) }
    }

    fn size(&self) -> usize {
        self.map.len()
    }
}

/// Non-owning view of region bytes.
#[derive(Clone, Copy, Debug)]
pub struct RawRegion {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: see `SharedRegion`; the view carries no ownership.
unsafe impl Send for RawRegion {}
unsafe impl Sync for RawRegion {}

impl RawRegion {
    /// # Safety
    ///
    /// `base` must be non-null and valid for reads and writes of `len` bytes
    /// for as long as this view, or any structure built on it, is in use.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        Self {
            base: NonNull::new_unchecked(base),
            len,
        }
    }
}

unsafe impl RegionMemory for RawRegion {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn size(&self) -> usize {
        self.len
    }
}
