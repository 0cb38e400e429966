//! Binary layout of a shared array region.
//!
//! ```text
//! +-------------------------+  offset 0
//! | header (12 bytes)       |  capacity: u32, elem_size: u32, len: u32
//! +-------------------------+
//! | slots                   |  capacity * elem_size bytes
//! +-------------------------+
//! | index entries           |  capacity * { len: u32, slot: u32 }
//! +-------------------------+
//! | free-slot bitmap        |  ceil(capacity / 64) * u64
//! +-------------------------+
//! | head (4 bytes)          |  u32
//! +-------------------------+
//! ```
//!
//! Every process attaching to the same region must compute identical offsets,
//! so nothing here depends on the mapping address.

use std::mem::size_of;

#[cfg(feature = "loom")]
use loom::sync::atomic::AtomicU32;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicU32;

use crate::{SyncError, SyncResult};

#[repr(C)]
pub(crate) struct ArrayHeader {
    pub(crate) capacity: u32,
    pub(crate) elem_size: u32,
    pub(crate) len: AtomicU32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    pub(crate) len: u32,
    pub(crate) slot: u32,
}

/// Size of the fixed control block at offset 0.
pub const HEADER_SIZE: usize = size_of::<ArrayHeader>();
/// Size of one logical-to-physical index entry.
pub const INDEX_ENTRY_SIZE: usize = size_of::<IndexEntry>();
/// Size of the trailing head field.
pub const HEAD_SIZE: usize = size_of::<u32>();
/// Alignment the region base must satisfy for the header's atomic length.
pub const REGION_ALIGNMENT: usize = std::mem::align_of::<ArrayHeader>();

/// Number of 64-bit bitmap words needed to track `capacity` slots.
pub const fn bitmap_words(capacity: usize) -> usize {
    capacity.div_ceil(64)
}

/// Total bytes required to place an array of `capacity` slots of `elem_size`
/// bytes each.
pub const fn shared_array_size(capacity: usize, elem_size: usize) -> usize {
    HEADER_SIZE + capacity * elem_size + capacity * INDEX_ENTRY_SIZE + bitmap_words(capacity) * 8
        + HEAD_SIZE
}

/// Offsets of every section for one array shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArrayLayout {
    capacity: usize,
    elem_size: usize,
}

impl ArrayLayout {
    /// Validates the shape against the 32-bit header fields.
    pub fn new(capacity: usize, elem_size: usize) -> SyncResult<Self> {
        let invalid = SyncError::InvalidShape {
            capacity,
            elem_size,
        };
        if capacity == 0 || capacity > i32::MAX as usize || elem_size > i32::MAX as usize {
            return Err(invalid);
        }
        // Total size must be representable so offset arithmetic never wraps.
        capacity
            .checked_mul(elem_size.checked_add(INDEX_ENTRY_SIZE).ok_or(invalid)?)
            .and_then(|bytes| bytes.checked_add(HEADER_SIZE + HEAD_SIZE + bitmap_words(capacity) * 8))
            .ok_or(SyncError::InvalidShape {
                capacity,
                elem_size,
            })?;
        Ok(Self {
            capacity,
            elem_size,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn slots_offset(&self) -> usize {
        HEADER_SIZE
    }

    /// Byte offset of physical slot `slot`.
    pub fn slot_offset(&self, slot: usize) -> usize {
        debug_assert!(slot < self.capacity);
        self.slots_offset() + slot * self.elem_size
    }

    pub fn index_offset(&self) -> usize {
        self.slots_offset() + self.capacity * self.elem_size
    }

    /// Byte offset of the index entry stored at table position `pos`.
    pub fn index_entry_offset(&self, pos: usize) -> usize {
        debug_assert!(pos < self.capacity);
        self.index_offset() + pos * INDEX_ENTRY_SIZE
    }

    pub fn bitmap_offset(&self) -> usize {
        self.index_offset() + self.capacity * INDEX_ENTRY_SIZE
    }

    pub fn bitmap_words(&self) -> usize {
        bitmap_words(self.capacity)
    }

    pub fn head_offset(&self) -> usize {
        self.bitmap_offset() + self.bitmap_words() * 8
    }

    pub fn total_size(&self) -> usize {
        self.head_offset() + HEAD_SIZE
    }
}
