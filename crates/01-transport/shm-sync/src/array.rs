//! Fixed-capacity array placed directly inside a shared region.
//!
//! Elements never move once written: logical order is kept by a circular index
//! table (`logical + head` modulo capacity) that maps each position to a
//! physical slot, and a bitmap tracks which slots are occupied. Popping from
//! either end is O(1), removing from the middle shifts at most half of the
//! index table, and swapping exchanges two index entries. Because slot
//! addresses stay stable while occupied, the array can back futex words or
//! spin locks that other processes address directly.
//!
//! The array is not self-synchronising. Every mutation must happen under a
//! lock all cooperating processes agree on; only [`SharedArray::safe_len`] may
//! be called without one.

use std::ptr::NonNull;

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU32, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU32, Ordering};

use crate::bitmap::SlotBitmap;
use crate::layout::{ArrayHeader, ArrayLayout, IndexEntry, HEADER_SIZE, REGION_ALIGNMENT};
use crate::region::RegionMemory;
use crate::{SyncError, SyncResult};

/// Shared array over a region `R`.
pub struct SharedArray<R: RegionMemory> {
    region: R,
    layout: ArrayLayout,
}

impl<R: RegionMemory> SharedArray<R> {
    /// Initialises a fresh array of `capacity` slots of `elem_size` bytes.
    ///
    /// `region` must be at least [`shared_array_size`](crate::shared_array_size)
    /// bytes. Any previous contents are discarded.
    pub fn create(region: R, capacity: usize, elem_size: usize) -> SyncResult<Self> {
        let layout = ArrayLayout::new(capacity, elem_size)?;
        check_region(&region, layout.total_size())?;

        let mut array = Self { region, layout };
        unsafe {
            // SAFETY: the region holds at least `HEADER_SIZE` bytes at a base
            // aligned for the header, both checked above.
            array.ptr_at(0).cast::<ArrayHeader>().write(ArrayHeader {
                capacity: capacity as u32,
                elem_size: elem_size as u32,
                len: AtomicU32::new(0),
            });
        }
        array.bitmap().clear_all();
        array.set_head(0);
        Ok(array)
    }

    /// Attaches to an array another process already created in `region`.
    ///
    /// Shape is read from the header; nothing is written.
    pub fn open(region: R) -> SyncResult<Self> {
        check_region(&region, HEADER_SIZE)?;
        let (capacity, elem_size) = unsafe {
            // SAFETY: size and alignment checked above.
            let header = &*region.base().as_ptr().cast::<ArrayHeader>();
            (header.capacity as usize, header.elem_size as usize)
        };
        let layout = ArrayLayout::new(capacity, elem_size)?;
        check_region(&region, layout.total_size())?;
        Ok(Self { region, layout })
    }

    /// Current length without synchronisation.
    ///
    /// Only meaningful while holding the lock that serialises mutations.
    pub fn len(&self) -> usize {
        self.header().len.load(Ordering::Relaxed) as usize
    }

    /// Atomic snapshot of the length, safe to take without any lock.
    pub fn safe_len(&self) -> usize {
        self.header().len.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.layout.capacity()
    }

    pub fn elem_size(&self) -> usize {
        self.layout.elem_size()
    }

    pub fn layout(&self) -> ArrayLayout {
        self.layout
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    /// Releases the array view and returns the region it was laid over.
    pub fn into_region(self) -> R {
        self.region
    }

    /// Appends one element built from the concatenation of `parts`.
    ///
    /// Copies at most `elem_size` bytes. A part that does not fit entirely is
    /// copied partially and the remaining parts are skipped. Returns the
    /// number of bytes stored.
    ///
    /// # Panics
    ///
    /// Panics if the array is full.
    pub fn push_back(&mut self, parts: &[&[u8]]) -> usize {
        let len = self.len();
        let capacity = self.capacity();
        assert!(len < capacity, "shared array is full (capacity {capacity})");

        let pos = self.entry_pos(len);
        let slot = self
            .bitmap()
            .reserve()
            .filter(|slot| *slot < capacity)
            .unwrap_or_else(|| panic!("no free slots with length {len} < capacity {capacity}"));

        let dst = self.slot_bytes_mut(slot);
        let mut written = 0usize;
        for part in parts {
            let take = part.len().min(dst.len() - written);
            dst[written..written + take].copy_from_slice(&part[..take]);
            written += take;
            if take < part.len() {
                break;
            }
        }

        self.set_entry(
            pos,
            IndexEntry {
                len: written as u32,
                slot: slot as u32,
            },
        );
        self.header().len.fetch_add(1, Ordering::Release);
        written
    }

    /// Bytes stored at logical position `i`.
    ///
    /// The slice stays valid until the element is removed. Positions at or
    /// beyond [`len`](Self::len) are a caller error and yield whatever the
    /// index table holds.
    pub fn at(&self, i: usize) -> &[u8] {
        debug_assert!(i < self.len(), "index {i} out of range for length {}", self.len());
        let entry = self.entry_at(i);
        let slot = self.checked_slot(entry);
        let len = (entry.len as usize).min(self.elem_size());
        unsafe {
            // SAFETY: `slot < capacity`, so the range lies in the slot section.
            std::slice::from_raw_parts(self.ptr_at(self.layout.slot_offset(slot)), len)
        }
    }

    /// Address of the slot backing logical position `i`.
    ///
    /// Stable until the element is removed, regardless of later swaps or
    /// removals of other elements.
    pub fn slot_ptr(&self, i: usize) -> NonNull<u8> {
        debug_assert!(i < self.len(), "index {i} out of range for length {}", self.len());
        let slot = self.checked_slot(self.entry_at(i));
        unsafe { NonNull::new_unchecked(self.ptr_at(self.layout.slot_offset(slot))) }
    }

    /// Iterates the stored bytes in logical order.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.len()).map(move |i| self.at(i))
    }

    /// Removes the first element.
    ///
    /// # Panics
    ///
    /// Panics if the array is empty.
    pub fn pop_front(&mut self) {
        assert!(!self.is_empty(), "pop_front on empty shared array");
        self.free_slot(self.head());
        self.forward_head();
        self.header().len.fetch_sub(1, Ordering::Release);
    }

    /// Removes the last element.
    ///
    /// # Panics
    ///
    /// Panics if the array is empty.
    pub fn pop_back(&mut self) {
        let len = self.len();
        assert!(len > 0, "pop_back on empty shared array");
        self.free_slot(self.entry_pos(len - 1));
        if len == 1 {
            self.set_head(0);
        }
        self.header().len.fetch_sub(1, Ordering::Release);
    }

    /// Removes the element at logical position `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= len()`.
    pub fn remove_at(&mut self, i: usize) {
        self.remove_and_compact(i);
    }

    /// Exchanges the elements at logical positions `i` and `j` without moving
    /// their bytes.
    ///
    /// # Panics
    ///
    /// Panics if either index is out of range.
    pub fn swap(&mut self, i: usize, j: usize) {
        let len = self.len();
        assert!(
            i < len && j < len,
            "swap({i}, {j}) out of range for length {len}"
        );
        if i == j {
            return;
        }
        let (pi, pj) = (self.entry_pos(i), self.entry_pos(j));
        let (ei, ej) = (self.entry(pi), self.entry(pj));
        self.set_entry(pi, ej);
        self.set_entry(pj, ei);
    }

    /// Removes `i` by closing the gap from whichever end is nearer and
    /// returns how many index entries moved.
    fn remove_and_compact(&mut self, i: usize) -> usize {
        let len = self.len();
        assert!(i < len, "index {i} out of range for length {len}");

        self.free_slot(self.entry_pos(i));
        let shifted = if i <= (len - 1) / 2 {
            // Slide the prefix one step towards `i`, then drop the old front.
            for j in (1..=i).rev() {
                let prev = self.entry(self.entry_pos(j - 1));
                self.set_entry(self.entry_pos(j), prev);
            }
            self.forward_head();
            i
        } else {
            for j in i..len - 1 {
                let next = self.entry(self.entry_pos(j + 1));
                self.set_entry(self.entry_pos(j), next);
            }
            len - 1 - i
        };
        self.header().len.fetch_sub(1, Ordering::Release);
        shifted
    }

    fn forward_head(&mut self) {
        if self.len() == 1 {
            self.set_head(0);
        } else {
            self.set_head((self.head() + 1) % self.capacity());
        }
    }

    fn free_slot(&mut self, pos: usize) {
        let slot = self.checked_slot(self.entry(pos));
        let mut bitmap = self.bitmap();
        debug_assert!(bitmap.is_set(slot), "freeing unoccupied slot {slot}");
        bitmap.clear(slot);
    }

    fn entry_pos(&self, logical: usize) -> usize {
        (logical + self.head()) % self.capacity()
    }

    fn entry_at(&self, logical: usize) -> IndexEntry {
        self.entry(self.entry_pos(logical))
    }

    fn checked_slot(&self, entry: IndexEntry) -> usize {
        let slot = entry.slot as usize;
        assert!(
            slot < self.capacity(),
            "corrupt index entry: slot {slot} >= capacity {}",
            self.capacity()
        );
        slot
    }

    fn header(&self) -> &ArrayHeader {
        unsafe { &*self.ptr_at(0).cast::<ArrayHeader>() }
    }

    pub(crate) fn head(&self) -> usize {
        let head = unsafe {
            self.ptr_at(self.layout.head_offset())
                .cast::<u32>()
                .read_unaligned()
        };
        head as usize % self.capacity()
    }

    fn set_head(&mut self, head: usize) {
        unsafe {
            self.ptr_at(self.layout.head_offset())
                .cast::<u32>()
                .write_unaligned(head as u32)
        }
    }

    pub(crate) fn entry(&self, pos: usize) -> IndexEntry {
        unsafe {
            self.ptr_at(self.layout.index_entry_offset(pos))
                .cast::<IndexEntry>()
                .read_unaligned()
        }
    }

    fn set_entry(&mut self, pos: usize, entry: IndexEntry) {
        unsafe {
            self.ptr_at(self.layout.index_entry_offset(pos))
                .cast::<IndexEntry>()
                .write_unaligned(entry)
        }
    }

    fn slot_bytes_mut(&mut self, slot: usize) -> &mut [u8] {
        let elem_size = self.elem_size();
        unsafe {
            // SAFETY: callers pass `slot < capacity`; the slot is exclusively
            // ours under the mutation lock.
            std::slice::from_raw_parts_mut(self.ptr_at(self.layout.slot_offset(slot)), elem_size)
        }
    }

    pub(crate) fn bitmap(&self) -> SlotBitmap {
        unsafe {
            // SAFETY: the bitmap section lies inside the checked region.
            SlotBitmap::from_raw(
                NonNull::new_unchecked(self.ptr_at(self.layout.bitmap_offset())),
                self.layout.bitmap_words(),
            )
        }
    }

    fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.region.size());
        unsafe { self.region.base().as_ptr().add(offset) }
    }
}

fn check_region<R: RegionMemory>(region: &R, required: usize) -> SyncResult<()> {
    let addr = region.base().as_ptr() as usize;
    if addr % REGION_ALIGNMENT != 0 {
        return Err(SyncError::Misaligned {
            addr,
            alignment: REGION_ALIGNMENT,
        });
    }
    if region.size() < required {
        return Err(SyncError::RegionTooSmall {
            required,
            actual: region.size(),
        });
    }
    Ok(())
}
