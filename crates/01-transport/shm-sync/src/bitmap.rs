//! Free-slot bitmap: one bit per physical slot, set while the slot is occupied.
//!
//! Words live inside region bytes at an offset that is not necessarily 8-byte
//! aligned, so every access goes through unaligned loads and stores.

use std::ptr::NonNull;

const WORD_BITS: usize = u64::BITS as usize;

/// Index of the lowest clear bit in `word`, testing bit 0 upwards.
pub(crate) fn lowest_zero_bit(word: u64) -> Option<u32> {
    if word == u64::MAX {
        None
    } else {
        Some((!word).trailing_zeros())
    }
}

pub(crate) struct SlotBitmap {
    base: NonNull<u8>,
    words: usize,
}

impl SlotBitmap {
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `words * 8` bytes while
    /// the bitmap is in use.
    pub(crate) unsafe fn from_raw(base: NonNull<u8>, words: usize) -> Self {
        Self { base, words }
    }

    pub(crate) fn clear_all(&mut self) {
        for idx in 0..self.words {
            self.store(idx, 0);
        }
    }

    /// Lowest clear bit, scanning word by word for one that is not full.
    pub(crate) fn find_first_clear(&self) -> Option<usize> {
        (0..self.words).find_map(|idx| {
            lowest_zero_bit(self.load(idx)).map(|bit| idx * WORD_BITS + bit as usize)
        })
    }

    /// Claims the lowest clear bit.
    pub(crate) fn reserve(&mut self) -> Option<usize> {
        let bit = self.find_first_clear()?;
        self.set(bit);
        Some(bit)
    }

    pub(crate) fn set(&mut self, bit: usize) {
        let (idx, mask) = self.locate(bit);
        self.store(idx, self.load(idx) | mask);
    }

    pub(crate) fn clear(&mut self, bit: usize) {
        let (idx, mask) = self.locate(bit);
        self.store(idx, self.load(idx) & !mask);
    }

    pub(crate) fn is_set(&self, bit: usize) -> bool {
        let (idx, mask) = self.locate(bit);
        self.load(idx) & mask != 0
    }

    #[cfg(test)]
    pub(crate) fn count_set(&self) -> usize {
        (0..self.words)
            .map(|idx| self.load(idx).count_ones() as usize)
            .sum()
    }

    fn locate(&self, bit: usize) -> (usize, u64) {
        let idx = bit / WORD_BITS;
        assert!(idx < self.words, "bit {bit} outside bitmap of {} words", self.words);
        (idx, 1u64 << (bit % WORD_BITS))
    }

    fn word_ptr(&self, idx: usize) -> *mut u64 {
        debug_assert!(idx < self.words);
        unsafe { self.base.as_ptr().add(idx * 8) as *mut u64 }
    }

    fn load(&self, idx: usize) -> u64 {
        unsafe { self.word_ptr(idx).read_unaligned() }
    }

    fn store(&mut self, idx: usize, value: u64) {
        unsafe { self.word_ptr(idx).write_unaligned(value) }
    }
}
