//! A fixed-size bitmap, used to track which swap slots are in use.

use alloc::{boxed::Box, vec};

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    words: Box<[u64]>,
    bits: usize,
}

impl Bitmap {
    /// Creates a bitmap of `bits` bits, all clear.
    pub fn new(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(WORD_BITS)].into_boxed_slice(),
            bits,
        }
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn test(&self, idx: usize) -> bool {
        assert!(idx < self.bits, "bit {idx} out of range ({} bits)", self.bits);
        (self.words[idx / WORD_BITS] >> (idx % WORD_BITS)) & 1 != 0
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.bits, "bit {idx} out of range ({} bits)", self.bits);
        let mask = 1 << (idx % WORD_BITS);
        if value {
            self.words[idx / WORD_BITS] |= mask;
        } else {
            self.words[idx / WORD_BITS] &= !mask;
        }
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Finds the first clear bit, sets it, and returns its index.
    ///
    /// Returns `None` and leaves the bitmap untouched if every bit is set.
    pub fn scan_and_flip(&mut self) -> Option<usize> {
        let (word_idx, word) = self
            .words
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)?;
        let idx = word_idx * WORD_BITS + word.trailing_ones() as usize;
        // The last word may have clear bits past the end of the map.
        if idx >= self.bits {
            return None;
        }
        *word |= 1 << (idx % WORD_BITS);
        Some(idx)
    }
}
