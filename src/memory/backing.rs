//! Host storage behind guest pages
//!
//! Stored as `AtomicU32` words so cores running in parallel can access the
//! same guest page without a lock and without host-level data races. Sub-word
//! stores merge into their word with a CAS loop.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use super::{PAGE_BITS, PAGE_SIZE};

pub struct Backing {
    words: Box<[AtomicU32]>,
    /// Per-page "translated code lives here" flag
    code: Box<[AtomicBool]>,
}

impl Backing {
    /// Allocate zeroed storage; `size` is rounded up to whole pages
    pub fn new(size: usize) -> Arc<Self> {
        let pages = size.div_ceil(PAGE_SIZE as usize).max(1);
        let words = (0..pages * (PAGE_SIZE as usize / 4))
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let code = (0..pages)
            .map(|_| AtomicBool::new(false))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Backing { words, code })
    }

    pub fn len(&self) -> usize {
        self.words.len() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    #[inline(always)]
    pub fn load8(&self, offset: usize) -> u8 {
        let word = self.words[offset >> 2].load(Ordering::Relaxed);
        (word >> ((offset & 3) * 8)) as u8
    }

    #[inline(always)]
    pub fn load16(&self, offset: usize) -> u16 {
        if offset & 1 == 0 {
            let word = self.words[offset >> 2].load(Ordering::Relaxed);
            (word >> ((offset & 3) * 8)) as u16
        } else {
            self.load8(offset) as u16 | (self.load8(offset + 1) as u16) << 8
        }
    }

    #[inline(always)]
    pub fn load32(&self, offset: usize) -> u32 {
        if offset & 3 == 0 {
            self.words[offset >> 2].load(Ordering::Relaxed)
        } else {
            (0..4).fold(0u32, |acc, i| acc | (self.load8(offset + i) as u32) << (i * 8))
        }
    }

    #[inline(always)]
    pub fn store8(&self, offset: usize, value: u8) {
        self.merge(offset, 0xFF, value as u32);
    }

    #[inline(always)]
    pub fn store16(&self, offset: usize, value: u16) {
        if offset & 1 == 0 {
            self.merge(offset, 0xFFFF, value as u32);
        } else {
            self.store8(offset, value as u8);
            self.store8(offset + 1, (value >> 8) as u8);
        }
    }

    #[inline(always)]
    pub fn store32(&self, offset: usize, value: u32) {
        if offset & 3 == 0 {
            self.words[offset >> 2].store(value, Ordering::Relaxed);
        } else {
            for i in 0..4 {
                self.store8(offset + i, (value >> (i * 8)) as u8);
            }
        }
    }

    /// Sequentially consistent CAS on an aligned word
    pub fn compare_exchange32(&self, offset: usize, expected: u32, new: u32) -> Result<u32, u32> {
        debug_assert_eq!(offset & 3, 0);
        self.words[offset >> 2].compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    pub fn read_into(&self, offset: usize, out: &mut [u8]) {
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.load8(offset + i);
        }
    }

    pub fn write_from(&self, offset: usize, data: &[u8]) {
        let mut i = 0;
        // Leading bytes up to word alignment, whole words, then the tail
        while i < data.len() && (offset + i) & 3 != 0 {
            self.store8(offset + i, data[i]);
            i += 1;
        }
        while i + 4 <= data.len() {
            let word = u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
            self.words[(offset + i) >> 2].store(word, Ordering::Relaxed);
            i += 4;
        }
        while i < data.len() {
            self.store8(offset + i, data[i]);
            i += 1;
        }
    }

    #[inline(always)]
    pub fn is_code(&self, offset: usize) -> bool {
        self.code[offset >> PAGE_BITS].load(Ordering::SeqCst)
    }

    pub fn mark_code(&self, offset: usize) {
        self.code[offset >> PAGE_BITS].store(true, Ordering::SeqCst);
    }

    /// Clear the code flag, returning whether it was set
    #[inline(always)]
    pub fn take_code(&self, offset: usize) -> bool {
        self.code[offset >> PAGE_BITS].swap(false, Ordering::SeqCst)
    }

    #[inline(always)]
    fn merge(&self, offset: usize, mask: u32, value: u32) {
        let shift = (offset & 3) * 8;
        let mask = mask << shift;
        let bits = value << shift;
        let _ = self.words[offset >> 2].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |word| {
            Some((word & !mask) | bits)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_word_stores_merge() {
        let backing = Backing::new(PAGE_SIZE as usize);
        backing.store32(0, 0x1122_3344);
        backing.store8(1, 0xAA);
        assert_eq!(backing.load32(0), 0x1122_AA44);
        backing.store16(2, 0xBEEF);
        assert_eq!(backing.load32(0), 0xBEEF_AA44);
    }

    #[test]
    fn test_unaligned_word_access() {
        let backing = Backing::new(PAGE_SIZE as usize);
        backing.store32(5, 0xDEAD_BEEF);
        assert_eq!(backing.load32(5), 0xDEAD_BEEF);
        assert_eq!(backing.load8(5), 0xEF);
        assert_eq!(backing.load16(7), 0xDEAD);
    }

    #[test]
    fn test_code_flag() {
        let backing = Backing::new(2 * PAGE_SIZE as usize);
        assert!(!backing.is_code(0x1004));
        backing.mark_code(0x1000);
        assert!(backing.is_code(0x1FFF));
        assert!(!backing.is_code(0x0FFF));
        assert!(backing.take_code(0x1000));
        assert!(!backing.take_code(0x1000));
    }
}
