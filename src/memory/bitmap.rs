//! Lock-free atomic bitmap for per-owner clean/dirty tracking.

use std::sync::atomic::{AtomicU64, Ordering};

/// A lock-free bitmap with one bit per index: 0 = clean, 1 = dirty.
///
/// Sized for the whole owner-identifier space when used as the change
/// detection table, so it can be persisted block-for-block without any
/// indirection.
///
/// # Performance
///
/// - `set` / `clear` / `is_set`: O(1)
/// - `count_set`, `to_bytes`: O(n/64)
pub struct AtomicBitmap {
    /// Array of atomic 64-bit words.
    words: Box<[AtomicU64]>,
    /// Total number of bits (may be less than words.len() * 64).
    num_bits: usize,
}

impl AtomicBitmap {
    /// Create a bitmap with every bit clear.
    pub fn new(num_bits: usize) -> Self {
        let num_words = num_bits.div_ceil(64);
        let words: Vec<AtomicU64> = (0..num_words).map(|_| AtomicU64::new(0)).collect();

        Self {
            words: words.into_boxed_slice(),
            num_bits,
        }
    }

    /// Rebuild a bitmap from its little-endian byte image.
    ///
    /// Missing trailing bytes read as clear; bits past `num_bits` are dropped.
    pub fn from_bytes(num_bits: usize, bytes: &[u8]) -> Self {
        let bitmap = Self::new(num_bits);
        for (word_idx, word) in bitmap.words.iter().enumerate() {
            let mut raw = [0u8; 8];
            let start = word_idx * 8;
            if start < bytes.len() {
                let end = (start + 8).min(bytes.len());
                raw[..end - start].copy_from_slice(&bytes[start..end]);
            }
            word.store(u64::from_le_bytes(raw), Ordering::Relaxed);
        }
        bitmap.mask_tail();
        bitmap
    }

    /// Set a bit. Returns the previous value.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    pub fn set(&self, idx: usize) -> bool {
        assert!(idx < self.num_bits, "bit index out of bounds");
        let mask = 1u64 << (idx % 64);
        self.words[idx / 64].fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    /// Clear a bit. Returns the previous value.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    pub fn clear(&self, idx: usize) -> bool {
        assert!(idx < self.num_bits, "bit index out of bounds");
        let mask = 1u64 << (idx % 64);
        self.words[idx / 64].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    /// Check a bit. Out-of-range indices read as clear.
    ///
    /// Note: This is a snapshot and may change immediately after returning.
    pub fn is_set(&self, idx: usize) -> bool {
        if idx >= self.num_bits {
            return false;
        }
        self.words[idx / 64].load(Ordering::Relaxed) & (1u64 << (idx % 64)) != 0
    }

    /// Clear every bit.
    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }

    /// Count set bits.
    pub fn count_set(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Little-endian byte image, `ceil(num_bits / 64) * 8` bytes long.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.words.len() * 8);
        for word in self.words.iter() {
            out.extend_from_slice(&word.load(Ordering::Acquire).to_le_bytes());
        }
        out
    }

    /// Get the total number of bits.
    pub fn capacity(&self) -> usize {
        self.num_bits
    }

    fn mask_tail(&self) {
        let tail = self.num_bits % 64;
        if tail != 0 {
            if let Some(last) = self.words.last() {
                last.fetch_and((1u64 << tail) - 1, Ordering::Relaxed);
            }
        }
    }
}

impl std::fmt::Debug for AtomicBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicBitmap")
            .field("num_bits", &self.num_bits)
            .field("set", &self.count_set())
            .finish()
    }
}
