//! Dense small-integer allocator with bitmap tracking (§4.2).
//!
//! Ported from the bit-twiddling in `ircd/keyspace.c`: a page-at-a-time bitmap, a
//! binary search within the first page that has a free bit, and an optional growth
//! callback so an embedding component (here, [`crate::ancillary::AncillaryStore`])
//! can keep a parallel array sized in fixed chunks.

use std::sync::atomic::{AtomicU32, Ordering};

const BITS_PER_WORD: u32 = u32::BITS;

/// Invalid key sentinel, returned when a keyspace is exhausted.
pub const KEY_INVALID: u32 = u32::MAX;

/// Callback invoked when the external/parallel array needs to grow.
pub trait GrowHook: Send + Sync {
    fn grow(&self, new_extern_size: u32);
}

impl<F: Fn(u32) + Send + Sync> GrowHook for F {
    fn grow(&self, new_extern_size: u32) {
        (self)(new_extern_size)
    }
}

/// A bitmap-backed allocator of dense `u32` keys.
pub struct Keyspace {
    bitmap: Vec<u32>,
    count: u32,
    highest: u32,
    max: u32,
    extern_size: u32,
    chunk: u32,
    grow: Option<Box<dyn GrowHook>>,
}

impl Keyspace {
    /// `max == 0` means unbounded (besides `u32` range itself).
    /// `chunk == 0` disables the growth-callback feature entirely.
    pub fn new(max: u32, chunk: u32, grow: Option<Box<dyn GrowHook>>) -> Self {
        Self { bitmap: Vec::new(), count: 0, highest: 0, max, extern_size: 0, chunk, grow }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn highest(&self) -> u32 {
        self.highest
    }

    fn effective_max(&self) -> u32 {
        if self.max == 0 {
            KEY_INVALID
        } else {
            self.max
        }
    }

    /// Reserve the lowest-numbered free key, or `KEY_INVALID` if the keyspace is at
    /// its configured maximum.
    pub fn reserve(&mut self) -> u32 {
        if self.count >= self.effective_max() {
            return KEY_INVALID;
        }

        let key = if self.count == self.bitmap.len() as u32 * BITS_PER_WORD {
            // Every existing page is full; append a fresh page and take its first bit.
            self.bitmap.push(0);
            self.count
        } else {
            // Binary search within the first page that has a free bit.
            let page_idx = self
                .bitmap
                .iter()
                .position(|&page| page != u32::MAX)
                .expect("count < alloc*BITS implies a free bit exists");
            let page = self.bitmap[page_idx];
            let mut alloc = !page;
            let mut bit = 0u32;
            let mut mask: u32 = u32::MAX;
            let mut b = BITS_PER_WORD >> 1;
            while b > 0 {
                mask >>= b;
                if alloc & mask == 0 {
                    alloc >>= b;
                    bit += b;
                }
                b >>= 1;
            }
            page_idx as u32 * BITS_PER_WORD + bit
        };

        self.count += 1;
        let word = (key / BITS_PER_WORD) as usize;
        let bit = key % BITS_PER_WORD;
        self.bitmap[word] |= 1 << bit;

        if key >= self.highest {
            self.highest = key + 1;
            if self.chunk > 0 {
                if let Some(hook) = &self.grow {
                    if self.highest > self.extern_size {
                        self.extern_size += self.chunk;
                        hook.grow(self.extern_size);
                    }
                }
            }
        }

        key
    }

    /// Clear a previously reserved key. Releasing an unheld key is a no-op.
    pub fn release(&mut self, key: u32) {
        let word = (key / BITS_PER_WORD) as usize;
        if word >= self.bitmap.len() {
            return;
        }
        let bit = key % BITS_PER_WORD;
        if self.bitmap[word] & (1 << bit) != 0 {
            self.bitmap[word] &= !(1 << bit);
            self.count -= 1;
        }
    }

    pub fn is_held(&self, key: u32) -> bool {
        let word = (key / BITS_PER_WORD) as usize;
        word < self.bitmap.len() && self.bitmap[word] & (1 << (key % BITS_PER_WORD)) != 0
    }

    /// Drop all allocated bookkeeping; the keyspace must not be reused without a
    /// fresh `Keyspace::new`.
    pub fn clean(&mut self) {
        self.bitmap.clear();
        self.count = 0;
        self.highest = 0;
        self.extern_size = 0;
    }
}

/// Lock-free single-counter keyspace for the common case of "just give me unique
/// small ids, no reuse needed" — used by the engine for generator handles where
/// release-and-reuse would complicate ref-counting for no benefit.
#[derive(Debug, Default)]
pub struct Counter(AtomicU32);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_is_dense_and_reuses_released_keys() {
        let mut ks = Keyspace::new(0, 0, None);
        let a = ks.reserve();
        let b = ks.reserve();
        let c = ks.reserve();
        assert_eq!((a, b, c), (0, 1, 2));
        ks.release(b);
        assert_eq!(ks.count(), 2);
        let reused = ks.reserve();
        assert_eq!(reused, 1, "released key should be the next one reserved");
    }

    #[test]
    fn reserve_respects_max() {
        let mut ks = Keyspace::new(2, 0, None);
        assert_ne!(ks.reserve(), KEY_INVALID);
        assert_ne!(ks.reserve(), KEY_INVALID);
        assert_eq!(ks.reserve(), KEY_INVALID);
    }

    #[test]
    fn grow_hook_fires_in_chunk_multiples() {
        use std::sync::{Arc, Mutex};
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let mut ks = Keyspace::new(0, 4, Some(Box::new(move |n: u32| seen2.lock().unwrap().push(n))));
        for _ in 0..10 {
            ks.reserve();
        }
        let calls = seen.lock().unwrap().clone();
        // highest watermark crosses 4 and 8 within 10 reserves (keys 0..=9)
        assert_eq!(calls, vec![4, 8, 12]);
    }

    #[test]
    fn no_double_allocation_across_many_reserves() {
        let mut ks = Keyspace::new(0, 0, None);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let k = ks.reserve();
            assert!(seen.insert(k), "key {k} allocated twice");
        }
    }

    #[test]
    fn release_does_not_shrink_bitmap() {
        let mut ks = Keyspace::new(0, 0, None);
        for _ in 0..40 {
            ks.reserve();
        }
        let pages_before = ks.bitmap.len();
        for k in 0..40 {
            ks.release(k);
        }
        assert_eq!(ks.bitmap.len(), pages_before);
    }
}
