//! Bloom filter admission
//!
//! Fixed-size bit array packed into 64-bit words. Writers only ever OR bits in
//! with a per-word atomic, so any number of tasks can insert and probe at once
//! without a lock. Bits are never cleared: a negative answer is definite, a
//! positive one only means "maybe, ask the backend".

use std::sync::atomic::{AtomicU64, Ordering};

/// Hash count used when none is configured
pub const DEFAULT_HASH_COUNT: u32 = 5;

/// Probabilistic set-membership filter
pub struct BloomFilter {
    words: Box<[AtomicU64]>,
    num_bits: usize,
    hash_count: u32,
}

impl BloomFilter {
    /// Size a filter for `expected_items` at the target `false_positive_rate`
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        Self::with_params(
            Self::optimal_bits(expected_items, false_positive_rate),
            DEFAULT_HASH_COUNT,
        )
    }

    /// Create with an explicit bit count and hash count
    pub fn with_params(num_bits: usize, hash_count: u32) -> Self {
        let num_bits = num_bits.max(1);
        let words = (0..num_bits.div_ceil(64))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            words,
            num_bits,
            hash_count: hash_count.max(1),
        }
    }

    /// `m = ceil(-n * ln(p) / ln(2)^2)`
    pub fn optimal_bits(expected_items: usize, false_positive_rate: f64) -> usize {
        let n = expected_items.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * false_positive_rate.ln() / (ln2 * ln2)).ceil();
        (m as usize).max(1)
    }

    /// Add an item
    pub fn put(&self, item: impl AsRef<[u8]>) {
        for bit in self.positions(item.as_ref()) {
            self.words[bit / 64].fetch_or(1u64 << (bit % 64), Ordering::Relaxed);
        }
    }

    /// `false` means the item was definitely never added
    pub fn might_contain(&self, item: impl AsRef<[u8]>) -> bool {
        self.positions(item.as_ref())
            .all(|bit| self.words[bit / 64].load(Ordering::Relaxed) & (1u64 << (bit % 64)) != 0)
    }

    /// `false` only if none of the items might be present
    pub fn might_contain_any<I, T>(&self, items: I) -> bool
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        items.into_iter().any(|item| self.might_contain(item))
    }

    /// Size of the bit array
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// Number of 64-bit words backing the bit array
    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    /// Bit positions set per item
    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Number of set bits
    pub fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    fn positions(&self, bytes: &[u8]) -> impl Iterator<Item = usize> {
        let h1 = rolling_hash(bytes, 0);
        let h2 = rolling_hash(bytes, h1);
        let num_bits = self.num_bits;
        (0..self.hash_count as i32).map(move |i| {
            let combined = h1.wrapping_add(i.wrapping_mul(h2));
            combined.unsigned_abs() as usize % num_bits
        })
    }
}

/// `h = 31 * h + byte`, wrapping at 32 bits, with bytes read as signed
fn rolling_hash(bytes: &[u8], seed: i32) -> i32 {
    bytes
        .iter()
        .fold(seed, |h, &b| h.wrapping_mul(31).wrapping_add(b as i8 as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    #[test]
    fn test_sizing() {
        // 10k items at 1% => 95851 bits
        assert_eq!(BloomFilter::optimal_bits(10_000, 0.01), 95_851);
        let filter = BloomFilter::new(10_000, 0.01);
        assert_eq!(filter.num_words(), 95_851usize.div_ceil(64));
        assert_eq!(filter.hash_count(), DEFAULT_HASH_COUNT);
    }

    #[test]
    fn test_hash_reads_bytes_as_signed() {
        assert_eq!(rolling_hash(&[0xFF], 0), -1);
        assert_eq!(rolling_hash(&[0x80, 0x01], 0), -128 * 31 + 1);
        assert_eq!(rolling_hash("ab".as_bytes(), 0), 97 * 31 + 98);
        // "é" is 0xC3 0xA9 in UTF-8
        assert_eq!(rolling_hash("é".as_bytes(), 0), -61 * 31 - 87);
    }

    #[test]
    fn test_put_then_contains() {
        let filter = BloomFilter::new(100, 0.01);
        assert!(!filter.might_contain("sku-1"));
        filter.put("sku-1");
        assert!(filter.might_contain("sku-1"));
        assert!(filter.count_ones() > 0 && filter.count_ones() <= 5);
    }

    #[test]
    fn test_any_of_collection() {
        let filter = BloomFilter::new(100, 0.01);
        filter.put("b");
        assert!(filter.might_contain_any(["a", "b", "c"]));
        assert!(!filter.might_contain_any(["x", "y"]));
        assert!(!filter.might_contain_any(Vec::<String>::new()));
    }

    #[test]
    fn test_false_positive_rate_near_target() {
        let filter = BloomFilter::new(10_000, 0.01);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..10_000 {
            filter.put(format!("member-{:016x}", rng.gen::<u64>()));
        }
        let probes = 100_000;
        let hits = (0..probes)
            .filter(|_| filter.might_contain(format!("probe-{:016x}", rng.gen::<u64>())))
            .count();
        let rate = hits as f64 / probes as f64;
        assert!(rate > 0.002 && rate < 0.03, "false-positive rate {}", rate);
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let filter = Arc::new(BloomFilter::new(8_000, 0.01));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let filter = filter.clone();
                std::thread::spawn(move || {
                    for i in 0..1_000 {
                        filter.put(format!("t{}-{}", t, i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..8 {
            for i in 0..1_000 {
                assert!(filter.might_contain(format!("t{}-{}", t, i)));
            }
        }
    }

    proptest! {
        #[test]
        fn prop_no_false_negatives(items in proptest::collection::vec(".{0,24}", 1..200)) {
            let filter = BloomFilter::new(items.len(), 0.01);
            for item in &items {
                filter.put(item);
            }
            for item in &items {
                prop_assert!(filter.might_contain(item));
            }
        }
    }
}
