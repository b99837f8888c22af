use fastbloom::BloomFilter;
use serde::Serialize;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicUsize, Ordering};

const FALSE_POSITIVE_RATE: f64 = 0.001;

/// Bloom filter over the key hashes of one sealed page.  Counts hits and
/// misses, so the usefulness of filtering can be observed per window.
#[derive(Debug)]
pub struct PageFilter {
    bloom_filter: BloomFilter,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

/// Statistics about page filters.
///
/// Statistics add up, so the filters of all pages of a table can be
/// summarized; the sum loses the hit rates of individual pages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BloomFilterStats {
    /// Filter size in bytes.
    pub size_byte: usize,
    pub hits: usize,
    pub misses: usize,
}

impl Add for BloomFilterStats {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self::Output {
        self.add_assign(rhs);
        self
    }
}

impl AddAssign for BloomFilterStats {
    fn add_assign(&mut self, rhs: Self) {
        self.size_byte += rhs.size_byte;
        self.hits += rhs.hits;
        self.misses += rhs.misses;
    }
}

impl Sum for BloomFilterStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

impl PageFilter {
    /// Builds a filter containing `hashes`.
    pub fn build<I>(hashes: I) -> Self
    where
        I: ExactSizeIterator<Item = u64>,
    {
        let mut bloom_filter =
            BloomFilter::with_false_pos(FALSE_POSITIVE_RATE).expected_items(hashes.len().max(1));
        for hash in hashes {
            bloom_filter.insert_hash(hash);
        }
        Self {
            bloom_filter,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> BloomFilterStats {
        BloomFilterStats {
            size_byte: size_of_val(&self.bloom_filter) + self.bloom_filter.num_bits() / 8,
            hits: self.hits.load(Ordering::Acquire),
            misses: self.misses.load(Ordering::Acquire),
        }
    }

    /// Returns `false` only if no key with `hash` is on the page.
    pub fn contains_hash(&self, hash: u64) -> bool {
        let is_hit = self.bloom_filter.contains_hash(hash);
        if is_hit {
            self.hits.fetch_add(1, Ordering::Release);
        } else {
            self.misses.fetch_add(1, Ordering::Release);
        }
        is_hit
    }
}
