//! Concurrent build side of a windowed hash join.

use super::bloom::BloomFilterStats;
use super::page::{FixedPage, JoinEntry, PageAllocator, RecordSlot};
use crate::error::Result;
use crate::hash::default_hash;
use crate::utils::lock;
use arc_swap::ArcSwapOption;
use crossbeam_utils::CachePadded;
use serde::Serialize;
use slicer_types::InsertStrategy;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

struct Bucket<K, V> {
    /// Newest page.  Older pages hang off its `next` pointer.
    head: ArcSwapOption<FixedPage<K, V>>,
    /// Only taken by the locking strategy.
    lock: Mutex<()>,
    pages: AtomicUsize,
}

impl<K, V> Default for Bucket<K, V> {
    fn default() -> Self {
        Self {
            head: ArcSwapOption::empty(),
            lock: Mutex::new(()),
            pages: AtomicUsize::new(0),
        }
    }
}

/// Size of a hash table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HashTableStats {
    pub buckets: usize,
    pub pages: usize,
    pub records: usize,
    /// Length of the longest page list.
    pub max_bucket_pages: usize,
}

/// A partitioned hash table that many workers insert into concurrently.
///
/// Keys are distributed over a power-of-two number of buckets, each a list
/// of [`FixedPage`]s.  Inserting reserves a slot in the bucket's newest
/// page; when that page is full, a new page is linked in front of it.
/// How racing inserters agree on the new page is decided by the
/// [`InsertStrategy`]; both strategies produce the same set of records.
pub struct StreamJoinHashTable<K, V> {
    buckets: Box<[CachePadded<Bucket<K, V>>]>,
    mask: usize,
    strategy: InsertStrategy,
    allocator: PageAllocator,
}

impl<K, V> Debug for StreamJoinHashTable<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamJoinHashTable")
            .field("buckets", &self.buckets.len())
            .field("strategy", &self.strategy)
            .field("pages", &self.num_pages())
            .finish()
    }
}

impl<K, V> StreamJoinHashTable<K, V> {
    /// Creates a table with at least `buckets` buckets.
    pub fn new(buckets: usize, strategy: InsertStrategy, allocator: PageAllocator) -> Self {
        let buckets = buckets.max(1).next_power_of_two();
        Self {
            buckets: (0..buckets)
                .map(|_| CachePadded::new(Bucket::default()))
                .collect(),
            mask: buckets - 1,
            strategy,
            allocator,
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn strategy(&self) -> InsertStrategy {
        self.strategy
    }

    fn bucket_of_hash(&self, hash: u64) -> usize {
        hash as usize & self.mask
    }

    /// Pages of bucket `bucket`, newest first.
    pub fn bucket_pages(&self, bucket: usize) -> Vec<Arc<FixedPage<K, V>>> {
        let mut pages = Vec::new();
        let mut page = self.buckets[bucket].head.load_full();
        while let Some(current) = page {
            page = current.next().cloned();
            pages.push(current);
        }
        pages
    }

    pub fn num_pages(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.pages.load(Ordering::Acquire))
            .sum()
    }

    /// Number of reserved slots.
    pub fn num_records(&self) -> usize {
        (0..self.buckets.len())
            .flat_map(|bucket| self.bucket_pages(bucket))
            .map(|page| page.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.num_records() == 0
    }

    pub fn statistics(&self) -> HashTableStats {
        let mut stats = HashTableStats {
            buckets: self.buckets.len(),
            ..HashTableStats::default()
        };
        for bucket in 0..self.buckets.len() {
            let pages = self.bucket_pages(bucket);
            stats.pages += pages.len();
            stats.records += pages.iter().map(|page| page.len()).sum::<usize>();
            stats.max_bucket_pages = stats.max_bucket_pages.max(pages.len());
        }
        stats
    }

    fn reserve(&self, bucket: &Bucket<K, V>) -> Result<(Arc<FixedPage<K, V>>, usize)> {
        match self.strategy {
            InsertStrategy::Locking => self.reserve_locking(bucket),
            InsertStrategy::LockFree => self.reserve_lock_free(bucket),
        }
    }

    fn reserve_locking(&self, bucket: &Bucket<K, V>) -> Result<(Arc<FixedPage<K, V>>, usize)> {
        let _guard = lock(&bucket.lock);
        loop {
            let head = bucket.head.load_full();
            if let Some(page) = &head {
                if let Some(index) = page.try_reserve() {
                    return Ok((page.clone(), index));
                }
            }
            let page = self.allocator.allocate(head)?;
            bucket.head.store(Some(page));
            bucket.pages.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn reserve_lock_free(
        &self,
        bucket: &Bucket<K, V>,
    ) -> Result<(Arc<FixedPage<K, V>>, usize)> {
        loop {
            let head = bucket.head.load_full();
            if let Some(page) = &head {
                if let Some(index) = page.try_reserve() {
                    return Ok((page.clone(), index));
                }
            }

            let page = self.allocator.allocate(head.clone())?;
            let previous = bucket.head.compare_and_swap(&head, Some(page));
            let published = match (&*previous, &head) {
                (Some(previous), Some(head)) => Arc::ptr_eq(previous, head),
                (None, None) => true,
                _ => false,
            };
            if published {
                bucket.pages.fetch_add(1, Ordering::AcqRel);
            } else {
                // Another inserter linked its page first; ours is dropped.
                trace!("lost race to link a new page, retrying");
            }
        }
    }
}

impl<K: Hash, V> StreamJoinHashTable<K, V> {
    pub fn bucket_index(&self, key: &K) -> usize {
        self.bucket_of_hash(default_hash(key))
    }

    /// Reserves a slot for `key`.  The record becomes visible once the slot
    /// is written.
    pub fn insert(&self, key: K) -> Result<RecordSlot<K, V>> {
        let hash = default_hash(&key);
        let bucket = &self.buckets[self.bucket_of_hash(hash)];
        let (page, index) = self.reserve(bucket)?;
        Ok(RecordSlot::new(page, index, hash, key))
    }

    pub fn insert_record(&self, key: K, value: V) -> Result<()> {
        self.insert(key)?.write(value)
    }

    /// Freezes the table for probing.  Must only be called once no more
    /// inserts happen.
    pub fn seal(&self) -> SealedHashTable<K, V> {
        SealedHashTable {
            buckets: (0..self.buckets.len())
                .map(|bucket| self.bucket_pages(bucket))
                .collect(),
            mask: self.mask,
        }
    }
}

/// Read-only view of a [`StreamJoinHashTable`] after its build phase.
///
/// Holds the pages alive until it is dropped.
pub struct SealedHashTable<K, V> {
    buckets: Box<[Vec<Arc<FixedPage<K, V>>>]>,
    mask: usize,
}

impl<K, V> Debug for SealedHashTable<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedHashTable")
            .field("buckets", &self.buckets.len())
            .field("records", &self.num_records())
            .finish()
    }
}

impl<K, V> SealedHashTable<K, V> {
    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn num_records(&self) -> usize {
        self.buckets
            .iter()
            .flatten()
            .map(|page| page.entries().count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.num_records() == 0
    }

    /// Every entry of bucket `bucket`.
    pub fn bucket_entries(&self, bucket: usize) -> impl Iterator<Item = &JoinEntry<K, V>> {
        self.buckets[bucket].iter().flat_map(|page| page.entries())
    }

    /// Combined statistics of the page filters built so far.
    pub fn filter_stats(&self) -> BloomFilterStats {
        self.buckets
            .iter()
            .flatten()
            .filter_map(|page| page.built_filter())
            .map(|filter| filter.stats())
            .sum()
    }
}

impl<K: Hash + Eq, V> SealedHashTable<K, V> {
    /// Values stored under `key`.  Pages whose filter rules out the key are
    /// skipped.
    pub fn probe<'a>(&'a self, key: &'a K) -> impl Iterator<Item = &'a V> + 'a {
        let hash = default_hash(key);
        self.buckets[hash as usize & self.mask]
            .iter()
            .filter(move |page| page.filter().contains_hash(hash))
            .flat_map(|page| page.entries())
            .filter(move |entry| entry.hash == hash && &entry.key == key)
            .map(|entry| &entry.value)
    }
}

#[cfg(test)]
mod tests {
    use super::StreamJoinHashTable;
    use crate::join::page::PageAllocator;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use slicer_types::InsertStrategy;
    use std::collections::BTreeMap;
    use std::thread;

    fn build(
        strategy: InsertStrategy,
        threads: usize,
        records: &[(u8, u32)],
    ) -> StreamJoinHashTable<u8, u32> {
        let table = StreamJoinHashTable::new(4, strategy, PageAllocator::unbounded(3));
        thread::scope(|scope| {
            for chunk in records.chunks(records.len().div_ceil(threads).max(1)) {
                let table = &table;
                scope.spawn(move || {
                    for (key, value) in chunk {
                        table.insert_record(*key, *value).unwrap();
                    }
                });
            }
        });
        table
    }

    fn contents(table: &StreamJoinHashTable<u8, u32>) -> BTreeMap<u8, Vec<u32>> {
        let sealed = table.seal();
        let mut contents = BTreeMap::new();
        for bucket in 0..sealed.num_buckets() {
            for entry in sealed.bucket_entries(bucket) {
                contents
                    .entry(entry.key)
                    .or_insert_with(Vec::new)
                    .push(entry.value);
            }
        }
        for values in contents.values_mut() {
            values.sort_unstable();
        }
        contents
    }

    #[test]
    fn buckets_are_power_of_two() {
        let table = StreamJoinHashTable::<u8, u8>::new(5, InsertStrategy::Locking, PageAllocator::unbounded(1));
        assert_eq!(table.num_buckets(), 8);
        assert!(table.is_empty());
        assert!(table.bucket_index(&3) < 8);
    }

    #[test]
    fn probe_finds_all_values() {
        let records: Vec<_> = (0..50).map(|i| ((i % 5) as u8, i)).collect();
        let table = build(InsertStrategy::LockFree, 4, &records);
        let stats = table.statistics();
        assert_eq!(stats.records, 50);
        assert_eq!(stats.pages, table.num_pages());

        let sealed = table.seal();
        let mut values: Vec<u32> = sealed.probe(&2).copied().collect();
        values.sort_unstable();
        assert_eq!(values, vec![2, 7, 12, 17, 22, 27, 32, 37, 42, 47]);
        assert_eq!(sealed.probe(&9).count(), 0);
        assert!(sealed.filter_stats().hits > 0);
    }

    #[test]
    fn pages_link_newest_first() {
        let table = StreamJoinHashTable::new(1, InsertStrategy::Locking, PageAllocator::unbounded(2));
        for value in 0..5u32 {
            table.insert_record(0u8, value).unwrap();
        }
        let pages = table.bucket_pages(0);
        assert_eq!(pages.len(), 3);
        let lens: Vec<_> = pages.iter().map(|page| page.len()).collect();
        assert_eq!(lens, vec![1, 2, 2]);
        let first: Vec<_> = pages[2].entries().map(|entry| entry.value).collect();
        assert_eq!(first, vec![0, 1]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]
        #[test]
        fn strategies_agree(
            records in proptest::collection::vec((0u8..16, any::<u32>()), 0..200),
            threads in 1usize..5,
        ) {
            let locking = build(InsertStrategy::Locking, threads, &records);
            let lock_free = build(InsertStrategy::LockFree, threads, &records);
            prop_assert_eq!(locking.num_records(), records.len());
            prop_assert_eq!(lock_free.num_records(), records.len());
            prop_assert_eq!(contents(&locking), contents(&lock_free));
        }
    }
}
