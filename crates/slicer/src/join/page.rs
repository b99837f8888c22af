//! Fixed-capacity pages holding the build side of a hash join.

use super::bloom::PageFilter;
use crate::error::{ProtocolViolation, Resource, Result};
use crate::utils::{Permit, PermitPool};
use slicer_types::JoinConfig;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::trace;

/// A build-side record together with its key and key hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinEntry<K, V> {
    pub hash: u64,
    pub key: K,
    pub value: V,
}

/// A fixed number of write-once slots.
///
/// Slots are handed out by an atomic fill offset that only grows; once it
/// reaches the capacity the page is sealed and inserters move on to a new
/// page.  Pages of a bucket form a list from the newest page to the
/// oldest.
pub struct FixedPage<K, V> {
    slots: Box<[OnceLock<JoinEntry<K, V>>]>,
    fill: AtomicUsize,
    next: Option<Arc<FixedPage<K, V>>>,
    filter: OnceLock<PageFilter>,
    _permit: Option<Permit>,
}

impl<K: Debug, V: Debug> Debug for FixedPage<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedPage")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("has_next", &self.next.is_some())
            .finish()
    }
}

impl<K, V> FixedPage<K, V> {
    fn new(capacity: usize, next: Option<Arc<Self>>, permit: Option<Permit>) -> Self {
        Self {
            slots: (0..capacity).map(|_| OnceLock::new()).collect(),
            fill: AtomicUsize::new(0),
            next,
            filter: OnceLock::new(),
            _permit: permit,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of reserved slots.
    pub fn len(&self) -> usize {
        self.fill.load(Ordering::Acquire).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.fill.load(Ordering::Acquire) >= self.capacity()
    }

    /// The next older page of the same bucket.
    pub fn next(&self) -> Option<&Arc<Self>> {
        self.next.as_ref()
    }

    /// Reserves a slot, or returns `None` if the page is full.
    pub fn try_reserve(&self) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let index = self.fill.fetch_add(1, Ordering::AcqRel);
        (index < self.capacity()).then_some(index)
    }

    /// Written entries.  Slots that were reserved but not written yet are
    /// skipped.
    pub fn entries(&self) -> impl Iterator<Item = &JoinEntry<K, V>> {
        self.slots[..self.len()].iter().filter_map(OnceLock::get)
    }

    /// Filter over the key hashes of this page, built on first use.  Must
    /// only be called once the page receives no more writes.
    pub fn filter(&self) -> &PageFilter {
        self.filter.get_or_init(|| {
            let hashes: Vec<u64> = self.entries().map(|entry| entry.hash).collect();
            PageFilter::build(hashes.into_iter())
        })
    }

    pub(crate) fn built_filter(&self) -> Option<&PageFilter> {
        self.filter.get()
    }

    fn write(&self, index: usize, entry: JoinEntry<K, V>) -> Result<()> {
        self.slots[index]
            .set(entry)
            .map_err(|_| ProtocolViolation::SlotOverwrite { index }.into())
    }
}

impl<K, V> Drop for FixedPage<K, V> {
    // Pages of a long bucket would otherwise be dropped recursively.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(page) = next {
            match Arc::try_unwrap(page) {
                Ok(mut page) => next = page.next.take(),
                Err(_) => break,
            }
        }
    }
}

/// A reserved slot in a page, to be written exactly once.
#[must_use = "a reserved slot stays empty unless written"]
pub struct RecordSlot<K, V> {
    page: Arc<FixedPage<K, V>>,
    index: usize,
    hash: u64,
    key: K,
}

impl<K: Debug, V> Debug for RecordSlot<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSlot")
            .field("index", &self.index)
            .field("hash", &self.hash)
            .field("key", &self.key)
            .finish()
    }
}

impl<K, V> RecordSlot<K, V> {
    pub(crate) fn new(page: Arc<FixedPage<K, V>>, index: usize, hash: u64, key: K) -> Self {
        Self {
            page,
            index,
            hash,
            key,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn write(self, value: V) -> Result<()> {
        self.page.write(
            self.index,
            JoinEntry {
                hash: self.hash,
                key: self.key,
                value,
            },
        )
    }
}

/// Allocates pages of a fixed capacity.
///
/// With `max_pages` configured, at most that many pages are alive at once
/// across all tables sharing the allocator; `allocate` blocks until a page
/// is released.
#[derive(Clone, Debug)]
pub struct PageAllocator {
    page_capacity: usize,
    budget: Option<PermitPool>,
    timeout: Option<Duration>,
    allocated: Arc<AtomicUsize>,
}

impl PageAllocator {
    pub fn new(config: &JoinConfig, timeout: Option<Duration>) -> Self {
        Self {
            page_capacity: config.page_capacity.max(1),
            budget: config
                .max_pages
                .map(|max| PermitPool::new(Resource::JoinPages, max)),
            timeout,
            allocated: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn unbounded(page_capacity: usize) -> Self {
        Self {
            page_capacity: page_capacity.max(1),
            budget: None,
            timeout: None,
            allocated: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn page_capacity(&self) -> usize {
        self.page_capacity
    }

    /// Pages that can be allocated without blocking, or `None` without a
    /// budget.
    pub fn available(&self) -> Option<usize> {
        self.budget.as_ref().map(PermitPool::available)
    }

    /// Total number of pages allocated so far.
    pub fn pages_allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Allocates an empty page that links to `next`.
    pub fn allocate<K, V>(
        &self,
        next: Option<Arc<FixedPage<K, V>>>,
    ) -> Result<Arc<FixedPage<K, V>>> {
        let permit = match &self.budget {
            Some(budget) => Some(budget.acquire(self.timeout)?),
            None => None,
        };
        let total = self.allocated.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("allocated join page ({total} so far)");
        metrics::counter!("slicer.join_pages_allocated").increment(1);
        Ok(Arc::new(FixedPage::new(self.page_capacity, next, permit)))
    }
}

#[cfg(test)]
mod tests {
    use super::{PageAllocator, RecordSlot};
    use crate::error::{Error, ProtocolViolation};
    use slicer_types::JoinConfig;
    use std::time::Duration;

    #[test]
    fn reserve_until_full() {
        let allocator = PageAllocator::unbounded(2);
        let page = allocator.allocate::<u32, u32>(None).unwrap();
        assert_eq!(page.try_reserve(), Some(0));
        assert_eq!(page.try_reserve(), Some(1));
        assert!(page.is_full());
        assert_eq!(page.try_reserve(), None);
        assert_eq!(page.len(), 2);

        // Slot 0 stays unwritten and is not visible.
        RecordSlot::new(page.clone(), 1, 11, 1).write(100).unwrap();
        let values: Vec<_> = page.entries().map(|entry| entry.value).collect();
        assert_eq!(values, vec![100]);
        assert!(matches!(
            RecordSlot::new(page.clone(), 1, 11, 1).write(200),
            Err(Error::ProtocolViolation(ProtocolViolation::SlotOverwrite { index: 1 }))
        ));

        assert!(page.filter().contains_hash(11));
        assert_eq!(allocator.pages_allocated(), 1);
    }

    #[test]
    fn budget_is_returned_on_drop() {
        let allocator = PageAllocator::new(
            &JoinConfig {
                page_capacity: 4,
                max_pages: Some(2),
                ..JoinConfig::default()
            },
            Some(Duration::from_millis(10)),
        );
        let first = allocator.allocate::<u8, u8>(None).unwrap();
        let second = allocator.allocate(Some(first)).unwrap();
        assert_eq!(allocator.available(), Some(0));
        assert!(matches!(
            allocator.allocate::<u8, u8>(None),
            Err(Error::ResourceExhausted { .. })
        ));

        // Dropping the head releases the whole list.
        drop(second);
        assert_eq!(allocator.available(), Some(2));
    }

    #[test]
    fn long_lists_drop_iteratively() {
        let allocator = PageAllocator::unbounded(1);
        let mut head = None;
        for _ in 0..100_000 {
            head = Some(allocator.allocate::<u8, u8>(head).unwrap());
        }
        drop(head);
    }
}
