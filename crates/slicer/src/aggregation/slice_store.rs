use super::slice::Slice;
use crate::error::{Error, Result};
use crate::window::{SliceAssigner, WindowState};
use crate::Timestamp;
use std::collections::BTreeMap;
use tracing::trace;

/// The slices of one worker.
///
/// A store is owned by exactly one worker and performs no synchronization
/// of its own.  Slices are created lazily when the first record for them
/// arrives and removed once the worker's watermark passes their end.
#[derive(Debug)]
pub struct ThreadLocalSliceStore<S> {
    assigner: SliceAssigner,
    /// Keyed by slice start.  Slices never overlap, so ends are ordered
    /// the same way.
    slices: BTreeMap<Timestamp, Slice<S>>,
    last_watermark: Timestamp,
}

impl<S: Default> ThreadLocalSliceStore<S> {
    pub fn new(assigner: SliceAssigner) -> Self {
        Self {
            assigner,
            slices: BTreeMap::new(),
            last_watermark: 0,
        }
    }

    /// Returns the slice containing `ts`, creating it if needed.
    ///
    /// Fails with a late-record violation if that slice was already closed
    /// by this store's watermark.
    pub fn get_slice_by_ts(&mut self, ts: Timestamp) -> Result<&mut Slice<S>> {
        let bounds = self.assigner.slice_bounds(ts);
        if bounds.end <= self.last_watermark {
            return Err(Error::late_record(ts, self.last_watermark));
        }
        Ok(self.slices.entry(bounds.start).or_insert_with(|| {
            trace!("creating slice {bounds}");
            Slice::new(bounds.start, bounds.end)
        }))
    }
}

impl<S> ThreadLocalSliceStore<S> {
    /// Slices that lie entirely inside `[start, end)`, ordered by start.
    pub fn find_slices_in_range(&self, start: Timestamp, end: Timestamp) -> Vec<&Slice<S>> {
        self.slices
            .range(start..end)
            .map(|(_, slice)| slice)
            .filter(|slice| slice.end() <= end)
            .collect()
    }

    /// Removes every slice with `end <= ts` and returns them, closed and
    /// ordered by start.
    pub fn remove_slices_until_ts(&mut self, ts: Timestamp) -> Vec<Slice<S>> {
        let mut removed = Vec::new();
        while let Some(entry) = self.slices.first_entry() {
            if entry.get().end() > ts {
                break;
            }
            let mut slice = entry.remove();
            if slice.lifecycle() == WindowState::Active {
                let closed = slice.transition(WindowState::Closed);
                debug_assert!(closed.is_ok(), "{closed:?}");
            }
            removed.push(slice);
        }
        removed
    }

    pub fn last_watermark(&self) -> Timestamp {
        self.last_watermark
    }

    /// Raises the watermark.  A lower value is ignored.
    pub fn set_last_watermark(&mut self, watermark: Timestamp) {
        self.last_watermark = self.last_watermark.max(watermark);
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Drops every slice and returns how many there were.
    pub fn clear(&mut self) -> usize {
        let len = self.slices.len();
        self.slices.clear();
        len
    }
}

#[cfg(test)]
mod tests {
    use super::ThreadLocalSliceStore;
    use crate::aggregation::function::Sum;
    use crate::aggregation::slice::{NonKeyedState, SliceState};
    use crate::window::{SliceAssigner, WindowBounds, WindowDefinition, WindowState};

    type Store = ThreadLocalSliceStore<NonKeyedState<i64>>;

    fn tumbling(size: u64) -> Store {
        ThreadLocalSliceStore::new(SliceAssigner::new(WindowDefinition::tumbling(size)))
    }

    #[test]
    fn tumbling_slices() {
        let sum = Sum::<i64>::default();
        let mut store = tumbling(100);
        for ts in [0u64, 99, 100, 199] {
            store
                .get_slice_by_ts(ts)
                .unwrap()
                .state_mut()
                .accumulate(&sum, (), &(ts as i64));
        }
        assert_eq!(store.len(), 2);
        let slices = store.find_slices_in_range(0, 200);
        let bounds: Vec<_> = slices.iter().map(|slice| slice.bounds()).collect();
        assert_eq!(
            bounds,
            vec![WindowBounds::new(0, 100), WindowBounds::new(100, 200)]
        );
        // ts=100 went to the second slice.
        assert_eq!(slices[0].state().partial(), Some(&99));
        assert_eq!(slices[1].state().partial(), Some(&299));
    }

    #[test]
    fn remove_and_late_records() {
        let mut store = tumbling(100);
        store.get_slice_by_ts(50).unwrap();
        store.get_slice_by_ts(150).unwrap();
        store.get_slice_by_ts(250).unwrap();

        let removed = store.remove_slices_until_ts(200);
        store.set_last_watermark(200);
        assert_eq!(removed.len(), 2);
        assert!(removed
            .iter()
            .all(|slice| slice.lifecycle() == WindowState::Closed));
        assert_eq!(store.len(), 1);

        let late = store.get_slice_by_ts(199).unwrap_err();
        assert!(late.is_late_record());
        // Still open: the slice ends after the watermark.
        assert!(store.get_slice_by_ts(200).is_ok());

        store.set_last_watermark(100);
        assert_eq!(store.last_watermark(), 200);
        assert_eq!(store.clear(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn range_excludes_partial_overlap() {
        let mut store =
            ThreadLocalSliceStore::<NonKeyedState<i64>>::new(SliceAssigner::new(
                WindowDefinition::sliding(100, 50),
            ));
        for ts in [10, 60, 110] {
            store.get_slice_by_ts(ts).unwrap();
        }
        let bounds: Vec<_> = store
            .find_slices_in_range(50, 150)
            .iter()
            .map(|slice| slice.bounds())
            .collect();
        assert_eq!(
            bounds,
            vec![WindowBounds::new(50, 100), WindowBounds::new(100, 150)]
        );
    }
}
