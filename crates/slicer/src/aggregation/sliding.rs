use super::slice::SliceState;
use super::AggregateFunction;
use crate::utils::lock;
use crate::window::{SliceAssigner, WindowBounds};
use crate::Timestamp;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, trace};

/// Merged global slices of a sliding-window aggregation.
///
/// With `size > slide` a merged slice belongs to several windows, so it is
/// kept here until the last window containing it has been emitted.
/// [`trigger`](Self::trigger) is serialized by the store's mutex and
/// remembers the highest watermark it ran for, so each window is produced
/// once.
#[derive(Debug)]
pub struct SlidingWindowStore<S> {
    assigner: SliceAssigner,
    inner: Mutex<SlidingInner<S>>,
}

#[derive(Debug)]
struct SlidingInner<S> {
    /// Merged slices keyed by start.
    slices: BTreeMap<Timestamp, (Timestamp, S)>,
    last_trigger_watermark: Timestamp,
    max_end: Timestamp,
}

impl<S> SlidingWindowStore<S> {
    pub fn new(assigner: SliceAssigner) -> Self {
        Self {
            assigner,
            inner: Mutex::new(SlidingInner {
                slices: BTreeMap::new(),
                last_trigger_watermark: 0,
                max_end: 0,
            }),
        }
    }

    /// Adds the merged payload of one slice.
    pub fn append(&self, bounds: WindowBounds, state: S) {
        let mut inner = lock(&self.inner);
        trace!("appending global slice {bounds}");
        inner.max_end = inner.max_end.max(bounds.end);
        inner.slices.insert(bounds.start, (bounds.end, state));
    }

    pub fn last_trigger_watermark(&self) -> Timestamp {
        lock(&self.inner).last_trigger_watermark
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).slices.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).slices.is_empty()
    }

    /// Drops every slice.
    pub fn clear(&self) {
        lock(&self.inner).slices.clear();
    }
}

impl<S: Clone> SlidingWindowStore<S> {
    /// Produces every window ending in `(last trigger, watermark]` that
    /// contains at least one slice.
    ///
    /// The caller must only pass a watermark up to which all slices have
    /// been appended.
    pub fn trigger<A>(&self, agg: &A, watermark: Timestamp) -> Vec<(WindowBounds, S, usize)>
    where
        A: AggregateFunction,
        S: SliceState<A>,
    {
        let mut inner = lock(&self.inner);
        if watermark <= inner.last_trigger_watermark {
            return Vec::new();
        }

        let up_to = watermark.min(
            inner
                .max_end
                .saturating_add(self.assigner.definition().size),
        );
        let mut windows = Vec::new();
        for window in self
            .assigner
            .windows_ending_in(inner.last_trigger_watermark, up_to)
        {
            let mut state = S::default();
            let mut slices = 0;
            for (_, (end, slice)) in inner.slices.range(window.start..window.end) {
                if *end <= window.end {
                    state.combine(agg, slice.clone());
                    slices += 1;
                }
            }
            if slices > 0 {
                windows.push((window, state, slices));
            }
        }
        inner.last_trigger_watermark = watermark;

        // Every future window ends after `watermark` and therefore starts
        // after `watermark - size`.
        let horizon = watermark.saturating_sub(self.assigner.definition().size);
        let before = inner.slices.len();
        inner.slices.retain(|_, (end, _)| *end > horizon);
        if before != inner.slices.len() {
            debug!(
                "dropped {} global slices ending at or before {horizon}",
                before - inner.slices.len()
            );
        }
        windows
    }
}

#[cfg(test)]
mod tests {
    use super::SlidingWindowStore;
    use crate::aggregation::function::Sum;
    use crate::aggregation::slice::{NonKeyedState, SliceState};
    use crate::window::{SliceAssigner, WindowBounds, WindowDefinition};

    fn state(value: i64) -> NonKeyedState<i64> {
        let mut state = NonKeyedState::default();
        state.accumulate(&Sum::<i64>::default(), (), &value);
        state
    }

    #[test]
    fn windows_combine_covered_slices() {
        let sum = Sum::<i64>::default();
        let store = SlidingWindowStore::new(SliceAssigner::new(WindowDefinition::sliding(100, 50)));
        store.append(WindowBounds::new(0, 50), state(1));
        store.append(WindowBounds::new(50, 100), state(2));
        store.append(WindowBounds::new(100, 150), state(4));

        let windows = store.trigger(&sum, 150);
        let results: Vec<_> = windows
            .iter()
            .map(|(bounds, state, slices)| (*bounds, state.partial().copied(), *slices))
            .collect();
        assert_eq!(
            results,
            vec![
                (WindowBounds::new(0, 100), Some(3), 2),
                (WindowBounds::new(50, 150), Some(6), 2),
            ]
        );
        // Slice [0, 50) is not needed by windows ending after 150.
        assert_eq!(store.len(), 2);

        // Triggering again for the same watermark emits nothing.
        assert!(store.trigger(&sum, 150).is_empty());

        // Flushing stops at the last window that can contain data.
        let windows = store.trigger(&sum, u64::MAX);
        let bounds: Vec<_> = windows.iter().map(|(bounds, ..)| *bounds).collect();
        // [150, 250) holds no slice and is skipped.
        assert_eq!(bounds, vec![WindowBounds::new(100, 200)]);
        assert_eq!(windows[0].1.partial(), Some(&4));
        assert_eq!(store.last_trigger_watermark(), u64::MAX);
        assert!(store.is_empty());
    }
}
