use super::AggregateFunction;
use crate::error::Result;
use crate::window::{AtomicWindowState, WindowBounds, WindowRecord, WindowState};
use crate::Timestamp;
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Payload of a slice: the partial aggregates accumulated so far.
///
/// Every worker's slices for one aggregation use the same payload type, so
/// partials never need to be reconciled at merge time.
pub trait SliceState<A: AggregateFunction>: Default + Clone + Debug + Send + Sync + 'static {
    /// Grouping key; `()` for non-keyed aggregations.
    type Key: Clone + Debug + Send + Sync + 'static;

    fn accumulate(&mut self, agg: &A, key: Self::Key, input: &A::Input);

    /// Folds `other` into `self`.
    fn combine(&mut self, agg: &A, other: Self);

    fn is_empty(&self) -> bool;

    /// Number of distinct keys.
    fn len(&self) -> usize;

    /// Final value of every key.
    fn lower(&self, agg: &A) -> Vec<(Self::Key, A::Output)>;
}

/// A single accumulator for the whole slice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NonKeyedState<P>(Option<P>);

impl<P> Default for NonKeyedState<P> {
    fn default() -> Self {
        Self(None)
    }
}

impl<P> NonKeyedState<P> {
    pub fn partial(&self) -> Option<&P> {
        self.0.as_ref()
    }
}

impl<A: AggregateFunction> SliceState<A> for NonKeyedState<A::Partial> {
    type Key = ();

    fn accumulate(&mut self, agg: &A, _key: (), input: &A::Input) {
        let lifted = agg.lift(input);
        self.0 = Some(match self.0.take() {
            Some(partial) => agg.combine(partial, lifted),
            None => lifted,
        });
    }

    fn combine(&mut self, agg: &A, other: Self) {
        if let Some(right) = other.0 {
            self.0 = Some(match self.0.take() {
                Some(left) => agg.combine(left, right),
                None => right,
            });
        }
    }

    fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    fn len(&self) -> usize {
        usize::from(self.0.is_some())
    }

    fn lower(&self, agg: &A) -> Vec<((), A::Output)> {
        self.0
            .iter()
            .map(|partial| ((), agg.lower(partial)))
            .collect()
    }
}

/// One accumulator per key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyedState<K, P>(HashMap<K, P>)
where
    K: Hash + Eq;

impl<K: Hash + Eq, P> Default for KeyedState<K, P> {
    fn default() -> Self {
        Self(HashMap::new())
    }
}

impl<K: Hash + Eq, P> KeyedState<K, P> {
    pub fn get(&self, key: &K) -> Option<&P> {
        self.0.get(key)
    }

    /// Combines `partial` into the accumulator of `key` with one lookup.
    fn merge_partial<A>(&mut self, agg: &A, key: K, partial: P)
    where
        A: AggregateFunction<Partial = P>,
    {
        match self.0.entry(key) {
            Entry::Occupied(slot) => {
                slot.replace_entry_with(|_, current| Some(agg.combine(current, partial)));
            }
            Entry::Vacant(slot) => {
                slot.insert(partial);
            }
        }
    }
}

impl<A, K> SliceState<A> for KeyedState<K, A::Partial>
where
    A: AggregateFunction,
    K: Hash + Eq + Ord + Clone + Debug + Send + Sync + 'static,
{
    type Key = K;

    fn accumulate(&mut self, agg: &A, key: K, input: &A::Input) {
        let lifted = agg.lift(input);
        self.merge_partial(agg, key, lifted);
    }

    fn combine(&mut self, agg: &A, other: Self) {
        for (key, right) in other.0 {
            self.merge_partial(agg, key, right);
        }
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    /// Results are ordered by key, so identical inputs always produce
    /// identical output buffers.
    fn lower(&self, agg: &A) -> Vec<(K, A::Output)> {
        let mut lowered: Vec<_> = self
            .0
            .iter()
            .map(|(key, partial)| (key.clone(), agg.lower(partial)))
            .collect();
        lowered.sort_by(|(left, _), (right, _)| left.cmp(right));
        lowered
    }
}

/// A worker-local partial aggregate over `[start, end)`.
#[derive(Clone, Debug)]
pub struct Slice<S> {
    bounds: WindowBounds,
    state: S,
    lifecycle: WindowState,
}

impl<S: Default> Slice<S> {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self {
            bounds: WindowBounds::new(start, end),
            state: S::default(),
            lifecycle: WindowState::Active,
        }
    }
}

impl<S> Slice<S> {
    pub fn start(&self) -> Timestamp {
        self.bounds.start
    }

    pub fn end(&self) -> Timestamp {
        self.bounds.end
    }

    pub fn bounds(&self) -> WindowBounds {
        self.bounds
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.bounds.contains(ts)
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub fn lifecycle(&self) -> WindowState {
        self.lifecycle
    }

    pub(crate) fn transition(&mut self, to: WindowState) -> Result<()> {
        self.lifecycle.transition(to)
    }

    /// Hands the payload to staging.
    pub fn stage(mut self) -> Result<(WindowBounds, S)> {
        self.lifecycle.transition(WindowState::Staged)?;
        Ok((self.bounds, self.state))
    }
}

/// The merged result of all workers' slices for one window.
///
/// Immutable once built; lowering it repeatedly yields the same records.
#[derive(Debug)]
pub struct GlobalSlice<S> {
    bounds: WindowBounds,
    state: S,
    contributions: usize,
    lifecycle: AtomicWindowState,
}

impl<S> GlobalSlice<S> {
    pub fn new(bounds: WindowBounds, state: S, contributions: usize) -> Self {
        Self {
            bounds,
            state,
            contributions,
            lifecycle: AtomicWindowState::new(WindowState::Merged),
        }
    }

    /// Combines per-worker payloads in the order given.
    pub fn merge<A, I>(agg: &A, bounds: WindowBounds, parts: I) -> Self
    where
        A: AggregateFunction,
        S: SliceState<A>,
        I: IntoIterator<Item = S>,
    {
        let mut state = S::default();
        let mut contributions = 0;
        for part in parts {
            state.combine(agg, part);
            contributions += 1;
        }
        Self::new(bounds, state, contributions)
    }

    pub fn bounds(&self) -> WindowBounds {
        self.bounds
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn contributions(&self) -> usize {
        self.contributions
    }

    pub fn lifecycle(&self) -> WindowState {
        self.lifecycle.load()
    }

    pub fn into_state(self) -> S {
        self.state
    }

    pub fn records<A>(&self, agg: &A) -> Vec<WindowRecord<<S as SliceState<A>>::Key, A::Output>>
    where
        A: AggregateFunction,
        S: SliceState<A>,
    {
        self.state
            .lower(agg)
            .into_iter()
            .map(|(key, value)| WindowRecord {
                start: self.bounds.start,
                end: self.bounds.end,
                key,
                value,
            })
            .collect()
    }

    /// Claims the right to emit this window.  Only the first call succeeds.
    pub fn mark_emitted(&self) -> Result<()> {
        self.lifecycle
            .transition(WindowState::Merged, WindowState::Emitted, self.bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::{GlobalSlice, KeyedState, NonKeyedState, Slice, SliceState};
    use crate::aggregation::function::{Count, Sum};
    use crate::error::{Error, ProtocolViolation};
    use crate::window::{WindowBounds, WindowRecord, WindowState};
    use pretty_assertions::assert_eq;

    #[test]
    fn non_keyed_accumulation() {
        let sum = Sum::<i64>::default();
        let mut state = NonKeyedState::default();
        assert!(SliceState::<Sum<i64>>::is_empty(&state));
        state.accumulate(&sum, (), &5);
        state.accumulate(&sum, (), &7);
        let mut other = NonKeyedState::default();
        other.accumulate(&sum, (), &-2);
        state.combine(&sum, other);
        assert_eq!(state.partial(), Some(&10));
        assert_eq!(state.lower(&sum), vec![((), 10)]);
    }

    #[test]
    fn keyed_accumulation() {
        let count = Count::<&'static str>::default();
        let mut left = KeyedState::default();
        left.accumulate(&count, "b", &"x");
        left.accumulate(&count, "a", &"y");
        left.accumulate(&count, "a", &"w");
        let mut right = KeyedState::default();
        right.accumulate(&count, "b", &"z");
        right.accumulate(&count, "c", &"v");
        left.combine(&count, right);
        assert_eq!(SliceState::<Count<&str>>::len(&left), 3);
        assert_eq!(left.get(&"a"), Some(&2));
        assert_eq!(left.lower(&count), vec![("a", 2), ("b", 2), ("c", 1)]);
    }

    #[test]
    fn slice_lifecycle() {
        let mut slice = Slice::<NonKeyedState<i64>>::new(0, 100);
        assert!(slice.contains(99));
        assert!(!slice.contains(100));
        assert!(slice.clone().stage().is_err());
        slice.transition(WindowState::Closed).unwrap();
        let (bounds, _state) = slice.stage().unwrap();
        assert_eq!(bounds, WindowBounds::new(0, 100));
    }

    #[test]
    fn global_slice_is_idempotent() {
        let sum = Sum::<i64>::default();
        let parts = [3, 4, 5].map(|value| {
            let mut state = NonKeyedState::default();
            state.accumulate(&sum, (), &value);
            state
        });
        let global = GlobalSlice::merge(&sum, WindowBounds::new(0, 100), parts);
        assert_eq!(global.contributions(), 3);
        let expected = vec![WindowRecord {
            start: 0,
            end: 100,
            key: (),
            value: 12,
        }];
        assert_eq!(global.records(&sum), expected);
        global.mark_emitted().unwrap();
        assert_eq!(global.records(&sum), expected);
        assert!(matches!(
            global.mark_emitted(),
            Err(Error::ProtocolViolation(ProtocolViolation::DoubleEmit { .. }))
        ));
        assert_eq!(global.lifecycle(), WindowState::Emitted);
    }
}
