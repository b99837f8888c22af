//! Aggregation function contract and the built-in aggregates.

use num_traits::{ToPrimitive, Zero};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::ops::Add;

/// An aggregate expressed as lift/combine/lower.
///
/// Each input is lifted into a partial aggregate; partials are combined
/// within a worker's slice and across workers during the merge; the final
/// partial is lowered to the output value.  `combine` must be associative
/// and commutative, since partials from different workers are combined in
/// arrival order.
pub trait AggregateFunction: Send + Sync + 'static {
    type Input: Send + 'static;
    type Partial: Clone + Debug + Send + Sync + 'static;
    type Output: Clone + Debug + Send + Sync + 'static;

    fn lift(&self, input: &Self::Input) -> Self::Partial;

    fn combine(&self, left: Self::Partial, right: Self::Partial) -> Self::Partial;

    fn lower(&self, partial: &Self::Partial) -> Self::Output;
}

/// Sum of the inputs.
#[derive(Debug)]
pub struct Sum<T>(PhantomData<fn(T)>);

impl<T> Default for Sum<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> AggregateFunction for Sum<T>
where
    T: Add<Output = T> + Copy + Debug + Send + Sync + 'static,
{
    type Input = T;
    type Partial = T;
    type Output = T;

    fn lift(&self, input: &T) -> T {
        *input
    }

    fn combine(&self, left: T, right: T) -> T {
        left + right
    }

    fn lower(&self, partial: &T) -> T {
        *partial
    }
}

/// Number of inputs.
#[derive(Debug)]
pub struct Count<T>(PhantomData<fn(T)>);

impl<T> Default for Count<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Send + 'static> AggregateFunction for Count<T> {
    type Input = T;
    type Partial = u64;
    type Output = u64;

    fn lift(&self, _input: &T) -> u64 {
        1
    }

    fn combine(&self, left: u64, right: u64) -> u64 {
        left + right
    }

    fn lower(&self, partial: &u64) -> u64 {
        *partial
    }
}

/// Smallest input.
#[derive(Debug)]
pub struct Min<T>(PhantomData<fn(T)>);

impl<T> Default for Min<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> AggregateFunction for Min<T>
where
    T: PartialOrd + Copy + Debug + Send + Sync + 'static,
{
    type Input = T;
    type Partial = T;
    type Output = T;

    fn lift(&self, input: &T) -> T {
        *input
    }

    fn combine(&self, left: T, right: T) -> T {
        if right < left {
            right
        } else {
            left
        }
    }

    fn lower(&self, partial: &T) -> T {
        *partial
    }
}

/// Largest input.
#[derive(Debug)]
pub struct Max<T>(PhantomData<fn(T)>);

impl<T> Default for Max<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> AggregateFunction for Max<T>
where
    T: PartialOrd + Copy + Debug + Send + Sync + 'static,
{
    type Input = T;
    type Partial = T;
    type Output = T;

    fn lift(&self, input: &T) -> T {
        *input
    }

    fn combine(&self, left: T, right: T) -> T {
        if right > left {
            right
        } else {
            left
        }
    }

    fn lower(&self, partial: &T) -> T {
        *partial
    }
}

/// Arithmetic mean, carried as `(sum, count)`.
#[derive(Debug)]
pub struct Avg<T>(PhantomData<fn(T)>);

impl<T> Default for Avg<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> AggregateFunction for Avg<T>
where
    T: Add<Output = T> + Zero + ToPrimitive + Copy + Debug + Send + Sync + 'static,
{
    type Input = T;
    type Partial = (T, u64);
    type Output = f64;

    fn lift(&self, input: &T) -> (T, u64) {
        (*input, 1)
    }

    fn combine(&self, left: (T, u64), right: (T, u64)) -> (T, u64) {
        (left.0 + right.0, left.1 + right.1)
    }

    fn lower(&self, partial: &(T, u64)) -> f64 {
        let (sum, count) = partial;
        if *count == 0 {
            return 0.0;
        }
        sum.to_f64().unwrap_or(f64::NAN) / *count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::{AggregateFunction, Avg, Count, Max, Min, Sum};
    use proptest::prelude::*;

    fn fold<A: AggregateFunction>(agg: &A, inputs: &[A::Input]) -> Option<A::Output> {
        inputs
            .iter()
            .map(|input| agg.lift(input))
            .reduce(|left, right| agg.combine(left, right))
            .map(|partial| agg.lower(&partial))
    }

    #[test]
    fn builtins() {
        let inputs = [3i64, -1, 7, 5];
        assert_eq!(fold(&Sum::default(), &inputs), Some(14));
        assert_eq!(fold(&Count::default(), &inputs), Some(4));
        assert_eq!(fold(&Min::default(), &inputs), Some(-1));
        assert_eq!(fold(&Max::default(), &inputs), Some(7));
        assert_eq!(fold(&Avg::default(), &inputs), Some(3.5));
        assert_eq!(fold(&Sum::<i64>::default(), &[]), None);
    }

    #[test]
    fn float_min_max() {
        let inputs = [1.5f64, -2.25, 0.0];
        assert_eq!(fold(&Min::default(), &inputs), Some(-2.25));
        assert_eq!(fold(&Max::default(), &inputs), Some(1.5));
    }

    proptest! {
        #[test]
        fn combine_is_order_independent(mut inputs in proptest::collection::vec(-1000i64..1000, 1..50)) {
            let sum = Sum::default();
            let avg = Avg::default();
            let forward = (fold(&sum, &inputs), fold(&avg, &inputs));
            inputs.reverse();
            prop_assert_eq!(forward, (fold(&sum, &inputs), fold(&avg, &inputs)));
        }
    }
}
