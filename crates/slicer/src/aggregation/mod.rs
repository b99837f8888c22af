//! Windowed aggregation: per-worker slices or window buckets, the merge
//! coordinator and the aggregation operator built on top of them.

mod bucket_store;
pub mod function;
mod handler;
mod slice;
mod slice_store;
mod sliding;
mod staging;

pub use bucket_store::ThreadLocalBucketStore;
pub use function::{AggregateFunction, Avg, Count, Max, Min, Sum};
pub use handler::{
    AggregateRecord, KeyedWindowHandler, NonKeyedWindowHandler, WindowAggregationHandler,
};
pub use slice::{GlobalSlice, KeyedState, NonKeyedState, Slice, SliceState};
pub use slice_store::ThreadLocalSliceStore;
pub use sliding::SlidingWindowStore;
pub use staging::{DiscardedWindow, SliceMergeTask, SliceStaging};
