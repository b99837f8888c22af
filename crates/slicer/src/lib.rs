//! Concurrency core of a multi-threaded stream-processing engine.
//!
//! Buffers of records arrive from several upstream origins and are handed
//! to a fixed pool of worker threads.  This crate turns them into windowed
//! aggregates and windowed stream-stream joins:
//!
//! * [`watermark`] reorders per-origin watermark updates and combines them
//!   into a monotonic global watermark.
//! * [`aggregation`] accumulates per-worker partial aggregates in
//!   thread-local slice stores and merges them exactly once per window
//!   through [`aggregation::SliceStaging`].
//! * [`join`] builds partitioned hash tables concurrently (with a locking
//!   or a lock-free insertion strategy) and probes them once every worker
//!   finished building a window.
//! * [`runtime`] hosts operators on named worker threads.
//!
//! Configuration and error-report types live in the `slicer-types` crate.

pub mod aggregation;
pub mod buffer;
pub mod error;
pub mod hash;
pub mod join;
pub mod operator;
pub mod runtime;
pub mod utils;
pub mod watermark;
pub mod window;

#[cfg(test)]
pub(crate) mod test_util;

/// Identifier of an upstream data source.
pub type OriginId = u64;

/// Event or ingestion time, in the unit of the window definition.
pub type Timestamp = u64;

pub use aggregation::{
    AggregateFunction, GlobalSlice, KeyedWindowHandler, NonKeyedWindowHandler, SliceStaging,
    ThreadLocalBucketStore, ThreadLocalSliceStore, WindowAggregationHandler,
};
pub use buffer::{BufferPool, CollectingSink, RecordBuffer, Sink, TupleBuffer};
pub use error::{Error, ProtocolViolation, Result};
pub use join::{
    JoinAlgorithm, JoinInput, JoinedRecord, StreamJoinHandler, StreamJoinHashTable,
};
pub use operator::{OperatorHandler, SetupContext, StopReport, WorkerContext};
pub use runtime::{Pipeline, PipelineHandle, Runtime, RuntimeHandle};
pub use watermark::{MultiOriginWatermarkProcessor, WatermarkSequencer};
pub use window::{SliceAssigner, TimeFunction, WindowBounds, WindowDefinition, WindowRecord};

pub use slicer_types::{EngineConfig, InsertStrategy, PreAggregation, TerminationType};
