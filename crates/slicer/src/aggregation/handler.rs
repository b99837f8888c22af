//! The window aggregation operator.
//!
//! Every worker accumulates records into its own [`ThreadLocalSliceStore`],
//! or into a [`ThreadLocalBucketStore`] when bucket pre-aggregation is
//! configured.  When the global watermark passes the end of a slice, the
//! worker closes the slice and stages it; the worker completing a window
//! merges the contributions and emits the result.

use super::bucket_store::ThreadLocalBucketStore;
use super::function::AggregateFunction;
use super::slice::{GlobalSlice, KeyedState, NonKeyedState, Slice, SliceState};
use super::slice_store::ThreadLocalSliceStore;
use super::sliding::SlidingWindowStore;
use super::staging::{SliceMergeTask, SliceStaging};
use crate::buffer::{BufferPool, RecordBuffer, Sink};
use crate::error::{Error, ProtocolViolation, Result};
use crate::operator::{
    FailureChannel, Lifecycle, LifecyclePhase, OperatorHandler, SetupContext, StopReport,
    WorkerContext,
};
use crate::watermark::MultiOriginWatermarkProcessor;
use crate::window::{
    SliceAssigner, TimeFunction, WindowBounds, WindowDefinition, WindowEmitter, WindowRecord,
    WindowState,
};
use crate::Timestamp;
use crossbeam_utils::CachePadded;
use slicer_types::{EngineConfig, PreAggregation, TerminationType};
use std::collections::BTreeSet;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, TryLockError};
use tracing::{debug, info, trace, warn};

/// Output record of an aggregation with function `A` and payload `S`.
pub type AggregateRecord<A, S> =
    WindowRecord<<S as SliceState<A>>::Key, <A as AggregateFunction>::Output>;

type InputExtractor<R, A, S> = Arc<
    dyn Fn(&R) -> (<S as SliceState<A>>::Key, <A as AggregateFunction>::Input) + Send + Sync,
>;

/// Aggregation producing one value per window.
pub type NonKeyedWindowHandler<R, A> =
    WindowAggregationHandler<R, A, NonKeyedState<<A as AggregateFunction>::Partial>>;

/// Aggregation producing one value per key and window.
pub type KeyedWindowHandler<R, A, K> =
    WindowAggregationHandler<R, A, KeyedState<K, <A as AggregateFunction>::Partial>>;

/// Per-worker partials, in the configured pre-aggregation layout.
#[derive(Debug)]
enum WorkerStore<S> {
    Slices(ThreadLocalSliceStore<S>),
    Buckets(ThreadLocalBucketStore<S>),
}

impl<S: Default> WorkerStore<S> {
    fn new(pre_aggregation: PreAggregation, assigner: SliceAssigner) -> Self {
        match pre_aggregation {
            PreAggregation::Slices => Self::Slices(ThreadLocalSliceStore::new(assigner)),
            PreAggregation::Buckets => Self::Buckets(ThreadLocalBucketStore::new(assigner)),
        }
    }

    /// Calls `accumulate` on every partial the record at `ts` belongs to.
    fn accumulate<F>(&mut self, ts: Timestamp, mut accumulate: F) -> Result<()>
    where
        F: FnMut(&mut S),
    {
        match self {
            Self::Slices(store) => accumulate(store.get_slice_by_ts(ts)?.state_mut()),
            Self::Buckets(store) => {
                for bucket in store.get_buckets_by_ts(ts)? {
                    accumulate(bucket.state_mut());
                }
            }
        }
        Ok(())
    }
}

impl<S> WorkerStore<S> {
    fn remove_until_ts(&mut self, ts: Timestamp) -> Vec<Slice<S>> {
        match self {
            Self::Slices(store) => store.remove_slices_until_ts(ts),
            Self::Buckets(store) => store.remove_buckets_until_ts(ts),
        }
    }

    fn last_watermark(&self) -> Timestamp {
        match self {
            Self::Slices(store) => store.last_watermark(),
            Self::Buckets(store) => store.last_watermark(),
        }
    }

    fn set_last_watermark(&mut self, watermark: Timestamp) {
        match self {
            Self::Slices(store) => store.set_last_watermark(watermark),
            Self::Buckets(store) => store.set_last_watermark(watermark),
        }
    }

    fn clear(&mut self) -> usize {
        match self {
            Self::Slices(store) => store.clear(),
            Self::Buckets(store) => store.clear(),
        }
    }
}

/// State created by `setup`, once the workers and origins are known.
struct AggregationState<A, S>
where
    A: AggregateFunction,
    S: SliceState<A>,
{
    watermarks: MultiOriginWatermarkProcessor,
    stores: Box<[CachePadded<Mutex<WorkerStore<S>>>]>,
    staging: SliceStaging<S>,
    /// Only for sliding windows pre-aggregated in slices.  Merged buckets
    /// are already whole windows.
    sliding: Option<SlidingWindowStore<S>>,
    emitter: WindowEmitter<AggregateRecord<A, S>>,
}

impl<A, S> AggregationState<A, S>
where
    A: AggregateFunction,
    S: SliceState<A>,
{
    /// Locks the slice store of `worker`.  Stores are never shared, so a
    /// held lock means two threads claim the same worker id.
    fn store(&self, worker: usize) -> Result<MutexGuard<'_, WorkerStore<S>>> {
        let store = self
            .stores
            .get(worker)
            .ok_or(ProtocolViolation::WorkerOutOfRange {
                worker,
                num_workers: self.stores.len(),
            })?;
        match store.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                Err(ProtocolViolation::ConcurrentWorkerAccess { worker }.into())
            }
        }
    }
}

/// Windowed aggregation over records of type `R`.
///
/// `extract` maps a record to its grouping key and the input of the
/// aggregate function.  Results are written to `sink` as
/// [`WindowRecord`]s tagged with the configured result origin.
pub struct WindowAggregationHandler<R, A, S>
where
    A: AggregateFunction,
    S: SliceState<A>,
{
    config: EngineConfig,
    assigner: SliceAssigner,
    agg: A,
    time: TimeFunction<R>,
    extract: InputExtractor<R, A, S>,
    sink: Arc<dyn Sink<AggregateRecord<A, S>>>,
    state: OnceLock<AggregationState<A, S>>,
    lifecycle: Lifecycle,
    failures: FailureChannel,
    windows_emitted: AtomicU64,
}

impl<R, A, S> Debug for WindowAggregationHandler<R, A, S>
where
    A: AggregateFunction,
    S: SliceState<A>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowAggregationHandler")
            .field("definition", &self.assigner.definition())
            .field("time", &self.time)
            .field("lifecycle", &self.lifecycle.phase())
            .field("windows_emitted", &self.windows_emitted.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<R, A, K> KeyedWindowHandler<R, A, K>
where
    R: Send + 'static,
    A: AggregateFunction,
    K: Hash + Eq + Ord + Clone + Debug + Send + Sync + 'static,
{
    pub fn keyed<F>(
        config: EngineConfig,
        agg: A,
        time: TimeFunction<R>,
        extract: F,
        sink: Arc<dyn Sink<WindowRecord<K, A::Output>>>,
    ) -> Self
    where
        F: Fn(&R) -> (K, A::Input) + Send + Sync + 'static,
    {
        Self::new(config, agg, time, extract, sink)
    }
}

impl<R, A> NonKeyedWindowHandler<R, A>
where
    R: Send + 'static,
    A: AggregateFunction,
{
    pub fn non_keyed<F>(
        config: EngineConfig,
        agg: A,
        time: TimeFunction<R>,
        input: F,
        sink: Arc<dyn Sink<WindowRecord<(), A::Output>>>,
    ) -> Self
    where
        F: Fn(&R) -> A::Input + Send + Sync + 'static,
    {
        Self::new(config, agg, time, move |record: &R| ((), input(record)), sink)
    }
}

impl<R, A, S> WindowAggregationHandler<R, A, S>
where
    R: Send + 'static,
    A: AggregateFunction,
    S: SliceState<A>,
{
    pub fn new<F>(
        config: EngineConfig,
        agg: A,
        time: TimeFunction<R>,
        extract: F,
        sink: Arc<dyn Sink<AggregateRecord<A, S>>>,
    ) -> Self
    where
        F: Fn(&R) -> (S::Key, A::Input) + Send + Sync + 'static,
    {
        Self {
            assigner: SliceAssigner::new(WindowDefinition::from(&config.window)),
            config,
            agg,
            time,
            extract: Arc::new(extract),
            sink,
            state: OnceLock::new(),
            lifecycle: Lifecycle::new("window aggregation"),
            failures: FailureChannel::default(),
            windows_emitted: AtomicU64::new(0),
        }
    }

    pub fn definition(&self) -> WindowDefinition {
        self.assigner.definition()
    }

    /// Number of windows emitted so far.
    pub fn windows_emitted(&self) -> u64 {
        self.windows_emitted.load(Ordering::Relaxed)
    }

    fn state(&self) -> Result<&AggregationState<A, S>> {
        self.state.get().ok_or_else(|| Error::Lifecycle {
            expected: LifecyclePhase::SetUp,
            actual: self.lifecycle.phase(),
        })
    }

    /// Closes and stages every slice of `worker` ending at or before
    /// `watermark`, then advances the worker.  Returns the merges this
    /// worker has to perform.
    fn close_slices(
        &self,
        state: &AggregationState<A, S>,
        worker: usize,
        store: &mut WorkerStore<S>,
        watermark: Timestamp,
    ) -> Result<Vec<SliceMergeTask<S>>> {
        let slices = store.remove_until_ts(watermark);
        store.set_last_watermark(watermark);
        if !slices.is_empty() {
            debug!(
                "worker {worker} closing {} slices at watermark {watermark}",
                slices.len()
            );
        }

        let mut tasks = Vec::new();
        for slice in slices {
            let (bounds, payload) = slice.stage()?;
            tasks.extend(state.staging.stage_slice(bounds, worker, payload)?);
        }
        tasks.extend(state.staging.advance_worker(worker, watermark)?);
        Ok(tasks)
    }

    /// Performs merges, reporting failures instead of returning them.
    /// Returns the windows emitted.
    fn run_tasks(
        &self,
        state: &AggregationState<A, S>,
        tasks: Vec<SliceMergeTask<S>>,
    ) -> Vec<WindowBounds> {
        let mut emitted = Vec::new();
        for task in tasks {
            let bounds = task.bounds();
            match self.merge(state, task) {
                Ok(window) => emitted.extend(window),
                Err(error) => {
                    warn!("merging window {bounds} failed: {error}");
                    self.report_failure(error);
                }
            }
        }
        emitted
    }

    fn merge(
        &self,
        state: &AggregationState<A, S>,
        task: SliceMergeTask<S>,
    ) -> Result<Option<WindowBounds>> {
        let bounds = task.bounds();
        let contributions = task.contributions().len();
        let global = GlobalSlice::merge(&self.agg, bounds, task.into_parts());
        metrics::counter!("slicer.windows_merged").increment(1);
        trace!("merged {bounds} from {contributions} contributions");

        let result = match &state.sliding {
            None => self.emit_window(state, &global),
            Some(sliding) => {
                sliding.append(bounds, global.into_state());
                Ok(None)
            }
        };
        state.staging.complete(bounds);
        result
    }

    fn emit_window(
        &self,
        state: &AggregationState<A, S>,
        global: &GlobalSlice<S>,
    ) -> Result<Option<WindowBounds>> {
        let bounds = global.bounds();
        if SliceState::<A>::is_empty(global.state()) {
            debug!("window {bounds} is empty, nothing to emit");
            return Ok(None);
        }
        global.mark_emitted()?;
        let buffers = state.emitter.emit(bounds.end, global.records(&self.agg))?;
        self.windows_emitted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("slicer.windows_emitted").increment(1);
        debug!("emitted window {bounds} in {buffers} buffers");
        Ok(Some(bounds))
    }

    /// Emits every sliding window whose slices have all been merged.
    fn trigger_sliding(&self, state: &AggregationState<A, S>) -> Vec<WindowBounds> {
        let Some(sliding) = &state.sliding else {
            return Vec::new();
        };

        // Read the workers' watermark before the pending entries: an entry
        // ending below that watermark was created before it was reached.
        let mut limit = state.staging.min_worker_watermark();
        if let Some(pending) = state.staging.pending_min_end() {
            limit = limit.min(pending.saturating_sub(1));
        }

        let mut emitted = Vec::new();
        for (bounds, payload, slices) in sliding.trigger(&self.agg, limit) {
            let global = GlobalSlice::new(bounds, payload, slices);
            match self.emit_window(state, &global) {
                Ok(window) => emitted.extend(window),
                Err(error) => {
                    warn!("emitting window {bounds} failed: {error}");
                    self.report_failure(error);
                }
            }
        }
        emitted
    }

    fn discard_all(&self, state: &AggregationState<A, S>) -> Result<BTreeSet<WindowBounds>> {
        let mut discarded = BTreeSet::new();
        for worker in 0..state.stores.len() {
            let mut store = state.store(worker)?;
            for mut slice in store.remove_until_ts(Timestamp::MAX) {
                slice.transition(WindowState::Discarded)?;
                discarded.insert(slice.bounds());
            }
            store.clear();
        }
        if let Some(sliding) = &state.sliding {
            sliding.clear();
        }
        Ok(discarded)
    }
}

impl<R, A, S> OperatorHandler for WindowAggregationHandler<R, A, S>
where
    R: Send + 'static,
    A: AggregateFunction,
    S: SliceState<A>,
{
    type Input = RecordBuffer<R>;

    fn setup(&self, ctx: &SetupContext) -> Result<()> {
        self.config.validate()?;
        ctx.validate()?;
        self.lifecycle
            .advance(LifecyclePhase::Created, LifecyclePhase::SetUp)?;

        let definition = self.assigner.definition();
        let pre_aggregation = self.config.window.pre_aggregation;
        let pool = BufferPool::new(&self.config.buffers, self.config.timeouts.allocation_timeout());
        let state = AggregationState {
            watermarks: MultiOriginWatermarkProcessor::new(
                &ctx.origins,
                self.config.watermark.reorder_capacity,
            ),
            stores: (0..ctx.num_workers)
                .map(|_| CachePadded::new(Mutex::new(WorkerStore::new(pre_aggregation, self.assigner))))
                .collect(),
            staging: SliceStaging::new(ctx.num_workers),
            sliding: (!definition.is_tumbling() && pre_aggregation == PreAggregation::Slices)
                .then(|| SlidingWindowStore::new(self.assigner)),
            emitter: WindowEmitter::new(pool, self.sink.clone(), self.config.result_origin_id),
        };
        // The lifecycle admits a single setup.
        let _ = self.state.set(state);
        info!(
            "window aggregation set up: size {}, slide {}, {pre_aggregation} pre-aggregation, {} workers, {} origins",
            definition.size,
            definition.slide,
            ctx.num_workers,
            ctx.origins.len()
        );
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.lifecycle
            .advance(LifecyclePhase::SetUp, LifecyclePhase::Running)
    }

    fn on_buffer(&self, ctx: &WorkerContext, buffer: RecordBuffer<R>) -> Result<()> {
        self.lifecycle.ensure(LifecyclePhase::Running)?;
        let state = self.state()?;
        let worker = ctx.worker_id;
        let mut store = state.store(worker)?;

        // A buffer rejected by its origin's sequencer leaves no trace.
        let global = state.watermarks.update_watermark(
            buffer.origin_id,
            buffer.sequence_number,
            buffer.watermark_ts,
        )?;

        let mut late = 0u64;
        for record in &buffer.records {
            let ts = self.time.timestamp(record, &buffer);
            let (key, input) = (self.extract)(record);
            match store.accumulate(ts, |partial| {
                partial.accumulate(&self.agg, key.clone(), &input)
            }) {
                Ok(()) => {}
                Err(error) if error.is_late_record() => {
                    trace!("worker {worker}: {error}");
                    late += 1;
                }
                Err(error) => return Err(error),
            }
        }
        metrics::counter!("slicer.records_processed").increment(buffer.len() as u64);
        if late > 0 {
            warn!(
                "worker {worker} dropped {late} late records from origin {} (watermark {})",
                buffer.origin_id,
                store.last_watermark()
            );
            metrics::counter!("slicer.late_records_dropped").increment(late);
        }

        let tasks = if global > store.last_watermark() {
            self.close_slices(state, worker, &mut store, global)?
        } else {
            Vec::new()
        };
        drop(store);

        self.run_tasks(state, tasks);
        self.trigger_sliding(state);
        if let Some(timeout) = self.config.timeouts.merge_timeout() {
            for error in state.staging.abandon_stuck(timeout) {
                self.report_failure(error);
            }
        }
        Ok(())
    }

    fn current_watermark(&self) -> Timestamp {
        self.state
            .get()
            .map(|state| state.watermarks.current_watermark())
            .unwrap_or(0)
    }

    fn report_failure(&self, error: Error) {
        self.failures.report(&error);
    }

    fn stop(&self, termination: TerminationType) -> Result<StopReport> {
        self.lifecycle
            .advance(LifecyclePhase::Running, LifecyclePhase::Stopped)?;
        let state = self.state()?;
        let mut report = StopReport {
            termination,
            ..StopReport::default()
        };

        let mut discarded = BTreeSet::new();
        if termination.flushes() {
            for worker in 0..state.stores.len() {
                let tasks = {
                    let mut store = state.store(worker)?;
                    self.close_slices(state, worker, &mut store, Timestamp::MAX)?
                };
                report.flushed.extend(self.run_tasks(state, tasks));
            }
            report.flushed.extend(self.trigger_sliding(state));
        } else {
            discarded = self.discard_all(state)?;
        }

        for window in state.staging.drain() {
            warn!(
                "discarding window {} with {} of {} contributions",
                window.bounds, window.contributions, window.expected
            );
            discarded.insert(window.bounds);
        }
        report.discarded = discarded.into_iter().collect();
        report.failures = self.failures.drain();
        info!(
            "window aggregation stopped ({termination}): {} windows flushed, {} discarded, {} failures",
            report.flushed.len(),
            report.discarded.len(),
            report.failures.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::NonKeyedWindowHandler;
    use crate::aggregation::function::Sum;
    use crate::buffer::{CollectingSink, RecordBuffer};
    use crate::error::{Error, ProtocolViolation};
    use crate::operator::{OperatorHandler, SetupContext, WorkerContext};
    use crate::test_util::init_logging;
    use crate::window::{TimeFunction, WindowBounds, WindowRecord};
    use pretty_assertions::assert_eq;
    use slicer_types::{EngineConfig, PreAggregation, TerminationType};
    use std::sync::Arc;

    type Record = (u64, i64);

    fn handler(
        config: EngineConfig,
        workers: usize,
        origins: &[u64],
    ) -> (
        NonKeyedWindowHandler<Record, Sum<i64>>,
        CollectingSink<WindowRecord<(), i64>>,
    ) {
        let sink = CollectingSink::new();
        let handler = NonKeyedWindowHandler::non_keyed(
            config,
            Sum::<i64>::default(),
            TimeFunction::event_time(|record: &Record| record.0),
            |record: &Record| record.1,
            Arc::new(sink.clone()),
        );
        handler
            .setup(&SetupContext::new(workers, origins.iter().copied()))
            .unwrap();
        handler.start().unwrap();
        (handler, sink)
    }

    fn values(sink: &CollectingSink<WindowRecord<(), i64>>) -> Vec<(u64, u64, i64)> {
        sink.records()
            .into_iter()
            .map(|record| (record.start, record.end, record.value))
            .collect()
    }

    #[test]
    fn tumbling_two_workers() {
        init_logging();
        let config = EngineConfig::default().with_workers(2).with_window(1000, 1000);
        let (handler, sink) = handler(config, 2, &[1, 2]);
        let w0 = WorkerContext::new(0, 2);
        let w1 = WorkerContext::new(1, 2);

        handler
            .on_buffer(&w0, RecordBuffer::new(1, 0, 500, vec![(100, 1), (400, 2)]))
            .unwrap();
        handler
            .on_buffer(&w1, RecordBuffer::new(2, 0, 900, vec![(800, 4)]))
            .unwrap();
        assert_eq!(handler.current_watermark(), 500);
        handler
            .on_buffer(&w0, RecordBuffer::new(1, 1, 1500, vec![(1200, 8)]))
            .unwrap();
        handler
            .on_buffer(&w1, RecordBuffer::new(2, 1, 2000, vec![(1100, 16)]))
            .unwrap();
        // Worker 0 has not passed 1000 yet.
        assert_eq!(sink.num_buffers(), 0);

        handler
            .on_buffer(&w0, RecordBuffer::new(1, 2, 2500, Vec::new()))
            .unwrap();
        assert_eq!(values(&sink), vec![(0, 1000, 7)]);

        let report = handler.stop(TerminationType::Graceful).unwrap();
        assert_eq!(report.flushed, vec![WindowBounds::new(1000, 2000)]);
        assert!(report.discarded.is_empty());
        assert_eq!(values(&sink), vec![(0, 1000, 7), (1000, 2000, 24)]);
        assert_eq!(
            sink.headers(),
            vec![(u64::MAX, 1, 1000), (u64::MAX, 2, 2000)]
        );
        assert_eq!(handler.windows_emitted(), 2);
        assert!(format!("{handler:?}").contains("windows_emitted: 2"));
    }

    #[test]
    fn sliding_windows_and_late_records() {
        init_logging();
        let config = EngineConfig::default().with_workers(1).with_window(100, 50);
        let (handler, sink) = handler(config, 1, &[1]);
        let w0 = WorkerContext::new(0, 1);

        handler
            .on_buffer(
                &w0,
                RecordBuffer::new(1, 0, 150, vec![(10, 1), (60, 2), (110, 4)]),
            )
            .unwrap();
        assert_eq!(values(&sink), vec![(0, 100, 3), (50, 150, 6)]);

        // The slice [0, 50) was closed at watermark 150.
        handler
            .on_buffer(&w0, RecordBuffer::new(1, 1, 160, vec![(20, 100)]))
            .unwrap();

        let report = handler.stop(TerminationType::Graceful).unwrap();
        assert_eq!(report.flushed, vec![WindowBounds::new(100, 200)]);
        assert_eq!(
            values(&sink),
            vec![(0, 100, 3), (50, 150, 6), (100, 200, 4)]
        );
    }

    #[test]
    fn bucket_pre_aggregation_matches_slices() {
        init_logging();
        let run = |pre_aggregation| {
            let mut config = EngineConfig::default().with_workers(2).with_window(100, 30);
            config.window = config.window.with_pre_aggregation(pre_aggregation);
            let (handler, sink) = handler(config, 2, &[1, 2]);
            let w0 = WorkerContext::new(0, 2);
            let w1 = WorkerContext::new(1, 2);
            handler
                .on_buffer(
                    &w0,
                    RecordBuffer::new(1, 0, 120, vec![(10, 1), (40, 2), (95, 4)]),
                )
                .unwrap();
            handler
                .on_buffer(&w1, RecordBuffer::new(2, 0, 200, vec![(70, 8), (130, 16)]))
                .unwrap();
            handler
                .on_buffer(&w0, RecordBuffer::new(1, 1, 260, vec![(150, 32), (250, 64)]))
                .unwrap();
            let report = handler.stop(TerminationType::Graceful).unwrap();
            assert!(report.failures.is_empty());
            let mut windows = values(&sink);
            windows.sort();
            windows
        };

        let expected = vec![
            (0, 100, 15),
            (30, 130, 14),
            (60, 160, 60),
            (90, 190, 52),
            (120, 220, 48),
            (150, 250, 32),
            (180, 280, 64),
            (210, 310, 64),
            (240, 340, 64),
        ];
        assert_eq!(run(PreAggregation::Slices), expected);
        assert_eq!(run(PreAggregation::Buckets), expected);
    }

    #[test]
    fn hard_stop_discards() {
        init_logging();
        let config = EngineConfig::default().with_workers(2).with_window(100, 100);
        let (handler, sink) = handler(config, 2, &[1]);
        let w0 = WorkerContext::new(0, 2);

        handler
            .on_buffer(&w0, RecordBuffer::new(1, 0, 250, vec![(10, 1), (120, 2), (260, 3)]))
            .unwrap();
        // Worker 1 never advanced, so nothing could be merged.
        assert_eq!(sink.num_buffers(), 0);

        let report = handler.stop(TerminationType::HardStop).unwrap();
        assert!(report.flushed.is_empty());
        assert_eq!(
            report.discarded,
            vec![
                WindowBounds::new(0, 100),
                WindowBounds::new(100, 200),
                WindowBounds::new(200, 300),
            ]
        );
        assert_eq!(sink.num_buffers(), 0);
    }

    #[test]
    fn protocol_errors() {
        init_logging();
        let config = EngineConfig::default().with_workers(1).with_window(100, 100);
        let (handler, _sink) = handler(config, 1, &[1]);
        let w0 = WorkerContext::new(0, 1);

        assert!(matches!(
            handler.on_buffer(&w0, RecordBuffer::new(7, 0, 10, Vec::new())),
            Err(Error::ProtocolViolation(ProtocolViolation::UnknownOrigin { origin: 7 }))
        ));
        assert!(matches!(
            handler.on_buffer(&WorkerContext::new(3, 1), RecordBuffer::new(1, 0, 10, Vec::new())),
            Err(Error::ProtocolViolation(ProtocolViolation::WorkerOutOfRange { worker: 3, .. }))
        ));
        handler
            .on_buffer(&w0, RecordBuffer::new(1, 0, 10, Vec::new()))
            .unwrap();
        assert!(matches!(
            handler.on_buffer(&w0, RecordBuffer::new(1, 0, 20, Vec::new())),
            Err(Error::ProtocolViolation(ProtocolViolation::DuplicateSequence { .. }))
        ));
        handler.stop(TerminationType::Graceful).unwrap();
        assert!(matches!(
            handler.stop(TerminationType::Graceful),
            Err(Error::Lifecycle { .. })
        ));
    }

    #[test]
    fn rejected_buffers_leave_no_trace() {
        init_logging();
        let config = EngineConfig::default().with_workers(1).with_window(100, 100);
        let (handler, sink) = handler(config, 1, &[1]);
        let w0 = WorkerContext::new(0, 1);

        handler
            .on_buffer(&w0, RecordBuffer::new(1, 0, 10, vec![(5, 1)]))
            .unwrap();
        assert!(matches!(
            handler.on_buffer(&w0, RecordBuffer::new(1, 0, 10, vec![(5, 100)])),
            Err(Error::ProtocolViolation(ProtocolViolation::DuplicateSequence { .. }))
        ));
        assert!(matches!(
            handler.on_buffer(&w0, RecordBuffer::new(9, 0, 10, vec![(6, 1000)])),
            Err(Error::ProtocolViolation(ProtocolViolation::UnknownOrigin { origin: 9 }))
        ));
        handler
            .on_buffer(&w0, RecordBuffer::new(1, 1, 200, Vec::new()))
            .unwrap();
        assert_eq!(values(&sink), vec![(0, 100, 1)]);
    }
}
