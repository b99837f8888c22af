//! The windowed stream join operator.
//!
//! Both inputs are assigned to windows by timestamp.  Every worker inserts
//! its records into the build structure of each window and signals through
//! a [`SliceStaging`] barrier once its watermark passed the window end.
//! Only when all workers signaled is the window joined: hash joins split
//! the probe into one [`JoinProbeTask`] per bucket that any worker may pick
//! up, nested-loop joins are performed by the worker completing the
//! barrier.

use super::hash_table::{SealedHashTable, StreamJoinHashTable};
use super::nested_loop::NestedLoopPartition;
use super::page::PageAllocator;
use crate::aggregation::{DiscardedWindow, SliceMergeTask, SliceStaging};
use crate::buffer::{BufferPool, RecordBuffer, Sink};
use crate::error::{Error, ProtocolViolation, Result};
use crate::operator::{
    FailureChannel, Lifecycle, LifecyclePhase, OperatorHandler, SetupContext, StopReport,
    WorkerContext,
};
use crate::watermark::MultiOriginWatermarkProcessor;
use crate::window::{
    AtomicWindowState, SliceAssigner, TimeFunction, WindowBounds, WindowDefinition,
    WindowEmitter, WindowState,
};
use crate::{OriginId, Timestamp};
use crossbeam::queue::SegQueue;
use crossbeam_utils::CachePadded;
use serde::Serialize;
use slicer_types::{EngineConfig, InsertStrategy, JoinAlgorithmKind, JoinConfig, TerminationType};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Display};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, TryLockError};
use tracing::{debug, info, trace, warn};

/// How the records of a window are matched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum JoinAlgorithm {
    Hash(InsertStrategy),
    NestedLoop,
}

impl JoinAlgorithm {
    pub fn from_config(config: &JoinConfig) -> Self {
        match config.algorithm {
            JoinAlgorithmKind::Hash => Self::Hash(config.strategy),
            JoinAlgorithmKind::NestedLoop => Self::NestedLoop,
        }
    }
}

impl Display for JoinAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hash(strategy) => write!(f, "hash join ({strategy})"),
            Self::NestedLoop => write!(f, "nested-loop join"),
        }
    }
}

/// An input buffer of either join side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinInput<L, R> {
    Left(RecordBuffer<L>),
    Right(RecordBuffer<R>),
}

impl<L, R> JoinInput<L, R> {
    pub fn origin_id(&self) -> OriginId {
        match self {
            Self::Left(buffer) => buffer.origin_id,
            Self::Right(buffer) => buffer.origin_id,
        }
    }

    pub fn sequence_number(&self) -> u64 {
        match self {
            Self::Left(buffer) => buffer.sequence_number,
            Self::Right(buffer) => buffer.sequence_number,
        }
    }

    pub fn watermark_ts(&self) -> Timestamp {
        match self {
            Self::Left(buffer) => buffer.watermark_ts,
            Self::Right(buffer) => buffer.watermark_ts,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Left(buffer) => buffer.len(),
            Self::Right(buffer) => buffer.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One match of a left and a right record within a window.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct JoinedRecord<K, L, R> {
    pub start: Timestamp,
    pub end: Timestamp,
    pub key: K,
    pub left: L,
    pub right: R,
}

type KeyFunction<T, K> = Arc<dyn Fn(&T) -> K + Send + Sync>;

/// Build tables of one window, filled concurrently by all workers.
struct HashJoinWindow<K, L, R> {
    left: StreamJoinHashTable<K, L>,
    right: StreamJoinHashTable<K, R>,
}

/// A window whose build phase is over.
struct SealedWindow<K, L, R> {
    bounds: WindowBounds,
    left: SealedHashTable<K, L>,
    right: SealedHashTable<K, R>,
    /// Probe tasks not finished yet.
    remaining: AtomicUsize,
    joined: AtomicUsize,
    state: AtomicWindowState,
}

/// Probe of one bucket of a sealed window.
struct JoinProbeTask<K, L, R> {
    window: Arc<SealedWindow<K, L, R>>,
    bucket: usize,
}

/// Build tables by window.  Abandoned windows stay listed until every
/// worker passed them, so a slow worker cannot recreate their tables.
struct BuildWindows<K, L, R> {
    open: BTreeMap<WindowBounds, Arc<HashJoinWindow<K, L, R>>>,
    abandoned: BTreeSet<WindowBounds>,
}

struct HashJoinBuild<K, L, R> {
    strategy: InsertStrategy,
    buckets: usize,
    allocator: PageAllocator,
    windows: RwLock<BuildWindows<K, L, R>>,
    /// Completion barrier of the build phase.
    barrier: SliceStaging<()>,
    probes: SegQueue<JoinProbeTask<K, L, R>>,
}

impl<K, L, R> HashJoinBuild<K, L, R> {
    fn new(strategy: InsertStrategy, config: &EngineConfig, num_workers: usize) -> Self {
        Self {
            strategy,
            buckets: config.join.buckets,
            allocator: PageAllocator::new(&config.join, config.timeouts.allocation_timeout()),
            windows: RwLock::new(BuildWindows {
                open: BTreeMap::new(),
                abandoned: BTreeSet::new(),
            }),
            barrier: SliceStaging::new(num_workers),
            probes: SegQueue::new(),
        }
    }

    /// The build tables of `bounds`, created on first use.  `None` once the
    /// window was abandoned.
    fn window(&self, bounds: WindowBounds) -> Option<Arc<HashJoinWindow<K, L, R>>> {
        let existing = self
            .windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .open
            .get(&bounds)
            .cloned();
        if existing.is_some() {
            return existing;
        }

        let mut guard = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        let windows = &mut *guard;
        if windows.abandoned.contains(&bounds) {
            return None;
        }
        let window = windows.open.entry(bounds).or_insert_with(|| {
            trace!("creating hash tables for window {bounds}");
            Arc::new(HashJoinWindow {
                left: StreamJoinHashTable::new(self.buckets, self.strategy, self.allocator.clone()),
                right: StreamJoinHashTable::new(self.buckets, self.strategy, self.allocator.clone()),
            })
        });
        Some(window.clone())
    }

    fn remove_window(&self, bounds: &WindowBounds) -> Option<Arc<HashJoinWindow<K, L, R>>> {
        self.windows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .open
            .remove(bounds)
    }

    /// Drops the tables of an abandoned window and refuses to build it
    /// again.
    fn abandon_window(&self, bounds: WindowBounds) {
        let passed = self.barrier.min_worker_watermark();
        let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        windows.open.remove(&bounds);
        windows.abandoned.insert(bounds);
        windows.abandoned.retain(|abandoned| abandoned.end > passed);
    }

    fn take_windows(&self) -> BTreeMap<WindowBounds, Arc<HashJoinWindow<K, L, R>>> {
        let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        windows.abandoned.clear();
        std::mem::take(&mut windows.open)
    }
}

impl<K: Hash, L, R> HashJoinBuild<K, L, R> {
    /// Seals the tables of `bounds` and queues one probe task for every
    /// bucket holding records on both sides.
    fn seal(&self, bounds: WindowBounds) {
        let Some(window) = self.remove_window(&bounds) else {
            debug!("window {bounds} has no build tables");
            return;
        };
        let left = window.left.seal();
        let right = window.right.seal();
        let buckets: Vec<usize> = (0..right.num_buckets())
            .filter(|bucket| {
                right.bucket_entries(*bucket).next().is_some()
                    && left.bucket_entries(*bucket).next().is_some()
            })
            .collect();
        debug!(
            "sealed window {bounds}: {} left and {} right records, {} buckets to probe",
            left.num_records(),
            right.num_records(),
            buckets.len()
        );
        if buckets.is_empty() {
            return;
        }

        let sealed = Arc::new(SealedWindow {
            bounds,
            left,
            right,
            remaining: AtomicUsize::new(buckets.len()),
            joined: AtomicUsize::new(0),
            state: AtomicWindowState::new(WindowState::Merged),
        });
        for bucket in buckets {
            self.probes.push(JoinProbeTask {
                window: sealed.clone(),
                bucket,
            });
        }
    }
}

enum JoinBuild<K, L, R> {
    Hash(HashJoinBuild<K, L, R>),
    NestedLoop(SliceStaging<NestedLoopPartition<K, L, R>>),
}

impl<K, L, R> JoinBuild<K, L, R> {
    fn drain_staging(&self) -> Vec<DiscardedWindow> {
        match self {
            Self::Hash(hash) => hash.barrier.drain(),
            Self::NestedLoop(staging) => staging.drain(),
        }
    }

    fn abandon_stuck(&self, timeout: std::time::Duration) -> Vec<Error> {
        match self {
            Self::Hash(hash) => {
                let abandoned = hash.barrier.abandon_stuck(timeout);
                for error in &abandoned {
                    if let Error::WindowAbandoned { bounds, .. } = error {
                        hash.abandon_window(*bounds);
                    }
                }
                abandoned
            }
            Self::NestedLoop(staging) => staging.abandon_stuck(timeout),
        }
    }
}

impl<K: Hash, L, R> JoinBuild<K, L, R> {
    fn insert_left(
        &self,
        local: &mut WorkerJoinState<K, L, R>,
        bounds: WindowBounds,
        key: K,
        record: L,
    ) -> Result<()> {
        match self {
            Self::Hash(hash) => match hash.window(bounds) {
                Some(window) => {
                    window.left.insert_record(key, record)?;
                    local.touched.insert(bounds);
                }
                None => trace!("dropping left record of abandoned window {bounds}"),
            },
            Self::NestedLoop(_) => local
                .partitions
                .entry(bounds)
                .or_default()
                .push_left(key, record),
        }
        Ok(())
    }

    fn insert_right(
        &self,
        local: &mut WorkerJoinState<K, L, R>,
        bounds: WindowBounds,
        key: K,
        record: R,
    ) -> Result<()> {
        match self {
            Self::Hash(hash) => match hash.window(bounds) {
                Some(window) => {
                    window.right.insert_record(key, record)?;
                    local.touched.insert(bounds);
                }
                None => trace!("dropping right record of abandoned window {bounds}"),
            },
            Self::NestedLoop(_) => local
                .partitions
                .entry(bounds)
                .or_default()
                .push_right(key, record),
        }
        Ok(())
    }
}

/// What a single worker keeps between buffers.
struct WorkerJoinState<K, L, R> {
    last_watermark: Timestamp,
    /// Hash windows this worker inserted into and has not signaled yet.
    touched: BTreeSet<WindowBounds>,
    /// Nested-loop build buffers of this worker.
    partitions: BTreeMap<WindowBounds, NestedLoopPartition<K, L, R>>,
}

impl<K, L, R> Default for WorkerJoinState<K, L, R> {
    fn default() -> Self {
        Self {
            last_watermark: 0,
            touched: BTreeSet::new(),
            partitions: BTreeMap::new(),
        }
    }
}

/// Windows whose build phase a worker completed, together with the build
/// they belong to.
enum BuildTasks<'a, K, L, R> {
    Hash(&'a HashJoinBuild<K, L, R>, Vec<SliceMergeTask<()>>),
    NestedLoop(
        &'a SliceStaging<NestedLoopPartition<K, L, R>>,
        Vec<SliceMergeTask<NestedLoopPartition<K, L, R>>>,
    ),
}

struct JoinState<K, L, R> {
    watermarks: MultiOriginWatermarkProcessor,
    workers: Box<[CachePadded<Mutex<WorkerJoinState<K, L, R>>>]>,
    build: JoinBuild<K, L, R>,
    emitter: WindowEmitter<JoinedRecord<K, L, R>>,
}

impl<K, L, R> JoinState<K, L, R> {
    fn local(&self, worker: usize) -> Result<MutexGuard<'_, WorkerJoinState<K, L, R>>> {
        let local = self
            .workers
            .get(worker)
            .ok_or(ProtocolViolation::WorkerOutOfRange {
                worker,
                num_workers: self.workers.len(),
            })?;
        match local.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                Err(ProtocolViolation::ConcurrentWorkerAccess { worker }.into())
            }
        }
    }
}

/// Windowed equi-join of a left stream of `L` and a right stream of `R`
/// on a key of type `K`.
///
/// Every pair of records with equal keys that fall into the same window is
/// written to `sink` as a [`JoinedRecord`].
pub struct StreamJoinHandler<K, L, R> {
    config: EngineConfig,
    algorithm: JoinAlgorithm,
    assigner: SliceAssigner,
    left_time: TimeFunction<L>,
    left_key: KeyFunction<L, K>,
    right_time: TimeFunction<R>,
    right_key: KeyFunction<R, K>,
    sink: Arc<dyn Sink<JoinedRecord<K, L, R>>>,
    state: OnceLock<JoinState<K, L, R>>,
    lifecycle: Lifecycle,
    failures: FailureChannel,
    windows_joined: AtomicU64,
}

impl<K, L, R> Debug for StreamJoinHandler<K, L, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamJoinHandler")
            .field("algorithm", &self.algorithm)
            .field("definition", &self.assigner.definition())
            .field("lifecycle", &self.lifecycle.phase())
            .field("windows_joined", &self.windows_joined.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<K, L, R> StreamJoinHandler<K, L, R>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    L: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Creates a join using the algorithm selected in `config.join`.
    pub fn new<FL, FR>(
        config: EngineConfig,
        left_time: TimeFunction<L>,
        left_key: FL,
        right_time: TimeFunction<R>,
        right_key: FR,
        sink: Arc<dyn Sink<JoinedRecord<K, L, R>>>,
    ) -> Self
    where
        FL: Fn(&L) -> K + Send + Sync + 'static,
        FR: Fn(&R) -> K + Send + Sync + 'static,
    {
        Self {
            algorithm: JoinAlgorithm::from_config(&config.join),
            assigner: SliceAssigner::new(WindowDefinition::from(&config.window)),
            config,
            left_time,
            left_key: Arc::new(left_key),
            right_time,
            right_key: Arc::new(right_key),
            sink,
            state: OnceLock::new(),
            lifecycle: Lifecycle::new("stream join"),
            failures: FailureChannel::default(),
            windows_joined: AtomicU64::new(0),
        }
    }

    pub fn with_algorithm(mut self, algorithm: JoinAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn algorithm(&self) -> JoinAlgorithm {
        self.algorithm
    }

    /// Number of windows that produced at least one match.
    pub fn windows_joined(&self) -> u64 {
        self.windows_joined.load(Ordering::Relaxed)
    }

    fn state(&self) -> Result<&JoinState<K, L, R>> {
        self.state.get().ok_or_else(|| Error::Lifecycle {
            expected: LifecyclePhase::SetUp,
            actual: self.lifecycle.phase(),
        })
    }

    /// Assigns every record of `buffer` to the windows containing it that
    /// this worker has not closed yet.
    fn insert_records<T>(
        &self,
        worker: usize,
        local: &mut WorkerJoinState<K, L, R>,
        buffer: &RecordBuffer<T>,
        time: &TimeFunction<T>,
        key_of: &KeyFunction<T, K>,
        mut insert: impl FnMut(&mut WorkerJoinState<K, L, R>, WindowBounds, K, &T) -> Result<()>,
    ) -> Result<()> {
        let mut late = 0u64;
        for record in &buffer.records {
            let ts = time.timestamp(record, buffer);
            let key = key_of(record);
            let mut assigned = false;
            for bounds in self.assigner.windows_containing(ts) {
                if bounds.end <= local.last_watermark {
                    continue;
                }
                insert(local, bounds, key.clone(), record)?;
                assigned = true;
            }
            if !assigned {
                trace!(
                    "worker {worker}: {}",
                    Error::late_record(ts, local.last_watermark)
                );
                late += 1;
            }
        }
        metrics::counter!("slicer.records_processed").increment(buffer.len() as u64);
        if late > 0 {
            warn!(
                "worker {worker} dropped {late} late records from origin {} (watermark {})",
                buffer.origin_id, local.last_watermark
            );
            metrics::counter!("slicer.late_records_dropped").increment(late);
        }
        Ok(())
    }

    /// Signals the end of the build phase of every window of `worker`
    /// ending at or before `watermark`.
    fn close_windows<'s>(
        &self,
        state: &'s JoinState<K, L, R>,
        worker: usize,
        local: &mut WorkerJoinState<K, L, R>,
        watermark: Timestamp,
    ) -> Result<BuildTasks<'s, K, L, R>> {
        local.last_watermark = watermark;
        match &state.build {
            JoinBuild::Hash(hash) => {
                let mut tasks = Vec::new();
                while let Some(bounds) = local.touched.first().copied() {
                    if bounds.end > watermark {
                        break;
                    }
                    local.touched.pop_first();
                    tasks.extend(hash.barrier.stage_slice(bounds, worker, ())?);
                }
                tasks.extend(hash.barrier.advance_worker(worker, watermark)?);
                Ok(BuildTasks::Hash(hash, tasks))
            }
            JoinBuild::NestedLoop(staging) => {
                let mut tasks = Vec::new();
                while let Some(entry) = local.partitions.first_entry() {
                    if entry.key().end > watermark {
                        break;
                    }
                    let (bounds, partition) = entry.remove_entry();
                    tasks.extend(staging.stage_slice(bounds, worker, partition)?);
                }
                tasks.extend(staging.advance_worker(worker, watermark)?);
                Ok(BuildTasks::NestedLoop(staging, tasks))
            }
        }
    }

    /// Runs the joins that became possible, reporting failures instead of
    /// returning them.  Returns the windows that produced output.
    fn run_tasks(&self, state: &JoinState<K, L, R>, tasks: BuildTasks<'_, K, L, R>) -> Vec<WindowBounds> {
        let mut joined = Vec::new();
        match tasks {
            BuildTasks::Hash(hash, tasks) => {
                for task in tasks {
                    hash.seal(task.bounds());
                    hash.barrier.complete(task.bounds());
                }
                joined.extend(self.drain_probes(state, hash));
            }
            BuildTasks::NestedLoop(staging, tasks) => {
                for task in tasks {
                    let bounds = task.bounds();
                    let result = self.nested_loop_join(state, task);
                    staging.complete(bounds);
                    match result {
                        Ok(window) => joined.extend(window),
                        Err(error) => {
                            warn!("joining window {bounds} failed: {error}");
                            self.report_failure(error);
                        }
                    }
                }
            }
        }
        joined
    }

    /// Probes queued bucket partitions until the queue is empty.
    fn drain_probes(
        &self,
        state: &JoinState<K, L, R>,
        hash: &HashJoinBuild<K, L, R>,
    ) -> Vec<WindowBounds> {
        let mut joined = Vec::new();
        while let Some(task) = hash.probes.pop() {
            let bounds = task.window.bounds;
            match self.probe(state, task) {
                Ok(window) => joined.extend(window),
                Err(error) => {
                    warn!("probing window {bounds} failed: {error}");
                    self.report_failure(error);
                }
            }
        }
        joined
    }

    fn probe(
        &self,
        state: &JoinState<K, L, R>,
        task: JoinProbeTask<K, L, R>,
    ) -> Result<Option<WindowBounds>> {
        let window = &task.window;
        let bounds = window.bounds;
        let records: Vec<_> = window
            .right
            .bucket_entries(task.bucket)
            .flat_map(|right| {
                window.left.probe(&right.key).map(move |left| JoinedRecord {
                    start: bounds.start,
                    end: bounds.end,
                    key: right.key.clone(),
                    left: left.clone(),
                    right: right.value.clone(),
                })
            })
            .collect();
        trace!(
            "probed bucket {} of window {bounds}: {} matches",
            task.bucket,
            records.len()
        );

        window.joined.fetch_add(records.len(), Ordering::AcqRel);
        let emitted = self.emit_joined(state, bounds, records);
        let last = window.remaining.fetch_sub(1, Ordering::AcqRel) == 1;
        let finished = if last {
            self.finish_window(window)?
        } else {
            None
        };
        emitted?;
        Ok(finished)
    }

    /// Called by the worker that probed the last partition of a window.
    fn finish_window(&self, window: &SealedWindow<K, L, R>) -> Result<Option<WindowBounds>> {
        let bounds = window.bounds;
        let joined = window.joined.load(Ordering::Acquire);
        if joined == 0 {
            debug!("window {bounds} has no matches");
            window.state.discard();
            return Ok(None);
        }
        window
            .state
            .transition(WindowState::Merged, WindowState::Emitted, bounds)?;
        self.windows_joined.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("slicer.windows_emitted").increment(1);
        debug!(
            "joined window {bounds}: {joined} matches from {} left and {} right records",
            window.left.num_records(),
            window.right.num_records()
        );
        Ok(Some(bounds))
    }

    fn nested_loop_join(
        &self,
        state: &JoinState<K, L, R>,
        task: SliceMergeTask<NestedLoopPartition<K, L, R>>,
    ) -> Result<Option<WindowBounds>> {
        let bounds = task.bounds();
        let partition = NestedLoopPartition::combine(task.into_parts());
        let records: Vec<_> = partition
            .join()
            .map(|(key, left, right)| JoinedRecord {
                start: bounds.start,
                end: bounds.end,
                key: key.clone(),
                left: left.clone(),
                right: right.clone(),
            })
            .collect();
        if records.is_empty() {
            debug!(
                "window {bounds} has no matches among {} records",
                partition.len()
            );
            return Ok(None);
        }
        let joined = records.len();
        self.emit_joined(state, bounds, records)?;
        self.windows_joined.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("slicer.windows_emitted").increment(1);
        debug!("joined window {bounds}: {joined} matches");
        Ok(Some(bounds))
    }

    fn emit_joined(
        &self,
        state: &JoinState<K, L, R>,
        bounds: WindowBounds,
        records: Vec<JoinedRecord<K, L, R>>,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        metrics::counter!("slicer.joined_records").increment(records.len() as u64);
        state.emitter.emit(bounds.end, records)?;
        Ok(())
    }

    /// Drops all build state of a stopped join.  Returns the windows that
    /// were in progress.
    fn discard_all(&self, state: &JoinState<K, L, R>) -> Result<BTreeSet<WindowBounds>> {
        let mut discarded = BTreeSet::new();
        for worker in 0..state.workers.len() {
            let mut local = state.local(worker)?;
            discarded.extend(local.touched.iter().copied());
            discarded.extend(local.partitions.keys().copied());
            *local = WorkerJoinState::default();
        }
        if let JoinBuild::Hash(hash) = &state.build {
            while let Some(task) = hash.probes.pop() {
                if task.window.state.discard().is_some() {
                    discarded.insert(task.window.bounds);
                }
            }
        }
        Ok(discarded)
    }
}

impl<K, L, R> OperatorHandler for StreamJoinHandler<K, L, R>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    L: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    type Input = JoinInput<L, R>;

    fn setup(&self, ctx: &SetupContext) -> Result<()> {
        self.config.validate()?;
        ctx.validate()?;
        self.lifecycle
            .advance(LifecyclePhase::Created, LifecyclePhase::SetUp)?;

        let build = match self.algorithm {
            JoinAlgorithm::Hash(strategy) => {
                JoinBuild::Hash(HashJoinBuild::new(strategy, &self.config, ctx.num_workers))
            }
            JoinAlgorithm::NestedLoop => {
                JoinBuild::NestedLoop(SliceStaging::new(ctx.num_workers))
            }
        };
        let pool = BufferPool::new(&self.config.buffers, self.config.timeouts.allocation_timeout());
        let state = JoinState {
            watermarks: MultiOriginWatermarkProcessor::new(
                &ctx.origins,
                self.config.watermark.reorder_capacity,
            ),
            workers: (0..ctx.num_workers)
                .map(|_| CachePadded::new(Mutex::new(WorkerJoinState::default())))
                .collect(),
            build,
            emitter: WindowEmitter::new(pool, self.sink.clone(), self.config.result_origin_id),
        };
        // The lifecycle admits a single setup.
        let _ = self.state.set(state);
        let definition = self.assigner.definition();
        info!(
            "{} set up: size {}, slide {}, {} workers, {} origins",
            self.algorithm,
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

    fn on_buffer(&self, ctx: &WorkerContext, input: JoinInput<L, R>) -> Result<()> {
        self.lifecycle.ensure(LifecyclePhase::Running)?;
        let state = self.state()?;
        let worker = ctx.worker_id;
        let mut local = state.local(worker)?;

        // Duplicate or foreign buffers are refused before any insertion.
        let global = state.watermarks.update_watermark(
            input.origin_id(),
            input.sequence_number(),
            input.watermark_ts(),
        )?;

        match &input {
            JoinInput::Left(buffer) => self.insert_records(
                worker,
                &mut local,
                buffer,
                &self.left_time,
                &self.left_key,
                |local, bounds, key, record| {
                    state.build.insert_left(local, bounds, key, record.clone())
                },
            )?,
            JoinInput::Right(buffer) => self.insert_records(
                worker,
                &mut local,
                buffer,
                &self.right_time,
                &self.right_key,
                |local, bounds, key, record| {
                    state.build.insert_right(local, bounds, key, record.clone())
                },
            )?,
        }

        let tasks = if global > local.last_watermark {
            Some(self.close_windows(state, worker, &mut local, global)?)
        } else {
            None
        };
        drop(local);

        match tasks {
            Some(tasks) => {
                self.run_tasks(state, tasks);
            }
            None => {
                // Help with probes queued by other workers.
                if let JoinBuild::Hash(hash) = &state.build {
                    self.drain_probes(state, hash);
                }
            }
        }
        if let Some(timeout) = self.config.timeouts.merge_timeout() {
            for error in state.build.abandon_stuck(timeout) {
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
            for worker in 0..state.workers.len() {
                let tasks = {
                    let mut local = state.local(worker)?;
                    self.close_windows(state, worker, &mut local, Timestamp::MAX)?
                };
                report.flushed.extend(self.run_tasks(state, tasks));
            }
        } else {
            discarded = self.discard_all(state)?;
        }

        for window in state.build.drain_staging() {
            warn!(
                "discarding window {} with {} of {} build signals",
                window.bounds, window.contributions, window.expected
            );
            discarded.insert(window.bounds);
        }
        if let JoinBuild::Hash(hash) = &state.build {
            discarded.extend(hash.take_windows().into_keys());
        }
        report.discarded = discarded.into_iter().collect();
        report.failures = self.failures.drain();
        info!(
            "{} stopped ({termination}): {} windows flushed, {} discarded, {} failures",
            self.algorithm,
            report.flushed.len(),
            report.discarded.len(),
            report.failures.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::{JoinAlgorithm, JoinBuild, JoinInput, JoinedRecord, StreamJoinHandler};
    use crate::buffer::{CollectingSink, RecordBuffer};
    use crate::error::{Error, ProtocolViolation};
    use crate::operator::{OperatorHandler, SetupContext, WorkerContext};
    use crate::test_util::init_logging;
    use crate::window::{TimeFunction, WindowBounds};
    use pretty_assertions::assert_eq;
    use slicer_types::{EngineConfig, InsertStrategy, TerminationType};
    use std::sync::Arc;

    type Left = (u64, &'static str, i64);
    type Right = (u64, &'static str, char);
    type Output = JoinedRecord<&'static str, Left, Right>;

    fn handler(
        algorithm: JoinAlgorithm,
        workers: usize,
    ) -> (
        StreamJoinHandler<&'static str, Left, Right>,
        CollectingSink<Output>,
    ) {
        let config = EngineConfig::default()
            .with_workers(workers)
            .with_window(100, 100);
        handler_with_config(config, algorithm, workers)
    }

    fn handler_with_config(
        config: EngineConfig,
        algorithm: JoinAlgorithm,
        workers: usize,
    ) -> (
        StreamJoinHandler<&'static str, Left, Right>,
        CollectingSink<Output>,
    ) {
        let sink = CollectingSink::new();
        let handler = StreamJoinHandler::new(
            config,
            TimeFunction::event_time(|record: &Left| record.0),
            |record: &Left| record.1,
            TimeFunction::event_time(|record: &Right| record.0),
            |record: &Right| record.1,
            Arc::new(sink.clone()),
        )
        .with_algorithm(algorithm);
        handler.setup(&SetupContext::new(workers, [1, 2])).unwrap();
        handler.start().unwrap();
        (handler, sink)
    }

    fn matches(sink: &CollectingSink<Output>) -> Vec<(u64, &'static str, i64, char)> {
        sink.records()
            .into_iter()
            .map(|record| (record.start, record.key, record.left.2, record.right.2))
            .collect()
    }

    fn tumbling_join(algorithm: JoinAlgorithm) {
        init_logging();
        let (handler, sink) = handler(algorithm, 2);
        let w0 = WorkerContext::new(0, 2);
        let w1 = WorkerContext::new(1, 2);

        handler
            .on_buffer(
                &w0,
                JoinInput::Left(RecordBuffer::new(1, 0, 50, vec![(10, "a", 1), (20, "b", 2)])),
            )
            .unwrap();
        handler
            .on_buffer(
                &w1,
                JoinInput::Right(RecordBuffer::new(
                    2,
                    0,
                    50,
                    vec![(30, "a", 'x'), (40, "c", 'y'), (120, "a", 'z')],
                )),
            )
            .unwrap();
        handler
            .on_buffer(&w0, JoinInput::Left(RecordBuffer::new(1, 1, 150, Vec::new())))
            .unwrap();
        handler
            .on_buffer(&w1, JoinInput::Right(RecordBuffer::new(2, 1, 150, Vec::new())))
            .unwrap();
        // Worker 0 has not signaled the end of [0, 100) yet.
        assert_eq!(sink.num_buffers(), 0);

        handler
            .on_buffer(
                &w0,
                JoinInput::Left(RecordBuffer::new(1, 2, 200, vec![(150, "a", 3)])),
            )
            .unwrap();
        assert_eq!(matches(&sink), vec![(0, "a", 1, 'x')]);

        // Window [0, 100) is closed for worker 1.
        handler
            .on_buffer(
                &w1,
                JoinInput::Right(RecordBuffer::new(2, 2, 150, vec![(90, "a", 'q')])),
            )
            .unwrap();

        let report = handler.stop(TerminationType::Graceful).unwrap();
        assert_eq!(report.flushed, vec![WindowBounds::new(100, 200)]);
        assert!(report.discarded.is_empty());
        assert!(report.failures.is_empty());
        assert_eq!(matches(&sink), vec![(0, "a", 1, 'x'), (100, "a", 3, 'z')]);
        assert_eq!(
            sink.headers(),
            vec![(u64::MAX, 1, 100), (u64::MAX, 2, 200)]
        );
        assert_eq!(handler.windows_joined(), 2);
        assert!(format!("{handler:?}").contains("windows_joined: 2"));
    }

    #[test]
    fn tumbling_hash_join_locking() {
        tumbling_join(JoinAlgorithm::Hash(InsertStrategy::Locking));
    }

    #[test]
    fn tumbling_hash_join_lock_free() {
        tumbling_join(JoinAlgorithm::Hash(InsertStrategy::LockFree));
    }

    #[test]
    fn tumbling_nested_loop_join() {
        tumbling_join(JoinAlgorithm::NestedLoop);
    }

    #[test]
    fn hard_stop_discards() {
        init_logging();
        for algorithm in [
            JoinAlgorithm::Hash(InsertStrategy::LockFree),
            JoinAlgorithm::NestedLoop,
        ] {
            let (handler, sink) = handler(algorithm, 2);
            let w0 = WorkerContext::new(0, 2);
            handler
                .on_buffer(
                    &w0,
                    JoinInput::Left(RecordBuffer::new(1, 0, 50, vec![(10, "a", 1)])),
                )
                .unwrap();
            handler
                .on_buffer(
                    &w0,
                    JoinInput::Right(RecordBuffer::new(2, 0, 50, vec![(20, "a", 'x')])),
                )
                .unwrap();

            let report = handler.stop(TerminationType::HardStop).unwrap();
            assert!(report.flushed.is_empty());
            assert_eq!(report.discarded, vec![WindowBounds::new(0, 100)]);
            assert_eq!(sink.num_buffers(), 0);
        }
    }

    #[test]
    fn abandoned_window_is_not_rebuilt() {
        init_logging();
        let mut config = EngineConfig::default().with_workers(2).with_window(100, 100);
        config.timeouts.merge_ms = Some(0);
        config.join.max_pages = Some(8);
        let (handler, sink) =
            handler_with_config(config, JoinAlgorithm::Hash(InsertStrategy::LockFree), 2);
        let w0 = WorkerContext::new(0, 2);
        let w1 = WorkerContext::new(1, 2);
        let JoinBuild::Hash(hash) = &handler.state.get().unwrap().build else {
            unreachable!()
        };

        handler
            .on_buffer(
                &w0,
                JoinInput::Left(RecordBuffer::new(1, 0, 150, vec![(10, "a", 1)])),
            )
            .unwrap();
        assert_eq!(hash.allocator.available(), Some(7));

        // Worker 0 passes [0, 100) alone; worker 1 never arrives in time.
        handler
            .on_buffer(
                &w0,
                JoinInput::Right(RecordBuffer::new(2, 0, 150, vec![(20, "a", 'x')])),
            )
            .unwrap();
        assert!(hash.windows.read().unwrap().open.is_empty());
        assert_eq!(hash.allocator.available(), Some(8));

        // The late worker still sees [0, 100) as open.
        handler
            .on_buffer(
                &w1,
                JoinInput::Left(RecordBuffer::new(1, 1, 200, vec![(30, "a", 2)])),
            )
            .unwrap();
        assert!(hash.windows.read().unwrap().open.is_empty());
        assert_eq!(hash.allocator.available(), Some(8));

        let report = handler.stop(TerminationType::Graceful).unwrap();
        assert!(report.discarded.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].error_code, "WindowAbandoned");
        assert_eq!(sink.num_buffers(), 0);
    }

    #[test]
    fn rejected_buffers_are_not_joined() {
        init_logging();
        for algorithm in [
            JoinAlgorithm::Hash(InsertStrategy::Locking),
            JoinAlgorithm::Hash(InsertStrategy::LockFree),
            JoinAlgorithm::NestedLoop,
        ] {
            let (handler, sink) = handler(algorithm, 1);
            let w0 = WorkerContext::new(0, 1);

            handler
                .on_buffer(
                    &w0,
                    JoinInput::Left(RecordBuffer::new(1, 0, 0, vec![(5, "a", 7)])),
                )
                .unwrap();
            assert!(matches!(
                handler.on_buffer(
                    &w0,
                    JoinInput::Left(RecordBuffer::new(1, 0, 0, vec![(5, "a", 8)])),
                ),
                Err(Error::ProtocolViolation(ProtocolViolation::DuplicateSequence { .. }))
            ));
            assert!(matches!(
                handler.on_buffer(
                    &w0,
                    JoinInput::Right(RecordBuffer::new(9, 0, 0, vec![(6, "a", 'q')])),
                ),
                Err(Error::ProtocolViolation(ProtocolViolation::UnknownOrigin { origin: 9 }))
            ));
            handler
                .on_buffer(
                    &w0,
                    JoinInput::Right(RecordBuffer::new(2, 0, 0, vec![(6, "a", 'x')])),
                )
                .unwrap();

            let report = handler.stop(TerminationType::Graceful).unwrap();
            assert!(report.failures.is_empty());
            assert_eq!(matches(&sink), vec![(0, "a", 7, 'x')]);
        }
    }
}
