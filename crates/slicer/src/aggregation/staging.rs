//! Rendezvous of per-worker contributions for one window.
//!
//! Each worker hands its contribution for a window boundary to
//! [`SliceStaging`] once its own watermark passed the boundary's end.  The
//! worker whose contribution completes the set receives a
//! [`SliceMergeTask`] and performs the merge; every other worker returns
//! immediately.  The same coordinator is used for aggregation slices,
//! nested-loop join partitions, and as a completion barrier for hash-join
//! builds (with `()` contributions).

use crate::error::{Error, ProtocolViolation, Result};
use crate::utils::lock;
use crate::window::WindowBounds;
use crate::Timestamp;
use crossbeam_utils::CachePadded;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Contributions for one boundary, ready to be merged.
#[derive(Debug)]
pub struct SliceMergeTask<C> {
    bounds: WindowBounds,
    contributions: Vec<(usize, C)>,
}

impl<C> SliceMergeTask<C> {
    pub fn bounds(&self) -> WindowBounds {
        self.bounds
    }

    /// `(worker, contribution)` pairs in arrival order.  Workers that
    /// passed the boundary without data have no entry.
    pub fn contributions(&self) -> &[(usize, C)] {
        &self.contributions
    }

    pub fn into_parts(self) -> impl Iterator<Item = C> {
        self.contributions.into_iter().map(|(_, part)| part)
    }
}

/// A window that was dropped by [`SliceStaging::drain`] before all
/// workers contributed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscardedWindow {
    pub bounds: WindowBounds,
    pub contributions: usize,
    pub expected: usize,
}

const COLLECTING: u8 = 0;
const MERGING: u8 = 1;
const ABANDONED: u8 = 2;

struct StagingEntry<C> {
    bounds: WindowBounds,
    contribution_count: AtomicUsize,
    contributed: Box<[AtomicBool]>,
    parts: Mutex<Vec<(usize, C)>>,
    state: AtomicU8,
    created: Instant,
}

impl<C> StagingEntry<C> {
    fn new(bounds: WindowBounds, num_workers: usize) -> Self {
        Self {
            bounds,
            contribution_count: AtomicUsize::new(0),
            contributed: (0..num_workers).map(|_| AtomicBool::new(false)).collect(),
            parts: Mutex::new(Vec::new()),
            state: AtomicU8::new(COLLECTING),
            created: Instant::now(),
        }
    }

    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn contributions(&self) -> usize {
        self.contribution_count.load(Ordering::Acquire)
    }

    fn expected(&self) -> usize {
        self.contributed.len()
    }

    /// Counts one contribution.  The caller whose increment reaches the
    /// number of workers claims the merge.
    fn count(&self) -> Option<SliceMergeTask<C>> {
        let previous = self.contribution_count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous < self.expected());
        if previous + 1 != self.expected() {
            return None;
        }
        self.state
            .compare_exchange(COLLECTING, MERGING, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let contributions = std::mem::take(&mut *lock(&self.parts));
        Some(SliceMergeTask {
            bounds: self.bounds,
            contributions,
        })
    }

    fn contribute(&self, worker: usize, part: C) -> Result<Option<SliceMergeTask<C>>> {
        if self.state() == ABANDONED {
            debug!(
                "dropping contribution of worker {worker} to abandoned window {}",
                self.bounds
            );
            return Ok(None);
        }
        if self.contributed[worker].swap(true, Ordering::AcqRel) {
            return Err(ProtocolViolation::DoubleContribution {
                worker,
                bounds: self.bounds,
            }
            .into());
        }
        lock(&self.parts).push((worker, part));
        Ok(self.count())
    }

    /// Counts `worker` as having contributed nothing, unless it already
    /// contributed.
    fn credit(&self, worker: usize) -> Option<SliceMergeTask<C>> {
        if self.contributed[worker].swap(true, Ordering::AcqRel) {
            None
        } else {
            self.count()
        }
    }
}

/// Merge coordinator for a fixed number of workers.
pub struct SliceStaging<C> {
    num_workers: usize,
    entries: RwLock<BTreeMap<WindowBounds, Arc<StagingEntry<C>>>>,
    /// Highest watermark each worker advanced to.  Only written while
    /// holding the `entries` write lock, so entry creation and advancing
    /// never miss each other.
    triggered: Box<[CachePadded<AtomicU64>]>,
}

impl<C> Debug for SliceStaging<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceStaging")
            .field("num_workers", &self.num_workers)
            .field("entries", &self.len())
            .field("min_worker_watermark", &self.min_worker_watermark())
            .finish()
    }
}

impl<C> SliceStaging<C> {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            entries: RwLock::new(BTreeMap::new()),
            triggered: (0..num_workers)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<WindowBounds, Arc<StagingEntry<C>>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<WindowBounds, Arc<StagingEntry<C>>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_worker(&self, worker: usize) -> Result<()> {
        if worker < self.num_workers {
            Ok(())
        } else {
            Err(ProtocolViolation::WorkerOutOfRange {
                worker,
                num_workers: self.num_workers,
            }
            .into())
        }
    }

    fn triggered(&self, worker: usize) -> Timestamp {
        self.triggered[worker].load(Ordering::Acquire)
    }

    /// Hands `worker`'s contribution for `bounds` to staging.
    ///
    /// Returns the merge task if this contribution was the last one
    /// missing.  Contributing twice to the same boundary, or contributing
    /// after having advanced past it, is a protocol violation.
    pub fn stage_slice(
        &self,
        bounds: WindowBounds,
        worker: usize,
        contribution: C,
    ) -> Result<Option<SliceMergeTask<C>>> {
        self.check_worker(worker)?;
        if bounds.end <= self.triggered(worker) {
            return Err(ProtocolViolation::DoubleContribution { worker, bounds }.into());
        }

        let existing = self.read().get(&bounds).cloned();
        let entry = match existing {
            Some(entry) => entry,
            None => {
                let mut entries = self.write();
                entries
                    .entry(bounds)
                    .or_insert_with(|| {
                        trace!("staging entry for {bounds} created by worker {worker}");
                        let entry = Arc::new(StagingEntry::new(bounds, self.num_workers));
                        // Workers that already advanced past the boundary
                        // will never contribute.  The creator's own
                        // contribution is still missing, so this cannot
                        // complete the entry.
                        for other in 0..self.num_workers {
                            if other != worker && self.triggered(other) >= bounds.end {
                                let task = entry.credit(other);
                                debug_assert!(task.is_none());
                            }
                        }
                        entry
                    })
                    .clone()
            }
        };

        let task = entry.contribute(worker, contribution)?;
        if task.is_some() {
            debug!("worker {worker} completed staging of {bounds}");
        }
        Ok(task)
    }

    /// Records that `worker` advanced to `watermark`.
    ///
    /// The worker counts as an empty contribution for every boundary up to
    /// `watermark` it did not stage itself, including boundaries staged
    /// later by other workers.  Returns the merge tasks this completed.
    pub fn advance_worker(
        &self,
        worker: usize,
        watermark: Timestamp,
    ) -> Result<Vec<SliceMergeTask<C>>> {
        self.check_worker(worker)?;
        let mut entries = self.write();
        if watermark <= self.triggered(worker) {
            return Ok(Vec::new());
        }
        self.triggered[worker].store(watermark, Ordering::Release);

        let mut tasks = Vec::new();
        for entry in entries
            .range(..=WindowBounds::new(Timestamp::MAX, watermark))
            .map(|(_, entry)| entry)
        {
            if let Some(task) = entry.credit(worker) {
                debug!(
                    "worker {worker} completed staging of {} by advancing to {watermark}",
                    task.bounds
                );
                tasks.push(task);
            }
        }

        // Abandoned entries only serve to swallow late contributions;
        // once every worker is past them they can go.
        let min = self.min_worker_watermark();
        entries.retain(|bounds, entry| entry.state() != ABANDONED || bounds.end > min);
        Ok(tasks)
    }

    /// Forgets a boundary after its merged result has been handed off.
    pub fn complete(&self, bounds: WindowBounds) -> bool {
        self.write().remove(&bounds).is_some()
    }

    /// Smallest end of a boundary that is still being collected or merged.
    pub fn pending_min_end(&self) -> Option<Timestamp> {
        self.read()
            .iter()
            .find(|(_, entry)| entry.state() != ABANDONED)
            .map(|(bounds, _)| bounds.end)
    }

    /// Lowest watermark any worker has advanced to.
    pub fn min_worker_watermark(&self) -> Timestamp {
        self.triggered
            .iter()
            .map(|triggered| triggered.load(Ordering::Acquire))
            .min()
            .unwrap_or(0)
    }

    /// Number of boundaries currently tracked.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Abandons every boundary that has been waiting for contributions for
    /// longer than `timeout`.  Contributions that arrive later are dropped.
    pub fn abandon_stuck(&self, timeout: Duration) -> Vec<Error> {
        let entries = self.read();
        let mut abandoned = Vec::new();
        for (bounds, entry) in entries.iter() {
            if entry.created.elapsed() < timeout {
                continue;
            }
            if entry
                .state
                .compare_exchange(COLLECTING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            lock(&entry.parts).clear();
            let contributions = entry.contributions();
            warn!(
                "abandoning window {bounds} after {:?}: {contributions} of {} workers contributed",
                entry.created.elapsed(),
                self.num_workers
            );
            metrics::counter!("slicer.windows_abandoned").increment(1);
            abandoned.push(Error::WindowAbandoned {
                bounds: *bounds,
                contributions,
                expected: self.num_workers,
            });
        }
        abandoned
    }

    /// Removes every remaining boundary.
    ///
    /// Boundaries that were merged but never completed, or that are still
    /// missing contributions, are returned as discarded.  Callers that want
    /// complete windows flushed first advance every worker to
    /// `Timestamp::MAX` before draining.
    pub fn drain(&self) -> Vec<DiscardedWindow> {
        let entries = std::mem::take(&mut *self.write());
        entries
            .into_values()
            .filter(|entry| entry.state() != ABANDONED)
            .map(|entry| DiscardedWindow {
                bounds: entry.bounds,
                contributions: entry.contributions(),
                expected: entry.expected(),
            })
            .collect()
    }
}
