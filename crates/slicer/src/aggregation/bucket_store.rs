use super::slice::Slice;
use crate::error::{Error, Result};
use crate::window::{SliceAssigner, WindowState};
use crate::Timestamp;
use std::collections::BTreeMap;
use tracing::trace;

/// The window buckets of one worker.
///
/// Unlike [`ThreadLocalSliceStore`](super::ThreadLocalSliceStore), which
/// keeps disjoint slices and assembles sliding windows after the merge, a
/// bucket store keeps one partial aggregate per window and accumulates
/// every record into all windows containing it.  Merged buckets are
/// complete windows.
#[derive(Debug)]
pub struct ThreadLocalBucketStore<S> {
    assigner: SliceAssigner,
    /// Keyed by window start.  All windows have the same size, so ends are
    /// ordered the same way.
    buckets: BTreeMap<Timestamp, Slice<S>>,
    last_watermark: Timestamp,
}

impl<S: Default> ThreadLocalBucketStore<S> {
    pub fn new(assigner: SliceAssigner) -> Self {
        Self {
            assigner,
            buckets: BTreeMap::new(),
            last_watermark: 0,
        }
    }

    /// Returns the buckets of every window containing `ts`, ordered by
    /// start, creating missing ones.
    ///
    /// A record is late under the same rule as in the slice store: when
    /// the slice containing it ended at or before the watermark.  Every
    /// window containing an accepted record is therefore still open.
    pub fn get_buckets_by_ts(
        &mut self,
        ts: Timestamp,
    ) -> Result<impl Iterator<Item = &mut Slice<S>> + '_> {
        if self.assigner.slice_end(ts) <= self.last_watermark {
            return Err(Error::late_record(ts, self.last_watermark));
        }
        let windows = self.assigner.windows_containing(ts);
        let (Some(first), Some(last)) = (windows.first(), windows.last()) else {
            return Err(Error::late_record(ts, self.last_watermark));
        };
        let range = first.start..=last.start;
        for bounds in &windows {
            self.buckets.entry(bounds.start).or_insert_with(|| {
                trace!("creating bucket {bounds}");
                Slice::new(bounds.start, bounds.end)
            });
        }
        Ok(self.buckets.range_mut(range).map(|(_, bucket)| bucket))
    }
}

impl<S> ThreadLocalBucketStore<S> {
    /// Removes every bucket with `end <= ts` and returns them, closed and
    /// ordered by start.
    pub fn remove_buckets_until_ts(&mut self, ts: Timestamp) -> Vec<Slice<S>> {
        let mut removed = Vec::new();
        while let Some(entry) = self.buckets.first_entry() {
            if entry.get().end() > ts {
                break;
            }
            let mut bucket = entry.remove();
            if bucket.lifecycle() == WindowState::Active {
                let closed = bucket.transition(WindowState::Closed);
                debug_assert!(closed.is_ok(), "{closed:?}");
            }
            removed.push(bucket);
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
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drops every bucket and returns how many there were.
    pub fn clear(&mut self) -> usize {
        let len = self.buckets.len();
        self.buckets.clear();
        len
    }
}
