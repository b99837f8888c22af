//! Record buffers exchanged with the surrounding pipeline.
//!
//! Input arrives as [`RecordBuffer`]s, each delivered to exactly one worker.
//! Window operators write their results into [`TupleBuffer`]s taken from a
//! [`BufferPool`] and hand them to a downstream [`Sink`].

use crate::error::{Error, Resource, Result};
use crate::utils::{lock, Permit, PermitPool};
use crate::{OriginId, Timestamp};
use crossbeam::channel::Sender;
use slicer_types::BufferConfig;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis() as Timestamp)
        .unwrap_or_default()
}

/// A bounded batch of input records from one origin.
///
/// The watermark of a buffer promises that the origin will send no more
/// records with a timestamp below it, once all buffers with smaller
/// sequence numbers have been seen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordBuffer<R> {
    pub origin_id: OriginId,
    pub sequence_number: u64,
    pub watermark_ts: Timestamp,
    /// Wall-clock creation time, used by ingestion-time windows.
    pub creation_ts: Timestamp,
    pub records: Vec<R>,
}

impl<R> RecordBuffer<R> {
    pub fn new(
        origin_id: OriginId,
        sequence_number: u64,
        watermark_ts: Timestamp,
        records: Vec<R>,
    ) -> Self {
        Self {
            origin_id,
            sequence_number,
            watermark_ts,
            creation_ts: now_millis(),
            records,
        }
    }

    pub fn with_creation_ts(mut self, creation_ts: Timestamp) -> Self {
        self.creation_ts = creation_ts;
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// An output buffer produced by a window operator.
///
/// Holds a permit from its [`BufferPool`] until it is dropped (or
/// [`detach`](Self::detach)ed), so a slow consumer eventually blocks the
/// emitting workers.
#[derive(derive_more::Debug)]
pub struct TupleBuffer<T> {
    pub origin_id: OriginId,
    pub sequence_number: u64,
    pub watermark_ts: Timestamp,
    records: Vec<T>,
    capacity: usize,
    #[debug(skip)]
    permit: Option<Permit>,
}

impl<T> TupleBuffer<T> {
    fn new(capacity: usize, permit: Option<Permit>) -> Self {
        Self {
            origin_id: 0,
            sequence_number: 0,
            watermark_ts: 0,
            records: Vec::with_capacity(capacity),
            capacity,
            permit,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    /// Appends `record`, returning it back if the buffer is full.
    pub fn push(&mut self, record: T) -> Result<(), T> {
        if self.is_full() {
            Err(record)
        } else {
            self.records.push(record);
            Ok(())
        }
    }

    /// Moves records from `records` into the buffer until it is full or
    /// the iterator is exhausted.
    pub fn fill_from<I>(&mut self, records: &mut I)
    where
        I: Iterator<Item = T>,
    {
        let room = self.capacity.saturating_sub(self.records.len());
        self.records.extend(records.take(room));
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }

    pub fn into_records(self) -> Vec<T> {
        self.records
    }

    /// Returns the buffer's permit to the pool while keeping the contents.
    pub fn detach(mut self) -> Self {
        self.permit = None;
        self
    }
}

/// Source of output buffers.
///
/// With `max_buffers` configured, at most that many buffers are alive at
/// once; `allocate` blocks until the consumer drops one.
#[derive(Clone, Debug)]
pub struct BufferPool {
    buffer_capacity: usize,
    permits: Option<PermitPool>,
    timeout: Option<Duration>,
}

impl BufferPool {
    pub fn new(config: &BufferConfig, timeout: Option<Duration>) -> Self {
        Self {
            buffer_capacity: config.buffer_capacity.max(1),
            permits: config
                .max_buffers
                .map(|max| PermitPool::new(Resource::OutputBuffers, max)),
            timeout,
        }
    }

    pub fn unbounded(buffer_capacity: usize) -> Self {
        Self {
            buffer_capacity: buffer_capacity.max(1),
            permits: None,
            timeout: None,
        }
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Number of buffers that can be allocated without blocking, or `None`
    /// for an unbounded pool.
    pub fn available(&self) -> Option<usize> {
        self.permits.as_ref().map(PermitPool::available)
    }

    pub fn allocate<T>(&self) -> Result<TupleBuffer<T>> {
        let permit = match &self.permits {
            Some(permits) => Some(permits.acquire(self.timeout)?),
            None => None,
        };
        Ok(TupleBuffer::new(self.buffer_capacity, permit))
    }
}

/// Downstream consumer of output buffers.
pub trait Sink<T>: Send + Sync {
    fn emit(&self, buffer: TupleBuffer<T>) -> Result<()>;
}

impl<T, F> Sink<T> for F
where
    F: Fn(TupleBuffer<T>) -> Result<()> + Send + Sync,
{
    fn emit(&self, buffer: TupleBuffer<T>) -> Result<()> {
        self(buffer)
    }
}

/// Forwards buffers to a crossbeam channel.
#[derive(Clone, Debug)]
pub struct ChannelSink<T>(pub Sender<TupleBuffer<T>>);

impl<T: Send> Sink<T> for ChannelSink<T> {
    fn emit(&self, buffer: TupleBuffer<T>) -> Result<()> {
        self.0.send(buffer).map_err(|_| Error::Terminated)
    }
}

/// Keeps every emitted buffer in memory.  Buffers are detached from their
/// pool on arrival.
#[derive(Debug)]
pub struct CollectingSink<T> {
    buffers: Arc<Mutex<Vec<TupleBuffer<T>>>>,
}

impl<T> Clone for CollectingSink<T> {
    fn clone(&self) -> Self {
        Self {
            buffers: self.buffers.clone(),
        }
    }
}

impl<T> Default for CollectingSink<T> {
    fn default() -> Self {
        Self {
            buffers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T> CollectingSink<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_buffers(&self) -> usize {
        lock(&self.buffers).len()
    }

    /// Removes and returns everything collected so far.
    pub fn take(&self) -> Vec<TupleBuffer<T>> {
        std::mem::take(&mut *lock(&self.buffers))
    }

    /// Returns `(origin, sequence, watermark)` of every collected buffer, in
    /// arrival order.
    pub fn headers(&self) -> Vec<(OriginId, u64, Timestamp)> {
        lock(&self.buffers)
            .iter()
            .map(|buffer| {
                (
                    buffer.origin_id,
                    buffer.sequence_number,
                    buffer.watermark_ts,
                )
            })
            .collect()
    }
}

impl<T: Clone> CollectingSink<T> {
    pub fn records(&self) -> Vec<T> {
        lock(&self.buffers)
            .iter()
            .flat_map(|buffer| buffer.records().iter().cloned())
            .collect()
    }
}

impl<T: Send> Sink<T> for CollectingSink<T> {
    fn emit(&self, buffer: TupleBuffer<T>) -> Result<()> {
        lock(&self.buffers).push(buffer.detach());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{BufferPool, ChannelSink, CollectingSink, Sink};
    use crate::error::Error;
    use slicer_types::BufferConfig;
    use std::time::Duration;

    #[test]
    fn buffer_capacity() {
        let pool = BufferPool::unbounded(2);
        let mut buffer = pool.allocate::<u32>().unwrap();
        assert!(buffer.push(1).is_ok());
        assert!(buffer.push(2).is_ok());
        assert_eq!(buffer.push(3), Err(3));
        assert!(buffer.is_full());
        assert_eq!(buffer.into_records(), vec![1, 2]);
    }

    #[test]
    fn bounded_pool_backpressure() {
        let pool = BufferPool::new(
            &BufferConfig {
                buffer_capacity: 4,
                max_buffers: Some(1),
            },
            Some(Duration::from_millis(10)),
        );
        let buffer = pool.allocate::<u32>().unwrap();
        assert_eq!(pool.available(), Some(0));
        assert!(matches!(
            pool.allocate::<u32>(),
            Err(Error::ResourceExhausted { .. })
        ));

        // The collecting sink releases the permit.
        let sink = CollectingSink::new();
        sink.emit(buffer).unwrap();
        assert_eq!(pool.available(), Some(1));
        assert_eq!(sink.num_buffers(), 1);
    }

    #[test]
    fn channel_sink() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let sink = ChannelSink(tx);
        let pool = BufferPool::unbounded(1);
        sink.emit(pool.allocate::<u8>().unwrap()).unwrap();
        assert_eq!(rx.len(), 1);
        drop(rx);
        assert!(matches!(
            sink.emit(pool.allocate::<u8>().unwrap()),
            Err(Error::Terminated)
        ));
    }
}
