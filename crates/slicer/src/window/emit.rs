use crate::buffer::{BufferPool, Sink};
use crate::error::Result;
use crate::{OriginId, Timestamp};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// One finalized result of a window aggregation.  Non-keyed aggregations
/// use `()` as the key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct WindowRecord<K, V> {
    pub start: Timestamp,
    pub end: Timestamp,
    pub key: K,
    pub value: V,
}

/// Writes window results into pooled output buffers.
///
/// Results are split across as many buffers as the pool's buffer capacity
/// requires.  Every buffer carries the operator's result origin, the end
/// of the window as its watermark, and the next sequence number of this
/// emitter (starting at 1).
pub struct WindowEmitter<T> {
    pool: BufferPool,
    sink: Arc<dyn Sink<T>>,
    origin_id: OriginId,
    next_sequence: AtomicU64,
}

impl<T> std::fmt::Debug for WindowEmitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowEmitter")
            .field("pool", &self.pool)
            .field("origin_id", &self.origin_id)
            .field("next_sequence", &self.next_sequence)
            .finish_non_exhaustive()
    }
}

impl<T: Send> WindowEmitter<T> {
    pub fn new(pool: BufferPool, sink: Arc<dyn Sink<T>>, origin_id: OriginId) -> Self {
        Self {
            pool,
            sink,
            origin_id,
            next_sequence: AtomicU64::new(1),
        }
    }

    pub fn origin_id(&self) -> OriginId {
        self.origin_id
    }

    /// Sends `records` downstream and returns the number of buffers used.
    /// Blocks while the buffer pool is exhausted.
    pub fn emit<I>(&self, watermark: Timestamp, records: I) -> Result<usize>
    where
        I: IntoIterator<Item = T>,
    {
        let mut records = records.into_iter().peekable();
        let mut buffers = 0;
        while records.peek().is_some() {
            let mut buffer = self.pool.allocate::<T>()?;
            buffer.fill_from(&mut records);
            buffer.origin_id = self.origin_id;
            buffer.watermark_ts = watermark;
            buffer.sequence_number = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            trace!(
                "emitting buffer {} with {} records, watermark {watermark}",
                buffer.sequence_number,
                buffer.len()
            );
            metrics::counter!("slicer.records_emitted").increment(buffer.len() as u64);
            self.sink.emit(buffer)?;
            buffers += 1;
        }
        Ok(buffers)
    }
}
