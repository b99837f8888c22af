use crate::buffer::RecordBuffer;
use crate::Timestamp;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Decides which timestamp a record is windowed by.
pub enum TimeFunction<R> {
    /// Read the timestamp from the record.
    EventTime(Arc<dyn Fn(&R) -> Timestamp + Send + Sync>),

    /// Use the creation time of the buffer that carried the record.
    IngestionTime,
}

impl<R> TimeFunction<R> {
    pub fn event_time<F>(extractor: F) -> Self
    where
        F: Fn(&R) -> Timestamp + Send + Sync + 'static,
    {
        Self::EventTime(Arc::new(extractor))
    }

    pub fn timestamp(&self, record: &R, buffer: &RecordBuffer<R>) -> Timestamp {
        match self {
            Self::EventTime(extractor) => extractor(record),
            Self::IngestionTime => buffer.creation_ts,
        }
    }
}

impl<R> Clone for TimeFunction<R> {
    fn clone(&self) -> Self {
        match self {
            Self::EventTime(extractor) => Self::EventTime(extractor.clone()),
            Self::IngestionTime => Self::IngestionTime,
        }
    }
}

impl<R> Debug for TimeFunction<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventTime(_) => f.write_str("EventTime"),
            Self::IngestionTime => f.write_str("IngestionTime"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TimeFunction;
    use crate::buffer::RecordBuffer;

    #[test]
    fn event_and_ingestion_time() {
        let buffer = RecordBuffer::new(0, 0, 0, vec![(42u64, "a")]).with_creation_ts(7);
        let event = TimeFunction::event_time(|record: &(u64, &str)| record.0);
        assert_eq!(event.timestamp(&buffer.records[0], &buffer), 42);
        let ingestion = TimeFunction::IngestionTime;
        assert_eq!(ingestion.timestamp(&buffer.records[0], &buffer), 7);
    }
}
