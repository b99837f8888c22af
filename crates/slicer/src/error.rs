use crate::runtime::WorkerPanicInfo;
use crate::window::{WindowBounds, WindowState};
use crate::operator::LifecyclePhase;
use crate::{OriginId, Timestamp};
use serde::{Serialize, Serializer};
use slicer_types::{ConfigError, DetailedError};
use std::borrow::Cow;
use std::fmt::{self, Display};
use std::time::Duration;
use thiserror::Error;

/// Violations of the buffer/watermark/staging protocol.
///
/// These are fatal to the window they occur in, but never to the process.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
pub enum ProtocolViolation {
    /// The same sequence number was delivered twice for one origin.
    #[error("origin {origin} delivered sequence number {sequence} twice")]
    DuplicateSequence { origin: OriginId, sequence: u64 },

    /// The sequence number is too far ahead of the origin's contiguous
    /// prefix to fit in the reorder window.
    #[error(
        "origin {origin} sequence number {sequence} is outside the reorder window \
         (next expected {next_expected}, capacity {capacity})"
    )]
    SequenceOutOfRange {
        origin: OriginId,
        sequence: u64,
        next_expected: u64,
        capacity: usize,
    },

    /// A buffer carried an origin id that was not registered at setup.
    #[error("unknown origin {origin}")]
    UnknownOrigin { origin: OriginId },

    /// The record belongs to a slice that was already closed by the
    /// worker's watermark.
    #[error("record with timestamp {ts} arrived after watermark {watermark}")]
    LateRecord { ts: Timestamp, watermark: Timestamp },

    /// A worker contributed twice to the same staging entry.
    #[error("worker {worker} contributed twice to window {bounds}")]
    DoubleContribution { worker: usize, bounds: WindowBounds },

    /// A window result was emitted a second time.
    #[error("window {bounds} was already emitted")]
    DoubleEmit { bounds: WindowBounds },

    #[error("illegal window state transition {from} -> {to}")]
    IllegalTransition { from: WindowState, to: WindowState },

    /// Two threads used the same worker id at the same time.
    #[error("worker slot {worker} is already in use by another thread")]
    ConcurrentWorkerAccess { worker: usize },

    #[error("worker id {worker} is out of range for {num_workers} workers")]
    WorkerOutOfRange { worker: usize, num_workers: usize },

    /// A reserved page slot was written more than once.
    #[error("page slot {index} was written twice")]
    SlotOverwrite { index: usize },
}

/// Resources the engine can block on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    OutputBuffers,
    JoinPages,
}

impl Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutputBuffers => f.write_str("output buffer pool"),
            Self::JoinPages => f.write_str("join page allocator"),
        }
    }
}

#[derive(Debug, Error, Serialize)]
pub enum Error {
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),

    /// A blocking allocation did not complete within the configured
    /// timeout.
    #[error("{resource} exhausted after waiting {waited:?}")]
    ResourceExhausted { resource: Resource, waited: Duration },

    /// A staging entry did not collect all contributions within the merge
    /// timeout.
    #[error(
        "window {bounds} abandoned with {contributions} of {expected} worker contributions"
    )]
    WindowAbandoned {
        bounds: WindowBounds,
        contributions: usize,
        expected: usize,
    },

    /// The downstream consumer or the worker pool is gone.
    #[error("pipeline has been terminated")]
    Terminated,

    #[error("operator is in phase '{actual}', expected '{expected}'")]
    Lifecycle {
        expected: LifecyclePhase,
        actual: LifecyclePhase,
    },

    #[error("configuration error: {0}")]
    Config(
        #[from]
        #[serde(serialize_with = "serialize_display")]
        ConfigError,
    ),

    /// The operating system refused to start a worker thread.
    #[error("failed to spawn worker thread {worker}: {reason}")]
    WorkerSpawn { worker: usize, reason: String },

    #[error("one or more worker threads terminated unexpectedly")]
    WorkerPanic {
        panic_info: Vec<(usize, WorkerPanicInfo)>,
    },
}

fn serialize_display<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: Display,
    S: Serializer,
{
    serializer.collect_str(value)
}

impl Error {
    pub(crate) fn late_record(ts: Timestamp, watermark: Timestamp) -> Self {
        Self::ProtocolViolation(ProtocolViolation::LateRecord { ts, watermark })
    }

    /// Returns `true` for a record that was dropped because its slice was
    /// already closed.
    pub fn is_late_record(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(ProtocolViolation::LateRecord { .. })
        )
    }
}

impl DetailedError for ProtocolViolation {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::DuplicateSequence { .. } => Cow::from("DuplicateSequence"),
            Self::SequenceOutOfRange { .. } => Cow::from("SequenceOutOfRange"),
            Self::UnknownOrigin { .. } => Cow::from("UnknownOrigin"),
            Self::LateRecord { .. } => Cow::from("LateRecord"),
            Self::DoubleContribution { .. } => Cow::from("DoubleContribution"),
            Self::DoubleEmit { .. } => Cow::from("DoubleEmit"),
            Self::IllegalTransition { .. } => Cow::from("IllegalTransition"),
            Self::ConcurrentWorkerAccess { .. } => Cow::from("ConcurrentWorkerAccess"),
            Self::WorkerOutOfRange { .. } => Cow::from("WorkerOutOfRange"),
            Self::SlotOverwrite { .. } => Cow::from("SlotOverwrite"),
        }
    }

    fn is_window_local(&self) -> bool {
        matches!(
            self,
            Self::LateRecord { .. } | Self::DoubleContribution { .. } | Self::DoubleEmit { .. }
        )
    }
}

impl DetailedError for Error {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::ProtocolViolation(violation) => violation.error_code(),
            Self::ResourceExhausted { .. } => Cow::from("ResourceExhausted"),
            Self::WindowAbandoned { .. } => Cow::from("WindowAbandoned"),
            Self::Terminated => Cow::from("Terminated"),
            Self::Lifecycle { .. } => Cow::from("Lifecycle"),
            Self::Config(_) => Cow::from("Config"),
            Self::WorkerSpawn { .. } => Cow::from("WorkerSpawn"),
            Self::WorkerPanic { .. } => Cow::from("WorkerPanic"),
        }
    }

    fn is_window_local(&self) -> bool {
        match self {
            Self::ProtocolViolation(violation) => violation.is_window_local(),
            Self::ResourceExhausted { .. } | Self::WindowAbandoned { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
