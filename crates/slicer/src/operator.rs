//! Contract between window operators and the surrounding pipeline.

use crate::error::{Error, Result};
use crate::window::WindowBounds;
use crate::{OriginId, Timestamp};
use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use slicer_types::{ConfigError, ErrorResponse, TerminationType};
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::info;

/// Fixed facts about the pipeline an operator is set up for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetupContext {
    pub num_workers: usize,
    /// Every origin that will deliver buffers to this operator.
    pub origins: Vec<OriginId>,
}

impl SetupContext {
    pub fn new(num_workers: usize, origins: impl IntoIterator<Item = OriginId>) -> Self {
        Self {
            num_workers,
            origins: origins.into_iter().collect(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "workers",
                reason: "at least one worker is required".to_string(),
            }
            .into());
        }
        if self.origins.is_empty() {
            return Err(ConfigError::Invalid {
                field: "origins",
                reason: "at least one origin is required".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Identity of the worker thread calling an operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkerContext {
    pub worker_id: usize,
    pub num_workers: usize,
}

impl WorkerContext {
    pub fn new(worker_id: usize, num_workers: usize) -> Self {
        Self {
            worker_id,
            num_workers,
        }
    }
}

/// What happened to in-flight windows when an operator stopped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub termination: TerminationType,
    /// Windows merged and emitted while stopping.
    pub flushed: Vec<WindowBounds>,
    /// Windows dropped without being emitted.
    pub discarded: Vec<WindowBounds>,
    /// Errors reported on the failure channel over the operator's lifetime.
    pub failures: Vec<ErrorResponse>,
}

/// A window operator hosted by the pipeline.
///
/// `setup`, `start` and `stop` are each called once, in that order.
/// `on_buffer` is called concurrently by all workers between `start` and
/// `stop`; each buffer is delivered to exactly one worker.
pub trait OperatorHandler: Send + Sync + 'static {
    type Input: Send + 'static;

    fn setup(&self, ctx: &SetupContext) -> Result<()>;

    fn start(&self) -> Result<()>;

    fn on_buffer(&self, ctx: &WorkerContext, input: Self::Input) -> Result<()>;

    /// Current global watermark, for diagnostics.
    fn current_watermark(&self) -> Timestamp;

    /// Reports an error that concerns a single window or buffer without
    /// stopping the operator.
    fn report_failure(&self, error: Error);

    fn stop(&self, termination: TerminationType) -> Result<StopReport>;
}

/// Phase of an operator's lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LifecyclePhase {
    Created = 0,
    SetUp = 1,
    Running = 2,
    Stopped = 3,
}

impl LifecyclePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::SetUp,
            2 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

impl Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::SetUp => f.write_str("set up"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// Enforces the `setup -> start -> stop` order of an operator.
#[derive(Debug)]
pub struct Lifecycle {
    name: &'static str,
    phase: AtomicU8,
}

impl Lifecycle {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            phase: AtomicU8::new(LifecyclePhase::Created as u8),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        LifecyclePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to`, failing if the operator is not in `from`.
    pub fn advance(&self, from: LifecyclePhase, to: LifecyclePhase) -> Result<()> {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|actual| Error::Lifecycle {
                expected: from,
                actual: LifecyclePhase::from_u8(actual),
            })?;
        info!("{}: {from} -> {to}", self.name);
        Ok(())
    }

    pub fn ensure(&self, expected: LifecyclePhase) -> Result<()> {
        let actual = self.phase();
        if actual == expected {
            Ok(())
        } else {
            Err(Error::Lifecycle { expected, actual })
        }
    }
}

/// Collects errors that are reported instead of returned.
#[derive(Debug)]
pub struct FailureChannel {
    sender: Sender<ErrorResponse>,
    receiver: Receiver<ErrorResponse>,
}

impl Default for FailureChannel {
    fn default() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }
}

impl FailureChannel {
    pub fn report(&self, error: &Error) {
        let _ = self.sender.send(ErrorResponse::from_error(error));
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Takes every failure reported so far.
    pub fn drain(&self) -> Vec<ErrorResponse> {
        self.receiver.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{FailureChannel, Lifecycle, LifecyclePhase};
    use crate::error::{Error, ProtocolViolation};

    #[test]
    fn lifecycle_order() {
        let lifecycle = Lifecycle::new("test");
        assert!(matches!(
            lifecycle.advance(LifecyclePhase::SetUp, LifecyclePhase::Running),
            Err(Error::Lifecycle {
                expected: LifecyclePhase::SetUp,
                actual: LifecyclePhase::Created
            })
        ));
        lifecycle
            .advance(LifecyclePhase::Created, LifecyclePhase::SetUp)
            .unwrap();
        lifecycle
            .advance(LifecyclePhase::SetUp, LifecyclePhase::Running)
            .unwrap();
        lifecycle.ensure(LifecyclePhase::Running).unwrap();
        // Setting up twice is rejected.
        assert!(lifecycle
            .advance(LifecyclePhase::Created, LifecyclePhase::SetUp)
            .is_err());
    }

    #[test]
    fn failures_are_collected() {
        let failures = FailureChannel::default();
        failures.report(&Error::from(ProtocolViolation::UnknownOrigin { origin: 3 }));
        assert_eq!(failures.len(), 1);
        let drained = failures.drain();
        assert_eq!(drained[0].error_code, "UnknownOrigin");
        assert!(failures.is_empty());
    }
}
