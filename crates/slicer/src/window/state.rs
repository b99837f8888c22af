use super::WindowBounds;
use crate::error::{ProtocolViolation, Result};
use serde::Serialize;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a slice or window.
///
/// ```text
/// Active -> Closed -> Staged -> Merged -> Emitted -> Discarded
/// ```
///
/// Any state before `Emitted` may also go straight to `Discarded` when the
/// window is aborted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WindowState {
    /// Accepting records.
    Active = 0,
    /// The worker's watermark passed the end; no more records.
    Closed = 1,
    /// Handed to staging, waiting for the other workers.
    Staged = 2,
    /// All contributions combined into a global result.
    Merged = 3,
    /// Result written to the downstream sink.
    Emitted = 4,
    Discarded = 5,
}

impl WindowState {
    pub fn can_transition(self, to: WindowState) -> bool {
        use WindowState::*;
        matches!(
            (self, to),
            (Active, Closed)
                | (Closed, Staged)
                | (Staged, Merged)
                | (Merged, Emitted)
                | (Active | Closed | Staged | Merged | Emitted, Discarded)
        )
    }

    /// Transition of a state owned by a single thread.
    pub fn transition(&mut self, to: WindowState) -> Result<()> {
        if !self.can_transition(to) {
            return Err(ProtocolViolation::IllegalTransition { from: *self, to }.into());
        }
        *self = to;
        Ok(())
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Closed,
            2 => Self::Staged,
            3 => Self::Merged,
            4 => Self::Emitted,
            _ => Self::Discarded,
        }
    }
}

impl Display for WindowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Staged => "staged",
            Self::Merged => "merged",
            Self::Emitted => "emitted",
            Self::Discarded => "discarded",
        };
        f.write_str(name)
    }
}

/// [`WindowState`] shared between threads.
#[derive(Debug)]
pub struct AtomicWindowState(AtomicU8);

impl AtomicWindowState {
    pub fn new(state: WindowState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> WindowState {
        WindowState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to`.  Fails if another thread already moved
    /// the state; a second `Merged -> Emitted` is reported as a double
    /// emit of `bounds`.
    pub fn transition(
        &self,
        from: WindowState,
        to: WindowState,
        bounds: WindowBounds,
    ) -> Result<()> {
        if !from.can_transition(to) {
            return Err(ProtocolViolation::IllegalTransition { from, to }.into());
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                let actual = WindowState::from_u8(actual);
                if to == WindowState::Emitted && actual == WindowState::Emitted {
                    ProtocolViolation::DoubleEmit { bounds }.into()
                } else {
                    ProtocolViolation::IllegalTransition { from: actual, to }.into()
                }
            })
    }

    /// Moves any non-terminal state to `Discarded`.  Returns the state the
    /// window was in, or `None` if it was already emitted or discarded.
    pub fn discard(&self) -> Option<WindowState> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let state = WindowState::from_u8(current);
            if matches!(state, WindowState::Emitted | WindowState::Discarded) {
                return None;
            }
            match self.0.compare_exchange_weak(
                current,
                WindowState::Discarded as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(state),
                Err(actual) => current = actual,
            }
        }
    }
}
