//! Window definitions, slice assignment, the window lifecycle and result
//! emission.

mod assigner;
mod emit;
mod state;
mod time;

pub use assigner::{SliceAssigner, WindowDefinition};
pub use emit::{WindowEmitter, WindowRecord};
pub use state::{AtomicWindowState, WindowState};
pub use time::TimeFunction;

use crate::Timestamp;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt::{self, Display};

/// Half-open time interval `[start, end)` of a slice or window.
///
/// Bounds order by `end` first, so iterating a map keyed by bounds visits
/// windows in the order in which watermarks close them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct WindowBounds {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl WindowBounds {
    pub const fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts < self.end
    }

    /// Returns `true` if `other` lies entirely inside `self`.
    pub fn covers(&self, other: &WindowBounds) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl Ord for WindowBounds {
    fn cmp(&self, other: &Self) -> Ordering {
        self.end
            .cmp(&other.end)
            .then_with(|| self.start.cmp(&other.start))
    }
}

impl PartialOrd for WindowBounds {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::WindowBounds;

    #[test]
    fn bounds_order_by_end() {
        let mut bounds = vec![
            WindowBounds::new(100, 200),
            WindowBounds::new(0, 300),
            WindowBounds::new(50, 200),
        ];
        bounds.sort();
        assert_eq!(
            bounds,
            vec![
                WindowBounds::new(50, 200),
                WindowBounds::new(100, 200),
                WindowBounds::new(0, 300),
            ]
        );
        assert!(WindowBounds::new(0, 100).contains(99));
        assert!(!WindowBounds::new(0, 100).contains(100));
        assert!(WindowBounds::new(0, 100).covers(&WindowBounds::new(50, 100)));
    }
}
