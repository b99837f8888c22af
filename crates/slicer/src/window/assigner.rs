use super::WindowBounds;
use crate::Timestamp;
use slicer_types::WindowConfig;

/// Size and slide of a window.  Windows start at every multiple of
/// `slide` and cover `size` time units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowDefinition {
    pub size: u64,
    pub slide: u64,
}

impl WindowDefinition {
    pub fn tumbling(size: u64) -> Self {
        Self { size, slide: size }
    }

    pub fn sliding(size: u64, slide: u64) -> Self {
        Self { size, slide }
    }

    pub fn is_tumbling(&self) -> bool {
        self.size == self.slide
    }
}

impl From<&WindowConfig> for WindowDefinition {
    fn from(config: &WindowConfig) -> Self {
        Self::sliding(config.size, config.slide())
    }
}

/// Maps timestamps to slices and windows.
///
/// Slices are the panes between consecutive window boundaries: every
/// record belongs to exactly one slice, and every window is a union of
/// whole slices.  For tumbling windows a slice is the window itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SliceAssigner {
    definition: WindowDefinition,
}

impl SliceAssigner {
    pub fn new(definition: WindowDefinition) -> Self {
        debug_assert!(definition.size > 0 && definition.slide > 0);
        debug_assert!(definition.slide <= definition.size);
        Self { definition }
    }

    pub fn definition(&self) -> WindowDefinition {
        self.definition
    }

    /// Bounds of the slice containing `ts`.
    pub fn slice_bounds(&self, ts: Timestamp) -> WindowBounds {
        let WindowDefinition { size, slide } = self.definition;

        let last_start = ts - ts % slide;
        let next_start = last_start.saturating_add(slide);
        if size == slide {
            return WindowBounds::new(last_start, next_start);
        }

        let (last_end, next_end) = if ts < size {
            (0, size)
        } else {
            let end = (ts - size) / slide * slide + size;
            (end, end.saturating_add(slide))
        };
        WindowBounds::new(last_start.max(last_end), next_start.min(next_end))
    }

    pub fn slice_start(&self, ts: Timestamp) -> Timestamp {
        self.slice_bounds(ts).start
    }

    pub fn slice_end(&self, ts: Timestamp) -> Timestamp {
        self.slice_bounds(ts).end
    }

    /// All windows containing `ts`, ordered by start.
    pub fn windows_containing(&self, ts: Timestamp) -> Vec<WindowBounds> {
        let WindowDefinition { size, slide } = self.definition;
        let mut windows = Vec::with_capacity((size / slide) as usize + 1);
        let mut start = ts - ts % slide;
        loop {
            let end = start.saturating_add(size);
            if end <= ts {
                break;
            }
            windows.push(WindowBounds::new(start, end));
            match start.checked_sub(slide) {
                Some(previous) => start = previous,
                None => break,
            }
        }
        windows.reverse();
        windows
    }

    /// Windows whose end lies in `(after, up_to]`, ordered by end.
    pub fn windows_ending_in(
        &self,
        after: Timestamp,
        up_to: Timestamp,
    ) -> impl Iterator<Item = WindowBounds> {
        let WindowDefinition { size, slide } = self.definition;
        let first = if after < size {
            Some(size)
        } else {
            ((after - size) / slide + 1)
                .checked_mul(slide)
                .and_then(|offset| offset.checked_add(size))
        };
        std::iter::successors(first, move |end| end.checked_add(slide))
            .take_while(move |end| *end <= up_to)
            .map(move |end| WindowBounds::new(end - size, end))
    }
}

#[cfg(test)]
mod tests {
    use super::{SliceAssigner, WindowDefinition};
    use crate::window::WindowBounds;
    use proptest::prelude::*;

    #[test]
    fn tumbling_boundaries() {
        let assigner = SliceAssigner::new(WindowDefinition::tumbling(100));
        assert_eq!(assigner.slice_bounds(0), WindowBounds::new(0, 100));
        assert_eq!(assigner.slice_bounds(99), WindowBounds::new(0, 100));
        assert_eq!(assigner.slice_bounds(100), WindowBounds::new(100, 200));
        assert_eq!(assigner.slice_start(199), 100);
        assert_eq!(assigner.slice_end(199), 200);
        assert_eq!(
            assigner.windows_containing(150),
            vec![WindowBounds::new(100, 200)]
        );
    }

    #[test]
    fn sliding_panes() {
        // Boundaries at 0, 30, 60, 90, 100, 120, 130, 150, 160, ...
        let assigner = SliceAssigner::new(WindowDefinition::sliding(100, 30));
        assert_eq!(assigner.slice_bounds(95), WindowBounds::new(90, 100));
        assert_eq!(assigner.slice_bounds(105), WindowBounds::new(100, 120));
        assert_eq!(assigner.slice_bounds(125), WindowBounds::new(120, 130));
        assert_eq!(assigner.slice_bounds(130), WindowBounds::new(130, 150));

        // Slide divides size: slices are slide-aligned.
        let assigner = SliceAssigner::new(WindowDefinition::sliding(100, 50));
        assert_eq!(assigner.slice_bounds(120), WindowBounds::new(100, 150));
        assert_eq!(
            assigner.windows_containing(120),
            vec![WindowBounds::new(50, 150), WindowBounds::new(100, 200)]
        );
        assert_eq!(
            assigner.windows_containing(20),
            vec![WindowBounds::new(0, 100)]
        );
    }

    #[test]
    fn window_ends() {
        let assigner = SliceAssigner::new(WindowDefinition::sliding(100, 50));
        assert_eq!(
            assigner.windows_ending_in(0, 200).collect::<Vec<_>>(),
            vec![
                WindowBounds::new(0, 100),
                WindowBounds::new(50, 150),
                WindowBounds::new(100, 200)
            ]
        );
        assert_eq!(
            assigner.windows_ending_in(150, 249).collect::<Vec<_>>(),
            vec![WindowBounds::new(100, 200)]
        );
        assert_eq!(assigner.windows_ending_in(200, 200).count(), 0);
        assert_eq!(assigner.windows_ending_in(u64::MAX - 10, u64::MAX).count(), 0);
    }

    proptest! {
        #[test]
        fn slices_tile_windows(size in 1u64..200, slide_div in 1u64..200, ts in 0u64..10_000) {
            let slide = (size / slide_div).max(1);
            let assigner = SliceAssigner::new(WindowDefinition::sliding(size, slide));
            let slice = assigner.slice_bounds(ts);
            prop_assert!(slice.contains(ts));
            // The slice is entirely inside or entirely outside every window.
            for window in assigner.windows_containing(ts) {
                prop_assert!(window.contains(ts));
                prop_assert!(window.covers(&slice));
            }
            for window in assigner.windows_containing(slice.end) {
                prop_assert!(!window.contains(ts) || window.covers(&slice));
            }
        }
    }
}
