//! Watermark tracking.
//!
//! Every origin numbers its buffers with consecutive sequence numbers
//! starting at 0, and buffers may reach the workers in any order.  A
//! [`WatermarkSequencer`] only advances an origin's watermark over the
//! contiguous prefix of sequence numbers it has seen.  The
//! [`MultiOriginWatermarkProcessor`] combines the origins into the global
//! watermark that decides when windows may be finalized.

mod multi_origin;
mod sequencer;

pub use multi_origin::MultiOriginWatermarkProcessor;
pub use sequencer::{WatermarkSequencer, DEFAULT_REORDER_CAPACITY};
