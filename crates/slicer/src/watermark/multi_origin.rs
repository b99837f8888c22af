use super::WatermarkSequencer;
use crate::error::{ProtocolViolation, Result};
use crate::{OriginId, Timestamp};
use crossbeam_utils::CachePadded;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Global watermark over a fixed set of origins.
///
/// The global watermark is the minimum of the origins' confirmed
/// watermarks.  An origin that has not confirmed anything yet holds the
/// global watermark at 0.  Readers only ever observe a non-decreasing
/// value.
#[derive(Debug)]
pub struct MultiOriginWatermarkProcessor {
    index: HashMap<OriginId, usize>,
    sequencers: Vec<WatermarkSequencer>,
    global: CachePadded<AtomicU64>,
}

impl MultiOriginWatermarkProcessor {
    /// Creates a processor for `origins`.  Each origin gets a reorder
    /// window of `capacity` updates.
    pub fn new(origins: &[OriginId], capacity: usize) -> Self {
        let mut index = HashMap::with_capacity(origins.len());
        let mut sequencers = Vec::with_capacity(origins.len());
        for &origin in origins {
            if index.contains_key(&origin) {
                continue;
            }
            index.insert(origin, sequencers.len());
            sequencers.push(WatermarkSequencer::for_origin(origin, capacity));
        }
        Self {
            index,
            sequencers,
            global: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn origins(&self) -> impl Iterator<Item = OriginId> + '_ {
        self.sequencers.iter().map(WatermarkSequencer::origin)
    }

    /// Applies one update and returns the global watermark afterwards.
    pub fn update_watermark(
        &self,
        origin: OriginId,
        sequence: u64,
        watermark: Timestamp,
    ) -> Result<Timestamp> {
        let sequencer = self.sequencer(origin)?;
        let confirmed = sequencer.update(sequence, watermark)?;
        let global = self.current_watermark();
        trace!(
            "origin {origin} seq {sequence} wm {watermark}: confirmed {confirmed}, global {global}"
        );
        Ok(global)
    }

    /// The minimum confirmed watermark across all origins.
    pub fn current_watermark(&self) -> Timestamp {
        let min = self
            .sequencers
            .iter()
            .map(WatermarkSequencer::confirmed_watermark)
            .min()
            .unwrap_or(0);
        let previous = self.global.fetch_max(min, Ordering::SeqCst);
        previous.max(min)
    }

    /// Confirmed watermark of a single origin.
    pub fn origin_watermark(&self, origin: OriginId) -> Result<Timestamp> {
        Ok(self.sequencer(origin)?.confirmed_watermark())
    }

    fn sequencer(&self, origin: OriginId) -> Result<&WatermarkSequencer> {
        self.index
            .get(&origin)
            .map(|&i| &self.sequencers[i])
            .ok_or_else(|| ProtocolViolation::UnknownOrigin { origin }.into())
    }
}
