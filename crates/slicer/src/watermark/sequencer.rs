use crate::error::{ProtocolViolation, Result};
use crate::{OriginId, Timestamp};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};

pub use slicer_types::config::DEFAULT_REORDER_CAPACITY;

/// One entry of the reorder ring.
///
/// `tag` is 0 for a slot that was never used, otherwise `(seq + 1) << 1`
/// while the writer for `seq` fills in the watermark, and
/// `((seq + 1) << 1) | 1` once the watermark is readable.
#[derive(Default)]
struct Slot {
    tag: AtomicU64,
    watermark: AtomicU64,
}

const READY: u64 = 1;

fn claimed_tag(sequence: u64) -> u64 {
    (sequence + 1) << 1
}

fn ready_tag(sequence: u64) -> u64 {
    claimed_tag(sequence) | READY
}

/// Orders the watermark updates of a single origin.
///
/// Updates are stored in a ring of `capacity` slots keyed by sequence
/// number.  The confirmed watermark only advances over a gap-free prefix of
/// sequence numbers; a missing sequence number stalls the origin until it
/// arrives.
///
/// The sequencer is lock-free: writers claim their slot with a
/// compare-and-swap, and any thread that observes the slot for
/// `next_expected` being ready moves `next_expected` forward with a
/// compare-and-swap retry loop.
pub struct WatermarkSequencer {
    origin: OriginId,
    slots: Box<[CachePadded<Slot>]>,
    mask: u64,
    next_expected: CachePadded<AtomicU64>,
    confirmed: CachePadded<AtomicU64>,
}

impl std::fmt::Debug for WatermarkSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatermarkSequencer")
            .field("origin", &self.origin)
            .field("capacity", &self.capacity())
            .field("next_expected", &self.next_expected())
            .field("confirmed", &self.confirmed_watermark())
            .finish()
    }
}

impl Default for WatermarkSequencer {
    fn default() -> Self {
        Self::new(DEFAULT_REORDER_CAPACITY)
    }
}

impl WatermarkSequencer {
    /// Creates a sequencer with room for `capacity` out-of-order updates,
    /// rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        Self::for_origin(0, capacity)
    }

    /// Like [`new`](Self::new), but tags errors with `origin`.
    pub fn for_origin(origin: OriginId, capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            origin,
            slots: (0..capacity).map(|_| CachePadded::new(Slot::default())).collect(),
            mask: capacity as u64 - 1,
            next_expected: CachePadded::new(AtomicU64::new(0)),
            confirmed: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn origin(&self) -> OriginId {
        self.origin
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The lowest sequence number that has not been confirmed yet.
    pub fn next_expected(&self) -> u64 {
        self.next_expected.load(Ordering::SeqCst)
    }

    /// The watermark of the last update in the contiguous prefix, or 0 if
    /// sequence number 0 has not arrived yet.
    pub fn confirmed_watermark(&self) -> Timestamp {
        self.confirmed.load(Ordering::SeqCst)
    }

    /// Records the watermark carried by buffer `sequence` and returns the
    /// confirmed watermark afterwards.
    pub fn update(&self, sequence: u64, watermark: Timestamp) -> Result<Timestamp> {
        let next_expected = self.next_expected();
        if sequence < next_expected {
            return Err(self.duplicate(sequence));
        }
        if sequence - next_expected >= self.slots.len() as u64 {
            return Err(ProtocolViolation::SequenceOutOfRange {
                origin: self.origin,
                sequence,
                next_expected,
                capacity: self.slots.len(),
            }
            .into());
        }

        let slot = &self.slots[(sequence & self.mask) as usize];
        let claimed = claimed_tag(sequence);
        let mut current = slot.tag.load(Ordering::SeqCst);
        loop {
            // The slot either holds an older, already consumed sequence
            // number or this exact one.
            if current >> 1 >= sequence + 1 {
                return Err(self.duplicate(sequence));
            }
            match slot.tag.compare_exchange_weak(
                current,
                claimed,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        slot.watermark.store(watermark, Ordering::Release);
        slot.tag.store(ready_tag(sequence), Ordering::SeqCst);

        self.advance();
        Ok(self.confirmed_watermark())
    }

    /// Moves `next_expected` over every ready slot.
    ///
    /// A writer publishes its slot before scanning and the scan re-reads
    /// `next_expected` after every step, so at least one of two racing
    /// writers observes the other's slot and no ready update is left
    /// behind.
    fn advance(&self) {
        loop {
            let next = self.next_expected.load(Ordering::SeqCst);
            let slot = &self.slots[(next & self.mask) as usize];
            if slot.tag.load(Ordering::SeqCst) != ready_tag(next) {
                return;
            }
            let watermark = slot.watermark.load(Ordering::Acquire);
            if self
                .next_expected
                .compare_exchange(next, next + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.confirmed.fetch_max(watermark, Ordering::SeqCst);
            }
        }
    }

    fn duplicate(&self, sequence: u64) -> crate::Error {
        ProtocolViolation::DuplicateSequence {
            origin: self.origin,
            sequence,
        }
        .into()
    }
}
