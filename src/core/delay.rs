//! Per-synapse transmission delay.
//!
//! A [`DelayQueue`] is a fixed ring of [`DELAY_SLOTS`] delivery flags. A spike
//! enqueued with delay `d` sets the flag `d` slots ahead of the cursor; every
//! tick advances the cursor and reports (and clears) the flag it lands on.
//! Two spikes that land in the same slot are one delivery.

use std::io::{self, Read, Write};

use crate::error::DelayError;
use crate::storage;

/// Number of slots in the ring; the largest usable delay is `DELAY_SLOTS - 1`.
pub const DELAY_SLOTS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayQueue {
    slots: [bool; DELAY_SLOTS],
    cursor: usize,
}

impl Default for DelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayQueue {
    pub fn new() -> Self {
        Self {
            slots: [false; DELAY_SLOTS],
            cursor: 0,
        }
    }

    /// Schedule a delivery `delay_ticks` ticks from now.
    pub fn enqueue(&mut self, delay_ticks: usize) -> Result<(), DelayError> {
        if delay_ticks == 0 || delay_ticks >= DELAY_SLOTS {
            return Err(DelayError::OutOfRange {
                delay: delay_ticks,
                capacity: DELAY_SLOTS,
            });
        }
        self.slots[(self.cursor + delay_ticks) % DELAY_SLOTS] = true;
        Ok(())
    }

    /// Advance one tick. Returns true if a delivery was due.
    #[inline]
    pub fn tick(&mut self) -> bool {
        self.cursor = (self.cursor + 1) % DELAY_SLOTS;
        core::mem::replace(&mut self.slots[self.cursor], false)
    }

    pub fn is_empty(&self) -> bool {
        !self.slots.iter().any(|&s| s)
    }

    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|&&s| s).count()
    }

    pub(crate) fn write_image<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut mask: u32 = 0;
        for (i, &pending) in self.slots.iter().enumerate() {
            if pending {
                mask |= 1 << i;
            }
        }
        storage::write_u32_le(w, self.cursor as u32)?;
        storage::write_u32_le(w, mask)
    }

    pub(crate) fn read_image<R: Read>(r: &mut R) -> io::Result<Self> {
        let cursor = storage::read_u32_le(r)? as usize;
        if cursor >= DELAY_SLOTS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "delay queue cursor out of range",
            ));
        }
        let mask = storage::read_u32_le(r)?;
        let mut slots = [false; DELAY_SLOTS];
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = mask & (1 << i) != 0;
        }
        Ok(Self { slots, cursor })
    }
}
