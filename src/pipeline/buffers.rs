//! Ownership of decoded buffer slots

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Holder of a decoded slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Available for resubmission to the decoder
    Free,
    /// Queued on the decoder, awaiting a frame
    OwnedByDecoder,
    /// Holds a decoded frame queued for conversion
    OwnedByPostprocess,
}

impl SlotState {
    fn name(&self) -> &'static str {
        match self {
            SlotState::Free => "free",
            SlotState::OwnedByDecoder => "decoder",
            SlotState::OwnedByPostprocess => "postprocess",
        }
    }

    /// Whether `next` may directly follow this state
    fn may_become(&self, next: SlotState) -> bool {
        matches!(
            (self, next),
            (SlotState::Free, SlotState::OwnedByDecoder)
                | (SlotState::OwnedByDecoder, SlotState::OwnedByPostprocess)
                | (SlotState::OwnedByPostprocess, SlotState::Free)
        )
    }
}

/// State of every slot in the decoded pool
#[derive(Debug)]
pub struct BufferStateTable {
    slots: Mutex<Vec<SlotState>>,
}

impl BufferStateTable {
    /// Create a table of `pool_size` free slots
    pub fn new(pool_size: usize) -> Self {
        Self {
            slots: Mutex::new(vec![SlotState::Free; pool_size]),
        }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move `index` to `next`. Only the cycle free -> decoder -> postprocess
    /// -> free is accepted.
    pub fn mark(&self, index: usize, next: SlotState) -> Result<()> {
        let mut slots = self.slots.lock();
        let count = slots.len();
        let slot = slots.get_mut(index).ok_or_else(|| {
            Error::Protocol(format!("slot {} outside pool of {}", index, count))
        })?;

        if !slot.may_become(next) {
            return Err(Error::Protocol(format!(
                "slot {} cannot move from {} to {}",
                index,
                slot.name(),
                next.name()
            )));
        }

        log::trace!("slot {}: {} -> {}", index, slot.name(), next.name());
        *slot = next;
        Ok(())
    }

    /// Current state of a slot
    pub fn state(&self, index: usize) -> Option<SlotState> {
        self.slots.lock().get(index).copied()
    }

    /// Fail unless `index` is in `expected`
    pub fn expect(&self, index: usize, expected: SlotState) -> Result<()> {
        match self.state(index) {
            Some(state) if state == expected => Ok(()),
            Some(state) => Err(Error::Protocol(format!(
                "slot {} is {}, expected {}",
                index,
                state.name(),
                expected.name()
            ))),
            None => Err(Error::Protocol(format!("slot {} outside pool", index))),
        }
    }

    /// First free slot
    pub fn find_free(&self) -> Option<usize> {
        self.find(SlotState::Free)
    }

    /// First slot holding a decoded frame
    pub fn find_owned_by_postprocess(&self) -> Option<usize> {
        self.find(SlotState::OwnedByPostprocess)
    }

    /// Number of slots in `state`
    pub fn count(&self, state: SlotState) -> usize {
        self.slots.lock().iter().filter(|s| **s == state).count()
    }

    /// Look at every slot under one lock
    pub fn inspect<R>(&self, f: impl FnOnce(&[SlotState]) -> R) -> R {
        f(&self.slots.lock())
    }

    fn find(&self, state: SlotState) -> Option<usize> {
        self.slots.lock().iter().position(|s| *s == state)
    }
}
