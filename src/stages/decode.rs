//! Decode stage: output slot flow control
//!
//! The decoder holds `queued` output slots. Below the low-water mark the stage
//! must wait for post-processing to free a slot before anything else happens.
//! Between the low-water mark and the pool size it tops up with any slot that
//! is already free, and otherwise drains one decoded frame.

use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::device::{DecodedBuffer, DecoderDevice};
use crate::error::{Error, Result};
use crate::pipeline::{Shared, SlotState};

use super::retrieve_with_deadline;

/// Keeps the decoder supplied with free slots and hands decoded frames on
pub struct DecodeStage<'a> {
    config: &'a PipelineConfig,
    shared: &'a Shared,
    decoder: Arc<dyn DecoderDevice>,
    low_water: usize,
    pool_size: usize,
    /// Slots currently queued on the decoder
    queued: usize,
}

impl<'a> DecodeStage<'a> {
    /// Create the stage after every slot has been queued on the decoder
    pub(crate) fn new(
        config: &'a PipelineConfig,
        shared: &'a Shared,
        decoder: Arc<dyn DecoderDevice>,
        low_water: usize,
    ) -> Self {
        let pool_size = shared.table.len();
        let queued = shared.table.count(SlotState::OwnedByDecoder);
        Self {
            config,
            shared,
            decoder,
            low_water,
            pool_size,
            queued,
        }
    }

    /// Run until the end-of-stream buffer arrives or the pipeline stops
    pub fn run(mut self) -> Result<()> {
        log::debug!(
            "Decode stage started: {} of {} slots queued, low-water mark {}",
            self.queued,
            self.pool_size,
            self.low_water
        );

        while !self.shared.status.is_stopped() {
            if self.queued < self.low_water {
                if self.shared.handoff.wait_done(self.config.poll_interval)? {
                    self.resubmit_free_slot()?;
                }
            } else if self.queued < self.pool_size && self.shared.handoff.try_done() {
                self.resubmit_free_slot()?;
            } else {
                match self.dequeue()? {
                    Some(buffer) if buffer.is_end_of_stream() => {
                        log::info!("Decoder signalled end of stream");
                        self.shared.status.set_finished();
                    }
                    Some(buffer) => self.hand_off(buffer)?,
                    None => break,
                }
            }
        }

        Ok(())
    }

    /// Queue the slot a freed-slot token stands for
    fn resubmit_free_slot(&mut self) -> Result<()> {
        let index = self.shared.table.find_free().ok_or_else(|| {
            Error::Protocol("slot-freed signal received but no slot is free".into())
        })?;

        self.decoder.submit_output_slot(index)?;
        self.shared.table.mark(index, SlotState::OwnedByDecoder)?;
        self.queued += 1;
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Option<DecodedBuffer>> {
        let status = &self.shared.status;
        let decoder = &self.decoder;
        let buffer = retrieve_with_deadline(self.config, || status.is_stopped(), |timeout| {
            decoder.retrieve_output(timeout)
        })?;

        if let Some(buffer) = buffer {
            self.shared.table.expect(buffer.index, SlotState::OwnedByDecoder)?;
            self.queued -= 1;
        }
        Ok(buffer)
    }

    fn hand_off(&mut self, buffer: DecodedBuffer) -> Result<()> {
        self.shared
            .table
            .mark(buffer.index, SlotState::OwnedByPostprocess)?;
        self.shared.handoff.push(buffer.index)?;
        self.shared.stats.record_decoded();
        log::trace!(
            "Decoded {} bytes into slot {}",
            buffer.bytes_used,
            buffer.index
        );
        Ok(())
    }
}
