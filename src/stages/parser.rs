//! Parser stage: stream units into the decoder's input queue

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::device::{BufferDescriptor, DecoderDevice};
use crate::error::{Error, Result};
use crate::parser::{BitstreamParser, Extracted, InputStream};
use crate::pipeline::Shared;

use super::retrieve_with_deadline;

/// Extracts access units into free input slots and submits them
pub struct ParserStage<'a> {
    config: &'a PipelineConfig,
    shared: &'a Shared,
    decoder: Arc<dyn DecoderDevice>,
    parser: Box<dyn BitstreamParser>,
    input: InputStream,
    slots: Vec<BufferDescriptor>,
    /// Slots queued on the decoder and not reclaimed yet
    in_flight: Vec<bool>,
}

impl<'a> ParserStage<'a> {
    /// Create the stage over the decoder's input buffers
    pub(crate) fn new(
        config: &'a PipelineConfig,
        shared: &'a Shared,
        decoder: Arc<dyn DecoderDevice>,
        parser: Box<dyn BitstreamParser>,
        input: InputStream,
        slots: Vec<BufferDescriptor>,
    ) -> Self {
        let in_flight = vec![false; slots.len()];
        Self {
            config,
            shared,
            decoder,
            parser,
            input,
            slots,
            in_flight,
        }
    }

    fn parsing_finished(&self) -> bool {
        self.shared.parsing_finished.load(Ordering::Acquire)
    }

    /// Run until the end-of-stream unit is submitted and every slot is back,
    /// or the pipeline stops
    pub fn run(mut self) -> Result<()> {
        log::debug!("Parser stage started with {} input slots", self.slots.len());

        loop {
            if self.shared.status.is_stopped() {
                break;
            }

            if !self.parsing_finished() {
                if let Some(slot) = self.in_flight.iter().position(|busy| !busy) {
                    self.submit_next(slot)?;
                    continue;
                }
            }

            if !self.in_flight.contains(&true) {
                break;
            }
            if !self.reclaim()? {
                break;
            }
        }

        log::debug!("Parser stage done at input offset {}", self.input.offset());
        Ok(())
    }

    /// Fill `slot` with the next unit, or the end-of-stream marker
    fn submit_next(&mut self, slot: usize) -> Result<()> {
        let plane = self.slots[slot]
            .primary()
            .ok_or_else(|| Error::Protocol(format!("input slot {} has no plane", slot)))?;
        let remaining = self.input.remaining();
        let extracted = plane.with_mut(|dest| self.parser.extract_unit(remaining, dest))?;

        match extracted {
            Extracted::Unit { consumed, size } => {
                self.input.advance(consumed);
                self.decoder.submit_input(slot, size)?;
                self.shared.stats.record_unit();
                log::trace!("Submitted {} byte unit in input slot {}", size, slot);
            }
            Extracted::EndOfStream => {
                self.decoder.submit_input(slot, 0)?;
                self.shared.parsing_finished.store(true, Ordering::Release);
                log::debug!("Input exhausted, end-of-stream submitted in slot {}", slot);
            }
        }

        self.in_flight[slot] = true;
        Ok(())
    }

    /// Take back one consumed input slot. Returns false when the stage should
    /// stop waiting.
    fn reclaim(&mut self) -> Result<bool> {
        let status = &self.shared.status;
        let decoder = &self.decoder;
        let result = retrieve_with_deadline(self.config, || status.is_stopped(), |timeout| {
            decoder.retrieve_input(timeout)
        });

        match result {
            Ok(Some(slot)) => match self.in_flight.get_mut(slot) {
                Some(busy) if *busy => {
                    *busy = false;
                    Ok(true)
                }
                _ => Err(Error::Protocol(format!(
                    "decoder returned input slot {} that was not queued",
                    slot
                ))),
            },
            Ok(None) => Ok(false),
            Err(e) if self.parsing_finished() => {
                log::debug!("Input reclaim after end of stream failed: {}", e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
