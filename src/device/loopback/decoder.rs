//! Loopback decoder
//!
//! Consumes stream units and produces one tagged output buffer per unit once
//! both an input unit and an empty output slot are queued.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{wait_until, write_tag, FaultInjector, FaultPoint};
use crate::config::Codec;
use crate::device::{
    bad_index, BufferDescriptor, CropRect, DecodedBuffer, DecodedFormat, DecoderDevice, Direction,
    InputLayout, PixelFormat,
};
use crate::error::{DeviceKind, Error, Result};

const DEVICE: DeviceKind = DeviceKind::Decoder;

/// Loopback decoder settings
#[derive(Debug, Clone)]
pub struct LoopbackDecoderOptions {
    /// Visible width of decoded frames
    pub width: u32,

    /// Visible height of decoded frames
    pub height: u32,

    /// Output buffers the decoder needs queued to make progress
    pub min_buffers: usize,
}

impl Default for LoopbackDecoderOptions {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            min_buffers: 2,
        }
    }
}

/// Loopback decoder counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackDecoderStats {
    /// Non-empty units queued, the header included
    pub units_received: u64,

    /// Frames produced
    pub frames_decoded: u64,

    /// Empty output slots queued
    pub output_submissions: u64,

    /// Highest number of output buffers held by the decoder at once
    pub max_held_outputs: usize,

    /// Whether the end-of-stream buffer was produced
    pub end_of_stream_sent: bool,
}

#[derive(Default)]
struct DecoderState {
    codec: Option<Codec>,
    inputs: Vec<BufferDescriptor>,
    input_queued: Vec<bool>,
    pending_units: VecDeque<(usize, usize)>,
    released_inputs: VecDeque<usize>,
    input_streaming: bool,
    header_consumed: bool,
    end_of_stream: bool,

    format: Option<DecodedFormat>,
    outputs: Vec<BufferDescriptor>,
    output_held: Vec<bool>,
    empty_outputs: VecDeque<usize>,
    decoded: VecDeque<DecodedBuffer>,
    output_streaming: bool,

    /// Empty outputs that must be queued before a frame is decoded
    min_buffers: usize,
    sequence: u64,
    stats: LoopbackDecoderStats,
}

impl DecoderState {
    fn held_outputs(&self) -> usize {
        self.output_held.iter().filter(|held| **held).count()
    }

    fn release_input(&mut self, slot: usize) {
        self.released_inputs.push_back(slot);
    }

    /// Move units through the decoder as far as queued buffers allow
    fn pump(&mut self) {
        if !self.input_streaming {
            return;
        }

        while let Some(&(slot, bytes_used)) = self.pending_units.front() {
            if !self.header_consumed {
                self.pending_units.pop_front();
                self.header_consumed = true;
                self.release_input(slot);
                continue;
            }
            if bytes_used == 0 {
                self.pending_units.pop_front();
                self.end_of_stream = true;
                self.release_input(slot);
                continue;
            }
            if !self.output_streaming || self.empty_outputs.len() < self.min_buffers {
                break;
            }
            let Some(index) = self.empty_outputs.pop_front() else {
                break;
            };
            self.pending_units.pop_front();

            let plane_size = match self.outputs[index].primary() {
                Some(plane) => {
                    write_tag(plane, self.sequence);
                    plane.len()
                }
                None => 0,
            };
            self.sequence += 1;
            self.stats.frames_decoded += 1;
            self.decoded.push_back(DecodedBuffer {
                index,
                bytes_used: plane_size,
            });
            self.release_input(slot);
        }

        if self.end_of_stream
            && self.pending_units.is_empty()
            && self.output_streaming
            && !self.stats.end_of_stream_sent
        {
            if let Some(index) = self.empty_outputs.pop_front() {
                self.decoded.push_back(DecodedBuffer {
                    index,
                    bytes_used: 0,
                });
                self.stats.end_of_stream_sent = true;
            }
        }
    }
}

/// Software decoder with the queueing behaviour of a stateful M2M decoder
pub struct LoopbackDecoder {
    options: LoopbackDecoderOptions,
    faults: Arc<FaultInjector>,
    state: Mutex<DecoderState>,
    changed: Condvar,
}

impl LoopbackDecoder {
    /// Create a decoder
    pub fn new(options: LoopbackDecoderOptions) -> Self {
        Self::with_faults(options, FaultInjector::new())
    }

    /// Create a decoder sharing a fault injector
    pub fn with_faults(options: LoopbackDecoderOptions, faults: Arc<FaultInjector>) -> Self {
        Self {
            options,
            faults,
            state: Mutex::new(DecoderState::default()),
            changed: Condvar::new(),
        }
    }

    /// Fault injector of this device
    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    /// Counters so far
    pub fn stats(&self) -> LoopbackDecoderStats {
        self.state.lock().stats.clone()
    }

    /// Codec the input queue was configured for
    pub fn codec(&self) -> Option<Codec> {
        self.state.lock().codec
    }

    fn decoded_format(&self, extra_buffers: usize) -> DecodedFormat {
        let width = self.options.width.max(16);
        let height = self.options.height.max(16);
        let coded_width = (width + 15) & !15;
        let coded_height = (height + 15) & !15;
        let luma = coded_width as usize * coded_height as usize;

        DecodedFormat {
            pixel_format: PixelFormat::Nv12,
            width: coded_width,
            height: coded_height,
            crop: CropRect {
                left: 0,
                top: 0,
                width,
                height,
            },
            plane_sizes: vec![luma, luma / 2],
            bytes_per_line: coded_width,
            buffer_count: self.options.min_buffers + extra_buffers,
            min_buffers: self.options.min_buffers,
        }
    }
}

impl DecoderDevice for LoopbackDecoder {
    fn setup_input(&self, codec: Codec, buffer_size: usize, buffer_count: usize) -> Result<InputLayout> {
        if buffer_size == 0 || buffer_count == 0 {
            return Err(Error::device(DEVICE, "setup input", "empty stream buffer request"));
        }

        let mut state = self.state.lock();
        state.codec = Some(codec);
        state.inputs = (0..buffer_count)
            .map(|_| BufferDescriptor::allocate(&[buffer_size], buffer_size as u32))
            .collect();
        state.input_queued = vec![false; buffer_count];

        log::debug!(
            "Loopback decoder: {} input buffers of {} bytes for {}",
            buffer_count,
            buffer_size,
            codec
        );
        Ok(InputLayout {
            buffer_count,
            buffer_size,
        })
    }

    fn input_buffer(&self, slot: usize) -> Result<BufferDescriptor> {
        let state = self.state.lock();
        state
            .inputs
            .get(slot)
            .cloned()
            .ok_or_else(|| bad_index(DEVICE, "query input buffer", slot, state.inputs.len()))
    }

    fn submit_input(&self, slot: usize, bytes_used: usize) -> Result<()> {
        self.faults.check(FaultPoint::DecoderSubmitInput)?;

        let mut state = self.state.lock();
        let count = state.inputs.len();
        let capacity = match state.inputs.get(slot).and_then(|b| b.primary()) {
            Some(plane) => plane.len(),
            None => return Err(bad_index(DEVICE, "submit input", slot, count)),
        };
        if state.input_queued[slot] {
            return Err(Error::device(
                DEVICE,
                "submit input",
                format!("input buffer {} already queued", slot),
            ));
        }
        if bytes_used > capacity {
            return Err(Error::device(
                DEVICE,
                "submit input",
                format!("{} bytes exceed buffer of {} bytes", bytes_used, capacity),
            ));
        }

        state.input_queued[slot] = true;
        state.pending_units.push_back((slot, bytes_used));
        if bytes_used > 0 {
            state.stats.units_received += 1;
        }
        state.pump();
        self.changed.notify_all();
        Ok(())
    }

    fn retrieve_input(&self, timeout: Duration) -> Result<usize> {
        wait_until(&self.state, &self.changed, timeout, DEVICE, "retrieve input", |state| {
            if let Some(slot) = state.released_inputs.pop_front() {
                state.input_queued[slot] = false;
                return Ok(Some(slot));
            }
            if !state.input_streaming {
                return Err(Error::device(DEVICE, "retrieve input", "input queue not streaming"));
            }
            Ok(None)
        })
    }

    fn setup_output(&self, extra_buffers: usize) -> Result<DecodedFormat> {
        let mut state = self.state.lock();
        if !state.header_consumed {
            return Err(Error::device(DEVICE, "setup output", "stream header not parsed yet"));
        }

        let format = self.decoded_format(extra_buffers);
        state.outputs = (0..format.buffer_count)
            .map(|_| BufferDescriptor::allocate(&format.plane_sizes, format.bytes_per_line))
            .collect();
        state.output_held = vec![false; format.buffer_count];
        state.min_buffers = format.min_buffers.max(1);
        state.format = Some(format.clone());

        log::debug!(
            "Loopback decoder: {}x{} output, {} buffers (min {})",
            format.width,
            format.height,
            format.buffer_count,
            format.min_buffers
        );
        Ok(format)
    }

    fn output_buffer(&self, index: usize) -> Result<BufferDescriptor> {
        let state = self.state.lock();
        state
            .outputs
            .get(index)
            .cloned()
            .ok_or_else(|| bad_index(DEVICE, "query output buffer", index, state.outputs.len()))
    }

    fn submit_output_slot(&self, index: usize) -> Result<()> {
        self.faults.check(FaultPoint::DecoderSubmitOutput)?;

        let mut state = self.state.lock();
        let count = state.outputs.len();
        match state.output_held.get(index) {
            None => return Err(bad_index(DEVICE, "submit output", index, count)),
            Some(true) => {
                return Err(Error::device(
                    DEVICE,
                    "submit output",
                    format!("output buffer {} already queued", index),
                ))
            }
            Some(false) => {}
        }

        state.output_held[index] = true;
        state.empty_outputs.push_back(index);
        state.stats.output_submissions += 1;
        let held = state.held_outputs();
        state.stats.max_held_outputs = state.stats.max_held_outputs.max(held);
        state.pump();
        self.changed.notify_all();
        Ok(())
    }

    fn retrieve_output(&self, timeout: Duration) -> Result<DecodedBuffer> {
        self.faults.check(FaultPoint::DecoderRetrieveOutput)?;

        wait_until(&self.state, &self.changed, timeout, DEVICE, "retrieve output", |state| {
            if let Some(buffer) = state.decoded.pop_front() {
                state.output_held[buffer.index] = false;
                return Ok(Some(buffer));
            }
            if !state.output_streaming {
                return Err(Error::device(DEVICE, "retrieve output", "output queue not streaming"));
            }
            Ok(None)
        })
    }

    fn set_streaming(&self, direction: Direction, on: bool) -> Result<()> {
        let mut state = self.state.lock();
        match (direction, on) {
            (Direction::Input, true) => {
                if !state.input_streaming && state.pending_units.is_empty() {
                    return Err(Error::device(DEVICE, "stream on input", "no buffer queued"));
                }
                state.input_streaming = true;
            }
            (Direction::Output, true) => {
                if !state.output_streaming && state.empty_outputs.is_empty() {
                    return Err(Error::device(DEVICE, "stream on output", "no buffer queued"));
                }
                state.output_streaming = true;
            }
            (Direction::Input, false) => state.input_streaming = false,
            (Direction::Output, false) => state.output_streaming = false,
        }

        log::debug!(
            "Loopback decoder: {} streaming {}",
            direction.name(),
            if on { "on" } else { "off" }
        );
        state.pump();
        self.changed.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::loopback::read_tag;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn started() -> LoopbackDecoder {
        let decoder = LoopbackDecoder::new(LoopbackDecoderOptions::default());
        decoder.setup_input(Codec::H264, 1024, 2).unwrap();
        decoder.submit_input(0, 32).unwrap();
        decoder.set_streaming(Direction::Input, true).unwrap();
        assert_eq!(decoder.retrieve_input(TIMEOUT).unwrap(), 0);
        decoder
    }

    #[test]
    fn test_output_requires_header() {
        let decoder = LoopbackDecoder::new(LoopbackDecoderOptions::default());
        decoder.setup_input(Codec::H264, 1024, 2).unwrap();
        assert!(decoder.setup_output(2).is_err());

        let decoder = started();
        let format = decoder.setup_output(2).unwrap();
        assert_eq!(format.buffer_count, 4);
        assert_eq!(format.min_buffers, 2);
        assert_eq!(format.crop.width, 320);
        assert!(format.crop.fits(format.width, format.height));
    }

    #[test]
    fn test_streaming_needs_queued_buffer() {
        let decoder = LoopbackDecoder::new(LoopbackDecoderOptions::default());
        decoder.setup_input(Codec::Mpeg4, 1024, 2).unwrap();
        assert!(decoder.set_streaming(Direction::Input, true).is_err());
    }

    #[test]
    fn test_decode_and_end_of_stream() {
        let decoder = started();
        let format = decoder.setup_output(1).unwrap();
        for index in 0..format.buffer_count {
            decoder.submit_output_slot(index).unwrap();
        }
        decoder.set_streaming(Direction::Output, true).unwrap();

        decoder.submit_input(1, 100).unwrap();
        let frame = decoder.retrieve_output(TIMEOUT).unwrap();
        assert!(!frame.is_end_of_stream());
        let plane = decoder.output_buffer(frame.index).unwrap().planes[0].clone();
        assert_eq!(read_tag(&plane), Some(0));
        assert_eq!(decoder.retrieve_input(TIMEOUT).unwrap(), 1);

        decoder.submit_input(1, 0).unwrap();
        let eos = decoder.retrieve_output(TIMEOUT).unwrap();
        assert!(eos.is_end_of_stream());
        assert!(decoder.stats().end_of_stream_sent);
    }

    #[test]
    fn test_holds_frames_until_minimum_queued() {
        let decoder = started();
        decoder.setup_output(2).unwrap();
        decoder.submit_output_slot(0).unwrap();
        decoder.set_streaming(Direction::Output, true).unwrap();

        decoder.submit_input(1, 100).unwrap();
        assert!(decoder.retrieve_output(Duration::from_millis(20)).unwrap_err().is_timeout());
        assert_eq!(decoder.stats().frames_decoded, 0);

        decoder.submit_output_slot(1).unwrap();
        let frame = decoder.retrieve_output(TIMEOUT).unwrap();
        assert_eq!(frame.index, 0);
        assert_eq!(decoder.stats().frames_decoded, 1);
    }

    #[test]
    fn test_double_queue_rejected() {
        let decoder = started();
        decoder.setup_output(0).unwrap();
        decoder.submit_output_slot(0).unwrap();
        assert!(decoder.submit_output_slot(0).is_err());
        assert!(decoder.submit_output_slot(9).is_err());
    }

    #[test]
    fn test_retrieve_times_out() {
        let decoder = started();
        decoder.setup_output(0).unwrap();
        decoder.submit_output_slot(0).unwrap();
        decoder.set_streaming(Direction::Output, true).unwrap();
        let err = decoder.retrieve_output(Duration::from_millis(20)).unwrap_err();
        assert!(err.is_timeout());
    }
}
