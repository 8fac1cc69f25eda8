//! Loopback post-processor
//!
//! Pairs queued source and destination buffers in order, copies the visible
//! luma rows into the destination and carries the frame tag across.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{read_tag, wait_until, write_tag, FaultInjector, FaultPoint};
use crate::device::{
    bad_index, copy_rows, BufferDescriptor, CropRect, DecodedFormat, Direction,
    FramebufferGeometry, PostProcessor,
};
use crate::error::{DeviceKind, Error, Result};

const DEVICE: DeviceKind = DeviceKind::PostProcessor;

/// Loopback post-processor counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackPostProcessorStats {
    /// Conversions performed
    pub frames_converted: u64,

    /// Tags of converted frames, in conversion order
    pub converted_tags: Vec<u64>,

    /// Stream-on requests received
    pub stream_on_calls: u32,
}

#[derive(Default)]
struct PostState {
    input_format: Option<DecodedFormat>,
    output: Option<(FramebufferGeometry, usize)>,
    crop: Option<CropRect>,
    queued_inputs: VecDeque<(usize, BufferDescriptor)>,
    queued_outputs: VecDeque<(usize, BufferDescriptor)>,
    released_inputs: VecDeque<usize>,
    released_outputs: VecDeque<usize>,
    input_streaming: bool,
    output_streaming: bool,
    stats: LoopbackPostProcessorStats,
}

impl PostState {
    fn convert(&mut self) {
        if !(self.input_streaming && self.output_streaming) {
            return;
        }
        let Some((geometry, _)) = self.output else {
            return;
        };
        let source_bpl = self
            .input_format
            .as_ref()
            .map(|f| f.bytes_per_line as usize)
            .unwrap_or(0);
        let crop = self.crop.unwrap_or_default();

        while !self.queued_inputs.is_empty() && !self.queued_outputs.is_empty() {
            let (Some((src_index, src)), Some((dst_index, dst))) =
                (self.queued_inputs.pop_front(), self.queued_outputs.pop_front())
            else {
                break;
            };

            if let (Some(src_plane), Some(dst_plane)) = (src.primary(), dst.primary()) {
                let row_bytes = (crop.width as usize).min(geometry.stride as usize);
                let rows = (crop.height as usize).min(geometry.height as usize);
                let offset = crop.top as usize * source_bpl + crop.left as usize;
                src_plane.with(|src_bytes| {
                    dst_plane.with_mut(|dst_bytes| {
                        copy_rows(
                            src_bytes.get(offset..).unwrap_or(&[]),
                            source_bpl,
                            dst_bytes,
                            geometry.stride as usize,
                            row_bytes,
                            rows,
                        )
                    })
                });

                if let Some(tag) = read_tag(src_plane) {
                    write_tag(dst_plane, tag);
                    self.stats.converted_tags.push(tag);
                }
            }

            self.stats.frames_converted += 1;
            self.released_inputs.push_back(src_index);
            self.released_outputs.push_back(dst_index);
        }
    }
}

/// Software scaler with the queueing behaviour of an M2M converter
pub struct LoopbackPostProcessor {
    faults: Arc<FaultInjector>,
    state: Mutex<PostState>,
    changed: Condvar,
}

impl LoopbackPostProcessor {
    /// Create a post-processor
    pub fn new() -> Self {
        Self::with_faults(FaultInjector::new())
    }

    /// Create a post-processor sharing a fault injector
    pub fn with_faults(faults: Arc<FaultInjector>) -> Self {
        Self {
            faults,
            state: Mutex::new(PostState::default()),
            changed: Condvar::new(),
        }
    }

    /// Fault injector of this device
    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    /// Counters so far
    pub fn stats(&self) -> LoopbackPostProcessorStats {
        self.state.lock().stats.clone()
    }

    /// Source rectangle last selected
    pub fn crop(&self) -> Option<CropRect> {
        self.state.lock().crop
    }
}

impl Default for LoopbackPostProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl PostProcessor for LoopbackPostProcessor {
    fn setup_input(&self, format: &DecodedFormat) -> Result<()> {
        if format.buffer_count == 0 || format.plane_sizes.is_empty() {
            return Err(Error::device(DEVICE, "setup input", "empty source format"));
        }
        self.state.lock().input_format = Some(format.clone());
        Ok(())
    }

    fn setup_output(&self, geometry: &FramebufferGeometry, buffer_count: usize) -> Result<()> {
        geometry.pixel_format()?;
        if buffer_count == 0 {
            return Err(Error::device(DEVICE, "setup output", "no destination buffers"));
        }
        self.state.lock().output = Some((*geometry, buffer_count));
        Ok(())
    }

    fn set_crop(&self, crop: CropRect) -> Result<()> {
        let mut state = self.state.lock();
        let format = state
            .input_format
            .as_ref()
            .ok_or_else(|| Error::device(DEVICE, "set crop", "input format not set"))?;
        if !crop.fits(format.width, format.height) {
            return Err(Error::device(
                DEVICE,
                "set crop",
                format!("{:?} outside {}x{} frame", crop, format.width, format.height),
            ));
        }
        state.crop = Some(crop);
        Ok(())
    }

    fn submit_input(&self, index: usize, source: &BufferDescriptor) -> Result<()> {
        self.faults.check(FaultPoint::PostProcessSubmitInput)?;

        let mut state = self.state.lock();
        let format = state
            .input_format
            .as_ref()
            .ok_or_else(|| Error::device(DEVICE, "submit input", "input format not set"))?;
        if index >= format.buffer_count {
            return Err(bad_index(DEVICE, "submit input", index, format.buffer_count));
        }
        if source.planes.len() != format.plane_sizes.len() {
            return Err(Error::device(
                DEVICE,
                "submit input",
                format!(
                    "{} planes given, format has {}",
                    source.planes.len(),
                    format.plane_sizes.len()
                ),
            ));
        }
        if state.queued_inputs.iter().any(|(queued, _)| *queued == index) {
            return Err(Error::device(
                DEVICE,
                "submit input",
                format!("source buffer {} already queued", index),
            ));
        }

        state.queued_inputs.push_back((index, source.clone()));
        state.convert();
        self.changed.notify_all();
        Ok(())
    }

    fn submit_output(&self, index: usize, dest: &BufferDescriptor) -> Result<()> {
        self.faults.check(FaultPoint::PostProcessSubmitOutput)?;

        let mut state = self.state.lock();
        let (geometry, count) = state
            .output
            .ok_or_else(|| Error::device(DEVICE, "submit output", "output format not set"))?;
        if index >= count {
            return Err(bad_index(DEVICE, "submit output", index, count));
        }
        let size = dest.primary().map(|p| p.len()).unwrap_or(0);
        if size < geometry.screen_size() {
            return Err(Error::device(
                DEVICE,
                "submit output",
                format!("destination of {} bytes, screen needs {}", size, geometry.screen_size()),
            ));
        }

        state.queued_outputs.push_back((index, dest.clone()));
        state.convert();
        self.changed.notify_all();
        Ok(())
    }

    fn retrieve_output(&self, timeout: Duration) -> Result<usize> {
        self.faults.check(FaultPoint::PostProcessRetrieveOutput)?;

        wait_until(&self.state, &self.changed, timeout, DEVICE, "retrieve output", |state| {
            if let Some(index) = state.released_outputs.pop_front() {
                return Ok(Some(index));
            }
            if !state.output_streaming {
                return Err(Error::device(DEVICE, "retrieve output", "output queue not streaming"));
            }
            Ok(None)
        })
    }

    fn retrieve_input(&self, timeout: Duration) -> Result<usize> {
        wait_until(&self.state, &self.changed, timeout, DEVICE, "retrieve input", |state| {
            if let Some(index) = state.released_inputs.pop_front() {
                return Ok(Some(index));
            }
            if !state.input_streaming {
                return Err(Error::device(DEVICE, "retrieve input", "input queue not streaming"));
            }
            Ok(None)
        })
    }

    fn set_streaming(&self, direction: Direction, on: bool) -> Result<()> {
        let mut state = self.state.lock();
        if on {
            let (streaming, queued) = match direction {
                Direction::Input => (state.input_streaming, state.queued_inputs.len()),
                Direction::Output => (state.output_streaming, state.queued_outputs.len()),
            };
            if !streaming && queued == 0 {
                return Err(Error::device(DEVICE, "stream on", "no buffer queued"));
            }
            state.stats.stream_on_calls += 1;
        }

        match direction {
            Direction::Input => state.input_streaming = on,
            Direction::Output => state.output_streaming = on,
        }
        state.convert();
        self.changed.notify_all();
        Ok(())
    }
}
