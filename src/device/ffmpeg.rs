//! FFmpeg software backend using ffmpeg-next
//!
//! [`FfmpegDecoder`] decodes stream units with libavcodec into the decoded
//! slots as YUV420P, and [`SwscalePostProcessor`] crops, scales and converts
//! them into framebuffer screens with libswscale. Both keep the queueing rules
//! of the hardware devices they replace, so the pipeline drives them unchanged.

use std::collections::VecDeque;
use std::time::Duration;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::context::Context as CodecContext;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context as ScalerContext, Flags as ScalerFlags};
use ffmpeg_next::util::frame::video::Video as VideoFrameFFmpeg;
use parking_lot::{Condvar, Mutex};

use super::loopback::wait_until;
use super::{
    bad_index, copy_rows, BufferDescriptor, CropRect, DecodedBuffer, DecodedFormat, DecoderDevice,
    Direction, FramebufferGeometry, InputLayout, PixelFormat, PostProcessor,
};
use crate::config::Codec;
use crate::error::{DeviceKind, Error, Result};

/// Decoded frames held back before input slots stop being released
const MAX_READY_FRAMES: usize = 2;

fn codec_id(codec: Codec) -> ffmpeg::codec::Id {
    match codec {
        Codec::H264 => ffmpeg::codec::Id::H264,
        Codec::Mpeg4 => ffmpeg::codec::Id::MPEG4,
    }
}

fn ffmpeg_error(device: DeviceKind, operation: &'static str, e: ffmpeg::Error) -> Error {
    Error::device(device, operation, e.to_string())
}

/// Row layout of one plane: stride, horizontal and vertical subsampling
/// shifts, bytes per sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlaneLayout {
    stride: usize,
    x_shift: u32,
    y_shift: u32,
    sample_bytes: usize,
}

fn plane_layouts(format: PixelFormat, bytes_per_line: usize) -> Option<Vec<PlaneLayout>> {
    let luma = PlaneLayout {
        stride: bytes_per_line,
        x_shift: 0,
        y_shift: 0,
        sample_bytes: 1,
    };
    match format {
        PixelFormat::Yuv420p => {
            let chroma = PlaneLayout {
                stride: bytes_per_line / 2,
                x_shift: 1,
                y_shift: 1,
                sample_bytes: 1,
            };
            Some(vec![luma, chroma, chroma])
        }
        PixelFormat::Nv12 => Some(vec![
            luma,
            PlaneLayout {
                stride: bytes_per_line,
                x_shift: 1,
                y_shift: 1,
                sample_bytes: 2,
            },
        ]),
        PixelFormat::Rgb565 | PixelFormat::Rgb32 => None,
    }
}

fn to_ffmpeg_pixel(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::Yuv420p => Pixel::YUV420P,
        PixelFormat::Rgb565 => Pixel::RGB565LE,
        PixelFormat::Rgb32 => Pixel::BGRA,
    }
}

/// Scaler cached for one conversion
struct CachedScaler {
    key: (Pixel, u32, u32, Pixel, u32, u32),
    context: ScalerContext,
}

fn scaler_for(
    cache: &mut Option<CachedScaler>,
    src: (Pixel, u32, u32),
    dst: (Pixel, u32, u32),
    device: DeviceKind,
) -> Result<&mut ScalerContext> {
    let key = (src.0, src.1, src.2, dst.0, dst.1, dst.2);
    if cache.as_ref().map(|c| c.key) != Some(key) {
        let context = ScalerContext::get(src.0, src.1, src.2, dst.0, dst.1, dst.2, ScalerFlags::BILINEAR)
            .map_err(|e| ffmpeg_error(device, "create scaler", e))?;
        log::debug!("Scaler initialized: {:?} -> {:?}", src, dst);
        *cache = Some(CachedScaler { key, context });
    }
    match cache.as_mut() {
        Some(cached) => Ok(&mut cached.context),
        None => Err(Error::Unknown("scaler cache empty".into())),
    }
}

/// FFmpeg decoder settings
#[derive(Debug, Clone)]
pub struct FfmpegDecoderOptions {
    /// Width of the decoded slots
    pub width: u32,

    /// Height of the decoded slots
    pub height: u32,

    /// Output slots reported as the decoder minimum
    pub min_buffers: usize,
}

impl Default for FfmpegDecoderOptions {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            min_buffers: 2,
        }
    }
}

#[derive(Default)]
struct CodecState {
    decoder: Option<ffmpeg::decoder::Video>,
    scaler: Option<CachedScaler>,

    inputs: Vec<BufferDescriptor>,
    input_queued: Vec<bool>,
    pending_units: VecDeque<(usize, usize)>,
    held_inputs: VecDeque<usize>,
    released_inputs: VecDeque<usize>,
    input_streaming: bool,
    header_consumed: bool,
    end_of_stream: bool,
    end_of_stream_sent: bool,

    ready: VecDeque<VideoFrameFFmpeg>,
    format: Option<DecodedFormat>,
    outputs: Vec<BufferDescriptor>,
    output_held: Vec<bool>,
    empty_outputs: VecDeque<usize>,
    decoded: VecDeque<DecodedBuffer>,
    output_streaming: bool,
    frames: u64,
}

// SAFETY: the codec and scaler contexts are only used with the device mutex held
unsafe impl Send for CodecState {}

const DECODER: DeviceKind = DeviceKind::Decoder;

impl CodecState {
    fn pump(&mut self) -> Result<()> {
        if !self.input_streaming {
            return Ok(());
        }

        while let Some((slot, bytes_used)) = self.pending_units.pop_front() {
            let decoder = self
                .decoder
                .as_mut()
                .ok_or_else(|| Error::device(DECODER, "decode", "codec not opened"))?;

            if bytes_used == 0 {
                decoder
                    .send_eof()
                    .map_err(|e| ffmpeg_error(DECODER, "flush", e))?;
                self.end_of_stream = true;
            } else {
                let packet = match self.inputs[slot].primary() {
                    Some(plane) => plane.with(|bytes| ffmpeg::Packet::copy(&bytes[..bytes_used])),
                    None => return Err(bad_index(DECODER, "decode", slot, self.inputs.len())),
                };
                decoder
                    .send_packet(&packet)
                    .map_err(|e| ffmpeg_error(DECODER, "send packet", e))?;
                self.header_consumed = true;
            }

            self.receive_frames()?;
            self.held_inputs.push_back(slot);
        }

        self.fill_outputs()?;

        while self.ready.len() < MAX_READY_FRAMES {
            match self.held_inputs.pop_front() {
                Some(slot) => self.released_inputs.push_back(slot),
                None => break,
            }
        }

        if self.end_of_stream
            && self.ready.is_empty()
            && self.output_streaming
            && !self.end_of_stream_sent
        {
            if let Some(index) = self.empty_outputs.pop_front() {
                self.decoded.push_back(DecodedBuffer {
                    index,
                    bytes_used: 0,
                });
                self.end_of_stream_sent = true;
                log::debug!("FFmpeg decoder drained after {} frames", self.frames);
            }
        }
        Ok(())
    }

    fn receive_frames(&mut self) -> Result<()> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(());
        };
        loop {
            let mut frame = VideoFrameFFmpeg::empty();
            match decoder.receive_frame(&mut frame) {
                Ok(()) => self.ready.push_back(frame),
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => break,
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => return Err(ffmpeg_error(DECODER, "receive frame", e)),
            }
        }
        Ok(())
    }

    fn fill_outputs(&mut self) -> Result<()> {
        while self.output_streaming && !self.ready.is_empty() && !self.empty_outputs.is_empty() {
            let (Some(frame), Some(index)) = (self.ready.pop_front(), self.empty_outputs.pop_front())
            else {
                break;
            };
            let bytes_used = self.write_frame(&frame, index)?;
            self.frames += 1;
            self.decoded.push_back(DecodedBuffer { index, bytes_used });
        }
        Ok(())
    }

    /// Copy a decoded frame into slot `index` as YUV420P
    fn write_frame(&mut self, frame: &VideoFrameFFmpeg, index: usize) -> Result<usize> {
        let (width, height, bytes_per_line) = match self.format.as_ref() {
            Some(format) => (format.width, format.height, format.bytes_per_line as usize),
            None => return Err(Error::device(DECODER, "decode", "output format not set")),
        };

        let converted;
        let frame = if frame.format() == Pixel::YUV420P
            && frame.width() == width
            && frame.height() == height
        {
            frame
        } else {
            let scaler = scaler_for(
                &mut self.scaler,
                (frame.format(), frame.width(), frame.height()),
                (Pixel::YUV420P, width, height),
                DECODER,
            )?;
            let mut out = VideoFrameFFmpeg::empty();
            scaler
                .run(frame, &mut out)
                .map_err(|e| ffmpeg_error(DECODER, "scale frame", e))?;
            converted = out;
            &converted
        };

        let target = self
            .outputs
            .get(index)
            .ok_or_else(|| bad_index(DECODER, "decode", index, self.outputs.len()))?;
        let layouts = plane_layouts(PixelFormat::Yuv420p, bytes_per_line).unwrap_or_default();
        for (plane_index, (plane, layout)) in target.planes.iter().zip(layouts).enumerate() {
            plane.with_mut(|dst| {
                copy_rows(
                    frame.data(plane_index),
                    frame.stride(plane_index),
                    dst,
                    layout.stride,
                    (width >> layout.x_shift) as usize,
                    (height >> layout.y_shift) as usize,
                )
            });
        }

        Ok(target.primary().map(|p| p.len()).unwrap_or(0))
    }
}

/// libavcodec decoder behind the decoder device contract
pub struct FfmpegDecoder {
    options: FfmpegDecoderOptions,
    state: Mutex<CodecState>,
    changed: Condvar,
}

impl FfmpegDecoder {
    /// Create a decoder producing `width` x `height` frames
    pub fn new(options: FfmpegDecoderOptions) -> Result<Self> {
        ffmpeg::init().map_err(|e| ffmpeg_error(DECODER, "init", e))?;
        Ok(Self {
            options,
            state: Mutex::new(CodecState::default()),
            changed: Condvar::new(),
        })
    }

    /// Frames written to output slots so far
    pub fn frames_decoded(&self) -> u64 {
        self.state.lock().frames
    }
}

impl DecoderDevice for FfmpegDecoder {
    fn setup_input(&self, codec: Codec, buffer_size: usize, buffer_count: usize) -> Result<InputLayout> {
        if buffer_size == 0 || buffer_count == 0 {
            return Err(Error::device(DECODER, "setup input", "empty stream buffer request"));
        }

        let found = ffmpeg::decoder::find(codec_id(codec)).ok_or_else(|| {
            Error::CodecNotSupported(format!("No decoder for codec: {}", codec))
        })?;
        log::info!("Using decoder: {} ({})", found.name(), found.description());

        let video = CodecContext::new_with_codec(found)
            .decoder()
            .video()
            .map_err(|e| ffmpeg_error(DECODER, "open codec", e))?;

        let mut state = self.state.lock();
        state.decoder = Some(video);
        state.inputs = (0..buffer_count)
            .map(|_| BufferDescriptor::allocate(&[buffer_size], buffer_size as u32))
            .collect();
        state.input_queued = vec![false; buffer_count];
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
            .ok_or_else(|| bad_index(DECODER, "query input buffer", slot, state.inputs.len()))
    }

    fn submit_input(&self, slot: usize, bytes_used: usize) -> Result<()> {
        let mut state = self.state.lock();
        let count = state.inputs.len();
        let capacity = match state.inputs.get(slot).and_then(|b| b.primary()) {
            Some(plane) => plane.len(),
            None => return Err(bad_index(DECODER, "submit input", slot, count)),
        };
        if state.input_queued[slot] || bytes_used > capacity {
            return Err(Error::device(
                DECODER,
                "submit input",
                format!("input buffer {} already queued or overfilled", slot),
            ));
        }

        state.input_queued[slot] = true;
        state.pending_units.push_back((slot, bytes_used));
        let result = state.pump();
        self.changed.notify_all();
        result
    }

    fn retrieve_input(&self, timeout: Duration) -> Result<usize> {
        wait_until(&self.state, &self.changed, timeout, DECODER, "retrieve input", |state| {
            if let Some(slot) = state.released_inputs.pop_front() {
                state.input_queued[slot] = false;
                return Ok(Some(slot));
            }
            if !state.input_streaming {
                return Err(Error::device(DECODER, "retrieve input", "input queue not streaming"));
            }
            Ok(None)
        })
    }

    fn setup_output(&self, extra_buffers: usize) -> Result<DecodedFormat> {
        let mut state = self.state.lock();
        if !state.header_consumed {
            return Err(Error::device(DECODER, "setup output", "stream header not parsed yet"));
        }

        let width = self.options.width.max(2) & !1;
        let height = self.options.height.max(2) & !1;
        let luma = width as usize * height as usize;
        let format = DecodedFormat {
            pixel_format: PixelFormat::Yuv420p,
            width,
            height,
            crop: CropRect {
                left: 0,
                top: 0,
                width,
                height,
            },
            plane_sizes: vec![luma, luma / 4, luma / 4],
            bytes_per_line: width,
            buffer_count: self.options.min_buffers + extra_buffers,
            min_buffers: self.options.min_buffers,
        };

        state.outputs = (0..format.buffer_count)
            .map(|_| BufferDescriptor::allocate(&format.plane_sizes, format.bytes_per_line))
            .collect();
        state.output_held = vec![false; format.buffer_count];
        state.format = Some(format.clone());
        Ok(format)
    }

    fn output_buffer(&self, index: usize) -> Result<BufferDescriptor> {
        let state = self.state.lock();
        state
            .outputs
            .get(index)
            .cloned()
            .ok_or_else(|| bad_index(DECODER, "query output buffer", index, state.outputs.len()))
    }

    fn submit_output_slot(&self, index: usize) -> Result<()> {
        let mut state = self.state.lock();
        let count = state.outputs.len();
        match state.output_held.get(index) {
            None => return Err(bad_index(DECODER, "submit output", index, count)),
            Some(true) => {
                return Err(Error::device(
                    DECODER,
                    "submit output",
                    format!("output buffer {} already queued", index),
                ))
            }
            Some(false) => {}
        }

        state.output_held[index] = true;
        state.empty_outputs.push_back(index);
        let result = state.pump();
        self.changed.notify_all();
        result
    }

    fn retrieve_output(&self, timeout: Duration) -> Result<DecodedBuffer> {
        wait_until(&self.state, &self.changed, timeout, DECODER, "retrieve output", |state| {
            if let Some(buffer) = state.decoded.pop_front() {
                state.output_held[buffer.index] = false;
                return Ok(Some(buffer));
            }
            if !state.output_streaming {
                return Err(Error::device(DECODER, "retrieve output", "output queue not streaming"));
            }
            Ok(None)
        })
    }

    fn set_streaming(&self, direction: Direction, on: bool) -> Result<()> {
        let mut state = self.state.lock();
        match (direction, on) {
            (Direction::Input, true) => {
                if !state.input_streaming && state.pending_units.is_empty() {
                    return Err(Error::device(DECODER, "stream on input", "no buffer queued"));
                }
                state.input_streaming = true;
            }
            (Direction::Output, true) => {
                if !state.output_streaming && state.empty_outputs.is_empty() {
                    return Err(Error::device(DECODER, "stream on output", "no buffer queued"));
                }
                state.output_streaming = true;
            }
            (Direction::Input, false) => state.input_streaming = false,
            (Direction::Output, false) => state.output_streaming = false,
        }
        let result = if on { state.pump() } else { Ok(()) };
        self.changed.notify_all();
        result
    }
}

const CONVERTER: DeviceKind = DeviceKind::PostProcessor;

#[derive(Default)]
struct ScaleState {
    scaler: Option<CachedScaler>,
    input_format: Option<DecodedFormat>,
    output: Option<(FramebufferGeometry, usize)>,
    crop: Option<CropRect>,
    queued_inputs: VecDeque<(usize, BufferDescriptor)>,
    queued_outputs: VecDeque<(usize, BufferDescriptor)>,
    released_inputs: VecDeque<usize>,
    released_outputs: VecDeque<usize>,
    input_streaming: bool,
    output_streaming: bool,
}

// SAFETY: the scaler context is only used with the device mutex held
unsafe impl Send for ScaleState {}

impl ScaleState {
    fn convert_queued(&mut self) -> Result<()> {
        while self.input_streaming
            && self.output_streaming
            && !self.queued_inputs.is_empty()
            && !self.queued_outputs.is_empty()
        {
            let (Some((src_index, src)), Some((dst_index, dst))) =
                (self.queued_inputs.pop_front(), self.queued_outputs.pop_front())
            else {
                break;
            };
            self.convert(&src, &dst)?;
            self.released_inputs.push_back(src_index);
            self.released_outputs.push_back(dst_index);
        }
        Ok(())
    }

    fn convert(&mut self, src: &BufferDescriptor, dst: &BufferDescriptor) -> Result<()> {
        let format = self
            .input_format
            .clone()
            .ok_or_else(|| Error::device(CONVERTER, "convert", "input format not set"))?;
        let (geometry, _) = self
            .output
            .ok_or_else(|| Error::device(CONVERTER, "convert", "output format not set"))?;
        let crop = self.crop.unwrap_or(format.crop);
        let layouts = plane_layouts(format.pixel_format, format.bytes_per_line as usize)
            .ok_or_else(|| {
                Error::device(
                    CONVERTER,
                    "convert",
                    format!("unsupported source format {:?}", format.pixel_format),
                )
            })?;

        let source_pixel = to_ffmpeg_pixel(format.pixel_format);
        let mut cropped = VideoFrameFFmpeg::new(source_pixel, crop.width, crop.height);
        for (index, (plane, layout)) in src.planes.iter().zip(layouts).enumerate() {
            let offset = (crop.top >> layout.y_shift) as usize * layout.stride
                + (crop.left >> layout.x_shift) as usize * layout.sample_bytes;
            let row_bytes = (crop.width >> layout.x_shift) as usize * layout.sample_bytes;
            let rows = (crop.height >> layout.y_shift) as usize;
            let stride = cropped.stride(index);
            plane.with(|bytes| {
                copy_rows(
                    bytes.get(offset..).unwrap_or(&[]),
                    layout.stride,
                    cropped.data_mut(index),
                    stride,
                    row_bytes,
                    rows,
                )
            });
        }

        let target_pixel = to_ffmpeg_pixel(geometry.pixel_format()?);
        let scaler = scaler_for(
            &mut self.scaler,
            (source_pixel, crop.width, crop.height),
            (target_pixel, geometry.width, geometry.height),
            CONVERTER,
        )?;
        let mut scaled = VideoFrameFFmpeg::empty();
        scaler
            .run(&cropped, &mut scaled)
            .map_err(|e| ffmpeg_error(CONVERTER, "scale frame", e))?;

        let row_bytes = (geometry.width * geometry.bits_per_pixel / 8) as usize;
        if let Some(plane) = dst.primary() {
            plane.with_mut(|bytes| {
                copy_rows(
                    scaled.data(0),
                    scaled.stride(0),
                    bytes,
                    geometry.stride as usize,
                    row_bytes,
                    geometry.height as usize,
                )
            });
        }
        Ok(())
    }
}

/// libswscale converter behind the post-processor contract
pub struct SwscalePostProcessor {
    state: Mutex<ScaleState>,
    changed: Condvar,
}

impl SwscalePostProcessor {
    /// Create a converter
    pub fn new() -> Result<Self> {
        ffmpeg::init().map_err(|e| ffmpeg_error(CONVERTER, "init", e))?;
        Ok(Self {
            state: Mutex::new(ScaleState::default()),
            changed: Condvar::new(),
        })
    }
}

impl PostProcessor for SwscalePostProcessor {
    fn setup_input(&self, format: &DecodedFormat) -> Result<()> {
        if plane_layouts(format.pixel_format, format.bytes_per_line as usize).is_none() {
            return Err(Error::device(
                CONVERTER,
                "setup input",
                format!("unsupported source format {:?}", format.pixel_format),
            ));
        }
        self.state.lock().input_format = Some(format.clone());
        Ok(())
    }

    fn setup_output(&self, geometry: &FramebufferGeometry, buffer_count: usize) -> Result<()> {
        geometry.pixel_format()?;
        self.state.lock().output = Some((*geometry, buffer_count));
        Ok(())
    }

    fn set_crop(&self, crop: CropRect) -> Result<()> {
        let mut state = self.state.lock();
        let fits = match state.input_format.as_ref() {
            Some(format) => crop.fits(format.width, format.height),
            None => return Err(Error::device(CONVERTER, "set crop", "input format not set")),
        };
        if !fits {
            return Err(Error::device(CONVERTER, "set crop", format!("{:?} outside frame", crop)));
        }
        state.crop = Some(crop);
        Ok(())
    }

    fn submit_input(&self, index: usize, source: &BufferDescriptor) -> Result<()> {
        let mut state = self.state.lock();
        let count = state.input_format.as_ref().map(|f| f.buffer_count).unwrap_or(0);
        if index >= count {
            return Err(bad_index(CONVERTER, "submit input", index, count));
        }
        state.queued_inputs.push_back((index, source.clone()));
        let result = state.convert_queued();
        self.changed.notify_all();
        result
    }

    fn submit_output(&self, index: usize, dest: &BufferDescriptor) -> Result<()> {
        let mut state = self.state.lock();
        let count = state.output.map(|(_, count)| count).unwrap_or(0);
        if index >= count {
            return Err(bad_index(CONVERTER, "submit output", index, count));
        }
        state.queued_outputs.push_back((index, dest.clone()));
        let result = state.convert_queued();
        self.changed.notify_all();
        result
    }

    fn retrieve_output(&self, timeout: Duration) -> Result<usize> {
        wait_until(&self.state, &self.changed, timeout, CONVERTER, "retrieve output", |state| {
            if let Some(index) = state.released_outputs.pop_front() {
                return Ok(Some(index));
            }
            if !state.output_streaming {
                return Err(Error::device(CONVERTER, "retrieve output", "output queue not streaming"));
            }
            Ok(None)
        })
    }

    fn retrieve_input(&self, timeout: Duration) -> Result<usize> {
        wait_until(&self.state, &self.changed, timeout, CONVERTER, "retrieve input", |state| {
            if let Some(index) = state.released_inputs.pop_front() {
                return Ok(Some(index));
            }
            if !state.input_streaming {
                return Err(Error::device(CONVERTER, "retrieve input", "input queue not streaming"));
            }
            Ok(None)
        })
    }

    fn set_streaming(&self, direction: Direction, on: bool) -> Result<()> {
        let mut state = self.state.lock();
        let queued = match direction {
            Direction::Input => state.queued_inputs.len(),
            Direction::Output => state.queued_outputs.len(),
        };
        let streaming = match direction {
            Direction::Input => &mut state.input_streaming,
            Direction::Output => &mut state.output_streaming,
        };
        if on && !*streaming && queued == 0 {
            return Err(Error::device(CONVERTER, "stream on", "no buffer queued"));
        }
        *streaming = on;

        let result = state.convert_queued();
        self.changed.notify_all();
        result
    }
}
