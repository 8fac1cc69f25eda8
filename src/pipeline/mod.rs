//! Pipeline controller
//!
//! Sets the devices up, primes every decoded slot on the decoder, runs the
//! parser, decode and post-process stages on three named threads and tears the
//! devices down once all of them have exited.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::device::{BufferDescriptor, DecodedFormat, Devices, Direction, InputLayout};
use crate::error::{Error, Result};
use crate::parser::{BitstreamParser, Extracted, InputStream};
use crate::stages::{DecodeStage, ParserStage, PostProcessStage, StageGuard};

mod buffers;
mod handoff;
mod present;
mod status;

pub use buffers::{BufferStateTable, SlotState};
pub use handoff::HandoffChannel;
pub use present::PresentationSync;
pub use status::PipelineStatus;

/// Running counters, updated by the stages
#[derive(Debug, Default)]
pub struct PipelineStats {
    units_submitted: AtomicU64,
    frames_decoded: AtomicU64,
    frames_converted: AtomicU64,
    display_swaps: AtomicU64,
}

impl PipelineStats {
    pub(crate) fn record_unit(&self) {
        self.units_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_converted(&self) {
        self.frames_converted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_swap(&self) {
        self.display_swaps.fetch_add(1, Ordering::Relaxed);
    }

    /// Access units submitted to the decoder, the header excluded
    pub fn units_submitted(&self) -> u64 {
        self.units_submitted.load(Ordering::Relaxed)
    }

    /// Frames handed to post-processing
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded.load(Ordering::Relaxed)
    }

    /// Frames written to the framebuffer
    pub fn frames_converted(&self) -> u64 {
        self.frames_converted.load(Ordering::Relaxed)
    }

    /// Vsync-paced display swaps
    pub fn display_swaps(&self) -> u64 {
        self.display_swaps.load(Ordering::Relaxed)
    }
}

/// Outcome of a completed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    /// Access units submitted to the decoder
    pub units_submitted: u64,

    /// Frames decoded
    pub frames_decoded: u64,

    /// Frames converted into the framebuffer
    pub frames_converted: u64,

    /// Display swaps
    pub display_swaps: u64,

    /// Decoded slots in the pool
    pub pool_size: usize,

    /// Low-water mark the decode stage ran with
    pub low_water_mark: usize,

    /// Wall time from setup to teardown
    pub elapsed: Duration,
}

/// State shared by the stage threads
pub(crate) struct Shared {
    pub status: PipelineStatus,
    pub table: BufferStateTable,
    pub handoff: HandoffChannel,
    pub stats: PipelineStats,
    pub parsing_finished: AtomicBool,
}

impl Shared {
    pub(crate) fn new(pool_size: usize) -> Self {
        Self {
            status: PipelineStatus::new(),
            table: BufferStateTable::new(pool_size),
            handoff: HandoffChannel::new(pool_size),
            stats: PipelineStats::default(),
            parsing_finished: AtomicBool::new(false),
        }
    }
}

/// Everything set up before the stage threads start
struct Prepared {
    inputs: Vec<BufferDescriptor>,
    format: DecodedFormat,
    sources: Vec<BufferDescriptor>,
    screens: Vec<BufferDescriptor>,
    presentation: PresentationSync,
    low_water: usize,
}

/// A decode pipeline over one input stream
pub struct Pipeline {
    config: PipelineConfig,
    devices: Devices,
    parser: Box<dyn BitstreamParser>,
    input: InputStream,
}

impl Pipeline {
    /// Create a pipeline. Nothing touches the devices until [`Pipeline::run`].
    pub fn new(
        config: PipelineConfig,
        devices: Devices,
        parser: Box<dyn BitstreamParser>,
        input: InputStream,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            devices,
            parser,
            input,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Play the whole stream. Returns after end of stream or the first
    /// fatal error, with every device stopped.
    pub fn run(self) -> Result<PipelineReport> {
        self.run_monitored(None)
    }

    /// Run with `monitor` sampling the shared state from the controller
    /// thread while the stages work
    pub(crate) fn run_monitored(
        self,
        monitor: Option<&(dyn Fn(&Shared) + Sync)>,
    ) -> Result<PipelineReport> {
        let started = Instant::now();
        let Pipeline {
            config,
            devices,
            mut parser,
            mut input,
        } = self;

        log::info!(
            "Starting {} pipeline ({} bytes of input)",
            config.codec,
            input.len()
        );

        let prepared = match prepare(&config, &devices, parser.as_mut(), &mut input) {
            Ok(prepared) => prepared,
            Err(e) => {
                log::error!("Pipeline setup failed: {}", e);
                teardown(&devices);
                return Err(e);
            }
        };

        let shared = Shared::new(prepared.format.buffer_count);
        if let Err(e) = prime(&devices, &shared) {
            log::error!("Priming decoder failed: {}", e);
            teardown(&devices);
            return Err(e);
        }

        let Prepared {
            inputs,
            format,
            sources,
            screens,
            presentation,
            low_water,
        } = prepared;
        log::info!(
            "Setup complete: {}x{} {:?}, pool of {} slots, low-water mark {}",
            format.width,
            format.height,
            format.pixel_format,
            format.buffer_count,
            low_water
        );

        let parser_stage = ParserStage::new(
            &config,
            &shared,
            devices.decoder.clone(),
            parser,
            input,
            inputs,
        );
        let decode_stage = DecodeStage::new(&config, &shared, devices.decoder.clone(), low_water);
        let postprocess_stage = PostProcessStage::new(
            &config,
            &shared,
            devices.post_processor.clone(),
            sources,
            screens,
            presentation,
        );

        let status = &shared.status;
        let scope_result = crossbeam::thread::scope(|scope| {
            spawn_stage(scope, "parser", status, move || parser_stage.run());
            spawn_stage(scope, "decode", status, move || decode_stage.run());
            spawn_stage(scope, "postprocess", status, move || postprocess_stage.run());
            log::info!("Pipeline threads launched");

            if let Some(monitor) = monitor {
                // frames still queued at end of stream are drained, not abandoned
                while !status.is_stopped() || (!status.has_error() && shared.handoff.pending() > 0) {
                    monitor(&shared);
                    std::thread::sleep(Duration::from_micros(50));
                }
                monitor(&shared);
            }
        });
        if scope_result.is_err() {
            shared
                .status
                .fail("controller", Error::Unknown("stage thread panicked".into()));
        }

        teardown(&devices);

        let report = PipelineReport {
            units_submitted: shared.stats.units_submitted(),
            frames_decoded: shared.stats.frames_decoded(),
            frames_converted: shared.stats.frames_converted(),
            display_swaps: shared.stats.display_swaps(),
            pool_size: shared.table.len(),
            low_water_mark: low_water,
            elapsed: started.elapsed(),
        };

        if let Some(e) = shared.status.take_error() {
            return Err(e);
        }
        if !shared.status.is_finished() {
            return Err(Error::Protocol(
                "stages exited before end of stream".into(),
            ));
        }

        log::info!(
            "Pipeline finished: {} frames decoded, {} converted, {} swaps in {:?}",
            report.frames_decoded,
            report.frames_converted,
            report.display_swaps,
            report.elapsed
        );
        Ok(report)
    }
}

/// Run a stage on its own named thread, recording its failure in `status`
fn spawn_stage<'env>(
    scope: &crossbeam::thread::Scope<'env>,
    name: &'static str,
    status: &'env PipelineStatus,
    run: impl FnOnce() -> Result<()> + Send + 'env,
) {
    let spawned = scope
        .builder()
        .name(format!("vdec-{}", name))
        .spawn(move |_| {
            let guard = StageGuard::new(name, status);
            guard.finish(run());
        });

    if let Err(e) = spawned {
        status.fail(name, Error::Io(e));
    }
}

/// Configure every device, in the order the drivers require
fn prepare(
    config: &PipelineConfig,
    devices: &Devices,
    parser: &mut dyn BitstreamParser,
    input: &mut InputStream,
) -> Result<Prepared> {
    let decoder = &devices.decoder;
    let post_processor = &devices.post_processor;

    let presentation = PresentationSync::new(
        devices.presenter.clone(),
        config.double_buffered,
        config.completion_timeout,
    )?;
    let geometry = devices.presenter.geometry();

    let layout: InputLayout =
        decoder.setup_input(config.codec, config.stream_buffer_size, config.stream_buffer_count)?;
    let inputs = (0..layout.buffer_count)
        .map(|slot| decoder.input_buffer(slot))
        .collect::<Result<Vec<_>>>()?;

    let header_slot = 0;
    let plane = inputs
        .get(header_slot)
        .and_then(|buffer| buffer.primary())
        .ok_or_else(|| Error::Protocol("decoder granted no input buffers".into()))?;
    let remaining = input.remaining();
    match plane.with_mut(|dest| parser.extract_header(remaining, dest))? {
        Extracted::Unit { consumed, size } => {
            input.advance(consumed);
            decoder.submit_input(header_slot, size)?;
            log::debug!("Stream header: {} bytes", size);
        }
        Extracted::EndOfStream => {
            return Err(Error::Parse("no stream header found in input".into()));
        }
    }
    decoder.set_streaming(Direction::Input, true)?;

    let format = decoder.setup_output(config.extra_output_buffers)?;
    if format.buffer_count == 0 {
        return Err(Error::Protocol("decoder granted no output buffers".into()));
    }

    let reclaimed = decoder.retrieve_input(config.completion_timeout)?;
    if reclaimed != header_slot {
        return Err(Error::Protocol(format!(
            "decoder returned input slot {} for the header",
            reclaimed
        )));
    }

    post_processor.setup_input(&format)?;
    post_processor.setup_output(&geometry, presentation.screen_count())?;
    post_processor.set_crop(format.crop)?;

    let sources = (0..format.buffer_count)
        .map(|index| decoder.output_buffer(index))
        .collect::<Result<Vec<_>>>()?;
    let screens = (0..presentation.screen_count())
        .map(|index| devices.presenter.buffer(index))
        .collect::<Result<Vec<_>>>()?;

    let low_water = config.effective_low_water(format.min_buffers, format.buffer_count);

    Ok(Prepared {
        inputs,
        format,
        sources,
        screens,
        presentation,
        low_water,
    })
}

/// Queue every decoded slot on the decoder and start its output queue
fn prime(devices: &Devices, shared: &Shared) -> Result<()> {
    for index in 0..shared.table.len() {
        devices.decoder.submit_output_slot(index)?;
        shared.table.mark(index, SlotState::OwnedByDecoder)?;
    }
    devices.decoder.set_streaming(Direction::Output, true)
}

/// Stop the devices top-down: decoder, post-processor, presenter
fn teardown(devices: &Devices) {
    for direction in [Direction::Input, Direction::Output] {
        if let Err(e) = devices.decoder.set_streaming(direction, false) {
            log::warn!("Stopping decoder {} queue failed: {}", direction.name(), e);
        }
    }
    for direction in [Direction::Input, Direction::Output] {
        if let Err(e) = devices.post_processor.set_streaming(direction, false) {
            log::warn!("Stopping post-processor {} queue failed: {}", direction.name(), e);
        }
    }
    if let Err(e) = devices.presenter.pan_to_buffer(0) {
        log::warn!("Resetting display offset failed: {}", e);
    }
    log::debug!("Devices stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Codec;
    use crate::device::loopback::{
        synthetic_stream, LoopbackDecoder, LoopbackDecoderOptions, LoopbackPostProcessor,
        MemoryFramebuffer,
    };
    use crate::device::FramebufferGeometry;
    use crate::parser;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_stats_counters() {
        let stats = PipelineStats::default();
        stats.record_unit();
        stats.record_unit();
        stats.record_decoded();
        stats.record_converted();
        stats.record_swap();

        assert_eq!(stats.units_submitted(), 2);
        assert_eq!(stats.frames_decoded(), 1);
        assert_eq!(stats.frames_converted(), 1);
        assert_eq!(stats.display_swaps(), 1);
    }

    #[test]
    fn test_slot_accounting_holds_while_running() {
        let devices = Devices::new(
            Arc::new(LoopbackDecoder::new(LoopbackDecoderOptions::default())),
            Arc::new(LoopbackPostProcessor::new()),
            Arc::new(MemoryFramebuffer::new(
                FramebufferGeometry::new(64, 32, 32, 2),
                Duration::from_millis(1),
            )),
        );
        let config = PipelineConfig {
            double_buffered: true,
            completion_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            ..PipelineConfig::default()
        };
        let input = InputStream::from_bytes(synthetic_stream(Codec::H264, 30));
        let pipeline = Pipeline::new(config, devices, parser::for_codec(Codec::H264), input).unwrap();

        // (pool size, slots in any state, slots owned by postprocess, hand-off length)
        let samples = Mutex::new(Vec::new());
        let monitor: &(dyn Fn(&Shared) + Sync) = &|shared: &Shared| {
            let sample = shared.table.inspect(|slots| {
                let count = |state: SlotState| slots.iter().filter(|s| **s == state).count();
                (
                    slots.len(),
                    count(SlotState::Free)
                        + count(SlotState::OwnedByDecoder)
                        + count(SlotState::OwnedByPostprocess),
                    count(SlotState::OwnedByPostprocess),
                    shared.handoff.pending(),
                )
            });
            samples.lock().push(sample);
        };

        let report = pipeline.run_monitored(Some(monitor)).unwrap();
        assert_eq!(report.frames_converted, 30);

        let samples = samples.lock();
        assert!(samples.len() > 1);
        for &(pool, total, owned, pending) in samples.iter() {
            assert_eq!(pool, report.pool_size);
            assert_eq!(total, pool);
            assert!(pending <= owned);
        }
    }

    #[test]
    fn test_shared_starts_idle() {
        let shared = Shared::new(3);
        assert_eq!(shared.table.count(SlotState::Free), 3);
        assert_eq!(shared.handoff.pending(), 0);
        assert!(!shared.status.is_stopped());
        assert!(!shared.parsing_finished.load(Ordering::Acquire));
    }
}
