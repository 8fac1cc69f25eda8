//! End-to-end pipeline scenarios on the loopback devices

use std::sync::Arc;
use std::time::{Duration, Instant};

use vdec_pipeline_core::device::loopback::{
    synthetic_stream, FaultInjector, FaultPoint, LoopbackDecoder, LoopbackDecoderOptions,
    LoopbackPostProcessor, MemoryFramebuffer,
};
use vdec_pipeline_core::device::FramebufferGeometry;
use vdec_pipeline_core::error::DeviceKind;
use vdec_pipeline_core::parser::{self, InputStream};
use vdec_pipeline_core::{Codec, Devices, Error, Pipeline, PipelineConfig};

const SCREEN_HEIGHT: u32 = 32;

struct Rig {
    decoder: Arc<LoopbackDecoder>,
    post_processor: Arc<LoopbackPostProcessor>,
    framebuffer: Arc<MemoryFramebuffer>,
    faults: Arc<FaultInjector>,
}

impl Rig {
    fn new(screens: u32) -> Self {
        Self::with_options(screens, LoopbackDecoderOptions::default())
    }

    fn with_options(screens: u32, options: LoopbackDecoderOptions) -> Self {
        let faults = FaultInjector::new();
        Self {
            decoder: Arc::new(LoopbackDecoder::with_faults(options, faults.clone())),
            post_processor: Arc::new(LoopbackPostProcessor::with_faults(faults.clone())),
            framebuffer: Arc::new(MemoryFramebuffer::with_faults(
                FramebufferGeometry::new(64, SCREEN_HEIGHT, 32, screens),
                Duration::from_millis(2),
                faults.clone(),
            )),
            faults,
        }
    }

    fn devices(&self) -> Devices {
        Devices::new(
            self.decoder.clone(),
            self.post_processor.clone(),
            self.framebuffer.clone(),
        )
    }

    fn run(&self, config: PipelineConfig, data: Vec<u8>) -> vdec_pipeline_core::Result<vdec_pipeline_core::PipelineReport> {
        let parser = parser::for_codec(config.codec);
        Pipeline::new(config, self.devices(), parser, InputStream::from_bytes(data))?.run()
    }
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        completion_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
        ..PipelineConfig::default()
    }
}

#[test]
fn test_single_buffered_run() {
    let rig = Rig::new(1);
    let report = rig.run(fast_config(), synthetic_stream(Codec::H264, 20)).unwrap();

    assert_eq!(report.units_submitted, 20);
    assert_eq!(report.frames_decoded, 20);
    assert_eq!(report.frames_converted, 20);
    assert_eq!(report.display_swaps, 0);
    assert_eq!(report.pool_size, 4);
    assert_eq!(report.low_water_mark, 2);

    // frames reach the screen in decode order
    let converted = rig.post_processor.stats().converted_tags;
    assert_eq!(converted, (0..20).collect::<Vec<u64>>());
    assert_eq!(rig.framebuffer.screen_tag(0), Some(19));
    assert!(rig.decoder.stats().end_of_stream_sent);

    // streaming is switched on once per converter queue
    assert_eq!(rig.post_processor.stats().stream_on_calls, 2);

    // teardown pans back to the first screen
    assert_eq!(rig.framebuffer.stats().pans, vec![0]);
}

#[test]
fn test_double_buffered_run() {
    let rig = Rig::new(2);
    let config = PipelineConfig {
        double_buffered: true,
        ..fast_config()
    };
    let report = rig.run(config, synthetic_stream(Codec::H264, 6)).unwrap();

    assert_eq!(report.frames_converted, 6);
    assert_eq!(report.display_swaps, 6);

    let stats = rig.framebuffer.stats();
    let h = SCREEN_HEIGHT;
    assert_eq!(stats.pans, vec![h, 0, h, 0, h, 0, 0]);
    assert_eq!(&stats.presented_tags[..6], &[0, 1, 2, 3, 4, 5]);
    assert_eq!(stats.vertical_blanks, 6);
    assert_eq!(stats.y_offset, 0);
}

#[test]
fn test_low_water_below_decoder_minimum_is_raised() {
    let rig = Rig::with_options(
        1,
        LoopbackDecoderOptions {
            min_buffers: 3,
            ..LoopbackDecoderOptions::default()
        },
    );
    let config = PipelineConfig {
        low_water_mark: Some(1),
        extra_output_buffers: 1,
        ..fast_config()
    };
    let report = rig.run(config, synthetic_stream(Codec::H264, 25)).unwrap();

    assert_eq!(report.pool_size, 4);
    assert_eq!(report.low_water_mark, 3);
    assert_eq!(report.frames_converted, 25);
}

#[test]
fn test_pool_recycled_at_low_water() {
    let rig = Rig::new(1);
    let config = PipelineConfig {
        low_water_mark: Some(2),
        extra_output_buffers: 2,
        ..fast_config()
    };
    let report = rig.run(config, synthetic_stream(Codec::H264, 40)).unwrap();

    assert_eq!(report.pool_size, 4);
    assert_eq!(report.low_water_mark, 2);
    assert_eq!(report.frames_converted, 40);

    // 40 frames and the end-of-stream buffer cycled through 4 slots
    let stats = rig.decoder.stats();
    assert!(stats.output_submissions >= 41);
    assert!(stats.max_held_outputs <= report.pool_size);
}

#[test]
fn test_mpeg4_run() {
    let rig = Rig::new(1);
    let config = fast_config().with_codec(Codec::Mpeg4);
    let report = rig.run(config, synthetic_stream(Codec::Mpeg4, 9)).unwrap();

    assert_eq!(report.frames_decoded, 9);
    assert_eq!(rig.framebuffer.screen_tag(0), Some(8));
}

#[test]
fn test_post_processor_fault_stops_pipeline() {
    let rig = Rig::new(1);
    rig.faults.arm(FaultPoint::PostProcessSubmitInput, 5);

    let started = Instant::now();
    let err = rig.run(fast_config(), synthetic_stream(Codec::H264, 50)).unwrap_err();

    assert_eq!(err.device_kind(), Some(DeviceKind::PostProcessor));
    assert!(!err.is_timeout());
    assert_eq!(rig.faults.triggered(), 1);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(rig.post_processor.stats().frames_converted, 5);
}

#[test]
fn test_decoder_fault_stops_pipeline() {
    let rig = Rig::new(1);
    rig.faults.arm(FaultPoint::DecoderRetrieveOutput, 3);

    let err = rig.run(fast_config(), synthetic_stream(Codec::H264, 30)).unwrap_err();

    assert!(matches!(err, Error::Device { device: DeviceKind::Decoder, .. }));
    assert!(rig.post_processor.stats().frames_converted <= 3);
}

#[test]
fn test_vblank_fault_stops_pipeline() {
    let rig = Rig::new(2);
    rig.faults.arm(FaultPoint::PresenterVerticalBlank, 2);
    let config = PipelineConfig {
        double_buffered: true,
        ..fast_config()
    };

    let err = rig.run(config, synthetic_stream(Codec::H264, 10)).unwrap_err();
    assert_eq!(err.device_kind(), Some(DeviceKind::Presenter));
}

#[test]
fn test_empty_input() {
    let rig = Rig::new(1);
    let err = rig.run(fast_config(), Vec::new()).unwrap_err();
    assert!(matches!(err, Error::Parse(_)));
}

#[test]
fn test_header_only_input() {
    let rig = Rig::new(1);
    let report = rig.run(fast_config(), synthetic_stream(Codec::H264, 0)).unwrap();
    assert_eq!(report.frames_decoded, 0);
    assert_eq!(report.frames_converted, 0);
}

#[test]
fn test_double_buffering_needs_two_screens() {
    let rig = Rig::new(1);
    let config = PipelineConfig {
        double_buffered: true,
        ..fast_config()
    };
    let err = rig.run(config, synthetic_stream(Codec::H264, 3)).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[test]
fn test_invalid_config_rejected_before_setup() {
    let rig = Rig::new(1);
    let config = PipelineConfig {
        low_water_mark: Some(0),
        ..fast_config()
    };
    let err = rig.run(config, synthetic_stream(Codec::H264, 3)).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
    assert_eq!(rig.decoder.stats().units_received, 0);
}
