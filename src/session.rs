//! Playback sessions
//!
//! Glue that builds input, parser and devices for a backend and runs one
//! pipeline over them.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::device::loopback::{
    LoopbackDecoder, LoopbackDecoderOptions, LoopbackPostProcessor, MemoryFramebuffer,
};
use crate::device::{Devices, FramebufferGeometry};
use crate::error::Result;
use crate::parser::{self, InputStream};
use crate::pipeline::{Pipeline, PipelineReport};

#[cfg(feature = "ffmpeg")]
use crate::device::ffmpeg::{FfmpegDecoder, FfmpegDecoderOptions, SwscalePostProcessor};

/// Framebuffer the session presents to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayOptions {
    /// Visible width
    pub width: u32,

    /// Visible height
    pub height: u32,

    /// 16 or 32
    pub bits_per_pixel: u32,

    /// Vertical blank period
    pub refresh: Duration,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            width: 800,
            height: 480,
            bits_per_pixel: 16,
            refresh: Duration::from_micros(16_667),
        }
    }
}

impl DisplayOptions {
    /// Geometry with one screen, or two stacked screens when double buffered
    pub fn geometry(&self, double_buffered: bool) -> FramebufferGeometry {
        let screens = if double_buffered { 2 } else { 1 };
        FramebufferGeometry::new(self.width, self.height, self.bits_per_pixel, screens)
    }
}

/// Device implementations a session runs on
#[derive(Debug, Clone)]
pub enum Backend {
    /// In-process emulation of the decoder and converter
    Loopback(LoopbackDecoderOptions),

    /// libavcodec decode and libswscale conversion
    #[cfg(feature = "ffmpeg")]
    Ffmpeg(FfmpegDecoderOptions),
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Loopback(LoopbackDecoderOptions::default())
    }
}

impl Backend {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Loopback(_) => "loopback",
            #[cfg(feature = "ffmpeg")]
            Backend::Ffmpeg(_) => "ffmpeg",
        }
    }

    /// Instantiate the devices, presenting to an in-memory framebuffer
    pub fn devices(&self, display: &DisplayOptions, double_buffered: bool) -> Result<Devices> {
        let framebuffer = Arc::new(MemoryFramebuffer::new(
            display.geometry(double_buffered),
            display.refresh,
        ));

        let devices = match self {
            Backend::Loopback(options) => Devices::new(
                Arc::new(LoopbackDecoder::new(options.clone())),
                Arc::new(LoopbackPostProcessor::new()),
                framebuffer,
            ),
            #[cfg(feature = "ffmpeg")]
            Backend::Ffmpeg(options) => Devices::new(
                Arc::new(FfmpegDecoder::new(options.clone())?),
                Arc::new(SwscalePostProcessor::new()?),
                framebuffer,
            ),
        };
        Ok(devices)
    }
}

/// Play an elementary stream file
pub fn play_file<P: AsRef<Path>>(
    path: P,
    config: PipelineConfig,
    backend: &Backend,
    display: &DisplayOptions,
) -> Result<PipelineReport> {
    let input = InputStream::open(path)?;
    play(input, config, backend, display)
}

/// Play an elementary stream already in memory
pub fn play(
    input: InputStream,
    config: PipelineConfig,
    backend: &Backend,
    display: &DisplayOptions,
) -> Result<PipelineReport> {
    config.validate()?;
    log::info!(
        "Playing {} bytes of {} on the {} backend",
        input.len(),
        config.codec,
        backend.name()
    );

    let devices = backend.devices(display, config.double_buffered)?;
    let parser = parser::for_codec(config.codec);
    Pipeline::new(config, devices, parser, input)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Codec;
    use crate::device::loopback::synthetic_stream;
    use crate::error::Error;
    use std::io::Write;

    fn fast_display() -> DisplayOptions {
        DisplayOptions {
            width: 64,
            height: 32,
            bits_per_pixel: 32,
            refresh: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_display_geometry() {
        let display = DisplayOptions::default();
        assert_eq!(display.geometry(false).screen_count(), 1);
        assert_eq!(display.geometry(true).virtual_height, 960);
    }

    #[test]
    fn test_play_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&synthetic_stream(Codec::H264, 10)).unwrap();

        let report = play_file(
            file.path(),
            PipelineConfig::default(),
            &Backend::default(),
            &fast_display(),
        )
        .unwrap();
        assert_eq!(report.frames_decoded, 10);
        assert_eq!(report.frames_converted, 10);
    }

    #[test]
    fn test_play_missing_file() {
        let result = play_file(
            "/nonexistent/clip.m4v",
            PipelineConfig::default().with_codec(Codec::Mpeg4),
            &Backend::default(),
            &fast_display(),
        );
        assert!(matches!(result, Err(Error::FileNotFound(_))));
    }
}
