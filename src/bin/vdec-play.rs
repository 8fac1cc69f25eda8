//! vdec-play: decode an elementary stream through the pipeline and present it

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use vdec_pipeline_core::device::loopback::LoopbackDecoderOptions;
use vdec_pipeline_core::{play_file, Backend, Codec, DisplayOptions, PipelineConfig};

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CodecArg {
    H264,
    Mpeg4,
}

impl From<CodecArg> for Codec {
    fn from(arg: CodecArg) -> Self {
        match arg {
            CodecArg::H264 => Codec::H264,
            CodecArg::Mpeg4 => Codec::Mpeg4,
        }
    }
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum BackendArg {
    Loopback,
    #[cfg(feature = "ffmpeg")]
    Ffmpeg,
}

#[derive(Parser, Debug)]
#[command(name = "vdec-play", version)]
#[command(about = "Decode, convert and present a compressed video elementary stream")]
struct Args {
    /// Codec of the input stream
    #[arg(short, long, value_enum, default_value = "h264")]
    codec: CodecArg,

    /// Elementary stream file
    #[arg(short, long)]
    input: PathBuf,

    /// Double buffer the framebuffer and swap on vertical blank
    #[arg(short = 'V', long)]
    vsync: bool,

    /// Device backend
    #[arg(long, value_enum, default_value = "loopback")]
    backend: BackendArg,

    /// Decoded frame width
    #[arg(long, default_value = "320")]
    decoded_width: u32,

    /// Decoded frame height
    #[arg(long, default_value = "240")]
    decoded_height: u32,

    /// Framebuffer width
    #[arg(long, default_value = "800")]
    display_width: u32,

    /// Framebuffer height
    #[arg(long, default_value = "480")]
    display_height: u32,

    /// Framebuffer depth (16 or 32)
    #[arg(long, default_value = "16")]
    bpp: u32,

    /// Vertical blank period in microseconds
    #[arg(long, default_value = "16667")]
    refresh_us: u64,

    /// Decoded slots the decode stage keeps queued (default: decoder minimum)
    #[arg(long)]
    low_water: Option<usize>,

    /// Decoded buffers above the decoder minimum
    #[arg(long, default_value = "2")]
    extra_buffers: usize,

    /// Hardware completion timeout in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> PipelineConfig {
        let base = if self.vsync {
            PipelineConfig::vsync()
        } else {
            PipelineConfig::default()
        };
        PipelineConfig {
            extra_output_buffers: self.extra_buffers,
            low_water_mark: self.low_water,
            completion_timeout: Duration::from_millis(self.timeout_ms),
            ..base.with_codec(self.codec.into())
        }
    }

    fn display(&self) -> DisplayOptions {
        DisplayOptions {
            width: self.display_width,
            height: self.display_height,
            bits_per_pixel: self.bpp,
            refresh: Duration::from_micros(self.refresh_us),
        }
    }

    fn backend(&self) -> Backend {
        match self.backend {
            BackendArg::Loopback => Backend::Loopback(LoopbackDecoderOptions {
                width: self.decoded_width,
                height: self.decoded_height,
                ..LoopbackDecoderOptions::default()
            }),
            #[cfg(feature = "ffmpeg")]
            BackendArg::Ffmpeg => {
                Backend::Ffmpeg(vdec_pipeline_core::device::ffmpeg::FfmpegDecoderOptions {
                    width: self.decoded_width,
                    height: self.decoded_height,
                    ..Default::default()
                })
            }
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    vdec_pipeline_core::init_with_default_filter(&args.log_level);

    match play_file(&args.input, args.config(), &args.backend(), &args.display()) {
        Ok(report) => {
            log::info!(
                "{} units, {} frames decoded, {} converted, {} swaps (pool {}, low-water {}) in {:?}",
                report.units_submitted,
                report.frames_decoded,
                report.frames_converted,
                report.display_swaps,
                report.pool_size,
                report.low_water_mark,
                report.elapsed
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{}: {}", args.input.display(), e);
            ExitCode::FAILURE
        }
    }
}
