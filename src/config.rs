//! Pipeline configuration

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Size of one compressed stream buffer. Limits the largest access unit.
pub const STREAM_BUFFER_SIZE: usize = 128 * 1024;

/// Number of compressed stream buffers
pub const STREAM_BUFFER_COUNT: usize = 2;

/// Decoded buffers allocated on top of the decoder's minimum. This is how many
/// frames the post-processor can hold while the decoder keeps running.
pub const EXTRA_OUTPUT_BUFFERS: usize = 2;

/// Compressed stream codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// H.264 / AVC Annex-B elementary stream
    #[default]
    H264,
    /// MPEG-4 Part 2 elementary stream
    Mpeg4,
}

impl Codec {
    /// Short name
    pub fn name(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::Mpeg4 => "mpeg4",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Codec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(Codec::H264),
            "mpeg4" | "m4v" => Ok(Codec::Mpeg4),
            other => Err(Error::CodecNotSupported(other.to_string())),
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Codec of the input elementary stream
    pub codec: Codec,

    /// Bytes per compressed stream buffer
    pub stream_buffer_size: usize,

    /// Number of compressed stream buffers
    pub stream_buffer_count: usize,

    /// Decoded buffers requested above the decoder minimum
    pub extra_output_buffers: usize,

    /// Low-water mark override (None = decoder minimum)
    pub low_water_mark: Option<usize>,

    /// Swap framebuffers on vertical blank
    pub double_buffered: bool,

    /// Longest wait for a single hardware completion
    pub completion_timeout: Duration,

    /// How often blocked stages re-check the pipeline status
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            codec: Codec::H264,
            stream_buffer_size: STREAM_BUFFER_SIZE,
            stream_buffer_count: STREAM_BUFFER_COUNT,
            extra_output_buffers: EXTRA_OUTPUT_BUFFERS,
            low_water_mark: None,
            double_buffered: false,
            completion_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl PipelineConfig {
    /// Double buffered presentation synchronised to vertical blank
    pub fn vsync() -> Self {
        Self {
            double_buffered: true,
            ..Self::default()
        }
    }

    /// Smallest decoded pool and a short completion timeout
    pub fn low_latency() -> Self {
        Self {
            extra_output_buffers: 1,
            completion_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
            ..Self::default()
        }
    }

    /// Set the codec
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Check the configuration for values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.stream_buffer_size == 0 {
            return Err(Error::InvalidConfig("stream buffer size is zero".into()));
        }
        if self.stream_buffer_count == 0 {
            return Err(Error::InvalidConfig("stream buffer count is zero".into()));
        }
        if self.low_water_mark == Some(0) {
            return Err(Error::InvalidConfig("low-water mark must be at least 1".into()));
        }
        if self.completion_timeout.is_zero() {
            return Err(Error::InvalidConfig("completion timeout is zero".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll interval is zero".into()));
        }
        Ok(())
    }

    /// Low-water mark for a pool, given the decoder's minimum buffer count.
    /// Never below that minimum, since the decoder cannot produce a frame
    /// with fewer slots queued. Always within 1..=pool_size.
    pub fn effective_low_water(&self, decoder_minimum: usize, pool_size: usize) -> usize {
        self.low_water_mark
            .unwrap_or(decoder_minimum)
            .max(decoder_minimum)
            .clamp(1, pool_size.max(1))
    }
}
