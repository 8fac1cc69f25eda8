//! vdec-pipeline core - concurrent hardware video decode pipeline
//!
//! This crate drives three memory-to-memory devices from one compressed
//! elementary stream:
//! - a bitstream parser that splits H.264 / MPEG-4 streams into access units
//! - a decoder device with a primed pool of decoded slots
//! - a post-processor that crops and converts frames into a framebuffer
//! - optional double buffering synchronised to vertical blank
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │       FFI Layer / vdec-play          │
//! │  (C exports, command line)           │
//! └─────────────────────────────────────┘
//!                  │
//!                  ▼
//! ┌─────────────────────────────────────┐
//! │        Pipeline Controller           │
//! │  (setup, priming, teardown)          │
//! └─────────────────────────────────────┘
//!                  │
//!                  ▼
//! ┌───────────┐ ┌───────────┐ ┌───────────────┐
//! │  Parser   │→│  Decode   │→│ Post-process  │
//! │  stage    │ │  stage    │ │ stage + vsync │
//! └───────────┘ └───────────┘ └───────────────┘
//!                  │   ▲ hand-off / done tokens
//!                  ▼   │
//! ┌─────────────────────────────────────┐
//! │           Device Module              │
//! │  (loopback, ffmpeg)                  │
//! └─────────────────────────────────────┘
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod ffi;
pub mod parser;
pub mod pipeline;
pub mod session;
pub mod stages;

// Re-export main types
pub use config::{Codec, PipelineConfig};
pub use device::{DecoderDevice, Devices, PostProcessor, Presenter};
pub use error::{Error, Result};
pub use pipeline::{Pipeline, PipelineReport};
pub use session::{play, play_file, Backend, DisplayOptions};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library (call once at startup)
pub fn init() {
    init_with_default_filter("info");
}

/// Initialize logging with a filter used when RUST_LOG is not set
pub fn init_with_default_filter(level: &str) {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level)
    ).try_init();

    log::info!("vdec-pipeline core {} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init() {
        init();
        init_with_default_filter("debug");
        // Should not panic
    }
}
