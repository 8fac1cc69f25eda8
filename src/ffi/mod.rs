//! FFI exports for C interop
//!
//! All functions in this module are exported with `#[no_mangle]`
//! and use C-compatible types. A pipeline is created from a file path and a
//! [`VdpConfig`], run once to completion and then destroyed.

use std::ffi::{c_char, CStr, CString};
use std::ptr;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{Codec, PipelineConfig, EXTRA_OUTPUT_BUFFERS};
use crate::device::loopback::LoopbackDecoderOptions;
use crate::error::Error;
use crate::parser::{self, InputStream};
use crate::pipeline::{Pipeline, PipelineReport};
use crate::session::{Backend, DisplayOptions};

// Thread-local error storage
thread_local! {
    static LAST_ERROR: std::cell::RefCell<Option<CString>> = std::cell::RefCell::new(None);
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

// =============================================================================
// Result Type
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VdpResult {
    Success = 0,
    ErrorFileNotFound = 1,
    ErrorInvalidConfig = 2,
    ErrorCodecNotSupported = 3,
    ErrorDevice = 4,
    ErrorTimeout = 5,
    ErrorProtocol = 6,
    ErrorParse = 7,
    ErrorInvalidHandle = 8,
    ErrorAlreadyRun = 9,
    ErrorUnknown = 99,
}

impl From<Error> for VdpResult {
    fn from(e: Error) -> Self {
        set_last_error(&e.to_string());
        match e.to_ffi_code() {
            1 => VdpResult::ErrorFileNotFound,
            2 => VdpResult::ErrorInvalidConfig,
            3 => VdpResult::ErrorCodecNotSupported,
            4 => VdpResult::ErrorDevice,
            5 => VdpResult::ErrorTimeout,
            6 => VdpResult::ErrorProtocol,
            7 => VdpResult::ErrorParse,
            _ => VdpResult::ErrorUnknown,
        }
    }
}

impl<T> From<Result<T, Error>> for VdpResult {
    fn from(r: Result<T, Error>) -> Self {
        match r {
            Ok(_) => VdpResult::Success,
            Err(e) => e.into(),
        }
    }
}

// =============================================================================
// Opaque Handle
// =============================================================================

/// Opaque pipeline handle
pub struct VdpPipelineHandle {
    pipeline: Mutex<Option<Pipeline>>,
}

// =============================================================================
// Error Handling
// =============================================================================

/// Get last error message
#[no_mangle]
pub extern "C" fn vdp_get_last_error() -> *const c_char {
    LAST_ERROR.with(|e| e.borrow().as_ref().map(|s| s.as_ptr()).unwrap_or(ptr::null()))
}

/// Clear last error
#[no_mangle]
pub extern "C" fn vdp_clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Initialize the library (sets up logging).
/// Call once at application startup.
#[no_mangle]
pub extern "C" fn vdp_init() {
    crate::init();
}

// =============================================================================
// Configuration Types (FFI)
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VdpConfig {
    pub codec: u8, // 0=H.264, 1=MPEG-4
    pub backend: u8, // 0=loopback, 1=ffmpeg
    pub double_buffered: bool,
    pub extra_output_buffers: u32,
    pub low_water_mark: u32, // 0 = decoder minimum
    pub completion_timeout_ms: u32,
    pub decoded_width: u32,
    pub decoded_height: u32,
    pub display_width: u32,
    pub display_height: u32,
    pub bits_per_pixel: u32,
    pub refresh_us: u32,
}

impl From<&VdpConfig> for PipelineConfig {
    fn from(c: &VdpConfig) -> Self {
        PipelineConfig {
            codec: match c.codec {
                1 => Codec::Mpeg4,
                _ => Codec::H264,
            },
            extra_output_buffers: c.extra_output_buffers as usize,
            low_water_mark: match c.low_water_mark {
                0 => None,
                n => Some(n as usize),
            },
            double_buffered: c.double_buffered,
            completion_timeout: Duration::from_millis(c.completion_timeout_ms as u64),
            ..PipelineConfig::default()
        }
    }
}

impl From<&VdpConfig> for DisplayOptions {
    fn from(c: &VdpConfig) -> Self {
        DisplayOptions {
            width: c.display_width,
            height: c.display_height,
            bits_per_pixel: c.bits_per_pixel,
            refresh: Duration::from_micros(c.refresh_us as u64),
        }
    }
}

fn backend_for(c: &VdpConfig) -> Result<Backend, Error> {
    match c.backend {
        0 => Ok(Backend::Loopback(LoopbackDecoderOptions {
            width: c.decoded_width,
            height: c.decoded_height,
            ..LoopbackDecoderOptions::default()
        })),
        #[cfg(feature = "ffmpeg")]
        1 => Ok(Backend::Ffmpeg(crate::device::ffmpeg::FfmpegDecoderOptions {
            width: c.decoded_width,
            height: c.decoded_height,
            ..Default::default()
        })),
        other => Err(Error::InvalidConfig(format!("backend {} not available", other))),
    }
}

/// Default configuration
#[no_mangle]
pub extern "C" fn vdp_config_default() -> VdpConfig {
    let config = PipelineConfig::default();
    let display = DisplayOptions::default();
    let decoder = LoopbackDecoderOptions::default();
    VdpConfig {
        codec: 0,
        backend: 0,
        double_buffered: config.double_buffered,
        extra_output_buffers: EXTRA_OUTPUT_BUFFERS as u32,
        low_water_mark: 0,
        completion_timeout_ms: config.completion_timeout.as_millis() as u32,
        decoded_width: decoder.width,
        decoded_height: decoder.height,
        display_width: display.width,
        display_height: display.height,
        bits_per_pixel: display.bits_per_pixel,
        refresh_us: display.refresh.as_micros() as u32,
    }
}

// =============================================================================
// Pipeline Lifecycle
// =============================================================================

fn create_pipeline(path: &str, c: &VdpConfig) -> Result<Pipeline, Error> {
    let config = PipelineConfig::from(c);
    let display = DisplayOptions::from(c);
    let backend = backend_for(c)?;

    let input = InputStream::open(path)?;
    let devices = backend.devices(&display, config.double_buffered)?;
    let parser = parser::for_codec(config.codec);
    Pipeline::new(config, devices, parser, input)
}

/// Create a pipeline for an elementary stream file
#[no_mangle]
pub extern "C" fn vdp_pipeline_create(
    path: *const c_char,
    config: *const VdpConfig,
) -> *mut VdpPipelineHandle {
    if path.is_null() {
        set_last_error("Path is null");
        return ptr::null_mut();
    }

    let path_str = unsafe {
        match CStr::from_ptr(path).to_str() {
            Ok(s) => s,
            Err(_) => {
                set_last_error("Invalid UTF-8 in path");
                return ptr::null_mut();
            }
        }
    };

    let config = if config.is_null() {
        vdp_config_default()
    } else {
        unsafe { *config }
    };

    match create_pipeline(path_str, &config) {
        Ok(pipeline) => Box::into_raw(Box::new(VdpPipelineHandle {
            pipeline: Mutex::new(Some(pipeline)),
        })),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VdpReport {
    pub units_submitted: u64,
    pub frames_decoded: u64,
    pub frames_converted: u64,
    pub display_swaps: u64,
    pub pool_size: u32,
    pub low_water_mark: u32,
    pub elapsed_us: u64,
}

impl From<&PipelineReport> for VdpReport {
    fn from(r: &PipelineReport) -> Self {
        VdpReport {
            units_submitted: r.units_submitted,
            frames_decoded: r.frames_decoded,
            frames_converted: r.frames_converted,
            display_swaps: r.display_swaps,
            pool_size: r.pool_size as u32,
            low_water_mark: r.low_water_mark as u32,
            elapsed_us: r.elapsed.as_micros() as u64,
        }
    }
}

/// Run the pipeline to completion. Blocks the calling thread. `report` may
/// be null.
#[no_mangle]
pub extern "C" fn vdp_pipeline_run(
    handle: *mut VdpPipelineHandle,
    report: *mut VdpReport,
) -> VdpResult {
    if handle.is_null() {
        return VdpResult::ErrorInvalidHandle;
    }

    let handle = unsafe { &*handle };
    let pipeline = match handle.pipeline.lock().take() {
        Some(pipeline) => pipeline,
        None => {
            set_last_error("Pipeline already run");
            return VdpResult::ErrorAlreadyRun;
        }
    };

    match pipeline.run() {
        Ok(result) => {
            if !report.is_null() {
                unsafe {
                    *report = VdpReport::from(&result);
                }
            }
            VdpResult::Success
        }
        Err(e) => e.into(),
    }
}

/// Destroy a pipeline
#[no_mangle]
pub extern "C" fn vdp_pipeline_destroy(handle: *mut VdpPipelineHandle) {
    if !handle.is_null() {
        unsafe {
            drop(Box::from_raw(handle));
        }
    }
}

// =============================================================================
// Version Info
// =============================================================================

static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

/// Get library version
#[no_mangle]
pub extern "C" fn vdp_get_version() -> *const c_char {
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::loopback::synthetic_stream;
    use std::io::Write;

    #[test]
    fn test_null_handle() {
        assert_eq!(
            vdp_pipeline_run(ptr::null_mut(), ptr::null_mut()),
            VdpResult::ErrorInvalidHandle
        );
        vdp_pipeline_destroy(ptr::null_mut());
    }

    #[test]
    fn test_version() {
        let version = vdp_get_version();
        assert!(!version.is_null());
    }

    #[test]
    fn test_create_missing_file() {
        let path = CString::new("/nonexistent/stream.h264").unwrap();
        let handle = vdp_pipeline_create(path.as_ptr(), ptr::null());
        assert!(handle.is_null());
        assert!(!vdp_get_last_error().is_null());
        vdp_clear_last_error();
        assert!(vdp_get_last_error().is_null());
    }

    #[test]
    fn test_run_once() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&synthetic_stream(Codec::H264, 6)).unwrap();
        let path = CString::new(file.path().to_str().unwrap()).unwrap();

        let mut config = vdp_config_default();
        config.display_width = 64;
        config.display_height = 32;
        config.refresh_us = 1000;

        let handle = vdp_pipeline_create(path.as_ptr(), &config);
        assert!(!handle.is_null());

        let mut report = VdpReport::default();
        assert_eq!(vdp_pipeline_run(handle, &mut report), VdpResult::Success);
        assert_eq!(report.frames_decoded, 6);
        assert_eq!(report.frames_converted, 6);

        assert_eq!(vdp_pipeline_run(handle, ptr::null_mut()), VdpResult::ErrorAlreadyRun);
        vdp_pipeline_destroy(handle);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            VdpResult::from(Error::Protocol("x".into())),
            VdpResult::ErrorProtocol
        );
        assert_eq!(
            VdpResult::from(Err::<(), _>(Error::Parse("x".into()))),
            VdpResult::ErrorParse
        );
    }
}
