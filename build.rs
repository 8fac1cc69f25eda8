//! Build script for vdec-pipeline-core
//!
//! This script:
//! 1. Locates FFmpeg libraries using pkg-config when the `ffmpeg` feature is on
//! 2. Generates the C header using cbindgen

use std::env;
use std::path::{Path, PathBuf};

const HEADER_NAME: &str = "vdec_pipeline.h";

fn main() {
    println!("cargo:rerun-if-changed=src/ffi/");
    println!("cargo:rerun-if-changed=cbindgen.toml");

    // Get build configuration
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set");

    // Software backend only
    if env::var_os("CARGO_FEATURE_FFMPEG").is_some() {
        find_ffmpeg_libs();
    }

    // Generate C header
    generate_header(&manifest_dir, &out_dir);
}

/// Find FFmpeg libraries using pkg-config or fallback paths
fn find_ffmpeg_libs() {
    let libs = ["libavcodec", "libavutil", "libswscale"];

    let mut found_all = true;
    for lib in &libs {
        match pkg_config::Config::new()
            .atleast_version("58.0.0")
            .probe(lib)
        {
            Ok(library) => {
                println!("cargo:info=Found {} via pkg-config", lib);
                for path in &library.link_paths {
                    println!("cargo:rustc-link-search=native={}", path.display());
                }
            }
            Err(e) => {
                println!("cargo:warning=pkg-config failed for {}: {}", lib, e);
                found_all = false;
            }
        }
    }

    if !found_all {
        try_fallback_paths();
    }
}

/// Try common FFmpeg installation paths on embedded Linux images
fn try_fallback_paths() {
    let lib_paths = [
        "/usr/lib/arm-linux-gnueabihf",
        "/usr/lib/aarch64-linux-gnu",
        "/usr/local/lib",
        "ffmpeg-build/output/lib",
    ];

    for path in &lib_paths {
        if Path::new(path).exists() {
            println!("cargo:rustc-link-search=native={}", path);
            println!("cargo:info=Added link path: {}", path);
        }
    }

    println!("cargo:rustc-link-lib=dylib=avcodec");
    println!("cargo:rustc-link-lib=dylib=avutil");
    println!("cargo:rustc-link-lib=dylib=swscale");
}

/// Generate C header using cbindgen
fn generate_header(manifest_dir: &str, out_dir: &str) {
    let crate_dir = PathBuf::from(manifest_dir);
    let config_path = crate_dir.join("cbindgen.toml");
    let header_out = PathBuf::from(out_dir).join(HEADER_NAME);

    let config = if config_path.exists() {
        cbindgen::Config::from_file(&config_path).unwrap_or_default()
    } else {
        cbindgen::Config::default()
    };

    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file(&header_out);
            println!("cargo:info=Generated header: {}", header_out.display());

            // Mirror into include/ for consumers building against the staticlib
            let include_dir = crate_dir.join("include");
            if include_dir.exists() {
                bindings.write_to_file(include_dir.join(HEADER_NAME));
            }
        }
        Err(e) => {
            println!("cargo:warning=cbindgen failed: {}", e);
            create_fallback_header(&header_out);
        }
    }
}

/// Create a minimal fallback header if cbindgen fails
fn create_fallback_header(header_path: &Path) {
    let header_content = r#"
#ifndef VDEC_PIPELINE_H
#define VDEC_PIPELINE_H

#include <stdint.h>
#include <stdbool.h>

// Note: This is a fallback header. Build with cbindgen for full API.

typedef enum {
    VdpResultSuccess = 0,
    VdpResultErrorFileNotFound = 1,
    VdpResultErrorInvalidConfig = 2,
    VdpResultErrorCodecNotSupported = 3,
    VdpResultErrorDevice = 4,
    VdpResultErrorTimeout = 5,
    VdpResultErrorProtocol = 6,
    VdpResultErrorParse = 7,
    VdpResultErrorInvalidHandle = 8,
    VdpResultErrorAlreadyRun = 9,
    VdpResultErrorUnknown = 99,
} VdpResult;

typedef struct {
    uint8_t codec;
    uint8_t backend;
    bool double_buffered;
    uint32_t extra_output_buffers;
    uint32_t low_water_mark;
    uint32_t completion_timeout_ms;
    uint32_t decoded_width;
    uint32_t decoded_height;
    uint32_t display_width;
    uint32_t display_height;
    uint32_t bits_per_pixel;
    uint32_t refresh_us;
} VdpConfig;

typedef struct {
    uint64_t units_submitted;
    uint64_t frames_decoded;
    uint64_t frames_converted;
    uint64_t display_swaps;
    uint32_t pool_size;
    uint32_t low_water_mark;
    uint64_t elapsed_us;
} VdpReport;

typedef struct VdpPipelineHandle VdpPipelineHandle;

// Error handling
const char* vdp_get_last_error(void);
void vdp_clear_last_error(void);
void vdp_init(void);

// Version info
const char* vdp_get_version(void);

// Pipeline lifecycle
VdpConfig vdp_config_default(void);
VdpPipelineHandle* vdp_pipeline_create(const char* path, const VdpConfig* config);
VdpResult vdp_pipeline_run(VdpPipelineHandle* handle, VdpReport* report);
void vdp_pipeline_destroy(VdpPipelineHandle* handle);

#endif // VDEC_PIPELINE_H
"#;

    std::fs::write(header_path, header_content).expect("Failed to write fallback header");
    println!("cargo:info=Created fallback header: {}", header_path.display());
}
