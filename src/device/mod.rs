//! Device contracts consumed by the pipeline
//!
//! The pipeline drives three memory-to-memory style devices: a decoder, a
//! post-processor (scaler / colour converter) and a presenter (framebuffer).
//! Each device has an input queue and an output queue; buffers are handed to a
//! queue with a submit call and handed back by a blocking retrieve call.
//!
//! All methods take `&self`. Implementations synchronise internally, because
//! the parser and decode stages use the decoder's two queues concurrently.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::Codec;
use crate::error::{DeviceKind, Error, Result};

pub mod loopback;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

/// Queue of a memory-to-memory device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Buffers flowing into the device (V4L2 OUTPUT)
    Input,
    /// Buffers flowing out of the device (V4L2 CAPTURE)
    Output,
}

impl Direction {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

/// Pixel layout of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Two-plane 4:2:0, linear
    Nv12,
    /// Three-plane 4:2:0
    Yuv420p,
    /// 16-bit RGB
    Rgb565,
    /// 32-bit RGB
    Rgb32,
}

/// Shared memory of one buffer plane.
///
/// Clones refer to the same bytes, the way a mapped buffer is visible to every
/// device it is queued on.
#[derive(Clone)]
pub struct PlaneMemory {
    bytes: Arc<Mutex<Vec<u8>>>,
    len: usize,
}

impl PlaneMemory {
    /// Allocate a zeroed plane
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0u8; len])),
            len,
        }
    }

    /// Plane size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the plane has no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the plane
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let bytes = self.bytes.lock();
        f(&bytes)
    }

    /// Write the plane
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut bytes = self.bytes.lock();
        f(&mut bytes)
    }

    /// Whether two handles refer to the same memory
    pub fn same_memory(&self, other: &PlaneMemory) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl std::fmt::Debug for PlaneMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaneMemory").field("len", &self.len).finish()
    }
}

/// Planes of one buffer
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    /// Plane memory, in plane order
    pub planes: Vec<PlaneMemory>,

    /// Bytes per line of the first plane
    pub bytes_per_line: u32,
}

impl BufferDescriptor {
    /// Allocate a buffer with the given plane sizes
    pub fn allocate(plane_sizes: &[usize], bytes_per_line: u32) -> Self {
        Self {
            planes: plane_sizes.iter().map(|&len| PlaneMemory::new(len)).collect(),
            bytes_per_line,
        }
    }

    /// First plane, if any
    pub fn primary(&self) -> Option<&PlaneMemory> {
        self.planes.first()
    }
}

/// Rectangle of valid pixels inside a decoded buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    /// Whether the rectangle fits inside a `width` x `height` frame
    pub fn fits(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.left.saturating_add(self.width) <= width
            && self.top.saturating_add(self.height) <= height
    }
}

/// Compressed input buffers granted by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputLayout {
    /// Number of stream buffers
    pub buffer_count: usize,

    /// Capacity of each stream buffer in bytes
    pub buffer_size: usize,
}

/// Format of the decoder's output buffers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFormat {
    /// Pixel layout
    pub pixel_format: PixelFormat,

    /// Coded width
    pub width: u32,

    /// Coded height
    pub height: u32,

    /// Visible area
    pub crop: CropRect,

    /// Size of each plane in bytes
    pub plane_sizes: Vec<usize>,

    /// Bytes per line of the first plane
    pub bytes_per_line: u32,

    /// Decoded buffers allocated (the pool size)
    pub buffer_count: usize,

    /// Buffers the decoder needs queued to make progress
    pub min_buffers: usize,
}

/// Framebuffer properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferGeometry {
    /// Visible width
    pub width: u32,

    /// Visible height
    pub height: u32,

    /// Height of the whole virtual area
    pub virtual_height: u32,

    /// Bits per pixel
    pub bits_per_pixel: u32,

    /// Bytes per line
    pub stride: u32,
}

impl FramebufferGeometry {
    /// Geometry of a linear framebuffer with `buffers` screens stacked vertically
    pub fn new(width: u32, height: u32, bits_per_pixel: u32, buffers: u32) -> Self {
        Self {
            width,
            height,
            virtual_height: height * buffers.max(1),
            bits_per_pixel,
            stride: width * bits_per_pixel / 8,
        }
    }

    /// Bytes of one screen
    pub fn screen_size(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    /// Screens that fit in the virtual area
    pub fn screen_count(&self) -> usize {
        if self.height == 0 {
            return 0;
        }
        (self.virtual_height / self.height) as usize
    }

    /// Pixel format for the colour depth
    pub fn pixel_format(&self) -> Result<PixelFormat> {
        match self.bits_per_pixel {
            16 => Ok(PixelFormat::Rgb565),
            32 => Ok(PixelFormat::Rgb32),
            bpp => Err(Error::InvalidConfig(format!(
                "framebuffer format not recognized, bpp={}",
                bpp
            ))),
        }
    }
}

/// One buffer returned by the decoder's output queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedBuffer {
    /// Slot index in the decoded pool
    pub index: usize,

    /// Bytes written into the first plane. Zero marks end of stream.
    pub bytes_used: usize,
}

impl DecodedBuffer {
    /// Whether this buffer is the end-of-stream marker
    pub fn is_end_of_stream(&self) -> bool {
        self.bytes_used == 0
    }
}

/// Hardware video decoder
pub trait DecoderDevice: Send + Sync {
    /// Configure the compressed input queue
    fn setup_input(&self, codec: Codec, buffer_size: usize, buffer_count: usize) -> Result<InputLayout>;

    /// Memory of a compressed input buffer
    fn input_buffer(&self, slot: usize) -> Result<BufferDescriptor>;

    /// Queue an input buffer holding `bytes_used` bytes. Zero bytes marks end of stream.
    fn submit_input(&self, slot: usize, bytes_used: usize) -> Result<()>;

    /// Wait for the decoder to release an input buffer
    fn retrieve_input(&self, timeout: Duration) -> Result<usize>;

    /// Configure the decoded output queue. Valid once the stream header is consumed.
    fn setup_output(&self, extra_buffers: usize) -> Result<DecodedFormat>;

    /// Memory of a decoded buffer
    fn output_buffer(&self, index: usize) -> Result<BufferDescriptor>;

    /// Queue an empty decoded buffer
    fn submit_output_slot(&self, index: usize) -> Result<()>;

    /// Wait for a decoded buffer
    fn retrieve_output(&self, timeout: Duration) -> Result<DecodedBuffer>;

    /// Switch streaming on a queue
    fn set_streaming(&self, direction: Direction, on: bool) -> Result<()>;
}

/// Scaler / colour converter
pub trait PostProcessor: Send + Sync {
    /// Configure the input queue for the decoder's output format
    fn setup_input(&self, format: &DecodedFormat) -> Result<()>;

    /// Configure the output queue for the framebuffer
    fn setup_output(&self, geometry: &FramebufferGeometry, buffer_count: usize) -> Result<()>;

    /// Select the source rectangle
    fn set_crop(&self, crop: CropRect) -> Result<()>;

    /// Queue a decoded buffer
    fn submit_input(&self, index: usize, source: &BufferDescriptor) -> Result<()>;

    /// Queue a destination buffer
    fn submit_output(&self, index: usize, dest: &BufferDescriptor) -> Result<()>;

    /// Wait for a converted destination buffer
    fn retrieve_output(&self, timeout: Duration) -> Result<usize>;

    /// Wait for a consumed source buffer
    fn retrieve_input(&self, timeout: Duration) -> Result<usize>;

    /// Switch streaming on a queue
    fn set_streaming(&self, direction: Direction, on: bool) -> Result<()>;
}

/// Display framebuffer
pub trait Presenter: Send + Sync {
    /// Framebuffer properties
    fn geometry(&self) -> FramebufferGeometry;

    /// Number of screen-sized buffers in the virtual area
    fn capacity(&self) -> usize {
        self.geometry().screen_count()
    }

    /// Memory of one screen-sized buffer
    fn buffer(&self, index: usize) -> Result<BufferDescriptor>;

    /// Show the buffer starting at line `y_offset`
    fn pan_to_buffer(&self, y_offset: u32) -> Result<()>;

    /// Block until the next vertical blank
    fn wait_for_vertical_blank(&self, timeout: Duration) -> Result<()>;
}

/// The three devices a pipeline runs on
#[derive(Clone)]
pub struct Devices {
    pub decoder: Arc<dyn DecoderDevice>,
    pub post_processor: Arc<dyn PostProcessor>,
    pub presenter: Arc<dyn Presenter>,
}

impl Devices {
    /// Bundle devices
    pub fn new(
        decoder: Arc<dyn DecoderDevice>,
        post_processor: Arc<dyn PostProcessor>,
        presenter: Arc<dyn Presenter>,
    ) -> Self {
        Self {
            decoder,
            post_processor,
            presenter,
        }
    }
}

/// Copy `rows` rows of `row_bytes` between two strided planes
pub(crate) fn copy_rows(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    row_bytes: usize,
    rows: usize,
) {
    for row in 0..rows {
        let s = row * src_stride;
        let d = row * dst_stride;
        if s + row_bytes > src.len() || d + row_bytes > dst.len() {
            break;
        }
        dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
    }
}

/// Error for a buffer index outside a queue
pub(crate) fn bad_index(device: DeviceKind, operation: &'static str, index: usize, count: usize) -> Error {
    Error::device(
        device,
        operation,
        format!("buffer index {} out of range (count {})", index, count),
    )
}
