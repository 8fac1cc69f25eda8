//! In-process loopback devices
//!
//! Software stand-ins for the decoder, post-processor and framebuffer. They
//! follow the same queueing rules as the kernel drivers (streaming only starts
//! with a buffer queued, a buffer cannot be queued twice, the decoded format is
//! only known after the stream header) without touching any pixels beyond a
//! per-frame sequence tag. The tag is written into the first eight bytes of
//! each decoded buffer and carried through conversion into the framebuffer, so
//! frame order can be checked at every stage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::PlaneMemory;
use crate::config::Codec;
use crate::error::{DeviceKind, Error, Result};

mod decoder;
mod framebuffer;
mod post_processor;

pub use decoder::{LoopbackDecoder, LoopbackDecoderOptions, LoopbackDecoderStats};
pub use framebuffer::{FramebufferStats, MemoryFramebuffer};
pub use post_processor::{LoopbackPostProcessor, LoopbackPostProcessorStats};

/// Device operation that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    DecoderSubmitInput,
    DecoderSubmitOutput,
    DecoderRetrieveOutput,
    PostProcessSubmitInput,
    PostProcessSubmitOutput,
    PostProcessRetrieveOutput,
    PresenterPan,
    PresenterVerticalBlank,
}

impl FaultPoint {
    fn device(&self) -> DeviceKind {
        match self {
            FaultPoint::DecoderSubmitInput
            | FaultPoint::DecoderSubmitOutput
            | FaultPoint::DecoderRetrieveOutput => DeviceKind::Decoder,
            FaultPoint::PostProcessSubmitInput
            | FaultPoint::PostProcessSubmitOutput
            | FaultPoint::PostProcessRetrieveOutput => DeviceKind::PostProcessor,
            FaultPoint::PresenterPan | FaultPoint::PresenterVerticalBlank => DeviceKind::Presenter,
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            FaultPoint::DecoderSubmitInput | FaultPoint::PostProcessSubmitInput => "submit input",
            FaultPoint::DecoderSubmitOutput | FaultPoint::PostProcessSubmitOutput => "submit output",
            FaultPoint::DecoderRetrieveOutput | FaultPoint::PostProcessRetrieveOutput => {
                "retrieve output"
            }
            FaultPoint::PresenterPan => "pan display",
            FaultPoint::PresenterVerticalBlank => "wait for vertical blank",
        }
    }
}

/// One-shot failures armed on device operations
#[derive(Debug, Default)]
pub struct FaultInjector {
    armed: Mutex<HashMap<FaultPoint, usize>>,
    triggered: AtomicUsize,
}

impl FaultInjector {
    /// Create an injector with nothing armed
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the call to `point` that follows `after_calls` successful calls
    pub fn arm(&self, point: FaultPoint, after_calls: usize) {
        self.armed.lock().insert(point, after_calls);
    }

    /// Number of faults fired so far
    pub fn triggered(&self) -> usize {
        self.triggered.load(Ordering::Acquire)
    }

    pub(crate) fn check(&self, point: FaultPoint) -> Result<()> {
        let mut armed = self.armed.lock();
        if let Some(remaining) = armed.get_mut(&point) {
            if *remaining == 0 {
                armed.remove(&point);
                self.triggered.fetch_add(1, Ordering::AcqRel);
                log::debug!("Injecting fault at {:?}", point);
                return Err(Error::device(point.device(), point.operation(), "injected fault"));
            }
            *remaining -= 1;
        }
        Ok(())
    }
}

/// Size of the sequence tag at the start of a plane
const TAG_LEN: usize = 8;

pub(crate) fn write_tag(plane: &PlaneMemory, tag: u64) {
    plane.with_mut(|bytes| {
        if bytes.len() >= TAG_LEN {
            bytes[..TAG_LEN].copy_from_slice(&tag.to_le_bytes());
        }
    });
}

pub(crate) fn read_tag(plane: &PlaneMemory) -> Option<u64> {
    plane.with(|bytes| {
        let raw: [u8; TAG_LEN] = bytes.get(..TAG_LEN)?.try_into().ok()?;
        Some(u64::from_le_bytes(raw))
    })
}

/// Block on `changed` until `take` yields a value or `timeout` passes
pub(crate) fn wait_until<S, T>(
    state: &Mutex<S>,
    changed: &Condvar,
    timeout: Duration,
    device: DeviceKind,
    operation: &'static str,
    mut take: impl FnMut(&mut S) -> Result<Option<T>>,
) -> Result<T> {
    let deadline = Instant::now() + timeout;
    let mut guard = state.lock();
    loop {
        if let Some(value) = take(&mut guard)? {
            return Ok(value);
        }
        if changed.wait_until(&mut guard, deadline).timed_out() {
            return match take(&mut guard)? {
                Some(value) => Ok(value),
                None => Err(Error::timeout(device, operation, timeout)),
            };
        }
    }
}

/// Elementary stream of `frames` pictures that the bundled parsers split
/// into one header and `frames` units
pub fn synthetic_stream(codec: Codec, frames: usize) -> Vec<u8> {
    let mut out = Vec::new();
    match codec {
        Codec::H264 => {
            out.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1E, 0xDA]);
            out.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80]);
            for i in 0..frames {
                let header = if i == 0 { 0x65 } else { 0x41 };
                out.extend_from_slice(&[0, 0, 0, 1, header, 0x88]);
                out.extend_from_slice(&[0x80 | (i & 0x7F) as u8, 0xAA, 0xAA, 0xAA]);
            }
        }
        Codec::Mpeg4 => {
            out.extend_from_slice(&[0, 0, 1, 0xB0, 0x01]);
            out.extend_from_slice(&[0, 0, 1, 0xB5, 0x09]);
            out.extend_from_slice(&[0, 0, 1, 0x20, 0x08, 0x80, 0x11, 0x22]);
            for i in 0..frames {
                out.extend_from_slice(&[0, 0, 1, 0xB6, 0x10]);
                out.extend_from_slice(&[0x80 | (i & 0x7F) as u8, 0xAA, 0xAA]);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{self, Extracted};

    #[test]
    fn test_fault_fires_once() {
        let faults = FaultInjector::new();
        faults.arm(FaultPoint::PresenterPan, 1);

        assert!(faults.check(FaultPoint::PresenterPan).is_ok());
        let err = faults.check(FaultPoint::PresenterPan).unwrap_err();
        assert_eq!(err.device_kind(), Some(DeviceKind::Presenter));
        assert!(faults.check(FaultPoint::PresenterPan).is_ok());
        assert_eq!(faults.triggered(), 1);
    }

    #[test]
    fn test_tag_round_trip() {
        let plane = PlaneMemory::new(32);
        write_tag(&plane, 41);
        assert_eq!(read_tag(&plane), Some(41));
        assert_eq!(read_tag(&PlaneMemory::new(4)), None);
    }

    fn count_units(codec: Codec, data: &[u8]) -> usize {
        let mut parser = parser::for_codec(codec);
        let mut dest = vec![0u8; 4096];
        let mut offset = match parser.extract_header(data, &mut dest).unwrap() {
            Extracted::Unit { consumed, .. } => consumed,
            Extracted::EndOfStream => return 0,
        };
        let mut units = 0;
        while let Extracted::Unit { consumed, .. } =
            parser.extract_unit(&data[offset..], &mut dest).unwrap()
        {
            offset += consumed;
            units += 1;
        }
        units
    }

    #[test]
    fn test_synthetic_stream_parses() {
        assert_eq!(count_units(Codec::H264, &synthetic_stream(Codec::H264, 12)), 12);
        assert_eq!(count_units(Codec::Mpeg4, &synthetic_stream(Codec::Mpeg4, 7)), 7);
    }
}
