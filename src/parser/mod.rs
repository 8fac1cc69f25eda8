//! Elementary stream input and access unit extraction
//!
//! A parser splits the raw elementary stream into the units the decoder
//! consumes: one stream header followed by one access unit per frame.

use std::path::Path;

use crate::config::Codec;
use crate::error::{Error, Result};

mod h264;
mod mpeg4;

pub use h264::H264Parser;
pub use mpeg4::Mpeg4Parser;

/// Outcome of one extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extracted {
    /// A unit of `size` bytes was written to the destination; `consumed`
    /// input bytes can be skipped
    Unit { consumed: usize, size: usize },
    /// No further units in the input
    EndOfStream,
}

/// Splits an elementary stream into decoder units
pub trait BitstreamParser: Send {
    /// Extract the stream header (parameter sets / configuration headers)
    fn extract_header(&mut self, input: &[u8], dest: &mut [u8]) -> Result<Extracted>;

    /// Extract the next access unit
    fn extract_unit(&mut self, input: &[u8], dest: &mut [u8]) -> Result<Extracted>;
}

/// Parser for a codec
pub fn for_codec(codec: Codec) -> Box<dyn BitstreamParser> {
    match codec {
        Codec::H264 => Box::new(H264Parser::new()),
        Codec::Mpeg4 => Box::new(Mpeg4Parser::new()),
    }
}

/// Encoded input with a forward-only read cursor
pub struct InputStream {
    data: Vec<u8>,
    offset: usize,
}

impl InputStream {
    /// Read a whole file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }

        let data = std::fs::read(path)?;
        log::debug!("Opened input {:?} ({} bytes)", path, data.len());
        Ok(Self::from_bytes(data))
    }

    /// Wrap bytes already in memory
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, offset: 0 }
    }

    /// Bytes not read yet
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    /// Move the cursor forward
    pub fn advance(&mut self, bytes: usize) {
        self.offset = (self.offset + bytes).min(self.data.len());
    }

    /// Cursor position
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Total input size
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the input holds no bytes at all
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the cursor reached the end
    pub fn is_exhausted(&self) -> bool {
        self.offset >= self.data.len()
    }
}

/// A start code prefix found in a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StartCode {
    /// Offset of the first byte of the prefix (including a leading zero of a
    /// four-byte prefix)
    pub position: usize,
    /// Offset of the byte following `00 00 01`
    pub payload: usize,
}

/// Find the first `00 00 01` prefix at or after `from`
pub(crate) fn next_start_code(data: &[u8], from: usize) -> Option<StartCode> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let position = if i > from && data[i - 1] == 0 { i - 1 } else { i };
            return Some(StartCode {
                position,
                payload: i + 3,
            });
        }
        i += 1;
    }
    None
}

/// Copy `input[start..end]` into `dest` and describe the extraction
pub(crate) fn emit_unit(input: &[u8], start: usize, end: usize, dest: &mut [u8]) -> Result<Extracted> {
    let size = end - start;
    if size > dest.len() {
        return Err(Error::Parse(format!(
            "unit of {} bytes exceeds stream buffer of {} bytes",
            size,
            dest.len()
        )));
    }
    dest[..size].copy_from_slice(&input[start..end]);
    Ok(Extracted::Unit {
        consumed: end,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_start_code() {
        let data = [0xAA, 0, 0, 0, 1, 0x67, 0, 0, 1, 0x68];
        let first = next_start_code(&data, 0).unwrap();
        assert_eq!(first.position, 1);
        assert_eq!(first.payload, 5);

        let second = next_start_code(&data, first.payload).unwrap();
        assert_eq!(second.position, 6);
        assert_eq!(second.payload, 9);

        assert!(next_start_code(&data, second.payload).is_none());
    }

    #[test]
    fn test_input_stream_cursor() {
        let mut input = InputStream::from_bytes(vec![1, 2, 3, 4]);
        input.advance(3);
        assert_eq!(input.remaining(), &[4]);
        input.advance(10);
        assert!(input.is_exhausted());
        assert_eq!(input.offset(), 4);
    }

    #[test]
    fn test_input_stream_missing_file() {
        let result = InputStream::open("/nonexistent/stream.h264");
        assert!(matches!(result, Err(Error::FileNotFound(_))));
    }

    #[test]
    fn test_emit_unit_too_large() {
        let mut dest = [0u8; 2];
        let result = emit_unit(&[1, 2, 3], 0, 3, &mut dest);
        assert!(matches!(result, Err(Error::Parse(_))));
    }
}
