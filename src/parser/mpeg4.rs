//! MPEG-4 Part 2 frame splitter

use super::{emit_unit, next_start_code, BitstreamParser, Extracted, StartCode};
use crate::error::{Error, Result};

const VOS_START: u8 = 0xB0;
const GOV_START: u8 = 0xB3;
const VOP_START: u8 = 0xB6;
/// Video object and video object layer start codes occupy 0x00..=0x2F
const VOL_LAST: u8 = 0x2F;

/// Splits an MPEG-4 visual elementary stream into VOPs
#[derive(Debug, Default)]
pub struct Mpeg4Parser {
    units: u64,
}

impl Mpeg4Parser {
    /// Create a parser
    pub fn new() -> Self {
        Self::default()
    }

    fn code(data: &[u8], code: StartCode) -> Option<u8> {
        data.get(code.payload).copied()
    }

    /// Headers that belong to the following VOP
    fn opens_unit(code: u8) -> bool {
        code == GOV_START || code == VOS_START || code <= VOL_LAST
    }
}

impl BitstreamParser for Mpeg4Parser {
    fn extract_header(&mut self, input: &[u8], dest: &mut [u8]) -> Result<Extracted> {
        let first = match next_start_code(input, 0) {
            Some(code) => code,
            None => return Ok(Extracted::EndOfStream),
        };

        let mut cursor = first;
        let end = loop {
            if Self::code(input, cursor) == Some(VOP_START) {
                break cursor.position;
            }
            match next_start_code(input, cursor.payload) {
                Some(next) => cursor = next,
                None => break input.len(),
            }
        };

        if end == first.position {
            return Err(Error::Parse(
                "no configuration headers before the first VOP".into(),
            ));
        }

        log::debug!("MPEG-4 header: {} bytes", end - first.position);
        emit_unit(input, first.position, end, dest)
    }

    fn extract_unit(&mut self, input: &[u8], dest: &mut [u8]) -> Result<Extracted> {
        let first = match next_start_code(input, 0) {
            Some(code) => code,
            None => return Ok(Extracted::EndOfStream),
        };

        let mut seen_vop = false;
        let mut cursor = first;
        let end = loop {
            match Self::code(input, cursor) {
                Some(VOP_START) => {
                    if seen_vop {
                        break cursor.position;
                    }
                    seen_vop = true;
                }
                Some(code) if seen_vop && Self::opens_unit(code) => break cursor.position,
                _ => {}
            }

            match next_start_code(input, cursor.payload) {
                Some(next) => cursor = next,
                None => break input.len(),
            }
        };

        self.units += 1;
        log::trace!("MPEG-4 unit {}: {} bytes", self.units, end - first.position);
        emit_unit(input, first.position, end, dest)
    }
}
