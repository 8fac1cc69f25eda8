//! H.264 Annex-B access unit splitter

use super::{emit_unit, next_start_code, BitstreamParser, Extracted, StartCode};
use crate::error::{Error, Result};

const NAL_SEI: u8 = 6;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_AUD: u8 = 9;

/// Splits an Annex-B byte stream at picture boundaries
#[derive(Debug, Default)]
pub struct H264Parser {
    units: u64,
}

impl H264Parser {
    /// Create a parser
    pub fn new() -> Self {
        Self::default()
    }

    fn nal_type(data: &[u8], code: StartCode) -> u8 {
        data.get(code.payload).map(|b| b & 0x1F).unwrap_or(0)
    }

    fn is_slice(nal_type: u8) -> bool {
        (1..=5).contains(&nal_type)
    }

    /// first_mb_in_slice is ue(v); zero is coded as a single set bit
    fn starts_picture(data: &[u8], code: StartCode) -> bool {
        data.get(code.payload + 1)
            .map(|b| b & 0x80 != 0)
            .unwrap_or(false)
    }

    /// NAL types that may only appear before the first slice of a picture
    fn opens_access_unit(nal_type: u8) -> bool {
        matches!(nal_type, NAL_SEI | NAL_SPS | NAL_PPS | NAL_AUD | 14..=18)
    }
}

impl BitstreamParser for H264Parser {
    fn extract_header(&mut self, input: &[u8], dest: &mut [u8]) -> Result<Extracted> {
        let first = match next_start_code(input, 0) {
            Some(code) => code,
            None => return Ok(Extracted::EndOfStream),
        };

        let mut cursor = first;
        let end = loop {
            if Self::is_slice(Self::nal_type(input, cursor)) {
                break cursor.position;
            }
            match next_start_code(input, cursor.payload) {
                Some(next) => cursor = next,
                None => break input.len(),
            }
        };

        if end == first.position {
            return Err(Error::Parse(
                "no parameter sets before the first slice".into(),
            ));
        }

        log::debug!("H.264 header: {} bytes", end - first.position);
        emit_unit(input, first.position, end, dest)
    }

    fn extract_unit(&mut self, input: &[u8], dest: &mut [u8]) -> Result<Extracted> {
        let first = match next_start_code(input, 0) {
            Some(code) => code,
            None => return Ok(Extracted::EndOfStream),
        };

        let mut seen_slice = false;
        let mut cursor = first;
        let end = loop {
            let nal_type = Self::nal_type(input, cursor);
            if Self::is_slice(nal_type) {
                if seen_slice && Self::starts_picture(input, cursor) {
                    break cursor.position;
                }
                seen_slice = true;
            } else if seen_slice && Self::opens_access_unit(nal_type) {
                break cursor.position;
            }

            match next_start_code(input, cursor.payload) {
                Some(next) => cursor = next,
                None => break input.len(),
            }
        };

        self.units += 1;
        log::trace!("H.264 unit {}: {} bytes", self.units, end - first.position);
        emit_unit(input, first.position, end, dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(header: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![0, 0, 0, 1, header];
        out.extend_from_slice(body);
        out
    }

    fn stream() -> Vec<u8> {
        let mut s = Vec::new();
        s.extend(nal(0x67, &[0x42, 0x00, 0x1E])); // SPS
        s.extend(nal(0x68, &[0xCE, 0x38])); // PPS
        s.extend(nal(0x65, &[0x88, 0x84, 0x00])); // IDR, first_mb = 0
        s.extend(nal(0x65, &[0x40, 0x11])); // IDR, second slice of the same picture
        s.extend(nal(0x41, &[0x9A, 0x02])); // P, new picture
        s.extend(nal(0x09, &[0x10])); // AUD
        s.extend(nal(0x41, &[0x9A, 0x03])); // P
        s
    }

    #[test]
    fn test_header_stops_at_first_slice() {
        let data = stream();
        let mut parser = H264Parser::new();
        let mut dest = vec![0u8; 1024];

        let header = parser.extract_header(&data, &mut dest).unwrap();
        assert_eq!(header, Extracted::Unit { consumed: 15, size: 15 });
        assert_eq!(&dest[..5], &[0, 0, 0, 1, 0x67]);
    }

    #[test]
    fn test_units_split_at_picture_boundaries() {
        let data = stream();
        let mut parser = H264Parser::new();
        let mut dest = vec![0u8; 1024];

        let mut offset = match parser.extract_header(&data, &mut dest).unwrap() {
            Extracted::Unit { consumed, .. } => consumed,
            Extracted::EndOfStream => panic!("no header"),
        };

        let mut sizes = Vec::new();
        loop {
            match parser.extract_unit(&data[offset..], &mut dest).unwrap() {
                Extracted::Unit { consumed, size } => {
                    sizes.push(size);
                    offset += consumed;
                }
                Extracted::EndOfStream => break,
            }
        }

        // two-slice IDR, P, AUD + P
        assert_eq!(sizes, vec![8 + 7, 7, 6 + 7]);
        assert_eq!(offset, data.len());
    }

    #[test]
    fn test_no_start_code_is_end_of_stream() {
        let mut parser = H264Parser::new();
        let mut dest = vec![0u8; 16];
        assert_eq!(
            parser.extract_unit(&[0xFF, 0xFF], &mut dest).unwrap(),
            Extracted::EndOfStream
        );
        assert_eq!(
            parser.extract_header(&[], &mut dest).unwrap(),
            Extracted::EndOfStream
        );
    }

    #[test]
    fn test_header_missing() {
        let data = nal(0x65, &[0x88]);
        let mut parser = H264Parser::new();
        let mut dest = vec![0u8; 16];
        assert!(matches!(
            parser.extract_header(&data, &mut dest),
            Err(Error::Parse(_))
        ));
    }
}
