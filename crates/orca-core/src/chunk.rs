//! Chunked transfer framing
//!
//! A framed body is a sequence of `<decimal length>***<bytes>` records. The
//! length prefix makes the framing unambiguous even when the payload itself
//! contains `***`.

use crate::error::{Error, Result};
use std::ops::Range;
use std::path::Path;

/// Delimiter between a frame's length prefix and its bytes
pub const FRAME_DELIMITER: &[u8] = b"***";

/// Longest accepted length prefix, in digits
const MAX_HEADER_DIGITS: usize = 20;

/// Byte ranges of consecutive `chunk_size` chunks covering `len` bytes
pub fn chunk_ranges(len: usize, chunk_size: usize) -> impl Iterator<Item = Range<usize>> {
    let step = chunk_size.max(1);
    (0..len).step_by(step).map(move |start| start..(start + step).min(len))
}

/// Encode one chunk as a frame
pub fn encode_frame(chunk: &[u8]) -> Vec<u8> {
    let header = chunk.len().to_string();
    let mut frame = Vec::with_capacity(header.len() + FRAME_DELIMITER.len() + chunk.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(FRAME_DELIMITER);
    frame.extend_from_slice(chunk);
    frame
}

#[derive(Debug)]
enum DecodeState {
    /// Collecting length digits and the delimiter
    Header(Vec<u8>),
    /// Bytes of the current frame still to come
    Body(usize),
}

/// Incremental decoder for framed bodies
///
/// Input may be split anywhere, including inside a length prefix.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header(Vec::new()),
        }
    }

    /// Feed raw bytes, returning the payload bytes they contained
    pub fn push(&mut self, mut input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len());

        while !input.is_empty() {
            match &mut self.state {
                DecodeState::Body(remaining) => {
                    let take = (*remaining).min(input.len());
                    out.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    *remaining -= take;
                    if *remaining == 0 {
                        self.state = DecodeState::Header(Vec::new());
                    }
                }
                DecodeState::Header(header) => {
                    header.push(input[0]);
                    input = &input[1..];

                    if header.ends_with(FRAME_DELIMITER) {
                        let digits = &header[..header.len() - FRAME_DELIMITER.len()];
                        let len = parse_length(digits)?;
                        self.state = if len == 0 {
                            DecodeState::Header(Vec::new())
                        } else {
                            DecodeState::Body(len)
                        };
                    } else if header.len() > MAX_HEADER_DIGITS + FRAME_DELIMITER.len() {
                        return Err(Error::Protocol("frame header too long".to_string()));
                    }
                }
            }
        }

        Ok(out)
    }

    /// Check that the stream ended on a frame boundary
    pub fn finish(self) -> Result<()> {
        match self.state {
            DecodeState::Header(header) if header.is_empty() => Ok(()),
            DecodeState::Header(_) => Err(Error::Protocol("truncated frame header".to_string())),
            DecodeState::Body(remaining) => Err(Error::Protocol(format!(
                "truncated frame: {} bytes missing",
                remaining
            ))),
        }
    }
}

fn parse_length(digits: &[u8]) -> Result<usize> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(Error::Protocol(format!(
            "invalid frame length {:?}",
            String::from_utf8_lossy(digits)
        )));
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Protocol("frame length out of range".to_string()))
}

/// MIME type served for a file name, by extension
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());
    match ext.as_deref() {
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_all(data: &[u8], chunk_size: usize) -> Vec<u8> {
        chunk_ranges(data.len(), chunk_size)
            .flat_map(|range| encode_frame(&data[range]))
            .collect()
    }

    #[test]
    fn test_chunk_ranges_cover_input() {
        let ranges: Vec<_> = chunk_ranges(10, 4).collect();
        assert_eq!(ranges, vec![0..4, 4..8, 8..10]);
        assert_eq!(chunk_ranges(0, 4).count(), 0);
    }

    #[test]
    fn test_framed_concatenation_matches_input() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        for chunk_size in [1, 3, 1024, 4999, 5000, 9000] {
            let framed = frame_all(&data, chunk_size);
            let mut decoder = FrameDecoder::new();
            let decoded = decoder.push(&framed).unwrap();
            decoder.finish().unwrap();
            assert_eq!(decoded, data, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_decoder_handles_split_input_and_delimiter_in_payload() {
        let data = b"a***b***c****".repeat(20);
        let framed = frame_all(&data, 7);

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for piece in framed.chunks(2) {
            decoded.extend(decoder.push(piece).unwrap());
        }
        decoder.finish().unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_decoder_rejects_garbage_and_truncation() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"xy***abc").is_err());

        let mut decoder = FrameDecoder::new();
        decoder.push(b"10***abc").unwrap();
        assert!(decoder.finish().is_err());
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("notes.txt"), "text/plain");
        assert_eq!(content_type_for("data.JSON"), "application/json");
        assert_eq!(content_type_for("clip.mp4"), "video/mp4");
        assert_eq!(content_type_for("archive"), "application/octet-stream");
    }
}
