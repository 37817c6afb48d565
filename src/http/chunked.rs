//! Chunked transfer decoding
//!
//! Incremental decoder for `Transfer-Encoding: chunked` response bodies.
//! The decoder is fed whatever bytes have arrived and reports how much of the
//! input it consumed, so the caller can keep the unconsumed tail for the next
//! round.

use super::{Error, Result};

/// Chunked decoder
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: DecoderState,
    remaining: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecoderState {
    Size,
    Data,
    DataEnd,
    Trailer,
    Complete,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            state: DecoderState::Size,
            remaining: 0,
        }
    }

    /// Decode as much of `input` as possible into `output`
    ///
    /// Returns `(bytes_consumed, is_complete)`. Bytes after the terminating
    /// empty trailer line are never consumed.
    pub fn decode(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(usize, bool)> {
        let mut pos = 0;

        loop {
            let rest = &input[pos..];
            match self.state {
                DecoderState::Size => {
                    let Some(eol) = find_crlf(rest) else { break };
                    let line = String::from_utf8_lossy(&rest[..eol]);
                    // Chunk extensions follow a ';'
                    let size = line.split(';').next().unwrap_or_default().trim();
                    self.remaining = usize::from_str_radix(size, 16)
                        .map_err(|_| Error::InvalidChunkSize(size.to_string()))?;
                    pos += eol + 2;
                    self.state = if self.remaining == 0 {
                        DecoderState::Trailer
                    } else {
                        DecoderState::Data
                    };
                }
                DecoderState::Data => {
                    if rest.is_empty() {
                        break;
                    }
                    let n = self.remaining.min(rest.len());
                    output.extend_from_slice(&rest[..n]);
                    pos += n;
                    self.remaining -= n;
                    if self.remaining == 0 {
                        self.state = DecoderState::DataEnd;
                    }
                }
                DecoderState::DataEnd => {
                    if rest.len() < 2 {
                        break;
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(Error::Parse("Expected CRLF after chunk data".to_string()));
                    }
                    pos += 2;
                    self.state = DecoderState::Size;
                }
                DecoderState::Trailer => {
                    // Trailer fields are discarded
                    let Some(eol) = find_crlf(rest) else { break };
                    pos += eol + 2;
                    if eol == 0 {
                        self.state = DecoderState::Complete;
                    }
                }
                DecoderState::Complete => break,
            }
        }

        Ok((pos, self.is_complete()))
    }

    pub fn is_complete(&self) -> bool {
        self.state == DecoderState::Complete
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
