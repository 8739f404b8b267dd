// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 evring contributors
//
// Incremental chunked-transfer-encoding parser. Input may be split at any
// byte boundary; the parser remembers a partially read size line or a
// partially delivered chunk body across calls and hands the sink payload
// bytes only.

use thiserror::Error;

use crate::hex;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum ChunkError {
    #[error("invalid chunk length digit {byte:#04x}")]
    InvalidLength { byte: u8 },
}

/// Result of a parse call.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ChunkProgress {
    /// The stream may have more chunks; feed more input.
    More,
    /// The zero-length terminator chunk was seen; the stream is complete
    /// and further input is ignored.
    Done,
}

#[derive(Debug, Clone, Copy)]
enum State {
    /// Accumulating size digits; `seen_digit` distinguishes leading
    /// framing bytes from the end of the size field.
    Size { value: u64, seen_digit: bool },
    /// Skipping the CR/LF between the size line and the payload.
    SizeTrailer { value: u64 },
    /// Delivering payload bytes.
    Payload { remaining: u64 },
    Done,
}

/// Stateful chunked-transfer parser.
pub struct ChunkedParser {
    state: State,
}

impl ChunkedParser {
    pub fn new() -> Self {
        Self {
            state: State::Size {
                value: 0,
                seen_digit: false,
            },
        }
    }

    /// Whether the terminator chunk has been seen.
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Consume `input`, delivering payload fragments to `sink`.
    ///
    /// The sink may be called any number of times per input window,
    /// including zero. Framing bytes (`\r`, `\n`, and space around the
    /// size field) are never delivered.
    pub fn parse(
        &mut self,
        input: &[u8],
        mut sink: impl FnMut(&[u8]),
    ) -> Result<ChunkProgress, ChunkError> {
        let mut rest = input;
        while !rest.is_empty() {
            match self.state {
                State::Size {
                    mut value,
                    mut seen_digit,
                } => {
                    let mut consumed = 0;
                    for &byte in rest {
                        consumed += 1;
                        if let Some(digit) = hex::digit_value(byte) {
                            value = (value << 4) | digit as u64;
                            seen_digit = true;
                        } else if byte == b'\r' || byte == b'\n' || byte == b' ' {
                            if seen_digit {
                                self.state = State::SizeTrailer { value };
                                break;
                            }
                            // Leading framing before the size — skip.
                        } else {
                            return Err(ChunkError::InvalidLength { byte });
                        }
                    }
                    if matches!(self.state, State::Size { .. }) {
                        // Ran out of input mid-size-line; remember progress.
                        self.state = State::Size { value, seen_digit };
                    }
                    rest = &rest[consumed..];
                }
                State::SizeTrailer { value } => {
                    let mut consumed = 0;
                    for &byte in rest {
                        if byte == b'\r' || byte == b'\n' {
                            consumed += 1;
                        } else {
                            break;
                        }
                    }
                    rest = &rest[consumed..];
                    if !rest.is_empty() || consumed > 0 {
                        // Only leave the trailer once a payload byte is in
                        // sight or the terminator was a bare size line.
                        if value == 0 {
                            self.state = State::Done;
                        } else if !rest.is_empty() {
                            self.state = State::Payload { remaining: value };
                        }
                    }
                    if rest.is_empty() {
                        break;
                    }
                }
                State::Payload { remaining } => {
                    let take = (remaining.min(rest.len() as u64)) as usize;
                    sink(&rest[..take]);
                    rest = &rest[take..];
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        State::Size {
                            value: 0,
                            seen_digit: false,
                        }
                    } else {
                        State::Payload { remaining }
                    };
                }
                State::Done => break,
            }
        }
        Ok(if self.is_done() {
            ChunkProgress::Done
        } else {
            ChunkProgress::More
        })
    }
}

impl Default for ChunkedParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(parser: &mut ChunkedParser, input: &[u8]) -> (Vec<u8>, ChunkProgress) {
        let mut out = Vec::new();
        let progress = parser
            .parse(input, |payload| out.extend_from_slice(payload))
            .expect("parse");
        (out, progress)
    }

    #[test]
    fn single_chunk() {
        let mut parser = ChunkedParser::new();
        let (out, progress) = collect(&mut parser, b"5\r\nhello\r\n0\r\n\r\n");
        assert_eq!(out, b"hello");
        assert_eq!(progress, ChunkProgress::Done);
    }

    #[test]
    fn multiple_chunks() {
        let mut parser = ChunkedParser::new();
        let (out, progress) = collect(&mut parser, b"3\r\nfoo\r\n4\r\nbars\r\n0\r\n");
        assert_eq!(out, b"foobars");
        assert_eq!(progress, ChunkProgress::Done);
    }

    #[test]
    fn hex_sizes() {
        let mut parser = ChunkedParser::new();
        let payload = vec![b'x'; 0x1a];
        let mut input = b"1A\r\n".to_vec();
        input.extend_from_slice(&payload);
        input.extend_from_slice(b"\r\n0\r\n");
        let (out, progress) = collect(&mut parser, &input);
        assert_eq!(out, payload);
        assert_eq!(progress, ChunkProgress::Done);
    }

    #[test]
    fn payload_split_across_calls() {
        let mut parser = ChunkedParser::new();
        let (out, progress) = collect(&mut parser, b"6\r\nhel");
        assert_eq!(out, b"hel");
        assert_eq!(progress, ChunkProgress::More);
        let (out, progress) = collect(&mut parser, b"lo!\r\n0\r\n");
        assert_eq!(out, b"lo!");
        assert_eq!(progress, ChunkProgress::Done);
    }

    #[test]
    fn size_line_split_across_calls() {
        let mut parser = ChunkedParser::new();
        let (out, progress) = collect(&mut parser, b"1");
        assert!(out.is_empty());
        assert_eq!(progress, ChunkProgress::More);
        // "1" + "0" = chunk of 0x10 bytes
        let mut input = b"0\r\n".to_vec();
        input.extend_from_slice(&[b'y'; 0x10]);
        input.extend_from_slice(b"\r\n0\r\n");
        let (out, progress) = collect(&mut parser, &input);
        assert_eq!(out, vec![b'y'; 0x10]);
        assert_eq!(progress, ChunkProgress::Done);
    }

    #[test]
    fn byte_at_a_time() {
        let mut parser = ChunkedParser::new();
        let input = b"4\r\nabcd\r\n2\r\nef\r\n0\r\n";
        let mut out = Vec::new();
        let mut last = ChunkProgress::More;
        for &byte in input.iter() {
            last = parser
                .parse(&[byte], |payload| out.extend_from_slice(payload))
                .expect("parse");
        }
        assert_eq!(out, b"abcdef");
        assert_eq!(last, ChunkProgress::Done);
    }

    #[test]
    fn invalid_size_digit() {
        let mut parser = ChunkedParser::new();
        let err = parser.parse(b"zz\r\n", |_| {}).unwrap_err();
        assert_eq!(err, ChunkError::InvalidLength { byte: b'z' });
    }

    #[test]
    fn input_after_terminator_is_ignored() {
        let mut parser = ChunkedParser::new();
        let (_, progress) = collect(&mut parser, b"0\r\n");
        assert_eq!(progress, ChunkProgress::Done);
        let (out, progress) = collect(&mut parser, b"5\r\nhello\r\n");
        assert!(out.is_empty());
        assert_eq!(progress, ChunkProgress::Done);
    }
}
