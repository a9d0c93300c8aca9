//! Newline-delimited frame codec for the wire protocol.
//!
//! Each frame is one complete value in the textual object notation,
//! terminated by `\n`. Frames longer than the limit are discarded rather
//! than buffered without bound.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Default ceiling on a single frame, in bytes.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// A codec for newline-delimited frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_length: usize,
}

impl FrameCodec {
    pub const fn new() -> Self {
        FrameCodec {
            max_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    /// Any frame longer than `max_length` bytes is discarded entirely.
    #[allow(dead_code)]
    pub const fn new_with_max_length(max_length: usize) -> Self {
        FrameCodec { max_length }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        loop {
            match buf.iter().position(|&byte| byte == b'\n') {
                None => {
                    if buf.len() > self.max_length {
                        warn!(
                            buf_len = buf.len(),
                            max_length = self.max_length,
                            "discarding oversized partial frame"
                        );
                        buf.clear();
                    }
                    return Ok(None);
                }
                Some(newline_idx) => {
                    if newline_idx > self.max_length {
                        warn!(
                            frame_len = newline_idx,
                            max_length = self.max_length,
                            "discarding frame larger than max length"
                        );
                        buf.advance(newline_idx + 1);
                    } else {
                        let mut frame = buf.split_to(newline_idx).freeze();
                        buf.advance(1);
                        // Tolerate CRLF line endings.
                        if frame.last() == Some(&b'\r') {
                            frame.truncate(frame.len() - 1);
                        }
                        return Ok(Some(frame));
                    }
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => {
                // A final unterminated frame.
                let frame = buf.split().freeze();
                Ok(Some(frame))
            }
        }
    }
}

impl Encoder<String> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: String, buf: &mut BytesMut) -> Result<(), Self::Error> {
        buf.reserve(frame.len() + 1);
        buf.extend_from_slice(frame.as_bytes());
        buf.extend_from_slice(b"\n");
        Ok(())
    }
}
