//! Line codec for engine output pipes.
//!
//! Frames a byte stream into `\n`-terminated lines for
//! [`tokio_util::codec::FramedRead`]. It differs from
//! [`LinesCodec`](tokio_util::codec::LinesCodec) in two ways:
//!
//! - Bytes that are not valid UTF-8 are replaced with U+FFFD instead of
//!   failing the stream. File names in download logs are not guaranteed to be
//!   UTF-8.
//! - A line longer than the limit is dropped with a warning and framing
//!   resumes after its newline. The stream keeps going.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::warn;

use crate::{AppError, Result};

/// Maximum accepted line length: 64 KiB.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Lossy, length-limited line decoder.
#[derive(Debug)]
pub struct LogLineCodec {
    max_length: usize,
    /// Offset up to which `src` is known to hold no newline.
    next_index: usize,
    /// Inside an overlong line; skip until the next newline.
    discarding: bool,
}

impl LogLineCodec {
    /// Codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Codec with a custom line limit.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for LogLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LogLineCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| offset + self.next_index);

            match newline {
                Some(pos) if self.discarding => {
                    src.advance(pos + 1);
                    self.next_index = 0;
                    self.discarding = false;
                }
                Some(pos) if pos > self.max_length => {
                    warn!(
                        limit = self.max_length,
                        "engine output line too long, discarding"
                    );
                    src.advance(pos + 1);
                    self.next_index = 0;
                }
                Some(pos) => {
                    let line = src.split_to(pos + 1);
                    self.next_index = 0;
                    return Ok(Some(decode_line(&line[..pos])));
                }
                None if self.discarding => {
                    src.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                None if src.len() > self.max_length => {
                    warn!(
                        limit = self.max_length,
                        "engine output line too long, discarding"
                    );
                    src.clear();
                    self.next_index = 0;
                    self.discarding = true;
                    return Ok(None);
                }
                None => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        self.next_index = 0;
        if self.discarding || src.is_empty() {
            src.clear();
            self.discarding = false;
            return Ok(None);
        }

        let rest = src.split_to(src.len());
        Ok(Some(decode_line(&rest)))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
