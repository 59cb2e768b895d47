//! Message framing over a continuous byte stream.
//!
//! The stream carries self-delimited messages in one of two shapes: a JSON document
//! terminated by `\n`, or a 4-byte big-endian length followed by that many payload bytes.
//! `ReceiveBuffer` accumulates whatever the socket hands over and yields complete
//! frames one at a time, independent of how the bytes were split across reads.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FramingError;
use crate::NEWLINE;

pub const LENGTH_PREFIX_SIZE: usize = 4;
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

const CARRIAGE_RETURN: u8 = b'\r';

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    Newline,
    LengthPrefixed,
}

impl Default for Framing {
    fn default() -> Self {
        Framing::Newline
    }
}

impl Framing {
    /// Whether extraction can continue after a `FrameTooLong`. A delimiter lets the
    /// reader skip to the next boundary; an oversized length prefix leaves no boundary
    /// to find.
    pub fn resynchronizes(&self) -> bool {
        match self {
            Framing::Newline => true,
            Framing::LengthPrefixed => false,
        }
    }

    /// Append `payload` to `dst` as one frame.
    pub fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FramingError> {
        match self {
            Framing::Newline => {
                if payload.contains(&NEWLINE) {
                    return Err(FramingError::Malformed(
                        "payload contains a raw newline".to_string(),
                    ));
                }
                dst.reserve(payload.len() + 1);
                dst.put_slice(payload);
                dst.put_u8(NEWLINE);
            }
            Framing::LengthPrefixed => {
                if payload.len() > u32::MAX as usize {
                    return Err(FramingError::FrameTooLong {
                        length: payload.len(),
                        max: u32::MAX as usize,
                    });
                }
                dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
                dst.put_u32(payload.len() as u32);
                dst.put_slice(payload);
            }
        }
        Ok(())
    }
}

pub struct ReceiveBuffer {
    buf: BytesMut,
    framing: Framing,
    max_frame_length: usize,
    // bytes already searched for a delimiter, so rescans start where the last one ended
    scanned: usize,
    // set after an oversized line; input is dropped up to and including the next newline
    discarding: bool,
}

impl ReceiveBuffer {
    pub fn new(framing: Framing, max_frame_length: usize) -> ReceiveBuffer {
        Self {
            buf: BytesMut::new(),
            framing,
            max_frame_length,
            scanned: 0,
            discarding: false,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Direct access for `AsyncReadExt::read_buf`, which appends in place.
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    #[cfg(test)]
    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if the buffer holds one. `Ok(None)` means more bytes
    /// are needed; the partial data stays buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FramingError> {
        match self.framing {
            Framing::Newline => self.next_line(),
            Framing::LengthPrefixed => self.next_length_prefixed(),
        }
    }

    fn next_line(&mut self) -> Result<Option<Bytes>, FramingError> {
        loop {
            let newline_at = self.buf[self.scanned..]
                .iter()
                .position(|b| *b == NEWLINE)
                .map(|offset| self.scanned + offset);

            let end = match newline_at {
                Some(end) => end,
                None if self.discarding => {
                    self.buf.clear();
                    self.scanned = 0;
                    return Ok(None);
                }
                None if self.buf.len() > self.max_frame_length => {
                    let length = self.buf.len();
                    self.buf.clear();
                    self.scanned = 0;
                    self.discarding = true;
                    return Err(FramingError::FrameTooLong {
                        length,
                        max: self.max_frame_length,
                    });
                }
                None => {
                    self.scanned = self.buf.len();
                    return Ok(None);
                }
            };

            let mut line = self.buf.split_to(end + 1).freeze();
            self.scanned = 0;
            if self.discarding {
                self.discarding = false;
                continue;
            }

            line.truncate(end);
            if line.last() == Some(&CARRIAGE_RETURN) {
                line.truncate(end - 1);
            }
            if line.len() > self.max_frame_length {
                return Err(FramingError::FrameTooLong {
                    length: line.len(),
                    max: self.max_frame_length,
                });
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line));
        }
    }

    fn next_length_prefixed(&mut self) -> Result<Option<Bytes>, FramingError> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX_SIZE]);
        let length = u32::from_be_bytes(prefix) as usize;
        if length > self.max_frame_length {
            return Err(FramingError::FrameTooLong {
                length,
                max: self.max_frame_length,
            });
        }

        let frame_end = LENGTH_PREFIX_SIZE + length;
        if self.buf.len() < frame_end {
            self.buf.reserve(frame_end - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(self.buf.split_to(length).freeze()))
    }
}
