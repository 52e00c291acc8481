//! Length-prefixed framing for parcels.
//!
//! Every frame is a 4-byte big-endian body length followed by the
//! MessagePack-encoded [`Parcel`]. [`FrameDecoder`] reassembles frames from
//! an arbitrary byte stream:
//!
//! - a body that fails to decode is reported for that frame only; the next
//!   frame decodes normally,
//! - a length above the limit is reported once and the oversized body is
//!   skipped as it arrives, so the stream stays aligned.

use super::{Parcel, TransportError};

/// Size of the length prefix.
pub const LENGTH_FIELD_LEN: usize = 4;

/// Encodes `parcel` as one frame.
pub fn encode_frame(parcel: &Parcel, max_frame_length: usize) -> Result<Vec<u8>, TransportError> {
    let body = rmp_serde::to_vec(parcel).map_err(|err| TransportError::Encode(err.to_string()))?;
    if body.len() > max_frame_length {
        return Err(TransportError::FrameTooLarge {
            len: body.len(),
            max: max_frame_length,
        });
    }
    let len = u32::try_from(body.len()).map_err(|_| TransportError::FrameTooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(LENGTH_FIELD_LEN + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decodes one frame body.
pub fn decode_body(body: &[u8]) -> Result<Parcel, TransportError> {
    rmp_serde::from_slice(body).map_err(|err| TransportError::Corrupt {
        details: err.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    Data(usize),
    Skip(usize),
}

/// Incremental frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_length: usize,
    state: DecodeState,
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Creates a decoder rejecting frames above `max_frame_length`.
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            state: DecodeState::Head,
            buf: Vec::new(),
        }
    }

    /// Appends bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the number of buffered, not yet decoded bytes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extracts the next complete frame body.
    ///
    /// `Ok(None)` means more bytes are needed.
    pub fn next_body(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.state {
                DecodeState::Head => {
                    if self.buf.len() < LENGTH_FIELD_LEN {
                        return Ok(None);
                    }
                    let mut head = [0u8; LENGTH_FIELD_LEN];
                    head.copy_from_slice(&self.buf[..LENGTH_FIELD_LEN]);
                    self.buf.drain(..LENGTH_FIELD_LEN);
                    let len = u32::from_be_bytes(head) as usize;
                    if len > self.max_frame_length {
                        self.state = DecodeState::Skip(len);
                        return Err(TransportError::FrameTooLarge {
                            len,
                            max: self.max_frame_length,
                        });
                    }
                    self.state = DecodeState::Data(len);
                }
                DecodeState::Data(len) => {
                    if self.buf.len() < len {
                        return Ok(None);
                    }
                    let body: Vec<u8> = self.buf.drain(..len).collect();
                    self.state = DecodeState::Head;
                    return Ok(Some(body));
                }
                DecodeState::Skip(remaining) => {
                    let skipped = remaining.min(self.buf.len());
                    self.buf.drain(..skipped);
                    if skipped < remaining {
                        self.state = DecodeState::Skip(remaining - skipped);
                        return Ok(None);
                    }
                    self.state = DecodeState::Head;
                }
            }
        }
    }

    /// Decodes the next parcel, if a complete frame is buffered.
    ///
    /// An `Err` covers exactly one frame; calling again continues with the
    /// frame after it.
    pub fn decode(&mut self) -> Option<Result<Parcel, TransportError>> {
        match self.next_body() {
            Ok(Some(body)) => Some(decode_body(&body)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}
