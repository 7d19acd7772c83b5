//! Message framing for the game protocol.
//!
//! Every message on the wire carries a four byte header:
//!
//! ```text
//! +------------------+------------------+--------------------+
//! | length (u16 BE)  | type code (u16)  | payload            |
//! |                  |                  | (length bytes)     |
//! +------------------+------------------+--------------------+
//! ```
//!
//! The length covers the payload only. A whole frame (header included) may
//! never exceed [`MAX_PACKET_LEN`]; a peer claiming more is violating the
//! protocol and the caller is expected to drop it rather than wait for the
//! bytes to arrive.

pub const HEADER_LEN: usize = 4;

/// Largest frame, header included, that either side will send or accept.
pub const MAX_PACKET_LEN: usize = 1024;

pub const MAX_PAYLOAD_LEN: usize = MAX_PACKET_LEN - HEADER_LEN;

/// Errors raised while framing or deframing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// A header announced, or a caller tried to build, a frame above the limit.
    #[error("frame size {size} exceeds maximum {max}")]
    Oversized { size: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub len: u16,
    pub code: u16,
}

impl FrameHeader {
    /// Size of the complete frame this header announces.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.len as usize
    }

    pub fn validate(&self) -> Result<(), FrameError> {
        if self.frame_len() > MAX_PACKET_LEN {
            return Err(FrameError::Oversized {
                size: self.frame_len(),
                max: MAX_PACKET_LEN,
            });
        }
        Ok(())
    }
}

/// Reads the header at the front of `buf`, if four bytes are present.
pub fn peek_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    Some(FrameHeader {
        len: u16::from_be_bytes([buf[0], buf[1]]),
        code: u16::from_be_bytes([buf[2], buf[3]]),
    })
}

/// Writes a header into the first four bytes of `buf`.
pub fn write_header(buf: &mut [u8], len: u16, code: u16) {
    buf[0..2].copy_from_slice(&len.to_be_bytes());
    buf[2..4].copy_from_slice(&code.to_be_bytes());
}

/// A complete frame borrowed from a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub code: u16,
    pub payload: &'a [u8],
    /// Bytes of the buffer this frame occupied, header included.
    pub consumed: usize,
}

impl Frame<'_> {
    pub fn to_owned_frame(&self) -> OwnedFrame {
        OwnedFrame {
            code: self.code,
            payload: self.payload.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStatus<'a> {
    Complete(Frame<'a>),
    /// Not enough bytes yet; `needed` is the total the next frame requires.
    Incomplete { needed: usize },
}

/// Extracts the first frame of `buf`.
///
/// Only the leading frame is examined, so a buffer holding several frames
/// back to back is drained by calling this repeatedly and skipping
/// `consumed` bytes each time.
pub fn next_frame(buf: &[u8]) -> Result<FrameStatus<'_>, FrameError> {
    let Some(header) = peek_header(buf) else {
        return Ok(FrameStatus::Incomplete { needed: HEADER_LEN });
    };
    header.validate()?;

    let total = header.frame_len();
    if buf.len() < total {
        return Ok(FrameStatus::Incomplete { needed: total });
    }

    Ok(FrameStatus::Complete(Frame {
        code: header.code,
        payload: &buf[HEADER_LEN..total],
        consumed: total,
    }))
}

/// Builds a complete frame.
pub fn encode_frame(code: u16, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let total = HEADER_LEN + payload.len();
    if total > MAX_PACKET_LEN {
        return Err(FrameError::Oversized {
            size: total,
            max: MAX_PACKET_LEN,
        });
    }
    let mut frame = vec![0u8; HEADER_LEN];
    write_header(&mut frame, payload.len() as u16, code);
    frame.extend_from_slice(payload);
    Ok(frame)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedFrame {
    pub code: u16,
    pub payload: Vec<u8>,
}

/// Accumulates stream bytes and hands back whole frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    data: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Bytes held that do not yet form a complete frame.
    pub fn pending(&self) -> usize {
        self.data.len()
    }

    /// Pops the next complete frame, if any.
    pub fn next_frame(&mut self) -> Result<Option<OwnedFrame>, FrameError> {
        let (frame, consumed) = match next_frame(&self.data)? {
            FrameStatus::Complete(frame) => (frame.to_owned_frame(), frame.consumed),
            FrameStatus::Incomplete { .. } => return Ok(None),
        };
        self.data.drain(..consumed);
        Ok(Some(frame))
    }

    /// Removes `len` raw bytes from the front, for unframed preambles.
    pub fn take_raw(&mut self, len: usize) -> Option<Vec<u8>> {
        if self.data.len() < len {
            return None;
        }
        Some(self.data.drain(..len).collect())
    }
}

/// Splits a datagram that may hold several coalesced frames.
///
/// Stops at the first truncated or oversized frame; whatever preceded it is
/// still returned.
pub fn split_datagram(data: &[u8]) -> Vec<Frame<'_>> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        match next_frame(&data[offset..]) {
            Ok(FrameStatus::Complete(frame)) => {
                offset += frame.consumed;
                frames.push(frame);
            }
            _ => break,
        }
    }
    frames
}
