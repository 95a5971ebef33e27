use std::fmt;

use bytes::Buf;

use crate::buffer::RingBuffer;
use crate::{AppError, AppResult};

/// Size of the packed wire header: `kind: i16` + `length: u16`.
pub const HEADER_SIZE: usize = 4;

/// Upper bound on the payload carried by a single frame.
pub const MAX_PAYLOAD_SIZE: usize = 65535;

/// Well-known values of the header `kind` field. The engine never routes on
/// the kind; unknown values pass through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum FrameKind {
    System = 0,
    User = 1,
}

impl FrameKind {
    pub fn from_raw(raw: i16) -> Option<FrameKind> {
        match raw {
            0 => Some(FrameKind::System),
            1 => Some(FrameKind::User),
            _ => None,
        }
    }
}

/// Decoded frame header. On the wire both fields are little-endian with no
/// padding between header and payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: i16,
    pub length: u16,
}

impl FrameHeader {
    pub fn decode(mut raw: &[u8]) -> FrameHeader {
        FrameHeader {
            kind: raw.get_i16_le(),
            length: raw.get_u16_le(),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        raw[..2].copy_from_slice(&self.kind.to_le_bytes());
        raw[2..].copy_from_slice(&self.length.to_le_bytes());
        raw
    }

    /// Total wire size of the frame this header announces.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.length as usize
    }

    /// Validate the peer-controlled length against the receive buffer bound.
    /// A frame that could never fit is a protocol violation, fatal for the
    /// session that sent it.
    pub fn check(&self, max_frame: usize) -> AppResult<()> {
        if self.frame_len() > max_frame {
            return Err(AppError::FrameTooLarge(self.frame_len()));
        }
        Ok(())
    }

    /// Check whether the ring holds one complete frame, returning its header.
    /// `Incomplete` is the need-more-bytes marker; any other error means the
    /// stream is unsalvageable for this session.
    pub(crate) fn check_ring(ring: &RingBuffer) -> AppResult<FrameHeader> {
        if ring.size_in_use() <= HEADER_SIZE {
            return Err(AppError::Incomplete);
        }
        let mut raw = [0u8; HEADER_SIZE];
        if !ring.peek(&mut raw) {
            return Err(AppError::Incomplete);
        }
        let header = FrameHeader::decode(&raw[..]);
        header.check(ring.capacity())?;
        if ring.size_in_use() < header.frame_len() {
            return Err(AppError::Incomplete);
        }
        Ok(header)
    }
}

/// A pooled, reusable frame buffer: the encoded header and the payload live
/// in one contiguous allocation, so the whole frame is a single gather slice
/// for a batched send. The header bytes are kept current on every mutation;
/// the length field in the buffer is the only record of the payload size.
pub struct Message {
    buf: Box<[u8]>,
}

impl Message {
    pub fn new() -> Message {
        let mut buf = vec![0u8; HEADER_SIZE + MAX_PAYLOAD_SIZE].into_boxed_slice();
        buf[..2].copy_from_slice(&(FrameKind::User as i16).to_le_bytes());
        Message { buf }
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader::decode(&self.buf[..HEADER_SIZE])
    }

    pub fn kind(&self) -> i16 {
        i16::from_le_bytes([self.buf[0], self.buf[1]])
    }

    pub fn set_kind(&mut self, kind: FrameKind) {
        self.set_raw_kind(kind as i16);
    }

    pub fn set_raw_kind(&mut self, kind: i16) {
        self.buf[..2].copy_from_slice(&kind.to_le_bytes());
    }

    pub fn payload_len(&self) -> usize {
        u16::from_le_bytes([self.buf[2], self.buf[3]]) as usize
    }

    fn set_payload_len(&mut self, len: usize) {
        self.buf[2..HEADER_SIZE].copy_from_slice(&(len as u16).to_le_bytes());
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..HEADER_SIZE + self.payload_len()]
    }

    /// Append payload bytes. Rejected if the message would exceed
    /// [`MAX_PAYLOAD_SIZE`].
    pub fn put(&mut self, payload: &[u8]) -> bool {
        let len = self.payload_len();
        if len + payload.len() > MAX_PAYLOAD_SIZE {
            return false;
        }
        self.buf[HEADER_SIZE + len..HEADER_SIZE + len + payload.len()].copy_from_slice(payload);
        self.set_payload_len(len + payload.len());
        true
    }

    /// Zero the payload length. The payload bytes themselves are left behind
    /// and overwritten by the next producer.
    pub fn reset(&mut self) {
        self.set_payload_len(0);
    }

    /// The wire image of the frame: header plus payload.
    pub fn frame_bytes(&self) -> &[u8] {
        &self.buf[..HEADER_SIZE + self.payload_len()]
    }

    /// Raw frame region for the parser to copy a received frame into.
    /// `len` covers header and payload and must already be validated.
    pub(crate) fn frame_region_mut(&mut self, len: usize) -> &mut [u8] {
        &mut self.buf[..len]
    }
}

impl Default for Message {
    fn default() -> Message {
        Message::new()
    }
}

impl super::Reusable for Message {
    fn reset(&mut self) {
        Message::reset(self);
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind())
            .field("payload_len", &self.payload_len())
            .finish()
    }
}
