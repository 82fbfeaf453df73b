//! Frame encoding and decoding.
//!
//! Layout, multi-byte fields big-endian:
//!
//! ```text
//! +------+--------+--------+--------+---------+-------+
//! | 0xA5 | opcode | status | length | payload | crc-8 |
//! |  1   |   1    |   2    |   2    |    N    |   1   |
//! +------+--------+--------+--------+---------+-------+
//! ```
//!
//! The CRC covers everything between the sync byte and the CRC itself.
//! A bad sync byte, unknown opcode or CRC mismatch is reported as
//! [`FrameError::Malformed`]; since the protocol has no resynchronization
//! marker beyond the sync byte, the session treats this as fatal.

use bytes::{BufMut, Bytes, BytesMut};
use crc_all::Crc;
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::{ErrorCode, Opcode, StatusFlags};
use crate::tracing::prelude::*;

pub const SYNC: u8 = 0xA5;
pub const HEADER_LEN: usize = 6;
pub const CRC_LEN: usize = 1;
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Errors raised while encoding or decoding frames.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("{0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameError> for crate::error::Error {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Malformed(msg) => crate::error::Error::MalformedFrame(msg),
            FrameError::Io(e) => crate::error::Error::ConnectionLost(e.to_string()),
        }
    }
}

/// One complete unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub status: StatusFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Request frame with an empty status field.
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            status: StatusFlags::empty(),
            payload: payload.into(),
        }
    }

    /// Request frame without payload.
    pub fn empty(opcode: Opcode) -> Self {
        Self::new(opcode, Bytes::new())
    }

    pub fn with_status(mut self, status: StatusFlags) -> Self {
        self.status = status;
        self
    }

    pub fn is_error(&self) -> bool {
        self.status.contains(StatusFlags::ERROR)
    }

    /// Error sub-code, present only when the error flag is set and the
    /// code is one the host knows.
    pub fn error_code(&self) -> Option<ErrorCode> {
        if !self.is_error() {
            return None;
        }
        self.payload.first().and_then(|&b| ErrorCode::from_repr(b))
    }

    /// Number of bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + CRC_LEN
    }
}

fn crc8(bytes: &[u8]) -> u8 {
    const POLYNOMIAL: u8 = 0x07;
    const WIDTH: usize = 8;
    const INITIAL: u8 = 0x00;
    const XOR: u8 = 0;
    const REFLECT: bool = false;
    let mut crc8 = Crc::<u8>::new(POLYNOMIAL, WIDTH, INITIAL, XOR, REFLECT);

    crc8.update(bytes);
    crc8.finish()
}

fn put_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
    if frame.payload.len() > MAX_PAYLOAD {
        return Err(FrameError::Malformed(format!(
            "{} payload of {} bytes exceeds {} bytes",
            frame.opcode,
            frame.payload.len(),
            MAX_PAYLOAD
        )));
    }

    dst.reserve(frame.wire_len());
    let start = dst.len();
    dst.put_u8(SYNC);
    dst.put_u8(frame.opcode.as_u8());
    dst.put_u16(frame.status.bits());
    dst.put_u16(frame.payload.len() as u16);
    dst.put_slice(&frame.payload);
    let crc = crc8(&dst[start + 1..]);
    dst.put_u8(crc);
    Ok(())
}

/// Parse exactly one frame occupying all of `raw`.
fn parse(raw: &[u8]) -> Result<Frame, FrameError> {
    let total = raw.len();
    let expected = crc8(&raw[1..total - CRC_LEN]);
    let actual = raw[total - CRC_LEN];
    if expected != actual {
        return Err(FrameError::Malformed(format!(
            "CRC mismatch: expected 0x{expected:02x}, got 0x{actual:02x}"
        )));
    }

    let opcode = Opcode::from_repr(raw[1])
        .ok_or_else(|| FrameError::Malformed(format!("unknown opcode 0x{:02x}", raw[1])))?;
    let status = StatusFlags::from_bits_retain(u16::from_be_bytes([raw[2], raw[3]]));
    let payload = Bytes::copy_from_slice(&raw[HEADER_LEN..total - CRC_LEN]);

    Ok(Frame {
        opcode,
        status,
        payload,
    })
}

/// Whether the trailing CRC of one complete raw frame matches.
pub fn crc_is_valid(raw: &[u8]) -> bool {
    let total = raw.len();
    total >= HEADER_LEN + CRC_LEN && crc8(&raw[1..total - CRC_LEN]) == raw[total - CRC_LEN]
}

/// Encode a request frame.
pub fn encode(opcode: Opcode, payload: &[u8]) -> Result<BytesMut, FrameError> {
    let mut dst = BytesMut::new();
    put_frame(&Frame::new(opcode, Bytes::copy_from_slice(payload)), &mut dst)?;
    Ok(dst)
}

/// Decode a buffer holding exactly one frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() < HEADER_LEN + CRC_LEN {
        return Err(FrameError::Malformed(format!(
            "frame of {} bytes is shorter than the {} byte minimum",
            bytes.len(),
            HEADER_LEN + CRC_LEN
        )));
    }
    if bytes[0] != SYNC {
        return Err(FrameError::Malformed(format!(
            "bad sync byte 0x{:02x}",
            bytes[0]
        )));
    }
    let len = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
    if bytes.len() != HEADER_LEN + len + CRC_LEN {
        return Err(FrameError::Malformed(format!(
            "length field says {} payload bytes but frame carries {}",
            len,
            bytes.len() - HEADER_LEN - CRC_LEN
        )));
    }
    parse(bytes)
}

/// Streaming codec used with `FramedRead`/`FramedWrite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        trace!(
            opcode = %frame.opcode,
            status = ?frame.status,
            len = frame.payload.len(),
            "tx frame"
        );
        put_frame(&frame, dst)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };
        if first != SYNC {
            return Err(FrameError::Malformed(format!("bad sync byte 0x{first:02x}")));
        }
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let len = u16::from_be_bytes([src[4], src[5]]) as usize;
        let total = HEADER_LEN + len + CRC_LEN;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let raw = src.split_to(total);
        let frame = parse(&raw)?;
        trace!(
            opcode = %frame.opcode,
            status = ?frame.status,
            len = frame.payload.len(),
            "rx frame"
        );
        Ok(Some(frame))
    }
}
