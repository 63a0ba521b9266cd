//! Single-frame encode/decode
//!
//! Pure functions: no state is carried between calls.

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    Message, MessageFlags, MessageKind, CHECKSUM_SIZE, HEADER_SIZE, MAX_PAYLOAD_SIZE,
    MIN_FRAME_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
use crate::error::ProtocolError;

const CRC16_POLY: u16 = 0x1021;
const CRC16_INIT: u16 = 0xFFFF;

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC16_TABLE: [u16; 256] = build_crc16_table();

/// CRC-16/CCITT-FALSE (init 0xFFFF, poly 0x1021, MSB first, no final xor)
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(CRC16_INIT, |crc, &byte| {
        (crc << 8) ^ CRC16_TABLE[usize::from((crc >> 8) as u8 ^ byte)]
    })
}

/// Total framed size for a payload of `payload_len` bytes
pub fn encoded_len(payload_len: usize) -> usize {
    HEADER_SIZE + payload_len + CHECKSUM_SIZE
}

/// Encode a message into a complete wire frame
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let payload_len = message.payload.len();
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload_len));
    }

    let mut buf = BytesMut::with_capacity(encoded_len(payload_len));
    buf.put_u8(PROTOCOL_MAGIC);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(message.kind.as_u8());
    buf.put_u8(message.flags.bits());
    buf.put_u16_le(payload_len as u16);
    buf.put_u32_le(message.timestamp);
    buf.put_slice(&message.payload);

    let crc = crc16(&buf);
    buf.put_u16_le(crc);

    Ok(buf.freeze())
}

/// Fields of a validated header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub kind: MessageKind,
    pub flags: MessageFlags,
    pub payload_len: usize,
    pub timestamp: u32,
}

impl FrameHeader {
    /// Parse and validate the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// The declared length is checked against the maximum before any payload
    /// byte is looked at.
    pub(crate) fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::BufferTooSmall {
                needed: HEADER_SIZE,
                got: buf.len(),
            });
        }
        if buf[0] != PROTOCOL_MAGIC {
            return Err(ProtocolError::InvalidMagic(buf[0]));
        }
        if buf[1] != PROTOCOL_VERSION {
            return Err(ProtocolError::InvalidVersion(buf[1]));
        }

        let payload_len = u16::from_le_bytes([buf[4], buf[5]]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(payload_len));
        }

        Ok(Self {
            kind: MessageKind::from_u8(buf[2]),
            flags: MessageFlags::from_bits(buf[3]),
            payload_len,
            timestamp: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }

    pub(crate) fn frame_len(&self) -> usize {
        encoded_len(self.payload_len)
    }
}

/// Decode one frame from the start of `buf`. Bytes after the frame are ignored.
pub fn decode(buf: &[u8]) -> Result<Message, ProtocolError> {
    if buf.len() < MIN_FRAME_SIZE {
        return Err(ProtocolError::BufferTooSmall {
            needed: MIN_FRAME_SIZE,
            got: buf.len(),
        });
    }

    let header = FrameHeader::parse(buf)?;
    let frame_len = header.frame_len();
    if buf.len() < frame_len {
        return Err(ProtocolError::BufferTooSmall {
            needed: frame_len,
            got: buf.len(),
        });
    }

    let body_end = HEADER_SIZE + header.payload_len;
    let expected = u16::from_le_bytes([buf[body_end], buf[body_end + 1]]);
    let actual = crc16(&buf[..body_end]);
    if expected != actual {
        return Err(ProtocolError::ChecksumMismatch { expected, actual });
    }

    Ok(Message {
        kind: header.kind,
        flags: header.flags,
        payload: Bytes::copy_from_slice(&buf[HEADER_SIZE..body_end]),
        timestamp: header.timestamp,
    })
}
