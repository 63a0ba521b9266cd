//! Binary message protocol between the device and the gateway bridge
//!
//! ## Frame layout
//!
//! ```text
//! ┌───────┬─────────┬──────┬───────┬─────────────┬─────────────┬─────────────┬──────────┐
//! │ Magic │ Version │ Kind │ Flags │ Payload Len │ Timestamp   │ Payload     │ CRC16    │
//! │ 1 byte│ 1 byte  │1 byte│1 byte │ 2 bytes LE  │ 4 bytes LE  │ N bytes     │2 bytes LE│
//! └───────┴─────────┴──────┴───────┴─────────────┴─────────────┴─────────────┴──────────┘
//! ```
//!
//! The checksum is CRC-16/CCITT-FALSE over every byte from the magic byte
//! through the last payload byte.

pub mod codec;
pub mod parser;
pub mod payload;

pub use codec::{crc16, decode, encode, encoded_len};
pub use parser::{ParseState, StreamReassembler};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// First byte of every frame ('O')
pub const PROTOCOL_MAGIC: u8 = 0x4F;

/// Protocol version carried in the second byte
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed bytes before the payload: magic, version, kind, flags, length, timestamp
pub const HEADER_SIZE: usize = 10;

/// Trailing CRC16
pub const CHECKSUM_SIZE: usize = 2;

/// Largest payload a frame may declare
pub const MAX_PAYLOAD_SIZE: usize = 8192;

/// Smallest complete frame (empty payload)
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + CHECKSUM_SIZE;

/// Largest complete frame
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE + CHECKSUM_SIZE;

/// Message kinds
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    // Connection management
    Auth = 0x01,
    AuthResponse = 0x02,
    Ping = 0x03,
    Pong = 0x04,

    // Data
    Text = 0x10,
    Audio = 0x11,
    Response = 0x12,
    ResponseFinal = 0x13,

    // Control
    Status = 0x20,
    Command = 0x21,
    Error = 0x22,

    AudioConfig = 0x30,

    Unknown = 0xFF,
}

impl MessageKind {
    /// Map a wire ordinal to a kind. Unrecognised ordinals become `Unknown`.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x01 => MessageKind::Auth,
            0x02 => MessageKind::AuthResponse,
            0x03 => MessageKind::Ping,
            0x04 => MessageKind::Pong,
            0x10 => MessageKind::Text,
            0x11 => MessageKind::Audio,
            0x12 => MessageKind::Response,
            0x13 => MessageKind::ResponseFinal,
            0x20 => MessageKind::Status,
            0x21 => MessageKind::Command,
            0x22 => MessageKind::Error,
            0x30 => MessageKind::AudioConfig,
            _ => MessageKind::Unknown,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Auth => "AUTH",
            MessageKind::AuthResponse => "AUTH_RESPONSE",
            MessageKind::Ping => "PING",
            MessageKind::Pong => "PONG",
            MessageKind::Text => "TEXT",
            MessageKind::Audio => "AUDIO",
            MessageKind::Response => "RESPONSE",
            MessageKind::ResponseFinal => "RESPONSE_FINAL",
            MessageKind::Status => "STATUS",
            MessageKind::Command => "COMMAND",
            MessageKind::Error => "ERROR",
            MessageKind::AudioConfig => "AUDIO_CONFIG",
            MessageKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory per-message flags. Only `FINAL` changes core behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const NONE: Self = Self(0x00);
    pub const ENCRYPTED: Self = Self(0x01);
    pub const COMPRESSED: Self = Self(0x02);
    pub const BINARY: Self = Self(0x04);
    /// Last chunk of a streamed payload
    pub const FINAL: Self = Self(0x08);
    pub const ACK_REQUIRED: Self = Self(0x10);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn is_final(self) -> bool {
        self.contains(Self::FINAL)
    }

    pub fn is_binary(self) -> bool {
        self.contains(Self::BINARY)
    }
}

impl BitOr for MessageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for MessageFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One unit of communication
///
/// The payload is an owned buffer sized to its content. Messages are not
/// mutated once handed to the codec or to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub flags: MessageFlags,
    pub payload: Bytes,
    /// Milliseconds, captured when the message is built for sending
    pub timestamp: u32,
}

impl Message {
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>, timestamp: u32) -> Self {
        Self {
            kind,
            flags: MessageFlags::NONE,
            payload: payload.into(),
            timestamp,
        }
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Size of this message once framed
    pub fn encoded_len(&self) -> usize {
        encoded_len(self.payload.len())
    }

    pub fn is_final(&self) -> bool {
        self.flags.is_final()
    }

    /// Payload as UTF-8 text, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Codec identifiers announced in `AUDIO_CONFIG` and `AUDIO` payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    /// 16-bit little-endian PCM, no compression
    #[default]
    Pcm,
    /// 8-bit PCM
    #[serde(rename = "pcm_s8")]
    PcmS8,
    Opus,
}

impl AudioCodec {
    pub fn as_str(self) -> &'static str {
        match self {
            AudioCodec::Pcm => "pcm",
            AudioCodec::PcmS8 => "pcm_s8",
            AudioCodec::Opus => "opus",
        }
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of the outgoing audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub codec: AudioCodec,
    pub frame_duration_ms: u32,
}

impl AudioFormat {
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    /// Raw bytes of one uncompressed frame across all channels
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * self.channels as usize * (self.bits_per_sample as usize / 8)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            bits_per_sample: 16,
            codec: AudioCodec::Pcm,
            frame_duration_ms: 60,
        }
    }
}
