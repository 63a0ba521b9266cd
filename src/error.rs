//! Error types for the session core

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire framing errors
///
/// All of these are recoverable: the offending frame is discarded and the
/// stream resynchronizes on the next magic byte.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    #[error("Invalid magic byte: {0:#04x}")]
    InvalidMagic(u8),

    #[error("Invalid protocol version: {0}")]
    InvalidVersion(u8),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Checksum mismatch: frame carries {expected:#06x}, computed {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Sample read failed: {0}")]
    ReadFailed(String),

    #[error("Capture already running")]
    AlreadyRunning,

    #[error("Invalid audio configuration: {0}")]
    InvalidConfig(String),
}

/// Outgoing audio encoder errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("Codec not available in this build: {0}")]
    Unavailable(&'static str),
}

/// State machine transition failures
///
/// Neither variant mutates the machine. Retrying without changing the
/// triggering condition fails the same way.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    #[error("A transition is already in progress")]
    InProgress,

    #[error("Target state is not registered")]
    UnknownState,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
