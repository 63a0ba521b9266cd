//! Outgoing audio encoding
//!
//! Voiced frames are encoded just before they are framed as AUDIO messages.
//! PCM is always available; Opus needs the `opus` feature and falls back to
//! PCM when it cannot be created.

pub mod encoder;

pub use encoder::{select_encoder, AudioEncoder, EncoderStats, PcmEncoder};

#[cfg(feature = "opus")]
pub use encoder::OpusEncoder;
