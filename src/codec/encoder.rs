//! Audio encoders for the AUDIO message payload

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::error::CodecError;
use crate::protocol::{AudioCodec, AudioFormat};

/// Turns one frame of mono samples into an AUDIO payload
pub trait AudioEncoder: Send {
    /// Codec announced in AUDIO_CONFIG and flagged on AUDIO messages
    fn codec(&self) -> AudioCodec;

    fn encode(&mut self, samples: &[i16]) -> Result<Bytes, CodecError>;

    fn stats(&self) -> EncoderStats;
}

/// Encoder statistics
#[derive(Debug, Clone, Default)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}

impl EncoderStats {
    fn record(&mut self, size: usize) {
        self.frames_encoded += 1;
        self.bytes_produced += size as u64;
        self.average_frame_size = self.bytes_produced as f32 / self.frames_encoded as f32;
    }
}

/// Raw little-endian signed 16-bit PCM
#[derive(Debug, Default)]
pub struct PcmEncoder {
    stats: EncoderStats,
}

impl PcmEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioEncoder for PcmEncoder {
    fn codec(&self) -> AudioCodec {
        AudioCodec::Pcm
    }

    fn encode(&mut self, samples: &[i16]) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(samples.len() * 2);
        for &sample in samples {
            buf.put_i16_le(sample);
        }
        self.stats.record(buf.len());
        Ok(buf.freeze())
    }

    fn stats(&self) -> EncoderStats {
        self.stats.clone()
    }
}

#[cfg(feature = "opus")]
pub use opus_encoder::OpusEncoder;

#[cfg(feature = "opus")]
mod opus_encoder {
    use bytes::Bytes;
    use opus::{Application, Channels, Encoder};

    use super::{AudioEncoder, EncoderStats};
    use crate::error::CodecError;
    use crate::protocol::{AudioCodec, AudioFormat};

    /// Voice bitrate in bits per second
    const VOICE_BITRATE: i32 = 24_000;

    /// Opus frame durations the encoder accepts, in tenths of a millisecond
    const VALID_FRAME_TENTHS_MS: [u32; 6] = [25, 50, 100, 200, 400, 600];

    /// Mono VoIP-tuned Opus encoder
    pub struct OpusEncoder {
        encoder: Encoder,
        frame_size: usize,
        /// Encoding buffer (reused to avoid allocations)
        encode_buffer: Vec<u8>,
        stats: EncoderStats,
    }

    impl OpusEncoder {
        pub fn new(format: &AudioFormat) -> Result<Self, CodecError> {
            if format.channels != 1 {
                return Err(CodecError::EncoderInit(format!(
                    "Unsupported channel count: {}",
                    format.channels
                )));
            }
            if !VALID_FRAME_TENTHS_MS.contains(&(format.frame_duration_ms * 10)) {
                return Err(CodecError::EncoderInit(format!(
                    "Unsupported frame duration: {} ms",
                    format.frame_duration_ms
                )));
            }

            let mut encoder = Encoder::new(format.sample_rate, Channels::Mono, Application::Voip)
                .map_err(|e| CodecError::EncoderInit(e.to_string()))?;
            encoder
                .set_bitrate(opus::Bitrate::Bits(VOICE_BITRATE))
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
            encoder
                .set_inband_fec(true)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

            Ok(Self {
                encoder,
                frame_size: format.samples_per_frame(),
                // Max Opus packet is about 1275 bytes
                encode_buffer: vec![0u8; 4000],
                stats: EncoderStats::default(),
            })
        }

        pub fn frame_size(&self) -> usize {
            self.frame_size
        }
    }

    impl AudioEncoder for OpusEncoder {
        fn codec(&self) -> AudioCodec {
            AudioCodec::Opus
        }

        fn encode(&mut self, samples: &[i16]) -> Result<Bytes, CodecError> {
            if samples.len() != self.frame_size {
                return Err(CodecError::InvalidFrameSize(samples.len()));
            }
            let size = self
                .encoder
                .encode(samples, &mut self.encode_buffer)
                .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;
            self.stats.record(size);
            Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
        }

        fn stats(&self) -> EncoderStats {
            self.stats.clone()
        }
    }
}

fn create_encoder(format: &AudioFormat) -> Result<Box<dyn AudioEncoder>, CodecError> {
    match format.codec {
        AudioCodec::Pcm => Ok(Box::new(PcmEncoder::new())),
        #[cfg(feature = "opus")]
        AudioCodec::Opus => Ok(Box::new(OpusEncoder::new(format)?)),
        #[cfg(not(feature = "opus"))]
        AudioCodec::Opus => Err(CodecError::Unavailable("opus")),
        AudioCodec::PcmS8 => Err(CodecError::Unavailable("pcm_s8")),
    }
}

/// Encoder for the requested codec, or PCM when it cannot be provided
pub fn select_encoder(format: &AudioFormat) -> Box<dyn AudioEncoder> {
    match create_encoder(format) {
        Ok(encoder) => encoder,
        Err(e) => {
            warn!(codec = format.codec.as_str(), "Falling back to PCM: {}", e);
            Box::new(PcmEncoder::new())
        }
    }
}
