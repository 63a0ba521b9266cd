//! Fixed-duration frame assembly
//!
//! Raw chunks of any length are accumulated until exactly one frame's worth
//! of samples is buffered. Each full frame gets gain, one VAD step, and is
//! forwarded only when the VAD calls it voiced.

use crate::audio::buffer::AudioFrame;
use crate::audio::vad::{VadConfig, VadEngine, VadEvent, VadState};
use crate::error::AudioError;

/// Gain value that leaves samples untouched
pub const NEUTRAL_GAIN: u8 = 64;

/// Largest accepted gain setting
pub const MAX_GAIN: u8 = 100;

/// Scale samples by `gain / NEUTRAL_GAIN`, saturating at the i16 range
pub fn apply_gain(samples: &mut [i16], gain: u8) {
    if gain == NEUTRAL_GAIN {
        return;
    }
    let factor = f32::from(gain) / f32::from(NEUTRAL_GAIN);
    for sample in samples.iter_mut() {
        let scaled = (f32::from(*sample) * factor) as i32;
        *sample = scaled.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
    }
}

/// A completed frame and what the VAD made of it
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledFrame {
    pub frame: AudioFrame,
    pub event: Option<VadEvent>,
}

impl AssembledFrame {
    /// Silence is never forwarded
    pub fn is_forwarded(&self) -> bool {
        self.frame.vad.is_voiced()
    }
}

pub struct FrameAssembler {
    sample_rate: u32,
    samples_per_frame: usize,
    gain: u8,
    buffer: Vec<i16>,
    /// Capture time of the first buffered sample
    buffer_start: u64,
    vad: VadEngine,
    sequence: u32,
}

impl FrameAssembler {
    pub fn new(
        sample_rate: u32,
        frame_duration_ms: u32,
        gain: u8,
        vad: VadConfig,
    ) -> Result<Self, AudioError> {
        let samples_per_frame = (sample_rate as usize * frame_duration_ms as usize) / 1000;
        if samples_per_frame == 0 {
            return Err(AudioError::InvalidConfig(format!(
                "{} ms at {} Hz yields an empty frame",
                frame_duration_ms, sample_rate
            )));
        }

        Ok(Self {
            sample_rate,
            samples_per_frame,
            gain: gain.min(MAX_GAIN),
            buffer: Vec::with_capacity(samples_per_frame),
            buffer_start: 0,
            vad: VadEngine::new(vad),
            sequence: 0,
        })
    }

    /// Append a chunk whose first sample was captured at `timestamp` ms.
    /// Returns every frame the chunk completed, voiced or not.
    pub fn push(&mut self, mut chunk: &[i16], timestamp: u64) -> Vec<AssembledFrame> {
        let mut completed = Vec::new();
        let mut offset = 0usize;

        while !chunk.is_empty() {
            if self.buffer.is_empty() {
                self.buffer_start = timestamp + self.samples_to_ms(offset);
            }

            let take = (self.samples_per_frame - self.buffer.len()).min(chunk.len());
            self.buffer.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
            offset += take;

            if self.buffer.len() == self.samples_per_frame {
                completed.push(self.finish_frame());
            }
        }

        completed
    }

    fn finish_frame(&mut self) -> AssembledFrame {
        let mut samples = std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.samples_per_frame),
        );
        apply_gain(&mut samples, self.gain);

        let decision = self.vad.process(&samples, self.buffer_start);
        let frame = AudioFrame::new(
            samples,
            self.buffer_start,
            decision.level,
            decision.state,
            self.sequence,
        );
        self.sequence = self.sequence.wrapping_add(1);

        AssembledFrame {
            frame,
            event: decision.event,
        }
    }

    fn samples_to_ms(&self, samples: usize) -> u64 {
        (samples as u64 * 1000) / u64::from(self.sample_rate)
    }

    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn gain(&self) -> u8 {
        self.gain
    }

    pub fn set_gain(&mut self, gain: u8) {
        self.gain = gain.min(MAX_GAIN);
    }

    pub fn vad(&self) -> &VadEngine {
        &self.vad
    }

    pub fn vad_mut(&mut self) -> &mut VadEngine {
        &mut self.vad
    }

    pub fn vad_state(&self) -> VadState {
        self.vad.state()
    }

    /// Drop the partial frame and return the VAD to silence
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.vad.reset();
    }
}
