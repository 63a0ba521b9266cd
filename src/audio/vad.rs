//! Level-based voice activity detection
//!
//! Classification runs once per assembled frame. Voice onset is debounced by
//! `min_duration_ms`; voice end waits out a `silence_ms` hangover so short
//! pauses between words do not end the utterance.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// VAD classification of the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VadState {
    #[default]
    Silence,
    /// Above threshold, still debouncing
    VoiceStart,
    VoiceActive,
    /// Below threshold, inside the hangover window
    VoiceEnd,
}

impl VadState {
    pub fn as_str(self) -> &'static str {
        match self {
            VadState::Silence => "SILENCE",
            VadState::VoiceStart => "VOICE_START",
            VadState::VoiceActive => "VOICE_ACTIVE",
            VadState::VoiceEnd => "VOICE_END",
        }
    }

    /// Frames in these states are forwarded to the gateway
    pub fn is_voiced(self) -> bool {
        matches!(self, VadState::VoiceActive | VadState::VoiceEnd)
    }
}

impl fmt::Display for VadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events emitted on confirmed transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    VoiceDetected { at: u64 },
    VoiceLost { at: u64 },
}

/// Voice activity detection parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub enabled: bool,
    /// RMS level that counts as voice (exclusive)
    pub threshold: u16,
    pub min_duration_ms: u32,
    pub silence_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 500,
            min_duration_ms: 200,
            silence_ms: 500,
        }
    }
}

/// Root mean square of a block of samples
pub fn rms(samples: &[i16]) -> u16 {
    if samples.is_empty() {
        return 0;
    }
    let sum: i64 = samples.iter().map(|&s| i64::from(s) * i64::from(s)).sum();
    ((sum / samples.len() as i64) as f64).sqrt() as u16
}

/// Result of one classification step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VadDecision {
    pub state: VadState,
    pub level: u16,
    pub event: Option<VadEvent>,
}

/// Per-stream VAD state machine
pub struct VadEngine {
    config: VadConfig,
    state: VadState,
    /// When the current classification began
    state_since: u64,
    active_frames: u64,
    total_frames: u64,
    voice_events: u64,
}

impl VadEngine {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            state: VadState::Silence,
            state_since: 0,
            active_frames: 0,
            total_frames: 0,
            voice_events: 0,
        }
    }

    /// Classify one frame of samples captured at `now`
    pub fn process(&mut self, samples: &[i16], now: u64) -> VadDecision {
        let level = rms(samples);
        self.step(level, now)
    }

    /// Classify a precomputed level
    pub fn step(&mut self, level: u16, now: u64) -> VadDecision {
        self.total_frames += 1;

        if !self.config.enabled {
            self.active_frames += 1;
            return VadDecision {
                state: VadState::VoiceActive,
                level,
                event: None,
            };
        }

        let above = level > self.config.threshold;
        let elapsed = now.saturating_sub(self.state_since);
        let mut event = None;

        let next = match (self.state, above) {
            (VadState::Silence, true) => VadState::VoiceStart,
            (VadState::Silence, false) => VadState::Silence,
            (VadState::VoiceStart, true) if elapsed >= u64::from(self.config.min_duration_ms) => {
                event = Some(VadEvent::VoiceDetected { at: now });
                VadState::VoiceActive
            }
            (VadState::VoiceStart, true) => VadState::VoiceStart,
            (VadState::VoiceStart, false) => VadState::Silence,
            (VadState::VoiceActive, true) => VadState::VoiceActive,
            (VadState::VoiceActive, false) => VadState::VoiceEnd,
            (VadState::VoiceEnd, true) => VadState::VoiceActive,
            (VadState::VoiceEnd, false) if elapsed >= u64::from(self.config.silence_ms) => {
                event = Some(VadEvent::VoiceLost { at: now });
                VadState::Silence
            }
            (VadState::VoiceEnd, false) => VadState::VoiceEnd,
        };

        if next != self.state {
            debug!(from = %self.state, to = %next, level, at = now, "VAD transition");
            self.state_since = now;
            self.state = next;
        }

        if next == VadState::VoiceActive {
            self.active_frames += 1;
        }
        if event.is_some() {
            self.voice_events += 1;
        }

        VadDecision {
            state: next,
            level,
            event,
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: VadConfig) {
        self.config = config;
    }

    pub fn set_threshold(&mut self, threshold: u16) {
        self.config.threshold = threshold;
    }

    /// Back to silence, as on stream teardown
    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.state_since = 0;
        self.active_frames = 0;
    }

    pub fn stats(&self) -> VadStats {
        VadStats {
            active_frames: self.active_frames,
            total_frames: self.total_frames,
            voice_events: self.voice_events,
        }
    }
}

/// VAD statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VadStats {
    pub active_frames: u64,
    pub total_frames: u64,
    pub voice_events: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> VadEngine {
        VadEngine::new(VadConfig {
            enabled: true,
            threshold: 500,
            min_duration_ms: 200,
            silence_ms: 500,
        })
    }

    /// Feed `level` every `step_ms` over `[from, to)`, collecting events
    fn run(vad: &mut VadEngine, level: u16, from: u64, to: u64, step_ms: u64) -> Vec<VadEvent> {
        (from..to)
            .step_by(step_ms as usize)
            .filter_map(|t| vad.step(level, t).event)
            .collect()
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0);
        assert_eq!(rms(&[1000, -1000, 1000, -1000]), 1000);
        assert_eq!(rms(&[i16::MIN; 8]), 32768);
        assert_eq!(rms(&[3, 4]), 3);
    }

    #[test]
    fn test_short_burst_never_detected() {
        let mut vad = engine();
        let events = run(&mut vad, 800, 0, 180, 20);
        assert!(events.is_empty());
        assert_eq!(vad.state(), VadState::VoiceStart);

        let events = run(&mut vad, 50, 180, 400, 20);
        assert!(events.is_empty());
        assert_eq!(vad.state(), VadState::Silence);
    }

    #[test]
    fn test_debounce_then_single_detection() {
        let mut vad = engine();
        let events = run(&mut vad, 800, 0, 1000, 20);
        assert_eq!(events, vec![VadEvent::VoiceDetected { at: 200 }]);
        assert_eq!(vad.state(), VadState::VoiceActive);
    }

    #[test]
    fn test_hangover_keeps_voice_alive() {
        let mut vad = engine();
        run(&mut vad, 800, 0, 300, 20);

        let events = run(&mut vad, 50, 300, 780, 20);
        assert!(events.is_empty());
        assert_eq!(vad.state(), VadState::VoiceEnd);

        // Speech resumes inside the hangover window
        assert_eq!(vad.step(900, 780).state, VadState::VoiceActive);
    }

    #[test]
    fn test_reference_scenario() {
        let mut vad = engine();
        let mut events = run(&mut vad, 800, 0, 300, 20);
        events.extend(run(&mut vad, 50, 300, 900, 20));

        assert_eq!(
            events,
            vec![
                VadEvent::VoiceDetected { at: 200 },
                VadEvent::VoiceLost { at: 800 },
            ]
        );
        assert_eq!(vad.state(), VadState::Silence);
        assert_eq!(vad.stats().voice_events, 2);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let mut vad = engine();
        assert_eq!(vad.step(500, 0).state, VadState::Silence);
        assert_eq!(vad.step(501, 20).state, VadState::VoiceStart);
    }

    #[test]
    fn test_disabled_marks_everything_active() {
        let mut vad = VadEngine::new(VadConfig {
            enabled: false,
            ..VadConfig::default()
        });
        let d = vad.step(0, 0);
        assert_eq!(d.state, VadState::VoiceActive);
        assert!(d.event.is_none());
    }

    #[test]
    fn test_reset() {
        let mut vad = engine();
        run(&mut vad, 800, 0, 400, 20);
        vad.reset();
        assert_eq!(vad.state(), VadState::Silence);
    }
}
