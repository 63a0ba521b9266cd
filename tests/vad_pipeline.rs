// Integration tests for the capture-side pipeline
//
// Raw sample chunks go through the frame assembler (gain + VAD) and the
// voiced frames land in the bounded frame queue, as on the capture thread.

use companion_core::audio::{
    create_shared_queue, AssembledFrame, FrameAssembler, VadConfig, VadEvent, VadState,
};

const RATE: u32 = 16_000;
const FRAME_MS: u32 = 20;
/// 1 ms of samples at 16 kHz
const MS: usize = 16;

fn tone(ms: usize, amplitude: i16) -> Vec<i16> {
    (0..ms * MS)
        .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
        .collect()
}

/// 100 ms silence, 500 ms voice, 700 ms silence
fn utterance() -> Vec<i16> {
    let mut samples = tone(100, 0);
    samples.extend(tone(500, 1_000));
    samples.extend(tone(700, 0));
    samples
}

fn run(samples: &[i16], chunk_sizes: &[usize], config: VadConfig) -> Vec<AssembledFrame> {
    let mut assembler = FrameAssembler::new(RATE, FRAME_MS, 64, config).unwrap();
    let mut frames = Vec::new();
    let mut offset = 0;
    let mut sizes = chunk_sizes.iter().cycle();

    while offset < samples.len() {
        let size = (*sizes.next().unwrap()).min(samples.len() - offset);
        let timestamp = (offset / MS) as u64;
        frames.extend(assembler.push(&samples[offset..offset + size], timestamp));
        offset += size;
    }
    frames
}

#[test]
fn test_utterance_events_and_forwarding() {
    let frames = run(&utterance(), &[160], VadConfig::default());
    assert_eq!(frames.len(), 65);

    let events: Vec<VadEvent> = frames.iter().filter_map(|f| f.event).collect();
    // Debounce: voice from 100 ms, confirmed 200 ms later.
    // Hangover: silence from 600 ms, confirmed 500 ms later.
    assert_eq!(
        events,
        vec![
            VadEvent::VoiceDetected { at: 300 },
            VadEvent::VoiceLost { at: 1_100 },
        ]
    );

    let forwarded: Vec<&AssembledFrame> = frames.iter().filter(|f| f.is_forwarded()).collect();
    assert_eq!(forwarded.len(), 40);
    assert_eq!(forwarded.first().unwrap().frame.timestamp, 300);
    assert_eq!(forwarded.last().unwrap().frame.timestamp, 1_080);
    assert!(forwarded
        .iter()
        .all(|f| matches!(f.frame.vad, VadState::VoiceActive | VadState::VoiceEnd)));

    // Debounce frames are classified but held back
    let debounce: Vec<_> = frames
        .iter()
        .filter(|f| f.frame.vad == VadState::VoiceStart)
        .map(|f| f.frame.timestamp)
        .collect();
    assert_eq!(debounce.first(), Some(&100));
    assert_eq!(debounce.last(), Some(&280));
}

#[test]
fn test_chunk_sizes_do_not_change_frames() {
    let samples = utterance();
    let even = run(&samples, &[320], VadConfig::default());
    let ragged = run(&samples, &[48, 160, 336, 16, 1_024], VadConfig::default());

    assert_eq!(even.len(), ragged.len());
    for (a, b) in even.iter().zip(&ragged) {
        assert_eq!(a.frame, b.frame);
        assert_eq!(a.event, b.event);
    }
}

#[test]
fn test_short_burst_never_forwarded() {
    let mut samples = tone(100, 0);
    samples.extend(tone(100, 2_000));
    samples.extend(tone(400, 0));

    let frames = run(&samples, &[160], VadConfig::default());
    assert!(frames.iter().all(|f| f.event.is_none()));
    assert!(frames.iter().all(|f| !f.is_forwarded()));
}

#[test]
fn test_disabled_vad_forwards_everything() {
    let config = VadConfig {
        enabled: false,
        ..VadConfig::default()
    };
    let frames = run(&tone(200, 0), &[160], config);
    assert_eq!(frames.len(), 10);
    assert!(frames.iter().all(|f| f.is_forwarded()));
    assert!(frames.iter().all(|f| f.event.is_none()));
}

#[test]
fn test_queue_keeps_most_recent_voiced_frames() {
    let queue = create_shared_queue(10);
    for assembled in run(&utterance(), &[160], VadConfig::default()) {
        if assembled.is_forwarded() {
            queue.push(assembled.frame);
        }
    }

    assert!(queue.is_full());
    assert_eq!(queue.dropped_count(), 30);

    let kept = queue.drain();
    assert_eq!(kept.first().unwrap().timestamp, 900);
    assert_eq!(kept.last().unwrap().timestamp, 1_080);
    assert!(kept.windows(2).all(|w| w[1].sequence == w[0].sequence + 1));
}
