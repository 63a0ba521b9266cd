//! Producer context: hardware reads → frame assembly → bounded queue
//!
//! The capture loop runs on its own thread. It blocks on the sample source
//! for at most the read timeout, then re-checks the shared state, so stopping
//! is cooperative and bounded by that timeout.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audio::assembler::FrameAssembler;
use crate::audio::buffer::SharedFrameQueue;
use crate::audio::vad::{VadConfig, VadEvent};
use crate::clock::SharedClock;
use crate::error::AudioError;

/// Blocking-with-timeout sample input
pub trait SampleSource: Send + 'static {
    /// Read up to `buf.len()` mono samples, waiting at most `timeout`.
    /// `Ok(0)` means the wait timed out.
    fn read_samples(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize, AudioError>;
}

/// Capture lifecycle
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle = 0,
    Capturing = 1,
    /// Thread alive, reads discarded
    Paused = 2,
}

impl CaptureState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CaptureState::Capturing,
            2 => CaptureState::Paused,
            _ => CaptureState::Idle,
        }
    }
}

/// Notifications from the capture thread to the main loop
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Started,
    Voice(VadEvent),
    /// A hardware read failed; `consecutive` counts the current streak
    ReadError { message: String, consecutive: u32 },
    /// A read succeeded after one or more failures
    Recovered,
    Stopped,
}

/// Capture parameters
#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    pub gain: u8,
    pub vad: VadConfig,
    pub read_timeout: Duration,
    /// Samples requested per hardware read
    pub read_chunk: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_duration_ms: 60,
            gain: 64,
            vad: VadConfig::default(),
            read_timeout: Duration::from_millis(100),
            read_chunk: 512,
        }
    }
}

/// Read errors in a streak logged at `warn!` before switching to one in every
/// `ERROR_LOG_EVERY`
const ERROR_LOG_BURST: u32 = 3;
const ERROR_LOG_EVERY: u32 = 50;

/// Counters readable from any thread
#[derive(Debug, Default)]
struct CaptureCounters {
    frames_captured: AtomicU64,
    frames_forwarded: AtomicU64,
    frames_dropped: AtomicU64,
    read_errors: AtomicU64,
    level: AtomicU32,
    voice_active: AtomicBool,
}

type CaptureThread = JoinHandle<Box<dyn SampleSource>>;

/// Audio capture for a single microphone
pub struct AudioCapture {
    config: CaptureConfig,
    state: Arc<AtomicU8>,
    output_queue: SharedFrameQueue,
    counters: Arc<CaptureCounters>,
    event_tx: Sender<CaptureEvent>,
    event_rx: Receiver<CaptureEvent>,
    thread_handle: Option<CaptureThread>,
    clock: SharedClock,
    /// Clock time of the last `resume()`; the thread re-anchors timestamps on it
    resume_at: Arc<AtomicU64>,
    resumed: Arc<AtomicBool>,
}

impl AudioCapture {
    pub fn new(config: CaptureConfig, output_queue: SharedFrameQueue, clock: SharedClock) -> Self {
        let (event_tx, event_rx) = bounded(64);
        Self {
            config,
            state: Arc::new(AtomicU8::new(CaptureState::Idle as u8)),
            output_queue,
            counters: Arc::new(CaptureCounters::default()),
            event_tx,
            event_rx,
            thread_handle: None,
            clock,
            resume_at: Arc::new(AtomicU64::new(0)),
            resumed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start capturing from `source` on a dedicated thread
    pub fn start(&mut self, source: Box<dyn SampleSource>) -> Result<(), AudioError> {
        if self.thread_handle.is_some() {
            return Err(AudioError::AlreadyRunning);
        }

        let config = self.config;
        let mut assembler = FrameAssembler::new(
            config.sample_rate,
            config.frame_duration_ms,
            config.gain,
            config.vad,
        )?;

        let state = self.state.clone();
        let queue = self.output_queue.clone();
        let counters = self.counters.clone();
        let events = self.event_tx.clone();
        let resume_at = self.resume_at.clone();
        let resumed = self.resumed.clone();
        let mut origin = self.clock.now_ms();
        resumed.store(false, Ordering::SeqCst);

        state.store(CaptureState::Capturing as u8, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let mut source = source;
                let mut buf = vec![0i16; config.read_chunk.max(1)];
                let mut samples_read: u64 = 0;
                let mut consecutive_errors: u32 = 0;

                send_event(&events, CaptureEvent::Started);

                loop {
                    if CaptureState::from_u8(state.load(Ordering::Acquire)) == CaptureState::Idle {
                        break;
                    }

                    let count = match source.read_samples(&mut buf, config.read_timeout) {
                        Ok(count) => count,
                        Err(e) => {
                            consecutive_errors += 1;
                            counters.read_errors.fetch_add(1, Ordering::Relaxed);
                            if consecutive_errors <= ERROR_LOG_BURST
                                || consecutive_errors % ERROR_LOG_EVERY == 0
                            {
                                warn!(consecutive = consecutive_errors, "Audio read failed: {}", e);
                            } else {
                                debug!(consecutive = consecutive_errors, "Audio read failed: {}", e);
                            }
                            send_event(
                                &events,
                                CaptureEvent::ReadError {
                                    message: e.to_string(),
                                    consecutive: consecutive_errors,
                                },
                            );
                            // A failing device usually fails immediately
                            thread::sleep(config.read_timeout);
                            continue;
                        }
                    };

                    if consecutive_errors > 0 {
                        consecutive_errors = 0;
                        send_event(&events, CaptureEvent::Recovered);
                    }

                    // State as of the end of the read decides what the samples belong to
                    let current = CaptureState::from_u8(state.load(Ordering::Acquire));
                    if resumed.swap(false, Ordering::SeqCst) {
                        // Time spent paused produced no samples
                        origin = resume_at.load(Ordering::SeqCst);
                        samples_read = 0;
                    }

                    if count == 0 || current != CaptureState::Capturing {
                        continue;
                    }

                    let timestamp =
                        origin + (samples_read * 1000) / u64::from(config.sample_rate);
                    samples_read += count as u64;

                    for assembled in assembler.push(&buf[..count], timestamp) {
                        counters.frames_captured.fetch_add(1, Ordering::Relaxed);
                        counters
                            .level
                            .store(u32::from(assembled.frame.level), Ordering::Relaxed);
                        counters
                            .voice_active
                            .store(assembled.frame.vad.is_voiced(), Ordering::Relaxed);

                        if let Some(event) = assembled.event {
                            send_event(&events, CaptureEvent::Voice(event));
                        }

                        if assembled.is_forwarded() {
                            counters.frames_forwarded.fetch_add(1, Ordering::Relaxed);
                            if let Some(evicted) = queue.push(assembled.frame) {
                                counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                                debug!(sequence = evicted.sequence, "Frame queue full, dropped oldest");
                            }
                        }
                    }
                }

                assembler.reset();
                counters.voice_active.store(false, Ordering::Relaxed);
                send_event(&events, CaptureEvent::Stopped);
                source
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        info!(
            sample_rate = self.config.sample_rate,
            frame_ms = self.config.frame_duration_ms,
            "Audio capture started"
        );
        Ok(())
    }

    /// Stop capturing and hand the source back. Returns once the capture
    /// thread has observed the stop, at most one read timeout later.
    pub fn stop(&mut self) -> Option<Box<dyn SampleSource>> {
        self.state.store(CaptureState::Idle as u8, Ordering::SeqCst);

        let handle = self.thread_handle.take()?;
        match handle.join() {
            Ok(source) => {
                info!("Audio capture stopped");
                Some(source)
            }
            Err(_) => {
                warn!("Capture thread panicked");
                None
            }
        }
    }

    pub fn pause(&self) {
        let _ = self.state.compare_exchange(
            CaptureState::Capturing as u8,
            CaptureState::Paused as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Resume after `pause()`. Frame timestamps continue from the clock's
    /// current time rather than from the last sample read before pausing.
    pub fn resume(&self) {
        if self.state() != CaptureState::Paused {
            return;
        }
        // Published before the state so the thread sees both together
        self.resume_at.store(self.clock.now_ms(), Ordering::SeqCst);
        self.resumed.store(true, Ordering::SeqCst);
        let _ = self.state.compare_exchange(
            CaptureState::Paused as u8,
            CaptureState::Capturing as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() != CaptureState::Idle
    }

    /// Next pending capture event, if any
    pub fn try_event(&self) -> Option<CaptureEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Receiver for capture events, for consumers that poll on their own
    pub fn events(&self) -> Receiver<CaptureEvent> {
        self.event_rx.clone()
    }

    pub fn queue(&self) -> &SharedFrameQueue {
        &self.output_queue
    }

    /// RMS level of the most recent frame
    pub fn level(&self) -> u16 {
        self.counters.level.load(Ordering::Relaxed) as u16
    }

    pub fn is_voice_detected(&self) -> bool {
        self.counters.voice_active.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.counters.frames_captured.load(Ordering::Relaxed),
            frames_forwarded: self.counters.frames_forwarded.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            read_errors: self.counters.read_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn send_event(tx: &Sender<CaptureEvent>, event: CaptureEvent) {
    if let Err(TrySendError::Full(event)) = tx.try_send(event) {
        warn!(?event, "Capture event channel full, dropping event");
    }
}

/// Capture statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
    pub read_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::create_shared_queue;
    use crate::clock::ManualClock;
    use std::collections::VecDeque;
    use std::time::Instant;

    /// Replays scripted reads, then idles until stopped
    struct ScriptedSource {
        reads: VecDeque<Result<Vec<i16>, AudioError>>,
    }

    impl SampleSource for ScriptedSource {
        fn read_samples(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize, AudioError> {
            match self.reads.pop_front() {
                Some(Ok(samples)) => {
                    let n = samples.len().min(buf.len());
                    buf[..n].copy_from_slice(&samples[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => {
                    thread::sleep(timeout);
                    Ok(0)
                }
            }
        }
    }

    fn config() -> CaptureConfig {
        CaptureConfig {
            sample_rate: 16_000,
            frame_duration_ms: 20,
            read_timeout: Duration::from_millis(5),
            read_chunk: 320,
            ..CaptureConfig::default()
        }
    }

    fn wait_for_events(capture: &AudioCapture, want: usize) -> Vec<CaptureEvent> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut events = Vec::new();
        while events.len() < want && Instant::now() < deadline {
            match capture.try_event() {
                Some(e) => events.push(e),
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
        events
    }

    #[test]
    fn test_voice_frames_reach_queue() {
        let queue = create_shared_queue(64);
        let mut capture = AudioCapture::new(config(), queue.clone(), Arc::new(ManualClock::new(0)));

        let loud: Vec<i16> = (0..320).map(|i| if i % 2 == 0 { 900 } else { -900 }).collect();
        let reads = (0..20).map(|_| Ok(loud.clone())).collect();
        capture
            .start(Box::new(ScriptedSource { reads }))
            .unwrap();

        let events = wait_for_events(&capture, 2);
        assert_eq!(events[0], CaptureEvent::Started);
        assert_eq!(events[1], CaptureEvent::Voice(VadEvent::VoiceDetected { at: 200 }));

        assert!(capture.stop().is_some());
        assert!(!capture.is_running());

        let stats = capture.stats();
        assert_eq!(stats.frames_captured, 20);
        // 20 ms frames, voiced from 200 ms onward
        assert_eq!(stats.frames_forwarded, 10);
        assert_eq!(queue.len(), 10);
    }

    #[test]
    fn test_read_errors_do_not_halt_capture() {
        let queue = create_shared_queue(8);
        let mut capture = AudioCapture::new(config(), queue, Arc::new(ManualClock::new(0)));

        let reads = vec![
            Err(AudioError::ReadFailed("dma".into())),
            Err(AudioError::ReadFailed("dma".into())),
            Ok(vec![0i16; 320]),
        ]
        .into();
        capture.start(Box::new(ScriptedSource { reads })).unwrap();

        let events = wait_for_events(&capture, 4);
        assert!(matches!(events[1], CaptureEvent::ReadError { consecutive: 1, .. }));
        assert!(matches!(events[2], CaptureEvent::ReadError { consecutive: 2, .. }));
        assert_eq!(events[3], CaptureEvent::Recovered);

        capture.stop();
        assert_eq!(capture.stats().read_errors, 2);
        assert_eq!(capture.stats().frames_captured, 1);
    }

    /// Hands out whatever the test sends, one chunk per read
    struct ChannelSource {
        chunks: Receiver<Vec<i16>>,
    }

    impl SampleSource for ChannelSource {
        fn read_samples(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize, AudioError> {
            match self.chunks.recv_timeout(timeout) {
                Ok(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                Err(_) => Ok(0),
            }
        }
    }

    /// Fails every read without blocking
    struct BrokenSource {
        reads: Arc<AtomicU64>,
    }

    impl SampleSource for BrokenSource {
        fn read_samples(&mut self, _buf: &mut [i16], _timeout: Duration) -> Result<usize, AudioError> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            Err(AudioError::ReadFailed("bus fault".into()))
        }
    }

    fn wait_for_frames(queue: &SharedFrameQueue, want: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.len() < want && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_failing_source_backs_off() {
        let queue = create_shared_queue(8);
        let config = CaptureConfig {
            read_timeout: Duration::from_millis(20),
            ..config()
        };
        let mut capture = AudioCapture::new(config, queue, Arc::new(ManualClock::new(0)));
        let reads = Arc::new(AtomicU64::new(0));
        capture
            .start(Box::new(BrokenSource { reads: reads.clone() }))
            .unwrap();

        thread::sleep(Duration::from_millis(200));
        capture.stop();

        // One attempt per read timeout, not a busy loop
        let attempts = reads.load(Ordering::Relaxed);
        assert!(attempts >= 1);
        assert!(attempts <= 15, "{} reads in 200 ms", attempts);
        assert_eq!(capture.stats().read_errors, attempts);
    }

    #[test]
    fn test_resume_continues_from_clock() {
        let queue = create_shared_queue(8);
        let clock = ManualClock::new(1_000);
        let config = CaptureConfig {
            vad: VadConfig {
                enabled: false,
                ..VadConfig::default()
            },
            ..config()
        };
        let mut capture = AudioCapture::new(config, queue.clone(), Arc::new(clock.clone()));
        let (tx, rx) = bounded(8);
        capture.start(Box::new(ChannelSource { chunks: rx })).unwrap();

        tx.send(vec![0i16; 320]).unwrap();
        wait_for_frames(&queue, 1);
        assert_eq!(queue.pop().unwrap().timestamp, 1_000);

        capture.pause();
        clock.advance(60_000);
        capture.resume();

        tx.send(vec![0i16; 320]).unwrap();
        wait_for_frames(&queue, 1);
        assert_eq!(queue.pop().unwrap().timestamp, 61_000);

        tx.send(vec![0i16; 320]).unwrap();
        wait_for_frames(&queue, 1);
        assert_eq!(queue.pop().unwrap().timestamp, 61_020);

        capture.stop();
    }

    #[test]
    fn test_double_start_rejected() {
        let queue = create_shared_queue(8);
        let mut capture = AudioCapture::new(config(), queue, Arc::new(ManualClock::new(0)));
        capture
            .start(Box::new(ScriptedSource { reads: VecDeque::new() }))
            .unwrap();
        assert!(matches!(
            capture.start(Box::new(ScriptedSource { reads: VecDeque::new() })),
            Err(AudioError::AlreadyRunning)
        ));

        capture.pause();
        assert_eq!(capture.state(), CaptureState::Paused);
        capture.resume();
        assert_eq!(capture.state(), CaptureState::Capturing);
        capture.stop();
        assert_eq!(capture.state(), CaptureState::Idle);
    }
}
