//! Audio frames and the bounded capture → consumer queue
//!
//! The queue is the only thread-safe boundary between the capture thread and
//! the main loop. When it is full the oldest frame is evicted: for live voice
//! a recent frame is worth more than a complete backlog.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::audio::vad::VadState;

/// One fixed-duration block of mono 16-bit samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    /// Capture time in milliseconds
    pub timestamp: u64,
    /// RMS level after gain
    pub level: u16,
    /// Classification assigned by the VAD step that consumed this frame
    pub vad: VadState,
    /// Frame sequence number
    pub sequence: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, timestamp: u64, level: u16, vad: VadState, sequence: u32) -> Self {
        Self {
            samples,
            timestamp,
            level,
            vad,
            sequence,
        }
    }

    /// Frame duration in milliseconds
    pub fn duration_ms(&self, sample_rate: u32) -> u64 {
        (self.samples.len() as u64 * 1000) / sample_rate as u64
    }

    /// Samples as little-endian bytes
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// Bounded single-producer single-consumer frame queue, drop-oldest on overflow
pub struct FrameQueue {
    queue: ArrayQueue<AudioFrame>,
    dropped_count: AtomicUsize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped_count: AtomicUsize::new(0),
        }
    }

    /// Push a frame, evicting the oldest queued frame if full.
    /// Returns the evicted frame, if any.
    pub fn push(&self, frame: AudioFrame) -> Option<AudioFrame> {
        let evicted = self.queue.force_push(frame);
        if evicted.is_some() {
            self.dropped_count.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    pub fn pop(&self) -> Option<AudioFrame> {
        self.queue.pop()
    }

    /// Pop everything currently queued, oldest first
    pub fn drain(&self) -> Vec<AudioFrame> {
        std::iter::from_fn(|| self.queue.pop()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Frames evicted by overflow since the last reset
    pub fn dropped_count(&self) -> usize {
        self.dropped_count.load(Ordering::Relaxed)
    }

    pub fn reset_stats(&self) {
        self.dropped_count.store(0, Ordering::Relaxed);
    }

    pub fn fill_level(&self) -> f32 {
        self.len() as f32 / self.capacity() as f32
    }
}

/// Thread-safe handle to a frame queue
pub type SharedFrameQueue = Arc<FrameQueue>;

pub fn create_shared_queue(capacity: usize) -> SharedFrameQueue {
    Arc::new(FrameQueue::new(capacity))
}
