//! Audio subsystem: capture, frame assembly and voice activity detection

pub mod assembler;
pub mod buffer;
pub mod capture;
pub mod device;
pub mod vad;

pub use assembler::{AssembledFrame, FrameAssembler};
pub use buffer::{create_shared_queue, AudioFrame, FrameQueue, SharedFrameQueue};
pub use capture::{AudioCapture, CaptureConfig, CaptureEvent, SampleSource};
pub use vad::{VadConfig, VadEngine, VadEvent, VadState};
