//! # Companion Session Core
//!
//! On-device session core for a handheld voice/text assistant talking to a
//! gateway over a framed binary protocol.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                        PRODUCER CONTEXT (capture thread)                   │
//! │  ┌────────────┐   ┌──────────────────┐   ┌────────────┐                    │
//! │  │ Microphone │──▶│ Frame Assembler  │──▶│ VAD Engine │──┐                 │
//! │  │ (SampleSrc)│   │ (audio::assembler)│  │(audio::vad)│  │ voiced frames   │
//! │  └────────────┘   └──────────────────┘   └─────┬──────┘  ▼                 │
//! │                                                │   ┌───────────────────┐   │
//! │                                   VAD events ──┘   │ FrameQueue        │   │
//! │                                                    │ bounded, drop-old │   │
//! └────────────────────────────────────────────────────┴─────────┬─────────┴───┘
//!                                                                │
//! ┌──────────────────────────────────────────────────────────────┼────────────┐
//! │                        MAIN-LOOP CONTEXT (client::SessionClient::tick)     │
//! │                                                              ▼            │
//! │  ┌────────────┐   ┌──────────────────┐   ┌─────────────────────────────┐  │
//! │  │ Transport  │──▶│ StreamReassembler│──▶│ Session State Machine       │  │
//! │  │ (TCP)      │   │ (protocol::parser)│  │ (session::machine + device) │  │
//! │  └─────▲──────┘   └──────────────────┘   └──────────────┬──────────────┘  │
//! │        │                                                │ commands        │
//! │        └──── Wire Codec (protocol::codec) ◀── encoder ◀─┘                 │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod client;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default capture sample rate
    pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

    /// Default audio frame duration in milliseconds
    pub const DEFAULT_FRAME_DURATION_MS: u32 = 60;

    /// Capacity of the capture → main loop frame queue
    pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

    /// Main loop tick period in milliseconds
    pub const TICK_INTERVAL_MS: u64 = 10;

    /// Upper bound on a single hardware read wait
    pub const MAX_READ_TIMEOUT_MS: u64 = 100;
}
