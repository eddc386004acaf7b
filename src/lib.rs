//! # Voice Relay
//!
//! Realtime bidirectional audio relay between a local microphone/speaker
//! pair and a streaming speech backend over a persistent WebSocket.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            CAPTURE CLOCK                             │
//! │  ┌────────────┐   ┌───────────────┐   ┌────────────┐                 │
//! │  │ Microphone │──►│ CaptureSource │──►│ pcm encode │──┐              │
//! │  │ (looping)  │   │  on_tick()    │   │  f32→i16LE │  │              │
//! │  └────────────┘   └───────────────┘   └────────────┘  │              │
//! └───────────────────────────────────────────────────────┼──────────────┘
//!                                                         ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                   NETWORK CLOCK (tokio supervisor task)              │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │        RelayTransport (network::transport) - WebSocket         │  │
//! │  │   connect ─► Connected ─► lost ─► backoff ─► connect ...       │  │
//! │  └────────────────────────────────────────────────────────────────┘  │
//! │           │ inbound binary                                           │
//! │           ▼                                                          │
//! │  ┌──────────────────┐   ┌────────────────────────────┐               │
//! │  │ PlaybackPipeline │──►│ PlaybackRing (lock-free)   │               │
//! │  │  pcm decode      │   │ overwrite-oldest, SPSC     │               │
//! │  └──────────────────┘   └─────────────┬──────────────┘               │
//! └───────────────────────────────────────┼──────────────────────────────┘
//!                                         ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                 PLAYBACK CLOCK (cpal output callback)                │
//! │                read_into() ─► speaker, silence on underrun           │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`session::StreamCoordinator`] owns the lifecycle and reports connection
//! and talking state through [`events::EventBus`].

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod network;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for capture and playback
    pub const DEFAULT_SAMPLE_RATE: u32 = 24000;

    /// Default capture frame duration in milliseconds
    pub const DEFAULT_FRAME_DURATION_MS: u32 = 50;

    /// Length of the microphone's looping buffer
    pub const DEFAULT_CAPTURE_BUFFER_SECS: u32 = 10;

    /// Playback ring capacity in seconds of audio
    pub const DEFAULT_PLAYBACK_BUFFER_SECS: f32 = 3.0;

    /// Delay before the first reconnect attempt
    pub const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 5;

    /// Cap for the reconnect backoff
    pub const DEFAULT_MAX_RECONNECT_INTERVAL_SECS: u64 = 60;

    /// WebSocket handshake timeout
    pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

    /// Outbound frames buffered between the capture clock and the socket
    pub const DEFAULT_OUTBOUND_CHANNEL_DEPTH: usize = 64;

    /// Default backend endpoint
    pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8000/ws/audio";
}
