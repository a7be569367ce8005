//! # voxlink-core
//!
//! Duplex real-time voice streaming: microphone up, synthesized speech down,
//! gapless playback with barge-in.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → InputBackend → SPSC RingBuffer → capture worker (16 kHz frames)
//!                                                    │ codec::encode
//!                                              OutboundQueue (newest wins)
//!                                                    │ send pump
//!                                              Transport::send ──► remote
//!
//! remote ──► TransportEvent stream ──► inbound reader
//!                                          │ AudioChunk      │ Interrupted
//!                                          ▼                 ▼
//!                                 PlaybackScheduler::enqueue / clear
//!                                          │ start = max(next_start, now)
//!                                          ▼
//!                                     OutputDevice (24 kHz clock)
//! ```
//!
//! [`VoiceSession`] owns every edge and is the only thing that changes state.
//! Once running, the audio callbacks neither allocate nor free; heap work
//! happens on the capture worker, the playback worker, the send pump and the
//! inbound reader.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod codec;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod session;
pub mod transport;

// Convenience re-exports for downstream crates
pub use audio::{CaptureConfig, CaptureHandle, FrameSink, InputBackend};
pub use buffering::chunk::AudioFrame;
pub use codec::{decode, encode, EncodedChunk};
pub use error::{Result, VoxError};
pub use ipc::events::{SessionStatus, SessionStatusEvent};
pub use playback::{OutputBackend, OutputDevice, PlaybackConfig, PlaybackScheduler};
pub use session::{DiagnosticsSnapshot, SessionConfig, VoiceSession};
pub use transport::{
    ConnectConfig, Connection, Connector, Delivery, MemoryConnector, Transport, TransportEvent,
};

#[cfg(feature = "audio-cpal")]
pub use audio::CpalInput;
#[cfg(feature = "audio-cpal")]
pub use playback::CpalOutput;

#[cfg(feature = "websocket")]
pub use transport::LiveConnector;
