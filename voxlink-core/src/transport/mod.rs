//! Session transport: bidirectional stream to the remote audio endpoint.
//!
//! ```text
//! Connector::connect(config) ──► Connection
//!                                  ├─ transport: send(chunk) / close()
//!                                  └─ events:    AudioChunk | Interrupted | Closed | Error
//! ```
//!
//! `send` is fire-and-forget and preserves order. The event receiver has a
//! single consumer, the session's inbound reader.

pub mod live;
pub mod memory;
#[cfg(feature = "websocket")]
pub mod ws;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{codec::EncodedChunk, error::Result};

pub use memory::{MemoryConnector, MemoryTransport, RemoteEnd};
#[cfg(feature = "websocket")]
pub use ws::{LiveConnector, LiveTransport};

/// Default prebuilt voice.
pub const DEFAULT_VOICE: &str = "Zephyr";

/// Default native-audio model.
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

/// Inbound events in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Synthesized audio to play.
    AudioChunk(EncodedChunk),
    /// The user barged in; drop whatever is queued for playback.
    Interrupted,
    /// The remote closed the stream.
    Closed { reason: Option<String> },
    /// Socket or protocol failure.
    Error(String),
}

/// Modality the remote answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseModality {
    #[default]
    Audio,
    Text,
}

/// Everything needed to open a session with the remote endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectConfig {
    pub model: String,
    /// System role text.
    pub system_instruction: Option<String>,
    /// Voice identity for synthesized speech.
    pub voice_name: String,
    pub response_modality: ResponseModality,
    /// Capacity of the inbound event channel.
    pub inbound_capacity: usize,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            system_instruction: None,
            voice_name: DEFAULT_VOICE.to_string(),
            response_modality: ResponseModality::Audio,
            inbound_capacity: 256,
        }
    }
}

/// What happened to a chunk handed to [`Transport::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the wire.
    Queued,
    /// Queued after discarding the oldest chunk still waiting for the wire.
    Displaced,
}

/// Outbound half of an open connection.
pub trait Transport: Send + Sync + 'static {
    /// Queue a chunk for delivery. Must not block on the network; when the
    /// wire is backed up the oldest pending chunk gives way.
    ///
    /// # Errors
    /// `VoxError::SendFailed` once the connection is closed.
    fn send(&self, chunk: EncodedChunk) -> Result<Delivery>;

    /// Close the connection. Idempotent.
    fn close(&self) -> Result<()>;
}

/// An open connection: the outbound handle plus the inbound event stream.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<Connection>> + Send + 'static>>;

/// Opens connections. No retries: one call, one attempt.
pub trait Connector: Send + Sync + 'static {
    /// # Errors
    /// `VoxError::ConnectFailed` when the endpoint cannot be reached or
    /// rejects the setup.
    fn connect(&self, config: &ConnectConfig) -> ConnectFuture;
}
