use thiserror::Error;

/// All errors produced by voxlink-core.
#[derive(Debug, Error)]
pub enum VoxError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("malformed audio chunk: {0}")]
    MalformedChunk(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("session start cancelled by stop")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoxError>;
