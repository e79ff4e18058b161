//! Error types for the avatar sync core
//!
//! Transport failures are retried by the reconnecting channel, protocol
//! failures drop the offending message, media failures skip the chunk.
//! None of them end a session.

use tokio_tungstenite::tungstenite::Error as WsError;

/// Errors raised by a reconnecting channel and its transport.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("Channel not ready")]
    NotReady,

    #[error("Connection closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connect failed: {0}")]
    Connect(String),
}

impl ChannelError {
    /// True when the error poisons the connection and a reconnect is needed.
    pub fn is_transport(&self) -> bool {
        !matches!(self, ChannelError::Protocol(_) | ChannelError::NotReady)
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// A wire message that could not be turned into a domain event.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Empty payload in {0} message")]
    EmptyPayload(&'static str),
}

/// An audio payload that could not be played.
#[derive(Debug, thiserror::Error)]
pub enum MediaDecodeError {
    #[error("WAV decode error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Audio payload is empty")]
    Empty,

    #[error("Unsupported audio format: {0}")]
    Unsupported(String),

    #[error("Audio device error: {0}")]
    Device(String),
}

/// Invalid configuration values read from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be set")]
    Missing { name: &'static str },

    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}
