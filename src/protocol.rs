//! Wire messages for the control and frame channels.
//!
//! Both channels carry JSON objects with a `type` discriminator. Unknown
//! types deserialize to `Unknown` and are ignored by the clients.

use crate::error::ProtocolError;
use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Control channel, server -> client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlInbound {
    ConfigOk,
    Processing,
    SpeakingStart,
    Speech {
        audio_base64: String,
        #[serde(default)]
        text: String,
    },
    Filler {
        audio_base64: String,
        #[serde(default)]
        text: String,
    },
    SpeakingEnd,
    #[serde(other)]
    Unknown,
}

/// Control channel, client -> server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlOutbound {
    Config { user_id: String, voice: String },
    Message { content: String },
}

/// Frame channel, server -> client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameInbound {
    Frame {
        data: String,
        #[serde(default)]
        blend_shapes: Option<HashMap<String, f64>>,
    },
    Done,
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

/// Frame channel, client -> server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameOutbound {
    SelectAvatar { avatar: String },
    AudioWav { data: String },
}

impl ControlInbound {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl FrameInbound {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ControlOutbound {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl FrameOutbound {
    /// Wrap raw WAV bytes for face generation.
    pub fn audio_wav(bytes: &[u8]) -> Self {
        FrameOutbound::AudioWav { data: general_purpose::STANDARD.encode(bytes) }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decode a base64 media payload, rejecting empty results.
pub fn decode_payload(data: &str, kind: &'static str) -> Result<Vec<u8>, ProtocolError> {
    let bytes = general_purpose::STANDARD.decode(data.trim())?;
    if bytes.is_empty() {
        return Err(ProtocolError::EmptyPayload(kind));
    }
    Ok(bytes)
}
