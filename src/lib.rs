//! avsync - dual-stream avatar media coordinator
//!
//! Receives synthesized speech over a control channel and rendered face
//! frames over a frame channel, plays the speech strictly in order, and paces
//! the frames to a fixed display rate. Both channels reconnect on their own.

#![forbid(unsafe_code)]

/// Reconnecting message channel
pub mod channel;
/// Session configuration
pub mod config;
/// Control channel client (handshake, user messages, speech chunks)
pub mod control_client;
/// Session coordinator and presentation handle
pub mod coordinator;
pub mod error;
pub mod events;
/// Frame channel client (avatar selection, face generation requests)
pub mod frame_client;
/// Frame buffer and display pacer
pub mod frames;
pub mod latency;
/// Sequential audio playback
pub mod playback;
/// Wire messages
pub mod protocol;
pub mod recorder;
/// Connection seam (WebSocket and in-memory)
pub mod transport;

pub use channel::{ConnectionState, ReconnectingChannel};
pub use config::SessionConfig;
pub use coordinator::{Coordinator, SessionHandle, SessionStats};
pub use error::{ChannelError, ConfigError, MediaDecodeError, ProtocolError};
pub use events::{AudioChunk, ChunkKind, PlaybackSessionState, SessionEvent, VideoFrame};
pub use playback::{AudioOutput, ManualOutput, ManualOutputHandle, WavClockOutput};
pub use transport::{Connector, MemoryConnector, MemoryPeer, WsConnector};
