//! Domain types and the events that flow between the session actors.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::time::Instant;

/// Whether a chunk belongs to the reply proper or is a filler utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Speech,
    Filler,
}

/// One segment of synthesized speech and its transcript fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Encoded audio (WAV).
    pub audio: Vec<u8>,
    pub text: String,
    /// Playback order; strictly increasing per session.
    pub sequence: u64,
    pub kind: ChunkKind,
}

/// One rendered still of the avatar's face.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    /// Encoded image (JPEG).
    pub image: Vec<u8>,
    /// Expression intensities, each within `[0, 1]`.
    pub blend_shapes: Option<BTreeMap<String, f32>>,
    pub arrived_at: Instant,
}

impl VideoFrame {
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image,
            blend_shapes: None,
            arrived_at: Instant::now(),
        }
    }

    /// Width and height read from the encoded image header.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        image::ImageReader::new(Cursor::new(&self.image))
            .with_guessed_format()
            .ok()?
            .into_dimensions()
            .ok()
    }
}

/// Emitted by a reconnecting channel, in transition order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A connection opened. `connection` counts connections from 1.
    Opened { connection: u64 },
    Message(String),
    /// An inbound payload that could not be read; the connection stays up.
    MalformedMessage(String),
    /// The connection was lost without `close()` being called.
    Closed { reason: Option<String> },
    Reconnecting { attempt: u32 },
}

/// Emitted by the control channel client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Handshake acknowledged by the server.
    Ready,
    Disconnected,
    Processing,
    SpeakingStarted,
    Chunk(AudioChunk),
    SpeakingEnded,
}

/// Emitted by the frame channel client.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    Ready,
    Disconnected,
    Frame(VideoFrame),
    GenerationDone,
    GenerationFailed(String),
}

/// Observable state of one avatar session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackSessionState {
    #[default]
    Idle,
    Connecting,
    Ready,
    Processing,
    Speaking,
}

/// What the presentation layer receives from a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(PlaybackSessionState),
    ChunkStarted { sequence: u64, text: String, kind: ChunkKind },
    ChunkFinished { sequence: u64 },
    ChunkSkipped { sequence: u64, reason: String },
    QueueDrained,
    /// Render this frame now; no event means hold the last one.
    FrameReady(VideoFrame),
}
