//! Control channel client
//!
//! Speaks the conversation protocol on top of a `ReconnectingChannel`: the
//! config handshake, outbound user messages, and the inbound reply events.
//! The client is a plain state machine; the coordinator feeds it channel
//! events and acts on the domain events it returns.

use crate::channel::{ConnectionState, ReconnectingChannel};
use crate::config::SessionConfig;
use crate::error::{ChannelError, ProtocolError, Result};
use crate::events::{AudioChunk, ChannelEvent, ChunkKind, ControlEvent};
use crate::playback::FIRST_SEQUENCE;
use crate::protocol::{decode_payload, ControlInbound, ControlOutbound};
use crate::transport::Connector;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Where the control conversation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// No open connection.
    Connecting,
    /// Connected, config sent, waiting for `config_ok`.
    Handshaking,
    Ready,
    /// A user message was sent or the server said it is working on one.
    Processing,
    /// Between `speaking_start` and `speaking_end`.
    Speaking,
}

impl ControlState {
    /// True once the handshake has been acknowledged on this connection.
    pub fn is_ready(self) -> bool {
        matches!(self, ControlState::Ready | ControlState::Processing | ControlState::Speaking)
    }
}

pub struct ControlClient {
    channel: ReconnectingChannel,
    state: ControlState,
    user_id: String,
    voice: String,
    next_sequence: u64,
    /// A user message was sent and its reply has not started yet.
    awaiting_reply: bool,
    /// First sequence of the reply opened by the last `speaking_start`.
    reply_start: Option<u64>,
    /// First sequence of the reply answering the last user message.
    answer_start: Option<u64>,
}

impl ControlClient {
    /// Open the control channel. Channel events for this client arrive on
    /// `events` and must be passed to `on_channel_event`.
    pub fn connect(
        config: &SessionConfig,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let channel = ReconnectingChannel::open(
            config.control_url.clone(),
            connector,
            config.reconnect_delay,
            events,
        );
        Self {
            channel,
            state: ControlState::Connecting,
            user_id: config.user_id.clone(),
            voice: config.voice.clone(),
            next_sequence: FIRST_SEQUENCE,
            awaiting_reply: false,
            reply_start: None,
            answer_start: None,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    /// Connections re-established after the first one.
    pub fn reconnects(&self) -> u64 {
        self.channel.connection().saturating_sub(1)
    }

    /// True while a sent user message has no reply under way.
    pub fn awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }

    /// Whether chunk `sequence` belongs to the reply currently being spoken.
    pub fn in_open_reply(&self, sequence: u64) -> bool {
        self.state == ControlState::Speaking
            && self.reply_start.is_some_and(|start| sequence >= start)
    }

    /// Whether chunk `sequence` belongs to the reply to the last user message.
    pub fn answers_last_message(&self, sequence: u64) -> bool {
        self.answer_start.is_some_and(|start| sequence >= start)
    }

    /// Send a user message. Fails with `NotReady` until the handshake is done.
    /// The session stays Processing until a reply to it starts, even when the
    /// message is sent while an earlier reply is still being spoken.
    pub fn send_message(&mut self, content: &str) -> Result<()> {
        if !self.state.is_ready() {
            return Err(ChannelError::NotReady);
        }
        let payload = ControlOutbound::Message { content: content.to_string() }
            .to_json()
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        self.channel.send(payload)?;

        info!("💬 Sent user message ({} chars)", content.chars().count());
        self.awaiting_reply = true;
        self.answer_start = None;
        if self.state == ControlState::Ready {
            self.state = ControlState::Processing;
        }
        Ok(())
    }

    pub fn on_channel_event(&mut self, event: ChannelEvent) -> Vec<ControlEvent> {
        match event {
            ChannelEvent::Opened { connection } => {
                if connection != self.channel.connection() {
                    debug!("Ignoring open of superseded control connection {}", connection);
                    return Vec::new();
                }
                self.send_config();
                Vec::new()
            }
            ChannelEvent::Message(text) => match ControlInbound::parse(&text) {
                Ok(message) => self.on_message(message),
                Err(e) => {
                    warn!("Dropping control message: {}", e);
                    Vec::new()
                }
            },
            ChannelEvent::MalformedMessage(reason) => {
                warn!("Malformed control payload: {}", reason);
                Vec::new()
            }
            ChannelEvent::Closed { .. } => {
                self.forget_replies();
                let was = std::mem::replace(&mut self.state, ControlState::Connecting);
                if was == ControlState::Connecting {
                    Vec::new()
                } else {
                    warn!("Control channel lost in state {:?}", was);
                    vec![ControlEvent::Disconnected]
                }
            }
            ChannelEvent::Reconnecting { attempt } => {
                debug!("Control channel reconnect attempt {}", attempt);
                self.state = ControlState::Connecting;
                Vec::new()
            }
        }
    }

    fn send_config(&mut self) {
        let config = ControlOutbound::Config {
            user_id: self.user_id.clone(),
            voice: self.voice.clone(),
        };
        let sent = config
            .to_json()
            .map_err(|e| ChannelError::Protocol(e.to_string()))
            .and_then(|payload| self.channel.send(payload));
        match sent {
            Ok(()) => {
                debug!("Sent config for user {} with voice {}", self.user_id, self.voice);
                self.state = ControlState::Handshaking;
            }
            Err(e) => error!("Failed to send config handshake: {}", e),
        }
    }

    fn on_message(&mut self, message: ControlInbound) -> Vec<ControlEvent> {
        if message != ControlInbound::ConfigOk && !self.state.is_ready() {
            warn!("Ignoring {} before handshake", message_kind(&message));
            return Vec::new();
        }

        match message {
            ControlInbound::ConfigOk => {
                if self.state != ControlState::Handshaking {
                    debug!("Ignoring config_ok in state {:?}", self.state);
                    return Vec::new();
                }
                info!("✅ Control channel ready");
                self.state = ControlState::Ready;
                vec![ControlEvent::Ready]
            }
            ControlInbound::Processing => {
                debug!("Server is processing");
                if self.state == ControlState::Ready {
                    self.state = ControlState::Processing;
                }
                vec![ControlEvent::Processing]
            }
            ControlInbound::SpeakingStart => {
                info!("🗣️ Speaking started");
                self.state = ControlState::Speaking;
                self.reply_start = Some(self.next_sequence);
                if std::mem::take(&mut self.awaiting_reply) {
                    self.answer_start = Some(self.next_sequence);
                }
                vec![ControlEvent::SpeakingStarted]
            }
            ControlInbound::Speech { audio_base64, text } => {
                self.chunk(&audio_base64, text, ChunkKind::Speech)
            }
            ControlInbound::Filler { audio_base64, text } => {
                self.chunk(&audio_base64, text, ChunkKind::Filler)
            }
            ControlInbound::SpeakingEnd => {
                info!("🤐 Speaking ended");
                self.state = if self.awaiting_reply {
                    ControlState::Processing
                } else {
                    ControlState::Ready
                };
                vec![ControlEvent::SpeakingEnded]
            }
            ControlInbound::Unknown => {
                debug!("Ignoring unknown control message");
                Vec::new()
            }
        }
    }

    fn chunk(&mut self, audio_base64: &str, text: String, kind: ChunkKind) -> Vec<ControlEvent> {
        match decode_audio(audio_base64, kind) {
            Ok(audio) => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                debug!("Chunk {} ({:?}, {} bytes)", sequence, kind, audio.len());
                vec![ControlEvent::Chunk(AudioChunk { audio, text, sequence, kind })]
            }
            Err(e) => {
                warn!("Dropping {:?} chunk: {}", kind, e);
                Vec::new()
            }
        }
    }

    /// A lost connection abandons the reply in flight and any message
    /// still waiting for one.
    fn forget_replies(&mut self) {
        self.awaiting_reply = false;
        self.reply_start = None;
        self.answer_start = None;
    }

    /// Stop the channel; no reconnect follows.
    pub fn close(&mut self) {
        self.channel.close();
        self.forget_replies();
        self.state = ControlState::Connecting;
    }

    pub async fn shutdown(&mut self) {
        self.channel.shutdown().await;
        self.forget_replies();
        self.state = ControlState::Connecting;
    }
}

fn decode_audio(data: &str, kind: ChunkKind) -> std::result::Result<Vec<u8>, ProtocolError> {
    let label = match kind {
        ChunkKind::Speech => "speech",
        ChunkKind::Filler => "filler",
    };
    decode_payload(data, label)
}

fn message_kind(message: &ControlInbound) -> &'static str {
    match message {
        ControlInbound::ConfigOk => "config_ok",
        ControlInbound::Processing => "processing",
        ControlInbound::SpeakingStart => "speaking_start",
        ControlInbound::Speech { .. } => "speech",
        ControlInbound::Filler { .. } => "filler",
        ControlInbound::SpeakingEnd => "speaking_end",
        ControlInbound::Unknown => "unknown",
    }
}
