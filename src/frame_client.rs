//! Frame channel client
//!
//! Selects the avatar on every (re)connect, forwards audio for face
//! generation, and turns inbound frame messages into `VideoFrame`s.

use crate::channel::{ConnectionState, ReconnectingChannel};
use crate::config::SessionConfig;
use crate::error::{ChannelError, ProtocolError, Result};
use crate::events::{ChannelEvent, FrameEvent, VideoFrame};
use crate::protocol::{decode_payload, FrameInbound, FrameOutbound};
use crate::transport::Connector;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLinkState {
    Connecting,
    Ready,
}

pub struct FrameClient {
    channel: ReconnectingChannel,
    state: FrameLinkState,
    avatar: String,
    requests: u64,
}

impl FrameClient {
    pub fn connect(
        config: &SessionConfig,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let channel = ReconnectingChannel::open(
            config.frame_url.clone(),
            connector,
            config.reconnect_delay,
            events,
        );
        Self {
            channel,
            state: FrameLinkState::Connecting,
            avatar: config.avatar.clone(),
            requests: 0,
        }
    }

    pub fn state(&self) -> FrameLinkState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == FrameLinkState::Ready
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    pub fn reconnects(&self) -> u64 {
        self.channel.connection().saturating_sub(1)
    }

    /// Generation requests sent so far.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Ask the generator for the face frames matching `wav`.
    pub fn send_audio_for_face_generation(&mut self, wav: &[u8]) -> Result<()> {
        if !self.is_ready() {
            return Err(ChannelError::NotReady);
        }
        let payload = FrameOutbound::audio_wav(wav)
            .to_json()
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        self.channel.send(payload)?;
        self.requests += 1;
        debug!("Requested face generation for {} bytes of audio", wav.len());
        Ok(())
    }

    pub fn on_channel_event(&mut self, event: ChannelEvent) -> Vec<FrameEvent> {
        match event {
            ChannelEvent::Opened { connection } => {
                if connection != self.channel.connection() {
                    debug!("Ignoring open of superseded frame connection {}", connection);
                    return Vec::new();
                }
                self.select_avatar()
            }
            ChannelEvent::Message(text) => match FrameInbound::parse(&text) {
                Ok(message) => self.on_message(message),
                Err(e) => {
                    warn!("Dropping frame message: {}", e);
                    Vec::new()
                }
            },
            ChannelEvent::MalformedMessage(reason) => {
                warn!("Malformed frame payload: {}", reason);
                Vec::new()
            }
            ChannelEvent::Closed { .. } => {
                let was = std::mem::replace(&mut self.state, FrameLinkState::Connecting);
                if was == FrameLinkState::Ready {
                    warn!("Frame channel lost");
                    vec![FrameEvent::Disconnected]
                } else {
                    Vec::new()
                }
            }
            ChannelEvent::Reconnecting { attempt } => {
                debug!("Frame channel reconnect attempt {}", attempt);
                self.state = FrameLinkState::Connecting;
                Vec::new()
            }
        }
    }

    fn select_avatar(&mut self) -> Vec<FrameEvent> {
        let sent = FrameOutbound::SelectAvatar { avatar: self.avatar.clone() }
            .to_json()
            .map_err(|e| ChannelError::Protocol(e.to_string()))
            .and_then(|payload| self.channel.send(payload));
        match sent {
            Ok(()) => {
                info!("🎭 Frame channel ready, avatar {}", self.avatar);
                self.state = FrameLinkState::Ready;
                vec![FrameEvent::Ready]
            }
            Err(e) => {
                error!("Failed to select avatar: {}", e);
                Vec::new()
            }
        }
    }

    fn on_message(&mut self, message: FrameInbound) -> Vec<FrameEvent> {
        match message {
            FrameInbound::Frame { data, blend_shapes } => match decode_frame(&data, blend_shapes) {
                Ok(frame) => vec![FrameEvent::Frame(frame)],
                Err(e) => {
                    warn!("Dropping frame: {}", e);
                    Vec::new()
                }
            },
            FrameInbound::Done => {
                debug!("Face generation done");
                vec![FrameEvent::GenerationDone]
            }
            FrameInbound::Error { message } => {
                warn!("Face generation failed: {}", message);
                vec![FrameEvent::GenerationFailed(message)]
            }
            FrameInbound::Unknown => {
                debug!("Ignoring unknown frame message");
                Vec::new()
            }
        }
    }

    pub fn close(&mut self) {
        self.channel.close();
        self.state = FrameLinkState::Connecting;
    }

    pub async fn shutdown(&mut self) {
        self.channel.shutdown().await;
        self.state = FrameLinkState::Connecting;
    }
}

fn decode_frame(
    data: &str,
    blend_shapes: Option<HashMap<String, f64>>,
) -> std::result::Result<VideoFrame, ProtocolError> {
    let mut frame = VideoFrame::new(decode_payload(data, "frame")?);
    frame.blend_shapes = blend_shapes.map(clamp_blend_shapes);
    Ok(frame)
}

/// Keep finite weights, clamped to `[0, 1]`.
pub fn clamp_blend_shapes(raw: HashMap<String, f64>) -> BTreeMap<String, f32> {
    raw.into_iter()
        .filter(|(_, weight)| weight.is_finite())
        .map(|(name, weight)| (name, weight.clamp(0.0, 1.0) as f32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryConnector, MemoryPeer};
    use serde_json::json;
    use std::time::Duration;

    const URL: &str = "mem://frames";

    async fn connected() -> (FrameClient, mpsc::UnboundedReceiver<ChannelEvent>, MemoryPeer, MemoryConnector) {
        let config = SessionConfig {
            frame_url: URL.into(),
            avatar: "ada".into(),
            ..Default::default()
        };
        let connector = MemoryConnector::new();
        let mut peer = connector.accept_next(URL);
        let (tx, mut events) = mpsc::unbounded_channel();
        let mut client = FrameClient::connect(&config, Arc::new(connector.clone()), tx);

        let opened = events.recv().await.unwrap();
        assert_eq!(client.on_channel_event(opened), vec![FrameEvent::Ready]);
        assert_eq!(
            peer.recv_json().await.unwrap(),
            json!({"type": "select_avatar", "avatar": "ada"})
        );
        (client, events, peer, connector)
    }

    #[test]
    fn test_clamp_blend_shapes() {
        let raw = HashMap::from([
            ("jawOpen".to_string(), 0.25),
            ("smile".to_string(), 1.7),
            ("frown".to_string(), -0.2),
            ("broken".to_string(), f64::NAN),
        ]);
        let clamped = clamp_blend_shapes(raw);
        assert_eq!(clamped.len(), 3);
        assert_eq!(clamped["jawOpen"], 0.25);
        assert_eq!(clamped["smile"], 1.0);
        assert_eq!(clamped["frown"], 0.0);
    }

    #[tokio::test]
    async fn test_audio_request_and_frames() {
        let (mut client, mut events, mut peer, _connector) = connected().await;

        client.send_audio_for_face_generation(&[1, 2, 3]).unwrap();
        assert_eq!(
            peer.recv_json().await.unwrap(),
            json!({"type": "audio_wav", "data": "AQID"})
        );
        assert_eq!(client.requests(), 1);

        peer.send_json(json!({"type": "frame", "data": "/9j/", "blend_shapes": {"jawOpen": 0.5}}));
        peer.send_json(json!({"type": "frame", "data": "not base64!"}));
        peer.send_json(json!({"type": "done"}));
        peer.send_json(json!({"type": "error", "message": "gpu busy"}));

        let frame = client.on_channel_event(events.recv().await.unwrap());
        match &frame[..] {
            [FrameEvent::Frame(f)] => {
                assert_eq!(f.image, vec![0xff, 0xd8, 0xff]);
                assert_eq!(f.blend_shapes.as_ref().unwrap()["jawOpen"], 0.5);
            }
            other => panic!("Unexpected events: {:?}", other),
        }
        assert!(client.on_channel_event(events.recv().await.unwrap()).is_empty());
        assert_eq!(
            client.on_channel_event(events.recv().await.unwrap()),
            vec![FrameEvent::GenerationDone]
        );
        assert_eq!(
            client.on_channel_event(events.recv().await.unwrap()),
            vec![FrameEvent::GenerationFailed("gpu busy".into())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reselects_avatar_after_reconnect() {
        let (mut client, mut events, peer, connector) = connected().await;
        let mut second = connector.accept_next(URL);
        drop(peer);

        assert_eq!(
            client.on_channel_event(events.recv().await.unwrap()),
            vec![FrameEvent::Disconnected]
        );
        assert!(!client.is_ready());
        assert!(matches!(
            client.send_audio_for_face_generation(&[1]),
            Err(ChannelError::NotReady)
        ));

        client.on_channel_event(events.recv().await.unwrap()); // reconnecting
        assert_eq!(
            client.on_channel_event(events.recv().await.unwrap()),
            vec![FrameEvent::Ready]
        );
        assert_eq!(
            second.recv_json().await.unwrap(),
            json!({"type": "select_avatar", "avatar": "ada"})
        );
        assert_eq!(client.reconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_open_is_ignored() {
        let config = SessionConfig { frame_url: URL.into(), ..Default::default() };
        let connector = MemoryConnector::new();
        let first = connector.accept_next(URL);
        let mut second = connector.accept_next(URL);
        let (tx, mut events) = mpsc::unbounded_channel();
        let mut client = FrameClient::connect(&config, Arc::new(connector.clone()), tx);

        let mut state = client.channel.subscribe_state();
        assert!(state.wait_for(|s| *s == ConnectionState::Open).await.is_ok());
        drop(first);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(client.on_channel_event(events.recv().await.unwrap()).is_empty());
        assert!(!client.is_ready());
        client.on_channel_event(events.recv().await.unwrap()); // closed
        client.on_channel_event(events.recv().await.unwrap()); // reconnecting
        assert_eq!(
            client.on_channel_event(events.recv().await.unwrap()),
            vec![FrameEvent::Ready]
        );
        assert_eq!(
            second.recv_json().await.unwrap(),
            json!({"type": "select_avatar", "avatar": "default"})
        );
        assert!(second.try_recv().is_none());
    }
}
