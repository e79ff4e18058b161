//! Transport seam between a reconnecting channel and the network.
//!
//! A `Connector` opens one connection and hands back its write half as a
//! `Sink<String>` and its read half as a `Stream` of text payloads. The
//! production connector speaks WebSocket through tokio-tungstenite.

use crate::error::ChannelError;
use futures_util::future::{self, BoxFuture};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

/// Write half of a connection.
pub type WireSink = Pin<Box<dyn Sink<String, Error = ChannelError> + Send>>;

/// Read half of a connection. Ends when the peer closes.
pub type WireStream = Pin<Box<dyn Stream<Item = Result<String, ChannelError>> + Send>>;

/// One established connection.
pub struct Wire {
    pub sink: WireSink,
    pub stream: WireStream,
}

impl Wire {
    pub fn new(sink: WireSink, stream: WireStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens connections to an endpoint.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Wire, ChannelError>>;
}

/// WebSocket connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Wire, ChannelError>> {
        let url = url.to_string();
        Box::pin(async move {
            info!("Connecting to {}", url);
            let (ws_stream, resp) = connect_async(url.as_str()).await?;
            debug!("WebSocket connection response: {:?}", resp.status());

            let (sink, stream) = ws_stream.split();

            let sink = sink
                .sink_map_err(ChannelError::from)
                .with(|text: String| future::ready(Ok::<_, ChannelError>(Message::text(text))));

            let stream = stream.filter_map(|message| future::ready(inbound_text(message)));

            Ok(Wire::new(Box::pin(sink), Box::pin(stream)))
        })
    }
}

/// Map a WebSocket message to a text payload. Control frames are skipped.
fn inbound_text(
    message: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<String, ChannelError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
        Ok(Message::Binary(bytes)) => Some(
            String::from_utf8(bytes.to_vec())
                .map_err(|_| ChannelError::Protocol(format!("non UTF-8 binary frame ({} bytes)", bytes.len()))),
        ),
        Ok(Message::Close(frame)) => {
            debug!("WebSocket closed by peer: {:?}", frame);
            None
        }
        Ok(_) => None,
        Err(e) => Some(Err(ChannelError::from(e))),
    }
}

/// In-process connector. Each `accept_next` call arms one future connect to
/// that URL; connects with nothing armed are refused.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    armed: HashMap<String, VecDeque<Wire>>,
    attempts: HashMap<String, usize>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the next connect to `url` and return the server side of it.
    pub fn accept_next(&self, url: &str) -> MemoryPeer {
        let (to_client, client_rx) = mpsc::unbounded_channel::<Result<String, ChannelError>>();
        let (client_tx, from_client) = mpsc::unbounded_channel::<String>();

        let sink = futures_util::sink::unfold(client_tx, |tx, text: String| async move {
            tx.send(text).map_err(|_| ChannelError::Closed)?;
            Ok::<_, ChannelError>(tx)
        });
        let stream = futures_util::stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        if let Ok(mut state) = self.inner.lock() {
            state
                .armed
                .entry(url.to_string())
                .or_default()
                .push_back(Wire::new(Box::pin(sink), Box::pin(stream)));
        }

        MemoryPeer { to_client, from_client }
    }

    /// Number of connect attempts made to `url` so far.
    pub fn attempts(&self, url: &str) -> usize {
        self.inner
            .lock()
            .map(|state| state.attempts.get(url).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Wire, ChannelError>> {
        let wire = match self.inner.lock() {
            Ok(mut state) => {
                *state.attempts.entry(url.to_string()).or_default() += 1;
                state.armed.get_mut(url).and_then(|queue| queue.pop_front())
            }
            Err(_) => None,
        };
        let url = url.to_string();
        Box::pin(async move {
            wire.ok_or_else(|| ChannelError::Connect(format!("connection refused: {}", url)))
        })
    }
}

/// Server side of a `MemoryConnector` connection. Dropping it closes the
/// connection from the server end.
pub struct MemoryPeer {
    to_client: mpsc::UnboundedSender<Result<String, ChannelError>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Deliver a text payload to the client. Returns false once the client is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Ok(text.into())).is_ok()
    }

    pub fn send_json(&self, value: serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Deliver a read error to the client.
    pub fn send_error(&self, error: ChannelError) -> bool {
        self.to_client.send(Err(error)).is_ok()
    }

    /// Next payload the client sent, or `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next payload the client sent, parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        let text = self.recv().await?;
        serde_json::from_str(&text).ok()
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.from_client.try_recv().ok()
    }
}
