//! Reconnecting message channel
//!
//! One spawned task owns the connection. It publishes its `ConnectionState`
//! on a watch channel and then emits the matching `ChannelEvent`, so a
//! consumer that sees `Opened` can already send. An unsolicited close or a
//! failed connect is followed by exactly one new attempt per
//! `reconnect_delay`, forever, until `close()`.

use crate::error::{ChannelError, Result};
use crate::events::ChannelEvent;
use crate::transport::{Connector, Wire};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a deliberate close waits for the peer to acknowledge.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Floor for the reconnect delay so a zero delay cannot spin.
const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(10);

/// Connection state of a reconnecting channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Reconnecting,
}

/// A message channel that reconnects on its own until closed.
pub struct ReconnectingChannel {
    url: String,
    state_rx: watch::Receiver<ConnectionState>,
    connection_rx: watch::Receiver<u64>,
    outbound_tx: mpsc::UnboundedSender<String>,
    shutdown_tx: watch::Sender<bool>,
    closed: bool,
    task: Option<JoinHandle<()>>,
}

impl ReconnectingChannel {
    /// Start connecting to `url`. Events are delivered on `events` until the
    /// channel is closed or the receiver is dropped.
    pub fn open(
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        reconnect_delay: Duration,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let url = url.into();
        let reconnect_delay = reconnect_delay.max(MIN_RECONNECT_DELAY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (connection_tx, connection_rx) = watch::channel(0);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(
            url.clone(),
            connector,
            reconnect_delay,
            events,
            state_tx,
            connection_tx,
            outbound_rx,
            shutdown_rx,
        ));

        Self {
            url,
            state_rx,
            connection_rx,
            outbound_tx,
            shutdown_tx,
            closed: false,
            task: Some(task),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        if self.closed {
            return ConnectionState::Closed;
        }
        *self.state_rx.borrow()
    }

    /// Number of the most recent connection, 0 before the first one opens.
    /// An `Opened` event whose number differs from this is stale.
    pub fn connection(&self) -> u64 {
        *self.connection_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Queue a payload on the open connection.
    ///
    /// Fails with `NotReady` unless the channel is open. A payload queued just
    /// before the connection drops is discarded, never replayed.
    pub fn send(&self, payload: String) -> Result<()> {
        if self.state() != ConnectionState::Open {
            return Err(ChannelError::NotReady);
        }
        if self.outbound_tx.send(payload).is_err() {
            debug!("Channel task for {} is gone, dropping payload", self.url);
        }
        Ok(())
    }

    /// Shut the connection down and stop reconnecting. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!("Closing channel {}", self.url);
        let _ = self.shutdown_tx.send(true);
    }

    /// Close and wait for the connection task to finish.
    pub async fn shutdown(&mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Channel task for {} ended abnormally: {}", self.url, e);
            }
        }
    }
}

impl Drop for ReconnectingChannel {
    fn drop(&mut self) {
        self.close();
    }
}

enum PumpExit {
    Shutdown,
    Lost(Option<String>),
}

async fn run(
    url: String,
    connector: Arc<dyn Connector>,
    reconnect_delay: Duration,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state_tx: watch::Sender<ConnectionState>,
    connection_tx: watch::Sender<u64>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    let mut connection: u64 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let connected = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            result = connector.connect(&url) => result,
        };

        match connected {
            Ok(wire) => {
                attempt = 0;
                // Anything queued while down belongs to the dead connection.
                discard_queued(&url, &mut outbound_rx);
                connection += 1;
                connection_tx.send_replace(connection);
                state_tx.send_replace(ConnectionState::Open);
                info!("🔌 Channel open: {} (connection {})", url, connection);
                if events.send(ChannelEvent::Opened { connection }).is_err() {
                    break;
                }

                match pump(wire, &mut outbound_rx, &mut shutdown_rx, &events).await {
                    PumpExit::Shutdown => break,
                    PumpExit::Lost(reason) => {
                        discard_queued(&url, &mut outbound_rx);
                        state_tx.send_replace(ConnectionState::Closed);
                        warn!("Channel {} lost: {}", url, reason.as_deref().unwrap_or("closed by peer"));
                        if events.send(ChannelEvent::Closed { reason }).is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", url, e);
            }
        }

        attempt += 1;
        state_tx.send_replace(ConnectionState::Reconnecting);
        info!("🔁 Reconnecting to {} in {:?} (attempt {})", url, reconnect_delay, attempt);
        if events.send(ChannelEvent::Reconnecting { attempt }).is_err() {
            break;
        }

        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }

    state_tx.send_replace(ConnectionState::Closed);
    debug!("Channel task for {} finished", url);
}

async fn pump(
    wire: Wire,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    shutdown_rx: &mut watch::Receiver<bool>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) -> PumpExit {
    let Wire { mut sink, mut stream } = wire;

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
                    debug!("Peer did not acknowledge close in time");
                }
                return PumpExit::Shutdown;
            }
            Some(payload) = outbound_rx.recv() => {
                if let Err(e) = sink.send(payload).await {
                    return PumpExit::Lost(Some(e.to_string()));
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(text)) => {
                    if events.send(ChannelEvent::Message(text)).is_err() {
                        return PumpExit::Shutdown;
                    }
                }
                Some(Err(e)) if !e.is_transport() => {
                    warn!("Malformed inbound payload: {}", e);
                    if events.send(ChannelEvent::MalformedMessage(e.to_string())).is_err() {
                        return PumpExit::Shutdown;
                    }
                }
                Some(Err(e)) => return PumpExit::Lost(Some(e.to_string())),
                None => return PumpExit::Lost(None),
            },
        }
    }
}

fn discard_queued(url: &str, outbound_rx: &mut mpsc::UnboundedReceiver<String>) {
    let mut dropped = 0usize;
    while outbound_rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!("Dropped {} unsent payloads for {}", dropped, url);
    }
}
