//! Session coordinator
//!
//! One task owns both channel clients, the playback queue, the frame buffer
//! and the pacer. Everything that happens to a session passes through the
//! single `select!` loop in `run`, and the observable state is recomputed
//! after each dispatched event.

use crate::config::SessionConfig;
use crate::control_client::{ControlClient, ControlState};
use crate::error::{ChannelError, Result};
use crate::events::{ChannelEvent, ControlEvent, FrameEvent, PlaybackSessionState, SessionEvent};
use crate::frame_client::FrameClient;
use crate::frames::{FrameBuffer, FramePacer};
use crate::latency::{LatencySummary, LatencyTracker};
use crate::playback::{AudioOutput, AudioPlaybackQueue, PlaybackFinished, PlaybackNotifier, QueueEvent};
use crate::recorder::SessionRecorder;
use crate::transport::Connector;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

/// Counters for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub chunks_received: u64,
    pub chunks_played: u64,
    pub chunks_skipped: u64,
    pub frames_received: u64,
    pub frames_rendered: u64,
    /// Evicted by the buffer bound.
    pub frames_dropped: u64,
    /// Discarded because the frame channel dropped.
    pub frames_discarded: u64,
    pub face_requests: u64,
    pub control_reconnects: u64,
    pub frame_reconnects: u64,
    pub latency: Option<LatencySummary>,
}

enum Command {
    SendMessage {
        content: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Stats(oneshot::Sender<SessionStats>),
    Shutdown,
}

/// Presentation-side handle to a running session. Dropping it tears the
/// session down.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<PlaybackSessionState>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Send a user message on the control channel.
    pub async fn send_message(&self, content: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SendMessage { content: content.into(), reply })
            .map_err(|_| ChannelError::Closed)?;
        rx.await.map_err(|_| ChannelError::Closed)?
    }

    pub fn state(&self) -> PlaybackSessionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlaybackSessionState> {
        self.state_rx.clone()
    }

    /// Wait until the session reaches `target`. Returns false if the session
    /// ended first.
    pub async fn wait_for_state(&self, target: PlaybackSessionState) -> bool {
        let mut rx = self.state_rx.clone();
        let reached = rx.wait_for(|state| *state == target).await.is_ok();
        reached
    }

    /// Next event for the presentation layer, or `None` once the session ended.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }

    pub async fn stats(&self) -> Option<SessionStats> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Stats(tx)).ok()?;
        rx.await.ok()
    }

    /// Tear the session down and wait until both channels are closed.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Coordinator task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

pub struct Coordinator<O: AudioOutput> {
    control: ControlClient,
    frames: FrameClient,
    queue: AudioPlaybackQueue<O>,
    buffer: FrameBuffer,
    pacer: FramePacer,
    recorder: SessionRecorder,
    latency: LatencyTracker,
    stats: SessionStats,
    stats_interval: Duration,
    /// A chunk of the open reply has started playing.
    reply_audio_started: bool,
    state: PlaybackSessionState,
    state_tx: watch::Sender<PlaybackSessionState>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl<O: AudioOutput> Coordinator<O> {
    /// Open both channels and start the session task.
    pub fn start(config: SessionConfig, connector: Arc<dyn Connector>, output: O) -> SessionHandle {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (notifier, finished_rx) = PlaybackNotifier::channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PlaybackSessionState::Idle);

        info!(
            "Starting session: control {} / frames {} / avatar {}",
            config.control_url, config.frame_url, config.avatar
        );

        let coordinator = Self {
            control: ControlClient::connect(&config, connector.clone(), control_tx),
            frames: FrameClient::connect(&config, connector, frame_tx),
            queue: AudioPlaybackQueue::new(output, notifier),
            buffer: FrameBuffer::new(config.frame_capacity()),
            pacer: FramePacer::new(config.frame_interval()),
            recorder: SessionRecorder::new(config.record_dir.as_deref()),
            latency: LatencyTracker::new(),
            stats: SessionStats::default(),
            stats_interval: config.stats_interval,
            reply_audio_started: false,
            state: PlaybackSessionState::Idle,
            state_tx,
            events_tx,
        };

        let task = tokio::spawn(coordinator.run(command_rx, control_rx, frame_rx, finished_rx));

        SessionHandle {
            commands,
            state_rx,
            events,
            task: Some(task),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut control_rx: mpsc::UnboundedReceiver<ChannelEvent>,
        mut frame_rx: mpsc::UnboundedReceiver<ChannelEvent>,
        mut finished_rx: mpsc::UnboundedReceiver<PlaybackFinished>,
    ) {
        let period = self.stats_interval.max(Duration::from_millis(1));
        let mut stats_ticker = interval_at(Instant::now() + period, period);
        self.pacer.start();
        self.refresh_state();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::SendMessage { content, reply }) => {
                        let _ = reply.send(self.send_message(&content));
                    }
                    Some(Command::Stats(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = control_rx.recv() => {
                    for event in self.control.on_channel_event(event) {
                        self.on_control_event(event);
                    }
                }
                Some(event) = frame_rx.recv() => {
                    for event in self.frames.on_channel_event(event) {
                        self.on_frame_event(event);
                    }
                }
                Some(finished) = finished_rx.recv() => {
                    let events = self.queue.on_playback_finished(finished);
                    self.on_queue_events(events);
                }
                _ = self.pacer.tick() => self.on_tick(),
                _ = stats_ticker.tick() => self.log_stats(),
            }
            self.refresh_state();
        }

        self.teardown().await;
    }

    fn send_message(&mut self, content: &str) -> Result<()> {
        self.control.send_message(content)?;
        self.latency.message_sent();
        Ok(())
    }

    fn on_control_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Ready => {}
            ControlEvent::Disconnected => {
                // The reply in flight will never finish on this connection.
                self.reply_audio_started = false;
                self.latency.abandon();
            }
            ControlEvent::Processing => {}
            ControlEvent::SpeakingStarted | ControlEvent::SpeakingEnded => {
                self.reply_audio_started = false;
            }
            ControlEvent::Chunk(chunk) => {
                self.stats.chunks_received += 1;
                let events = self.queue.enqueue(chunk);
                self.on_queue_events(events);
            }
        }
    }

    fn on_queue_events(&mut self, events: Vec<QueueEvent>) {
        for event in events {
            let session_event = match event {
                QueueEvent::Started { sequence, text, kind } => {
                    self.on_chunk_started();
                    SessionEvent::ChunkStarted { sequence, text, kind }
                }
                QueueEvent::Finished { sequence } => {
                    self.stats.chunks_played += 1;
                    SessionEvent::ChunkFinished { sequence }
                }
                QueueEvent::Skipped { sequence, reason } => {
                    self.stats.chunks_skipped += 1;
                    SessionEvent::ChunkSkipped { sequence, reason }
                }
                QueueEvent::Drained => {
                    debug!("Playback queue drained");
                    SessionEvent::QueueDrained
                }
            };
            self.emit(session_event);
        }
    }

    /// The chunk that just started gets its face generated now, so video
    /// requests never run ahead of the audio being heard.
    fn on_chunk_started(&mut self) {
        let Some(chunk) = self.queue.now_playing() else {
            return;
        };
        if self.control.in_open_reply(chunk.sequence) {
            self.reply_audio_started = true;
        }
        // Leftovers of an earlier reply do not answer the last message.
        if self.control.answers_last_message(chunk.sequence) {
            self.latency.audio_started();
        }
        self.recorder.record_chunk(chunk);
        match self.frames.send_audio_for_face_generation(&chunk.audio) {
            Ok(()) => self.stats.face_requests += 1,
            Err(e) => warn!("No face generation for chunk {}: {}", chunk.sequence, e),
        }
    }

    fn on_frame_event(&mut self, event: FrameEvent) {
        match event {
            FrameEvent::Ready => {}
            FrameEvent::Disconnected => {
                let discarded = self.buffer.clear();
                if discarded > 0 {
                    debug!("Discarded {} buffered frames", discarded);
                }
                self.stats.frames_discarded += discarded as u64;
            }
            FrameEvent::Frame(frame) => {
                self.stats.frames_received += 1;
                self.buffer.push(frame);
            }
            FrameEvent::GenerationDone => {
                debug!("Generation done, {} frames buffered", self.buffer.len());
            }
            FrameEvent::GenerationFailed(message) => {
                warn!("Face generation error: {}", message);
            }
        }
    }

    fn on_tick(&mut self) {
        if let Some(frame) = self.pacer.release(&mut self.buffer) {
            self.stats.frames_rendered += 1;
            self.recorder.record_frame(&frame);
            self.emit(SessionEvent::FrameReady(frame));
        }
    }

    fn derive_state(&self) -> PlaybackSessionState {
        if !self.control.is_ready() || !self.frames.is_ready() {
            return PlaybackSessionState::Connecting;
        }

        let reply = self.control.state();
        if self.queue.is_playing()
            || self.queue.pending_len() > 0
            || (reply == ControlState::Speaking && self.reply_audio_started)
        {
            PlaybackSessionState::Speaking
        } else if matches!(reply, ControlState::Processing | ControlState::Speaking) {
            PlaybackSessionState::Processing
        } else {
            PlaybackSessionState::Ready
        }
    }

    fn refresh_state(&mut self) {
        let next = self.derive_state();
        if next == self.state {
            return;
        }
        info!("🔄 Session state: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.state_tx.send_replace(next);
        self.emit(SessionEvent::StateChanged(next));
    }

    fn emit(&self, event: SessionEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("Session event dropped, no listener");
        }
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_dropped: self.buffer.dropped(),
            control_reconnects: self.control.reconnects(),
            frame_reconnects: self.frames.reconnects(),
            latency: self.latency.summary(),
            ..self.stats.clone()
        }
    }

    fn log_stats(&self) {
        let s = self.snapshot();
        info!(
            "📊 chunks {} played / {} skipped, frames {} in / {} shown / {} dropped, reconnects {} control / {} frame",
            s.chunks_played,
            s.chunks_skipped,
            s.frames_received,
            s.frames_rendered,
            s.frames_dropped,
            s.control_reconnects,
            s.frame_reconnects
        );
        self.latency.log_summary();
    }

    /// Close both channels, stop the pacer and drop everything queued.
    /// Nothing is emitted to the presentation layer from here on.
    async fn teardown(&mut self) {
        info!("Tearing down session");
        self.pacer.stop();
        let chunks = self.queue.clear();
        let frames = self.buffer.clear();
        debug!("Discarded {} chunks and {} frames", chunks, frames);

        self.control.close();
        self.frames.close();
        self.control.shutdown().await;
        self.frames.shutdown().await;

        self.state = PlaybackSessionState::Idle;
        self.state_tx.send_replace(PlaybackSessionState::Idle);
        self.log_stats();
    }
}
