//! avsync - run one avatar session from the terminal
//!
//! Reads user messages from stdin, one per line, and logs what the
//! presentation layer would show. Ctrl-C or end of input ends the session.

#![forbid(unsafe_code)]

use avsync::{Coordinator, SessionConfig, SessionEvent, SessionHandle, VideoFrame, WsConnector};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("avsync=info")),
        )
        .init();

    match dotenvy::dotenv() {
        Ok(path) => debug!("Loaded {}", path.display()),
        Err(e) => debug!("No .env file loaded: {}", e),
    }

    let config = SessionConfig::from_env()?;
    info!("Starting avsync");

    let session = start(config);
    run(session).await;

    info!("Bye");
    Ok(())
}

#[cfg(not(feature = "pulse"))]
fn start(config: SessionConfig) -> SessionHandle {
    info!("Audio output: WAV clock (headless)");
    Coordinator::start(config, Arc::new(WsConnector), avsync::WavClockOutput::new())
}

#[cfg(feature = "pulse")]
fn start(config: SessionConfig) -> SessionHandle {
    info!("Audio output: PulseAudio");
    Coordinator::start(config, Arc::new(WsConnector), avsync::playback::PulseOutput::new("avsync"))
}

async fn run(mut session: SessionHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if let Err(e) = session.send_message(line).await {
                        warn!("Message not sent ({:?}): {}", session.state(), e);
                    }
                }
                Ok(None) => {
                    info!("End of input");
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },
            event = session.next_event() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
        }
    }

    if let Some(stats) = session.stats().await {
        info!("Final stats: {:?}", stats);
    }
    session.shutdown().await;
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(state) => info!("State: {:?}", state),
        SessionEvent::ChunkStarted { sequence, text, kind } => {
            info!("▶️ [{}] {:?}: {}", sequence, kind, text)
        }
        SessionEvent::ChunkFinished { sequence } => debug!("Chunk {} finished", sequence),
        SessionEvent::ChunkSkipped { sequence, reason } => {
            warn!("Chunk {} skipped: {}", sequence, reason)
        }
        SessionEvent::QueueDrained => debug!("Queue drained"),
        SessionEvent::FrameReady(frame) => {
            if let Some(line) = describe_frame(frame) {
                debug!("{}", line);
            }
        }
    }
}

/// Frame summary for the debug log. The JPEG header is only probed when
/// debug output is on.
fn describe_frame(frame: &VideoFrame) -> Option<String> {
    if !tracing::enabled!(Level::DEBUG) {
        return None;
    }
    Some(match frame.dimensions() {
        Some((w, h)) => format!("Frame {}x{} ({} bytes)", w, h, frame.image.len()),
        None => format!("Frame ({} bytes, unknown format)", frame.image.len()),
    })
}
