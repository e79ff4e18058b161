//! End-to-end session tests over in-memory channels and a manual audio output.

use avsync::{
    ChannelError, ChunkKind, Coordinator, ManualOutput, ManualOutputHandle, MemoryConnector,
    MemoryPeer, PlaybackSessionState as State, SessionConfig, SessionEvent, SessionHandle,
    SessionStats,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const CONTROL: &str = "mem://control";
const FRAMES: &str = "mem://frames";
const WAIT: Duration = Duration::from_secs(5);

struct Session {
    handle: SessionHandle,
    control: MemoryPeer,
    frames: MemoryPeer,
    output: ManualOutputHandle,
    connector: MemoryConnector,
}

fn config() -> SessionConfig {
    SessionConfig {
        control_url: CONTROL.into(),
        frame_url: FRAMES.into(),
        user_id: "tester".into(),
        voice: "calm".into(),
        avatar: "ada".into(),
        reconnect_delay: Duration::from_millis(50),
        ..Default::default()
    }
}

async fn next_event(handle: &mut SessionHandle) -> SessionEvent {
    timeout(WAIT, handle.next_event())
        .await
        .expect("timed out waiting for a session event")
        .expect("session ended")
}

/// Next state change, skipping frame events.
async fn next_state(handle: &mut SessionHandle) -> State {
    loop {
        match next_event(handle).await {
            SessionEvent::StateChanged(state) => return state,
            SessionEvent::FrameReady(_) => continue,
            other => panic!("Expected a state change, got {:?}", other),
        }
    }
}

/// Poll the stats until `done` holds.
async fn wait_stats(handle: &SessionHandle, done: impl Fn(&SessionStats) -> bool) -> SessionStats {
    timeout(WAIT, async {
        loop {
            let stats = handle.stats().await.expect("session ended");
            if done(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for stats")
}

fn speech(kind: &str, audio: &[u8], text: &str) -> serde_json::Value {
    json!({"type": kind, "audio_base64": STANDARD.encode(audio), "text": text})
}

async fn recv_json(peer: &mut MemoryPeer) -> serde_json::Value {
    timeout(WAIT, peer.recv_json())
        .await
        .expect("timed out waiting for a client message")
        .expect("client closed the connection")
}

/// Start a session and complete both handshakes.
async fn ready_session() -> Session {
    let connector = MemoryConnector::new();
    let mut control = connector.accept_next(CONTROL);
    let mut frames = connector.accept_next(FRAMES);
    let (output, handle_out) = ManualOutput::new();
    let mut handle = Coordinator::start(config(), Arc::new(connector.clone()), output);

    assert_eq!(
        recv_json(&mut control).await,
        json!({"type": "config", "user_id": "tester", "voice": "calm"})
    );
    assert_eq!(
        recv_json(&mut frames).await,
        json!({"type": "select_avatar", "avatar": "ada"})
    );
    control.send_json(json!({"type": "config_ok"}));

    assert_eq!(next_state(&mut handle).await, State::Connecting);
    assert_eq!(next_state(&mut handle).await, State::Ready);

    Session {
        handle,
        control,
        frames,
        output: handle_out,
        connector,
    }
}

#[tokio::test]
async fn test_reply_state_sequence() {
    let mut s = ready_session().await;

    s.handle.send_message("hello").await.unwrap();
    assert_eq!(recv_json(&mut s.control).await, json!({"type": "message", "content": "hello"}));
    assert_eq!(next_state(&mut s.handle).await, State::Processing);

    s.control.send_json(json!({"type": "speaking_start"}));
    s.control.send_json(speech("speech", b"first", "Hi there."));

    assert_eq!(
        next_event(&mut s.handle).await,
        SessionEvent::ChunkStarted { sequence: 1, text: "Hi there.".into(), kind: ChunkKind::Speech }
    );
    assert_eq!(next_state(&mut s.handle).await, State::Speaking);
    assert_eq!(
        recv_json(&mut s.frames).await,
        json!({"type": "audio_wav", "data": STANDARD.encode(b"first")})
    );

    s.control.send_json(speech("speech", b"second", "How are you?"));
    s.control.send_json(json!({"type": "speaking_end"}));
    wait_stats(&s.handle, |st| st.chunks_received == 2).await;

    // The reply ended on the wire but audio is still playing.
    assert_eq!(s.handle.state(), State::Speaking);
    // Only the playing chunk has been sent for face generation.
    assert!(s.frames.try_recv().is_none());

    assert!(s.output.finish(1));
    assert_eq!(next_event(&mut s.handle).await, SessionEvent::ChunkFinished { sequence: 1 });
    assert_eq!(
        next_event(&mut s.handle).await,
        SessionEvent::ChunkStarted { sequence: 2, text: "How are you?".into(), kind: ChunkKind::Speech }
    );
    assert_eq!(
        recv_json(&mut s.frames).await,
        json!({"type": "audio_wav", "data": STANDARD.encode(b"second")})
    );
    assert_eq!(s.handle.state(), State::Speaking);

    assert!(s.output.finish(2));
    assert_eq!(next_event(&mut s.handle).await, SessionEvent::ChunkFinished { sequence: 2 });
    assert_eq!(next_event(&mut s.handle).await, SessionEvent::QueueDrained);
    assert_eq!(next_state(&mut s.handle).await, State::Ready);

    assert!(!s.output.overlapped());
    let stats = s.handle.stats().await.unwrap();
    assert_eq!(stats.chunks_played, 2);
    assert_eq!(stats.face_requests, 2);
    assert_eq!(stats.latency.map(|l| l.samples), Some(1));

    s.handle.shutdown().await;
}

#[tokio::test]
async fn test_message_sent_while_speaking_waits_for_its_reply() {
    let mut s = ready_session().await;

    s.handle.send_message("first").await.unwrap();
    assert_eq!(recv_json(&mut s.control).await["content"], "first");
    assert_eq!(next_state(&mut s.handle).await, State::Processing);

    s.control.send_json(json!({"type": "speaking_start"}));
    s.control.send_json(speech("speech", b"one", "One."));
    assert!(matches!(
        next_event(&mut s.handle).await,
        SessionEvent::ChunkStarted { sequence: 1, .. }
    ));
    assert_eq!(next_state(&mut s.handle).await, State::Speaking);

    s.handle.send_message("second").await.unwrap();
    assert_eq!(recv_json(&mut s.control).await["content"], "second");
    s.control.send_json(json!({"type": "speaking_end"}));

    assert!(s.output.finish(1));
    assert_eq!(next_event(&mut s.handle).await, SessionEvent::ChunkFinished { sequence: 1 });
    assert_eq!(next_event(&mut s.handle).await, SessionEvent::QueueDrained);
    // The first reply is over but "second" has not been answered.
    assert_eq!(next_state(&mut s.handle).await, State::Processing);
    assert_eq!(s.handle.state(), State::Processing);
    let stats = s.handle.stats().await.unwrap();
    assert_eq!(stats.latency.map(|l| l.samples), Some(1));

    s.control.send_json(json!({"type": "speaking_start"}));
    s.control.send_json(speech("speech", b"two", "Two."));
    assert!(matches!(
        next_event(&mut s.handle).await,
        SessionEvent::ChunkStarted { sequence: 2, .. }
    ));
    assert_eq!(next_state(&mut s.handle).await, State::Speaking);
    let stats = s.handle.stats().await.unwrap();
    assert_eq!(stats.latency.map(|l| l.samples), Some(2));

    assert!(s.output.finish(2));
    assert_eq!(next_event(&mut s.handle).await, SessionEvent::ChunkFinished { sequence: 2 });
    assert_eq!(next_event(&mut s.handle).await, SessionEvent::QueueDrained);
    s.control.send_json(json!({"type": "speaking_end"}));
    assert_eq!(next_state(&mut s.handle).await, State::Ready);

    s.handle.shutdown().await;
}

#[tokio::test]
async fn test_processing_until_first_chunk_of_reply() {
    let mut s = ready_session().await;

    s.control.send_json(json!({"type": "processing"}));
    assert_eq!(next_state(&mut s.handle).await, State::Processing);

    s.control.send_json(json!({"type": "speaking_start"}));
    s.control.send_json(speech("filler", b"umm", "Hmm,"));
    assert!(matches!(
        next_event(&mut s.handle).await,
        SessionEvent::ChunkStarted { sequence: 1, kind: ChunkKind::Filler, .. }
    ));
    assert_eq!(next_state(&mut s.handle).await, State::Speaking);

    // Between chunks of an open reply the session stays Speaking.
    assert!(s.output.finish(1));
    assert_eq!(next_event(&mut s.handle).await, SessionEvent::ChunkFinished { sequence: 1 });
    assert_eq!(next_event(&mut s.handle).await, SessionEvent::QueueDrained);
    assert_eq!(s.handle.state(), State::Speaking);

    s.control.send_json(json!({"type": "speaking_end"}));
    assert_eq!(next_state(&mut s.handle).await, State::Ready);

    s.handle.shutdown().await;
}

#[tokio::test]
async fn test_undecodable_chunk_is_skipped() {
    let mut s = ready_session().await;
    s.output.reject(1);

    s.handle.send_message("go").await.unwrap();
    assert_eq!(next_state(&mut s.handle).await, State::Processing);

    s.control.send_json(json!({"type": "speaking_start"}));
    s.control.send_json(speech("speech", b"broken", "lost"));
    assert!(matches!(
        next_event(&mut s.handle).await,
        SessionEvent::ChunkSkipped { sequence: 1, .. }
    ));
    assert_eq!(next_event(&mut s.handle).await, SessionEvent::QueueDrained);

    s.control.send_json(speech("speech", b"fine", "kept"));
    assert!(matches!(
        next_event(&mut s.handle).await,
        SessionEvent::ChunkStarted { sequence: 2, .. }
    ));
    assert_eq!(next_state(&mut s.handle).await, State::Speaking);
    assert_eq!(s.output.started(), vec![2]);

    let stats = s.handle.stats().await.unwrap();
    assert_eq!(stats.chunks_skipped, 1);
    assert_eq!(stats.face_requests, 1);

    s.handle.shutdown().await;
}

#[tokio::test]
async fn test_frames_are_paced_in_arrival_order() {
    let mut s = ready_session().await;

    for n in 1..=3u8 {
        s.frames.send_json(json!({"type": "frame", "data": STANDARD.encode([n])}));
    }

    let mut shown = Vec::new();
    while shown.len() < 3 {
        match next_event(&mut s.handle).await {
            SessionEvent::FrameReady(frame) => shown.push(frame.image[0]),
            other => panic!("Unexpected event {:?}", other),
        }
    }
    assert_eq!(shown, vec![1, 2, 3]);

    let stats = s.handle.stats().await.unwrap();
    assert_eq!(stats.frames_received, 3);
    assert_eq!(stats.frames_rendered, 3);

    s.handle.shutdown().await;
}

#[tokio::test]
async fn test_frame_channel_loss_shows_connecting_until_reopened() {
    let mut s = ready_session().await;

    let mut frames2 = s.connector.accept_next(FRAMES);
    drop(s.frames);

    assert_eq!(next_state(&mut s.handle).await, State::Connecting);
    assert_eq!(
        recv_json(&mut frames2).await,
        json!({"type": "select_avatar", "avatar": "ada"})
    );
    assert_eq!(next_state(&mut s.handle).await, State::Ready);

    frames2.send_json(json!({"type": "frame", "data": STANDARD.encode([42u8])}));
    match next_event(&mut s.handle).await {
        SessionEvent::FrameReady(frame) => assert_eq!(frame.image, vec![42]),
        other => panic!("Unexpected event {:?}", other),
    }

    let stats = s.handle.stats().await.unwrap();
    assert_eq!(stats.frame_reconnects, 1);
    assert_eq!(stats.control_reconnects, 0);

    s.handle.shutdown().await;
}

#[tokio::test]
async fn test_control_loss_abandons_reply() {
    let mut s = ready_session().await;

    s.handle.send_message("are you there?").await.unwrap();
    assert_eq!(next_state(&mut s.handle).await, State::Processing);

    let mut control2 = s.connector.accept_next(CONTROL);
    drop(s.control);
    assert_eq!(next_state(&mut s.handle).await, State::Connecting);
    assert!(matches!(
        s.handle.send_message("hello?").await,
        Err(ChannelError::NotReady)
    ));

    assert_eq!(recv_json(&mut control2).await["type"], "config");
    control2.send_json(json!({"type": "config_ok"}));
    assert_eq!(next_state(&mut s.handle).await, State::Ready);

    s.handle.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let mut s = ready_session().await;

    s.control.send_json(speech("speech", b"one", "one"));
    s.control.send_json(speech("speech", b"two", "two"));
    wait_stats(&s.handle, |st| st.chunks_received == 2).await;
    assert_eq!(s.output.playing(), Some(1));

    let attempts_control = s.connector.attempts(CONTROL);
    let attempts_frames = s.connector.attempts(FRAMES);

    s.handle.shutdown().await;

    assert_eq!(s.output.stops(), 1);
    assert_eq!(s.output.playing(), None);
    assert!(timeout(WAIT, s.control.recv_json()).await.unwrap().is_none());
    // Chunk 1's generation request went out before the close.
    assert_eq!(recv_json(&mut s.frames).await["type"], "audio_wav");
    assert!(timeout(WAIT, s.frames.recv()).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(s.connector.attempts(CONTROL), attempts_control);
    assert_eq!(s.connector.attempts(FRAMES), attempts_frames);
}

#[tokio::test]
async fn test_send_before_ready_is_rejected() {
    let connector = MemoryConnector::new();
    let (output, _handle) = ManualOutput::new();
    let handle = Coordinator::start(config(), Arc::new(connector.clone()), output);

    assert!(handle.wait_for_state(State::Connecting).await);
    assert!(matches!(handle.send_message("hi").await, Err(ChannelError::NotReady)));

    // Refused connects keep being retried at the fixed interval.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(connector.attempts(CONTROL) >= 2);

    handle.shutdown().await;
}
