//! End-to-end session tests against the in-process connector and scripted devices.

use async_trait::async_trait;
use live_voice::{
    AudioFrameCodec, ChannelConnector, EncodedChunk, InboundMessage, InputFeed, LiveVoiceConfig,
    NavigateHandler, OutboundMessage, RemoteEnd, ScriptedBackend, SessionStatus, ToolCallRequest,
    ToolCallRouter, ToolError, ToolHandler, VoiceSession,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

const WINDOW: usize = 4096;
const OUTPUT_RATE: u32 = 24000;

struct Harness {
    session: VoiceSession,
    remote: RemoteEnd,
    backend: ScriptedBackend,
    feed: InputFeed,
}

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn start(router: ToolCallRouter) -> Harness {
    let (backend, feed) = ScriptedBackend::new();
    start_with(backend, feed, router).await
}

async fn start_with(backend: ScriptedBackend, feed: InputFeed, router: ToolCallRouter) -> Harness {
    start_on(64, backend, feed, router).await
}

/// Like `start_with`, with `capacity` messages of buffering in each transport direction.
async fn start_on(
    capacity: usize,
    backend: ScriptedBackend,
    feed: InputFeed,
    router: ToolCallRouter,
) -> Harness {
    init_logging();
    let (connector, mut remotes) = ChannelConnector::new(capacity);
    let session = VoiceSession::open(
        LiveVoiceConfig::default(),
        Arc::new(connector),
        Arc::new(backend.clone()),
        router,
    )
    .unwrap();
    let remote = timeout(Duration::from_secs(2), remotes.recv())
        .await
        .expect("session never connected")
        .unwrap();
    Harness {
        session,
        remote,
        backend,
        feed,
    }
}

async fn wait_for_status(session: &VoiceSession, target: SessionStatus) {
    let mut rx = session.subscribe_status();
    let reached = timeout(Duration::from_secs(2), async {
        loop {
            let status = *rx.borrow_and_update();
            if status == target {
                return true;
            }
            if status.is_terminal() || rx.changed().await.is_err() {
                return *rx.borrow() == target;
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(reached, "expected {:?}, session is {:?}", target, session.status());
}

async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Everything the session sends until its outbound side closes.
async fn drain(remote: &mut RemoteEnd) -> Vec<OutboundMessage> {
    let mut seen = Vec::new();
    while let Ok(Some(message)) = timeout(Duration::from_secs(2), remote.from_session.recv()).await {
        seen.push(message);
    }
    seen
}

fn speech(samples: usize) -> InboundMessage {
    InboundMessage::Audio(AudioFrameCodec::new(OUTPUT_RATE).encode(&vec![0.2; samples]))
}

fn call(id: &str, name: &str, args: Value) -> InboundMessage {
    InboundMessage::ToolCall(ToolCallRequest {
        id: id.to_string(),
        name: name.to_string(),
        args,
    })
}

#[tokio::test]
async fn normal_turn_streams_mic_and_plays_reply() {
    let mut h = start(ToolCallRouter::new()).await;
    wait_for_status(&h.session, SessionStatus::Active).await;
    assert!(h.backend.input_open());

    h.feed.push(vec![0.05; WINDOW]).await;
    let sent = timeout(Duration::from_secs(2), h.remote.from_session.recv())
        .await
        .unwrap()
        .unwrap();
    let OutboundMessage::Audio(chunk) = sent else {
        panic!("expected audio, got {:?}", sent);
    };
    assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
    let frame = AudioFrameCodec::new(16000).decode(&chunk).unwrap();
    assert_eq!(frame.len(), WINDOW);
    assert!((frame.samples[0] - 0.05).abs() < 1e-3);
    assert!((h.session.audio_level() - 0.5).abs() < 0.01);

    let to_session = h.remote.to_session.clone();
    to_session.send(InboundMessage::Transcript("Hello".into())).await.unwrap();
    to_session.send(speech(2400)).await.unwrap();
    to_session.send(InboundMessage::Transcript("traveler".into())).await.unwrap();
    to_session.send(speech(4800)).await.unwrap();

    let output = h.backend.output();
    assert!(eventually(|| output.played().len() == 2).await);
    let played = output.played();
    assert!((played[0].end() - played[1].start).abs() < 1e-9);
    assert!((played[1].duration - 0.2).abs() < 1e-9);
    assert!(eventually(|| h.session.transcript() == "Hello traveler").await);

    h.session.close();
    assert_eq!(h.session.status(), SessionStatus::Closed);
    assert_eq!(h.session.wait().await, SessionStatus::Closed);
    assert!(!h.backend.input_open());
    assert_eq!(h.session.audio_level(), 0.0);

    let control: Vec<OutboundMessage> = drain(&mut h.remote)
        .await
        .into_iter()
        .filter(|m| !matches!(m, OutboundMessage::Audio(_)))
        .collect();
    assert_eq!(control, vec![OutboundMessage::AudioStreamEnd, OutboundMessage::Close]);
}

#[tokio::test]
async fn barge_in_silences_and_resets_timeline() {
    let mut h = start(ToolCallRouter::new()).await;
    wait_for_status(&h.session, SessionStatus::Active).await;
    let output = h.backend.output();
    let clock = h.backend.clock();

    for _ in 0..3 {
        h.remote.to_session.send(speech(2400)).await.unwrap();
    }
    assert!(eventually(|| output.played().len() == 3).await);

    clock.set(0.15);
    h.remote.to_session.send(InboundMessage::Interrupted).await.unwrap();
    h.remote.to_session.send(speech(2400)).await.unwrap();
    assert!(eventually(|| output.played().len() == 4).await);

    let played = output.played();
    assert_eq!(output.stop_count(), 1);
    assert!((played[3].start - 0.15).abs() < 1e-9);
    assert!(played[3].start < played[2].end());
    assert_eq!(h.session.status(), SessionStatus::Active);

    h.session.close();
    h.session.wait().await;
    // Teardown silences whatever is still queued.
    assert!(eventually(|| output.stop_count() == 2).await);
    drain(&mut h.remote).await;
}

#[tokio::test]
async fn mute_suppresses_send_and_level() {
    let mut h = start(ToolCallRouter::new()).await;
    wait_for_status(&h.session, SessionStatus::Active).await;

    assert!(h.session.toggle_mute());
    assert!(h.session.snapshot().muted);
    h.feed.push(vec![0.3; WINDOW * 2]).await;

    let nothing = timeout(Duration::from_millis(200), h.remote.from_session.recv()).await;
    assert!(nothing.is_err(), "muted audio reached the transport");
    assert_eq!(h.session.audio_level(), 0.0);

    assert!(!h.session.toggle_mute());
    h.feed.push(vec![0.02; WINDOW]).await;
    let sent = timeout(Duration::from_secs(2), h.remote.from_session.recv())
        .await
        .unwrap()
        .unwrap();
    let OutboundMessage::Audio(chunk) = sent else {
        panic!("expected audio, got {:?}", sent);
    };
    let frame = AudioFrameCodec::new(16000).decode(&chunk).unwrap();
    assert!((frame.samples[0] - 0.02).abs() < 1e-3);
    assert!(h.session.audio_level() > 0.0);

    h.session.close();
    h.session.wait().await;
}

#[tokio::test]
async fn mute_withholds_windows_queued_behind_a_slow_transport() {
    let (backend, feed) = ScriptedBackend::new();
    let mut h = start_on(1, backend, feed, ToolCallRouter::new()).await;
    wait_for_status(&h.session, SessionStatus::Active).await;

    // Nobody reads the transport: one window fills it, the rest back up behind it.
    h.feed.push(vec![0.1; WINDOW * 6]).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.session.toggle_mute());

    let mut audio = 0;
    while let Ok(Some(message)) =
        timeout(Duration::from_millis(300), h.remote.from_session.recv()).await
    {
        match message {
            OutboundMessage::Audio(_) => audio += 1,
            other => panic!("unexpected {:?}", other),
        }
    }
    assert!(audio <= 1, "{} windows sent after mute", audio);
    assert_eq!(h.session.audio_level(), 0.0);

    assert!(!h.session.toggle_mute());
    h.feed.push(vec![0.02; WINDOW]).await;
    let sent = timeout(Duration::from_secs(2), h.remote.from_session.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(sent, OutboundMessage::Audio(_)));

    h.session.close();
    assert_eq!(h.session.wait().await, SessionStatus::Closed);
}

#[tokio::test]
async fn every_tool_call_gets_exactly_one_response() {
    let destinations: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = destinations.clone();
    let router = ToolCallRouter::new().with_handler(Arc::new(NavigateHandler::new(Arc::new(
        move |dest: String| seen.lock().unwrap().push(dest),
    ))));

    let mut h = start(router).await;
    wait_for_status(&h.session, SessionStatus::Active).await;
    let declared: Vec<&str> = h.remote.request.tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(declared, vec!["navigateToSector"]);

    let to_session = h.remote.to_session.clone();
    to_session
        .send(call("1", "navigateToSector", json!({"destination": "ATLAS"})))
        .await
        .unwrap();
    to_session.send(call("2", "launchProbe", json!({}))).await.unwrap();
    to_session.send(call("3", "navigateToSector", json!({}))).await.unwrap();

    let mut responses = Vec::new();
    while responses.len() < 3 {
        let message = timeout(Duration::from_secs(2), h.remote.from_session.recv())
            .await
            .expect("missing tool response")
            .unwrap();
        if let OutboundMessage::ToolResponse(response) = message {
            responses.push(response);
        }
    }
    responses.sort_by(|a, b| a.id.cmp(&b.id));

    assert_eq!(responses[0].id, "1");
    assert_eq!(responses[0].response["result"], "Navigation Successful");
    assert_eq!(responses[1].name, "launchProbe");
    assert!(responses[1].response["error"]
        .as_str()
        .unwrap()
        .contains("unsupported tool"));
    assert!(responses[2].is_error());
    assert_eq!(*destinations.lock().unwrap(), vec!["ATLAS".to_string()]);

    let extra = timeout(Duration::from_millis(150), h.remote.from_session.recv()).await;
    assert!(extra.is_err(), "unexpected extra message: {:?}", extra);
    assert_eq!(h.session.status(), SessionStatus::Active);

    h.session.close();
    h.session.wait().await;
}

struct SlowHandler {
    started: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl ToolHandler for SlowHandler {
    fn name(&self) -> &str {
        "slowLookup"
    }

    async fn call(&self, _args: Value) -> Result<Value, ToolError> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(json!("done"))
    }
}

#[tokio::test]
async fn close_during_handler_discards_late_response() {
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let router = ToolCallRouter::new().with_handler(Arc::new(SlowHandler {
        started: started.clone(),
        finished: finished.clone(),
    }));

    let mut h = start(router).await;
    wait_for_status(&h.session, SessionStatus::Active).await;
    h.remote
        .to_session
        .send(call("slow-1", "slowLookup", json!({})))
        .await
        .unwrap();
    assert!(eventually(|| started.load(Ordering::SeqCst)).await);

    h.session.close();
    assert_eq!(h.session.status(), SessionStatus::Closed);
    assert_eq!(h.session.wait().await, SessionStatus::Closed);
    assert!(!finished.load(Ordering::SeqCst), "close waited for the handler");

    assert!(eventually(|| finished.load(Ordering::SeqCst)).await);
    let sent = drain(&mut h.remote).await;
    assert!(
        !sent.iter().any(|m| matches!(m, OutboundMessage::ToolResponse(_))),
        "late tool response was sent: {:?}",
        sent
    );
}

#[tokio::test]
async fn connect_failure_ends_in_error_without_devices() {
    init_logging();
    let (backend, _feed) = ScriptedBackend::new();
    let mut session = VoiceSession::open(
        LiveVoiceConfig::default(),
        Arc::new(ChannelConnector::refusing("unreachable")),
        Arc::new(backend.clone()),
        ToolCallRouter::new(),
    )
    .unwrap();

    assert_eq!(session.wait().await, SessionStatus::Error);
    assert!(session.error().unwrap().contains("unreachable"));
    assert!(!backend.input_was_opened());
    assert!(backend.output().played().is_empty());
}

#[tokio::test]
async fn denied_microphone_ends_in_error_and_closes_transport() {
    let (backend, feed) = ScriptedBackend::new();
    let backend = backend.denying_input("permission prompt dismissed");
    let mut h = start_with(backend, feed, ToolCallRouter::new()).await;

    assert_eq!(h.session.wait().await, SessionStatus::Error);
    assert!(h.session.error().unwrap().contains("permission"));
    assert!(!h.backend.input_open());

    let sent = drain(&mut h.remote).await;
    assert_eq!(sent, vec![OutboundMessage::AudioStreamEnd, OutboundMessage::Close]);
}

#[tokio::test]
async fn transport_fault_ends_in_error_and_releases_devices() {
    let mut h = start(ToolCallRouter::new()).await;
    wait_for_status(&h.session, SessionStatus::Active).await;
    h.remote.to_session.send(speech(2400)).await.unwrap();
    h.remote
        .to_session
        .send(InboundMessage::Error("connection reset".into()))
        .await
        .unwrap();

    assert_eq!(h.session.wait().await, SessionStatus::Error);
    assert!(!h.backend.input_open());
    let output = h.backend.output();
    assert!(eventually(|| output.stop_count() >= 1).await);
    assert!(h.session.error().unwrap().contains("connection reset"));
}

#[tokio::test]
async fn dropped_connection_ends_in_error() {
    let h = start(ToolCallRouter::new()).await;
    wait_for_status(&h.session, SessionStatus::Active).await;
    let Harness {
        mut session,
        remote,
        backend,
        feed: _feed,
    } = h;
    drop(remote);

    assert_eq!(session.wait().await, SessionStatus::Error);
    assert!(!backend.input_open());
}

#[tokio::test]
async fn remote_close_ends_in_closed() {
    let mut h = start(ToolCallRouter::new()).await;
    wait_for_status(&h.session, SessionStatus::Active).await;
    h.remote
        .to_session
        .send(InboundMessage::Closed {
            reason: Some("server going away".into()),
        })
        .await
        .unwrap();

    assert_eq!(h.session.wait().await, SessionStatus::Closed);
    assert_eq!(h.session.error(), None);
    assert!(!h.backend.input_open());
}

#[tokio::test]
async fn undecodable_chunk_is_dropped_and_session_stays_active() {
    let mut h = start(ToolCallRouter::new()).await;
    wait_for_status(&h.session, SessionStatus::Active).await;
    let output = h.backend.output();

    h.remote
        .to_session
        .send(InboundMessage::Audio(EncodedChunk::new(
            "audio/pcm;rate=24000",
            "!!not base64!!",
        )))
        .await
        .unwrap();
    h.remote
        .to_session
        .send(InboundMessage::Audio(EncodedChunk::new("audio/pcm;rate=8000", "AAAA")))
        .await
        .unwrap();
    h.remote.to_session.send(speech(2400)).await.unwrap();

    assert!(eventually(|| output.played().len() == 1).await);
    assert_eq!(h.session.status(), SessionStatus::Active);

    h.session.close();
    h.session.wait().await;
}

#[tokio::test]
async fn microphone_fault_mid_session_ends_in_error() {
    let mut h = start(ToolCallRouter::new()).await;
    wait_for_status(&h.session, SessionStatus::Active).await;
    h.feed.fail("device unplugged").await;

    assert_eq!(h.session.wait().await, SessionStatus::Error);
    assert!(h.session.error().unwrap().contains("device unplugged"));
    assert!(!h.backend.input_open());
}

#[tokio::test]
async fn speaker_fault_mid_session_ends_in_error() {
    let mut h = start(ToolCallRouter::new()).await;
    wait_for_status(&h.session, SessionStatus::Active).await;
    h.backend.output().fail_next_play("speaker unplugged");
    h.remote.to_session.send(speech(2400)).await.unwrap();

    assert_eq!(h.session.wait().await, SessionStatus::Error);
    assert!(h.session.error().unwrap().contains("speaker unplugged"));
}

#[tokio::test]
async fn speaker_unavailable_at_start_ends_in_error() {
    let (backend, feed) = ScriptedBackend::new();
    let backend = backend.failing_output("no output device");
    let mut h = start_with(backend, feed, ToolCallRouter::new()).await;

    assert_eq!(h.session.wait().await, SessionStatus::Error);
    assert!(!h.backend.input_was_opened());
}

#[tokio::test]
async fn snapshot_reflects_session_state() {
    let mut h = start(ToolCallRouter::new()).await;
    wait_for_status(&h.session, SessionStatus::Active).await;
    h.remote
        .to_session
        .send(InboundMessage::Transcript("Welcome".into()))
        .await
        .unwrap();
    assert!(eventually(|| !h.session.transcript().is_empty()).await);
    h.session.set_muted(true);

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.id, h.session.id());
    assert_eq!(snapshot.status, SessionStatus::Active);
    assert!(snapshot.muted);
    assert_eq!(snapshot.audio_level, 0.0);
    assert_eq!(snapshot.transcript, "Welcome");

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["status"], "active");

    h.session.close();
    h.session.wait().await;
    h.session.close();
    assert_eq!(h.session.status(), SessionStatus::Closed);
}
