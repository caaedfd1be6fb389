//! **VoiceSession**: lifecycle, dispatch loop, and scoped teardown for one conversation.
//!
//! ```text
//! Connecting ──handshake + devices──▶ Active ──close()──────────▶ Closed
//!     │                                  │ ──remote close─────────▶ Closed
//!     └──connect/device failure──▶ Error ◀── transport/device fault
//! ```
//!
//! Once Active, four activities run independently:
//! capture (device-driven, feeds the [`OutboundQueue`]), the sender task (queue + tool
//! responses to the transport), the playback thread (output-clock driven), and the
//! dispatch loop (transport-driven). They only talk through bounded channels, the
//! shared mute flag, and the level meter.
//!
//! Every exit path runs the same teardown: cancel, stop capture and release the input,
//! silence and release the output, tell the remote the stream ended.

use crate::capture::{AudioLevel, CaptureStage, MuteFlag, OutboundQueue};
use crate::config::LiveVoiceConfig;
use crate::devices::AudioBackend;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{PlaybackCommand, PlaybackHandle};
use crate::tools::{ToolCallResponse, ToolCallRouter};
use crate::transcript::Transcript;
use crate::transport::{ConnectRequest, InboundMessage, LiveConnector, LiveTransport, OutboundMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Pending tool responses waiting for the sender task.
const TOOL_RESPONSE_CAPACITY: usize = 16;

/// Session lifecycle. `Closed` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Active,
    Closed,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Error)
    }

    fn can_become(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Connecting, Active) | (Connecting | Active, Closed) | (Connecting | Active, Error)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
            SessionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Point-in-time view for hosts that poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub muted: bool,
    pub audio_level: f32,
    pub transcript: String,
    /// Why the session entered `Error`, if it did.
    pub error: Option<String>,
}

struct Shared {
    id: String,
    started_at: DateTime<Utc>,
    status: watch::Sender<SessionStatus>,
    error: Mutex<Option<String>>,
    transcript: Mutex<Transcript>,
    mute: MuteFlag,
    level: AudioLevel,
    cancel: CancellationToken,
}

impl Shared {
    /// Apply a legal transition; illegal ones (including anything out of a terminal
    /// state) are ignored. Returns whether the status changed.
    fn transition(&self, next: SessionStatus) -> bool {
        let changed = self.status.send_if_modified(|current| {
            if current.can_become(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            info!(session_id = %self.id, status = %next, "Session status changed");
        }
        changed
    }

    fn fail(&self, err: &VoiceError) {
        if !self.status().is_terminal() {
            *lock(&self.error) = Some(err.to_string());
        }
        if self.transition(SessionStatus::Error) {
            error!(session_id = %self.id, error = %err, "Session failed");
        }
        self.cancel.cancel();
    }

    fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to one live voice conversation.
///
/// All reads are cheap and never wait on I/O. Dropping the handle closes the session.
pub struct VoiceSession {
    shared: Arc<Shared>,
    supervisor: Option<JoinHandle<()>>,
}

impl VoiceSession {
    /// Start a session in `Connecting` and return immediately.
    ///
    /// The transport is connected first; the microphone and speaker are acquired only
    /// after the handshake succeeds. Must be called from within a tokio runtime.
    pub fn open(
        config: LiveVoiceConfig,
        connector: Arc<dyn LiveConnector>,
        backend: Arc<dyn AudioBackend>,
        router: ToolCallRouter,
    ) -> VoiceResult<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| VoiceError::Unknown(format!("no tokio runtime: {}", e)))?;

        let id = uuid::Uuid::new_v4().to_string();
        let (status, _) = watch::channel(SessionStatus::Connecting);
        let shared = Arc::new(Shared {
            id: id.clone(),
            started_at: Utc::now(),
            status,
            error: Mutex::new(None),
            transcript: Mutex::new(Transcript::new(&config.transcript)),
            mute: MuteFlag::new(),
            level: AudioLevel::new(),
            cancel: CancellationToken::new(),
        });

        info!(session_id = %id, model = %config.model.model, tools = router.len(), "Opening voice session");
        let supervisor = runtime.spawn(supervise(shared.clone(), config, connector, backend, router));

        Ok(Self {
            shared,
            supervisor: Some(supervisor),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// When `open` was called.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.shared.started_at
    }

    /// Receiver that observes every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    /// The failure that put the session in `Error`.
    pub fn error(&self) -> Option<String> {
        lock(&self.shared.error).clone()
    }

    /// Transcript fragments joined by spaces.
    pub fn transcript(&self) -> String {
        lock(&self.shared.transcript).text()
    }

    pub fn transcript_fragments(&self) -> Vec<String> {
        lock(&self.shared.transcript).fragments()
    }

    /// Latest input level in `0.0..=1.0`; zero while muted or not Active.
    pub fn audio_level(&self) -> f32 {
        self.shared.level.get()
    }

    pub fn is_muted(&self) -> bool {
        self.shared.mute.is_muted()
    }

    /// Flip mute and return the new state. Windows not yet handed to the transport are
    /// withheld from the moment this returns.
    pub fn toggle_mute(&self) -> bool {
        let muted = self.shared.mute.toggle();
        if muted {
            self.shared.level.reset();
        }
        info!(session_id = %self.shared.id, muted, "Mute toggled");
        muted
    }

    pub fn set_muted(&self, muted: bool) {
        self.shared.mute.set(muted);
        if muted {
            self.shared.level.reset();
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.shared.id.clone(),
            started_at: self.shared.started_at,
            status: self.status(),
            muted: self.is_muted(),
            audio_level: self.audio_level(),
            transcript: self.transcript(),
            error: self.error(),
        }
    }

    /// End the session. Status reads `Closed` on return; capture and playback stop
    /// without waiting for in-flight tool handlers, whose responses are discarded.
    /// No-op once terminal.
    pub fn close(&self) {
        if self.shared.transition(SessionStatus::Closed) {
            info!(session_id = %self.shared.id, "Session closed by host");
        }
        self.shared.cancel.cancel();
    }

    /// Wait until teardown has finished (devices released) and return the final status.
    pub async fn wait(&mut self) -> SessionStatus {
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                warn!(session_id = %self.shared.id, error = %e, "Session supervisor aborted");
            }
        }
        self.status()
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSession")
            .field("id", &self.shared.id)
            .field("status", &self.status())
            .field("muted", &self.is_muted())
            .finish()
    }
}

/// Why the dispatch loop stopped.
enum Exit {
    Host,
    Remote(Option<String>),
    Fault(VoiceError),
}

async fn supervise(
    shared: Arc<Shared>,
    config: LiveVoiceConfig,
    connector: Arc<dyn LiveConnector>,
    backend: Arc<dyn AudioBackend>,
    router: ToolCallRouter,
) {
    let request = ConnectRequest {
        session_id: shared.id.clone(),
        model: config.model.clone(),
        tools: router.declarations(),
    };

    let transport = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => {
            debug!(session_id = %shared.id, "Closed while connecting");
            return;
        }
        result = connector.connect(&request) => match result {
            Ok(transport) => transport,
            Err(e) => {
                shared.fail(&e);
                return;
            }
        },
    };
    info!(session_id = %shared.id, "Transport connected");

    let LiveTransport { outbound, inbound } = transport;
    let exit = match acquire_and_run(&shared, &config, backend, router, outbound.clone(), inbound).await {
        Ok(exit) => exit,
        Err(e) => Exit::Fault(e),
    };

    match exit {
        Exit::Host => {}
        Exit::Remote(reason) => {
            info!(session_id = %shared.id, reason = reason.as_deref().unwrap_or(""), "Remote ended the session");
            shared.transition(SessionStatus::Closed);
        }
        Exit::Fault(e) => shared.fail(&e),
    }
    shared.cancel.cancel();

    // Best effort: the remote may already be gone.
    let _ = outbound.try_send(OutboundMessage::AudioStreamEnd);
    let _ = outbound.try_send(OutboundMessage::Close);
    shared.level.reset();
    info!(session_id = %shared.id, status = %shared.status(), "Session torn down");
}

/// Acquire devices, go Active, and run until something ends the session. Devices are
/// released before this returns, on every path.
async fn acquire_and_run(
    shared: &Arc<Shared>,
    config: &LiveVoiceConfig,
    backend: Arc<dyn AudioBackend>,
    router: ToolCallRouter,
    outbound: mpsc::Sender<OutboundMessage>,
    mut inbound: mpsc::Receiver<InboundMessage>,
) -> VoiceResult<Exit> {
    if shared.cancel.is_cancelled() {
        return Ok(Exit::Host);
    }
    let (faults_tx, mut faults_rx) = mpsc::unbounded_channel::<VoiceError>();

    let output_backend = backend.clone();
    let output_rate = config.audio.output_sample_rate;
    let playback = PlaybackHandle::spawn(
        move || output_backend.open_output(output_rate),
        output_rate,
        config.audio.playback_queue_capacity,
        faults_tx.clone(),
    )
    .await?;

    let source = match backend.open_input(config.audio.input_sample_rate).await {
        Ok(source) => source,
        Err(e) => {
            playback.shutdown();
            return Err(e);
        }
    };

    if shared.cancel.is_cancelled() || !shared.transition(SessionStatus::Active) {
        drop(source);
        playback.shutdown();
        return Ok(Exit::Host);
    }

    let queue = Arc::new(OutboundQueue::new(config.audio.outbound_queue_capacity));
    let capture = CaptureStage::new(
        &config.audio,
        shared.mute.clone(),
        shared.level.clone(),
        queue.clone(),
    );
    let capture_task = {
        let cancel = shared.cancel.clone();
        let faults = faults_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = capture.run(source, cancel).await {
                let _ = faults.send(e);
            }
        })
    };

    let (tool_tx, tool_rx) = mpsc::channel::<ToolCallResponse>(TOOL_RESPONSE_CAPACITY);
    let sender_task = tokio::spawn(send_loop(
        shared.id.clone(),
        queue.clone(),
        tool_rx,
        outbound,
        shared.mute.clone(),
        shared.cancel.clone(),
        faults_tx,
    ));

    let commands = playback.commands();
    let exit = loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break Exit::Host,
            Some(fault) = faults_rx.recv() => {
                if fault.is_fatal() {
                    break Exit::Fault(fault);
                }
                warn!(session_id = %shared.id, error = %fault, "Contained fault");
            }
            message = inbound.recv() => {
                let Some(message) = message else {
                    break Exit::Fault(VoiceError::Transport("connection dropped".to_string()));
                };
                trace!(session_id = %shared.id, kind = message.kind(), "Inbound message");
                match message {
                    InboundMessage::Audio(chunk) => {
                        if !forward(&commands, PlaybackCommand::Enqueue(chunk), &shared.cancel).await {
                            break Exit::Host;
                        }
                    }
                    InboundMessage::Transcript(text) => {
                        lock(&shared.transcript).push(&text);
                    }
                    InboundMessage::ToolCall(request) => {
                        router.dispatch(request, tool_tx.clone(), shared.cancel.clone());
                    }
                    InboundMessage::Interrupted => {
                        debug!(session_id = %shared.id, "Remote reported barge-in");
                        if !forward(&commands, PlaybackCommand::Interrupt, &shared.cancel).await {
                            break Exit::Host;
                        }
                    }
                    InboundMessage::Closed { reason } => break Exit::Remote(reason),
                    InboundMessage::Error(message) => break Exit::Fault(VoiceError::Transport(message)),
                }
            }
        }
    };

    // Teardown: stop producers first so nothing new reaches the transport.
    shared.cancel.cancel();
    playback.shutdown();
    queue.close();
    if let Err(e) = capture_task.await {
        warn!(session_id = %shared.id, error = %e, "Capture task aborted");
    }
    if let Err(e) = sender_task.await {
        warn!(session_id = %shared.id, error = %e, "Sender task aborted");
    }
    debug!(
        session_id = %shared.id,
        dropped_windows = queue.dropped_count(),
        "Devices released"
    );
    Ok(exit)
}

/// Send to the playback thread unless the session is cancelled first.
async fn forward(
    commands: &mpsc::Sender<PlaybackCommand>,
    command: PlaybackCommand,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = commands.send(command) => {
            // The thread only exits early after reporting a fault, which the loop will see.
            if sent.is_err() {
                debug!("Playback thread gone; audio dropped");
            }
            true
        }
    }
}

/// Forward tool responses and queued capture windows to the transport. Mute is checked
/// once a transport slot is free, so windows queued before a mute are never sent after it.
async fn send_loop(
    session_id: String,
    queue: Arc<OutboundQueue>,
    mut tool_responses: mpsc::Receiver<ToolCallResponse>,
    outbound: mpsc::Sender<OutboundMessage>,
    mute: MuteFlag,
    cancel: CancellationToken,
    faults: mpsc::UnboundedSender<VoiceError>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(response) = tool_responses.recv() => {
                debug!(session_id = %session_id, call_id = %response.id, "Sending tool response");
                OutboundMessage::ToolResponse(response)
            }
            chunk = queue.pop() => match chunk {
                Some(chunk) => OutboundMessage::Audio(chunk),
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = outbound.reserve() => permit,
        };
        let Ok(permit) = permit else {
            let _ = faults.send(VoiceError::Transport("outbound channel closed".to_string()));
            break;
        };
        if matches!(message, OutboundMessage::Audio(_)) && mute.is_muted() {
            trace!(session_id = %session_id, "Muted; queued capture window withheld");
            continue;
        }
        permit.send(message);
    }
    trace!(session_id = %session_id, "Sender stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_lifecycle() {
        use SessionStatus::*;
        assert!(Connecting.can_become(Active));
        assert!(Connecting.can_become(Error));
        assert!(Connecting.can_become(Closed));
        assert!(Active.can_become(Closed));
        assert!(Active.can_become(Error));
        assert!(!Active.can_become(Connecting));
        assert!(!Closed.can_become(Active));
        assert!(!Closed.can_become(Error));
        assert!(!Error.can_become(Closed));
    }

    #[test]
    fn terminal_states() {
        assert!(SessionStatus::Closed.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::Connecting).unwrap(),
            "\"connecting\""
        );
        assert_eq!(SessionStatus::Active.to_string(), "active");
    }

    #[test]
    fn open_requires_a_runtime() {
        let (connector, _remotes) = crate::transport::ChannelConnector::new(4);
        let (backend, _feed) = crate::devices::ScriptedBackend::new();
        let result = VoiceSession::open(
            LiveVoiceConfig::default(),
            Arc::new(connector),
            Arc::new(backend),
            ToolCallRouter::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn open_rejects_invalid_config() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let mut config = LiveVoiceConfig::default();
        config.audio.window_size = 0;
        let (connector, _remotes) = crate::transport::ChannelConnector::new(4);
        let (backend, _feed) = crate::devices::ScriptedBackend::new();
        let result = VoiceSession::open(config, Arc::new(connector), Arc::new(backend), ToolCallRouter::new());
        assert!(matches!(result, Err(VoiceError::Config(_))));
    }
}
