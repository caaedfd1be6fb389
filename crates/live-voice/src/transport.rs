//! Transport seam between a session and the remote live-audio service.
//!
//! A connector returns a [`LiveTransport`]: a bounded sender for outbound traffic and a
//! receiver of already-demultiplexed [`InboundMessage`]s. The wire protocol lives behind
//! the connector (see [`crate::gemini`]); [`ChannelConnector`] is an in-process loopback.

use crate::codec::EncodedChunk;
use crate::config::ModelConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::tools::{ToolCallRequest, ToolCallResponse, ToolDeclaration};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

/// One discrete message from the remote service.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Synthesized speech to schedule for playback.
    Audio(EncodedChunk),
    /// Transcript text of the remote side's speech.
    Transcript(String),
    /// Function call to route to a host handler.
    ToolCall(ToolCallRequest),
    /// The user barged in; drop pending playback.
    Interrupted,
    /// The remote side ended the session.
    Closed { reason: Option<String> },
    /// The transport failed.
    Error(String),
}

impl InboundMessage {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Audio(_) => "audio",
            InboundMessage::Transcript(_) => "transcript",
            InboundMessage::ToolCall(_) => "tool_call",
            InboundMessage::Interrupted => "interrupted",
            InboundMessage::Closed { .. } => "closed",
            InboundMessage::Error(_) => "error",
        }
    }
}

/// Traffic from the session to the remote service.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// One encoded capture window.
    Audio(EncodedChunk),
    ToolResponse(ToolCallResponse),
    /// Microphone stopped; flush buffered input.
    AudioStreamEnd,
    /// Close the connection.
    Close,
}

/// Everything a connector needs to open a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub session_id: String,
    pub model: ModelConfig,
    pub tools: Vec<ToolDeclaration>,
}

/// An open duplex connection.
#[derive(Debug)]
pub struct LiveTransport {
    pub outbound: mpsc::Sender<OutboundMessage>,
    pub inbound: mpsc::Receiver<InboundMessage>,
}

/// Opens connections to the remote live-audio service.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Resolve once the handshake has completed; fail with [`VoiceError::Connect`] otherwise.
    async fn connect(&self, request: &ConnectRequest) -> VoiceResult<LiveTransport>;
}

/// Remote half of a [`ChannelConnector`] connection.
#[derive(Debug)]
pub struct RemoteEnd {
    pub request: ConnectRequest,
    /// Push messages into the session.
    pub to_session: mpsc::Sender<InboundMessage>,
    /// Observe what the session sends.
    pub from_session: mpsc::Receiver<OutboundMessage>,
}

/// In-process connector: every `connect` hands the remote half to the paired receiver.
pub struct ChannelConnector {
    capacity: usize,
    remotes: Option<mpsc::UnboundedSender<RemoteEnd>>,
    refuse_with: Option<String>,
}

impl ChannelConnector {
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            capacity: capacity.max(1),
            remotes: Some(tx),
            refuse_with: None,
        };
        (connector, rx)
    }

    /// A connector whose every connect attempt fails with `reason`.
    pub fn refusing(reason: impl Into<String>) -> Self {
        Self {
            capacity: 1,
            remotes: None,
            refuse_with: Some(reason.into()),
        }
    }
}

#[async_trait]
impl LiveConnector for ChannelConnector {
    async fn connect(&self, request: &ConnectRequest) -> VoiceResult<LiveTransport> {
        if let Some(reason) = &self.refuse_with {
            return Err(VoiceError::Connect(reason.clone()));
        }
        let remotes = self
            .remotes
            .as_ref()
            .ok_or_else(|| VoiceError::Connect("connector has no remote side".to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::channel(self.capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.capacity);

        remotes
            .send(RemoteEnd {
                request: request.clone(),
                to_session: inbound_tx,
                from_session: outbound_rx,
            })
            .map_err(|_| VoiceError::Connect("remote side is gone".to_string()))?;

        debug!(session_id = %request.session_id, "Loopback transport connected");

        Ok(LiveTransport {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
