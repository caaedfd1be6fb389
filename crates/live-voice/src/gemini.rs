//! Gemini Live transport (BidiGenerateContent over WebSocket).
//!
//! Protocol flow:
//! 1. Connect to the endpoint with `?key=<api key>`.
//! 2. Send a `setup` message (model, voice, system instruction, tool declarations).
//! 3. Wait for `setupComplete`; only then is the transport handed to the session.
//! 4. Stream `realtimeInput.audio` chunks and `toolResponse`s; receive `serverContent`
//!    (audio parts, output transcription, `interrupted`) and `toolCall`s.
//! 5. On close send `realtimeInput.audioStreamEnd`, then a WebSocket Close frame.
//!
//! The service sends JSON in Binary frames as well as Text frames; both are accepted.

use crate::codec::EncodedChunk;
use crate::config::{ModelConfig, API_KEY_ENV_VARS};
use crate::error::{VoiceError, VoiceResult};
use crate::tools::{ToolCallRequest, ToolCallResponse, ToolDeclaration};
use crate::transport::{ConnectRequest, InboundMessage, LiveConnector, LiveTransport, OutboundMessage};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Build the first frame of a session.
pub fn build_setup_message(model: &ModelConfig, tools: &[ToolDeclaration]) -> Value {
    let mut setup = json!({
        "model": format!("models/{}", model.model),
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": model.voice_name }
                }
            }
        },
        "systemInstruction": {
            "parts": [{ "text": model.system_prompt }]
        }
    });

    if !tools.is_empty() {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        setup["tools"] = json!([{ "functionDeclarations": declarations }]);
    }
    if model.output_transcription {
        setup["outputAudioTranscription"] = json!({});
    }

    json!({ "setup": setup })
}

pub fn build_audio_message(chunk: &EncodedChunk) -> Value {
    json!({
        "realtimeInput": {
            "audio": { "mimeType": chunk.mime_type, "data": chunk.data }
        }
    })
}

pub fn build_tool_response_message(response: &ToolCallResponse) -> Value {
    json!({
        "toolResponse": {
            "functionResponses": [{
                "id": response.id,
                "name": response.name,
                "response": response.response,
            }]
        }
    })
}

pub fn build_audio_stream_end_message() -> Value {
    json!({ "realtimeInput": { "audioStreamEnd": true } })
}

/// Whether a server frame acknowledges the setup message.
pub fn is_setup_complete(text: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .map(|v| v.get("setupComplete").is_some())
        .unwrap_or(false)
}

/// Split one server frame into session messages, in the order they should be applied.
///
/// Unparseable and unrecognised frames yield nothing.
pub fn parse_server_message(text: &str) -> Vec<InboundMessage> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Ignoring non-JSON server frame");
            return Vec::new();
        }
    };

    let mut messages = Vec::new();

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        messages.push(InboundMessage::Error(message));
        return messages;
    }

    if let Some(content) = value.get("serverContent") {
        if content.get("interrupted").and_then(Value::as_bool) == Some(true) {
            messages.push(InboundMessage::Interrupted);
        }

        let parts = content
            .pointer("/modelTurn/parts")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        for part in parts {
            let Some(inline) = part.get("inlineData") else {
                continue;
            };
            let mime = inline.get("mimeType").and_then(Value::as_str);
            let data = inline.get("data").and_then(Value::as_str);
            match (mime, data) {
                (Some(mime), Some(data)) if mime.starts_with("audio/") => {
                    messages.push(InboundMessage::Audio(EncodedChunk::new(mime, data)));
                }
                _ => debug!("Skipping non-audio inline data part"),
            }
        }

        if let Some(text) = content
            .pointer("/outputTranscription/text")
            .and_then(Value::as_str)
        {
            if !text.trim().is_empty() {
                messages.push(InboundMessage::Transcript(text.to_string()));
            }
        }

        if content.get("turnComplete").and_then(Value::as_bool) == Some(true) {
            debug!("Model turn complete");
        }
    }

    if let Some(calls) = value
        .pointer("/toolCall/functionCalls")
        .and_then(Value::as_array)
    {
        for call in calls {
            match serde_json::from_value::<ToolCallRequest>(call.clone()) {
                Ok(request) => messages.push(InboundMessage::ToolCall(request)),
                Err(e) => warn!(error = %e, call = %call, "Ignoring malformed function call"),
            }
        }
    }

    if let Some(go_away) = value.get("goAway") {
        let reason = go_away
            .get("timeLeft")
            .and_then(Value::as_str)
            .map(|t| format!("server going away (time left {})", t))
            .unwrap_or_else(|| "server going away".to_string());
        messages.push(InboundMessage::Closed {
            reason: Some(reason),
        });
    }

    if messages.is_empty() && value.get("setupComplete").is_none() {
        debug!("Ignoring unrecognised server frame");
    }
    messages
}

/// Text of a frame carrying JSON, whichever frame type it arrived in.
fn frame_text(message: &WsMessage) -> Option<&str> {
    let text = match message {
        WsMessage::Text(text) => text.as_str(),
        WsMessage::Binary(data) => std::str::from_utf8(data).ok()?,
        _ => return None,
    };
    Some(text.trim_start_matches('\u{feff}'))
}

/// Connects sessions to the Gemini Live API.
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    /// Buffered outbound messages before `send` waits.
    pub outbound_capacity: usize,
    /// Buffered inbound messages before the socket reader waits.
    pub inbound_capacity: usize,
    /// Variables searched for an API key when the model config has none.
    pub api_key_env_vars: Vec<String>,
}

impl Default for GeminiConnector {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            inbound_capacity: 256,
            api_key_env_vars: API_KEY_ENV_VARS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

impl GeminiConnector {
    pub fn new() -> Self {
        Self::default()
    }

    async fn handshake(ws: &mut WsStream, session_id: &str) -> VoiceResult<()> {
        while let Some(frame) = ws.next().await {
            let frame = frame.map_err(|e| {
                VoiceError::Connect(format!("WebSocket error before setupComplete: {}", e))
            })?;
            if let WsMessage::Close(close) = &frame {
                let reason = close
                    .as_ref()
                    .map(|c| c.reason.to_string())
                    .unwrap_or_default();
                return Err(VoiceError::Connect(format!(
                    "connection closed before setupComplete: {}",
                    reason
                )));
            }
            let Some(text) = frame_text(&frame) else {
                continue;
            };
            if is_setup_complete(text) {
                info!(session_id = %session_id, "Gemini Live setup complete");
                return Ok(());
            }
            if let Some(InboundMessage::Error(message)) = parse_server_message(text).into_iter().next() {
                return Err(VoiceError::Connect(message));
            }
            debug!(session_id = %session_id, "Frame before setupComplete ignored");
        }
        Err(VoiceError::Connect(
            "stream ended before setupComplete".to_string(),
        ))
    }
}

#[async_trait]
impl LiveConnector for GeminiConnector {
    async fn connect(&self, request: &ConnectRequest) -> VoiceResult<LiveTransport> {
        let api_key = request
            .model
            .resolved_api_key_from(self.api_key_env_vars.as_slice())
            .ok_or_else(|| {
                VoiceError::Connect(format!(
                    "no API key: set model.api_key or one of {}",
                    self.api_key_env_vars.join(", ")
                ))
            })?;
        let url = format!("{}?key={}", request.model.endpoint, api_key);
        let budget = Duration::from_secs(request.model.connect_timeout_secs.max(1));
        let session_id = request.session_id.clone();

        info!(
            session_id = %session_id,
            model = %request.model.model,
            voice = %request.model.voice_name,
            tools = request.tools.len(),
            "Connecting to Gemini Live"
        );

        let opened = tokio::time::timeout(budget, async {
            let (mut ws, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| VoiceError::Connect(format!("failed to connect: {}", e)))?;

            let setup = build_setup_message(&request.model, &request.tools).to_string();
            ws.send(WsMessage::Text(setup))
                .await
                .map_err(|e| VoiceError::Connect(format!("failed to send setup: {}", e)))?;

            Self::handshake(&mut ws, &session_id).await?;
            Ok::<_, VoiceError>(ws)
        })
        .await
        .map_err(|_| {
            VoiceError::Connect(format!(
                "setupComplete not received within {}s",
                budget.as_secs()
            ))
        })??;

        let (sink, stream) = opened.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(self.inbound_capacity.max(1));

        tokio::spawn(outbound_loop(outbound_rx, sink, session_id.clone()));
        tokio::spawn(inbound_loop(stream, inbound_tx, session_id));

        Ok(LiveTransport {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

async fn outbound_loop(
    mut rx: mpsc::Receiver<OutboundMessage>,
    mut sink: SplitSink<WsStream, WsMessage>,
    session_id: String,
) {
    while let Some(message) = rx.recv().await {
        let frame = match &message {
            OutboundMessage::Audio(chunk) => build_audio_message(chunk),
            OutboundMessage::ToolResponse(response) => {
                debug!(session_id = %session_id, call_id = %response.id, "Sending tool response");
                build_tool_response_message(response)
            }
            OutboundMessage::AudioStreamEnd => {
                debug!(session_id = %session_id, "Sending audioStreamEnd");
                build_audio_stream_end_message()
            }
            OutboundMessage::Close => break,
        };
        if let Err(e) = sink.send(WsMessage::Text(frame.to_string())).await {
            warn!(session_id = %session_id, error = %e, "WebSocket send failed; closing outbound loop");
            return;
        }
    }

    let _ = sink.send(WsMessage::Close(None)).await;
    debug!(session_id = %session_id, "Outbound loop terminated");
}

async fn inbound_loop(
    mut stream: SplitStream<WsStream>,
    tx: mpsc::Sender<InboundMessage>,
    session_id: String,
) {
    while let Some(frame) = stream.next().await {
        let messages = match frame {
            Ok(WsMessage::Close(close)) => {
                let reason = close.map(|c| c.reason.to_string()).filter(|r| !r.is_empty());
                info!(session_id = %session_id, reason = ?reason, "Gemini Live connection closed");
                let _ = tx.send(InboundMessage::Closed { reason }).await;
                return;
            }
            Ok(frame) => match frame_text(&frame) {
                Some(text) => parse_server_message(text),
                None => continue,
            },
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Gemini Live WebSocket error");
                let _ = tx
                    .send(InboundMessage::Error(format!("WebSocket error: {}", e)))
                    .await;
                return;
            }
        };

        for message in messages {
            if tx.send(message).await.is_err() {
                debug!(session_id = %session_id, "Session gone; closing inbound loop");
                return;
            }
        }
    }
    debug!(session_id = %session_id, "Inbound loop terminated");
}
