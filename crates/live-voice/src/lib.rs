//! # Live Voice - Real-time Duplex Voice Sessions
//!
//! Streams microphone audio to a remote live-audio model, plays its synthesized speech
//! back without gaps, honours barge-in, and routes the model's function calls to host
//! handlers with exactly one correlated response each.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          VoiceSession                              │
//! │  ┌──────────────┐   ┌───────────────┐   ┌──────────────────────┐ │
//! │  │  Mic (cpal)  │ → │ CaptureStage  │ → │ OutboundQueue        │ │
//! │  │ FrameSource  │   │ window / mute │   │ (drop-oldest)        │ │
//! │  └──────────────┘   └───────────────┘   └──────────┬───────────┘ │
//! │                                                     ↓             │
//! │  ┌──────────────┐   ┌───────────────┐   ┌──────────────────────┐ │
//! │  │Speaker(rodio)│ ← │   Playback    │ ← │  LiveTransport       │ │
//! │  │ AudioOutput  │   │   Scheduler   │   │  (Gemini Live / WS)  │ │
//! │  └──────────────┘   └───────────────┘   └──────────┬───────────┘ │
//! │                                                     ↓             │
//! │                     ┌───────────────┐   ┌──────────────────────┐ │
//! │                     │  Transcript   │   │  ToolCallRouter      │ │
//! │                     └───────────────┘   └──────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod codec;
pub mod config;
pub mod devices;
pub mod error;
pub mod gemini;
pub mod playback;
pub mod session;
pub mod tools;
pub mod transcript;
pub mod transport;

pub use capture::{AudioLevel, CaptureStage, MuteFlag, OutboundQueue};
pub use codec::{AudioFrame, AudioFrameCodec, EncodedChunk};
pub use config::{AudioConfig, LiveVoiceConfig, ModelConfig, TranscriptConfig};
pub use devices::{
    AudioBackend, CpalBackend, FrameSource, InputFeed, ManualClock, RecordingOutput,
    ScriptedBackend,
};
pub use error::{CodecError, VoiceError, VoiceResult};
pub use gemini::GeminiConnector;
pub use playback::{AudioOutput, PlaybackScheduler, PlaybackSlot};
pub use session::{SessionSnapshot, SessionStatus, VoiceSession};
pub use tools::{
    NavigateHandler, OnNavigate, ToolCallRequest, ToolCallResponse, ToolCallRouter,
    ToolDeclaration, ToolError, ToolHandler,
};
pub use transcript::Transcript;
pub use transport::{
    ChannelConnector, ConnectRequest, InboundMessage, LiveConnector, LiveTransport,
    OutboundMessage, RemoteEnd,
};
