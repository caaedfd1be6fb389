//! Error types for the live voice session

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while running a live voice session
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl VoiceError {
    /// Faults that make the transport or an audio device unusable. These end the
    /// session in `Error`; everything else is contained where it was detected.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::AudioDevice(_)
                | VoiceError::PermissionDenied(_)
                | VoiceError::AudioStream(_)
                | VoiceError::Playback(_)
                | VoiceError::Connect(_)
                | VoiceError::Transport(_)
        )
    }
}

/// Per-chunk decode failures. The offending chunk is dropped; the session continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload is not valid base64: {0}")]
    InvalidEncoding(String),

    #[error("truncated PCM payload: {0} bytes is not a whole number of 16-bit samples")]
    Truncated(usize),

    #[error("unsupported audio mime type: {0}")]
    UnsupportedMime(String),

    #[error("sample rate mismatch: chunk is {actual} Hz, expected {expected} Hz")]
    RateMismatch { expected: u32, actual: u32 },
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::PermissionDenied(err.to_string())
            }
            other => VoiceError::AudioStream(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}
