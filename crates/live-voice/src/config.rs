//! Session configuration.
//!
//! Precedence: defaults < TOML file (`LIVE_VOICE_CONFIG`, default `config/live-voice.toml`)
//! < environment (`LIVE_VOICE__SECTION__KEY`, e.g. `LIVE_VOICE__AUDIO__WINDOW_SIZE=2048`).

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Gemini Live WebSocket endpoint.
pub const DEFAULT_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const DEFAULT_CONFIG_PATH: &str = "config/live-voice.toml";

fn default_true() -> bool {
    true
}

/// Audio pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture rate sent upstream (default: 16000)
    pub input_sample_rate: u32,

    /// Rate of synthesized audio coming back (default: 24000)
    pub output_sample_rate: u32,

    /// Samples per capture window (default: 4096)
    pub window_size: usize,

    /// Multiplier applied to the mean absolute sample before clamping to 0..=1 (default: 10.0)
    pub level_gain: f32,

    /// Encoded windows buffered for the transport before the oldest is dropped (default: 32)
    pub outbound_queue_capacity: usize,

    /// Pending commands for the playback thread (default: 64)
    pub playback_queue_capacity: usize,

    /// Input device name; the host default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            window_size: 4096,
            level_gain: 10.0,
            outbound_queue_capacity: 32,
            playback_queue_capacity: 64,
            input_device: None,
        }
    }
}

/// Rolling transcript limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptConfig {
    /// Once the joined text exceeds this, the oldest fragments rotate out (default: 100)
    pub max_chars: usize,

    /// Hard cap on retained fragments (default: 64)
    pub max_fragments: usize,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            max_chars: 100,
            max_fragments: 64,
        }
    }
}

/// Remote model settings passed to the transport at connect time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model id without the `models/` prefix.
    pub model: String,
    /// Prebuilt voice for synthesized speech.
    pub voice_name: String,
    pub system_prompt: String,
    pub endpoint: String,
    /// Falls back to `GEMINI_API_KEY`, then `GOOGLE_API_KEY`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Ask the service for transcripts of its own speech.
    #[serde(default = "default_true")]
    pub output_transcription: bool,
    /// Bound on the setup handshake.
    pub connect_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
            voice_name: "Charon".to_string(),
            system_prompt: "You are a concise voice guide in a real-time audio link. \
                            You can navigate the app using tools if requested."
                .to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            output_transcription: true,
            connect_timeout_secs: 15,
        }
    }
}

/// Environment variables consulted, in order, when `model.api_key` is unset.
pub const API_KEY_ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "GOOGLE_API_KEY"];

impl ModelConfig {
    /// API key from config, then `GEMINI_API_KEY`, then `GOOGLE_API_KEY`.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.resolved_api_key_from(&API_KEY_ENV_VARS[..])
    }

    /// API key from config, then the first non-empty variable in `env_vars`.
    pub fn resolved_api_key_from<S: AsRef<str>>(&self, env_vars: &[S]) -> Option<String> {
        self.api_key
            .clone()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| env_vars.iter().find_map(|name| env_opt_string(name.as_ref())))
    }
}

/// Top-level configuration for a live voice session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveVoiceConfig {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub transcript: TranscriptConfig,
    #[serde(default)]
    pub model: ModelConfig,
}

impl LiveVoiceConfig {
    /// Load from the file named by `LIVE_VOICE_CONFIG` (if it exists) and the environment.
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var("LIVE_VOICE_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_path(Path::new(&path))
    }

    /// Load from a specific TOML file (skipped when missing) plus environment overrides.
    pub fn load_from_path(path: &Path) -> VoiceResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("LIVE_VOICE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: LiveVoiceConfig = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string (no environment overlay).
    pub fn from_toml_str(content: &str) -> VoiceResult<Self> {
        let config: LiveVoiceConfig =
            toml::from_str(content).map_err(|e| VoiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML. The API key is never written.
    pub fn to_toml_string(&self) -> VoiceResult<String> {
        let mut redacted = self.clone();
        redacted.model.api_key = None;
        toml::to_string_pretty(&redacted).map_err(|e| VoiceError::Config(e.to_string()))
    }

    /// Write as TOML, creating parent directories.
    pub fn save_to_path(&self, path: &Path) -> VoiceResult<()> {
        let content = self.to_toml_string()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(VoiceError::Config(
                "sample rates must be greater than zero".to_string(),
            ));
        }
        if self.audio.window_size == 0 {
            return Err(VoiceError::Config(
                "window_size must be greater than zero".to_string(),
            ));
        }
        if self.audio.outbound_queue_capacity == 0 || self.audio.playback_queue_capacity == 0 {
            return Err(VoiceError::Config(
                "queue capacities must be greater than zero".to_string(),
            ));
        }
        if !self.audio.level_gain.is_finite() || self.audio.level_gain < 0.0 {
            return Err(VoiceError::Config(format!(
                "level_gain must be a non-negative number, got {}",
                self.audio.level_gain
            )));
        }
        if self.transcript.max_fragments == 0 {
            return Err(VoiceError::Config(
                "transcript.max_fragments must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let config = LiveVoiceConfig::default();
        assert_eq!(config.audio.input_sample_rate, 16000);
        assert_eq!(config.audio.output_sample_rate, 24000);
        assert_eq!(config.audio.window_size, 4096);
        assert_eq!(config.transcript.max_chars, 100);
        assert_eq!(config.model.voice_name, "Charon");
        assert!(config.model.output_transcription);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = LiveVoiceConfig::from_toml_str(
            r#"
            [audio]
            window_size = 2048

            [model]
            voice_name = "Aoede"
            "#,
        )
        .unwrap();
        assert_eq!(config.audio.window_size, 2048);
        assert_eq!(config.audio.input_sample_rate, 16000);
        assert_eq!(config.model.voice_name, "Aoede");
        assert_eq!(config.model.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn zero_window_is_rejected() {
        let mut config = LiveVoiceConfig::default();
        config.audio.window_size = 0;
        assert!(matches!(config.validate(), Err(VoiceError::Config(_))));
    }

    #[test]
    fn zero_rate_is_rejected() {
        let mut config = LiveVoiceConfig::default();
        config.audio.output_sample_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config =
            LiveVoiceConfig::load_from_path(Path::new("definitely/not/here.toml")).unwrap();
        assert_eq!(config.audio.window_size, AudioConfig::default().window_size);
    }

    #[test]
    fn toml_round_trip_redacts_api_key() {
        let mut config = LiveVoiceConfig::default();
        config.model.api_key = Some("secret".to_string());
        config.audio.window_size = 1024;

        let rendered = config.to_toml_string().unwrap();
        assert!(!rendered.contains("secret"));

        let parsed = LiveVoiceConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.audio.window_size, 1024);
        assert_eq!(parsed.model.api_key, None);
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = LiveVoiceConfig::from_toml_str("[audio\nwindow_size = ").unwrap_err();
        assert!(matches!(err, VoiceError::Config(_)));
    }

    #[test]
    fn explicit_api_key_wins() {
        let model = ModelConfig {
            api_key: Some("  abc  ".to_string()),
            ..Default::default()
        };
        assert_eq!(model.resolved_api_key().as_deref(), Some("abc"));
        assert_eq!(model.resolved_api_key_from::<&str>(&[]).as_deref(), Some("abc"));
    }

    #[test]
    fn missing_key_without_lookup_vars_is_none() {
        let model = ModelConfig::default();
        assert_eq!(model.resolved_api_key_from::<&str>(&[]), None);
        assert_eq!(
            model.resolved_api_key_from(&["LIVE_VOICE_TEST_KEY_NEVER_SET"][..]),
            None
        );
    }
}
