//! PCM framing for the live transport.
//!
//! Audio travels as mono 16-bit little-endian PCM, base64-wrapped and tagged with a
//! MIME type such as `audio/pcm;rate=16000`. No resampling happens here: capture and
//! playback each own a codec fixed to their configured rate.

use crate::error::CodecError;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// MIME type prefix for raw PCM payloads.
pub const PCM_MIME: &str = "audio/pcm";

/// A contiguous block of mono samples at a known sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Samples normalized to -1.0..=1.0.
    pub samples: Vec<f32>,
    /// Rate the samples were produced at (capture) or must be played at (playback).
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Playback duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Transport-safe audio payload: base64 PCM plus its MIME tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedChunk {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// Base64 (standard alphabet, padded) 16-bit LE PCM.
    pub data: String,
}

impl EncodedChunk {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Wrap raw PCM bytes.
    pub fn from_pcm_bytes(bytes: &[u8], sample_rate: u32) -> Self {
        Self {
            mime_type: pcm_mime(sample_rate),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// True when the tag names raw PCM (any rate).
    pub fn is_pcm(&self) -> bool {
        self.mime_type
            .split(';')
            .next()
            .map(|base| base.trim().eq_ignore_ascii_case(PCM_MIME))
            .unwrap_or(false)
    }

    /// The `rate=` parameter of the MIME tag, if present and numeric.
    pub fn sample_rate(&self) -> Option<u32> {
        self.mime_type.split(';').skip(1).find_map(|param| {
            let (key, value) = param.split_once('=')?;
            if key.trim().eq_ignore_ascii_case("rate") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
    }
}

/// `audio/pcm;rate=<rate>`
pub fn pcm_mime(sample_rate: u32) -> String {
    format!("{};rate={}", PCM_MIME, sample_rate)
}

/// Float samples to 16-bit LE PCM: `round(s * 32767)` clamped to the i16 range.
pub fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample * 32767.0).round().clamp(i16::MIN as f32, i16::MAX as f32);
        bytes.extend_from_slice(&(scaled as i16).to_le_bytes());
    }
    bytes
}

/// 16-bit LE PCM to float samples (`value / 32768`).
pub fn pcm16_to_samples(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::Truncated(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

/// Converts between float frames and tagged PCM chunks at one fixed rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFrameCodec {
    sample_rate: u32,
}

impl AudioFrameCodec {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn encode(&self, samples: &[f32]) -> EncodedChunk {
        EncodedChunk::from_pcm_bytes(&samples_to_pcm16(samples), self.sample_rate)
    }

    /// Inverse of [`encode`](Self::encode). A chunk without a `rate=` parameter is
    /// assumed to be at this codec's rate; one tagged with another rate is rejected.
    pub fn decode(&self, chunk: &EncodedChunk) -> Result<AudioFrame, CodecError> {
        if !chunk.is_pcm() {
            return Err(CodecError::UnsupportedMime(chunk.mime_type.clone()));
        }
        if let Some(actual) = chunk.sample_rate() {
            if actual != self.sample_rate {
                return Err(CodecError::RateMismatch {
                    expected: self.sample_rate,
                    actual,
                });
            }
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(chunk.data.trim())
            .map_err(|e| CodecError::InvalidEncoding(e.to_string()))?;
        let samples = pcm16_to_samples(&bytes)?;
        Ok(AudioFrame::new(samples, self.sample_rate))
    }
}
