//! Voice synthesis service seam.
//!
//! The actual vendor is opaque: anything that can turn a sentence into an
//! [`AudioClip`] works. The HTTP implementation posts one request per
//! sentence and decodes the raw PCM body.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::AudioClip;

/// Error from a single synthesis call. Never fatal to the session; the
/// scheduler converts it into a Failed job and narration continues.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("synthesis request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("voice service returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("voice service returned no audio")]
    Empty,
    #[error("synthesis timed out after {0:?}")]
    Timeout(Duration),
}

/// External voice synthesis collaborator.
#[async_trait]
pub trait SpeechService: Send + Sync {
    /// Synthesize one sentence into an audio clip.
    async fn synthesize(&self, text: &str) -> Result<AudioClip, SynthesisError>;
}

/// Request body for the HTTP voice service.
#[derive(Serialize)]
struct SpeechRequest<'a> {
    input: &'a str,
    voice: &'a str,
    speed: f32,
    response_format: &'a str,
}

/// HTTP-backed voice service returning raw 16-bit little-endian PCM.
pub struct HttpSpeechService {
    client: reqwest::Client,
    url: String,
    voice: String,
    speed: f32,
    sample_rate: u32,
}

impl HttpSpeechService {
    /// Create a new service client.
    ///
    /// # Arguments
    /// * `client` - Shared HTTP client (carries the request timeout)
    /// * `url` - Speech endpoint URL
    /// * `voice` - Voice/style identifier passed through to the service
    /// * `speed` - Speech speed multiplier
    /// * `sample_rate` - Sample rate of the PCM the service returns
    pub fn new(client: reqwest::Client, url: String, voice: String, speed: f32, sample_rate: u32) -> Self {
        Self { client, url, voice, speed, sample_rate }
    }
}

#[async_trait]
impl SpeechService for HttpSpeechService {
    async fn synthesize(&self, text: &str) -> Result<AudioClip, SynthesisError> {
        debug!("Requesting synthesis for: \"{}\"", text);

        let request = SpeechRequest {
            input: text,
            voice: &self.voice,
            speed: self.speed,
            response_format: "pcm",
        };

        let response = self.client.post(&self.url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SynthesisError::Status(status));
        }

        let bytes = response.bytes().await?;
        if bytes.len() < 2 {
            return Err(SynthesisError::Empty);
        }

        // Decode s16le PCM to mono f32.
        let samples: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect();

        debug!("Received {} samples at {} Hz", samples.len(), self.sample_rate);
        Ok(AudioClip { samples, sample_rate: self.sample_rate })
    }
}
