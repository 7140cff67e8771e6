//! Application configuration and CLI argument parsing.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use crate::pipeline::PipelineConfig;
use crate::playback::EngineConfig;

/// Companion narrator configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "companion-voice")]
#[command(author, version, about = "Streaming sentence-to-speech narrator for companion chat", long_about = None)]
pub struct AppConfig {
    /// Chat completion endpoint URL
    #[arg(long, short = 'u', env = "CHAT_URL", default_value = "http://localhost:11434/v1/chat/completions")]
    pub chat_url: String,

    /// Chat model name
    #[arg(long, short = 'm', env = "CHAT_MODEL", default_value = "gemma3:1b")]
    pub chat_model: String,

    /// System prompt for the companion persona
    #[arg(
        long,
        short = 'p',
        default_value = "You are a warm, attentive companion. Keep replies short and conversational, in plain spoken language without markdown, lists, or special characters."
    )]
    pub system_prompt: String,

    /// Maximum conversation history length (exchanges)
    #[arg(long, default_value = "10")]
    pub max_history: usize,

    /// Voice synthesis endpoint URL
    #[arg(long, env = "VOICE_URL", default_value = "http://localhost:8880/v1/audio/speech")]
    pub voice_url: String,

    /// Voice/style identifier passed to the synthesis service
    #[arg(long, default_value = "af_bella")]
    pub voice: String,

    /// Speech speed multiplier
    #[arg(long, default_value = "1.0")]
    pub voice_speed: f32,

    /// Sample rate of the PCM returned by the voice service
    #[arg(long, default_value = "24000")]
    pub voice_sample_rate: u32,

    /// Maximum simultaneous synthesis calls
    #[arg(long, default_value = "3")]
    pub synth_concurrency: usize,

    /// Per-call synthesis timeout in seconds
    #[arg(long, default_value = "15")]
    pub synth_timeout_secs: u64,

    /// Text-reveal estimate per character, in milliseconds
    #[arg(long, default_value = "45")]
    pub reveal_ms_per_char: u64,

    /// Reveal is rescheduled when audio duration drifts past this, in milliseconds
    #[arg(long, default_value = "250")]
    pub reveal_threshold_ms: u64,

    /// Minimum randomized pause after an interjection, in milliseconds
    #[arg(long, default_value = "250")]
    pub interjection_pause_min_ms: u64,

    /// Maximum randomized pause after an interjection, in milliseconds
    #[arg(long, default_value = "750")]
    pub interjection_pause_max_ms: u64,

    /// Strip a leading "label:" tone directive from synthesized text.
    /// The heuristic is ambiguous on purpose; leave off unless the model is
    /// prompted to emit directives.
    #[arg(long)]
    pub strip_directives: bool,

    /// Use the low-latency PCM renderer transport instead of clip playback
    #[arg(long)]
    pub low_latency: bool,

    /// Output device name substring (default device if omitted)
    #[arg(long, short = 'o')]
    pub output_device: Option<String>,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

impl AppConfig {
    /// Parse configuration from command line arguments.
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Per-call synthesis timeout.
    pub fn synth_timeout(&self) -> Duration {
        Duration::from_secs(self.synth_timeout_secs)
    }

    /// Assemble the pipeline configuration.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            concurrency: self.synth_concurrency,
            call_timeout: self.synth_timeout(),
            strip_directives: self.strip_directives,
            engine: EngineConfig {
                reveal_per_char: Duration::from_millis(self.reveal_ms_per_char),
                reveal_threshold: Duration::from_millis(self.reveal_threshold_ms),
                interjection_pause_ms: (self.interjection_pause_min_ms, self.interjection_pause_max_ms),
            },
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.synth_concurrency == 0 {
            anyhow::bail!("Synthesis concurrency must be at least 1");
        }

        if self.voice_speed <= 0.0 {
            anyhow::bail!("Voice speed must be positive");
        }

        if self.voice_sample_rate == 0 {
            anyhow::bail!("Voice sample rate must be positive");
        }

        if self.interjection_pause_min_ms > self.interjection_pause_max_ms {
            anyhow::bail!("Interjection pause minimum exceeds maximum");
        }

        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        info!("Configuration:");
        info!("  Chat URL: {}", self.chat_url);
        info!("  Chat model: {}", self.chat_model);
        info!("  System prompt: {}...", &self.system_prompt.chars().take(50).collect::<String>());
        info!("  Voice URL: {}", self.voice_url);
        info!("  Voice: {} (speed {})", self.voice, self.voice_speed);
        info!("  Voice sample rate: {} Hz", self.voice_sample_rate);
        info!("  Synthesis concurrency: {}", self.synth_concurrency);
        info!("  Synthesis timeout: {}s", self.synth_timeout_secs);
        info!("  Reveal: {}ms/char, threshold {}ms", self.reveal_ms_per_char, self.reveal_threshold_ms);
        info!("  Transport: {}", if self.low_latency { "low-latency PCM renderer" } else { "clip playback" });
        if let Some(ref device) = self.output_device {
            info!("  Output device: {}", device);
        }
        if self.strip_directives {
            info!("  Tone-directive stripping: enabled");
        }
    }
}
