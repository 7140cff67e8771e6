//! Sentence synthesis: the external voice service seam and the
//! bounded-concurrency scheduler that drives it.

mod scheduler;
mod service;

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

pub use scheduler::{JobResult, JobUpdate, SynthesisScheduler};
pub use service::{HttpSpeechService, SpeechService, SynthesisError};

/// Decoded audio for one sentence: mono f32 samples plus their rate.
///
/// This is the "audio handle" that moves from the scheduler to the playback
/// engine; the engine owns it from the moment the job is ready until the
/// sentence has been consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioClip {
    /// Playback duration of the clip.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Matches a short leading `label:` clause, e.g. `whisper: come closer`.
static DIRECTIVE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,15}:\s+").unwrap());

/// Strip a leading `<label>: ` tone/style directive from text bound for the
/// voice service.
///
/// The heuristic is ambiguous by nature (any short colon-prefixed clause
/// matches), so it is opt-in via configuration; displayed text is never
/// altered, only what is synthesized.
pub fn strip_tone_directive(text: &str) -> &str {
    match DIRECTIVE_PREFIX.find(text) {
        Some(m) => &text[m.end()..],
        None => text,
    }
}
