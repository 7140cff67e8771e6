//! Ordered playback of synthesized sentences.
//!
//! Synthesis completes out of order; this module drains it strictly in
//! sequence order, one clip at a time, while driving the text-reveal timer.

mod engine;
mod reveal;
mod sink;

use std::time::Duration;

pub use engine::{EngineCommand, EngineConfig, PlaybackEngine};
pub use reveal::RevealTimer;
pub use sink::{AudioSink, CpalSink};

/// Event emitted by the pipeline toward its caller (UI, logs).
///
/// Replaces the ad hoc listener wiring of an event-callback design with one
/// well-defined message type over a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Audio playback for a sentence has begun; start revealing its text
    /// over `reveal` (an estimate from character count).
    SentenceStarted { sequence: u64, text: String, reveal: Duration },
    /// The true audio duration differed from the estimate beyond the
    /// configured threshold; the reveal timer was rescheduled.
    RevealAdjusted { sequence: u64, reveal: Duration },
    /// The text-reveal animation for a sentence has run to completion.
    RevealFinished { sequence: u64 },
    /// A sentence has been consumed: played to completion, or skipped with
    /// its text shown silently when synthesis failed.
    SentenceDisplayed { sequence: u64, text: String, with_audio: bool },
    /// Every sentence of the session has been consumed.
    SessionDone,
}
