//! The per-session speech pipeline.
//!
//! One object owns the whole chain for a response session: segmentation of
//! incoming deltas, scheduling of per-sentence synthesis, and the ordered
//! playback engine. There is no process-wide mutable state; resetting or
//! dropping the pipeline discards the session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::playback::{AudioSink, EngineCommand, EngineConfig, PipelineEvent, PlaybackEngine};
use crate::segment::SentenceSegmenter;
use crate::synth::{AudioClip, SpeechService, SynthesisScheduler};

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum simultaneous synthesis calls.
    pub concurrency: usize,
    /// Per-call synthesis deadline.
    pub call_timeout: Duration,
    /// Strip `label:` tone directives from synthesized text (opt-in).
    pub strip_directives: bool,
    pub engine: EngineConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            call_timeout: Duration::from_secs(15),
            strip_directives: false,
            engine: EngineConfig::default(),
        }
    }
}

/// Streaming sentence-to-speech pipeline for one chat companion.
pub struct SpeechPipeline {
    segmenter: SentenceSegmenter,
    scheduler: SynthesisScheduler,
    engine: PlaybackEngine,
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    events_rx: Option<mpsc::UnboundedReceiver<PipelineEvent>>,
}

impl SpeechPipeline {
    /// Build the pipeline and spawn its playback engine.
    ///
    /// # Arguments
    /// * `service` - External voice synthesis collaborator
    /// * `sink` - Audio output for ready clips
    /// * `config` - Pipeline tuning
    pub fn new(service: Arc<dyn SpeechService>, sink: Arc<dyn AudioSink>, config: PipelineConfig) -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (event_tx, events_rx) = mpsc::unbounded_channel();

        let scheduler = SynthesisScheduler::new(
            service,
            config.concurrency,
            config.call_timeout,
            config.strip_directives,
            job_tx,
        );
        let engine = PlaybackEngine::spawn(sink, config.engine, job_rx, event_tx);
        let cmd_tx = engine.commands();

        Self { segmenter: SentenceSegmenter::new(), scheduler, engine, cmd_tx, events_rx: Some(events_rx) }
    }

    /// Take the outbound event stream. Yields `None` after the first call.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<PipelineEvent>> {
        self.events_rx.take()
    }

    /// Feed an incremental text delta from the model stream.
    ///
    /// Completed sentences are submitted for synthesis immediately; the call
    /// itself never waits on the synthesis gate.
    pub fn submit_text(&mut self, delta: &str) {
        for sentence in self.segmenter.feed(delta) {
            self.scheduler.submit(sentence);
        }
    }

    /// End the session's ingestion: flush the segmenter tail and tell the
    /// engine how many sentences to expect.
    pub fn flush_session(&mut self) {
        if let Some(tail) = self.segmenter.flush() {
            self.scheduler.submit(tail);
        }
        let _ = self.cmd_tx.send(EngineCommand::Flushed {
            generation: self.scheduler.generation(),
            total: self.scheduler.submitted(),
        });
    }

    /// Start a new response session.
    ///
    /// Unconsumed jobs of the old session are discarded and the cursor
    /// rewinds to 0. In-flight synthesis calls are not cancelled; their late
    /// results are ignored.
    pub fn reset_session(&mut self) {
        self.segmenter.clear();
        let generation = self.scheduler.begin_session();
        debug!("Pipeline session reset (generation {})", generation);
        let _ = self.cmd_tx.send(EngineCommand::Reset { generation });
    }

    /// Schedule a secondary interjection voice before the main queue opens.
    pub fn schedule_interjection(&self, clip: AudioClip) {
        let _ = self.cmd_tx.send(EngineCommand::Interjection { clip });
    }

    /// Stop the engine task.
    pub async fn shutdown(self) {
        self.engine.shutdown().await;
    }
}
