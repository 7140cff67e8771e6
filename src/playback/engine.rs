//! Ordered playback engine.
//!
//! A classic reorder buffer: synthesis jobs complete in any order, the
//! engine consumes them strictly by sequence. One procedure, attempt-advance,
//! runs on every trigger (a job finishing, a playback ending, a gate
//! lifting); a re-entrancy guard keeps playback serialized without a lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AudioSink, PipelineEvent, RevealTimer};
use crate::synth::{AudioClip, JobResult, JobUpdate};

/// Tuning for the playback engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-character floor used to estimate the reveal duration.
    pub reveal_per_char: Duration,
    /// Reveal is rescheduled only when the true audio duration drifts from
    /// the estimate by more than this.
    pub reveal_threshold: Duration,
    /// Randomized pause after an interjection, before the main queue opens.
    pub interjection_pause_ms: (u64, u64),
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reveal_per_char: Duration::from_millis(45),
            reveal_threshold: Duration::from_millis(250),
            interjection_pause_ms: (250, 750),
        }
    }
}

/// Control messages into the engine task.
#[derive(Debug)]
pub enum EngineCommand {
    /// The session's last sentence has been submitted; `total` sentences
    /// exist in all.
    Flushed { generation: u64, total: u64 },
    /// Start a new session generation; discard everything from the old one.
    Reset { generation: u64 },
    /// Secondary voice to play before the main queue begins.
    Interjection { clip: AudioClip },
    /// Internal: the clip for `sequence` finished playing.
    PlaybackFinished { generation: u64, sequence: u64 },
    /// Internal: the interjection (plus its pause) is over.
    InterjectionFinished { generation: u64 },
}

/// A completed-but-not-yet-consumed job in the reorder buffer.
enum Slot {
    Ready { text: String, clip: AudioClip },
    Failed { text: String },
}

/// Handle to a running engine task.
pub struct PlaybackEngine {
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    handle: JoinHandle<()>,
}

impl PlaybackEngine {
    /// Spawn the engine task.
    ///
    /// # Arguments
    /// * `sink` - Audio output for ready clips
    /// * `config` - Engine tuning
    /// * `job_rx` - Job completions from the synthesis scheduler
    /// * `events` - Outbound pipeline events
    pub fn spawn(
        sink: Arc<dyn AudioSink>,
        config: EngineConfig,
        job_rx: mpsc::UnboundedReceiver<JobUpdate>,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let state = EngineState {
            sink,
            config,
            events,
            cmd_tx: cmd_tx.clone(),
            generation: 0,
            cursor: 0,
            slots: BTreeMap::new(),
            playing: None,
            gate_held: false,
            expected_total: None,
            done: false,
            started: false,
            reveal: RevealTimer::new(),
        };
        let handle = tokio::spawn(state.run(job_rx, cmd_rx));
        Self { cmd_tx, handle }
    }

    /// Sender for control commands.
    pub fn commands(&self) -> mpsc::UnboundedSender<EngineCommand> {
        self.cmd_tx.clone()
    }

    /// Stop the engine task and wait for it to finish.
    ///
    /// The task is aborted rather than drained: the engine keeps an internal
    /// command sender for its own playback-finished notices, so its channel
    /// never closes on its own.
    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

struct EngineState {
    sink: Arc<dyn AudioSink>,
    config: EngineConfig,
    events: mpsc::UnboundedSender<PipelineEvent>,
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    /// Current session generation; updates from older sessions are dropped.
    generation: u64,
    /// Next expected sequence (the playback cursor).
    cursor: u64,
    /// Reorder buffer of finished jobs keyed by sequence.
    slots: BTreeMap<u64, Slot>,
    /// Text of the sentence currently playing, if any (re-entrancy guard).
    playing: Option<String>,
    /// Interjection gate: attempt-advance is deferred while held.
    gate_held: bool,
    /// Total sentences in the session, known once flushed.
    expected_total: Option<u64>,
    done: bool,
    /// Whether the main queue has started consuming.
    started: bool,
    reveal: RevealTimer,
}

impl EngineState {
    async fn run(
        mut self,
        mut job_rx: mpsc::UnboundedReceiver<JobUpdate>,
        mut cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
    ) {
        loop {
            tokio::select! {
                update = job_rx.recv() => match update {
                    Some(update) => self.on_job_update(update),
                    None => break,
                },
                command = cmd_rx.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
            }
        }
        self.reveal.cancel();
        debug!("Playback engine stopped");
    }

    fn on_job_update(&mut self, update: JobUpdate) {
        if update.generation != self.generation {
            debug!("Ignoring stale result for sentence #{} (old session)", update.sequence);
            return;
        }

        let slot = match update.result {
            JobResult::Ready(clip) => Slot::Ready { text: update.text, clip },
            JobResult::Failed => Slot::Failed { text: update.text },
        };
        self.slots.insert(update.sequence, slot);
        self.attempt_advance();
    }

    async fn on_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Flushed { generation, total } => {
                if generation != self.generation {
                    return;
                }
                self.expected_total = Some(total);
                self.attempt_advance();
            }
            EngineCommand::Reset { generation } => self.reset(generation).await,
            EngineCommand::Interjection { clip } => self.schedule_interjection(clip),
            EngineCommand::PlaybackFinished { generation, sequence } => {
                if generation != self.generation {
                    debug!("Ignoring playback completion from old session");
                    return;
                }
                let text = self.playing.take().unwrap_or_default();
                self.cursor += 1;
                let _ = self.events.send(PipelineEvent::SentenceDisplayed {
                    sequence,
                    text,
                    with_audio: true,
                });
                self.attempt_advance();
            }
            EngineCommand::InterjectionFinished { generation } => {
                if generation != self.generation {
                    return;
                }
                self.gate_held = false;
                self.attempt_advance();
            }
        }
    }

    /// Consume jobs at the cursor until playback starts or the next job is
    /// missing. Failed jobs are skipped with their text shown; they never
    /// leave a playback gap or stall the sequence.
    fn attempt_advance(&mut self) {
        loop {
            if self.playing.is_some() || self.gate_held {
                return;
            }

            let Some(slot) = self.slots.remove(&self.cursor) else {
                self.check_done();
                return;
            };
            self.started = true;

            match slot {
                Slot::Failed { text } => {
                    let sequence = self.cursor;
                    self.cursor += 1;
                    info!("Skipping sentence #{} (synthesis failed), showing text only", sequence);
                    let _ = self.events.send(PipelineEvent::SentenceDisplayed {
                        sequence,
                        text,
                        with_audio: false,
                    });
                }
                Slot::Ready { text, clip } => {
                    self.begin_playback(text, clip);
                    return;
                }
            }
        }
    }

    fn begin_playback(&mut self, text: String, clip: AudioClip) {
        let sequence = self.cursor;
        let estimate = self.config.reveal_per_char * text.chars().count() as u32;

        let _ = self.events.send(PipelineEvent::SentenceStarted {
            sequence,
            text: text.clone(),
            reveal: estimate,
        });
        self.reveal.start(sequence, estimate, self.events.clone());

        // The true duration is known once the clip is loaded; reschedule the
        // reveal when it drifts past the threshold.
        if let Some(corrected) =
            self.reveal.correct(sequence, clip.duration(), self.config.reveal_threshold, self.events.clone())
        {
            let _ = self.events.send(PipelineEvent::RevealAdjusted { sequence, reveal: corrected });
        }

        self.playing = Some(text);

        let sink = self.sink.clone();
        let cmd_tx = self.cmd_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            if let Err(e) = sink.play(clip).await {
                warn!("Playback error for sentence #{}: {}", sequence, e);
            }
            let _ = cmd_tx.send(EngineCommand::PlaybackFinished { generation, sequence });
        });
    }

    /// Play a secondary voice before the main queue opens, then release the
    /// gate after a randomized pause.
    fn schedule_interjection(&mut self, clip: AudioClip) {
        if self.started || self.playing.is_some() {
            warn!("Ignoring interjection: session already narrating");
            return;
        }

        self.gate_held = true;
        let (min_ms, max_ms) = self.config.interjection_pause_ms;
        let pause = Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms.max(min_ms)));

        let sink = self.sink.clone();
        let cmd_tx = self.cmd_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            if let Err(e) = sink.play(clip).await {
                warn!("Interjection playback error: {}", e);
            }
            tokio::time::sleep(pause).await;
            let _ = cmd_tx.send(EngineCommand::InterjectionFinished { generation });
        });
    }

    /// Discard the old session and arm a new one. In-flight synthesis calls
    /// are not cancelled; their results arrive tagged with the old
    /// generation and are ignored.
    async fn reset(&mut self, generation: u64) {
        debug!("Session reset: generation {} -> {}", self.generation, generation);
        self.sink.stop().await;
        self.reveal.cancel();
        self.generation = generation;
        self.cursor = 0;
        self.slots.clear();
        self.playing = None;
        self.gate_held = false;
        self.expected_total = None;
        self.done = false;
        self.started = false;
    }

    fn check_done(&mut self) {
        if self.done || self.playing.is_some() {
            return;
        }
        if let Some(total) = self.expected_total
            && self.cursor >= total
        {
            self.done = true;
            info!("Session complete ({} sentences)", total);
            let _ = self.events.send(PipelineEvent::SessionDone);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;

    use super::*;

    /// Sink that records play order and simulates a short playback.
    struct RecordingSink {
        played: PlMutex<Vec<usize>>,
        stopped: AtomicBool,
        play_time: Duration,
    }

    impl RecordingSink {
        fn new(play_time: Duration) -> Arc<Self> {
            Arc::new(Self { played: PlMutex::new(Vec::new()), stopped: AtomicBool::new(false), play_time })
        }

        fn played(&self) -> Vec<usize> {
            self.played.lock().clone()
        }
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&self, clip: AudioClip) -> Result<()> {
            // Clip length doubles as its identity in these tests.
            self.played.lock().push(clip.samples.len());
            tokio::time::sleep(self.play_time).await;
            Ok(())
        }

        async fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn clip(id: usize) -> AudioClip {
        AudioClip { samples: vec![0.0; id], sample_rate: 24000 }
    }

    fn ready(generation: u64, sequence: u64, id: usize) -> JobUpdate {
        JobUpdate {
            generation,
            sequence,
            text: format!("sentence {sequence}"),
            result: JobResult::Ready(clip(id)),
        }
    }

    fn failed(generation: u64, sequence: u64) -> JobUpdate {
        JobUpdate { generation, sequence, text: format!("sentence {sequence}"), result: JobResult::Failed }
    }

    struct Harness {
        sink: Arc<RecordingSink>,
        job_tx: mpsc::UnboundedSender<JobUpdate>,
        cmd_tx: mpsc::UnboundedSender<EngineCommand>,
        events: mpsc::UnboundedReceiver<PipelineEvent>,
        engine: PlaybackEngine,
    }

    fn harness() -> Harness {
        let sink = RecordingSink::new(Duration::from_millis(5));
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let engine = PlaybackEngine::spawn(sink.clone(), EngineConfig::default(), job_rx, event_tx);
        let cmd_tx = engine.commands();
        Harness { sink, job_tx, cmd_tx, events, engine }
    }

    /// Drain events until SessionDone, collecting displayed sentences.
    async fn displayed_until_done(harness: &mut Harness) -> Vec<(u64, bool)> {
        let mut displayed = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), harness.events.recv())
                .await
                .expect("engine deadlocked")
                .expect("events closed");
            match event {
                PipelineEvent::SentenceDisplayed { sequence, with_audio, .. } => {
                    displayed.push((sequence, with_audio));
                }
                PipelineEvent::SessionDone => return displayed,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_out_of_order_completion_plays_in_order() {
        let mut h = harness();

        // Completions arrive reversed.
        h.job_tx.send(ready(0, 2, 30)).unwrap();
        h.job_tx.send(ready(0, 1, 20)).unwrap();
        h.job_tx.send(ready(0, 0, 10)).unwrap();
        h.cmd_tx.send(EngineCommand::Flushed { generation: 0, total: 3 }).unwrap();

        let displayed = displayed_until_done(&mut h).await;
        assert_eq!(displayed, vec![(0, true), (1, true), (2, true)]);
        assert_eq!(h.sink.played(), vec![10, 20, 30]);

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_sentence_is_skipped_without_stall() {
        let mut h = harness();

        h.job_tx.send(ready(0, 0, 10)).unwrap();
        h.job_tx.send(failed(0, 1)).unwrap();
        h.job_tx.send(ready(0, 2, 30)).unwrap();
        h.cmd_tx.send(EngineCommand::Flushed { generation: 0, total: 3 }).unwrap();

        let displayed = displayed_until_done(&mut h).await;
        assert_eq!(displayed, vec![(0, true), (1, false), (2, true)]);
        // The failed sentence never reached the sink.
        assert_eq!(h.sink.played(), vec![10, 30]);

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_later_ready_waits_for_earlier_pending() {
        let mut h = harness();

        // Only #1 is ready; #0 is still pending, so nothing may play.
        h.job_tx.send(ready(0, 1, 20)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(h.sink.played().is_empty());

        h.job_tx.send(ready(0, 0, 10)).unwrap();
        h.cmd_tx.send(EngineCommand::Flushed { generation: 0, total: 2 }).unwrap();

        let displayed = displayed_until_done(&mut h).await;
        assert_eq!(displayed, vec![(0, true), (1, true)]);
        assert_eq!(h.sink.played(), vec![10, 20]);

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_discards_stale_results() {
        let mut h = harness();

        h.job_tx.send(ready(0, 0, 10)).unwrap();
        h.cmd_tx.send(EngineCommand::Reset { generation: 1 }).unwrap();

        // Results from generation 0 arriving late must be ignored.
        h.job_tx.send(ready(0, 1, 20)).unwrap();
        h.job_tx.send(ready(1, 0, 99)).unwrap();
        h.cmd_tx.send(EngineCommand::Flushed { generation: 1, total: 1 }).unwrap();

        let displayed = displayed_until_done(&mut h).await;
        assert_eq!(displayed, vec![(0, true)]);
        let played = h.sink.played();
        assert!(played.contains(&99));
        assert!(!played.contains(&20));

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_interjection_gates_main_queue() {
        let mut h = harness();

        h.cmd_tx.send(EngineCommand::Interjection { clip: clip(7) }).unwrap();
        // Let the gate engage before the first job completes.
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.job_tx.send(ready(0, 0, 10)).unwrap();
        h.cmd_tx.send(EngineCommand::Flushed { generation: 0, total: 1 }).unwrap();

        let displayed = displayed_until_done(&mut h).await;
        assert_eq!(displayed, vec![(0, true)]);
        // The interjection played before the first sentence.
        assert_eq!(h.sink.played(), vec![7, 10]);

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_all_failed_session_still_completes() {
        let mut h = harness();

        h.job_tx.send(failed(0, 0)).unwrap();
        h.job_tx.send(failed(0, 1)).unwrap();
        h.cmd_tx.send(EngineCommand::Flushed { generation: 0, total: 2 }).unwrap();

        let displayed = displayed_until_done(&mut h).await;
        assert_eq!(displayed, vec![(0, false), (1, false)]);
        assert!(h.sink.played().is_empty());

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_session_reports_done() {
        let mut h = harness();

        h.cmd_tx.send(EngineCommand::Flushed { generation: 0, total: 0 }).unwrap();
        let displayed = displayed_until_done(&mut h).await;
        assert!(displayed.is_empty());

        h.engine.shutdown().await;
    }
}
