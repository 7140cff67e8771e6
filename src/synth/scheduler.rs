//! Bounded-concurrency synthesis scheduler.
//!
//! Assigns each sentence a session-scoped sequence ticket, then launches the
//! external synthesis call behind a counting semaphore. Sequence assignment
//! happens synchronously on the ingestion path; only the dispatch of the
//! external call waits for a permit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, warn};

use super::{AudioClip, SpeechService, SynthesisError, strip_tone_directive};

/// Terminal outcome of one synthesis job.
#[derive(Debug)]
pub enum JobResult {
    /// Synthesis produced audio; the clip is handed to the playback engine.
    Ready(AudioClip),
    /// The call errored, timed out, or returned no data. The job keeps its
    /// sequence slot so ordering is preserved; it is never retried here.
    Failed,
}

/// Completion notice sent to the playback engine.
#[derive(Debug)]
pub struct JobUpdate {
    /// Session generation the job belongs to; stale results are ignored.
    pub generation: u64,
    /// The job's sequence ticket.
    pub sequence: u64,
    /// Original sentence text (displayed even when synthesis failed).
    pub text: String,
    pub result: JobResult,
}

/// Schedules per-sentence synthesis calls with bounded concurrency.
pub struct SynthesisScheduler {
    service: Arc<dyn SpeechService>,
    permits: Arc<Semaphore>,
    update_tx: mpsc::UnboundedSender<JobUpdate>,
    call_timeout: Duration,
    strip_directives: bool,
    generation: u64,
    next_sequence: u64,
}

impl SynthesisScheduler {
    /// Create a scheduler.
    ///
    /// # Arguments
    /// * `service` - External voice synthesis collaborator
    /// * `concurrency` - Maximum simultaneous in-flight calls
    /// * `call_timeout` - Per-call deadline; a late call fails its job
    /// * `strip_directives` - Strip `label:` prefixes from synthesized text
    /// * `update_tx` - Channel to the playback engine
    pub fn new(
        service: Arc<dyn SpeechService>,
        concurrency: usize,
        call_timeout: Duration,
        strip_directives: bool,
        update_tx: mpsc::UnboundedSender<JobUpdate>,
    ) -> Self {
        Self {
            service,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            update_tx,
            call_timeout,
            strip_directives,
            generation: 0,
            next_sequence: 0,
        }
    }

    /// Submit a sentence for synthesis, returning its sequence ticket.
    ///
    /// Never blocks: the job is recorded in order immediately and the
    /// external call runs on its own task once a permit is free. Waiters
    /// queue FIFO on the semaphore.
    pub fn submit(&mut self, text: String) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let generation = self.generation;
        let service = self.service.clone();
        let permits = self.permits.clone();
        let update_tx = self.update_tx.clone();
        let call_timeout = self.call_timeout;
        let strip = self.strip_directives;

        debug!("Submitting sentence #{}: \"{}\"", sequence, text);

        tokio::spawn(async move {
            // Closed only on shutdown; nothing left to report then.
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };

            let spoken = if strip { strip_tone_directive(&text).to_string() } else { text.clone() };

            let outcome = match tokio::time::timeout(call_timeout, service.synthesize(&spoken)).await {
                Ok(call) => call,
                Err(_) => Err(SynthesisError::Timeout(call_timeout)),
            };

            let result = match outcome {
                Ok(clip) if !clip.samples.is_empty() => JobResult::Ready(clip),
                Ok(_) => {
                    warn!("Sentence #{} synthesized to empty audio", sequence);
                    JobResult::Failed
                }
                Err(e) => {
                    warn!("Synthesis failed for sentence #{}: {}", sequence, e);
                    JobResult::Failed
                }
            };

            let _ = update_tx.send(JobUpdate { generation, sequence, text, result });
        });

        sequence
    }

    /// Number of sentences submitted in the current session.
    pub fn submitted(&self) -> u64 {
        self.next_sequence
    }

    /// Current session generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a new session: bump the generation and rewind the counter.
    ///
    /// In-flight calls from the previous session are not cancelled; their
    /// updates carry the old generation and are dropped by the engine.
    pub fn begin_session(&mut self) -> u64 {
        self.generation += 1;
        self.next_sequence = 0;
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::synth::SynthesisError;

    /// Mock service that tracks how many calls are in flight at once.
    struct CountingService {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail: bool,
    }

    impl CountingService {
        fn new(fail: bool) -> Self {
            Self { in_flight: AtomicUsize::new(0), max_in_flight: AtomicUsize::new(0), fail }
        }
    }

    #[async_trait]
    impl SpeechService for CountingService {
        async fn synthesize(&self, _text: &str) -> Result<AudioClip, SynthesisError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                Err(SynthesisError::Empty)
            } else {
                Ok(AudioClip { samples: vec![0.1; 240], sample_rate: 24000 })
            }
        }
    }

    fn scheduler_with(
        service: Arc<CountingService>,
        concurrency: usize,
    ) -> (SynthesisScheduler, mpsc::UnboundedReceiver<JobUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler =
            SynthesisScheduler::new(service, concurrency, Duration::from_secs(1), false, tx);
        (scheduler, rx)
    }

    #[tokio::test]
    async fn test_sequences_are_monotonic_and_gap_free() {
        let service = Arc::new(CountingService::new(false));
        let (mut scheduler, _rx) = scheduler_with(service, 3);

        for expected in 0..5u64 {
            assert_eq!(scheduler.submit(format!("sentence {expected}")), expected);
        }
        assert_eq!(scheduler.submitted(), 5);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let service = Arc::new(CountingService::new(false));
        let (mut scheduler, mut rx) = scheduler_with(service.clone(), 3);

        for i in 0..10 {
            scheduler.submit(format!("sentence {i}"));
        }
        for _ in 0..10 {
            rx.recv().await.expect("update");
        }

        assert!(service.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert_eq!(service.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_call_still_reports_its_slot() {
        let service = Arc::new(CountingService::new(true));
        let (mut scheduler, mut rx) = scheduler_with(service, 2);

        scheduler.submit("doomed".to_string());
        let update = rx.recv().await.expect("update");
        assert_eq!(update.sequence, 0);
        assert_eq!(update.text, "doomed");
        assert!(matches!(update.result, JobResult::Failed));
    }

    #[tokio::test]
    async fn test_slow_call_times_out_and_fails_its_slot() {
        // Service sleeps 20ms; a 5ms deadline must fail the job, not hang it.
        let service = Arc::new(CountingService::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = SynthesisScheduler::new(service, 1, Duration::from_millis(5), false, tx);

        scheduler.submit("too slow".to_string());
        let update = rx.recv().await.expect("update");
        assert_eq!(update.sequence, 0);
        assert!(matches!(update.result, JobResult::Failed));
    }

    #[tokio::test]
    async fn test_begin_session_rewinds_counter() {
        let service = Arc::new(CountingService::new(false));
        let (mut scheduler, _rx) = scheduler_with(service, 2);

        scheduler.submit("one".to_string());
        let old_generation = scheduler.generation();
        let new_generation = scheduler.begin_session();

        assert_eq!(new_generation, old_generation + 1);
        assert_eq!(scheduler.submit("fresh".to_string()), 0);
    }
}
