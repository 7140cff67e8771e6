//! Cancellable text-reveal timer.
//!
//! The reveal duration is first estimated from character count, then
//! corrected once the true audio duration is known. A correction is a
//! cancel-plus-reschedule of the pending task, never an adjustment of a
//! running timer.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::PipelineEvent;

/// Drives the reveal clock for the sentence currently playing.
#[derive(Default)]
pub struct RevealTimer {
    token: Option<CancellationToken>,
    started_at: Option<Instant>,
    scheduled: Duration,
}

impl RevealTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the timer with the estimated duration. Any previous timer is
    /// cancelled first.
    pub fn start(&mut self, sequence: u64, estimate: Duration, events: mpsc::UnboundedSender<PipelineEvent>) {
        self.cancel();
        self.started_at = Some(Instant::now());
        self.scheduled = estimate;
        self.spawn(sequence, estimate, events);
    }

    /// Correct the running timer with the true audio duration.
    ///
    /// If the difference from the scheduled duration is within `threshold`,
    /// the estimate stands. Otherwise the pending task is cancelled and a new
    /// one is scheduled to fire at `start + actual`, so the reveal never
    /// outlasts the audio by more than the threshold.
    ///
    /// # Returns
    /// The corrected reveal duration, if a reschedule happened.
    pub fn correct(
        &mut self,
        sequence: u64,
        actual: Duration,
        threshold: Duration,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Option<Duration> {
        let started_at = self.started_at?;

        let drift = if actual > self.scheduled { actual - self.scheduled } else { self.scheduled - actual };
        if drift <= threshold {
            return None;
        }

        debug!("Rescheduling reveal for #{}: {:?} -> {:?}", sequence, self.scheduled, actual);

        if let Some(token) = self.token.take() {
            token.cancel();
        }
        self.scheduled = actual;

        let remaining = (started_at + actual).saturating_duration_since(Instant::now());
        self.spawn(sequence, remaining, events);
        Some(actual)
    }

    /// Cancel the pending timer without firing it.
    pub fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        self.started_at = None;
    }

    fn spawn(&mut self, sequence: u64, delay: Duration, events: mpsc::UnboundedSender<PipelineEvent>) {
        let token = CancellationToken::new();
        self.token = Some(token.clone());

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(PipelineEvent::RevealFinished { sequence });
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_estimate() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RevealTimer::new();
        timer.start(0, Duration::from_millis(100), tx);

        tokio::time::advance(Duration::from_millis(110)).await;
        assert_eq!(rx.recv().await, Some(PipelineEvent::RevealFinished { sequence: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_drift_keeps_estimate() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RevealTimer::new();
        timer.start(1, Duration::from_millis(100), tx.clone());

        let corrected = timer.correct(1, Duration::from_millis(120), Duration::from_millis(50), tx);
        assert_eq!(corrected, None);

        tokio::time::advance(Duration::from_millis(110)).await;
        assert_eq!(rx.recv().await, Some(PipelineEvent::RevealFinished { sequence: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_drift_reschedules() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RevealTimer::new();
        timer.start(2, Duration::from_millis(100), tx.clone());

        let corrected = timer.correct(2, Duration::from_millis(400), Duration::from_millis(50), tx);
        assert_eq!(corrected, Some(Duration::from_millis(400)));

        // The original estimate must not fire.
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(rx.recv().await, Some(PipelineEvent::RevealFinished { sequence: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suppresses_fire() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RevealTimer::new();
        timer.start(3, Duration::from_millis(50), tx);
        timer.cancel();

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }
}
