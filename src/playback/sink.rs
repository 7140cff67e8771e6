//! Audio output sink for synthesized clips.
//!
//! One clip plays at a time; `play` resolves when the clip has drained (or
//! was stopped). The cpal implementation feeds the device callback through a
//! lock-free ring buffer to avoid mutex contention on the audio thread, and
//! resamples clips whose rate differs from the device rate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use parking_lot::Mutex;
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use tracing::{debug, info, warn};

use crate::audio::resampler::resample;
use crate::audio::util::{find_best_config, find_output_device, get_device_name};
use crate::synth::AudioClip;

/// Size of the playback ring buffer in samples (~11 seconds at 48kHz).
const PLAYBACK_RING_SIZE: usize = 524288;

/// Poll interval while waiting for a clip to drain.
const DRAIN_POLL: Duration = Duration::from_millis(25);

/// Destination for ready clips. Exactly one clip is active at a time; the
/// playback engine enforces that structurally, not the sink.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play a clip to completion. Resolves early (without error) when the
    /// sink is stopped mid-clip.
    async fn play(&self, clip: AudioClip) -> Result<()>;

    /// Interrupt the current clip and drop anything still queued.
    async fn stop(&self);
}

/// cpal-backed sink writing to an output device.
pub struct CpalSink {
    /// Kept alive to maintain the audio stream
    _stream: Stream,
    device_sample_rate: u32,
    /// Ring buffer producer (mutex protects multi-task queue access)
    producer: Mutex<ringbuf::HeapProd<f32>>,
    interrupt: Arc<AtomicBool>,
    playing: Arc<AtomicBool>,
}

impl CpalSink {
    /// Open the output device and start the stream.
    ///
    /// # Arguments
    /// * `device_name` - Optional device name substring; default device if `None`
    ///
    /// # Errors
    /// Returns an error if no device is available, no F32 configuration
    /// exists, or the stream cannot be built.
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        let device = find_output_device(device_name)?;
        info!("Using output device: {}", get_device_name(&device));

        let device_sample_rate = match device.default_output_config() {
            Ok(default_config) => default_config.sample_rate(),
            Err(_) => {
                let supported = device.supported_output_configs().context("Failed to get supported output configs")?;
                find_best_config(supported, 48000)?.sample_rate()
            }
        };

        let supported = device.supported_output_configs().context("Failed to get supported output configs")?;
        let config = find_best_config(supported, device_sample_rate)?;

        debug!(
            "Audio sink config: {} Hz, {} channels, {:?}",
            device_sample_rate,
            config.channels(),
            config.sample_format()
        );

        let ring = HeapRb::<f32>::new(PLAYBACK_RING_SIZE);
        let (producer, mut consumer) = ring.split();

        let interrupt = Arc::new(AtomicBool::new(false));
        let playing = Arc::new(AtomicBool::new(false));

        let interrupt_cb = interrupt.clone();
        let playing_cb = playing.clone();
        let channels = config.channels() as usize;
        let stream_config: StreamConfig = config.config();

        let err_fn = |err| {
            tracing::error!("Audio playback error: {}", err);
        };

        let stream = device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if interrupt_cb.load(Ordering::Relaxed) {
                    // Stopped: discard everything queued and go silent.
                    consumer.clear();
                    data.fill(0.0);
                    playing_cb.store(false, Ordering::SeqCst);
                    return;
                }

                for frame in data.chunks_mut(channels) {
                    let sample = consumer.try_pop().unwrap_or(0.0);
                    // Duplicate mono sample to all channels
                    for channel in frame.iter_mut() {
                        *channel = sample;
                    }
                }

                if consumer.is_empty() {
                    playing_cb.store(false, Ordering::SeqCst);
                }
            },
            err_fn,
            None,
        )?;

        stream.play().context("Failed to start playback stream")?;

        info!("Audio sink ready at {} Hz (lock-free)", device_sample_rate);

        Ok(Self { _stream: stream, device_sample_rate, producer: Mutex::new(producer), interrupt, playing })
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&self, clip: AudioClip) -> Result<()> {
        if clip.samples.is_empty() {
            return Ok(());
        }

        self.interrupt.store(false, Ordering::SeqCst);

        let samples = if clip.sample_rate != self.device_sample_rate {
            match resample(&clip.samples, clip.sample_rate, self.device_sample_rate) {
                Ok(resampled) => resampled,
                Err(e) => {
                    tracing::error!("Resampling failed: {}, playing without resampling", e);
                    clip.samples
                }
            }
        } else {
            clip.samples
        };

        {
            let mut producer = self.producer.lock();
            let written = producer.push_slice(&samples);
            if written < samples.len() {
                warn!("Playback buffer overflow, dropped {} samples", samples.len() - written);
            }
        }

        self.playing.store(true, Ordering::SeqCst);
        debug!("Playing {} samples at {} Hz", samples.len(), self.device_sample_rate);

        let duration_secs = samples.len() as f64 / self.device_sample_rate as f64;
        let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(duration_secs + 1.0);

        while self.playing.load(Ordering::Relaxed) {
            if self.interrupt.load(Ordering::Relaxed) {
                debug!("Playback interrupted");
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                warn!("Playback timeout exceeded");
                return Ok(());
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        debug!("Playback completed");
        Ok(())
    }

    async fn stop(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.interrupt.store(true, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
    }
}
