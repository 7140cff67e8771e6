//! Low-latency PCM renderer.
//!
//! A dedicated real-time output callback renders queued raw sample blocks.
//! The producer side talks to it exclusively through a bounded message
//! channel (format, chunk, clear); the callback owns all mutable state, so
//! there is no shared-state locking on the audio thread and the channel
//! bound applies backpressure to the producer instead of letting the jitter
//! buffer grow without limit.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::playback::AudioSink;
use crate::synth::AudioClip;
use crate::audio::resampler::resample;
use crate::audio::util::{find_best_config, find_output_device, get_device_name};

/// Maximum queued control messages; `send` blocks the producer beyond this.
const CONTROL_CHANNEL_CAP: usize = 32;

/// Samples per chunk pushed by [`RendererSink`].
const SINK_CHUNK_SAMPLES: usize = 2400;

/// Format descriptor for the incoming raw samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub gain: f32,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self { sample_rate: 48000, channels: 1, gain: 1.0 }
    }
}

/// Control messages from the producer to the render callback.
#[derive(Debug)]
pub enum FrameMsg {
    /// Describe the samples that follow.
    Format(StreamFormat),
    /// One block of interleaved 16-bit samples, appended to the queue.
    Chunk(Vec<i16>),
    /// Drop all queued blocks and reset the read cursor.
    Clear,
}

/// The jitter buffer: queued sample blocks plus a read cursor that may span
/// blocks. Pure state, exercised directly by the render callback.
#[derive(Debug, Default)]
pub struct FrameQueue {
    blocks: VecDeque<Vec<i16>>,
    /// Read offset into the front block.
    offset: usize,
    format: StreamFormat,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self { blocks: VecDeque::new(), offset: 0, format: StreamFormat::default() }
    }

    pub fn set_format(&mut self, format: StreamFormat) {
        self.format = format;
    }

    pub fn push_block(&mut self, block: Vec<i16>) {
        if !block.is_empty() {
            self.blocks.push_back(block);
        }
    }

    /// Drop everything queued.
    ///
    /// # Returns
    /// Number of unread samples discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queued_samples();
        self.blocks.clear();
        self.offset = 0;
        dropped
    }

    /// Unread samples across all queued blocks.
    pub fn queued_samples(&self) -> usize {
        let total: usize = self.blocks.iter().map(Vec::len).sum();
        total - self.offset
    }

    /// Next source sample, advancing the cursor across block boundaries.
    fn pop_sample(&mut self) -> Option<i16> {
        loop {
            let front = self.blocks.front()?;
            if self.offset < front.len() {
                let sample = front[self.offset];
                self.offset += 1;
                return Some(sample);
            }
            self.blocks.pop_front();
            self.offset = 0;
        }
    }

    /// Render one quantum into `out` (interleaved, `out_channels` wide).
    ///
    /// Copies samples with gain applied and clamped to the valid range. An
    /// empty queue yields silence; exhausting the queue mid-quantum
    /// zero-fills the remainder. When the source carries more channels than
    /// the output, the extra channels are skipped in lock-step; when it
    /// carries fewer, the last source channel is duplicated.
    ///
    /// # Returns
    /// Number of source samples consumed.
    pub fn render_into(&mut self, out: &mut [f32], out_channels: usize) -> usize {
        let src_channels = self.format.channels.max(1) as usize;
        let gain = self.format.gain;
        let mut consumed = 0;

        for frame in out.chunks_mut(out_channels.max(1)) {
            let mut src_frame = [0.0f32; 16];
            let mut have = 0usize;
            for channel in 0..src_channels {
                let Some(sample) = self.pop_sample() else { break };
                consumed += 1;
                // Channels beyond the scratch width are still consumed in
                // lock-step so frame alignment survives; they just never map
                // to the output.
                if channel < src_frame.len() {
                    src_frame[channel] = (sample as f32 / 32768.0 * gain).clamp(-1.0, 1.0);
                    have += 1;
                }
            }

            for (channel, sample_out) in frame.iter_mut().enumerate() {
                *sample_out = if have == 0 {
                    0.0
                } else {
                    // Skip extra source channels; duplicate the last one when
                    // the output is wider.
                    src_frame[channel.min(have - 1)]
                };
            }
        }

        consumed
    }
}

/// Producer-side handle to the renderer.
#[derive(Clone)]
pub struct RendererHandle {
    tx: mpsc::Sender<FrameMsg>,
    queued: Arc<AtomicUsize>,
}

impl RendererHandle {
    /// Describe the raw frames that follow.
    pub async fn set_format(&self, format: StreamFormat) -> Result<()> {
        self.tx.send(FrameMsg::Format(format)).await.context("Renderer stopped")
    }

    /// Push raw little-endian 16-bit frames. Applies backpressure when the
    /// renderer is behind.
    pub async fn push_frames(&self, bytes: &[u8]) -> Result<()> {
        let samples: Vec<i16> =
            bytes.chunks_exact(2).map(|pair| i16::from_le_bytes([pair[0], pair[1]])).collect();
        self.push_samples(samples).await
    }

    /// Push already-decoded samples.
    pub async fn push_samples(&self, samples: Vec<i16>) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        self.queued.fetch_add(samples.len(), Ordering::SeqCst);
        self.tx.send(FrameMsg::Chunk(samples)).await.context("Renderer stopped")
    }

    /// Drop everything queued. Travels the same ordered channel as chunks,
    /// so a clear never overtakes (or is overtaken by) audio sent around it.
    pub async fn clear(&self) -> Result<()> {
        self.tx.send(FrameMsg::Clear).await.context("Renderer stopped")
    }

    /// Unread samples still queued (channel plus jitter buffer).
    pub fn queued_samples(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

/// cpal-backed real-time renderer for the low-latency transport path.
pub struct PcmRenderer {
    /// Kept alive to maintain the audio stream
    _stream: Stream,
    handle: RendererHandle,
    device_sample_rate: u32,
}

impl PcmRenderer {
    /// Open the output device and start the render callback.
    ///
    /// # Arguments
    /// * `device_name` - Optional device name substring; default device if `None`
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        let device = find_output_device(device_name)?;
        info!("Renderer output device: {}", get_device_name(&device));

        let device_sample_rate = match device.default_output_config() {
            Ok(default_config) => default_config.sample_rate(),
            Err(_) => {
                let supported = device.supported_output_configs().context("Failed to get supported output configs")?;
                find_best_config(supported, 48000)?.sample_rate()
            }
        };

        let supported = device.supported_output_configs().context("Failed to get supported output configs")?;
        let config = find_best_config(supported, device_sample_rate)?;

        let (tx, mut rx) = mpsc::channel::<FrameMsg>(CONTROL_CHANNEL_CAP);
        let queued = Arc::new(AtomicUsize::new(0));
        let queued_cb = queued.clone();

        let out_channels = config.channels() as usize;
        let stream_config: StreamConfig = config.config();

        let err_fn = |err| {
            tracing::error!("Renderer error: {}", err);
        };

        // All mutable state lives inside the callback; messages are drained
        // with try_recv, never blocking the real-time thread.
        let mut queue = FrameQueue::new();
        let stream = device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                while let Ok(msg) = rx.try_recv() {
                    match msg {
                        FrameMsg::Format(format) => queue.set_format(format),
                        FrameMsg::Chunk(block) => queue.push_block(block),
                        FrameMsg::Clear => {
                            let dropped = queue.clear();
                            queued_cb.fetch_sub(dropped, Ordering::SeqCst);
                        }
                    }
                }

                let consumed = queue.render_into(data, out_channels);
                if consumed > 0 {
                    queued_cb.fetch_sub(consumed, Ordering::SeqCst);
                }
            },
            err_fn,
            None,
        )?;

        stream.play().context("Failed to start renderer stream")?;

        info!("PCM renderer ready at {} Hz, {} channels", device_sample_rate, out_channels);

        Ok(Self { _stream: stream, handle: RendererHandle { tx, queued }, device_sample_rate })
    }

    pub fn handle(&self) -> RendererHandle {
        self.handle.clone()
    }

    pub fn sample_rate(&self) -> u32 {
        self.device_sample_rate
    }
}

/// Adapter that plays synthesized clips through the renderer, for the
/// low-latency transport variant.
pub struct RendererSink {
    handle: RendererHandle,
    /// Device rate; the render callback does not resample, so clips are
    /// converted before they are queued.
    device_sample_rate: u32,
}

impl RendererSink {
    pub fn new(handle: RendererHandle, device_sample_rate: u32) -> Self {
        Self { handle, device_sample_rate }
    }
}

#[async_trait]
impl AudioSink for RendererSink {
    async fn play(&self, clip: AudioClip) -> Result<()> {
        if clip.samples.is_empty() {
            return Ok(());
        }

        self.handle
            .set_format(StreamFormat { sample_rate: self.device_sample_rate, channels: 1, gain: 1.0 })
            .await?;

        let duration = clip.duration();
        let source = if clip.sample_rate != self.device_sample_rate {
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

        let samples: Vec<i16> = source
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();

        for chunk in samples.chunks(SINK_CHUNK_SAMPLES) {
            self.handle.push_samples(chunk.to_vec()).await?;
        }

        debug!("Queued {} renderer samples", samples.len());

        // Wait for the callback to drain the clip.
        let deadline = tokio::time::Instant::now() + duration + Duration::from_secs(1);
        while self.handle.queued_samples() > 0 {
            if tokio::time::Instant::now() > deadline {
                warn!("Renderer drain timeout exceeded");
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        Ok(())
    }

    async fn stop(&self) {
        if let Err(e) = self.handle.clear().await {
            debug!("Renderer clear after stop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono_format(gain: f32) -> StreamFormat {
        StreamFormat { sample_rate: 48000, channels: 1, gain }
    }

    #[test]
    fn test_empty_queue_renders_silence() {
        let mut queue = FrameQueue::new();
        let mut out = vec![1.0f32; 16];
        let consumed = queue.render_into(&mut out, 2);
        assert_eq!(consumed, 0);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_block_splice_without_gap() {
        let mut queue = FrameQueue::new();
        queue.set_format(mono_format(1.0));
        queue.push_block(vec![1, 2, 3, 4, 5]);
        queue.push_block(vec![6, 7, 8, 9, 10]);

        let mut out = vec![0.0f32; 8];
        assert_eq!(queue.render_into(&mut out, 1), 8);
        let got: Vec<i16> = out.iter().map(|&s| (s * 32768.0).round() as i16).collect();
        assert_eq!(got, vec![1, 2, 3, 4, 5, 6, 7, 8]);

        // Read cursor sits at offset 3 of the second block.
        let mut rest = vec![0.0f32; 4];
        assert_eq!(queue.render_into(&mut rest, 1), 2);
        let got: Vec<i16> = rest.iter().map(|&s| (s * 32768.0).round() as i16).collect();
        assert_eq!(got, vec![9, 10, 0, 0]);
    }

    #[test]
    fn test_underrun_zero_fills_remainder() {
        let mut queue = FrameQueue::new();
        queue.set_format(mono_format(1.0));
        queue.push_block(vec![16384, 16384]);

        let mut out = vec![0.5f32; 4];
        assert_eq!(queue.render_into(&mut out, 1), 2);
        assert_eq!(out, vec![0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_gain_is_applied_and_clamped() {
        let mut queue = FrameQueue::new();
        queue.set_format(mono_format(4.0));
        queue.push_block(vec![16384, -16384, 1024]);

        let mut out = vec![0.0f32; 3];
        queue.render_into(&mut out, 1);
        assert_eq!(out[0], 1.0); // 0.5 * 4 clamped
        assert_eq!(out[1], -1.0);
        assert!((out[2] - 0.125).abs() < 1e-6);
    }

    #[test]
    fn test_extra_source_channels_are_skipped() {
        let mut queue = FrameQueue::new();
        queue.set_format(StreamFormat { sample_rate: 48000, channels: 2, gain: 1.0 });
        // Stereo pairs (L, R); mono output keeps L and skips R in lock-step.
        queue.push_block(vec![100, -100, 200, -200, 300, -300]);

        let mut out = vec![0.0f32; 3];
        assert_eq!(queue.render_into(&mut out, 1), 6);
        let got: Vec<i16> = out.iter().map(|&s| (s * 32768.0).round() as i16).collect();
        assert_eq!(got, vec![100, 200, 300]);
    }

    #[test]
    fn test_mono_source_duplicated_to_stereo_output() {
        let mut queue = FrameQueue::new();
        queue.set_format(mono_format(1.0));
        queue.push_block(vec![100, 200]);

        let mut out = vec![0.0f32; 4];
        assert_eq!(queue.render_into(&mut out, 2), 2);
        let got: Vec<i16> = out.iter().map(|&s| (s * 32768.0).round() as i16).collect();
        assert_eq!(got, vec![100, 100, 200, 200]);
    }

    #[test]
    fn test_source_wider_than_scratch_keeps_frame_alignment() {
        let mut queue = FrameQueue::new();
        queue.set_format(StreamFormat { sample_rate: 48000, channels: 18, gain: 1.0 });
        // Two 18-channel frames; channel 0 carries the marker, the rest is
        // filler that must be consumed in lock-step even past the scratch
        // width.
        let mut block = Vec::new();
        for frame in 0..2i16 {
            block.push((frame + 1) * 100);
            block.extend(std::iter::repeat(7).take(17));
        }
        queue.push_block(block);

        let mut out = vec![0.0f32; 2];
        assert_eq!(queue.render_into(&mut out, 1), 36);
        let got: Vec<i16> = out.iter().map(|&s| (s * 32768.0).round() as i16).collect();
        assert_eq!(got, vec![100, 200]);
    }

    fn handle(cap: usize) -> (RendererHandle, mpsc::Receiver<FrameMsg>) {
        let (tx, rx) = mpsc::channel(cap);
        (RendererHandle { tx, queued: Arc::new(AtomicUsize::new(0)) }, rx)
    }

    #[tokio::test]
    async fn test_push_frames_decodes_little_endian() {
        let (handle, mut rx) = handle(4);
        handle.push_frames(&[0x01, 0x00, 0xFF, 0xFF, 0x00, 0x80]).await.unwrap();

        match rx.recv().await.unwrap() {
            FrameMsg::Chunk(samples) => assert_eq!(samples, vec![1, -1, -32768]),
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(handle.queued_samples(), 3);
    }

    #[tokio::test]
    async fn test_clear_is_ordered_between_chunks() {
        let (handle, mut rx) = handle(8);
        handle.push_samples(vec![1, 2]).await.unwrap();
        handle.clear().await.unwrap();
        handle.push_samples(vec![3, 4]).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), FrameMsg::Chunk(s) if s == vec![1, 2]));
        assert!(matches!(rx.recv().await.unwrap(), FrameMsg::Clear));
        // Audio pushed after the clear survives it.
        assert!(matches!(rx.recv().await.unwrap(), FrameMsg::Chunk(s) if s == vec![3, 4]));
    }

    #[test]
    fn test_clear_resets_cursor() {
        let mut queue = FrameQueue::new();
        queue.set_format(mono_format(1.0));
        queue.push_block(vec![1, 2, 3]);

        let mut out = vec![0.0f32; 2];
        queue.render_into(&mut out, 1);
        assert_eq!(queue.clear(), 1);
        assert_eq!(queue.queued_samples(), 0);

        queue.push_block(vec![7]);
        let mut out = vec![0.0f32; 1];
        queue.render_into(&mut out, 1);
        assert_eq!((out[0] * 32768.0).round() as i16, 7);
    }
}
