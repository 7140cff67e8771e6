//! FFT-based audio resampling via rubato.
//!
//! Synthesized clips arrive at the voice service's rate; the output device
//! usually runs at another. Whole clips are resampled in one pass before
//! they are queued for playback.

use anyhow::{Context, Result};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{Fft, FixedSync, Resampler};

/// Chunk size for FFT-based resampling (good quality/performance balance).
const CHUNK_SIZE: usize = 1024;

/// Number of sub-chunks for FFT processing.
const SUB_CHUNKS: usize = 2;

/// Resample a mono clip from one sample rate to another.
///
/// # Arguments
/// * `samples` - Input audio samples
/// * `from_rate` - Input sample rate (e.g. 24000 from the voice service)
/// * `to_rate` - Output sample rate (the audio device rate)
///
/// # Returns
/// Resampled audio samples at the target rate.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }

    let mut resampler = Fft::<f32>::new(
        from_rate as usize,
        to_rate as usize,
        CHUNK_SIZE,
        SUB_CHUNKS,
        1, // mono
        FixedSync::Input,
    )
    .context("Failed to create resampler")?;

    let output_frames_max = resampler.output_frames_max();
    let mut output_buffer = vec![0.0f32; output_frames_max];

    let expected_len = (samples.len() as f64 * to_rate as f64 / from_rate as f64) as usize;
    let mut output = Vec::with_capacity(expected_len + CHUNK_SIZE);

    // The resampler consumes fixed-size input chunks; the tail is zero-padded.
    for chunk in samples.chunks(CHUNK_SIZE) {
        let padded;
        let input_chunk = if chunk.len() < CHUNK_SIZE {
            padded = {
                let mut p = chunk.to_vec();
                p.resize(CHUNK_SIZE, 0.0);
                p
            };
            &padded[..]
        } else {
            chunk
        };

        let input_adapter = InterleavedSlice::new(input_chunk, 1, CHUNK_SIZE).context("Failed to create input adapter")?;
        let mut output_adapter = InterleavedSlice::new_mut(&mut output_buffer, 1, output_frames_max).context("Failed to create output adapter")?;

        let (_, frames_written) = resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, None)
            .map_err(|e| anyhow::anyhow!("Resampling error: {}", e))?;

        output.extend_from_slice(&output_buffer[..frames_written]);
    }

    // Trim the padding-induced excess, keeping a small safety margin.
    output.truncate(expected_len + 100);

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_when_rates_match() {
        let samples = vec![0.25f32; 1000];
        let result = resample(&samples, 24000, 24000).unwrap();
        assert_eq!(result, samples);
    }

    #[test]
    fn test_resample_upsampling() {
        // Upsample 24kHz TTS output to a 48kHz device (2x)
        let samples = vec![0.0; 24000]; // 1 second
        let result = resample(&samples, 24000, 48000).unwrap();
        assert!(result.len() >= 48000 && result.len() <= 48100);
    }

    #[test]
    fn test_resample_downsampling() {
        let samples = vec![0.0; 48000]; // 1 second at 48kHz
        let result = resample(&samples, 48000, 16000).unwrap();
        assert!((15900..=16100).contains(&result.len()), "Expected length 15900-16100, got {}", result.len());
    }
}
