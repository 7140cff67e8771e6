//! Shared audio device utilities.

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, SampleFormat, SupportedStreamConfig, SupportedStreamConfigRange};
use tracing::debug;

/// Get a human-readable device name.
pub fn get_device_name(device: &Device) -> String {
    device.description().ok().map(|desc| desc.name().to_string()).unwrap_or_else(|| "Unknown".to_string())
}

/// Pick an output device by name substring, or the default device.
///
/// # Arguments
/// * `name` - Case-insensitive substring of the device name; `None` selects
///   the host default
///
/// # Errors
/// Returns an error if no device matches or no output device exists.
pub fn find_output_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    let Some(wanted) = name else {
        return host.default_output_device().context("No output device available");
    };

    let wanted_lower = wanted.to_lowercase();
    let devices = host.output_devices().context("Failed to enumerate output devices")?;
    for device in devices {
        let device_name = get_device_name(&device);
        if device_name.to_lowercase().contains(&wanted_lower) {
            debug!("Matched output device: {}", device_name);
            return Ok(device);
        }
    }

    anyhow::bail!("No output device matching \"{}\"", wanted)
}

/// Find the best matching output configuration.
///
/// Prefers mono or stereo F32 configurations, at the target sample rate when
/// supported or the closest available rate otherwise.
///
/// # Arguments
/// * `configs` - Iterator of supported stream configurations
/// * `target_sample_rate` - Desired sample rate (e.g. the device default)
///
/// # Returns
/// The best matching `SupportedStreamConfig`, or an error if no suitable config found.
pub fn find_best_config(configs: impl Iterator<Item = SupportedStreamConfigRange>, target_sample_rate: u32) -> Result<SupportedStreamConfig> {
    let mut f32_configs: Vec<SupportedStreamConfigRange> = Vec::new();

    for config in configs {
        // Only consider mono or stereo
        if config.channels() > 2 {
            continue;
        }

        // Only accept F32 format (universally supported on modern hardware)
        if config.sample_format() == SampleFormat::F32 {
            f32_configs.push(config);
        }
    }

    if f32_configs.is_empty() {
        anyhow::bail!("No F32 audio configuration found - this is unexpected on modern hardware");
    }

    // Find config that supports target sample rate, or use first available
    for config in &f32_configs {
        if target_sample_rate >= config.min_sample_rate() && target_sample_rate <= config.max_sample_rate() {
            return Ok((*config).with_sample_rate(target_sample_rate));
        }
    }

    // Use first config with closest sample rate
    let config = &f32_configs[0];
    let rate = if target_sample_rate < config.min_sample_rate() {
        config.min_sample_rate()
    } else {
        config.max_sample_rate()
    };
    Ok((*config).with_sample_rate(rate))
}
