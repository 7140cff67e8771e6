//! Audio output plumbing.
//!
//! Cross-platform device access via cpal, high-quality resampling via
//! rubato, and the low-latency PCM renderer for the raw-frame transport.

pub mod renderer;
pub mod resampler;
pub mod util;

pub use renderer::{FrameMsg, FrameQueue, PcmRenderer, RendererHandle, RendererSink, StreamFormat};
