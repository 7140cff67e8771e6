//! Companion Voice - a streaming sentence-to-speech narrator.
//!
//! Streams a chat model's reply, segments it into sentences as they
//! complete, synthesizes each sentence concurrently through an external
//! voice service, and plays the results back strictly in order while the
//! text is revealed in sync with the audio.

mod audio;
mod config;
mod llm;
mod pipeline;
mod playback;
mod segment;
mod stream;
mod synth;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::LocalTime;

use audio::{PcmRenderer, RendererSink};
use config::AppConfig;
use llm::ChatClient;
use pipeline::SpeechPipeline;
use playback::{AudioSink, CpalSink, PipelineEvent};
use stream::{StreamDemux, StreamEvent};
use synth::HttpSpeechService;

/// Spawn the task that surfaces pipeline events to the console.
fn spawn_event_task(mut events: mpsc::UnboundedReceiver<PipelineEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PipelineEvent::SentenceStarted { sequence, reveal, .. } => {
                    debug!("Sentence #{} playing (reveal {:?})", sequence, reveal);
                }
                PipelineEvent::RevealAdjusted { sequence, reveal } => {
                    debug!("Sentence #{} reveal adjusted to {:?}", sequence, reveal);
                }
                PipelineEvent::RevealFinished { sequence } => {
                    debug!("Sentence #{} fully revealed", sequence);
                }
                PipelineEvent::SentenceDisplayed { text, with_audio, .. } => {
                    if with_audio {
                        info!("🗣️  {}", text);
                    } else {
                        info!("💬 {} (no audio)", text);
                    }
                }
                PipelineEvent::SessionDone => {
                    info!("✅ Response complete");
                }
            }
        }
    })
}

/// Stream one model reply through the pipeline.
///
/// Reads the line-framed event stream, feeds deltas into segmentation and
/// synthesis as they arrive, and flushes the session at end-of-stream.
///
/// # Returns
/// The assembled reply text, for conversation history.
async fn narrate_reply(response: reqwest::Response, pipeline: &mut SpeechPipeline) -> String {
    let mut demux = StreamDemux::new();
    let mut reply = String::new();
    let mut body = response.bytes_stream();

    'stream: while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Chat stream error: {}", e);
                break;
            }
        };

        for event in demux.push(&chunk) {
            match event {
                StreamEvent::Delta(delta) => {
                    reply.push_str(&delta);
                    pipeline.submit_text(&delta);
                }
                StreamEvent::Done => break 'stream,
            }
        }
    }

    pipeline.flush_session();
    reply
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("🛑 Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                if let Ok(mut sigterm) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    sigterm.recv().await;
                } else {
                    std::future::pending::<()>().await;
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("🛑 Received SIGTERM, shutting down...");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let config = AppConfig::from_args();

    // Initialize logging with time-only format.
    // Respect RUST_LOG env var, fallback to verbose flag, default to info
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if config.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(LocalTime::new(time::macros::format_description!(
            "[hour]:[minute]:[second]"
        )))
        .init();

    info!("🎙️  Companion Voice v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("❌ Configuration error: {}", e);
        std::process::exit(1);
    }

    config.log_config();

    // One HTTP client for both endpoints. The synthesis deadline is enforced
    // per call by the scheduler; the chat stream stays open as long as the
    // model keeps talking.
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;

    let service = Arc::new(HttpSpeechService::new(
        http.clone(),
        config.voice_url.clone(),
        config.voice.clone(),
        config.voice_speed,
        config.voice_sample_rate,
    ));

    // Pick the output transport: whole-clip playback, or the low-latency PCM
    // renderer fed over its bounded frame channel. The renderer owns the cpal
    // stream and must outlive the pipeline.
    let mut _renderer = None;
    let sink: Arc<dyn AudioSink> = if config.low_latency {
        let renderer = PcmRenderer::new(config.output_device.as_deref())?;
        let sink = Arc::new(RendererSink::new(renderer.handle(), renderer.sample_rate()));
        _renderer = Some(renderer);
        sink
    } else {
        Arc::new(CpalSink::new(config.output_device.as_deref())?)
    };

    let mut pipeline = SpeechPipeline::new(service, sink, config.pipeline_config());
    let events = pipeline.events().context("Event stream already taken")?;
    let event_task = spawn_event_task(events);

    let mut chat = ChatClient::new(
        http,
        config.chat_url.clone(),
        config.chat_model.clone(),
        config.system_prompt.clone(),
        config.max_history,
    );

    info!("Type a message and press Enter (Ctrl+C to quit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = wait_for_shutdown() => break,
            line = lines.next_line() => line.context("Failed to read input")?,
        };

        let Some(line) = line else {
            break; // stdin closed
        };
        let message = line.trim();
        if message.is_empty() {
            continue;
        }

        // A new user turn starts a new response session; anything still
        // narrating from the previous reply is discarded.
        pipeline.reset_session();

        match chat.begin_stream(message).await {
            Ok(response) => {
                let reply = narrate_reply(response, &mut pipeline).await;
                chat.record_reply(&reply);
            }
            Err(e) => {
                error!("❌ Chat error: {}", e);
            }
        }
    }

    pipeline.shutdown().await;
    event_task.abort();

    info!("✅ Companion voice stopped");
    Ok(())
}
